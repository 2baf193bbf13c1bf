//! Block cache configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BLOCK_SIZE_MB, DEFAULT_MEM_SIZE_MB, DEFAULT_MEM_TIMEOUT_SECS,
    DEFAULT_MONITOR_INTERVAL_MS, DEFAULT_PREFETCH_BLOCKS, DEFAULT_WORKERS, MIB,
    QUEUE_SLOTS_PER_WORKER,
};
use crate::error::{CacheError, CacheResult};

/// Configuration for the block cache.
///
/// Sizes are expressed in MiB in configuration files. The `*-bytes` keys
/// override them with exact byte counts, which is what the builder methods
/// set.
///
/// # Example
///
/// ```rust
/// use blockcache_common::config::BlockCacheConfig;
///
/// let config = BlockCacheConfig::from_toml_str(
///     "block-size-mb = 8\nmem-size-mb = 64\nprefetch = 4\nparallelism = 16\n",
/// )
/// .unwrap();
/// assert_eq!(config.block_size(), 8 * 1024 * 1024);
/// assert_eq!(config.buffer_count(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockCacheConfig {
    /// Block size in MiB.
    #[serde(default = "default_block_size_mb")]
    pub block_size_mb: u64,

    /// Exact block size in bytes, overriding `block_size_mb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size_bytes: Option<u64>,

    /// Memory budget for cached blocks in MiB.
    #[serde(default = "default_mem_size_mb")]
    pub mem_size_mb: u64,

    /// Exact memory budget in bytes, overriding `mem_size_mb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_size_bytes: Option<u64>,

    /// Number of blocks to prefetch ahead of sequential reads. 0 disables read-ahead.
    #[serde(default = "default_prefetch")]
    pub prefetch: u32,

    /// Master switch for read-ahead.
    #[serde(default = "default_true")]
    pub read_ahead: bool,

    /// Number of transfer workers.
    #[serde(default = "default_workers")]
    pub parallelism: u32,

    /// Bounded task queue length. 0 selects two slots per worker.
    #[serde(default)]
    pub queue_depth: usize,

    /// Seconds an unreferenced buffer may stay idle before the monitor
    /// reclaims it. 0 disables the monitor.
    #[serde(default = "default_mem_timeout")]
    pub mem_timeout_sec: u64,

    /// Tick of the idle eviction monitor in milliseconds.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
}

fn default_block_size_mb() -> u64 {
    DEFAULT_BLOCK_SIZE_MB
}

fn default_mem_size_mb() -> u64 {
    DEFAULT_MEM_SIZE_MB
}

fn default_prefetch() -> u32 {
    DEFAULT_PREFETCH_BLOCKS
}

fn default_true() -> bool {
    true
}

fn default_workers() -> u32 {
    DEFAULT_WORKERS
}

fn default_mem_timeout() -> u64 {
    DEFAULT_MEM_TIMEOUT_SECS
}

fn default_monitor_interval() -> u64 {
    DEFAULT_MONITOR_INTERVAL_MS
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size_mb: default_block_size_mb(),
            block_size_bytes: None,
            mem_size_mb: default_mem_size_mb(),
            mem_size_bytes: None,
            prefetch: default_prefetch(),
            read_ahead: true,
            parallelism: default_workers(),
            queue_depth: 0,
            mem_timeout_sec: default_mem_timeout(),
            monitor_interval_ms: default_monitor_interval(),
        }
    }
}

impl BlockCacheConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a small configuration for tests: 64 KiB blocks, 16 buffers,
    /// 4 workers, and no idle monitor.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::default()
            .with_block_size(64 * 1024)
            .with_memory_budget(16 * 64 * 1024)
            .with_workers(4)
            .with_mem_timeout(0)
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> CacheResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Sets the exact block size in bytes.
    #[must_use]
    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size_bytes = Some(bytes);
        self
    }

    /// Sets the exact memory budget in bytes.
    #[must_use]
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.mem_size_bytes = Some(bytes);
        self
    }

    /// Sets the number of transfer workers.
    #[must_use]
    pub fn with_workers(mut self, workers: u32) -> Self {
        self.parallelism = workers;
        self
    }

    /// Sets the read-ahead depth in blocks.
    #[must_use]
    pub fn with_prefetch(mut self, blocks: u32) -> Self {
        self.prefetch = blocks;
        self
    }

    /// Enables or disables read-ahead.
    #[must_use]
    pub fn with_read_ahead(mut self, enabled: bool) -> Self {
        self.read_ahead = enabled;
        self
    }

    /// Sets the idle timeout of the eviction monitor in seconds.
    #[must_use]
    pub fn with_mem_timeout(mut self, secs: u64) -> Self {
        self.mem_timeout_sec = secs;
        self
    }

    /// Sets the tick of the eviction monitor.
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size_bytes
            .unwrap_or_else(|| self.block_size_mb.saturating_mul(MIB))
    }

    /// Returns the memory budget in bytes.
    pub fn memory_budget(&self) -> u64 {
        self.mem_size_bytes
            .unwrap_or_else(|| self.mem_size_mb.saturating_mul(MIB))
    }

    /// Returns the number of buffer descriptors the budget pays for.
    pub fn buffer_count(&self) -> usize {
        match self.block_size() {
            0 => 0,
            block_size => usize::try_from(self.memory_budget() / block_size).unwrap_or(usize::MAX),
        }
    }

    /// Returns the bounded task queue length.
    pub fn queue_capacity(&self) -> usize {
        if self.queue_depth > 0 {
            self.queue_depth
        } else {
            (self.parallelism as usize).max(1) * QUEUE_SLOTS_PER_WORKER
        }
    }

    /// Returns true if sequential reads should trigger prefetching.
    pub fn read_ahead_enabled(&self) -> bool {
        self.read_ahead && self.prefetch > 0
    }

    /// Returns the idle timeout, or `None` if the monitor is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.mem_timeout_sec > 0).then(|| Duration::from_secs(self.mem_timeout_sec))
    }

    /// Returns the monitor tick.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CacheResult<()> {
        if self.block_size() == 0 {
            return Err(CacheError::config("block size must be > 0"));
        }
        if usize::try_from(self.block_size()).is_err() {
            return Err(CacheError::config("block size does not fit in memory"));
        }
        if self.memory_budget() < self.block_size() {
            return Err(CacheError::config(format!(
                "memory budget {} is smaller than one block of {} bytes",
                self.memory_budget(),
                self.block_size()
            )));
        }
        if self.parallelism == 0 {
            return Err(CacheError::config("parallelism must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BlockCacheConfig::default();
        assert_eq!(config.block_size(), 16 * MIB);
        assert_eq!(config.memory_budget(), 4192 * MIB);
        assert_eq!(config.buffer_count(), 262);
        assert_eq!(config.queue_capacity(), 256);
        assert!(config.read_ahead_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_buffer_count_from_budget() {
        let config = BlockCacheConfig::default()
            .with_block_size(MIB)
            .with_memory_budget(5 * MIB);
        assert_eq!(config.buffer_count(), 5);
    }

    #[test]
    fn test_builder() {
        let config = BlockCacheConfig::new()
            .with_workers(8)
            .with_prefetch(0)
            .with_mem_timeout(0)
            .with_monitor_interval(Duration::from_millis(250));

        assert_eq!(config.parallelism, 8);
        assert_eq!(config.queue_capacity(), 16);
        assert!(!config.read_ahead_enabled());
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.monitor_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_read_ahead_switch() {
        let config = BlockCacheConfig::default().with_read_ahead(false);
        assert!(!config.read_ahead_enabled());
    }

    #[test]
    fn test_validation() {
        assert!(BlockCacheConfig::default().with_block_size(0).validate().is_err());
        assert!(BlockCacheConfig::default().with_workers(0).validate().is_err());

        let config = BlockCacheConfig::default()
            .with_block_size(MIB)
            .with_memory_budget(MIB - 1);
        assert!(matches!(config.validate(), Err(CacheError::Config { .. })));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = BlockCacheConfig::from_toml_str("prefetch = 2\nread-ahead = false\n").unwrap();
        assert_eq!(config.prefetch, 2);
        assert!(!config.read_ahead);
        assert_eq!(config.block_size_mb, DEFAULT_BLOCK_SIZE_MB);
    }

    #[test]
    fn test_parse_byte_overrides() {
        let config =
            BlockCacheConfig::from_toml_str("block-size-bytes = 4096\nmem-size-bytes = 40960\n")
                .unwrap();
        assert_eq!(config.block_size(), 4096);
        assert_eq!(config.buffer_count(), 10);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(BlockCacheConfig::from_toml_str("parallelism = 0\n").is_err());
        assert!(matches!(
            BlockCacheConfig::from_toml_str("prefetch = \"many\"\n"),
            Err(CacheError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let config = BlockCacheConfig::for_testing();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = BlockCacheConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
