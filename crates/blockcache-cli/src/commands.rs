//! Subcommand implementations.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use blockcache_common::config::BlockCacheConfig;
use blockcache_core::{BlockCache, LocalDirStore};
use rand::Rng;
use tracing::info;

fn open_cache(root: &Path, config: BlockCacheConfig) -> Result<BlockCache> {
    let store = Arc::new(LocalDirStore::new(root)?);
    info!(root = %root.display(), "serving local directory");
    Ok(BlockCache::new(config, store)?)
}

/// Copies `length` bytes of `path` starting at `offset` to stdout.
pub fn cat(
    root: &Path,
    config: BlockCacheConfig,
    path: &str,
    offset: u64,
    length: Option<u64>,
    chunk: usize,
) -> Result<()> {
    if chunk == 0 {
        bail!("chunk size must be positive");
    }
    let cache = open_cache(root, config)?;
    let handle = cache.open(path)?;
    let end = match length {
        Some(length) => offset.saturating_add(length),
        None => handle.file().size(),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; chunk];
    let mut pos = offset;
    while pos < end {
        let want = (end - pos).min(chunk as u64) as usize;
        let outcome = cache.read(&handle, pos, &mut buf[..want])?;
        out.write_all(&buf[..outcome.bytes_read])?;
        pos += outcome.bytes_read as u64;
        if outcome.eof || outcome.bytes_read == 0 {
            break;
        }
    }
    out.flush()?;

    cache.close(handle);
    cache.shutdown();
    Ok(())
}

/// Reads `path` `passes` times and prints throughput and cache counters.
pub fn bench(
    root: &Path,
    config: BlockCacheConfig,
    path: &str,
    passes: u32,
    chunk: usize,
    random: bool,
) -> Result<()> {
    if chunk == 0 {
        bail!("chunk size must be positive");
    }
    let cache = open_cache(root, config)?;
    let handle = cache.open(path)?;
    let size = handle.file().size();
    let mut buf = vec![0u8; chunk];
    let mut rng = rand::thread_rng();

    let start = Instant::now();
    let mut total = 0u64;
    for pass in 0..passes {
        let pass_start = Instant::now();
        let mut read = 0u64;
        let mut pos = 0u64;
        while read < size {
            let offset = if random {
                rng.gen_range(0..size)
            } else {
                pos
            };
            let outcome = cache.read(&handle, offset, &mut buf)?;
            if outcome.bytes_read == 0 {
                break;
            }
            read += outcome.bytes_read as u64;
            pos += outcome.bytes_read as u64;
        }
        total += read;
        info!(pass, bytes = read, elapsed_ms = pass_start.elapsed().as_millis() as u64, "pass done");
    }
    let elapsed = start.elapsed();

    let mib = total as f64 / (1024.0 * 1024.0);
    println!(
        "{path}: {mib:.1} MiB in {:.3}s ({:.1} MiB/s)",
        elapsed.as_secs_f64(),
        mib / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    cache.close(handle);
    cache.shutdown();
    println!("{}", cache.stats());
    Ok(())
}

/// Prints the effective configuration.
pub fn print_config(config: &BlockCacheConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    println!(
        "# {} buffers of {} bytes, {} workers, queue {}",
        config.buffer_count(),
        config.block_size(),
        config.parallelism,
        config.queue_capacity()
    );
    Ok(())
}
