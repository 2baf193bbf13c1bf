//! Idle buffer eviction.
//!
//! A scheduled task that periodically drops unreferenced, clean descriptors
//! nobody pinned for longer than the idle timeout. It runs on its own thread
//! and stops when the owning cache shuts down.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use blockcache_common::error::CacheResult;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::buffer::BufferTableManager;

struct MonitorSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread evicting idle buffers.
pub struct IdleMonitor {
    signal: Arc<MonitorSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleMonitor {
    /// Starts the monitor over `table`.
    pub fn start(
        table: Weak<BufferTableManager>,
        timeout: Duration,
        interval: Duration,
    ) -> CacheResult<Self> {
        let signal = Arc::new(MonitorSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("blockcache-monitor".to_string())
            .spawn(move || run(&thread_signal, &table, timeout, interval))?;

        info!(?timeout, ?interval, "idle monitor started");
        Ok(Self {
            signal,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stops the monitor and waits for its thread.
    pub fn stop(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("idle monitor panicked");
            }
            info!("idle monitor stopped");
        }
    }

    /// Returns true while the monitor thread runs.
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    signal: &MonitorSignal,
    table: &Weak<BufferTableManager>,
    timeout: Duration,
    interval: Duration,
) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                return;
            }
        }

        let Some(table) = table.upgrade() else {
            return;
        };
        let evicted = table.evict_idle(timeout);
        if evicted > 0 {
            debug!(evicted, "evicted idle buffers");
        }
    }
}
