//! Periodic garbage collection of expired entries

use crate::cache::clock::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Something the collector can sweep
pub trait Sweep: Send + Sync {
    /// Remove everything expired as of `now`; returns the number removed
    fn sweep(&self, now: Instant) -> usize;
}

/// Cancellable background task calling [`Sweep::sweep`] on an interval
///
/// `start` and `stop` are idempotent.
pub struct GarbageCollector {
    target: Arc<dyn Sweep>,
    clock: Arc<dyn Clock>,
    running: Mutex<Option<RunningTask>>,
}

struct RunningTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl GarbageCollector {
    /// Create a stopped collector for `target`
    pub fn new(target: Arc<dyn Sweep>, clock: Arc<dyn Clock>) -> Self {
        Self {
            target,
            clock,
            running: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop; a no-op if it is already running
    ///
    /// The first sweep happens one `interval` after the call. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, interval: Duration) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!("Garbage collector already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let target = Arc::clone(&self.target);
        let clock = Arc::clone(&self.clock);

        info!("Starting cache garbage collector (interval: {:?})", interval);

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = target.sweep(clock.now());
                        if removed > 0 {
                            debug!("Garbage collector removed {} expired entries", removed);
                        }
                    }
                }
            }

            debug!("Garbage collector stopped");
        });

        *running = Some(RunningTask { shutdown, handle });
    }

    /// Cancel the sweep loop; a no-op if it is not running
    pub fn stop(&self) {
        if let Some(task) = self.running.lock().take() {
            info!("Stopping cache garbage collector");
            // The loop may already have exited; a closed channel is fine.
            let _ = task.shutdown.send(());
            task.handle.abort();
        }
    }

    /// Whether the sweep loop is currently scheduled
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
