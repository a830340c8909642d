//! Background task driving periodic sync passes

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Syncer;
use crate::transport::Transport;

/// Interval between sync passes unless configured otherwise
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

struct Running {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs [`Syncer::sync_pass`] on start and then on every tick
///
/// `stop()` lets the peer fetch in flight finish and prevents any further
/// peer or tick. Cancelling the shutdown token given to `start()` aborts the
/// pass in flight immediately.
pub struct SyncScheduler<T: Transport> {
    syncer: Syncer<T>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl<T: Transport> std::fmt::Debug for SyncScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<T: Transport> SyncScheduler<T> {
    pub fn new(syncer: Syncer<T>, interval: Duration) -> Self {
        Self {
            syncer,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a scheduler task is alive
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Spawn the scheduler task; returns false if it is already running
    pub fn start(&self, shutdown: CancellationToken) -> bool {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            debug!("Sync scheduler already running");
            return false;
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.syncer.clone(),
            self.interval,
            stop.clone(),
            shutdown,
        ));
        *running = Some(Running { stop, handle });

        info!(interval = ?self.interval, "Sync scheduler started");
        true
    }

    /// Stop after the fetch in flight and wait for the task to exit
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { stop, handle }) = running else {
            return;
        };

        stop.cancel();
        if let Err(e) = handle.await {
            warn!(error = ?e, "Sync scheduler task ended abnormally");
        }
        info!("Sync scheduler stopped");
    }
}

async fn run<T: Transport>(
    syncer: Syncer<T>,
    interval: Duration,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The first tick completes immediately
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Sync scheduler received shutdown");
                return;
            }
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Sync pass abandoned on shutdown");
                return;
            }
            result = syncer.sync_pass(&stop) => {
                if let Err(e) = result {
                    warn!(error = ?e, "Sync pass failed");
                }
            }
        }
    }
}
