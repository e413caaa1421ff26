//! Background TTL sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::manager::ContextCacheManager;

/// Handle on a running sweeper. Dropping it does not stop the task; call
/// [`shutdown`](SweeperHandle::shutdown).
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the current round to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Run `evict_expired` every `interval` until shut down.
pub fn spawn_ttl_sweeper(cache: Arc<ContextCacheManager>, interval: Duration) -> SweeperHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval_secs = interval.as_secs_f64(), "TTL sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.evict_expired().await;
                    debug!(removed, "TTL sweep");
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        info!("TTL sweeper stopped");
    });
    SweeperHandle { stop, task }
}
