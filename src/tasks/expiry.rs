use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::isolation::ManagerFactory;

/// Background task that periodically expires idle isolated managers
pub struct ExpirySweepTask {
    factory: Weak<ManagerFactory>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ExpirySweepTask {
    pub fn new(
        factory: Weak<ManagerFactory>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            factory,
            interval,
            shutdown,
        }
    }

    /// Run until a shutdown signal arrives or the factory is dropped
    pub async fn run(mut self) {
        let mut sweep_timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        sweep_timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Expiry sweep task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Expiry sweep task received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    let Some(factory) = self.factory.upgrade() else {
                        tracing::debug!("Manager factory dropped, stopping expiry sweep");
                        break;
                    };
                    Self::sweep(&factory).await;
                }
            }
        }

        tracing::info!("Expiry sweep task stopped");
    }

    async fn sweep(factory: &ManagerFactory) {
        let start = Instant::now();
        let removed = factory.cleanup_expired_managers().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            removed = removed,
            elapsed_ms = elapsed_ms,
            "Expiry sweep completed"
        );
    }
}
