//! Tokio-driven scheduler runner.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::Scheduler;

/// Drives [`Scheduler::tick`] from a tokio task.
///
/// Ticks run on the blocking pool since they touch the store synchronously.
pub struct TokioSchedulerRunner {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TokioSchedulerRunner {
    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let scheduler = Arc::clone(&scheduler);
                        match tokio::task::spawn_blocking(move || scheduler.tick()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!("scheduler tick failed: {}", e),
                            Err(e) => tracing::error!("scheduler tick panicked: {}", e),
                        }
                    }
                }
            }
            tracing::info!("tokio scheduler loop stopped");
        });
        Self { shutdown, handle }
    }

    /// Stop the loop and wait for the current tick to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("tokio scheduler loop ended abnormally: {}", e);
        }
    }
}
