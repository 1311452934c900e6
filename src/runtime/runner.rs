//! Thread-based scheduler runner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

use crate::core::{Scheduler, SchedulerError};

/// Drives [`Scheduler::tick`] on a dedicated thread at a fixed interval.
///
/// The first tick runs immediately. A failed tick is logged and the loop
/// carries on; the next tick starts from persisted state.
pub struct SchedulerRunner {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl SchedulerRunner {
    /// Spawn the loop.
    pub fn start(scheduler: Arc<Scheduler>, interval: Duration) -> Result<Self, SchedulerError> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        let handle = thread::Builder::new()
            .name("lab-scheduler".into())
            .spawn(move || {
                let ticker = tick(interval);
                run_tick(&scheduler, &counter);
                loop {
                    select! {
                        recv(ticker) -> _ => run_tick(&scheduler, &counter),
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::info!("scheduler loop stopped");
            })
            .map_err(|e| SchedulerError::Dispatch(format!("spawning scheduler thread: {e}")))?;

        tracing::info!("scheduler loop started, interval {:?}", interval);
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            ticks,
        })
    }

    /// Ticks completed so far, failed ones included.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Stop the loop and wait for the current tick to finish.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // dropping the sender disconnects the shutdown channel
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerRunner {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_tick(scheduler: &Scheduler, counter: &AtomicU64) {
    match scheduler.tick() {
        Ok(report) => {
            if !report.dispatched.is_empty() || !report.admission.fulfilled.is_empty() {
                tracing::debug!(
                    "tick: {} dispatched, {} granted, {} released",
                    report.dispatched.len(),
                    report.admission.fulfilled.len(),
                    report.released.len()
                );
            }
        }
        Err(e) => tracing::error!("scheduler tick failed: {}", e),
    }
    counter.fetch_add(1, Ordering::Release);
}
