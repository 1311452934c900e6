//! Runtime adapters (thread and tokio runners), the `Lab` facade, and API surface.

pub mod api;
pub mod lab;
pub mod runner;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_runner;

pub use api::{health, ledger_snapshot, submit_task, task_status, Health, LedgerSnapshot, TaskStatusResponse, TaskSubmission};
pub use lab::Lab;
pub use runner::SchedulerRunner;
#[cfg(feature = "tokio-runtime")]
pub use tokio_runner::TokioSchedulerRunner;
