//! API-facing request/response models.

use serde::{Deserialize, Serialize};

use crate::core::{DeviceRecord, NewTask, SamplePositionRecord, TaskStatus};
use crate::runtime::Lab;
use crate::util::serde::{Priority, TaskId};

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Task type tag.
    pub task_type: String,
    /// Opaque parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Tasks this one waits on.
    #[serde(default)]
    pub prev_tasks: Vec<TaskId>,
    /// Tasks that must wait on this one.
    #[serde(default)]
    pub next_tasks: Vec<TaskId>,
}

impl From<TaskSubmission> for NewTask {
    fn from(req: TaskSubmission) -> Self {
        Self::new(req.task_type)
            .with_parameters(req.parameters)
            .with_priority(req.priority)
            .after(req.prev_tasks)
            .before(req.next_tasks)
    }
}

/// Task status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Task identifier.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Result of a completed task.
    pub result: Option<serde_json::Value>,
    /// Reason for failure or cancellation.
    pub reason: Option<String>,
}

/// Ledger snapshot for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Every device row.
    pub devices: Vec<DeviceRecord>,
    /// Every sample position row.
    pub sample_positions: Vec<SamplePositionRecord>,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag: the store is readable and no orphan awaits an operator.
    pub ok: bool,
    /// Live task workers.
    pub running_workers: usize,
    /// Orphans waiting for acknowledgment.
    pub pending_acknowledgments: usize,
}

/// Submit a task.
pub fn submit_task(lab: &Lab, req: TaskSubmission) -> Result<TaskId, String> {
    lab.submit_task(req.into()).map_err(|e| e.to_string())
}

/// Look up a task's status.
pub fn task_status(lab: &Lab, id: TaskId) -> Result<TaskStatusResponse, String> {
    let task = lab.task(id).map_err(|e| e.to_string())?;
    Ok(TaskStatusResponse {
        task_id: task.id,
        status: task.status,
        result: task.result,
        reason: task.error,
    })
}

/// Snapshot the Ledger.
pub fn ledger_snapshot(lab: &Lab) -> Result<LedgerSnapshot, String> {
    Ok(LedgerSnapshot {
        devices: lab.ledger().devices().map_err(|e| e.to_string())?,
        sample_positions: lab.ledger().sample_positions().map_err(|e| e.to_string())?,
    })
}

/// Return a health payload.
pub fn health(lab: &Lab) -> Health {
    let pending = lab.pending_acknowledgments().map(|p| p.len());
    Health {
        ok: matches!(pending, Ok(0)),
        running_workers: lab.scheduler().executor().running(),
        pending_acknowledgments: pending.unwrap_or(0),
    }
}
