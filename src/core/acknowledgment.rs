//! Operator acknowledgments for tasks orphaned by a crash.
//!
//! A task found RUNNING or REQUESTING_RESOURCES at startup may have left
//! hardware mid-action. Recovery raises one acknowledgment per orphan; nothing
//! is cancelled or released until an operator acknowledges it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::task::TaskStatus;
use crate::core::SchedulerError;
use crate::infra::store::{Collection, Conditional};
use crate::util::clock::now_ms;
use crate::util::serde::{AcknowledgmentId, TaskId};

/// Acknowledgment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcknowledgmentStatus {
    /// Waiting for an operator.
    Pending,
    /// Acknowledged; the scheduler resolves the orphan next tick.
    Acknowledged,
    /// The orphan has been cancelled and its resources released.
    Applied,
}

/// A persisted acknowledgment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgmentRecord {
    /// Unique identifier.
    pub id: AcknowledgmentId,
    /// Orphaned task.
    pub task_id: TaskId,
    /// Status the task was found in at recovery.
    pub found_status: TaskStatus,
    /// Message shown to the operator.
    pub prompt: String,
    /// Current status.
    pub status: AcknowledgmentStatus,
    /// Operator note.
    pub note: Option<String>,
    /// Creation time, ms since epoch.
    pub created_at_ms: u128,
    /// Last modification time, ms since epoch.
    pub updated_at_ms: u128,
}

/// Store of acknowledgment records.
#[derive(Clone)]
pub struct AcknowledgmentStore {
    records: Arc<dyn Collection<AcknowledgmentId, AcknowledgmentRecord>>,
}

impl AcknowledgmentStore {
    /// Wrap a collection.
    pub fn new(records: Arc<dyn Collection<AcknowledgmentId, AcknowledgmentRecord>>) -> Self {
        Self { records }
    }

    /// Raise an acknowledgment for `task`, or return the one already open.
    pub fn raise(
        &self,
        task_id: TaskId,
        found_status: TaskStatus,
    ) -> Result<AcknowledgmentId, SchedulerError> {
        if let Some(open) = self
            .records
            .find(&|r| r.task_id == task_id && r.status != AcknowledgmentStatus::Applied)?
            .into_iter()
            .next()
        {
            return Ok(open.id);
        }
        let id = AcknowledgmentId::new();
        let now = now_ms();
        self.records.insert(
            id,
            AcknowledgmentRecord {
                id,
                task_id,
                found_status,
                prompt: format!(
                    "task {task_id} was {found_status:?} when the scheduler stopped; \
                     check its devices, then acknowledge to cancel it and free its resources"
                ),
                status: AcknowledgmentStatus::Pending,
                note: None,
                created_at_ms: now,
                updated_at_ms: now,
            },
        )?;
        tracing::warn!("task {} orphaned in {:?}; acknowledgment {} raised", task_id, found_status, id);
        Ok(id)
    }

    /// Read one record.
    pub fn get(&self, id: AcknowledgmentId) -> Result<AcknowledgmentRecord, SchedulerError> {
        self.records
            .get(&id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("acknowledgment {id}")))
    }

    /// Records in `status`, oldest first.
    pub fn with_status(
        &self,
        status: AcknowledgmentStatus,
    ) -> Result<Vec<AcknowledgmentRecord>, SchedulerError> {
        let mut found = self.records.find(&|r| r.status == status)?;
        found.sort_by_key(|r| r.created_at_ms);
        Ok(found)
    }

    /// Records still waiting for an operator.
    pub fn pending(&self) -> Result<Vec<AcknowledgmentRecord>, SchedulerError> {
        self.with_status(AcknowledgmentStatus::Pending)
    }

    /// Records acknowledged but not yet applied.
    pub fn acknowledged(&self) -> Result<Vec<AcknowledgmentRecord>, SchedulerError> {
        self.with_status(AcknowledgmentStatus::Acknowledged)
    }

    /// Operator acknowledgment: PENDING -> ACKNOWLEDGED.
    pub fn acknowledge(
        &self,
        id: AcknowledgmentId,
        note: Option<String>,
    ) -> Result<(), SchedulerError> {
        match self.records.update_if(
            &id,
            &|r| r.status == AcknowledgmentStatus::Pending,
            &mut |r| {
                r.status = AcknowledgmentStatus::Acknowledged;
                r.note.clone_from(&note);
                r.updated_at_ms = now_ms();
            },
        )? {
            Conditional::Applied(r) => {
                tracing::info!("acknowledgment {} for task {} accepted", id, r.task_id);
                Ok(())
            }
            Conditional::Rejected(r) => Err(SchedulerError::InvalidTransition(format!(
                "acknowledgment {id} is already {:?}",
                r.status
            ))),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("acknowledgment {id}"))),
        }
    }

    /// ACKNOWLEDGED -> APPLIED. Returns whether this call moved it.
    pub fn mark_applied(&self, id: AcknowledgmentId) -> Result<bool, SchedulerError> {
        Ok(self
            .records
            .update_if(
                &id,
                &|r| r.status == AcknowledgmentStatus::Acknowledged,
                &mut |r| {
                    r.status = AcknowledgmentStatus::Applied;
                    r.updated_at_ms = now_ms();
                },
            )?
            .is_applied())
    }
}
