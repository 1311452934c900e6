//! Resource requests and their state lattice.
//!
//! ```text
//! PENDING -> FULFILLED -> NEED_RELEASE -> RELEASED
//! PENDING -> CANCELED
//! any non-terminal -> ERROR
//! ```
//!
//! Every status change goes through a conditional update on the current
//! status, so transitions only ever move forward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::ledger::Entity;
use crate::core::{RequestFailure, SchedulerError};
use crate::infra::store::{Collection, Conditional};
use crate::util::clock::now_ms;
use crate::util::serde::{Priority, RequestId, TaskId};

/// Request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Waiting for an admission pass to grant it.
    Pending,
    /// Granted; the task holds the assigned entities.
    Fulfilled,
    /// The task asked to release; the scheduler frees entities next tick.
    NeedRelease,
    /// Entities freed.
    Released,
    /// Withdrawn before being granted.
    Canceled,
    /// Failed terminally; see the error payload.
    Error,
}

impl RequestStatus {
    /// Terminal statuses never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Canceled | Self::Error)
    }

    /// Whether the lattice allows moving from `self` to `next`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Fulfilled | Self::Canceled | Self::Error)
                | (Self::Fulfilled, Self::NeedRelease | Self::Error)
                | (Self::NeedRelease, Self::Released | Self::Error)
        )
    }
}

/// Which device an item needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum DeviceSelector {
    /// A specific device.
    Name(String),
    /// Any device of a type.
    Type(String),
    /// No device; sample positions only.
    None,
}

/// A number of sample positions under a name prefix.
///
/// A prefix starting with `$` is resolved against the device assigned for the
/// same item: `$/tray` on `furnace_1` means `furnace_1/tray`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionDemand {
    /// Name prefix.
    pub prefix: String,
    /// How many positions are needed.
    pub count: usize,
}

/// One line of a request spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestItem {
    /// Device selector.
    pub device: DeviceSelector,
    /// Sample positions needed alongside the device.
    pub sample_positions: Vec<PositionDemand>,
}

impl RequestItem {
    /// Ask for a device by name.
    pub fn device(name: impl Into<String>) -> Self {
        Self {
            device: DeviceSelector::Name(name.into()),
            sample_positions: Vec::new(),
        }
    }

    /// Ask for any device of a type.
    pub fn device_of_type(device_type: impl Into<String>) -> Self {
        Self {
            device: DeviceSelector::Type(device_type.into()),
            sample_positions: Vec::new(),
        }
    }

    /// Ask for sample positions only.
    pub const fn positions_only() -> Self {
        Self {
            device: DeviceSelector::None,
            sample_positions: Vec::new(),
        }
    }

    /// Add a sample position demand.
    #[must_use]
    pub fn with_positions(mut self, prefix: impl Into<String>, count: usize) -> Self {
        self.sample_positions.push(PositionDemand {
            prefix: prefix.into(),
            count,
        });
        self
    }
}

/// One granted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Granted entity name.
    pub name: String,
    /// False if the task already owned the entity before this request; such
    /// entities are left untouched when this request is released.
    pub needs_release: bool,
}

/// Positions granted for one [`PositionDemand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionGrant {
    /// The prefix as requested (before `$` resolution).
    pub prefix: String,
    /// Granted positions.
    pub positions: Vec<Grant>,
}

/// Allocation for one [`RequestItem`], in spec order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGrant {
    /// Granted device, if the item asked for one.
    pub device: Option<Grant>,
    /// Granted sample positions, one entry per demand.
    pub sample_positions: Vec<PositionGrant>,
}

impl ItemGrant {
    /// All entities in this item grant, with their release flags.
    pub fn entities(&self) -> impl Iterator<Item = (Entity, bool)> + '_ {
        self.device
            .iter()
            .map(|g| (Entity::Device(g.name.clone()), g.needs_release))
            .chain(self.sample_positions.iter().flat_map(|pg| {
                pg.positions
                    .iter()
                    .map(|g| (Entity::SamplePosition(g.name.clone()), g.needs_release))
            }))
    }
}

/// A persisted resource request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Unique identifier.
    pub id: RequestId,
    /// Requesting task.
    pub task_id: TaskId,
    /// Ordered spec.
    pub items: Vec<RequestItem>,
    /// Admission priority.
    pub priority: Priority,
    /// Submission time, ms since epoch.
    pub submitted_at_ms: u128,
    /// Submission sequence number; breaks ties within one millisecond.
    pub seq: u64,
    /// Current status.
    pub status: RequestStatus,
    /// Allocation, parallel to `items`; empty until FULFILLED.
    pub assigned: Vec<ItemGrant>,
    /// Failure payload for ERROR requests.
    pub error: Option<RequestFailure>,
    /// Last modification time, ms since epoch.
    pub updated_at_ms: u128,
}

impl ResourceRequest {
    /// All granted entities with their release flags.
    pub fn granted_entities(&self) -> Vec<(Entity, bool)> {
        self.assigned.iter().flat_map(ItemGrant::entities).collect()
    }
}

/// What a conditional cancellation found.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The request was PENDING and is now CANCELED.
    Canceled,
    /// The request was granted before the cancellation landed.
    AlreadyFulfilled(ResourceRequest),
    /// The request was already in another status.
    Other(RequestStatus),
}

/// Store of resource requests.
#[derive(Clone)]
pub struct RequestStore {
    requests: Arc<dyn Collection<RequestId, ResourceRequest>>,
    seq: Arc<AtomicU64>,
}

impl RequestStore {
    /// Wrap a collection, continuing the sequence after any persisted requests.
    pub fn new(
        requests: Arc<dyn Collection<RequestId, ResourceRequest>>,
    ) -> Result<Self, SchedulerError> {
        let next = requests
            .find(&|_| true)?
            .iter()
            .map(|r| r.seq + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            requests,
            seq: Arc::new(AtomicU64::new(next)),
        })
    }

    /// Insert a PENDING request stamped with the submission time.
    pub fn submit(
        &self,
        task_id: TaskId,
        items: Vec<RequestItem>,
        priority: Priority,
    ) -> Result<RequestId, SchedulerError> {
        let id = RequestId::new();
        let now = now_ms();
        self.requests.insert(
            id,
            ResourceRequest {
                id,
                task_id,
                items,
                priority,
                submitted_at_ms: now,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                status: RequestStatus::Pending,
                assigned: Vec::new(),
                error: None,
                updated_at_ms: now,
            },
        )?;
        tracing::debug!("task {} submitted request {} at priority {}", task_id, id, priority);
        Ok(id)
    }

    /// Read one request.
    pub fn get(&self, id: RequestId) -> Result<ResourceRequest, SchedulerError> {
        self.requests
            .get(&id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("request {id}")))
    }

    /// PENDING requests in admission order: priority descending, then
    /// submission time ascending.
    pub fn pending_in_admission_order(&self) -> Result<Vec<ResourceRequest>, SchedulerError> {
        let mut pending = self.with_status(RequestStatus::Pending)?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at_ms.cmp(&b.submitted_at_ms))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(pending)
    }

    /// Requests in `status`.
    pub fn with_status(&self, status: RequestStatus) -> Result<Vec<ResourceRequest>, SchedulerError> {
        self.requests.find(&|r| r.status == status)
    }

    /// Non-terminal requests of `task`.
    pub fn open_for_task(&self, task: TaskId) -> Result<Vec<ResourceRequest>, SchedulerError> {
        self.requests
            .find(&|r| r.task_id == task && !r.status.is_terminal())
    }

    /// Move `id` from `from` to `to`, applying `extra` in the same write.
    ///
    /// Returns the current record either way; the caller checks the status.
    pub fn advance(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
        extra: &mut dyn FnMut(&mut ResourceRequest),
    ) -> Result<Conditional<ResourceRequest>, SchedulerError> {
        if !from.can_advance_to(to) {
            return Err(SchedulerError::InvalidTransition(format!(
                "request {id}: {from:?} -> {to:?}"
            )));
        }
        self.requests.update_if(&id, &|r| r.status == from, &mut |r| {
            extra(r);
            r.status = to;
            r.updated_at_ms = now_ms();
        })
    }

    /// PENDING -> FULFILLED, recording the allocation.
    pub fn fulfill(
        &self,
        id: RequestId,
        assigned: Vec<ItemGrant>,
    ) -> Result<Conditional<ResourceRequest>, SchedulerError> {
        self.advance(id, RequestStatus::Pending, RequestStatus::Fulfilled, &mut |r| {
            r.assigned.clone_from(&assigned);
        })
    }

    /// Ask for release: FULFILLED -> NEED_RELEASE.
    ///
    /// Idempotent: once the request is past FULFILLED this is a no-op.
    /// Releasing a request that was never granted is an error.
    pub fn release(&self, id: RequestId) -> Result<(), SchedulerError> {
        match self.advance(
            id,
            RequestStatus::Fulfilled,
            RequestStatus::NeedRelease,
            &mut |_| {},
        )? {
            Conditional::Applied(_) => {
                tracing::debug!("request {} flagged for release", id);
                Ok(())
            }
            Conditional::Rejected(r) if r.status == RequestStatus::Pending => {
                Err(SchedulerError::InvalidTransition(format!(
                    "request {id} was never fulfilled"
                )))
            }
            Conditional::Rejected(_) => Ok(()),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("request {id}"))),
        }
    }

    /// PENDING -> CANCELED, conditional on the request not having been
    /// fulfilled in the meantime.
    pub fn cancel_if_not_fulfilled(&self, id: RequestId) -> Result<CancelOutcome, SchedulerError> {
        match self.advance(
            id,
            RequestStatus::Pending,
            RequestStatus::Canceled,
            &mut |_| {},
        )? {
            Conditional::Applied(_) => Ok(CancelOutcome::Canceled),
            Conditional::Rejected(r) if r.status == RequestStatus::Fulfilled => {
                Ok(CancelOutcome::AlreadyFulfilled(r))
            }
            Conditional::Rejected(r) => Ok(CancelOutcome::Other(r.status)),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("request {id}"))),
        }
    }

    /// Move a non-terminal request to ERROR with `failure`.
    ///
    /// Returns the record as it was just before the write, or `None` if the
    /// request was already terminal.
    pub fn mark_error(
        &self,
        id: RequestId,
        failure: RequestFailure,
    ) -> Result<Option<ResourceRequest>, SchedulerError> {
        let mut before = None;
        let outcome = self.requests.update_if(
            &id,
            &|r| !r.status.is_terminal(),
            &mut |r| {
                before = Some(r.clone());
                r.status = RequestStatus::Error;
                r.error = Some(failure.clone());
                r.updated_at_ms = now_ms();
            },
        )?;
        match outcome {
            Conditional::Applied(_) => {
                tracing::warn!("request {} failed: {}", id, failure);
                Ok(before)
            }
            Conditional::Rejected(_) => Ok(None),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("request {id}"))),
        }
    }
}
