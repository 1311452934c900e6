//! Resource Ledger: persisted ownership of devices and sample positions.
//!
//! Each row carries a status and an optional owning task. The only
//! synchronization primitive is the store's conditional update; the Ledger is
//! therefore not race-free for arbitrary concurrent list-then-claim callers.
//! The arbiter's pass lock keeps admission to a single writer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;
use crate::infra::store::{Collection, Conditional};
use crate::util::clock::now_ms;
use crate::util::serde::TaskId;

/// Device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// Free.
    Idle,
    /// Claimed by `owner`.
    Occupied,
    /// Faulted; not claimable until cleared.
    Error,
    /// Paused by an operator; not claimable until unpaused.
    Hold,
}

/// Sample position status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplePositionStatus {
    /// Free, no sample inside.
    Empty,
    /// Claimed by `owner`.
    Locked,
    /// Free, but a sample is sitting in it.
    Occupied,
}

/// A persisted device row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Unique device name.
    pub name: String,
    /// Device type tag used by by-type selectors.
    pub device_type: String,
    /// Free-text description.
    pub description: String,
    /// Current status.
    pub status: DeviceStatus,
    /// Owning task, set iff `status == Occupied`.
    pub owner: Option<TaskId>,
    /// Enter HOLD instead of IDLE on the next release.
    pub pause_requested: bool,
    /// Last modification time, ms since epoch.
    pub updated_at_ms: u128,
}

impl DeviceRecord {
    /// Claimable by `task`: idle, or already held by `task`.
    pub fn is_free_for(&self, task: TaskId) -> bool {
        match self.owner {
            Some(owner) => owner == task && self.status == DeviceStatus::Occupied,
            None => self.status == DeviceStatus::Idle,
        }
    }
}

/// A persisted sample position row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePositionRecord {
    /// Hierarchical name, `parentDevice/slot/index` for device positions.
    pub name: String,
    /// Device the position belongs to, if any.
    pub parent_device: Option<String>,
    /// Free-text description.
    pub description: String,
    /// Current status.
    pub status: SamplePositionStatus,
    /// Owning task, set iff `status == Locked`.
    pub owner: Option<TaskId>,
    /// Name of the sample physically inside, if any.
    pub sample: Option<String>,
    /// Last modification time, ms since epoch.
    pub updated_at_ms: u128,
}

impl SamplePositionRecord {
    /// Claimable by `task`: unowned, or already held by `task`.
    pub fn is_free_for(&self, task: TaskId) -> bool {
        self.owner.is_none_or(|owner| owner == task)
    }

    fn free_status(&self) -> SamplePositionStatus {
        if self.sample.is_some() {
            SamplePositionStatus::Occupied
        } else {
            SamplePositionStatus::Empty
        }
    }
}

/// A named group of sample positions exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Slot name, the middle segment of the position name.
    pub slot: String,
    /// Number of positions in the slot.
    pub count: usize,
    /// Free-text description.
    pub description: String,
}

impl SlotSpec {
    /// A slot with `count` positions.
    pub fn new(slot: impl Into<String>, count: usize) -> Self {
        Self {
            slot: slot.into(),
            count,
            description: String::new(),
        }
    }

    /// Position names under `device`: `device/slot/1 ..= device/slot/count`.
    pub fn position_names(&self, device: &str) -> Vec<String> {
        (1..=self.count)
            .map(|i| format!("{device}/{}/{i}", self.slot))
            .collect()
    }
}

/// A Ledger row address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Entity {
    /// A device by name.
    Device(String),
    /// A sample position by name.
    SamplePosition(String),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(n) => write!(f, "device `{n}`"),
            Self::SamplePosition(n) => write!(f, "sample position `{n}`"),
        }
    }
}

/// Result of a successful [`ResourceLedger::occupy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// The claiming task already owned the entity before this call.
    pub previously_owned: bool,
}

/// `None` if missing, `Some(Err(owner))` if the filter rejected the row.
fn settle<R>(
    outcome: Conditional<R>,
    owner: impl Fn(&R) -> Option<TaskId>,
) -> Option<Result<(), Option<TaskId>>> {
    match outcome {
        Conditional::Applied(_) => Some(Ok(())),
        Conditional::Rejected(r) => Some(Err(owner(&r))),
        Conditional::Missing => None,
    }
}

/// True if `name` lies under `prefix` on a `/` boundary.
pub fn matches_prefix(name: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    name == prefix
        || name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Ownership ledger over two persistence collections.
#[derive(Clone)]
pub struct ResourceLedger {
    devices: Arc<dyn Collection<String, DeviceRecord>>,
    positions: Arc<dyn Collection<String, SamplePositionRecord>>,
}

impl ResourceLedger {
    /// Wrap the device and sample-position collections.
    pub fn new(
        devices: Arc<dyn Collection<String, DeviceRecord>>,
        positions: Arc<dyn Collection<String, SamplePositionRecord>>,
    ) -> Self {
        Self { devices, positions }
    }

    /// Register a device and its sample positions.
    ///
    /// Existing rows keep their status and owner so that a restart over a
    /// persistent store never forgets who holds what.
    pub fn register_device(
        &self,
        name: &str,
        device_type: &str,
        description: &str,
        slots: &[SlotSpec],
    ) -> Result<(), SchedulerError> {
        if name.is_empty() || name.contains('/') {
            return Err(SchedulerError::Validation(format!(
                "invalid device name `{name}`"
            )));
        }
        let outcome = self.devices.update_if(&name.to_string(), &|_| true, &mut |d| {
            d.device_type = device_type.to_string();
            d.description = description.to_string();
        })?;
        if matches!(outcome, Conditional::Missing) {
            self.devices.insert(
                name.to_string(),
                DeviceRecord {
                    name: name.to_string(),
                    device_type: device_type.to_string(),
                    description: description.to_string(),
                    status: DeviceStatus::Idle,
                    owner: None,
                    pause_requested: false,
                    updated_at_ms: now_ms(),
                },
            )?;
            tracing::info!("registered device {} ({})", name, device_type);
        }
        for slot in slots {
            for position in slot.position_names(name) {
                self.register_sample_position(&position, Some(name), &slot.description)?;
            }
        }
        Ok(())
    }

    /// Register a sample position, optionally under a device.
    pub fn register_sample_position(
        &self,
        name: &str,
        parent_device: Option<&str>,
        description: &str,
    ) -> Result<(), SchedulerError> {
        if self.positions.get(&name.to_string())?.is_some() {
            return Ok(());
        }
        self.positions.insert(
            name.to_string(),
            SamplePositionRecord {
                name: name.to_string(),
                parent_device: parent_device.map(str::to_string),
                description: description.to_string(),
                status: SamplePositionStatus::Empty,
                owner: None,
                sample: None,
                updated_at_ms: now_ms(),
            },
        )
    }

    /// Read one device row.
    pub fn device(&self, name: &str) -> Result<Option<DeviceRecord>, SchedulerError> {
        self.devices.get(&name.to_string())
    }

    /// Read one sample position row.
    pub fn sample_position(
        &self,
        name: &str,
    ) -> Result<Option<SamplePositionRecord>, SchedulerError> {
        self.positions.get(&name.to_string())
    }

    /// All devices, by name.
    pub fn devices(&self) -> Result<Vec<DeviceRecord>, SchedulerError> {
        self.devices.find(&|_| true)
    }

    /// All sample positions, by name.
    pub fn sample_positions(&self) -> Result<Vec<SamplePositionRecord>, SchedulerError> {
        self.positions.find(&|_| true)
    }

    /// Devices of `device_type`, by name.
    pub fn devices_of_type(&self, device_type: &str) -> Result<Vec<DeviceRecord>, SchedulerError> {
        self.devices.find(&|d| d.device_type == device_type)
    }

    /// Claim `entity` for `task`.
    ///
    /// Succeeds if the entity is free or already owned by `task`; otherwise
    /// fails with [`SchedulerError::AdmissionConflict`].
    pub fn occupy(&self, entity: &Entity, task: TaskId) -> Result<Claim, SchedulerError> {
        let mut previously_owned = false;
        let holder = match entity {
            Entity::Device(name) => settle(self.devices.update_if(
                name,
                &|d| d.is_free_for(task),
                &mut |d| {
                    previously_owned = d.owner == Some(task);
                    d.status = DeviceStatus::Occupied;
                    d.owner = Some(task);
                    d.updated_at_ms = now_ms();
                },
            )?, |d| d.owner),
            Entity::SamplePosition(name) => settle(self.positions.update_if(
                name,
                &|p| p.is_free_for(task),
                &mut |p| {
                    previously_owned = p.owner == Some(task);
                    p.status = SamplePositionStatus::Locked;
                    p.owner = Some(task);
                    p.updated_at_ms = now_ms();
                },
            )?, |p| p.owner),
        };
        match holder {
            Some(Ok(())) => Ok(Claim { previously_owned }),
            Some(Err(owner)) => {
                tracing::debug!("{} held by {:?}, wanted by {}", entity, owner, task);
                Err(SchedulerError::AdmissionConflict(entity.to_string()))
            }
            None => Err(SchedulerError::NotFound(entity.to_string())),
        }
    }

    /// Reset `entity` to free and clear its owner, unconditionally.
    ///
    /// A device with a pending pause enters HOLD instead of IDLE.
    pub fn release(&self, entity: &Entity) -> Result<(), SchedulerError> {
        let outcome = match entity {
            Entity::Device(name) => self
                .devices
                .update_if(name, &|_| true, &mut |d| {
                    d.owner = None;
                    d.status = if d.pause_requested {
                        d.pause_requested = false;
                        DeviceStatus::Hold
                    } else {
                        DeviceStatus::Idle
                    };
                    d.updated_at_ms = now_ms();
                })?
                .is_applied(),
            Entity::SamplePosition(name) => self
                .positions
                .update_if(name, &|_| true, &mut |p| {
                    p.owner = None;
                    p.status = p.free_status();
                    p.updated_at_ms = now_ms();
                })?
                .is_applied(),
        };
        if outcome {
            tracing::debug!("released {}", entity);
            Ok(())
        } else {
            Err(SchedulerError::NotFound(entity.to_string()))
        }
    }

    /// Release `entity` only while `task` owns it. Returns whether it did.
    pub fn release_if_owned(&self, entity: &Entity, task: TaskId) -> Result<bool, SchedulerError> {
        let applied = match entity {
            Entity::Device(name) => self
                .devices
                .update_if(name, &|d| d.owner == Some(task), &mut |d| {
                    d.owner = None;
                    d.status = if d.pause_requested {
                        d.pause_requested = false;
                        DeviceStatus::Hold
                    } else {
                        DeviceStatus::Idle
                    };
                    d.updated_at_ms = now_ms();
                })?
                .is_applied(),
            Entity::SamplePosition(name) => self
                .positions
                .update_if(name, &|p| p.owner == Some(task), &mut |p| {
                    p.owner = None;
                    p.status = p.free_status();
                    p.updated_at_ms = now_ms();
                })?
                .is_applied(),
        };
        if applied {
            tracing::debug!("task {} released {}", task, entity);
        }
        Ok(applied)
    }

    /// Current owner of `entity`.
    pub fn owner_of(&self, entity: &Entity) -> Result<Option<TaskId>, SchedulerError> {
        let owner = match entity {
            Entity::Device(name) => self.device(name)?.map(|d| d.owner),
            Entity::SamplePosition(name) => self.sample_position(name)?.map(|p| p.owner),
        };
        owner.ok_or_else(|| SchedulerError::NotFound(entity.to_string()))
    }

    /// Devices matching `device_type` that `task` may claim, already-owned first.
    pub fn device_candidates_by_type(
        &self,
        device_type: &str,
        task: TaskId,
    ) -> Result<Vec<DeviceRecord>, SchedulerError> {
        let mut found = self
            .devices
            .find(&|d| d.device_type == device_type && d.is_free_for(task))?;
        found.sort_by_key(|d| d.owner != Some(task));
        Ok(found)
    }

    /// Sample positions under `prefix` that `task` may claim, already-owned first.
    pub fn sample_position_candidates(
        &self,
        prefix: &str,
        task: TaskId,
    ) -> Result<Vec<SamplePositionRecord>, SchedulerError> {
        let mut found = self
            .positions
            .find(&|p| matches_prefix(&p.name, prefix) && p.is_free_for(task))?;
        found.sort_by_key(|p| p.owner != Some(task));
        Ok(found)
    }

    /// Number of sample positions under `prefix`, regardless of status.
    pub fn count_sample_positions(&self, prefix: &str) -> Result<usize, SchedulerError> {
        Ok(self
            .positions
            .find(&|p| matches_prefix(&p.name, prefix))?
            .len())
    }

    /// Everything `task` currently owns.
    pub fn owned_by(&self, task: TaskId) -> Result<Vec<Entity>, SchedulerError> {
        let mut owned: Vec<Entity> = self
            .devices
            .find(&|d| d.owner == Some(task))?
            .into_iter()
            .map(|d| Entity::Device(d.name))
            .collect();
        owned.extend(
            self.positions
                .find(&|p| p.owner == Some(task))?
                .into_iter()
                .map(|p| Entity::SamplePosition(p.name)),
        );
        Ok(owned)
    }

    /// Ask a device to pause: IDLE devices enter HOLD now, occupied devices
    /// enter HOLD when their owner releases them.
    pub fn request_pause(&self, name: &str) -> Result<DeviceStatus, SchedulerError> {
        let outcome = self.devices.update_if(&name.to_string(), &|_| true, &mut |d| {
            if d.status == DeviceStatus::Idle {
                d.status = DeviceStatus::Hold;
            } else if d.status == DeviceStatus::Occupied {
                d.pause_requested = true;
            }
            d.updated_at_ms = now_ms();
        })?;
        match outcome {
            Conditional::Applied(d) | Conditional::Rejected(d) => {
                tracing::info!("pause requested for device {} ({:?})", name, d.status);
                Ok(d.status)
            }
            Conditional::Missing => Err(SchedulerError::NotFound(format!("device `{name}`"))),
        }
    }

    /// Return a HOLD device to IDLE, or withdraw a pending pause.
    pub fn unpause(&self, name: &str) -> Result<(), SchedulerError> {
        let outcome = self.devices.update_if(&name.to_string(), &|_| true, &mut |d| {
            d.pause_requested = false;
            if d.status == DeviceStatus::Hold {
                d.status = DeviceStatus::Idle;
            }
            d.updated_at_ms = now_ms();
        })?;
        if matches!(outcome, Conditional::Missing) {
            return Err(SchedulerError::NotFound(format!("device `{name}`")));
        }
        Ok(())
    }

    /// Mark an unowned device as faulted.
    pub fn mark_device_error(&self, name: &str) -> Result<(), SchedulerError> {
        match self
            .devices
            .update_if(&name.to_string(), &|d| d.owner.is_none(), &mut |d| {
                d.status = DeviceStatus::Error;
                d.updated_at_ms = now_ms();
            })? {
            Conditional::Applied(_) => {
                tracing::warn!("device {} marked as error", name);
                Ok(())
            }
            Conditional::Rejected(d) => Err(SchedulerError::InvalidTransition(format!(
                "device `{name}` is held by task {:?}",
                d.owner
            ))),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("device `{name}`"))),
        }
    }

    /// Clear a faulted device back to IDLE.
    pub fn clear_device_error(&self, name: &str) -> Result<(), SchedulerError> {
        match self.devices.update_if(
            &name.to_string(),
            &|d| d.status == DeviceStatus::Error,
            &mut |d| {
                d.status = DeviceStatus::Idle;
                d.updated_at_ms = now_ms();
            },
        )? {
            Conditional::Applied(_) => Ok(()),
            Conditional::Rejected(d) => Err(SchedulerError::InvalidTransition(format!(
                "device `{name}` is {:?}, not ERROR",
                d.status
            ))),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("device `{name}`"))),
        }
    }

    /// Record that `sample` now sits in `position`; `task` must own it.
    pub fn place_sample(
        &self,
        position: &str,
        sample: &str,
        task: TaskId,
    ) -> Result<(), SchedulerError> {
        self.update_owned_position(position, task, Some(sample.to_string()))
    }

    /// Record that `position` is now empty; `task` must own it.
    pub fn remove_sample(&self, position: &str, task: TaskId) -> Result<(), SchedulerError> {
        self.update_owned_position(position, task, None)
    }

    fn update_owned_position(
        &self,
        position: &str,
        task: TaskId,
        sample: Option<String>,
    ) -> Result<(), SchedulerError> {
        match self.positions.update_if(
            &position.to_string(),
            &|p| p.owner == Some(task),
            &mut |p| {
                p.sample.clone_from(&sample);
                p.updated_at_ms = now_ms();
            },
        )? {
            Conditional::Applied(_) => Ok(()),
            Conditional::Rejected(_) => Err(SchedulerError::OwnershipViolation {
                task,
                entity: Entity::SamplePosition(position.to_string()).to_string(),
            }),
            Conditional::Missing => Err(SchedulerError::NotFound(format!(
                "sample position `{position}`"
            ))),
        }
    }
}
