//! Admission pass and release processing.
//!
//! One admission pass walks every PENDING request in (priority desc,
//! submission asc) order and tries to claim everything its spec names. A
//! request is granted all-or-nothing: if any item cannot be claimed this pass,
//! whatever was claimed for it is rolled back and it stays PENDING. Failures
//! are isolated per request; only persistence errors abort the pass.
//!
//! Passes and release processing run under a lock shared by every clone of
//! an [`Arbiter`]; a rollback must never undo a grant made by another pass.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::audit::{self, SharedAuditSink};
use crate::core::ledger::{Claim, DeviceRecord, Entity, ResourceLedger};
use crate::core::request::{
    CancelOutcome, DeviceSelector, Grant, ItemGrant, PositionGrant, RequestItem, RequestStatus,
    RequestStore, ResourceRequest,
};
use crate::core::task::{TaskStatus, TaskStore};
use crate::core::{RequestFailure, RequestFailureKind, SchedulerError};
use crate::infra::store::Conditional;
use crate::util::serde::{RequestId, TaskId};

/// Prefix marker resolved to the device assigned for the same item.
pub const DEVICE_PLACEHOLDER: char = '$';

/// What one admission pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    /// Requests granted this pass, in grant order.
    pub fulfilled: Vec<RequestId>,
    /// Requests left PENDING because something was unavailable.
    pub deferred: Vec<RequestId>,
    /// Requests canceled because their task left REQUESTING_RESOURCES.
    pub canceled: Vec<RequestId>,
    /// Requests that failed terminally.
    pub errored: Vec<RequestId>,
}

enum Outcome {
    Fulfilled,
    Deferred,
    Canceled,
    Errored,
    Skipped,
}

enum AllocError {
    Invalid(RequestFailure),
    Store(SchedulerError),
}

impl From<SchedulerError> for AllocError {
    fn from(e: SchedulerError) -> Self {
        Self::Store(e)
    }
}

fn invalid(kind: RequestFailureKind, message: impl Into<String>) -> AllocError {
    AllocError::Invalid(RequestFailure::new(kind, message))
}

/// Entities claimed for one request during the current pass.
#[derive(Default)]
struct ClaimSet {
    claims: Vec<(Entity, Claim)>,
}

impl ClaimSet {
    fn contains(&self, entity: &Entity) -> bool {
        self.claims.iter().any(|(e, _)| e == entity)
    }

    fn push(&mut self, entity: Entity, claim: Claim) -> Grant {
        let name = match &entity {
            Entity::Device(n) | Entity::SamplePosition(n) => n.clone(),
        };
        self.claims.push((entity, claim));
        Grant {
            name,
            needs_release: !claim.previously_owned,
        }
    }
}

/// Resolve a `$`-relative prefix against the item's device.
fn resolve_prefix(prefix: &str, device: Option<&str>) -> Result<String, AllocError> {
    match prefix.strip_prefix(DEVICE_PLACEHOLDER) {
        Some(rest) => device.map(|d| format!("{d}{rest}")).ok_or_else(|| {
            invalid(
                RequestFailureKind::MalformedSpec,
                format!("prefix `{prefix}` is device-relative but the item names no device"),
            )
        }),
        None => Ok(prefix.to_string()),
    }
}

/// Mediates between the request store and the Ledger.
#[derive(Clone)]
pub struct Arbiter {
    tasks: TaskStore,
    ledger: ResourceLedger,
    requests: RequestStore,
    audit: Option<SharedAuditSink>,
    pass_lock: Arc<Mutex<()>>,
}

impl Arbiter {
    /// Create an arbiter over the three stores.
    pub fn new(tasks: TaskStore, ledger: ResourceLedger, requests: RequestStore) -> Self {
        Self {
            tasks,
            ledger,
            requests,
            audit: None,
            pass_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run one admission pass over all PENDING requests.
    pub fn admission_pass(&self) -> Result<AdmissionReport, SchedulerError> {
        let _pass = self.pass_lock.lock();
        let mut report = AdmissionReport::default();
        for request in self.requests.pending_in_admission_order()? {
            match self.admit(&request)? {
                Outcome::Fulfilled => report.fulfilled.push(request.id),
                Outcome::Deferred => report.deferred.push(request.id),
                Outcome::Canceled => report.canceled.push(request.id),
                Outcome::Errored => report.errored.push(request.id),
                Outcome::Skipped => {}
            }
        }
        if !report.fulfilled.is_empty() || !report.errored.is_empty() {
            tracing::debug!(
                "admission pass: {} fulfilled, {} deferred, {} canceled, {} errored",
                report.fulfilled.len(),
                report.deferred.len(),
                report.canceled.len(),
                report.errored.len()
            );
        }
        Ok(report)
    }

    fn admit(&self, request: &ResourceRequest) -> Result<Outcome, SchedulerError> {
        let task_status = match self.tasks.get(request.task_id) {
            Ok(task) => Some(task.status),
            Err(SchedulerError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if task_status != Some(TaskStatus::RequestingResources) {
            return match self.requests.cancel_if_not_fulfilled(request.id)? {
                CancelOutcome::Canceled => {
                    tracing::info!(
                        "request {} canceled: task {} is {:?}",
                        request.id,
                        request.task_id,
                        task_status
                    );
                    self.audit(request, "canceled", None);
                    Ok(Outcome::Canceled)
                }
                CancelOutcome::AlreadyFulfilled(_) | CancelOutcome::Other(_) => Ok(Outcome::Skipped),
            };
        }

        let mut claims = ClaimSet::default();
        match self.claim_all(request, &mut claims) {
            Ok(Some(grants)) => match self.requests.fulfill(request.id, grants)? {
                Conditional::Applied(_) => {
                    tracing::info!(
                        "request {} fulfilled for task {} (priority {})",
                        request.id,
                        request.task_id,
                        request.priority
                    );
                    self.audit(request, "granted", None);
                    Ok(Outcome::Fulfilled)
                }
                Conditional::Rejected(_) | Conditional::Missing => {
                    // withdrawn by its client between listing and granting
                    self.rollback(request, &claims)?;
                    Ok(Outcome::Skipped)
                }
            },
            Ok(None) => {
                self.rollback(request, &claims)?;
                Ok(Outcome::Deferred)
            }
            Err(AllocError::Invalid(failure)) => {
                self.rollback(request, &claims)?;
                let payload = serde_json::to_string(&failure).ok();
                if self.requests.mark_error(request.id, failure)?.is_some() {
                    self.audit(request, "error", payload);
                    Ok(Outcome::Errored)
                } else {
                    Ok(Outcome::Skipped)
                }
            }
            Err(AllocError::Store(e)) => {
                if let Err(rollback_err) = self.rollback(request, &claims) {
                    tracing::error!(
                        "rollback for request {} failed after store error: {}",
                        request.id,
                        rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Validate the spec shape before touching the Ledger.
    fn validate(request: &ResourceRequest) -> Result<(), AllocError> {
        if request.items.is_empty() {
            return Err(invalid(RequestFailureKind::MalformedSpec, "empty request"));
        }
        let mut named = Vec::new();
        for item in &request.items {
            if let DeviceSelector::Name(name) = &item.device {
                if named.contains(&name) {
                    return Err(invalid(
                        RequestFailureKind::MalformedSpec,
                        format!("device `{name}` requested twice"),
                    ));
                }
                named.push(name);
            }
            for demand in &item.sample_positions {
                if demand.count == 0 {
                    return Err(invalid(
                        RequestFailureKind::MalformedSpec,
                        format!("zero positions requested under `{}`", demand.prefix),
                    ));
                }
                if demand.prefix.trim_start_matches(DEVICE_PLACEHOLDER).is_empty() {
                    return Err(invalid(
                        RequestFailureKind::MalformedSpec,
                        "empty sample position prefix",
                    ));
                }
            }
        }
        Ok(())
    }

    fn claim_all(
        &self,
        request: &ResourceRequest,
        claims: &mut ClaimSet,
    ) -> Result<Option<Vec<ItemGrant>>, AllocError> {
        Self::validate(request)?;
        let mut grants = Vec::with_capacity(request.items.len());
        for item in &request.items {
            match self.claim_item(request.task_id, item, claims)? {
                Some(grant) => grants.push(grant),
                None => return Ok(None),
            }
        }
        Ok(Some(grants))
    }

    /// Devices an item could use, in preference order. `[None]` for
    /// position-only items.
    fn device_options(
        &self,
        task: TaskId,
        item: &RequestItem,
        claims: &ClaimSet,
    ) -> Result<Vec<Option<DeviceRecord>>, AllocError> {
        let usable = |d: &DeviceRecord| !claims.contains(&Entity::Device(d.name.clone()));
        match &item.device {
            DeviceSelector::None => Ok(vec![None]),
            DeviceSelector::Name(name) => {
                let device = self.ledger.device(name)?.ok_or_else(|| {
                    invalid(
                        RequestFailureKind::UnknownDevice,
                        format!("no device named `{name}`"),
                    )
                })?;
                if device.is_free_for(task) && usable(&device) {
                    Ok(vec![Some(device)])
                } else {
                    Ok(Vec::new())
                }
            }
            DeviceSelector::Type(device_type) => {
                if self.ledger.devices_of_type(device_type)?.is_empty() {
                    return Err(invalid(
                        RequestFailureKind::UnknownDeviceType,
                        format!("no device of type `{device_type}`"),
                    ));
                }
                Ok(self
                    .ledger
                    .device_candidates_by_type(device_type, task)?
                    .into_iter()
                    .filter(|d| usable(d))
                    .map(Some)
                    .collect())
            }
        }
    }

    /// Reject demands that could never be met, whatever the Ledger state.
    fn check_satisfiable(&self, item: &RequestItem) -> Result<(), AllocError> {
        let devices: Vec<Option<String>> = match &item.device {
            DeviceSelector::None => vec![None],
            DeviceSelector::Name(name) => vec![Some(name.clone())],
            DeviceSelector::Type(t) => self
                .ledger
                .devices_of_type(t)?
                .into_iter()
                .map(|d| Some(d.name))
                .collect(),
        };
        for demand in &item.sample_positions {
            let mut satisfiable = false;
            for device in &devices {
                let prefix = resolve_prefix(&demand.prefix, device.as_deref())?;
                if self.ledger.count_sample_positions(&prefix)? >= demand.count {
                    satisfiable = true;
                    break;
                }
            }
            if !satisfiable {
                return Err(invalid(
                    RequestFailureKind::UnknownSamplePosition,
                    format!(
                        "fewer than {} sample positions exist under `{}`",
                        demand.count, demand.prefix
                    ),
                ));
            }
        }
        Ok(())
    }

    fn claim_item(
        &self,
        task: TaskId,
        item: &RequestItem,
        claims: &mut ClaimSet,
    ) -> Result<Option<ItemGrant>, AllocError> {
        let options = self.device_options(task, item, claims)?;
        self.check_satisfiable(item)?;

        'devices: for device in options {
            let device_name = device.as_ref().map(|d| d.name.as_str());
            let mut picked: Vec<(String, Vec<String>)> = Vec::new();
            for demand in &item.sample_positions {
                let prefix = resolve_prefix(&demand.prefix, device_name)?;
                let chosen: Vec<String> = self
                    .ledger
                    .sample_position_candidates(&prefix, task)?
                    .into_iter()
                    .map(|p| p.name)
                    .filter(|name| {
                        !claims.contains(&Entity::SamplePosition(name.clone()))
                            && !picked.iter().any(|(_, names)| names.contains(name))
                    })
                    .take(demand.count)
                    .collect();
                if chosen.len() < demand.count {
                    continue 'devices;
                }
                picked.push((demand.prefix.clone(), chosen));
            }

            let device_grant = match device_name {
                Some(name) => match self.try_occupy(Entity::Device(name.to_string()), task, claims)? {
                    Some(grant) => Some(grant),
                    None => return Ok(None),
                },
                None => None,
            };
            let mut position_grants = Vec::with_capacity(picked.len());
            for (prefix, names) in picked {
                let mut positions = Vec::with_capacity(names.len());
                for name in names {
                    match self.try_occupy(Entity::SamplePosition(name), task, claims)? {
                        Some(grant) => positions.push(grant),
                        None => return Ok(None),
                    }
                }
                position_grants.push(PositionGrant { prefix, positions });
            }
            return Ok(Some(ItemGrant {
                device: device_grant,
                sample_positions: position_grants,
            }));
        }
        Ok(None)
    }

    fn try_occupy(
        &self,
        entity: Entity,
        task: TaskId,
        claims: &mut ClaimSet,
    ) -> Result<Option<Grant>, AllocError> {
        match self.ledger.occupy(&entity, task) {
            Ok(claim) => Ok(Some(claims.push(entity, claim))),
            Err(SchedulerError::AdmissionConflict(what)) => {
                tracing::debug!("conflict on {} for task {}", what, task);
                Ok(None)
            }
            Err(SchedulerError::NotFound(what)) => Err(invalid(
                RequestFailureKind::UnknownDevice,
                format!("{what} disappeared during admission"),
            )),
            Err(e) => Err(AllocError::Store(e)),
        }
    }

    /// Undo this pass's claims for one request, newest first. Entities the
    /// task owned before the request are left alone.
    fn rollback(&self, request: &ResourceRequest, claims: &ClaimSet) -> Result<(), SchedulerError> {
        let mut undone = 0usize;
        for (entity, claim) in claims.claims.iter().rev() {
            if !claim.previously_owned {
                self.ledger.release(entity)?;
                undone += 1;
            }
        }
        if undone > 0 {
            tracing::debug!("rolled back {} claims for request {}", undone, request.id);
            self.audit(request, "rolled_back", Some(undone.to_string()));
        }
        Ok(())
    }

    /// Free the entities of every NEED_RELEASE request and mark it RELEASED.
    ///
    /// Only entities flagged `needs_release` are touched, and only while the
    /// requesting task still owns them.
    pub fn process_releases(&self) -> Result<Vec<RequestId>, SchedulerError> {
        let _pass = self.pass_lock.lock();
        let mut released = Vec::new();
        for request in self.requests.with_status(RequestStatus::NeedRelease)? {
            for (entity, needs_release) in request.granted_entities() {
                if !needs_release {
                    continue;
                }
                if !self.ledger.release_if_owned(&entity, request.task_id)? {
                    tracing::warn!(
                        "{} no longer owned by task {}; leaving it alone",
                        entity,
                        request.task_id
                    );
                }
            }
            if self
                .requests
                .advance(
                    request.id,
                    RequestStatus::NeedRelease,
                    RequestStatus::Released,
                    &mut |_| {},
                )?
                .is_applied()
            {
                tracing::info!("request {} released", request.id);
                self.audit(&request, "released", None);
                released.push(request.id);
            }
        }
        Ok(released)
    }

    fn audit(&self, request: &ResourceRequest, action: &str, payload: Option<String>) {
        audit::record(
            self.audit.as_ref(),
            Some(request.task_id),
            Some(request.id),
            action,
            payload,
        );
    }
}
