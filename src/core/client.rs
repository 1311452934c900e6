//! Task-side client for resource requests.
//!
//! A task body calls [`ResourceRequester::request_resources`] and blocks,
//! polling its own request with bounded backoff, until the scheduler grants
//! it. The returned [`ResourceGuard`] releases the grant when dropped, so
//! nested guards unwind innermost first on every exit path.

use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::ClientSettings;
use crate::core::request::{
    CancelOutcome, ItemGrant, RequestItem, RequestStatus, RequestStore, ResourceRequest,
};
use crate::core::task::{TaskStatus, TaskStore};
use crate::core::{RequestFailure, RequestFailureKind, SchedulerError};
use crate::util::backoff::BackoffPolicy;
use crate::util::serde::{Priority, RequestId, TaskId};

/// Submits and waits on resource requests for one task.
#[derive(Clone)]
pub struct ResourceRequester {
    task_id: TaskId,
    tasks: TaskStore,
    requests: RequestStore,
    backoff: BackoffPolicy,
    release_timeout: Duration,
    default_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ResourceRequester {
    /// Client for `task_id`. `cancel` aborts any wait in progress.
    pub fn new(
        task_id: TaskId,
        tasks: TaskStore,
        requests: RequestStore,
        settings: &ClientSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            tasks,
            requests,
            backoff: settings.backoff(),
            release_timeout: settings.release_timeout(),
            default_timeout: settings.default_request_timeout(),
            cancel,
        }
    }

    /// Task this client acts for.
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Request `items` and block until they are granted.
    ///
    /// The task moves RUNNING -> REQUESTING_RESOURCES for the duration of the
    /// wait. `timeout` of `None` falls back to the configured default.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the wait expired and the request was withdrawn
    /// - `Cancelled` if the cancellation token fired
    /// - `RequestError` if the scheduler rejected the spec
    pub fn request_resources(
        &self,
        items: Vec<RequestItem>,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<ResourceGuard, SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled(format!("task {}", self.task_id)));
        }
        if !self.tasks.transition(
            self.task_id,
            TaskStatus::Running,
            TaskStatus::RequestingResources,
        )? {
            let status = self.tasks.get(self.task_id)?.status;
            return Err(SchedulerError::InvalidTransition(format!(
                "task {} is {status:?}, not RUNNING",
                self.task_id
            )));
        }

        let guard = self
            .requests
            .submit(self.task_id, items, priority)
            .and_then(|id| self.wait(id, timeout.or(self.default_timeout)))
            .map(|request| ResourceGuard {
                request,
                requests: self.requests.clone(),
                backoff: self.backoff,
                release_timeout: self.release_timeout,
                released: false,
            });

        // a cancelled task stays cancelled
        self.tasks.transition(
            self.task_id,
            TaskStatus::RequestingResources,
            TaskStatus::Running,
        )?;

        let guard = guard?;
        tracing::debug!("task {} holds request {}", self.task_id, guard.request_id());
        Ok(guard)
    }

    fn wait(
        &self,
        id: RequestId,
        timeout: Option<Duration>,
    ) -> Result<ResourceRequest, SchedulerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut attempt = 0u32;
        loop {
            let request = match self.requests.get(id) {
                Ok(request) => request,
                Err(e) => return Err(self.abandon(id, e)),
            };
            if request.status != RequestStatus::Pending {
                return settled(request);
            }
            if self.cancel.is_cancelled() {
                return self.withdraw(id, SchedulerError::Cancelled(format!("request {id}")));
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return self.withdraw(id, SchedulerError::Timeout(format!("request {id}")));
            }
            thread::sleep(self.backoff.next_within(attempt, remaining));
            attempt = attempt.saturating_add(1);
        }
    }

    /// Best-effort cleanup after the wait itself failed: withdraw the request,
    /// or hand it back if it was granted meanwhile. Returns `cause`.
    fn abandon(&self, id: RequestId, cause: SchedulerError) -> SchedulerError {
        tracing::warn!("wait on request {} failed: {}", id, cause);
        let cleanup = match self.requests.cancel_if_not_fulfilled(id) {
            Ok(CancelOutcome::AlreadyFulfilled(_)) => self.requests.release(id),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = cleanup {
            tracing::error!("could not withdraw request {}: {}", id, e);
        }
        cause
    }

    /// Withdraw a PENDING request, unless the scheduler granted it first.
    fn withdraw(
        &self,
        id: RequestId,
        reason: SchedulerError,
    ) -> Result<ResourceRequest, SchedulerError> {
        match self.requests.cancel_if_not_fulfilled(id)? {
            CancelOutcome::Canceled => {
                tracing::info!("request {} withdrawn: {}", id, reason);
                Err(reason)
            }
            CancelOutcome::AlreadyFulfilled(request) => {
                if matches!(reason, SchedulerError::Cancelled(_)) {
                    // nobody will hold this grant; hand it straight back
                    self.requests.release(id)?;
                    Err(reason)
                } else {
                    Ok(request)
                }
            }
            CancelOutcome::Other(_) => settled(self.requests.get(id)?),
        }
    }
}

/// Map a non-PENDING request to the client-facing result.
fn settled(request: ResourceRequest) -> Result<ResourceRequest, SchedulerError> {
    match request.status {
        RequestStatus::Fulfilled => Ok(request),
        RequestStatus::Error => Err(SchedulerError::RequestError {
            request: request.id,
            failure: request.error.unwrap_or_else(|| {
                RequestFailure::new(RequestFailureKind::MalformedSpec, "no error payload")
            }),
        }),
        RequestStatus::Canceled => Err(SchedulerError::Cancelled(format!(
            "request {} was canceled by the scheduler",
            request.id
        ))),
        status => Err(SchedulerError::InvalidTransition(format!(
            "request {} is already {status:?}",
            request.id
        ))),
    }
}

/// Granted resources, released on drop.
///
/// Dropping only flags the request for release; [`ResourceGuard::release`]
/// additionally waits until the scheduler has freed the entities.
pub struct ResourceGuard {
    request: ResourceRequest,
    requests: RequestStore,
    backoff: BackoffPolicy,
    release_timeout: Duration,
    released: bool,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("request", &self.request.id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ResourceGuard {
    /// The granted request.
    pub const fn request_id(&self) -> RequestId {
        self.request.id
    }

    /// Per-item allocation, parallel to the submitted items.
    pub fn assigned(&self) -> &[ItemGrant] {
        &self.request.assigned
    }

    /// Device granted for item `index`.
    pub fn device(&self, index: usize) -> Option<&str> {
        self.request
            .assigned
            .get(index)
            .and_then(|g| g.device.as_ref())
            .map(|g| g.name.as_str())
    }

    /// Every granted device, in item order.
    pub fn devices(&self) -> Vec<&str> {
        self.request
            .assigned
            .iter()
            .filter_map(|g| g.device.as_ref())
            .map(|g| g.name.as_str())
            .collect()
    }

    /// Positions granted for item `index` under the prefix as requested.
    pub fn sample_positions(&self, index: usize, prefix: &str) -> Vec<&str> {
        self.request
            .assigned
            .get(index)
            .into_iter()
            .flat_map(|g| g.sample_positions.iter())
            .filter(|pg| pg.prefix == prefix)
            .flat_map(|pg| pg.positions.iter().map(|p| p.name.as_str()))
            .collect()
    }

    /// Every granted sample position, in item order.
    pub fn all_sample_positions(&self) -> Vec<&str> {
        self.request
            .assigned
            .iter()
            .flat_map(|g| g.sample_positions.iter())
            .flat_map(|pg| pg.positions.iter().map(|p| p.name.as_str()))
            .collect()
    }

    /// Release and wait until the scheduler reports RELEASED.
    ///
    /// # Errors
    ///
    /// `Timeout` if the scheduler did not process the release in time.
    pub fn release(mut self) -> Result<(), SchedulerError> {
        self.released = true;
        let id = self.request.id;
        self.requests.release(id)?;
        let deadline = Instant::now() + self.release_timeout;
        let mut attempt = 0u32;
        loop {
            match self.requests.get(id)?.status {
                RequestStatus::Released => return Ok(()),
                RequestStatus::Error => {
                    tracing::warn!("request {} errored while releasing", id);
                    return Ok(());
                }
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SchedulerError::Timeout(format!("release of request {id}")));
            }
            thread::sleep(self.backoff.next_within(attempt, Some(remaining)));
            attempt = attempt.saturating_add(1);
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.requests.release(self.request.id) {
            tracing::error!("releasing request {} on drop failed: {}", self.request.id, e);
        }
    }
}
