//! The `Lab` facade: one handle over the stores, registries, and scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::builders::LabParts;
use crate::config::LabConfig;
use crate::core::{
    AcknowledgmentRecord, AcknowledgmentStore, AuditEvent, DeviceRegistry, DeviceStatus, NewTask,
    RecoveryReport, RequestStore, ResourceLedger, ResourceRequester, Scheduler, SchedulerError,
    SharedAuditSink, TaskRecord, TaskRegistry, TaskStore, TickReport,
};
use crate::runtime::runner::SchedulerRunner;
use crate::util::serde::{AcknowledgmentId, TaskId};

/// A running lab.
pub struct Lab {
    config: LabConfig,
    tasks: TaskStore,
    requests: RequestStore,
    ledger: ResourceLedger,
    acknowledgments: AcknowledgmentStore,
    task_registry: Arc<TaskRegistry>,
    device_registry: Arc<DeviceRegistry>,
    scheduler: Arc<Scheduler>,
    audit: Option<SharedAuditSink>,
}

impl std::fmt::Debug for Lab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lab").finish_non_exhaustive()
    }
}

impl Lab {
    pub(crate) fn new(
        config: LabConfig,
        parts: LabParts,
        acknowledgments: AcknowledgmentStore,
        scheduler: Scheduler,
        audit: Option<SharedAuditSink>,
    ) -> Self {
        Self {
            config,
            tasks: parts.tasks,
            requests: parts.requests,
            ledger: parts.ledger,
            acknowledgments,
            task_registry: parts.task_registry,
            device_registry: parts.device_registry,
            scheduler: Arc::new(scheduler),
            audit,
        }
    }

    /// Configuration the lab was built from.
    pub const fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Task Store.
    pub const fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Request store.
    pub const fn requests(&self) -> &RequestStore {
        &self.requests
    }

    /// Resource Ledger.
    pub const fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Acknowledgment store.
    pub const fn acknowledgments(&self) -> &AcknowledgmentStore {
        &self.acknowledgments
    }

    /// Shared scheduler, for runners.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Submit a task of a registered type.
    pub fn submit_task(&self, new: NewTask) -> Result<TaskId, SchedulerError> {
        if !self.task_registry.contains(&new.task_type) {
            return Err(SchedulerError::Validation(format!(
                "unknown task type `{}`",
                new.task_type
            )));
        }
        self.tasks.create_task(new)
    }

    /// Read a task.
    pub fn task(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        self.tasks.get(id)
    }

    /// Ask for a task to be cancelled on the next tick.
    pub fn cancel_task(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.tasks.request_cancel(id)
    }

    /// Orphans waiting for an operator.
    pub fn pending_acknowledgments(&self) -> Result<Vec<AcknowledgmentRecord>, SchedulerError> {
        self.acknowledgments.pending()
    }

    /// Acknowledge an orphan; it is cancelled on the next tick.
    pub fn acknowledge(
        &self,
        id: AcknowledgmentId,
        note: Option<String>,
    ) -> Result<(), SchedulerError> {
        self.acknowledgments.acknowledge(id, note)
    }

    /// Pause a device now or at its next release.
    pub fn pause_device(&self, name: &str) -> Result<DeviceStatus, SchedulerError> {
        self.ledger.request_pause(name)
    }

    /// Resume a paused device.
    pub fn unpause_device(&self, name: &str) -> Result<(), SchedulerError> {
        self.ledger.unpause(name)
    }

    /// A client acting for `task`, for callers outside the worker executor.
    pub fn requester_for(&self, task: TaskId, cancel: CancellationToken) -> ResourceRequester {
        ResourceRequester::new(
            task,
            self.tasks.clone(),
            self.requests.clone(),
            &self.config.client,
            cancel,
        )
    }

    /// Run startup crash recovery.
    pub fn recover(&self) -> Result<RecoveryReport, SchedulerError> {
        self.scheduler.recover()
    }

    /// Run one scheduler tick on the calling thread.
    pub fn tick(&self) -> Result<TickReport, SchedulerError> {
        self.scheduler.tick()
    }

    /// Start the scheduler loop on its own thread at the configured interval.
    pub fn start(&self) -> Result<SchedulerRunner, SchedulerError> {
        SchedulerRunner::start(self.scheduler(), self.config.scheduler.tick_interval())
    }

    /// Start the scheduler loop at an explicit interval.
    pub fn start_with_interval(&self, interval: Duration) -> Result<SchedulerRunner, SchedulerError> {
        SchedulerRunner::start(self.scheduler(), interval)
    }

    /// Audit events retained so far.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit
            .as_ref()
            .map_or_else(Vec::new, |sink| sink.lock().events())
    }

    /// Abort running task bodies and disconnect devices.
    pub fn shutdown(&self) {
        self.scheduler.executor().shutdown();
        self.device_registry.disconnect_all();
        tracing::info!("lab shut down");
    }
}
