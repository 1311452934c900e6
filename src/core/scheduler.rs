//! Scheduler control loop.
//!
//! Each [`Scheduler::tick`] runs four phases in order:
//!
//! 1. cancellation: abort flagged tasks and force them CANCELLED; resolve
//!    orphans an operator has acknowledged
//! 2. releases: free the entities of NEED_RELEASE requests
//! 3. admission: one pass over PENDING requests
//! 4. dispatch: hand READY tasks to the worker executor, exactly once each
//!
//! Ticks and recovery are serialized on an internal lock, so a lab driven by
//! a runner and by manual `tick` calls at once still admits one pass at a time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::acknowledgment::{AcknowledgmentRecord, AcknowledgmentStore};
use crate::core::admission::{AdmissionReport, Arbiter};
use crate::core::audit::{self, SharedAuditSink};
use crate::core::executor::{DispatchOrder, WorkerExecutor};
use crate::core::ledger::ResourceLedger;
use crate::core::request::{CancelOutcome, RequestStatus, RequestStore};
use crate::core::task::{TaskRecord, TaskStatus, TaskStore};
use crate::core::{RequestFailure, RequestFailureKind, SchedulerError};
use crate::util::serde::{AcknowledgmentId, RequestId, TaskId};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Workers collected since the previous tick.
    pub reaped: Vec<TaskId>,
    /// Tasks forced CANCELLED by an operator request.
    pub cancelled: Vec<TaskId>,
    /// Orphans cancelled after acknowledgment.
    pub orphans_resolved: Vec<TaskId>,
    /// Requests moved to RELEASED.
    pub released: Vec<RequestId>,
    /// Admission pass outcome.
    pub admission: AdmissionReport,
    /// Tasks handed to the executor.
    pub dispatched: Vec<TaskId>,
    /// Tasks whose dispatch failed and were moved to ERROR.
    pub dispatch_failed: Vec<TaskId>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// INITIATED tasks reset to READY.
    pub reset: Vec<TaskId>,
    /// Orphans awaiting operator acknowledgment.
    pub orphans: Vec<(TaskId, AcknowledgmentId)>,
}

/// The scheduler loop over the stores and a worker executor.
pub struct Scheduler {
    tasks: TaskStore,
    ledger: ResourceLedger,
    requests: RequestStore,
    acknowledgments: AcknowledgmentStore,
    arbiter: Arbiter,
    executor: Arc<dyn WorkerExecutor>,
    audit: Option<SharedAuditSink>,
    tick_lock: Mutex<()>,
}

impl Scheduler {
    /// Assemble a scheduler.
    pub fn new(
        tasks: TaskStore,
        ledger: ResourceLedger,
        requests: RequestStore,
        acknowledgments: AcknowledgmentStore,
        executor: Arc<dyn WorkerExecutor>,
        audit: Option<SharedAuditSink>,
    ) -> Self {
        let mut arbiter = Arbiter::new(tasks.clone(), ledger.clone(), requests.clone());
        if let Some(sink) = &audit {
            arbiter = arbiter.with_audit(Arc::clone(sink));
        }
        Self {
            tasks,
            ledger,
            requests,
            acknowledgments,
            arbiter,
            executor,
            audit,
            tick_lock: Mutex::new(()),
        }
    }

    /// The worker executor.
    pub fn executor(&self) -> &Arc<dyn WorkerExecutor> {
        &self.executor
    }

    /// Run one tick. Blocks while another tick or recovery is in progress.
    ///
    /// # Errors
    ///
    /// Persistence failures abort the tick; the next tick starts over.
    pub fn tick(&self) -> Result<TickReport, SchedulerError> {
        let _single_writer = self.tick_lock.lock();
        let mut report = TickReport {
            reaped: self.executor.reap(),
            ..TickReport::default()
        };
        report.cancelled = self.propagate_cancellations()?;
        report.orphans_resolved = self.resolve_acknowledged_orphans()?;
        report.released = self.arbiter.process_releases()?;
        report.admission = self.arbiter.admission_pass()?;
        let (dispatched, failed) = self.dispatch_ready()?;
        report.dispatched = dispatched;
        report.dispatch_failed = failed;
        Ok(report)
    }

    fn propagate_cancellations(&self) -> Result<Vec<TaskId>, SchedulerError> {
        let mut cancelled = Vec::new();
        for task in self.tasks.tasks_pending_cancellation()? {
            if task.status.is_active() && !self.executor.abort(task.id) {
                tracing::debug!("task {} has no live worker to abort", task.id);
            }
            if self.tasks.force_terminal(
                task.id,
                TaskStatus::Cancelled,
                Some("cancelled by operator".into()),
            )? {
                tracing::info!("task {} cancelled (was {:?})", task.id, task.status);
                self.audit(Some(task.id), None, "task_cancelled", Some(format!("{:?}", task.status)));
                cancelled.push(task.id);
            }
        }
        Ok(cancelled)
    }

    fn resolve_acknowledged_orphans(&self) -> Result<Vec<TaskId>, SchedulerError> {
        let mut resolved = Vec::new();
        for ack in self.acknowledgments.acknowledged()? {
            self.resolve_orphan(&ack)?;
            if self.acknowledgments.mark_applied(ack.id)? {
                resolved.push(ack.task_id);
            }
        }
        Ok(resolved)
    }

    /// Cancel an acknowledged orphan, fail its open requests, and free
    /// everything it owns.
    fn resolve_orphan(&self, ack: &AcknowledgmentRecord) -> Result<(), SchedulerError> {
        let task = ack.task_id;
        let note = ack.note.as_deref().unwrap_or("no note");
        self.tasks.force_terminal(
            task,
            TaskStatus::Cancelled,
            Some(format!("orphaned by restart; acknowledged: {note}")),
        )?;
        for request in self.requests.open_for_task(task)? {
            self.requests.mark_error(
                request.id,
                RequestFailure::new(
                    RequestFailureKind::Orphaned,
                    format!("task {task} was orphaned by a restart"),
                ),
            )?;
        }
        for entity in self.ledger.owned_by(task)? {
            self.ledger.release(&entity)?;
        }
        tracing::info!("orphaned task {} cancelled after acknowledgment {}", task, ack.id);
        self.audit(Some(task), None, "orphan_resolved", ack.note.clone());
        Ok(())
    }

    fn dispatch_ready(&self) -> Result<(Vec<TaskId>, Vec<TaskId>), SchedulerError> {
        let mut dispatched = Vec::new();
        let mut failed = Vec::new();
        for task in self.tasks.get_ready_tasks()? {
            if !self
                .tasks
                .transition(task.id, TaskStatus::Ready, TaskStatus::Initiated)?
            {
                continue;
            }
            match self.executor.dispatch(order_for(&task)) {
                Ok(handle) => {
                    self.tasks.set_dispatch_handle(task.id, handle.clone())?;
                    tracing::info!("dispatched task {} ({}) to {}", task.id, task.task_type, handle.worker_id);
                    self.audit(Some(task.id), None, "dispatched", Some(handle.worker_id));
                    dispatched.push(task.id);
                }
                Err(e) => {
                    tracing::error!("dispatching task {} failed: {}", task.id, e);
                    self.tasks.fail(task.id, e.to_string())?;
                    self.audit(Some(task.id), None, "dispatch_failed", Some(e.to_string()));
                    failed.push(task.id);
                }
            }
        }
        Ok((dispatched, failed))
    }

    /// Startup recovery.
    ///
    /// INITIATED tasks never touched hardware and go back to READY. RUNNING
    /// and REQUESTING_RESOURCES tasks are orphans: each gets an operator
    /// acknowledgment and keeps what it owns until acknowledged. Their PENDING
    /// requests are withdrawn since no client is waiting on them any more.
    pub fn recover(&self) -> Result<RecoveryReport, SchedulerError> {
        let _single_writer = self.tick_lock.lock();
        let mut report = RecoveryReport::default();
        for task in self.tasks.tasks_with_status(TaskStatus::Initiated)? {
            if self
                .tasks
                .transition(task.id, TaskStatus::Initiated, TaskStatus::Ready)?
            {
                tracing::info!("task {} reset from INITIATED to READY", task.id);
                self.audit(Some(task.id), None, "recovered", Some("reset".into()));
                report.reset.push(task.id);
            }
        }
        for status in [TaskStatus::Running, TaskStatus::RequestingResources] {
            for task in self.tasks.tasks_with_status(status)? {
                for request in self.requests.open_for_task(task.id)? {
                    if request.status == RequestStatus::Pending
                        && matches!(
                            self.requests.cancel_if_not_fulfilled(request.id)?,
                            CancelOutcome::Canceled
                        )
                    {
                        tracing::info!("withdrew pending request {} of orphan {}", request.id, task.id);
                    }
                }
                let ack = self.acknowledgments.raise(task.id, status)?;
                self.audit(Some(task.id), None, "recovered", Some(format!("orphan {ack}")));
                report.orphans.push((task.id, ack));
            }
        }
        if !report.orphans.is_empty() {
            tracing::warn!(
                "{} orphaned tasks are waiting for operator acknowledgment",
                report.orphans.len()
            );
        }
        Ok(report)
    }

    fn audit(
        &self,
        task: Option<TaskId>,
        request: Option<RequestId>,
        action: &str,
        payload: Option<String>,
    ) {
        audit::record(self.audit.as_ref(), task, request, action, payload);
    }
}

fn order_for(task: &TaskRecord) -> DispatchOrder {
    DispatchOrder {
        task_id: task.id,
        task_type: task.task_type.clone(),
        parameters: task.parameters.clone(),
        priority: task.priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::DispatchHandle;
    use crate::core::ledger::{Entity, SlotSpec};
    use crate::core::request::RequestItem;
    use crate::core::task::NewTask;
    use crate::infra::store::InMemoryCollection;
    use crate::util::serde::Priority;

    /// Records dispatches without running anything.
    #[derive(Default)]
    struct RecordingExecutor {
        dispatched: Mutex<Vec<TaskId>>,
        aborted: Mutex<Vec<TaskId>>,
    }

    impl WorkerExecutor for RecordingExecutor {
        fn dispatch(&self, order: DispatchOrder) -> Result<DispatchHandle, SchedulerError> {
            if order.task_type == "Broken" {
                return Err(SchedulerError::Dispatch("no such body".into()));
            }
            self.dispatched.lock().push(order.task_id);
            Ok(DispatchHandle {
                worker_id: format!("w-{}", order.task_id),
                dispatched_at_ms: 0,
            })
        }

        fn abort(&self, task: TaskId) -> bool {
            self.aborted.lock().push(task);
            true
        }

        fn running(&self) -> usize {
            self.dispatched.lock().len()
        }
    }

    struct Fixture {
        tasks: TaskStore,
        ledger: ResourceLedger,
        requests: RequestStore,
        acks: AcknowledgmentStore,
        executor: Arc<RecordingExecutor>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let tasks = TaskStore::new(Arc::new(InMemoryCollection::new("tasks")));
        let ledger = ResourceLedger::new(
            Arc::new(InMemoryCollection::new("devices")),
            Arc::new(InMemoryCollection::new("sample_positions")),
        );
        ledger
            .register_device("furnace_1", "furnace", "", &[SlotSpec::new("tray", 2)])
            .unwrap();
        let requests = RequestStore::new(Arc::new(InMemoryCollection::new("requests"))).unwrap();
        let acks = AcknowledgmentStore::new(Arc::new(InMemoryCollection::new("acknowledgments")));
        let executor = Arc::new(RecordingExecutor::default());
        let scheduler = Scheduler::new(
            tasks.clone(),
            ledger.clone(),
            requests.clone(),
            acks.clone(),
            Arc::clone(&executor) as Arc<dyn WorkerExecutor>,
            None,
        );
        Fixture {
            tasks,
            ledger,
            requests,
            acks,
            executor,
            scheduler,
        }
    }

    #[test]
    fn test_ready_task_dispatched_once() {
        let f = fixture();
        let id = f.tasks.create_task(NewTask::new("Heating")).unwrap();
        let first = f.scheduler.tick().unwrap();
        let second = f.scheduler.tick().unwrap();
        assert_eq!(first.dispatched, vec![id]);
        assert!(second.dispatched.is_empty());
        assert_eq!(*f.executor.dispatched.lock(), vec![id]);
        let t = f.tasks.get(id).unwrap();
        assert_eq!(t.status, TaskStatus::Initiated);
        assert!(t.dispatch_handle.is_some());
    }

    #[test]
    fn test_dispatch_failure_moves_task_to_error() {
        let f = fixture();
        let id = f.tasks.create_task(NewTask::new("Broken")).unwrap();
        let report = f.scheduler.tick().unwrap();
        assert_eq!(report.dispatch_failed, vec![id]);
        assert_eq!(f.tasks.get(id).unwrap().status, TaskStatus::Error);
    }

    #[test]
    fn test_cancellation_aborts_and_cancels_pending_request() {
        let f = fixture();
        let holder = f.tasks.create_task(NewTask::new("Heating")).unwrap();
        f.tasks.update_status(holder, TaskStatus::RequestingResources).unwrap();
        f.ledger.occupy(&Entity::Device("furnace_1".into()), holder).unwrap();

        let task = f.tasks.create_task(NewTask::new("Heating")).unwrap();
        f.tasks.update_status(task, TaskStatus::RequestingResources).unwrap();
        let req = f
            .requests
            .submit(task, vec![RequestItem::device("furnace_1")], Priority::NORMAL)
            .unwrap();
        f.tasks.request_cancel(task).unwrap();

        let report = f.scheduler.tick().unwrap();
        assert_eq!(report.cancelled, vec![task]);
        assert_eq!(report.admission.canceled, vec![req]);
        assert_eq!(*f.executor.aborted.lock(), vec![task]);
        assert_eq!(f.tasks.get(task).unwrap().status, TaskStatus::Cancelled);
        let r = f.requests.get(req).unwrap();
        assert_eq!(r.status, RequestStatus::Canceled);
        assert!(r.assigned.is_empty());
    }

    #[test]
    fn test_recovery_resets_initiated_and_parks_orphans() {
        let f = fixture();
        let initiated = f.tasks.create_task(NewTask::new("Heating")).unwrap();
        f.tasks.update_status(initiated, TaskStatus::Initiated).unwrap();
        let orphan = f.tasks.create_task(NewTask::new("Heating")).unwrap();
        f.tasks.update_status(orphan, TaskStatus::Running).unwrap();
        f.ledger.occupy(&Entity::Device("furnace_1".into()), orphan).unwrap();

        let report = f.scheduler.recover().unwrap();
        assert_eq!(report.reset, vec![initiated]);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(f.tasks.get(initiated).unwrap().status, TaskStatus::Ready);

        // nothing happens to the orphan until acknowledged
        f.scheduler.tick().unwrap();
        assert_eq!(f.tasks.get(orphan).unwrap().status, TaskStatus::Running);
        assert_eq!(
            f.ledger.owner_of(&Entity::Device("furnace_1".into())).unwrap(),
            Some(orphan)
        );

        f.acks.acknowledge(report.orphans[0].1, None).unwrap();
        let tick = f.scheduler.tick().unwrap();
        assert_eq!(tick.orphans_resolved, vec![orphan]);
        assert_eq!(f.tasks.get(orphan).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(
            f.ledger.owner_of(&Entity::Device("furnace_1".into())).unwrap(),
            None
        );
    }
}
