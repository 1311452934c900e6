//! Task Store and dependency DAG.
//!
//! Tasks are persisted records linked by predecessor/successor edges. A task
//! becomes READY only once every predecessor is COMPLETED; promotion happens
//! eagerly when a predecessor completes and always re-reads the predecessors'
//! current statuses, so sibling predecessors completing at the same time
//! cannot both miss (or both perform) the promotion. ERROR and CANCELLED never
//! propagate readiness: their dependents stay WAITING.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::executor::DispatchHandle;
use crate::core::SchedulerError;
use crate::infra::store::{Collection, Conditional};
use crate::util::clock::now_ms;
use crate::util::serde::{Priority, TaskId};

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Blocked on predecessors.
    Waiting,
    /// All predecessors completed; eligible for dispatch.
    Ready,
    /// Handed to a worker that has not started the body yet.
    Initiated,
    /// Body is blocked on a resource request.
    RequestingResources,
    /// Body is executing.
    Running,
    /// Body failed.
    Error,
    /// Cancelled by an operator or by crash recovery.
    Cancelled,
    /// Body finished successfully.
    Completed,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// A worker is (or may be) executing the body.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initiated | Self::RequestingResources | Self::Running
        )
    }
}

/// A persisted task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier.
    pub id: TaskId,
    /// Task type tag, resolved through the task registry.
    pub task_type: String,
    /// Current status.
    pub status: TaskStatus,
    /// Tasks that must complete first.
    pub prev_tasks: Vec<TaskId>,
    /// Tasks waiting on this one.
    pub next_tasks: Vec<TaskId>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Opaque parameters handed to the task body.
    pub parameters: serde_json::Value,
    /// Handle returned by the worker-execution collaborator.
    pub dispatch_handle: Option<DispatchHandle>,
    /// Set when an operator asked for cancellation.
    pub cancel_requested: bool,
    /// Value returned by a completed body.
    pub result: Option<serde_json::Value>,
    /// Error message of a failed body.
    pub error: Option<String>,
    /// Creation time, ms since epoch.
    pub created_at_ms: u128,
    /// Last modification time, ms since epoch.
    pub updated_at_ms: u128,
}

/// Parameters for [`TaskStore::create_task`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Task type tag.
    pub task_type: String,
    /// Opaque parameters.
    pub parameters: serde_json::Value,
    /// Dispatch priority.
    pub priority: Priority,
    /// Existing tasks this one waits on.
    pub prev_tasks: Vec<TaskId>,
    /// Existing tasks that must wait on this one.
    pub next_tasks: Vec<TaskId>,
}

impl NewTask {
    /// A task of `task_type` with no parameters or edges.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            parameters: serde_json::Value::Null,
            ..Self::default()
        }
    }

    /// Set the parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add predecessors.
    #[must_use]
    pub fn after(mut self, prev: impl IntoIterator<Item = TaskId>) -> Self {
        self.prev_tasks.extend(prev);
        self
    }

    /// Add successors.
    #[must_use]
    pub fn before(mut self, next: impl IntoIterator<Item = TaskId>) -> Self {
        self.next_tasks.extend(next);
        self
    }
}

fn push_unique(list: &mut Vec<TaskId>, id: TaskId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// Task Store over a persistence [`Collection`].
#[derive(Clone)]
pub struct TaskStore {
    tasks: Arc<dyn Collection<TaskId, TaskRecord>>,
}

impl TaskStore {
    /// Wrap a collection.
    pub fn new(tasks: Arc<dyn Collection<TaskId, TaskRecord>>) -> Self {
        Self { tasks }
    }

    /// Create a task, link its edges on both ends, and promote it to READY if
    /// it has no unfinished predecessors.
    ///
    /// Successors must still be WAITING or READY; a READY successor is moved
    /// back to WAITING because it gained an unfinished predecessor.
    pub fn create_task(&self, new: NewTask) -> Result<TaskId, SchedulerError> {
        let id = TaskId::new();
        let mut prev_tasks = Vec::new();
        for p in new.prev_tasks {
            push_unique(&mut prev_tasks, p);
        }
        let mut next_tasks = Vec::new();
        for n in new.next_tasks {
            push_unique(&mut next_tasks, n);
        }
        if prev_tasks.iter().any(|p| next_tasks.contains(p)) {
            return Err(SchedulerError::Validation(
                "a task cannot be both predecessor and successor".into(),
            ));
        }
        for p in &prev_tasks {
            self.get(*p)?;
        }
        for n in &next_tasks {
            let succ = self.get(*n)?;
            if !matches!(succ.status, TaskStatus::Waiting | TaskStatus::Ready) {
                return Err(SchedulerError::InvalidTransition(format!(
                    "successor {n} is already {:?}",
                    succ.status
                )));
            }
        }

        let now = now_ms();
        let record = TaskRecord {
            id,
            task_type: new.task_type,
            status: TaskStatus::Waiting,
            prev_tasks: prev_tasks.clone(),
            next_tasks: next_tasks.clone(),
            priority: new.priority,
            parameters: new.parameters,
            dispatch_handle: None,
            cancel_requested: false,
            result: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.tasks.insert(id, record)?;

        for p in &prev_tasks {
            self.tasks
                .update_if(p, &|_| true, &mut |t| push_unique(&mut t.next_tasks, id))?;
        }
        for n in &next_tasks {
            let outcome = self.tasks.update_if(
                n,
                &|t| matches!(t.status, TaskStatus::Waiting | TaskStatus::Ready),
                &mut |t| {
                    push_unique(&mut t.prev_tasks, id);
                    t.status = TaskStatus::Waiting;
                    t.updated_at_ms = now_ms();
                },
            )?;
            if !outcome.is_applied() {
                tracing::warn!("successor {} left the waiting states while linking {}", n, id);
            }
        }

        self.mark_ready_if_eligible(id)?;
        tracing::info!("created task {}", id);
        Ok(id)
    }

    /// Read one task.
    pub fn get(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        self.tasks
            .get(&id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("task {id}")))
    }

    /// READY tasks, highest priority first, then oldest first.
    pub fn get_ready_tasks(&self) -> Result<Vec<TaskRecord>, SchedulerError> {
        let mut ready = self.tasks_with_status(TaskStatus::Ready)?;
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
        });
        Ok(ready)
    }

    /// All tasks currently in `status`.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, SchedulerError> {
        self.tasks.find(&|t| t.status == status)
    }

    /// Non-terminal tasks flagged for cancellation.
    pub fn tasks_pending_cancellation(&self) -> Result<Vec<TaskRecord>, SchedulerError> {
        self.tasks
            .find(&|t| t.cancel_requested && !t.status.is_terminal())
    }

    /// Set a task's status.
    ///
    /// Terminal statuses are final. READY is only granted when every
    /// predecessor is COMPLETED. Reaching COMPLETED promotes eligible
    /// successors before returning.
    pub fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<(), SchedulerError> {
        if status == TaskStatus::Ready {
            let task = self.get(id)?;
            if !self.predecessors_completed(&task)? {
                return Err(SchedulerError::InvalidTransition(format!(
                    "task {id} has unfinished predecessors"
                )));
            }
        }
        let outcome = self.tasks.update_if(
            &id,
            &|t| !t.status.is_terminal() || t.status == status,
            &mut |t| {
                t.status = status;
                t.updated_at_ms = now_ms();
            },
        )?;
        match outcome {
            Conditional::Applied(task) => {
                tracing::debug!("task {} -> {:?}", id, status);
                if status == TaskStatus::Completed {
                    self.promote_successors(&task)?;
                }
                Ok(())
            }
            Conditional::Rejected(task) => Err(SchedulerError::InvalidTransition(format!(
                "task {id} is {:?}, cannot become {status:?}",
                task.status
            ))),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("task {id}"))),
        }
    }

    /// Move a task from `from` to `to` only if it is still in `from`.
    ///
    /// Returns `false` when the task was no longer in `from`.
    pub fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, SchedulerError> {
        let outcome = self.tasks.update_if(&id, &|t| t.status == from, &mut |t| {
            t.status = to;
            t.updated_at_ms = now_ms();
        })?;
        match outcome {
            Conditional::Applied(task) => {
                if to == TaskStatus::Completed {
                    self.promote_successors(&task)?;
                }
                Ok(true)
            }
            Conditional::Rejected(_) => Ok(false),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("task {id}"))),
        }
    }

    /// Promote a WAITING task to READY if all predecessors are COMPLETED.
    ///
    /// Returns whether this call performed the promotion.
    pub fn mark_ready_if_eligible(&self, id: TaskId) -> Result<bool, SchedulerError> {
        let task = self.get(id)?;
        if task.status != TaskStatus::Waiting || !self.predecessors_completed(&task)? {
            return Ok(false);
        }
        let promoted = self.transition(id, TaskStatus::Waiting, TaskStatus::Ready)?;
        if promoted {
            tracing::info!("task {} is ready", id);
        }
        Ok(promoted)
    }

    fn predecessors_completed(&self, task: &TaskRecord) -> Result<bool, SchedulerError> {
        for p in &task.prev_tasks {
            if self.get(*p)?.status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn promote_successors(&self, task: &TaskRecord) -> Result<(), SchedulerError> {
        for next in &task.next_tasks {
            self.mark_ready_if_eligible(*next)?;
        }
        Ok(())
    }

    /// Flag a task for cancellation; the scheduler applies it next tick.
    pub fn request_cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        match self
            .tasks
            .update_if(&id, &|t| !t.status.is_terminal(), &mut |t| {
                t.cancel_requested = true;
                t.updated_at_ms = now_ms();
            })? {
            Conditional::Applied(_) => {
                tracing::info!("cancellation requested for task {}", id);
                Ok(())
            }
            Conditional::Rejected(t) => Err(SchedulerError::InvalidTransition(format!(
                "task {id} already {:?}",
                t.status
            ))),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("task {id}"))),
        }
    }

    /// Force a non-terminal task into a terminal status.
    ///
    /// Returns `false` if the task was already terminal.
    pub fn force_terminal(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<bool, SchedulerError> {
        debug_assert!(status.is_terminal());
        let outcome = self
            .tasks
            .update_if(&id, &|t| !t.status.is_terminal(), &mut |t| {
                t.status = status;
                if error.is_some() {
                    t.error.clone_from(&error);
                }
                t.updated_at_ms = now_ms();
            })?;
        match outcome {
            Conditional::Applied(task) => {
                if status == TaskStatus::Completed {
                    self.promote_successors(&task)?;
                }
                Ok(true)
            }
            Conditional::Rejected(_) => Ok(false),
            Conditional::Missing => Err(SchedulerError::NotFound(format!("task {id}"))),
        }
    }

    /// Record the worker dispatch handle.
    pub fn set_dispatch_handle(
        &self,
        id: TaskId,
        handle: DispatchHandle,
    ) -> Result<(), SchedulerError> {
        self.tasks.update_if(&id, &|_| true, &mut |t| {
            t.dispatch_handle = Some(handle.clone());
            t.updated_at_ms = now_ms();
        })?;
        Ok(())
    }

    /// Record a completed body's result and complete the task.
    pub fn complete(&self, id: TaskId, result: serde_json::Value) -> Result<(), SchedulerError> {
        self.tasks.update_if(&id, &|t| !t.status.is_terminal(), &mut |t| {
            t.result = Some(result.clone());
        })?;
        self.update_status(id, TaskStatus::Completed)
    }

    /// Record a failure message and move the task to ERROR.
    pub fn fail(&self, id: TaskId, message: impl Into<String>) -> Result<bool, SchedulerError> {
        self.force_terminal(id, TaskStatus::Error, Some(message.into()))
    }
}
