//! Worker execution and device command execution.
//!
//! The scheduler hands READY tasks to a [`WorkerExecutor`]. The bundled
//! [`ThreadExecutor`] runs each task body on its own OS thread so that a body
//! blocked on a resource request never stalls the scheduler or other bodies.
//! Cancellation is cooperative: `abort` trips the task's token and the body's
//! next blocking wait returns `Cancelled`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ClientSettings;
use crate::core::client::{ResourceGuard, ResourceRequester};
use crate::core::ledger::{Entity, ResourceLedger};
use crate::core::registry::{DeviceRegistry, Task, TaskRegistry};
use crate::core::request::{RequestItem, RequestStore};
use crate::core::task::{TaskStatus, TaskStore};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::serde::{Priority, TaskId};

/// Handle returned by a [`WorkerExecutor`] and stored on the task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchHandle {
    /// Executor-specific worker identifier.
    pub worker_id: String,
    /// Dispatch time, ms since epoch.
    pub dispatched_at_ms: u128,
}

/// Everything an executor needs to start a task body.
#[derive(Debug, Clone)]
pub struct DispatchOrder {
    /// Task to run.
    pub task_id: TaskId,
    /// Task type tag.
    pub task_type: String,
    /// Task parameters.
    pub parameters: Value,
    /// Task priority; the default for its resource requests.
    pub priority: Priority,
}

/// Worker-execution collaborator.
pub trait WorkerExecutor: Send + Sync {
    /// Start the body of an INITIATED task.
    fn dispatch(&self, order: DispatchOrder) -> Result<DispatchHandle, SchedulerError>;

    /// Signal a running body to abort. Returns whether a worker was signalled.
    fn abort(&self, task: TaskId) -> bool;

    /// Collect finished workers. Returns the tasks whose workers exited.
    fn reap(&self) -> Vec<TaskId> {
        Vec::new()
    }

    /// Number of workers currently alive.
    fn running(&self) -> usize;

    /// Abort every worker and wait for them to exit.
    fn shutdown(&self) {}
}

/// Runs device commands on behalf of a task, enforcing Ledger ownership.
#[derive(Clone)]
pub struct DeviceCommander {
    ledger: ResourceLedger,
    devices: Arc<DeviceRegistry>,
}

impl DeviceCommander {
    /// Commander over the Ledger and the registered drivers.
    pub const fn new(ledger: ResourceLedger, devices: Arc<DeviceRegistry>) -> Self {
        Self { ledger, devices }
    }

    /// Run `method` on `device` for `task`.
    ///
    /// # Errors
    ///
    /// `OwnershipViolation` unless `task` currently owns `device` in the Ledger.
    pub fn execute(
        &self,
        task: TaskId,
        device: &str,
        method: &str,
        args: &Value,
    ) -> Result<Value, SchedulerError> {
        let entity = Entity::Device(device.to_string());
        if self.ledger.owner_of(&entity)? != Some(task) {
            tracing::warn!("task {} tried to command {} without owning it", task, device);
            return Err(SchedulerError::OwnershipViolation {
                task,
                entity: entity.to_string(),
            });
        }
        let driver = self
            .devices
            .get(device)
            .ok_or_else(|| SchedulerError::NotFound(format!("driver for device `{device}`")))?;
        tracing::debug!("task {} -> {}.{}", task, device, method);
        driver
            .execute(method, args)
            .map_err(|e| SchedulerError::Dispatch(format!("{device}.{method}: {e:#}")))
    }
}

/// What a task body sees while it runs.
pub struct TaskContext {
    task_id: TaskId,
    task_type: String,
    parameters: Value,
    priority: Priority,
    requester: ResourceRequester,
    commander: DeviceCommander,
    ledger: ResourceLedger,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Context for one body run.
    pub fn new(
        order: DispatchOrder,
        requester: ResourceRequester,
        commander: DeviceCommander,
        ledger: ResourceLedger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: order.task_id,
            task_type: order.task_type,
            parameters: order.parameters,
            priority: order.priority,
            requester,
            commander,
            ledger,
            cancel,
        }
    }

    /// Running task.
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Running task's type tag.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Task parameters.
    pub const fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// True once the scheduler asked this body to abort.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the scheduler asked this body to abort.
    pub fn check_cancelled(&self) -> Result<(), SchedulerError> {
        if self.is_cancelled() {
            Err(SchedulerError::Cancelled(format!("task {}", self.task_id)))
        } else {
            Ok(())
        }
    }

    /// The body's cancellation token.
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request resources at the task's own priority.
    pub fn request_resources(
        &self,
        items: Vec<RequestItem>,
        timeout: Option<std::time::Duration>,
    ) -> Result<ResourceGuard, SchedulerError> {
        self.requester.request_resources(items, self.priority, timeout)
    }

    /// Request resources at an explicit priority.
    pub fn request_resources_at(
        &self,
        items: Vec<RequestItem>,
        priority: Priority,
        timeout: Option<std::time::Duration>,
    ) -> Result<ResourceGuard, SchedulerError> {
        self.requester.request_resources(items, priority, timeout)
    }

    /// Run a command on a device this task owns.
    pub fn execute(&self, device: &str, method: &str, args: &Value) -> Result<Value, SchedulerError> {
        self.commander.execute(self.task_id, device, method, args)
    }

    /// Record that `sample` now sits in an owned position.
    pub fn place_sample(&self, position: &str, sample: &str) -> Result<(), SchedulerError> {
        self.ledger.place_sample(position, sample, self.task_id)
    }

    /// Record that an owned position is now empty.
    pub fn remove_sample(&self, position: &str) -> Result<(), SchedulerError> {
        self.ledger.remove_sample(position, self.task_id)
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sends the task id when the body thread exits, panics included.
struct ExitNotice {
    task_id: TaskId,
    tx: Sender<TaskId>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.task_id);
    }
}

/// One OS thread per task body.
pub struct ThreadExecutor {
    registry: Arc<TaskRegistry>,
    tasks: TaskStore,
    requests: RequestStore,
    ledger: ResourceLedger,
    commander: DeviceCommander,
    settings: ClientSettings,
    workers: Mutex<HashMap<TaskId, Worker>>,
    exit_tx: Sender<TaskId>,
    exit_rx: Receiver<TaskId>,
    spawned: AtomicU64,
}

impl ThreadExecutor {
    /// Executor over the lab's stores and registries.
    pub fn new(
        registry: Arc<TaskRegistry>,
        tasks: TaskStore,
        requests: RequestStore,
        ledger: ResourceLedger,
        devices: Arc<DeviceRegistry>,
        settings: ClientSettings,
    ) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        Self {
            registry,
            tasks,
            requests,
            commander: DeviceCommander::new(ledger.clone(), devices),
            ledger,
            settings,
            workers: Mutex::new(HashMap::new()),
            exit_tx,
            exit_rx,
            spawned: AtomicU64::new(0),
        }
    }
}

impl WorkerExecutor for ThreadExecutor {
    fn dispatch(&self, order: DispatchOrder) -> Result<DispatchHandle, SchedulerError> {
        let mut body = self.registry.create(&order.task_type, &order.parameters)?;
        let token = CancellationToken::new();
        let requester = ResourceRequester::new(
            order.task_id,
            self.tasks.clone(),
            self.requests.clone(),
            &self.settings,
            token.clone(),
        );
        let task_id = order.task_id;
        let worker_id = format!(
            "task-{}-{}",
            order.task_type,
            self.spawned.fetch_add(1, Ordering::Relaxed)
        );
        let ctx = TaskContext::new(
            order,
            requester,
            self.commander.clone(),
            self.ledger.clone(),
            token.clone(),
        );
        let tasks = self.tasks.clone();
        let notice = ExitNotice {
            task_id,
            tx: self.exit_tx.clone(),
        };

        // held across spawn so a fast body cannot be reaped before it is tracked
        let mut workers = self.workers.lock();
        let handle = thread::Builder::new()
            .name(worker_id.clone())
            .spawn(move || {
                let _notice = notice;
                run_body(&tasks, body.as_mut(), &ctx);
            })
            .map_err(|e| SchedulerError::Dispatch(format!("spawning worker for {task_id}: {e}")))?;

        workers.insert(task_id, Worker { token, handle });
        drop(workers);
        tracing::debug!("task {} running on {}", task_id, worker_id);
        Ok(DispatchHandle {
            worker_id,
            dispatched_at_ms: now_ms(),
        })
    }

    fn abort(&self, task: TaskId) -> bool {
        self.workers.lock().get(&task).is_some_and(|w| {
            w.token.cancel();
            true
        })
    }

    fn reap(&self) -> Vec<TaskId> {
        let mut reaped = Vec::new();
        for task_id in self.exit_rx.try_iter() {
            let Some(worker) = self.workers.lock().remove(&task_id) else {
                continue;
            };
            if worker.handle.join().is_err() {
                tracing::error!("task {} body panicked", task_id);
                if let Err(e) = self.tasks.fail(task_id, "task body panicked") {
                    tracing::error!("recording panic of task {} failed: {}", task_id, e);
                }
            }
            reaped.push(task_id);
        }
        reaped
    }

    fn running(&self) -> usize {
        self.workers.lock().len()
    }

    fn shutdown(&self) {
        let workers: Vec<(TaskId, Worker)> = self.workers.lock().drain().collect();
        if workers.is_empty() {
            return;
        }
        tracing::info!("aborting {} task workers", workers.len());
        for (_, worker) in &workers {
            worker.token.cancel();
        }
        for (task_id, worker) in workers {
            if worker.handle.join().is_err() {
                tracing::warn!("task {} worker panicked during shutdown", task_id);
            }
        }
    }
}

/// Drive one body from INITIATED to a terminal status.
fn run_body(tasks: &TaskStore, body: &mut dyn Task, ctx: &TaskContext) {
    let id = ctx.task_id();
    match tasks.transition(id, TaskStatus::Initiated, TaskStatus::Running) {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!("task {} left INITIATED before its worker started", id);
            return;
        }
        Err(e) => {
            tracing::error!("starting task {} failed: {}", id, e);
            return;
        }
    }

    let outcome = body.run(ctx);
    let recorded = match outcome {
        Ok(result) => tasks.complete(id, result).map(|()| {
            tracing::info!("task {} completed", id);
        }),
        Err(e) if ctx.is_cancelled() || is_cancellation(&e) => tasks
            .force_terminal(id, TaskStatus::Cancelled, Some(format!("{e:#}")))
            .map(|_| tracing::info!("task {} unwound after cancellation", id)),
        Err(e) => tasks.fail(id, format!("{e:#}")).map(|_| {
            tracing::warn!("task {} failed: {:#}", id, e);
        }),
    };
    if let Err(e) = recorded {
        tracing::warn!("recording outcome of task {} failed: {}", id, e);
    }
}

fn is_cancellation(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::Cancelled(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Device;
    use crate::core::task::NewTask;
    use crate::core::AppResult;
    use crate::infra::store::InMemoryCollection;
    use std::time::Duration;

    struct Oven;

    impl Device for Oven {
        fn name(&self) -> &str {
            "oven_1"
        }
        fn device_type(&self) -> &str {
            "oven"
        }
        fn connect(&self) -> AppResult<()> {
            Ok(())
        }
        fn disconnect(&self) -> AppResult<()> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            false
        }
        fn execute(&self, method: &str, args: &Value) -> AppResult<Value> {
            Ok(serde_json::json!({ "method": method, "args": args }))
        }
    }

    struct Echo;

    impl Task for Echo {
        fn run(&mut self, ctx: &TaskContext) -> AppResult<Value> {
            Ok(ctx.parameters().clone())
        }
    }

    struct Fails;

    impl Task for Fails {
        fn run(&mut self, _ctx: &TaskContext) -> AppResult<Value> {
            anyhow::bail!("scale reading out of range")
        }
    }

    struct WaitsForAbort;

    impl Task for WaitsForAbort {
        fn run(&mut self, ctx: &TaskContext) -> AppResult<Value> {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            ctx.check_cancelled()?;
            Ok(Value::Null)
        }
    }

    struct Fixture {
        tasks: TaskStore,
        ledger: ResourceLedger,
        executor: ThreadExecutor,
    }

    fn fixture() -> Fixture {
        let tasks = TaskStore::new(Arc::new(InMemoryCollection::new("tasks")));
        let requests = RequestStore::new(Arc::new(InMemoryCollection::new("requests"))).unwrap();
        let ledger = ResourceLedger::new(
            Arc::new(InMemoryCollection::new("devices")),
            Arc::new(InMemoryCollection::new("sample_positions")),
        );
        let mut devices = DeviceRegistry::new();
        devices.register(Arc::new(Oven)).unwrap();
        devices.sync_ledger(&ledger).unwrap();
        let mut registry = TaskRegistry::new();
        registry
            .register("Echo", |_| Ok(Box::new(Echo) as Box<dyn Task>))
            .register("Fails", |_| Ok(Box::new(Fails) as Box<dyn Task>))
            .register("WaitsForAbort", |_| Ok(Box::new(WaitsForAbort) as Box<dyn Task>));
        let executor = ThreadExecutor::new(
            Arc::new(registry),
            tasks.clone(),
            requests,
            ledger.clone(),
            Arc::new(devices),
            ClientSettings::default(),
        );
        Fixture {
            tasks,
            ledger,
            executor,
        }
    }

    fn start(f: &Fixture, task_type: &str, params: Value) -> TaskId {
        let id = f.tasks.create_task(NewTask::new(task_type).with_parameters(params.clone())).unwrap();
        assert!(f.tasks.transition(id, TaskStatus::Ready, TaskStatus::Initiated).unwrap());
        f.executor
            .dispatch(DispatchOrder {
                task_id: id,
                task_type: task_type.into(),
                parameters: params,
                priority: Priority::NORMAL,
            })
            .unwrap();
        id
    }

    fn wait_reaped(f: &Fixture, id: TaskId) {
        for _ in 0..500 {
            if f.executor.reap().contains(&id) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("worker for {id} never exited");
    }

    #[test]
    fn test_body_result_completes_task() {
        let f = fixture();
        let id = start(&f, "Echo", serde_json::json!({"temperature": 600}));
        wait_reaped(&f, id);
        let t = f.tasks.get(id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result, Some(serde_json::json!({"temperature": 600})));
        assert_eq!(f.executor.running(), 0);
    }

    #[test]
    fn test_body_error_fails_task() {
        let f = fixture();
        let id = start(&f, "Fails", Value::Null);
        wait_reaped(&f, id);
        let t = f.tasks.get(id).unwrap();
        assert_eq!(t.status, TaskStatus::Error);
        assert!(t.error.unwrap().contains("out of range"));
    }

    #[test]
    fn test_abort_cancels_cooperatively() {
        let f = fixture();
        let id = start(&f, "WaitsForAbort", Value::Null);
        assert!(f.executor.abort(id));
        wait_reaped(&f, id);
        assert_eq!(f.tasks.get(id).unwrap().status, TaskStatus::Cancelled);
        assert!(!f.executor.abort(id));
    }

    #[test]
    fn test_unknown_task_type_is_a_dispatch_error() {
        let f = fixture();
        let err = f
            .executor
            .dispatch(DispatchOrder {
                task_id: TaskId::new(),
                task_type: "Imaging".into(),
                parameters: Value::Null,
                priority: Priority::NORMAL,
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[test]
    fn test_device_commands_require_ownership() {
        let f = fixture();
        let commander = f.executor.commander.clone();
        let owner = TaskId::new();
        let other = TaskId::new();
        f.ledger.occupy(&Entity::Device("oven_1".into()), owner).unwrap();

        let out = commander
            .execute(owner, "oven_1", "heat", &serde_json::json!(600))
            .unwrap();
        assert_eq!(out["method"], "heat");
        assert!(matches!(
            commander.execute(other, "oven_1", "heat", &Value::Null),
            Err(SchedulerError::OwnershipViolation { .. })
        ));
    }
}
