//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use lab_arbiter::config::{ClientSettings, LabConfig};
use lab_arbiter::core::{
    AcknowledgmentStore, AppResult, Arbiter, Device, DeviceRegistry, DispatchHandle,
    DispatchOrder, RequestItem, RequestStore, ResourceLedger, SchedulerError, SlotSpec, Task,
    TaskContext, TaskRegistry, TaskStatus, TaskStore, WorkerExecutor,
};
use lab_arbiter::core::NewTask;
use lab_arbiter::infra::InMemoryCollection;
use lab_arbiter::util::telemetry::init_tracing;
use lab_arbiter::util::serde::TaskId;

// ============================================================================
// STORES
// ============================================================================

/// In-memory stores wired together.
pub struct Stores {
    pub tasks: TaskStore,
    pub ledger: ResourceLedger,
    pub requests: RequestStore,
    pub acknowledgments: AcknowledgmentStore,
}

impl Stores {
    pub fn arbiter(&self) -> Arbiter {
        Arbiter::new(self.tasks.clone(), self.ledger.clone(), self.requests.clone())
    }

    /// A task parked in REQUESTING_RESOURCES, as a blocked body would be.
    pub fn requesting_task(&self) -> TaskId {
        let id = self.tasks.create_task(NewTask::new("Heating")).unwrap();
        self.tasks
            .update_status(id, TaskStatus::RequestingResources)
            .unwrap();
        id
    }

    /// A task in RUNNING, ready to use a requester.
    pub fn running_task(&self) -> TaskId {
        let id = self.tasks.create_task(NewTask::new("Heating")).unwrap();
        self.tasks.update_status(id, TaskStatus::Running).unwrap();
        id
    }

    /// (name, status, owner) for every Ledger row, ignoring timestamps.
    pub fn ledger_state(&self) -> Vec<(String, String, Option<TaskId>)> {
        let mut rows: Vec<_> = self
            .ledger
            .devices()
            .unwrap()
            .into_iter()
            .map(|d| (d.name, format!("{:?}", d.status), d.owner))
            .collect();
        rows.extend(
            self.ledger
                .sample_positions()
                .unwrap()
                .into_iter()
                .map(|p| (p.name, format!("{:?}", p.status), p.owner)),
        );
        rows
    }
}

/// Empty in-memory stores.
pub fn empty_stores() -> Stores {
    Stores {
        tasks: TaskStore::new(Arc::new(InMemoryCollection::new("tasks"))),
        ledger: ResourceLedger::new(
            Arc::new(InMemoryCollection::new("devices")),
            Arc::new(InMemoryCollection::new("sample_positions")),
        ),
        requests: RequestStore::new(Arc::new(InMemoryCollection::new("requests"))).unwrap(),
        acknowledgments: AcknowledgmentStore::new(Arc::new(InMemoryCollection::new(
            "acknowledgments",
        ))),
    }
}

/// Two furnaces with four-position trays, one robot arm, and a storage rack.
pub fn lab_stores() -> Stores {
    let s = empty_stores();
    s.ledger
        .register_device("furnace_1", "furnace", "box furnace", &[SlotSpec::new("tray", 4)])
        .unwrap();
    s.ledger
        .register_device("furnace_2", "furnace", "box furnace", &[SlotSpec::new("tray", 4)])
        .unwrap();
    s.ledger
        .register_device("robot_arm", "robot_arm", "", &[])
        .unwrap();
    for i in 1..=8 {
        s.ledger
            .register_sample_position(&format!("storage/rack/{i}"), None, "")
            .unwrap();
    }
    s
}

/// Fast polling so tests do not sleep for long.
pub fn fast_client() -> ClientSettings {
    ClientSettings {
        poll_initial_ms: 2,
        poll_max_ms: 20,
        poll_factor: 1.5,
        release_timeout_secs: 5,
        default_request_timeout_secs: None,
    }
}

/// Lab config with a fast tick. Also installs the log subscriber; set
/// `RUST_LOG=lab_arbiter=debug` to see scheduler decisions.
pub fn fast_config() -> LabConfig {
    init_tracing();
    let mut cfg = LabConfig::default();
    cfg.scheduler.tick_interval_ms = 10;
    cfg.client = fast_client();
    cfg
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// DEVICES
// ============================================================================

/// Device that records the commands it receives.
pub struct FakeDevice {
    pub name: String,
    pub device_type: String,
    pub slots: Vec<SlotSpec>,
    pub commands: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn new(name: &str, device_type: &str, slots: Vec<SlotSpec>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            device_type: device_type.into(),
            slots,
            commands: Mutex::new(Vec::new()),
        })
    }
}

impl Device for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }
    fn device_type(&self) -> &str {
        &self.device_type
    }
    fn connect(&self) -> AppResult<()> {
        Ok(())
    }
    fn disconnect(&self) -> AppResult<()> {
        Ok(())
    }
    fn sample_positions(&self) -> Vec<SlotSpec> {
        self.slots.clone()
    }
    fn is_running(&self) -> bool {
        false
    }
    fn execute(&self, method: &str, _args: &Value) -> AppResult<Value> {
        self.commands.lock().push(method.to_string());
        Ok(json!({ "ok": true }))
    }
}

pub fn device_registry(devices: &[Arc<FakeDevice>]) -> DeviceRegistry {
    let mut reg = DeviceRegistry::new();
    for d in devices {
        reg.register(Arc::clone(d) as Arc<dyn Device>).unwrap();
    }
    reg
}

// ============================================================================
// TASK BODIES
// ============================================================================

/// Returns immediately.
pub struct Noop;

impl Task for Noop {
    fn run(&mut self, _ctx: &TaskContext) -> AppResult<Value> {
        Ok(json!("done"))
    }
}

/// Always fails.
pub struct Fails;

impl Task for Fails {
    fn run(&mut self, _ctx: &TaskContext) -> AppResult<Value> {
        anyhow::bail!("crucible cracked")
    }
}

/// Claims any furnace plus two tray positions, heats, then releases.
pub struct Heating;

impl Task for Heating {
    fn run(&mut self, ctx: &TaskContext) -> AppResult<Value> {
        let guard = ctx.request_resources(
            vec![RequestItem::device_of_type("furnace").with_positions("$/tray", 2)],
            None,
        )?;
        let furnace = guard
            .device(0)
            .ok_or_else(|| anyhow::anyhow!("no furnace granted"))?
            .to_string();
        let positions: Vec<String> = guard
            .sample_positions(0, "$/tray")
            .into_iter()
            .map(str::to_string)
            .collect();
        ctx.execute(&furnace, "heat", &json!({ "temperature": 600 }))?;
        guard.release()?;
        Ok(json!({ "furnace": furnace, "positions": positions }))
    }
}

pub fn task_registry() -> TaskRegistry {
    let mut reg = TaskRegistry::new();
    reg.register("Noop", |_| Ok(Box::new(Noop) as Box<dyn Task>))
        .register("Fails", |_| Ok(Box::new(Fails) as Box<dyn Task>))
        .register("Heating", |_| Ok(Box::new(Heating) as Box<dyn Task>));
    reg
}

// ============================================================================
// EXECUTORS
// ============================================================================

/// Counts dispatches and runs nothing.
#[derive(Default)]
pub struct CountingExecutor {
    pub dispatched: Mutex<Vec<TaskId>>,
}

impl WorkerExecutor for CountingExecutor {
    fn dispatch(&self, order: DispatchOrder) -> Result<DispatchHandle, SchedulerError> {
        self.dispatched.lock().push(order.task_id);
        Ok(DispatchHandle {
            worker_id: format!("counting-{}", order.task_id),
            dispatched_at_ms: 0,
        })
    }

    fn abort(&self, _task: TaskId) -> bool {
        false
    }

    fn running(&self) -> usize {
        0
    }
}
