//! Builders to construct a lab from configuration.

use std::sync::Arc;

use crate::config::{ClientSettings, LabConfig, StoreBackendConfig};
use crate::core::{
    shared_sink, AcknowledgmentStore, DeviceRegistry, InMemoryAuditSink, RequestStore,
    ResourceLedger, Scheduler, SchedulerError, TaskRegistry, TaskStore, ThreadExecutor,
    WorkerExecutor,
};
use crate::infra::store::{Collection, InMemoryCollection, JsonlCollection, StoreKey, StoreRecord};
use crate::runtime::Lab;

/// Stores and registries handed to an executor factory.
pub struct LabParts {
    /// Task Store.
    pub tasks: TaskStore,
    /// Request store.
    pub requests: RequestStore,
    /// Resource Ledger.
    pub ledger: ResourceLedger,
    /// Task-type registry.
    pub task_registry: Arc<TaskRegistry>,
    /// Device registry.
    pub device_registry: Arc<DeviceRegistry>,
    /// Client settings for task-side requesters.
    pub client: ClientSettings,
}

/// Open one collection on the configured backend.
pub fn open_collection<K: StoreKey, V: StoreRecord>(
    store: &StoreBackendConfig,
    name: &str,
) -> Result<Arc<dyn Collection<K, V>>, SchedulerError> {
    Ok(match store {
        StoreBackendConfig::InMemory => Arc::new(InMemoryCollection::new(name)),
        StoreBackendConfig::Jsonl { dir } => Arc::new(JsonlCollection::open(dir, name)?),
    })
}

/// Build a lab that runs task bodies on OS threads.
pub fn build_lab(
    cfg: &LabConfig,
    task_registry: TaskRegistry,
    device_registry: DeviceRegistry,
) -> Result<Lab, SchedulerError> {
    build_lab_with(cfg, task_registry, device_registry, |parts| {
        Arc::new(ThreadExecutor::new(
            Arc::clone(&parts.task_registry),
            parts.tasks.clone(),
            parts.requests.clone(),
            parts.ledger.clone(),
            Arc::clone(&parts.device_registry),
            parts.client.clone(),
        ))
    })
}

/// Build a lab with a caller-provided worker executor.
///
/// Opens every collection, registers devices in the Ledger, and connects them.
pub fn build_lab_with<FE>(
    cfg: &LabConfig,
    task_registry: TaskRegistry,
    device_registry: DeviceRegistry,
    executor_factory: FE,
) -> Result<Lab, SchedulerError>
where
    FE: FnOnce(&LabParts) -> Arc<dyn WorkerExecutor>,
{
    cfg.validate()
        .map_err(|e| SchedulerError::Validation(format!("config invalid: {e}")))?;

    let tasks = TaskStore::new(open_collection(&cfg.store, "tasks")?);
    let requests = RequestStore::new(open_collection(&cfg.store, "requests")?)?;
    let ledger = ResourceLedger::new(
        open_collection(&cfg.store, "devices")?,
        open_collection(&cfg.store, "sample_positions")?,
    );
    let acknowledgments = AcknowledgmentStore::new(open_collection(&cfg.store, "acknowledgments")?);

    device_registry.sync_ledger(&ledger)?;
    device_registry
        .connect_all()
        .map_err(|e| SchedulerError::Dispatch(format!("{e:#}")))?;

    let parts = LabParts {
        tasks: tasks.clone(),
        requests: requests.clone(),
        ledger: ledger.clone(),
        task_registry: Arc::new(task_registry),
        device_registry: Arc::new(device_registry),
        client: cfg.client.clone(),
    };
    let executor = executor_factory(&parts);

    let audit = (cfg.audit_capacity > 0).then(|| shared_sink(InMemoryAuditSink::new(cfg.audit_capacity)));
    let scheduler = Scheduler::new(
        tasks,
        ledger,
        requests,
        acknowledgments.clone(),
        executor,
        audit.clone(),
    );
    tracing::info!(
        "lab built: {} task types, {} devices, store {:?}",
        parts.task_registry.task_types().len(),
        parts.device_registry.names().len(),
        cfg.store
    );
    Ok(Lab::new(cfg.clone(), parts, acknowledgments, scheduler, audit))
}
