//! Core arbitration and scheduling abstractions.

pub mod acknowledgment;
pub mod admission;
pub mod audit;
pub mod client;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod task;

pub use acknowledgment::{AcknowledgmentRecord, AcknowledgmentStatus, AcknowledgmentStore};
pub use admission::{AdmissionReport, Arbiter};
pub use audit::{
    build_audit_event, shared_sink, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
pub use client::{ResourceGuard, ResourceRequester};
pub use error::{AppResult, RequestFailure, RequestFailureKind, SchedulerError};
pub use executor::{
    DeviceCommander, DispatchHandle, DispatchOrder, TaskContext, ThreadExecutor, WorkerExecutor,
};
pub use ledger::{
    DeviceRecord, DeviceStatus, Entity, ResourceLedger, SamplePositionRecord,
    SamplePositionStatus, SlotSpec,
};
pub use registry::{Device, DeviceRegistry, Task, TaskFactory, TaskRegistry};
pub use request::{
    CancelOutcome, DeviceSelector, Grant, ItemGrant, PositionDemand, PositionGrant, RequestItem,
    RequestStatus, RequestStore, ResourceRequest,
};
pub use scheduler::{RecoveryReport, Scheduler, TickReport};
pub use task::{NewTask, TaskRecord, TaskStatus, TaskStore};
