//! # Lab Arbiter
//!
//! Resource arbitration and task scheduling for an autonomous laboratory.
//!
//! Many heterogeneous devices (furnaces, robot arms, scales, diffractometers)
//! and named sample positions are shared by many concurrently running,
//! multi-step tasks. This crate decides which pending task gets exclusive
//! ownership of which devices and sample positions, runs task bodies as
//! independent workers that block until their resources are granted, and
//! survives crashes and operator cancellations without ever granting one
//! physical resource to two tasks.
//!
//! ## Components
//!
//! - **Task Store** (`core::task`): persisted task records and the dependency DAG
//! - **Resource Ledger** (`core::ledger`): who owns each device and sample position
//! - **Request protocol** (`core::request`, `core::admission`): requests move
//!   PENDING -> FULFILLED -> NEED_RELEASE -> RELEASED, granted all-or-nothing
//!   in (priority, submission) order
//! - **Scheduler** (`core::scheduler`): the single control loop that cancels,
//!   releases, admits, and dispatches once per tick
//! - **Client** (`core::client`): the task-side handle that submits a request
//!   and blocks until it is granted
//!
//! ## Example
//!
//! ```rust,ignore
//! use lab_arbiter::builders::build_lab;
//! use lab_arbiter::config::LabConfig;
//! use lab_arbiter::core::{
//!     AppResult, DeviceRegistry, NewTask, RequestItem, Task, TaskContext, TaskRegistry,
//! };
//! use serde_json::{json, Value};
//!
//! struct Heating;
//!
//! impl Task for Heating {
//!     fn run(&mut self, ctx: &TaskContext) -> AppResult<Value> {
//!         let guard = ctx.request_resources(
//!             vec![RequestItem::device_of_type("furnace").with_positions("$/tray", 4)],
//!             None,
//!         )?;
//!         let furnace = guard.device(0).unwrap_or_default().to_string();
//!         ctx.execute(&furnace, "heat", &json!({ "temperature": 600 }))?;
//!         guard.release()?;
//!         Ok(Value::Null)
//!     }
//! }
//!
//! let mut tasks = TaskRegistry::new();
//! tasks.register("Heating", |_| Ok(Box::new(Heating) as Box<dyn Task>));
//! let mut devices = DeviceRegistry::new();
//! devices.register(my_furnace)?;
//!
//! let lab = build_lab(&LabConfig::from_env()?, tasks, devices)?;
//! lab.recover()?;
//! let runner = lab.start()?;
//! lab.submit_task(NewTask::new("Heating"))?;
//! ```
//!
//! For complete examples, see the integration tests under `tests/`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core arbitration and scheduling abstractions.
pub mod core;
/// Configuration models for the scheduler, clients, and storage backends.
pub mod config;
/// Builders to construct a lab from configuration.
pub mod builders;
/// Infrastructure adapters for persistence backends.
pub mod infra;
/// Runtime adapters, the `Lab` facade, and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
