//! Configuration models for the scheduler, clients, and storage backends.

pub mod lab;

pub use lab::{ClientSettings, LabConfig, SchedulerSettings, StoreBackendConfig};
