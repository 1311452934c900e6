//! Task-type and device registries.
//!
//! Both are plain objects built once at startup and shared by reference;
//! there is no global lookup table.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::executor::TaskContext;
use crate::core::ledger::{ResourceLedger, SlotSpec};
use crate::core::{AppResult, SchedulerError};

/// A task body.
///
/// A fresh instance is built from the task's parameters for every dispatch.
pub trait Task: Send {
    /// Check parameters before the body runs. Failing here moves the task to
    /// ERROR without touching any resource.
    fn validate(&self) -> AppResult<()> {
        Ok(())
    }

    /// Run the body. Resource requests and device commands go through `ctx`.
    fn run(&mut self, ctx: &TaskContext) -> AppResult<Value>;
}

/// Builds a task body from its parameters.
pub type TaskFactory = Arc<dyn Fn(&Value) -> AppResult<Box<dyn Task>> + Send + Sync>;

/// Task type tag to factory.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `task_type`, replacing any previous one.
    pub fn register<F>(&mut self, task_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> AppResult<Box<dyn Task>> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        tracing::debug!("registered task type {}", task_type);
        self.factories.insert(task_type, Arc::new(factory));
        self
    }

    /// Whether `task_type` is registered.
    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered type tags, sorted.
    pub fn task_types(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build and validate a body for `task_type`.
    pub fn create(&self, task_type: &str, parameters: &Value) -> Result<Box<dyn Task>, SchedulerError> {
        let factory = self
            .factories
            .get(task_type)
            .ok_or_else(|| SchedulerError::NotFound(format!("task type `{task_type}`")))?;
        let task = factory(parameters)
            .map_err(|e| SchedulerError::Validation(format!("{task_type}: {e:#}")))?;
        task.validate()
            .map_err(|e| SchedulerError::Validation(format!("{task_type}: {e:#}")))?;
        Ok(task)
    }
}

/// A controllable piece of hardware.
pub trait Device: Send + Sync {
    /// Unique device name.
    fn name(&self) -> &str;

    /// Type tag used by by-type selectors.
    fn device_type(&self) -> &str;

    /// Free-text description.
    fn description(&self) -> &str {
        ""
    }

    /// Open the connection to the hardware.
    fn connect(&self) -> AppResult<()>;

    /// Close the connection to the hardware.
    fn disconnect(&self) -> AppResult<()>;

    /// Sample-holding slots exposed by the device.
    fn sample_positions(&self) -> Vec<SlotSpec> {
        Vec::new()
    }

    /// Whether the hardware is currently executing something.
    fn is_running(&self) -> bool;

    /// Run `method` with `args`. Callers must hold the device in the Ledger.
    fn execute(&self, method: &str, args: &Value) -> AppResult<Value>;
}

/// Device name to driver.
#[derive(Default, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Arc<dyn Device>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver. Names must be unique and free of `/`.
    pub fn register(&mut self, device: Arc<dyn Device>) -> Result<&mut Self, SchedulerError> {
        let name = device.name().to_string();
        if name.is_empty() || name.contains('/') {
            return Err(SchedulerError::Validation(format!("invalid device name `{name}`")));
        }
        if self.devices.contains_key(&name) {
            return Err(SchedulerError::Validation(format!(
                "device `{name}` registered twice"
            )));
        }
        self.devices.insert(name, device);
        Ok(self)
    }

    /// Look up a driver.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Create or refresh a Ledger row for every device and its positions.
    pub fn sync_ledger(&self, ledger: &ResourceLedger) -> Result<(), SchedulerError> {
        for device in self.devices.values() {
            ledger.register_device(
                device.name(),
                device.device_type(),
                device.description(),
                &device.sample_positions(),
            )?;
        }
        Ok(())
    }

    /// Connect every device, stopping at the first failure.
    pub fn connect_all(&self) -> AppResult<()> {
        for device in self.devices.values() {
            device
                .connect()
                .map_err(|e| e.context(format!("connecting {}", device.name())))?;
            tracing::info!("connected device {}", device.name());
        }
        Ok(())
    }

    /// Disconnect every device, logging failures.
    pub fn disconnect_all(&self) {
        for device in self.devices.values() {
            if let Err(e) = device.disconnect() {
                tracing::warn!("disconnecting {} failed: {:#}", device.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::store::InMemoryCollection;

    struct Noop;

    impl Task for Noop {
        fn run(&mut self, _ctx: &TaskContext) -> AppResult<Value> {
            Ok(Value::Null)
        }
    }

    struct NeedsTemperature;

    impl Task for NeedsTemperature {
        fn validate(&self) -> AppResult<()> {
            anyhow::bail!("temperature missing")
        }

        fn run(&mut self, _ctx: &TaskContext) -> AppResult<Value> {
            Ok(Value::Null)
        }
    }

    struct Furnace;

    impl Device for Furnace {
        fn name(&self) -> &str {
            "furnace_1"
        }
        fn device_type(&self) -> &str {
            "furnace"
        }
        fn connect(&self) -> AppResult<()> {
            Ok(())
        }
        fn disconnect(&self) -> AppResult<()> {
            Ok(())
        }
        fn sample_positions(&self) -> Vec<SlotSpec> {
            vec![SlotSpec::new("tray", 2)]
        }
        fn is_running(&self) -> bool {
            false
        }
        fn execute(&self, method: &str, _args: &Value) -> AppResult<Value> {
            Ok(Value::String(method.into()))
        }
    }

    #[test]
    fn test_task_registry_creates_and_validates() {
        let mut reg = TaskRegistry::new();
        reg.register("Noop", |_| Ok(Box::new(Noop) as Box<dyn Task>))
            .register("Heating", |_| Ok(Box::new(NeedsTemperature) as Box<dyn Task>));
        assert_eq!(reg.task_types(), vec!["Heating".to_string(), "Noop".to_string()]);
        assert!(reg.create("Noop", &Value::Null).is_ok());
        assert!(matches!(
            reg.create("Heating", &Value::Null),
            Err(SchedulerError::Validation(_))
        ));
        assert!(matches!(
            reg.create("Imaging", &Value::Null),
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[test]
    fn test_device_registry_syncs_ledger() {
        let mut reg = DeviceRegistry::new();
        reg.register(Arc::new(Furnace)).unwrap();
        assert!(reg.register(Arc::new(Furnace)).is_err());

        let ledger = ResourceLedger::new(
            Arc::new(InMemoryCollection::new("devices")),
            Arc::new(InMemoryCollection::new("sample_positions")),
        );
        reg.sync_ledger(&ledger).unwrap();
        assert_eq!(ledger.devices_of_type("furnace").unwrap().len(), 1);
        assert_eq!(ledger.count_sample_positions("furnace_1/tray").unwrap(), 2);
        assert!(reg.connect_all().is_ok());
    }
}
