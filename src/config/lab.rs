//! Lab, scheduler, client, and store configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::backoff::BackoffPolicy;

/// Persistence backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// In-process maps; nothing survives a restart.
    InMemory,
    /// One JSON-lines log per collection under `dir`.
    Jsonl {
        /// Directory holding the log files.
        dir: PathBuf,
    },
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        Self::InMemory
    }
}

impl StoreBackendConfig {
    /// Validate backend settings.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::InMemory => Ok(()),
            Self::Jsonl { dir } if dir.as_os_str().is_empty() => {
                Err("jsonl store dir must not be empty".into())
            }
            Self::Jsonl { .. } => Ok(()),
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Milliseconds between ticks.
    pub tick_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

impl SchedulerSettings {
    /// Validate scheduler settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Tick interval as a duration.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Client-side wait and release settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// First polling delay.
    pub poll_initial_ms: u64,
    /// Largest polling delay.
    pub poll_max_ms: u64,
    /// Polling delay growth factor.
    pub poll_factor: f64,
    /// How long a release waits for the scheduler to free entities.
    pub release_timeout_secs: u64,
    /// Request timeout used when the caller passes none; `None` waits forever.
    pub default_request_timeout_secs: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            poll_initial_ms: 100,
            poll_max_ms: 1000,
            poll_factor: 1.5,
            release_timeout_secs: 60,
            default_request_timeout_secs: None,
        }
    }
}

impl ClientSettings {
    /// Validate client settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_initial_ms == 0 {
            return Err("poll_initial_ms must be greater than 0".into());
        }
        if self.poll_max_ms < self.poll_initial_ms {
            return Err("poll_max_ms must be at least poll_initial_ms".into());
        }
        if !self.poll_factor.is_finite() || self.poll_factor < 1.0 {
            return Err("poll_factor must be a finite number >= 1.0".into());
        }
        if self.release_timeout_secs == 0 {
            return Err("release_timeout_secs must be greater than 0".into());
        }
        if self.default_request_timeout_secs == Some(0) {
            return Err("default_request_timeout_secs must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Polling backoff for blocking waits.
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.poll_initial_ms),
            max: Duration::from_millis(self.poll_max_ms),
            factor: self.poll_factor,
        }
    }

    /// Release wait bound.
    pub const fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    /// Default request timeout.
    pub fn default_request_timeout(&self) -> Option<Duration> {
        self.default_request_timeout_secs.map(Duration::from_secs)
    }
}

/// Root lab configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Scheduler loop settings.
    pub scheduler: SchedulerSettings,
    /// Client wait settings.
    pub client: ClientSettings,
    /// Persistence backend.
    pub store: StoreBackendConfig,
    /// Events retained by the in-memory audit sink; 0 disables auditing.
    pub audit_capacity: usize,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            client: ClientSettings::default(),
            store: StoreBackendConfig::default(),
            audit_capacity: 1024,
        }
    }
}

impl LabConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))?;
        self.client
            .validate()
            .map_err(|e| format!("client invalid: {e}"))?;
        self.store
            .validate()
            .map_err(|e| format!("store invalid: {e}"))?;
        Ok(())
    }

    /// Parse lab configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `LAB_*` environment variables, loading a
    /// `.env` file first if one exists. Unset variables keep their defaults.
    ///
    /// Recognized: `LAB_TICK_INTERVAL_MS`, `LAB_POLL_INITIAL_MS`,
    /// `LAB_POLL_MAX_MS`, `LAB_POLL_FACTOR`, `LAB_RELEASE_TIMEOUT_SECS`,
    /// `LAB_REQUEST_TIMEOUT_SECS`, `LAB_STORE_DIR` (selects the JSONL store),
    /// `LAB_AUDIT_CAPACITY`.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LabConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| format!("{key}: cannot parse `{raw}`: {e}"))
        }

        let mut cfg = Self::default();
        if let Some(v) = lookup("LAB_TICK_INTERVAL_MS") {
            cfg.scheduler.tick_interval_ms = parse("LAB_TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("LAB_POLL_INITIAL_MS") {
            cfg.client.poll_initial_ms = parse("LAB_POLL_INITIAL_MS", &v)?;
        }
        if let Some(v) = lookup("LAB_POLL_MAX_MS") {
            cfg.client.poll_max_ms = parse("LAB_POLL_MAX_MS", &v)?;
        }
        if let Some(v) = lookup("LAB_POLL_FACTOR") {
            cfg.client.poll_factor = parse("LAB_POLL_FACTOR", &v)?;
        }
        if let Some(v) = lookup("LAB_RELEASE_TIMEOUT_SECS") {
            cfg.client.release_timeout_secs = parse("LAB_RELEASE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("LAB_REQUEST_TIMEOUT_SECS") {
            cfg.client.default_request_timeout_secs = Some(parse("LAB_REQUEST_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("LAB_STORE_DIR") {
            cfg.store = StoreBackendConfig::Jsonl { dir: v.into() };
        }
        if let Some(v) = lookup("LAB_AUDIT_CAPACITY") {
            cfg.audit_capacity = parse("LAB_AUDIT_CAPACITY", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = LabConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(cfg.client.default_request_timeout(), None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg = LabConfig::from_json_str(
            r#"{"scheduler": {"tick_interval_ms": 50}, "store": {"kind": "jsonl", "dir": "/tmp/lab"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.tick_interval_ms, 50);
        assert_eq!(cfg.client.poll_max_ms, 1000);
        assert_eq!(
            cfg.store,
            StoreBackendConfig::Jsonl {
                dir: PathBuf::from("/tmp/lab")
            }
        );
    }

    #[test]
    fn test_rejects_bad_client_settings() {
        let mut cfg = LabConfig::default();
        cfg.client.poll_factor = 0.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("client invalid"));
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LAB_TICK_INTERVAL_MS", "250"),
            ("LAB_REQUEST_TIMEOUT_SECS", "30"),
            ("LAB_STORE_DIR", "/var/lib/lab"),
        ]
        .into_iter()
        .collect();
        let cfg = LabConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.scheduler.tick_interval_ms, 250);
        assert_eq!(cfg.client.default_request_timeout_secs, Some(30));
        assert!(matches!(cfg.store, StoreBackendConfig::Jsonl { .. }));

        let err = LabConfig::from_lookup(|k| (k == "LAB_POLL_MAX_MS").then(|| "soon".into()));
        assert!(err.is_err());
    }
}
