//! Configuration Management
//!
//! Defaults live in code. A JSON file can override any subset of fields, and
//! environment variables override both.
//!
//! ## Environment Variables
//!
//! - `LABDIRECTOR_DATABASE_URL`: SQLite database (default: `sqlite://labdirector.db`)
//! - `LABDIRECTOR_IDENTITY`: owner recorded on VM servers (default: `vmserver`)
//! - `LABDIRECTOR_KEEPALIVE_SECS`: keepalive timeout (default: `300`)
//! - `LABDIRECTOR_FAIRNESS`: `allowAny` or `fair` (default: `allowAny`)
//! - `LABDIRECTOR_FAIRNESS_INTERVAL_SECS`: maintenance pass period (default: `30`)
//! - `LABDIRECTOR_BASE_SNAPSHOT`: snapshot new resources start from (default: `clean`)
//! - `LABDIRECTOR_DATASTORE`: hypervisor datastore VMs are cloned into (default: `labdirector`)

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::locks::LockTimeouts;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidValue { var: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "Failed to read config: {}", err),
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::InvalidValue { var, value } => {
                write!(f, "Invalid value '{}' for {}", value, var)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FairnessKind {
    #[default]
    AllowAny,
    Fair,
}

/// Limits on what one VM server may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmCapacity {
    pub max_vms: u32,
    pub max_memory_mb: u32,
    pub max_cpus: u32,
}

impl Default for VmCapacity {
    fn default() -> Self {
        Self {
            max_vms: 20,
            max_memory_mb: 20480,
            max_cpus: 12,
        }
    }
}

/// Durations in config files are whole seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub database_url: String,
    /// Owner name written on blades while they host VMs.
    pub director_identity: String,
    #[serde(with = "secs")]
    pub keep_alive_timeout: Duration,
    #[serde(with = "secs")]
    pub reader_lock_timeout: Duration,
    #[serde(with = "secs")]
    pub writer_lock_timeout: Duration,
    /// How long a cancel-and-wait may take before diagnostics are logged.
    #[serde(with = "secs")]
    pub cancellation_watchdog: Duration,
    #[serde(with = "secs")]
    pub bios_operation_timeout: Duration,
    #[serde(with = "secs")]
    pub vm_deploy_timeout: Duration,
    #[serde(with = "secs")]
    pub boot_poll_interval: Duration,
    #[serde(with = "secs")]
    pub fairness_interval: Duration,
    pub fairness: FairnessKind,
    pub vm_capacity: VmCapacity,
    pub base_snapshot: String,
    pub datastore: String,
    /// VM definition copied onto a server for every new VM.
    pub vm_template: String,
    /// BIOS a blade must carry before it may host VMs.
    pub vm_server_bios: Option<String>,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://labdirector.db".to_string(),
            director_identity: "vmserver".to_string(),
            keep_alive_timeout: Duration::from_secs(5 * 60),
            reader_lock_timeout: Duration::from_secs(30),
            writer_lock_timeout: Duration::from_secs(10),
            cancellation_watchdog: Duration::from_secs(30),
            bios_operation_timeout: Duration::from_secs(10 * 60),
            vm_deploy_timeout: Duration::from_secs(20 * 60),
            boot_poll_interval: Duration::from_secs(5),
            fairness_interval: Duration::from_secs(30),
            fairness: FairnessKind::AllowAny,
            vm_capacity: VmCapacity::default(),
            base_snapshot: "clean".to_string(),
            datastore: "labdirector".to_string(),
            vm_template: "templates/labdirector.vmx".to_string(),
            vm_server_bios: None,
        }
    }
}

impl DirectorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&text).map_err(ConfigError::Parse)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars<F>(mut self, var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("LABDIRECTOR_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(identity) = var("LABDIRECTOR_IDENTITY") {
            self.director_identity = identity;
        }
        if let Some(secs) = var("LABDIRECTOR_KEEPALIVE_SECS") {
            self.keep_alive_timeout = parse_secs("LABDIRECTOR_KEEPALIVE_SECS", &secs)?;
        }
        if let Some(kind) = var("LABDIRECTOR_FAIRNESS") {
            self.fairness = match kind.as_str() {
                "allowAny" => FairnessKind::AllowAny,
                "fair" => FairnessKind::Fair,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "LABDIRECTOR_FAIRNESS".to_string(),
                        value: kind,
                    });
                }
            };
        }
        if let Some(secs) = var("LABDIRECTOR_FAIRNESS_INTERVAL_SECS") {
            self.fairness_interval = parse_secs("LABDIRECTOR_FAIRNESS_INTERVAL_SECS", &secs)?;
        }
        if let Some(snapshot) = var("LABDIRECTOR_BASE_SNAPSHOT") {
            self.base_snapshot = snapshot;
        }
        if let Some(datastore) = var("LABDIRECTOR_DATASTORE") {
            self.datastore = datastore;
        }
        Ok(self)
    }

    pub fn lock_timeouts(&self) -> LockTimeouts {
        LockTimeouts {
            reader: self.reader_lock_timeout,
            writer: self.writer_lock_timeout,
        }
    }
}

fn parse_secs(var: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: DirectorConfig =
            serde_json::from_str(r#"{ "keep_alive_timeout": 60, "fairness": "fair" }"#).unwrap();
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(60));
        assert_eq!(config.fairness, FairnessKind::Fair);
        assert_eq!(config.vm_capacity, VmCapacity::default());
        assert_eq!(config.director_identity, "vmserver");
    }

    #[test]
    fn env_overrides_and_rejects_garbage() {
        let vars: HashMap<&str, &str> = [
            ("LABDIRECTOR_KEEPALIVE_SECS", "42"),
            ("LABDIRECTOR_IDENTITY", "director"),
        ]
        .into_iter()
        .collect();
        let config = DirectorConfig::default()
            .with_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(42));
        assert_eq!(config.director_identity, "director");

        let err = DirectorConfig::default()
            .with_vars(|name| (name == "LABDIRECTOR_FAIRNESS").then(|| "random".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
