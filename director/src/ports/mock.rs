//! Mock ports for testing.
//!
//! [`MockPorts`] implements every port at once, records what was called so
//! tests can assert on it, and fails on demand via [`MockPortConfig`]. BIOS
//! commands take [`MockPortConfig::bios_delay`] and honour the deadline, which
//! is how tests exercise cancellation of long operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{BootMenu, Command, Hypervisor, Nas, PortError, Ports};
use crate::cancel::Deadline;

// ─── Configuration for failure injection ──────────────────────────────────

/// Controls which operations should fail in the mock.
/// All default to `None` (success).
#[derive(Debug, Clone, Default)]
pub struct MockPortConfig {
    /// If set, `power_on()` returns this error
    pub power_on_error: Option<String>,
    /// If set, `connect()` never succeeds
    pub connect_error: Option<String>,
    /// If set, `execute()` of a command with this name fails with the message
    pub execute_error: Option<(String, String)>,
    /// If set, `create_clone()` returns this error
    pub clone_error: Option<String>,
    /// If set, `restore_snapshot()` returns this error
    pub restore_error: Option<String>,
    /// If set, `notify()` returns this error
    pub boot_menu_error: Option<String>,
    /// Failed `connect()` calls after a power-on before the host answers
    pub boot_polls: usize,
    /// How long BIOS reads and writes take
    pub bios_delay: Duration,
}

// ─── Call tracker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockCallTracker {
    pub connects: Arc<AtomicUsize>,
    pub power_ons: Arc<AtomicUsize>,
    pub power_offs: Arc<AtomicUsize>,
    pub executes: Arc<AtomicUsize>,
    pub copies: Arc<AtomicUsize>,
    pub restores: Arc<AtomicUsize>,
    pub clones: Arc<AtomicUsize>,
    pub clone_deletes: Arc<AtomicUsize>,
    pub snapshots: Arc<AtomicUsize>,
    pub exports: Arc<AtomicUsize>,
    pub notifications: Arc<AtomicUsize>,
    /// `(host, command name)` in call order
    pub commands: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn power_on_count(&self) -> usize {
        self.power_ons.load(Ordering::Relaxed)
    }

    pub fn power_off_count(&self) -> usize {
        self.power_offs.load(Ordering::Relaxed)
    }

    pub fn execute_count(&self) -> usize {
        self.executes.load(Ordering::Relaxed)
    }

    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::Relaxed)
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::Relaxed)
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::Relaxed)
    }

    pub fn clone_delete_count(&self) -> usize {
        self.clone_deletes.load(Ordering::Relaxed)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::Relaxed)
    }

    pub fn export_count(&self) -> usize {
        self.exports.load(Ordering::Relaxed)
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }

    /// Names of the commands run on `host`, in order.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

// ─── Mock ports ───────────────────────────────────────────────────────────

pub struct MockPorts {
    tracker: MockCallTracker,
    config: MockPortConfig,
    /// BIOS each host currently carries
    bios: Mutex<HashMap<String, String>>,
    /// Remaining failed connects per host since its last power-on
    booting: Mutex<HashMap<String, usize>>,
}

impl MockPorts {
    pub fn new(config: MockPortConfig) -> Arc<Self> {
        Arc::new(Self {
            tracker: MockCallTracker::new(),
            config,
            bios: Mutex::new(HashMap::new()),
            booting: Mutex::new(HashMap::new()),
        })
    }

    pub fn tracker(&self) -> &MockCallTracker {
        &self.tracker
    }

    /// The BIOS a host would report.
    pub fn bios_of(&self, host: &str) -> Option<String> {
        self.bios.lock().get(host).cloned()
    }

    pub fn set_bios(&self, host: &str, config: &str) {
        self.bios.lock().insert(host.to_string(), config.to_string());
    }

    pub fn ports(self: &Arc<Self>) -> Ports {
        Ports {
            hypervisor: self.clone(),
            nas: self.clone(),
            boot_menu: self.clone(),
        }
    }
}

impl Hypervisor for MockPorts {
    fn connect(&self, host: &str) -> Result<(), PortError> {
        self.tracker.connects.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.connect_error {
            return Err(PortError::Failed(e.clone()));
        }
        let mut booting = self.booting.lock();
        match booting.get_mut(host) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(PortError::Failed(format!("{} is still booting", host)))
            }
            _ => Ok(()),
        }
    }

    fn power_on(&self, host: &str) -> Result<(), PortError> {
        self.tracker.power_ons.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.power_on_error {
            return Err(PortError::Failed(e.clone()));
        }
        self.booting
            .lock()
            .insert(host.to_string(), self.config.boot_polls);
        Ok(())
    }

    fn power_off(&self, _host: &str) -> Result<(), PortError> {
        self.tracker.power_offs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute(&self, host: &str, command: &Command, deadline: &Deadline) -> Result<String, PortError> {
        self.tracker.executes.fetch_add(1, Ordering::Relaxed);
        self.tracker
            .commands
            .lock()
            .push((host.to_string(), command.name().to_string()));

        if let Some((ref name, ref e)) = self.config.execute_error {
            if name == command.name() {
                return Err(PortError::Failed(e.clone()));
            }
        }

        match command {
            Command::ReadBios => {
                deadline.sleep(self.config.bios_delay)?;
                Ok(self.bios_of(host).unwrap_or_default())
            }
            Command::WriteBios { config } => {
                deadline.sleep(self.config.bios_delay)?;
                self.set_bios(host, config);
                Ok(String::new())
            }
            _ => {
                deadline.check()?;
                Ok(String::new())
            }
        }
    }

    fn copy_file(&self, _host: &str, _source: &str, _destination: &str) -> Result<(), PortError> {
        self.tracker.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn restore_snapshot(&self, _host: &str, _snapshot: &str) -> Result<(), PortError> {
        self.tracker.restores.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.restore_error {
            return Err(PortError::Failed(e.clone()));
        }
        Ok(())
    }
}

impl Nas for MockPorts {
    fn create_clone(&self, _snapshot: &str, _clone: &str) -> Result<(), PortError> {
        self.tracker.clones.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.clone_error {
            return Err(PortError::Failed(e.clone()));
        }
        Ok(())
    }

    fn delete_clone(&self, _clone: &str) -> Result<(), PortError> {
        self.tracker.clone_deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn snapshot(&self, _clone: &str, _name: &str) -> Result<(), PortError> {
        self.tracker.snapshots.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn export_iscsi(&self, _clone: &str, _initiator: &str) -> Result<(), PortError> {
        self.tracker.exports.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl BootMenu for MockPorts {
    fn notify(&self, _resource: &str, _owner: &str) -> Result<(), PortError> {
        self.tracker.notifications.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.boot_menu_error {
            return Err(PortError::Failed(e.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_answers_after_configured_polls() {
        let mock = MockPorts::new(MockPortConfig {
            boot_polls: 2,
            ..Default::default()
        });
        mock.power_on("1.1.1.1").unwrap();
        assert!(mock.connect("1.1.1.1").is_err());
        assert!(mock.connect("1.1.1.1").is_err());
        assert!(mock.connect("1.1.1.1").is_ok());
        assert_eq!(mock.tracker().connect_count(), 3);
    }

    #[test]
    fn bios_write_is_cancellable() {
        let mock = MockPorts::new(MockPortConfig {
            bios_delay: Duration::from_secs(300),
            ..Default::default()
        });
        let deadline = Deadline::never();
        deadline.cancel();
        let err = mock
            .execute(
                "1.1.1.1",
                &Command::WriteBios {
                    config: "<bios/>".into(),
                },
                &deadline,
            )
            .unwrap_err();
        assert_eq!(err, PortError::Cancelled);
        assert_eq!(mock.bios_of("1.1.1.1"), None);
        assert_eq!(mock.tracker().commands_on("1.1.1.1"), vec!["writeBios"]);
    }
}
