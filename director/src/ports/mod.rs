//! External collaborators.
//!
//! The director drives hardware through three narrow ports: a hypervisor /
//! out-of-band controller, the NAS that backs iSCSI boot disks, and the boot
//! menu that learns about new owners. All calls are blocking; the long ones
//! take a [`Deadline`] so a release can interrupt them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::{Deadline, Interrupted};

pub mod mock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// No adapter is configured for this port.
    Unavailable,
    Failed(String),
    Cancelled,
    TimedOut,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::Unavailable => write!(f, "no adapter configured"),
            PortError::Failed(msg) => write!(f, "{}", msg),
            PortError::Cancelled => write!(f, "cancelled"),
            PortError::TimedOut => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for PortError {}

impl From<Interrupted> for PortError {
    fn from(why: Interrupted) -> Self {
        match why {
            Interrupted::Cancelled => PortError::Cancelled,
            Interrupted::Expired => PortError::TimedOut,
        }
    }
}

/// Commands run on a blade's management OS or out-of-band controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    ReadBios,
    WriteBios { config: String },
    MountDatastore { datastore: String, nas_ip: String },
    RegisterVm {
        name: String,
        datastore: String,
        memory_mb: u32,
        cpu_count: u32,
        eth0_mac: String,
        eth1_mac: String,
    },
    PowerOnVm { name: String },
    PowerOffVm { name: String },
    UnregisterVm { name: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadBios => "readBios",
            Command::WriteBios { .. } => "writeBios",
            Command::MountDatastore { .. } => "mountDatastore",
            Command::RegisterVm { .. } => "registerVm",
            Command::PowerOnVm { .. } => "powerOnVm",
            Command::PowerOffVm { .. } => "powerOffVm",
            Command::UnregisterVm { .. } => "unregisterVm",
        }
    }
}

pub trait Hypervisor: Send + Sync {
    /// Succeeds once the management OS on `host` answers.
    fn connect(&self, host: &str) -> Result<(), PortError>;

    fn power_on(&self, host: &str) -> Result<(), PortError>;

    fn power_off(&self, host: &str) -> Result<(), PortError>;

    /// Run a command, returning its output.
    fn execute(&self, host: &str, command: &Command, deadline: &Deadline) -> Result<String, PortError>;

    fn copy_file(&self, host: &str, source: &str, destination: &str) -> Result<(), PortError>;

    /// Roll the disk `host` boots from back to `snapshot`.
    fn restore_snapshot(&self, host: &str, snapshot: &str) -> Result<(), PortError>;
}

pub trait Nas: Send + Sync {
    /// Create `clone` as a writable copy of `snapshot`.
    fn create_clone(&self, snapshot: &str, clone: &str) -> Result<(), PortError>;

    fn delete_clone(&self, clone: &str) -> Result<(), PortError>;

    /// Take a snapshot of `clone` called `name`.
    fn snapshot(&self, clone: &str, name: &str) -> Result<(), PortError>;

    /// Make `clone` bootable over iSCSI by `initiator`.
    fn export_iscsi(&self, clone: &str, initiator: &str) -> Result<(), PortError>;
}

pub trait BootMenu: Send + Sync {
    fn notify(&self, resource: &str, owner: &str) -> Result<(), PortError>;
}

/// Stand-in for every port when no adapter is wired. Every call fails with
/// [`PortError::Unavailable`], the boot menu silently accepts.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl Hypervisor for Unavailable {
    fn connect(&self, _host: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn power_on(&self, _host: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn power_off(&self, _host: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn execute(&self, _host: &str, _command: &Command, _deadline: &Deadline) -> Result<String, PortError> {
        Err(PortError::Unavailable)
    }

    fn copy_file(&self, _host: &str, _source: &str, _destination: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn restore_snapshot(&self, _host: &str, _snapshot: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }
}

impl Nas for Unavailable {
    fn create_clone(&self, _snapshot: &str, _clone: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn delete_clone(&self, _clone: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn snapshot(&self, _clone: &str, _name: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }

    fn export_iscsi(&self, _clone: &str, _initiator: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable)
    }
}

impl BootMenu for Unavailable {
    fn notify(&self, _resource: &str, _owner: &str) -> Result<(), PortError> {
        Ok(())
    }
}

/// The collaborators a [`crate::HostStateManager`] is built with.
#[derive(Clone)]
pub struct Ports {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub nas: Arc<dyn Nas>,
    pub boot_menu: Arc<dyn BootMenu>,
}

impl Ports {
    pub fn unavailable() -> Self {
        Self {
            hypervisor: Arc::new(Unavailable),
            nas: Arc::new(Unavailable),
            boot_menu: Arc::new(Unavailable),
        }
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}
