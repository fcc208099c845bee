use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Ownership, Record, RecordKind, Snapshot, sections};
use crate::locks::LockSet;

/// Hardware a requestor asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHardwareSpec {
    /// Must be a multiple of 4, the hypervisor refuses anything else.
    pub memory_mb: u32,
    pub cpu_count: u32,
}

/// Software-side choices for a new VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSoftwareSpec {
    #[serde(default)]
    pub debugger_port: Option<u16>,
    #[serde(default)]
    pub debugger_key: Option<String>,
    /// Disk snapshot to clone from; the configured base snapshot when absent.
    #[serde(default)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmIdentity {
    pub ip: String,
    pub parent_ip: String,
    pub index_on_server: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNetwork {
    pub display_name: String,
    pub eth0_mac: String,
    pub eth1_mac: String,
    pub iscsi_ip: String,
    pub kernel_debug_port: u16,
    pub kernel_debug_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHardware {
    pub cpu_count: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProvisioning {
    /// Set once the VM is deployed and handed to its owner.
    pub ready: bool,
}

/// A VM carved out of a VM-server blade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    identity: VmIdentity,
    ownership: Ownership,
    snapshot: Snapshot,
    network: VmNetwork,
    hardware: VirtualHardware,
    provisioning: VmProvisioning,
}

sections!(Vm {
    ownership: Ownership => LockSet::OWNERSHIP,
    snapshot: Snapshot => LockSet::SNAPSHOT,
    network: VmNetwork => LockSet::IP_ADDRESSES,
    hardware: VirtualHardware => LockSet::VIRTUAL_HARDWARE,
    provisioning: VmProvisioning => LockSet::VM_DEPLOY_STATE,
});

impl Vm {
    pub fn new(
        ip: &str,
        parent_ip: &str,
        index_on_server: u32,
        network: VmNetwork,
        hardware: VirtualHardware,
        owner: &str,
        snapshot: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: VmIdentity {
                ip: ip.to_string(),
                parent_ip: parent_ip.to_string(),
                index_on_server,
            },
            ownership: Ownership::owned_by(owner, now),
            snapshot: Snapshot {
                current: snapshot.to_string(),
            },
            network,
            hardware,
            provisioning: VmProvisioning::default(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.identity.ip
    }

    pub fn parent_ip(&self) -> &str {
        &self.identity.parent_ip
    }

    pub fn index_on_server(&self) -> u32 {
        self.identity.index_on_server
    }

    /// Unguarded views for detached copies (fleet snapshots, capacity sums).
    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    pub fn network(&self) -> &VmNetwork {
        &self.network
    }

    pub fn hardware(&self) -> VirtualHardware {
        self.hardware
    }

    pub fn is_ready(&self) -> bool {
        self.provisioning.ready
    }
}

impl Record for Vm {
    const KIND: RecordKind = RecordKind::Vm;
    const SECTIONS: &'static [(&'static str, LockSet)] = Vm::SECTION_TABLE;

    fn key(&self) -> &str {
        &self.identity.ip
    }

    fn parent(&self) -> Option<&str> {
        Some(&self.identity.parent_ip)
    }
}
