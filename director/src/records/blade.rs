use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Ownership, Record, RecordKind, Snapshot, sections};
use crate::lockable::Permits;
use crate::locks::{Grants, LockSet};

/// How a blade is described when the cluster is initialised or a node added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BladeSpec {
    pub ip: String,
    pub ilo_ip: String,
    pub iscsi_ip: String,
    #[serde(default)]
    pub kernel_debug_port: u16,
    #[serde(default)]
    pub kernel_debug_key: String,
}

impl BladeSpec {
    /// Spec with network addresses derived from the blade IP, handy for tests and demos.
    pub fn from_ip(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            ilo_ip: format!("ilo-{}", ip),
            iscsi_ip: ip.to_string(),
            kernel_debug_port: 0,
            kernel_debug_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BladeIdentity {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BladeNetwork {
    pub ilo_ip: String,
    pub iscsi_ip: String,
    pub kernel_debug_port: u16,
    pub kernel_debug_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bios {
    pub last_deployed: Option<String>,
}

/// Set while a BIOS read or write owns the blade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiosDeploy {
    pub in_progress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmServer {
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VmDeployState {
    #[default]
    NotBeingDeployed,
    NeedsPowerCycle,
    WaitingForPowerUp,
    ReadyForDeployment,
    Failed,
}

impl VmDeployState {
    /// The server is being brought up and cannot be touched otherwise.
    pub fn is_mid_flight(&self) -> bool {
        matches!(
            self,
            VmDeployState::NeedsPowerCycle | VmDeployState::WaitingForPowerUp
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDeploy {
    pub state: VmDeployState,
}

/// A physical blade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blade {
    identity: BladeIdentity,
    ownership: Ownership,
    snapshot: Snapshot,
    network: BladeNetwork,
    bios: Bios,
    bios_deploy: BiosDeploy,
    vm_server: VmServer,
    vm_deploy: VmDeploy,
}

sections!(Blade {
    ownership: Ownership => LockSet::OWNERSHIP,
    snapshot: Snapshot => LockSet::SNAPSHOT,
    network: BladeNetwork => LockSet::IP_ADDRESSES,
    bios: Bios => LockSet::BIOS,
    bios_deploy: BiosDeploy => LockSet::LONG_RUNNING_BIOS,
    vm_server: VmServer => LockSet::VM_CREATION,
    vm_deploy: VmDeploy => LockSet::VM_DEPLOY_STATE,
});

impl Blade {
    pub fn new(spec: BladeSpec, base_snapshot: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity: BladeIdentity { ip: spec.ip },
            ownership: Ownership::unused(now),
            snapshot: Snapshot {
                current: base_snapshot.to_string(),
            },
            network: BladeNetwork {
                ilo_ip: spec.ilo_ip,
                iscsi_ip: spec.iscsi_ip,
                kernel_debug_port: spec.kernel_debug_port,
                kernel_debug_key: spec.kernel_debug_key,
            },
            bios: Bios::default(),
            bios_deploy: BiosDeploy::default(),
            vm_server: VmServer::default(),
            vm_deploy: VmDeploy::default(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.identity.ip
    }

    /// Full unguarded view, only for records that are not behind a handle
    /// (fleet snapshots, tests).
    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    pub fn network(&self) -> &BladeNetwork {
        &self.network
    }

    pub fn is_vm_server(&self) -> bool {
        self.vm_server.active
    }

    pub fn bios(&self) -> &Bios {
        &self.bios
    }

    pub fn vm_deploy_state(&self) -> VmDeployState {
        self.vm_deploy.state
    }
}

impl Record for Blade {
    const KIND: RecordKind = RecordKind::Blade;
    const SECTIONS: &'static [(&'static str, LockSet)] = Blade::SECTION_TABLE;

    fn key(&self) -> &str {
        &self.identity.ip
    }

    fn admit(&self, grants: Grants, permits: Permits) -> Result<(), String> {
        if grants.read.contains(LockSet::LONG_RUNNING_BIOS)
            && self.bios_deploy.in_progress
            && !permits.during_bios
            && grants
                .write
                .intersects(LockSet::BIOS | LockSet::VM_CREATION | LockSet::VM_DEPLOY_STATE)
        {
            return Err("a BIOS operation is in progress".to_string());
        }

        if grants.read.contains(LockSet::VM_DEPLOY_STATE)
            && self.vm_deploy.state.is_mid_flight()
            && !permits.during_vm_deploy
            && grants
                .write
                .intersects(LockSet::BIOS | LockSet::LONG_RUNNING_BIOS)
        {
            return Err("the blade is being brought up as a VM server".to_string());
        }

        Ok(())
    }
}
