//! VM placement, provisioning and teardown.
//!
//! A VM lives on a blade the director has claimed for itself (a VM server).
//! Placement happens synchronously under the allocation mutex; the rest of the
//! deploy runs on a tracked worker:
//!
//! 1. the server is brought up once (BIOS check, power cycle, wait for boot),
//!    with every other deploy on that server waiting at the [`DeployGate`]
//! 2. the datastore is mounted, the VM definition copied and registered
//! 3. the disk is cloned from the chosen snapshot and exported over iSCSI
//! 4. the VM is powered on and marked ready

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument};

use super::{HostStateManager, not_found, port_outcome};
use crate::addressing;
use crate::cancel::Deadline;
use crate::error::{DirectorError, Result, ResultCode};
use crate::lockable::{Locked, Permits};
use crate::locks::{Grants, LockError, LockSet};
use crate::outcome::Outcome;
use crate::ports::{Command, PortError};
use crate::records::{
    Bios, Blade, BladeNetwork, Ownership, RecordKind, ResourceState, Snapshot, VirtualHardware, Vm,
    VmDeploy, VmDeployState, VmHardwareSpec, VmNetwork, VmProvisioning, VmServer, VmSoftwareSpec,
};
use crate::store::{self, EventLevel};
use crate::tracker::OperationKind;

/// Wakes deploys waiting for another deploy to bring their server up.
#[derive(Default)]
pub(crate) struct DeployGate {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl DeployGate {
    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn bump(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Wait until something changed since `seen`, or `timeout` passed.
    fn wait_past(&self, seen: u64, timeout: Duration) {
        let until = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.changed.wait_until(&mut generation, until).timed_out() {
                break;
            }
        }
    }
}

type Step<T> = std::result::Result<T, Outcome>;

fn step<T>(name: &str, result: std::result::Result<T, PortError>) -> Step<T> {
    result.map_err(|err| port_outcome(name, err))
}

fn internal<T>(name: &str, result: Result<T>) -> Step<T> {
    result.map_err(|err| Outcome::failed(format!("{}: {}", name, err)))
}

fn interrupted(name: &str, deadline: &Deadline) -> Step<()> {
    step(name, deadline.check().map_err(PortError::from))
}

/// Lock a candidate server, or `None` if it is busy, excludes us or went
/// away.
fn candidate(result: Result<Locked<Blade>>) -> Result<Option<Locked<Blade>>> {
    match result {
        Ok(handle) => Ok(Some(handle)),
        Err(DirectorError::AccessDenied { .. }) | Err(DirectorError::NotFound(_)) => Ok(None),
        Err(DirectorError::Lock(LockError::Timeout { resource, category, .. })) => {
            debug!(server = %resource, %category, "Server busy, trying the next one");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

impl HostStateManager {
    /// Create a VM for `requestor` and start deploying it.
    ///
    /// Returns `Pending` with a token and the VM's IP, `ClusterFull` when no
    /// server has room and no blade is free, `BadRequest` for malformed
    /// hardware.
    #[instrument(skip(self, software), fields(memory_mb = hardware.memory_mb, cpus = hardware.cpu_count))]
    pub fn request_vm(&self, hardware: VmHardwareSpec, software: VmSoftwareSpec, requestor: &str) -> Result<Outcome> {
        let capacity = self.config.vm_capacity;
        if hardware.memory_mb == 0 || hardware.memory_mb % 4 != 0 {
            return Ok(Outcome::new(ResultCode::BadRequest)
                .with_message(format!("memory must be a positive multiple of 4 MB, got {}", hardware.memory_mb)));
        }
        if hardware.cpu_count == 0 {
            return Ok(Outcome::new(ResultCode::BadRequest).with_message("a VM needs at least one CPU"));
        }
        if hardware.memory_mb > capacity.max_memory_mb || hardware.cpu_count > capacity.max_cpus {
            return Ok(Outcome::new(ResultCode::BadRequest)
                .with_message("the VM is larger than a whole VM server"));
        }

        let vm = {
            let _allocation = self.vm_allocation.lock();
            match self.place_vm(&hardware, &software, requestor)? {
                Some(vm) => vm,
                None => {
                    return Ok(Outcome::new(ResultCode::ClusterFull)
                        .with_message("no VM server has room and no blade is free"));
                }
            }
        };

        let ip = vm.ip().to_string();
        self.record(
            &ip,
            EventLevel::Info,
            format!("created for {} on {} slot {}", requestor, vm.parent_ip(), vm.index_on_server()),
        );

        let manager = self.clone();
        let target = ip.clone();
        let outcome = self.tracker.start(
            OperationKind::DeployVm,
            &ip,
            requestor,
            Deadline::after(self.config.vm_deploy_timeout),
            move |deadline| manager.provision_vm(&target, deadline),
        );
        Ok(outcome.with_resource(ip))
    }

    /// Pick a server and slot, and insert the VM record. A blade promoted
    /// for this VM only becomes a VM server once the record is in.
    fn place_vm(&self, hardware: &VmHardwareSpec, software: &VmSoftwareSpec, requestor: &str) -> Result<Option<Vm>> {
        let (mut server, index, ip, promoted) = match self.find_server(hardware)? {
            Some((server, index, ip)) => (server, index, ip, false),
            None => match self.promote_server()? {
                Some((server, index, ip)) => (server, index, ip, true),
                None => return Ok(None),
            },
        };

        let server_network = server.read::<BladeNetwork>()?.clone();
        let network = addressing::vm_network(server.key(), &server_network.iscsi_ip, index, software)?;
        let snapshot = software
            .snapshot
            .clone()
            .unwrap_or_else(|| self.config.base_snapshot.clone());

        let vm = Vm::new(
            &ip,
            server.key(),
            index,
            network,
            VirtualHardware {
                cpu_count: hardware.cpu_count,
                memory_mb: hardware.memory_mb,
            },
            requestor,
            &snapshot,
            self.clock.now(),
        );
        store::insert_record(self.db(), &vm)?;

        if promoted {
            server
                .write::<Ownership>()?
                .claim_for_director(&self.config.director_identity, self.clock.now());
            server.write::<VmServer>()?.active = true;
            server.write::<VmDeploy>()?.state = VmDeployState::NeedsPowerCycle;
            if let Err(err) = server.flush() {
                drop(server);
                self.db().delete(RecordKind::Vm, &ip)?;
                return Err(err);
            }
            self.record(server.key(), EventLevel::Info, "claimed as a VM server");
        }
        Ok(Some(vm))
    }

    /// Lowest free slot on `server` whose address no other record uses.
    fn free_address(&self, server: &str, taken: &[u32]) -> Result<Option<(u32, String)>> {
        let mut skipped = taken.to_vec();
        loop {
            let index = addressing::free_slot(&skipped);
            // past the last /24 the scheme can address
            let Ok(ip) = addressing::vm_ip(server, index) else {
                return Ok(None);
            };
            if self.db().kind_of(&ip)?.is_none() {
                return Ok(Some((index, ip)));
            }
            debug!(server = %server, slot = index, ip = %ip, "Slot address already in use");
            skipped.push(index);
        }
    }

    fn children(&self, server: &str) -> Result<Vec<Vm>> {
        let mut vms = Vec::new();
        for ip in self.db().children(server)? {
            if let Some(vm) = self.vm(&ip)? {
                vms.push(vm);
            }
        }
        Ok(vms)
    }

    fn server_grants() -> Grants {
        Grants::new(
            LockSet::OWNERSHIP | LockSet::IP_ADDRESSES | LockSet::LONG_RUNNING_BIOS,
            LockSet::VM_CREATION,
        )
    }

    /// A running VM server with room for `hardware`, with the slot and
    /// address the VM gets there.
    fn find_server(&self, hardware: &VmHardwareSpec) -> Result<Option<(Locked<Blade>, u32, String)>> {
        let capacity = self.config.vm_capacity;
        for ip in self.db().keys(RecordKind::Blade)? {
            let Some(blade) = self.blade(&ip)? else {
                continue;
            };
            if !blade.is_vm_server() || blade.vm_deploy_state() == VmDeployState::Failed {
                continue;
            }

            let Some(server) = candidate(self.store.lock::<Blade>(&ip, Self::server_grants()))? else {
                continue;
            };
            // a queued requestor is waiting for this server to empty
            if !server.read::<VmServer>()?.active
                || server.read::<Ownership>()?.state != ResourceState::InUseByDirector
            {
                continue;
            }

            let hosted = self.children(&ip)?;
            let memory: u32 = hosted.iter().map(|vm| vm.hardware().memory_mb).sum();
            let cpus: u32 = hosted.iter().map(|vm| vm.hardware().cpu_count).sum();
            let fits = hosted.len() < capacity.max_vms as usize
                && memory + hardware.memory_mb <= capacity.max_memory_mb
                && cpus + hardware.cpu_count <= capacity.max_cpus;
            if !fits {
                continue;
            }
            let taken: Vec<u32> = hosted.iter().map(Vm::index_on_server).collect();
            if let Some((index, ip)) = self.free_address(server.key(), &taken)? {
                return Ok(Some((server, index, ip)));
            }
        }
        Ok(None)
    }

    /// Lock an unused blade that can host a VM. Nothing is written yet:
    /// [`Self::place_vm`] claims it once the VM record is in.
    fn promote_server(&self) -> Result<Option<(Locked<Blade>, u32, String)>> {
        let grants = Grants::new(
            LockSet::IP_ADDRESSES | LockSet::LONG_RUNNING_BIOS,
            LockSet::OWNERSHIP | LockSet::VM_CREATION | LockSet::VM_DEPLOY_STATE,
        );
        for ip in self.db().keys(RecordKind::Blade)? {
            let Some(blade) = self.blade(&ip)? else {
                continue;
            };
            if blade.ownership().state != ResourceState::Unused {
                continue;
            }

            let Some(server) = candidate(self.store.lock::<Blade>(&ip, grants))? else {
                continue;
            };
            if server.read::<Ownership>()?.state != ResourceState::Unused {
                continue;
            }
            match self.free_address(&ip, &[])? {
                Some((index, vm_ip)) => return Ok(Some((server, index, vm_ip))),
                None => debug!(blade = %ip, "No free VM address under this blade"),
            }
        }
        Ok(None)
    }

    // ─── Provisioning worker ───────────────────────────────────────────

    fn provision_vm(&self, ip: &str, deadline: &Deadline) -> Outcome {
        match self.provision_steps(ip, deadline) {
            Ok(()) => {
                self.record(ip, EventLevel::Info, "deployed");
                Outcome::success().with_resource(ip)
            }
            Err(outcome) => {
                let level = match outcome.code {
                    ResultCode::Cancelled => EventLevel::Info,
                    _ => EventLevel::Error,
                };
                self.record(ip, level, format!("deploy stopped: {}", outcome));
                outcome.with_resource(ip)
            }
        }
    }

    fn provision_steps(&self, ip: &str, deadline: &Deadline) -> Step<()> {
        let vm = internal("load", self.vm(ip))?.ok_or_else(|| not_found(ip))?;
        let server = vm.parent_ip().to_string();
        let network = vm.network().clone();
        let hardware = vm.hardware();
        let hypervisor = &self.ports.hypervisor;

        self.ensure_server_ready(&server, deadline)?;

        let server_iscsi = internal("load server", self.blade(&server))?
            .map(|blade| blade.network().iscsi_ip.clone())
            .ok_or_else(|| not_found(&server))?;
        let mount = Command::MountDatastore {
            datastore: self.config.datastore.clone(),
            nas_ip: server_iscsi,
        };
        step("mount datastore", hypervisor.execute(&server, &mount, deadline))?;

        let definition = format!("{}/{}.vmx", self.config.datastore, network.display_name);
        step(
            "copy definition",
            hypervisor.copy_file(&server, &self.config.vm_template, &definition),
        )?;

        let register = Command::RegisterVm {
            name: network.display_name.clone(),
            datastore: self.config.datastore.clone(),
            memory_mb: hardware.memory_mb,
            cpu_count: hardware.cpu_count,
            eth0_mac: network.eth0_mac.clone(),
            eth1_mac: network.eth1_mac.clone(),
        };
        step("register", hypervisor.execute(&server, &register, deadline))?;

        let snapshot = {
            let handle = internal("snapshot", self.store.lock::<Vm>(ip, Grants::read(LockSet::SNAPSHOT)))?;
            internal("snapshot", handle.read::<Snapshot>().map(|snapshot| snapshot.current.clone()))?
        };
        interrupted("clone", deadline)?;
        step("clone", self.ports.nas.create_clone(&snapshot, &network.display_name))?;
        // gives a later snapshot restore on the VM something to roll back to
        step("snapshot", self.ports.nas.snapshot(&network.display_name, &snapshot))?;
        step("export", self.ports.nas.export_iscsi(&network.display_name, &network.iscsi_ip))?;

        let power_on = Command::PowerOnVm {
            name: network.display_name.clone(),
        };
        step("power on", hypervisor.execute(&server, &power_on, deadline))?;

        interrupted("commit", deadline)?;
        let mut handle = internal(
            "commit",
            self.store.lock::<Vm>(ip, Grants::write(LockSet::VM_DEPLOY_STATE)),
        )?;
        internal("commit", handle.write::<VmProvisioning>())?.ready = true;
        internal("commit", handle.flush())?;
        drop(handle);

        if let Some(owner) = vm.ownership().current_owner.as_deref() {
            self.notify_boot_menu(ip, owner);
        }
        Ok(())
    }

    /// Bring `server` up, or wait for whoever is already doing it.
    fn ensure_server_ready(&self, server: &str, deadline: &Deadline) -> Step<()> {
        loop {
            interrupted("server bring-up", deadline)?;
            let seen = self.deploy_gate.generation();
            let mut blade = internal(
                "server bring-up",
                self.store.lock_with::<Blade>(
                    server,
                    Grants::write(LockSet::VM_DEPLOY_STATE),
                    Permits::during_vm_deploy(),
                ),
            )?;
            let state = internal("server bring-up", blade.read::<VmDeploy>())?.state;
            match state {
                VmDeployState::ReadyForDeployment => return Ok(()),
                VmDeployState::Failed => {
                    return Err(Outcome::failed(format!("server {} failed to come up", server)));
                }
                VmDeployState::NotBeingDeployed => {
                    return Err(Outcome::failed(format!("{} is no longer a VM server", server)));
                }
                VmDeployState::WaitingForPowerUp => {
                    drop(blade);
                    self.deploy_gate.wait_past(seen, self.config.boot_poll_interval);
                }
                VmDeployState::NeedsPowerCycle => {
                    internal("server bring-up", blade.write::<VmDeploy>())?.state = VmDeployState::WaitingForPowerUp;
                    drop(blade);
                    break;
                }
            }
        }

        let result = self.bring_up_server(server, deadline);
        let next = match result {
            Ok(()) => VmDeployState::ReadyForDeployment,
            // let the next deploy on this server try again
            Err(ref outcome) if outcome.code == ResultCode::Cancelled => VmDeployState::NeedsPowerCycle,
            Err(_) => VmDeployState::Failed,
        };

        match self.store.lock_with::<Blade>(
            server,
            Grants::write(LockSet::VM_DEPLOY_STATE),
            Permits::during_vm_deploy(),
        ) {
            Ok(mut blade) => {
                if let Ok(deploy) = blade.write::<VmDeploy>() {
                    if deploy.state == VmDeployState::WaitingForPowerUp {
                        deploy.state = next;
                    }
                }
            }
            Err(err) => self.record(server, EventLevel::Error, format!("bring-up result not stored: {}", err)),
        }
        self.deploy_gate.bump();

        match result {
            Ok(()) => self.record(server, EventLevel::Info, "ready for VM deployment"),
            Err(ref outcome) => self.record(server, EventLevel::Warn, format!("bring-up stopped: {}", outcome)),
        }
        result
    }

    fn bring_up_server(&self, server: &str, deadline: &Deadline) -> Step<()> {
        let hypervisor = &self.ports.hypervisor;
        if let Some(ref wanted) = self.config.vm_server_bios {
            self.ensure_server_bios(server, wanted, deadline)?;
        }

        step("power off", hypervisor.power_off(server))?;
        step("power on", hypervisor.power_on(server))?;
        loop {
            match hypervisor.connect(server) {
                Ok(()) => return Ok(()),
                Err(PortError::Unavailable) => return Err(port_outcome("connect", PortError::Unavailable)),
                Err(err) => {
                    debug!(server = %server, error = %err, "Server not up yet");
                    step(
                        "waiting for boot",
                        deadline
                            .sleep(self.config.boot_poll_interval)
                            .map_err(PortError::from),
                    )?;
                }
            }
        }
    }

    fn ensure_server_bios(&self, server: &str, wanted: &str, deadline: &Deadline) -> Step<()> {
        let mut blade = internal(
            "server BIOS",
            self.store.lock_with::<Blade>(
                server,
                Grants::new(LockSet::LONG_RUNNING_BIOS, LockSet::BIOS),
                Permits::during_vm_deploy(),
            ),
        )?;
        let current = internal("server BIOS", blade.read::<Bios>())?
            .last_deployed
            .clone();
        if current.as_deref() == Some(wanted) {
            return Ok(());
        }

        let write = Command::WriteBios {
            config: wanted.to_string(),
        };
        step("server BIOS", self.ports.hypervisor.execute(server, &write, deadline))?;
        internal("server BIOS", blade.write::<Bios>())?.last_deployed = Some(wanted.to_string());
        Ok(())
    }

    // ─── Teardown ──────────────────────────────────────────────────────

    /// Stop any deploy, tear the VM down and delete it. `requestor` is
    /// `None` for forced releases. With `demote_parent`, a server left
    /// without VMs goes back to the pool.
    pub(super) fn release_vm(&self, ip: &str, requestor: Option<&str>, demote_parent: bool) -> Result<Outcome> {
        let vm = match self
            .store
            .lock::<Vm>(ip, Grants::new(LockSet::IP_ADDRESSES, LockSet::OWNERSHIP))
        {
            Ok(vm) => vm,
            Err(DirectorError::NotFound(_)) => return Ok(not_found(ip)),
            Err(err) => return Err(err),
        };
        let ownership = vm.read::<Ownership>()?.clone();
        if let Some(requestor) = requestor {
            if !ownership.is_owned_by(requestor) {
                return Ok(Outcome::new(ResultCode::BadRequest)
                    .with_resource(ip)
                    .with_message(format!("{} is not owned by {}", ip, requestor)));
            }
        }

        if let Some(result) = self.tracker.cancel_and_wait(OperationKind::DeployVm, ip) {
            self.record(ip, EventLevel::Info, format!("deploy stopped by release: {}", result.code));
        }

        let server = vm.parent().unwrap_or_default().to_string();
        let network = vm.read::<VmNetwork>()?.clone();
        self.tear_down(ip, &server, &network);
        vm.delete()?;

        let owner = ownership.current_owner.unwrap_or_default();
        self.record(ip, EventLevel::Info, format!("released by {} and deleted", owner));
        self.record(&server, EventLevel::Info, format!("VM {} removed", ip));

        if demote_parent {
            self.demote_if_empty(&server)?;
        }
        Ok(Outcome::success().with_resource(ip))
    }

    /// Best effort: failures are recorded and the release carries on.
    fn tear_down(&self, ip: &str, server: &str, network: &VmNetwork) {
        let deadline = Deadline::after(self.config.vm_deploy_timeout);
        let name = network.display_name.clone();
        let commands = [
            Command::PowerOffVm { name: name.clone() },
            Command::UnregisterVm { name: name.clone() },
        ];
        for command in &commands {
            if let Err(err) = self.ports.hypervisor.execute(server, command, &deadline) {
                self.record(ip, EventLevel::Warn, format!("{} failed: {}", command.name(), err));
            }
        }
        if let Err(err) = self.ports.nas.delete_clone(&name) {
            self.record(ip, EventLevel::Warn, format!("clone not deleted: {}", err));
        }
    }

    /// Return `server` to the pool, or to its queued requestor, once it has
    /// no VMs left.
    pub(super) fn demote_if_empty(&self, server: &str) -> Result<()> {
        let _allocation = self.vm_allocation.lock();
        let grants = Grants::write(LockSet::OWNERSHIP | LockSet::VM_CREATION | LockSet::VM_DEPLOY_STATE);
        let mut blade = match self.store.lock::<Blade>(server, grants) {
            Ok(blade) => blade,
            Err(DirectorError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if !blade.read::<VmServer>()?.active || !self.db().children(server)?.is_empty() {
            return Ok(());
        }

        blade.write::<VmServer>()?.active = false;
        blade.write::<VmDeploy>()?.state = VmDeployState::NotBeingDeployed;
        let next = blade.write::<Ownership>()?.promote_or_free(self.clock.now());
        drop(blade);

        match next {
            Some(next) => {
                self.record(server, EventLevel::Info, format!("no VMs left, handed to {}", next));
                self.notify_boot_menu(server, &next);
            }
            None => self.record(server, EventLevel::Info, "no VMs left, back in the pool"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::config::DirectorConfig;
    use crate::ports::mock::{MockPortConfig, MockPorts};
    use crate::records::{BladeSpec, ResourceStatus};
    use crate::store::MemoryHostDb;

    fn manager(mock: MockPortConfig, config: DirectorConfig) -> (HostStateManager, Arc<MockPorts>) {
        manager_with(&["10.0.1.1", "10.0.1.2"], mock, config)
    }

    fn manager_with(ips: &[&str], mock: MockPortConfig, config: DirectorConfig) -> (HostStateManager, Arc<MockPorts>) {
        let ports = MockPorts::new(mock);
        let manager = HostStateManager::new(config, Arc::new(MemoryHostDb::new()), ports.ports());
        manager
            .init_with_resources(ips.iter().copied().map(BladeSpec::from_ip).collect())
            .unwrap();
        (manager, ports)
    }

    fn fast() -> DirectorConfig {
        DirectorConfig {
            boot_poll_interval: Duration::from_millis(10),
            ..DirectorConfig::default()
        }
    }

    fn hardware(memory_mb: u32) -> VmHardwareSpec {
        VmHardwareSpec { memory_mb, cpu_count: 1 }
    }

    #[test]
    fn odd_memory_is_rejected() {
        let (manager, _) = manager(MockPortConfig::default(), fast());
        let outcome = manager
            .request_vm(hardware(4097), VmSoftwareSpec::default(), "A")
            .unwrap();
        assert_eq!(outcome.code, ResultCode::BadRequest);
        assert!(manager.list_resources().unwrap().vms.is_empty());
    }

    #[test]
    fn deploy_runs_every_step_in_order() {
        let (manager, ports) = manager(MockPortConfig { boot_polls: 2, ..Default::default() }, fast());
        let outcome = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        assert_eq!(outcome.code, ResultCode::Pending);
        let ip = outcome.resource.clone().unwrap();
        assert_eq!(ip, "10.0.2.1");

        let done = manager.wait(&outcome.token.unwrap(), Duration::from_secs(10));
        assert_eq!(done.code, ResultCode::Success, "{}", done);
        assert!(manager.vm(&ip).unwrap().unwrap().is_ready());
        assert_eq!(
            ports.tracker().commands_on("10.0.1.1"),
            vec!["mountDatastore", "registerVm", "powerOnVm"]
        );
        assert_eq!(ports.tracker().connect_count(), 3);
        assert_eq!(ports.tracker().copy_count(), 1);
        assert_eq!(ports.tracker().snapshot_count(), 1);
        assert_eq!(
            manager.blade("10.0.1.1").unwrap().unwrap().vm_deploy_state(),
            VmDeployState::ReadyForDeployment
        );
        assert!(manager.locks_idle());
    }

    #[test]
    fn failed_clone_fails_the_deploy_and_keeps_the_vm() {
        let mock = MockPortConfig {
            clone_error: Some("pool offline".into()),
            ..Default::default()
        };
        let (manager, _) = manager(mock, fast());
        let outcome = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        let ip = outcome.resource.clone().unwrap();
        let done = manager.wait(&outcome.token.unwrap(), Duration::from_secs(10));
        assert_eq!(done.code, ResultCode::GenericFail);
        assert!(done.message.contains("pool offline"));

        let vm = manager.vm(&ip).unwrap().unwrap();
        assert!(!vm.is_ready());
        assert!(vm.ownership().is_owned_by("A"));
    }

    #[test]
    fn releasing_the_last_vm_returns_the_server() {
        let (manager, ports) = manager(MockPortConfig::default(), fast());
        let outcome = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        let ip = outcome.resource.clone().unwrap();
        manager.wait(&outcome.token.unwrap(), Duration::from_secs(10));

        assert_eq!(manager.release(&ip, "B", false).unwrap().code, ResultCode::BadRequest);
        assert_eq!(manager.release(&ip, "A", false).unwrap().code, ResultCode::Success);
        assert!(manager.vm(&ip).unwrap().is_none());
        assert_eq!(ports.tracker().clone_delete_count(), 1);

        let server = manager.blade("10.0.1.1").unwrap().unwrap();
        assert!(!server.is_vm_server());
        assert_eq!(server.ownership().state, ResourceState::Unused);
        assert!(manager.locks_idle());
    }

    #[test]
    fn server_that_never_boots_fails_every_deploy_on_it() {
        let mock = MockPortConfig {
            connect_error: Some("no route to host".into()),
            ..Default::default()
        };
        let config = DirectorConfig {
            vm_deploy_timeout: Duration::from_millis(300),
            ..fast()
        };
        let (manager, _) = manager(mock, config);
        let outcome = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        let done = manager.wait(&outcome.token.unwrap(), Duration::from_secs(10));
        assert_eq!(done.code, ResultCode::Timeout);
        assert_eq!(
            manager.blade("10.0.1.1").unwrap().unwrap().vm_deploy_state(),
            VmDeployState::Failed
        );
    }

    #[test]
    fn vm_addresses_skip_blades_in_the_next_subnets() {
        let (manager, _) = manager_with(&["10.0.1.1", "10.0.2.1"], MockPortConfig::default(), fast());

        // slot 0 under 10.0.1.1 would be 10.0.2.1, which is a blade
        let first = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        assert_eq!(first.code, ResultCode::Pending, "{}", first);
        assert_eq!(first.resource.as_deref(), Some("10.0.3.1"));
        assert_eq!(manager.vm("10.0.3.1").unwrap().unwrap().index_on_server(), 1);

        let second = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "B")
            .unwrap();
        assert_eq!(second.code, ResultCode::Pending, "{}", second);
        assert_eq!(second.resource.as_deref(), Some("10.0.4.1"));

        let blade = manager.blade("10.0.2.1").unwrap().unwrap();
        assert_eq!(blade.ownership().state, ResourceState::Unused);
        assert!(!blade.is_vm_server());

        manager.wait(&first.token.unwrap(), Duration::from_secs(10));
        manager.wait(&second.token.unwrap(), Duration::from_secs(10));
        assert!(manager.locks_idle());
    }

    #[test]
    fn blade_without_room_for_vm_addresses_is_not_promoted() {
        let (manager, _) = manager_with(&["10.0.255.1"], MockPortConfig::default(), fast());
        let outcome = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        assert_eq!(outcome.code, ResultCode::ClusterFull);

        let blade = manager.blade("10.0.255.1").unwrap().unwrap();
        assert!(!blade.is_vm_server());
        assert_eq!(blade.ownership().state, ResourceState::Unused);
        assert_eq!(manager.request("10.0.255.1", "A").unwrap().code, ResultCode::Success);
    }

    #[test]
    fn empty_vm_server_is_demoted_on_the_next_status_check() {
        let (manager, _) = manager(MockPortConfig::default(), fast());
        let outcome = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        let ip = outcome.resource.clone().unwrap();
        manager.wait(&outcome.token.unwrap(), Duration::from_secs(10));

        // the VM row vanished without the server being told
        manager.db().delete(RecordKind::Vm, &ip).unwrap();
        assert!(manager.blade("10.0.1.1").unwrap().unwrap().is_vm_server());

        assert_eq!(manager.get_status("10.0.1.1", "C").unwrap(), ResourceStatus::Unused);
        let server = manager.blade("10.0.1.1").unwrap().unwrap();
        assert!(!server.is_vm_server());
        assert_eq!(server.vm_deploy_state(), VmDeployState::NotBeingDeployed);
        assert!(manager.locks_idle());
    }

    #[test]
    fn busy_server_is_skipped_instead_of_failing_the_request() {
        let config = DirectorConfig {
            reader_lock_timeout: Duration::from_millis(100),
            writer_lock_timeout: Duration::from_millis(100),
            ..fast()
        };
        let (manager, _) = manager(MockPortConfig::default(), config);
        let first = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "A")
            .unwrap();
        assert_eq!(first.resource.as_deref(), Some("10.0.2.1"));
        manager.wait(&first.token.unwrap(), Duration::from_secs(10));

        let (locked, wait_for_lock) = mpsc::channel();
        let (done, wait_for_done) = mpsc::channel::<()>();
        let holder = {
            let manager = manager.clone();
            thread::spawn(move || {
                let blade = manager
                    .store
                    .lock::<Blade>("10.0.1.1", Grants::write(LockSet::OWNERSHIP))
                    .unwrap();
                locked.send(()).unwrap();
                wait_for_done.recv().unwrap();
                drop(blade);
            })
        };
        wait_for_lock.recv().unwrap();

        let second = manager
            .request_vm(hardware(4096), VmSoftwareSpec::default(), "B")
            .unwrap();
        assert_eq!(second.code, ResultCode::Pending, "{}", second);
        assert_eq!(second.resource.as_deref(), Some("10.0.2.2"));

        done.send(()).unwrap();
        holder.join().unwrap();
        manager.wait(&second.token.unwrap(), Duration::from_secs(10));
    }
}
