//! Ownership state machine and allocation engine.
//!
//! Every request, release and status query on a blade or VM goes through
//! here. State lives in the store and is only touched through
//! [`Locked`](crate::lockable::Locked) handles, so the manager itself holds
//! nothing but its collaborators. It is cheap to clone; workers carry a clone.
//!
//! Lock order: when a blade and one of its VMs are both needed, the blade is
//! locked first. Paths that start from a VM (VM release) drop the VM handle
//! before touching its server.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DirectorConfig;
use crate::error::{Result, ResultCode};
use crate::fairness::{FairnessPolicy, FleetView, policy_for};
use crate::lockable::LockedStore;
use crate::locks::{Grants, LockSet, LockTable};
use crate::outcome::{Outcome, WaitToken};
use crate::ports::{PortError, Ports};
use crate::records::{
    Blade, BladeSpec, Ownership, RecordKind, ResourceState, ResourceStatus, Section, Snapshot, Vm,
    VmDeploy, VmDeployState, VmProvisioning, VmServer,
};
use crate::store::{self, EventLevel, HostDb, ResourceEvent};
use crate::tracker::{OperationInfo, OperationKind, Tracker};

mod bios;
mod maintenance;
mod vms;

pub use maintenance::MaintenanceHandle;
use vms::DeployGate;

pub struct Inner {
    config: DirectorConfig,
    store: LockedStore,
    ports: Ports,
    clock: Arc<dyn Clock>,
    tracker: Tracker,
    policy: Box<dyn FairnessPolicy>,
    /// Serializes VM placement so two requests never pick the same slot.
    vm_allocation: Mutex<()>,
    deploy_gate: DeployGate,
}

#[derive(Clone)]
pub struct HostStateManager {
    inner: Arc<Inner>,
}

impl Deref for HostStateManager {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

fn not_found(ip: &str) -> Outcome {
    Outcome::new(ResultCode::NotFound)
        .with_resource(ip)
        .with_message(format!("no resource {}", ip))
}

/// Turn a collaborator failure inside a workflow step into its outcome.
pub(crate) fn port_outcome(step: &str, err: PortError) -> Outcome {
    match err {
        PortError::Cancelled => Outcome::new(ResultCode::Cancelled).with_message(format!("{}: cancelled", step)),
        PortError::TimedOut => Outcome::new(ResultCode::Timeout).with_message(format!("{}: timed out", step)),
        other => Outcome::failed(format!("{}: {}", step, other)),
    }
}

impl HostStateManager {
    pub fn new(config: DirectorConfig, db: Arc<dyn HostDb>, ports: Ports) -> Self {
        Self::with_clock(config, db, ports, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DirectorConfig, db: Arc<dyn HostDb>, ports: Ports, clock: Arc<dyn Clock>) -> Self {
        let locks = Arc::new(LockTable::new(config.lock_timeouts()));
        let policy = policy_for(config.fairness);
        info!(
            fairness = policy.name(),
            keep_alive = ?config.keep_alive_timeout,
            "Starting host state manager"
        );
        Self {
            inner: Arc::new(Inner {
                store: LockedStore::new(db, locks),
                tracker: Tracker::new(config.cancellation_watchdog),
                deploy_gate: DeployGate::default(),
                vm_allocation: Mutex::new(()),
                policy,
                ports,
                clock,
                config,
            }),
        }
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    fn db(&self) -> &dyn HostDb {
        self.store.db()
    }

    /// True when no lock on any resource is held. Meant for tests.
    pub fn locks_idle(&self) -> bool {
        self.store.locks().all_unlocked()
    }

    // ─── Audit trail ───────────────────────────────────────────────────

    fn record(&self, resource: &str, level: EventLevel, message: impl Into<String>) {
        let event = ResourceEvent::new(resource, self.clock.now(), level, message);
        match level {
            EventLevel::Info => info!(resource = %resource, "{}", event.message),
            EventLevel::Warn => warn!(resource = %resource, "{}", event.message),
            EventLevel::Error => error!(resource = %resource, "{}", event.message),
        }
        if let Err(err) = self.db().append_event(&event) {
            error!(resource = %resource, error = %err, "Failed to store event");
        }
    }

    pub fn resource_log(&self, ip: &str) -> Result<Vec<ResourceEvent>> {
        Ok(self.db().events(ip)?)
    }

    /// Tell the boot menu about a new owner. Failures are logged, never raised.
    fn notify_boot_menu(&self, ip: &str, owner: &str) {
        if let Err(err) = self.ports.boot_menu.notify(ip, owner) {
            self.record(ip, EventLevel::Warn, format!("boot menu not updated for {}: {}", owner, err));
        }
    }

    // ─── Fleet setup ───────────────────────────────────────────────────

    /// Wipe every resource and event, then add `specs` as unused blades.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub fn init_with_resources(&self, specs: Vec<BladeSpec>) -> Result<()> {
        self.db().clear()?;
        for spec in specs {
            let ip = spec.ip.clone();
            let blade = Blade::new(spec, &self.config.base_snapshot, self.clock.now());
            store::insert_record(self.db(), &blade)?;
            self.record(&ip, EventLevel::Info, "added by cluster init");
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(resource = %spec.ip))]
    pub fn add_resource(&self, spec: BladeSpec) -> Result<Outcome> {
        let ip = spec.ip.clone();
        if self.db().kind_of(&ip)?.is_some() {
            return Ok(Outcome::new(ResultCode::BadRequest)
                .with_resource(&ip)
                .with_message(format!("{} already exists", ip)));
        }
        let blade = Blade::new(spec, &self.config.base_snapshot, self.clock.now());
        store::insert_record(self.db(), &blade)?;
        self.record(&ip, EventLevel::Info, "added");
        Ok(Outcome::success().with_resource(&ip))
    }

    // ─── Snapshots of state, taken without locks ───────────────────────

    pub fn blade(&self, ip: &str) -> Result<Option<Blade>> {
        Ok(store::load_record(self.db(), ip)?)
    }

    pub fn vm(&self, ip: &str) -> Result<Option<Vm>> {
        Ok(store::load_record(self.db(), ip)?)
    }

    pub fn list_resources(&self) -> Result<FleetView> {
        let mut fleet = FleetView {
            director: self.config.director_identity.clone(),
            ..FleetView::default()
        };
        for ip in self.db().keys(RecordKind::Blade)? {
            if let Some(blade) = self.blade(&ip)? {
                fleet.blades.push(blade);
            }
        }
        for ip in self.db().keys(RecordKind::Vm)? {
            if let Some(vm) = self.vm(&ip)? {
                fleet.vms.push(vm);
            }
        }
        Ok(fleet)
    }

    /// Every resource `requestor` currently owns.
    pub fn owned_by(&self, requestor: &str) -> Result<Vec<String>> {
        let fleet = self.list_resources()?;
        let blades = fleet
            .blades
            .iter()
            .filter(|blade| blade.ownership().is_owned_by(requestor))
            .map(|blade| blade.ip().to_string());
        let vms = fleet
            .vms
            .iter()
            .filter(|vm| vm.ownership().is_owned_by(requestor))
            .map(|vm| vm.ip().to_string());
        Ok(blades.chain(vms).collect())
    }

    pub fn current_snapshot(&self, ip: &str) -> Result<Option<String>> {
        let snapshot = match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => self.blade(ip)?.map(|blade| Snapshot::of(&blade).current.clone()),
            Some(RecordKind::Vm) => self.vm(ip)?.map(|vm| Snapshot::of(&vm).current.clone()),
            None => None,
        };
        Ok(snapshot)
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        self.tracker.operations()
    }

    // ─── Async progress ────────────────────────────────────────────────

    pub fn progress(&self, token: &WaitToken) -> Outcome {
        self.tracker.progress(token)
    }

    /// Block until the operation behind `token` finishes or `timeout` passes.
    pub fn wait(&self, token: &WaitToken, timeout: Duration) -> Outcome {
        self.tracker.wait(token, timeout)
    }

    // ─── Keepalive ─────────────────────────────────────────────────────

    /// Refresh the keepalive of everything `requestor` owns.
    #[instrument(skip(self))]
    pub fn keep_alive(&self, requestor: &str) -> Result<()> {
        let now = self.clock.now();
        for ip in self.owned_by(requestor)? {
            match self.db().kind_of(&ip)? {
                Some(RecordKind::Blade) => {
                    let mut blade = self.store.lock::<Blade>(&ip, Grants::write(LockSet::OWNERSHIP))?;
                    if blade.read::<Ownership>()?.is_owned_by(requestor) {
                        blade.write::<Ownership>()?.last_keep_alive = now;
                    }
                }
                Some(RecordKind::Vm) => {
                    let mut vm = self.store.lock::<Vm>(&ip, Grants::write(LockSet::OWNERSHIP))?;
                    if vm.read::<Ownership>()?.is_owned_by(requestor) {
                        vm.write::<Ownership>()?.last_keep_alive = now;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Evict the owner of `ip` if their keepalive lapsed. For a VM server,
    /// the lapsed VMs are evicted instead and the server follows once empty.
    fn check_keep_alive(&self, ip: &str) -> Result<()> {
        let now = self.clock.now();
        let timeout = self.config.keep_alive_timeout;

        match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => {
                let blade = self
                    .store
                    .lock::<Blade>(ip, Grants::read(LockSet::OWNERSHIP | LockSet::VM_CREATION))?;
                let is_server = blade.read::<VmServer>()?.active;
                let ownership = blade.read::<Ownership>()?.clone();
                drop(blade);

                if is_server {
                    let children = self.db().children(ip)?;
                    if children.is_empty() {
                        self.demote_if_empty(ip)?;
                    }
                    for vm in children {
                        self.check_vm_keep_alive(&vm)?;
                    }
                } else if ownership.keep_alive_expired(now, timeout) {
                    self.record(
                        ip,
                        EventLevel::Warn,
                        format!(
                            "keepalive of {} expired, evicting",
                            ownership.current_owner.as_deref().unwrap_or_default()
                        ),
                    );
                    self.release_blade(ip, None)?;
                }
            }
            Some(RecordKind::Vm) => self.check_vm_keep_alive(ip)?,
            None => {}
        }
        Ok(())
    }

    fn check_vm_keep_alive(&self, ip: &str) -> Result<()> {
        let vm = self.store.lock::<Vm>(ip, Grants::read(LockSet::OWNERSHIP))?;
        let ownership = vm.read::<Ownership>()?.clone();
        drop(vm);

        if ownership.keep_alive_expired(self.clock.now(), self.config.keep_alive_timeout) {
            self.record(
                ip,
                EventLevel::Warn,
                format!(
                    "keepalive of {} expired, evicting",
                    ownership.current_owner.as_deref().unwrap_or_default()
                ),
            );
            self.release_vm(ip, None, true)?;
        }
        Ok(())
    }

    // ─── Requests ──────────────────────────────────────────────────────

    /// Claim a blade, or take its queue slot.
    ///
    /// `Success` when claimed (or already queued for this requestor),
    /// `Pending` when queued, `QueueFull` when the slot is taken or the
    /// requestor already owns the blade.
    #[instrument(skip(self))]
    pub fn request(&self, ip: &str, requestor: &str) -> Result<Outcome> {
        match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => {}
            Some(RecordKind::Vm) => {
                return Ok(not_found(ip).with_message(format!("{} is a VM, use request_vm", ip)));
            }
            None => return Ok(not_found(ip)),
        }
        self.check_keep_alive(ip)?;

        let mut blade = self.store.lock::<Blade>(ip, Grants::write(LockSet::OWNERSHIP))?;
        let now = self.clock.now();
        let ownership = blade.read::<Ownership>()?.clone();

        if ownership.state == ResourceState::Unused {
            blade.write::<Ownership>()?.claim(requestor, now);
            drop(blade);
            self.record(ip, EventLevel::Info, format!("claimed by {}", requestor));
            self.notify_boot_menu(ip, requestor);
            return Ok(Outcome::success().with_resource(ip));
        }
        if ownership.is_owned_by(requestor) {
            return Ok(Outcome::new(ResultCode::QueueFull)
                .with_resource(ip)
                .with_message("already owned by requestor"));
        }
        if ownership.is_queued_for(requestor) {
            return Ok(Outcome::success()
                .with_resource(ip)
                .with_message("already queued"));
        }
        if let Some(next) = ownership.next_owner {
            return Ok(Outcome::new(ResultCode::QueueFull)
                .with_resource(ip)
                .with_message(format!("{} is already queued", next)));
        }

        blade.write::<Ownership>()?.enqueue(requestor);
        drop(blade);
        self.record(ip, EventLevel::Info, format!("{} queued", requestor));
        Ok(Outcome::new(ResultCode::Pending).with_resource(ip))
    }

    /// Claim or queue for any blade: unused ones first, then ones with an
    /// empty queue.
    #[instrument(skip(self))]
    pub fn request_any(&self, requestor: &str) -> Result<Outcome> {
        let fleet = self.list_resources()?;
        let unused = fleet
            .blades
            .iter()
            .filter(|blade| blade.ownership().state == ResourceState::Unused);
        let queueable = fleet.blades.iter().filter(|blade| {
            let ownership = blade.ownership();
            ownership.state != ResourceState::Unused
                && ownership.next_owner.is_none()
                && !ownership.is_owned_by(requestor)
        });

        for blade in unused.chain(queueable) {
            let outcome = self.request(blade.ip(), requestor)?;
            if matches!(outcome.code, ResultCode::Success | ResultCode::Pending) {
                return Ok(outcome);
            }
        }
        Ok(Outcome::new(ResultCode::ClusterFull).with_message("no blade can be claimed or queued for"))
    }

    // ─── Release ───────────────────────────────────────────────────────

    /// Give a resource up. Blocks until any BIOS or deploy work on it has
    /// stopped. `force` skips the ownership check.
    #[instrument(skip(self))]
    pub fn release(&self, ip: &str, requestor: &str, force: bool) -> Result<Outcome> {
        let requestor = (!force).then_some(requestor);
        match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => self.release_blade(ip, requestor),
            Some(RecordKind::Vm) => self.release_vm(ip, requestor, true),
            None => Ok(not_found(ip)),
        }
    }

    /// `requestor` is `None` for forced releases.
    fn release_blade(&self, ip: &str, requestor: Option<&str>) -> Result<Outcome> {
        let mut blade = self
            .store
            .lock::<Blade>(ip, Grants::new(LockSet::VM_CREATION, LockSet::OWNERSHIP))?;
        let ownership = blade.read::<Ownership>()?.clone();

        if let Some(requestor) = requestor {
            if !ownership.is_owned_by(requestor) {
                return Ok(Outcome::new(ResultCode::BadRequest)
                    .with_resource(ip)
                    .with_message(format!("{} is not owned by {}", ip, requestor)));
            }
        }
        if ownership.state == ResourceState::Unused {
            return Ok(Outcome::new(ResultCode::NoActionNeeded).with_resource(ip));
        }

        for kind in [OperationKind::DeployBios, OperationKind::ReadBios] {
            if let Some(result) = self.tracker.cancel_and_wait(kind, ip) {
                self.record(ip, EventLevel::Info, format!("{} stopped by release: {}", kind, result.code));
            }
        }

        if blade.read::<VmServer>()?.active {
            for vm in self.db().children(ip)? {
                self.release_vm(&vm, None, false)?;
            }
            blade.upgrade(Grants::write(LockSet::VM_CREATION | LockSet::VM_DEPLOY_STATE))?;
            blade.write::<VmServer>()?.active = false;
            blade.write::<VmDeploy>()?.state = VmDeployState::NotBeingDeployed;
        }

        let next = blade.write::<Ownership>()?.promote_or_free(self.clock.now());
        drop(blade);

        let previous = ownership.current_owner.unwrap_or_default();
        match next {
            Some(next) => {
                self.record(ip, EventLevel::Info, format!("released by {}, now owned by {}", previous, next));
                self.notify_boot_menu(ip, &next);
            }
            None => self.record(ip, EventLevel::Info, format!("released by {}", previous)),
        }
        Ok(Outcome::success().with_resource(ip))
    }

    // ─── Status ────────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub fn get_status(&self, ip: &str, requestor: &str) -> Result<ResourceStatus> {
        self.check_keep_alive(ip)?;
        let status = match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => self
                .store
                .lock::<Blade>(ip, Grants::read(LockSet::OWNERSHIP))?
                .read::<Ownership>()?
                .status_for(requestor),
            Some(RecordKind::Vm) => self
                .store
                .lock::<Vm>(ip, Grants::read(LockSet::OWNERSHIP))?
                .read::<Ownership>()?
                .status_for(requestor),
            None => ResourceStatus::NotFound,
        };
        Ok(status)
    }

    pub fn is_mine(&self, ip: &str, requestor: &str) -> Result<bool> {
        Ok(self.get_status(ip, requestor)? == ResourceStatus::Yours)
    }

    // ─── Snapshots ─────────────────────────────────────────────────────

    /// Roll the disk of an owned resource back to `name` and remember it as
    /// the resource's snapshot. A VM still being deployed is cloned from
    /// `name` instead.
    #[instrument(skip(self))]
    pub fn set_snapshot(&self, ip: &str, requestor: &str, name: &str) -> Result<Outcome> {
        let grants = Grants::new(LockSet::OWNERSHIP | LockSet::VM_DEPLOY_STATE, LockSet::SNAPSHOT);
        let not_owned = || {
            Outcome::new(ResultCode::BadRequest)
                .with_resource(ip)
                .with_message(format!("{} is not owned by {}", ip, requestor))
        };
        let restore = || {
            self.ports
                .hypervisor
                .restore_snapshot(ip, name)
                .map_err(|err| port_outcome("restore snapshot", err).with_resource(ip))
        };

        match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => {
                let mut blade = self.store.lock::<Blade>(ip, grants)?;
                if !blade.read::<Ownership>()?.is_owned_by(requestor) {
                    return Ok(not_owned());
                }
                if let Err(outcome) = restore() {
                    return Ok(outcome);
                }
                blade.write::<Snapshot>()?.current = name.to_string();
            }
            Some(RecordKind::Vm) => {
                let mut vm = self.store.lock::<Vm>(ip, grants)?;
                if !vm.read::<Ownership>()?.is_owned_by(requestor) {
                    return Ok(not_owned());
                }
                if vm.read::<VmProvisioning>()?.ready {
                    if let Err(outcome) = restore() {
                        return Ok(outcome);
                    }
                }
                vm.write::<Snapshot>()?.current = name.to_string();
            }
            None => return Ok(not_found(ip)),
        }

        self.record(ip, EventLevel::Info, format!("snapshot set to {}", name));
        Ok(Outcome::success().with_resource(ip))
    }
}

impl std::fmt::Debug for HostStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStateManager")
            .field("policy", &self.policy.name())
            .field("tracker", &self.tracker)
            .finish()
    }
}
