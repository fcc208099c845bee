//! BIOS reads and writes on owned blades.
//!
//! The `bios_deploy` flag is raised and the worker registered under the same
//! handle; the worker lowers the flag itself when it stops, whatever the
//! result. While it is up, only handles carrying [`Permits::during_bios`] may
//! write the BIOS or VM sections of the blade. Releasing the blade cancels
//! the worker and waits for it.

use tracing::instrument;

use super::{HostStateManager, not_found, port_outcome};
use crate::cancel::Deadline;
use crate::error::{Result, ResultCode};
use crate::lockable::Permits;
use crate::locks::{Grants, LockSet};
use crate::outcome::{Outcome, WaitToken};
use crate::ports::{Command, PortError};
use crate::records::{Bios, BiosDeploy, Blade, Ownership, RecordKind, VmServer};
use crate::store::EventLevel;
use crate::tracker::OperationKind;

impl HostStateManager {
    /// Write `config` to the BIOS of a blade owned by `requestor`.
    ///
    /// `NoActionNeeded` when the blade already carries it, otherwise
    /// `Pending` with a token to poll.
    #[instrument(skip(self, config), fields(bytes = config.len()))]
    pub fn deploy_bios(&self, ip: &str, config: &str, requestor: &str) -> Result<Outcome> {
        self.start_bios(OperationKind::DeployBios, ip, requestor, Some(config.to_string()))
    }

    /// Read the BIOS back from a blade owned by `requestor`. The finished
    /// operation carries the BIOS as its payload.
    #[instrument(skip(self))]
    pub fn read_bios(&self, ip: &str, requestor: &str) -> Result<Outcome> {
        self.start_bios(OperationKind::ReadBios, ip, requestor, None)
    }

    /// BIOS last written to or read from the blade.
    pub fn last_deployed_bios(&self, ip: &str) -> Result<Option<String>> {
        Ok(self
            .blade(ip)?
            .and_then(|blade| blade.bios().last_deployed.clone()))
    }

    fn start_bios(&self, kind: OperationKind, ip: &str, requestor: &str, wanted: Option<String>) -> Result<Outcome> {
        match self.db().kind_of(ip)? {
            Some(RecordKind::Blade) => {}
            Some(RecordKind::Vm) => {
                return Ok(Outcome::new(ResultCode::BadRequest)
                    .with_resource(ip)
                    .with_message("VMs have no BIOS"));
            }
            None => return Ok(not_found(ip)),
        }
        self.check_keep_alive(ip)?;

        let grants = Grants::new(
            LockSet::OWNERSHIP | LockSet::BIOS | LockSet::VM_CREATION,
            LockSet::LONG_RUNNING_BIOS,
        );
        let mut blade = self.store.lock::<Blade>(ip, grants)?;
        if !blade.read::<Ownership>()?.is_owned_by(requestor) {
            return Ok(Outcome::new(ResultCode::BadRequest)
                .with_resource(ip)
                .with_message(format!("{} is not owned by {}", ip, requestor)));
        }
        if blade.read::<VmServer>()?.active {
            return Ok(Outcome::new(ResultCode::BadRequest)
                .with_resource(ip)
                .with_message("the BIOS of a VM server belongs to the director"));
        }
        if blade.read::<BiosDeploy>()?.in_progress {
            let running = [OperationKind::DeployBios, OperationKind::ReadBios]
                .into_iter()
                .find(|kind| self.tracker.is_running(*kind, ip));
            let outcome = Outcome::new(ResultCode::AlreadyInProgress).with_resource(ip);
            return Ok(match running {
                Some(kind) => outcome.with_token(WaitToken::for_operation(kind, ip)),
                None => outcome,
            });
        }
        if let Some(ref wanted) = wanted {
            if blade.read::<Bios>()?.last_deployed.as_ref() == Some(wanted) {
                return Ok(Outcome::new(ResultCode::NoActionNeeded).with_resource(ip));
            }
        }

        // registered before the handle goes, so a release waiting on the
        // ownership lock finds the operation to cancel
        blade.write::<BiosDeploy>()?.in_progress = true;
        let manager = self.clone();
        let target = ip.to_string();
        let outcome = self.tracker.start(
            kind,
            ip,
            requestor,
            Deadline::after(self.config.bios_operation_timeout),
            move |deadline| manager.run_bios(kind, &target, wanted, deadline),
        );
        if outcome.code != ResultCode::Pending {
            blade.write::<BiosDeploy>()?.in_progress = false;
        }
        drop(blade);
        Ok(outcome)
    }

    fn run_bios(&self, kind: OperationKind, ip: &str, wanted: Option<String>, deadline: &Deadline) -> Outcome {
        let hypervisor = &self.ports.hypervisor;
        let result = match wanted {
            Some(config) => {
                let write = Command::WriteBios { config: config.clone() };
                hypervisor
                    .execute(ip, &write, deadline)
                    .and_then(|_| deadline.check().map_err(PortError::from))
                    .and_then(|_| hypervisor.power_off(ip))
                    .and_then(|_| hypervisor.power_on(ip))
                    .map(|_| config)
            }
            None => hypervisor.execute(ip, &Command::ReadBios, deadline),
        };

        let outcome = match result {
            Ok(ref bios) => {
                self.record(ip, EventLevel::Info, format!("{} finished", kind));
                let outcome = Outcome::success().with_resource(ip);
                match kind {
                    OperationKind::ReadBios => outcome.with_payload(bios.clone()),
                    _ => outcome,
                }
            }
            Err(ref err) => {
                let outcome = port_outcome(kind.tag(), err.clone()).with_resource(ip);
                let level = match err {
                    PortError::Cancelled => EventLevel::Info,
                    _ => EventLevel::Error,
                };
                self.record(ip, level, format!("{} stopped: {}", kind, err));
                outcome
            }
        };

        self.finish_bios(ip, result.ok());
        outcome
    }

    /// Lower the in-progress flag, storing `bios` when the operation got one.
    fn finish_bios(&self, ip: &str, bios: Option<String>) {
        let grants = Grants::write(LockSet::BIOS | LockSet::LONG_RUNNING_BIOS);
        match self.store.lock_with::<Blade>(ip, grants, Permits::during_bios()) {
            Ok(mut blade) => {
                let stored = blade.write::<BiosDeploy>().map(|deploy| deploy.in_progress = false);
                let stored = stored.and_then(|_| match bios {
                    Some(bios) => blade.write::<Bios>().map(|current| current.last_deployed = Some(bios)),
                    None => Ok(()),
                });
                if let Err(err) = stored {
                    self.record(ip, EventLevel::Error, format!("BIOS state not stored: {}", err));
                }
            }
            Err(err) => self.record(ip, EventLevel::Error, format!("BIOS state not stored: {}", err)),
        }
    }
}
