//! Periodic fairness pass.

use std::thread::{self, JoinHandle};

use tracing::{error, info, instrument};

use super::HostStateManager;
use crate::cancel::Deadline;
use crate::error::{DirectorError, Result};
use crate::fairness::FairnessAction;
use crate::locks::{Grants, LockSet};
use crate::records::{Blade, Ownership, RecordKind, ResourceState, Vm};
use crate::store::EventLevel;

/// Stops the maintenance loop when dropped.
pub struct MaintenanceHandle {
    stop: Deadline,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Apply `change` to the ownership of a blade or VM under its write lock.
fn with_ownership<F>(manager: &HostStateManager, ip: &str, change: F) -> Result<bool>
where
    F: FnOnce(&mut Ownership) -> bool,
{
    let grants = Grants::write(LockSet::OWNERSHIP);
    let changed = match manager.db().kind_of(ip)? {
        Some(RecordKind::Blade) => {
            let mut blade = manager.store.lock::<Blade>(ip, grants)?;
            let mut ownership = blade.read::<Ownership>()?.clone();
            let changed = change(&mut ownership);
            if changed {
                *blade.write::<Ownership>()? = ownership;
            }
            changed
        }
        Some(RecordKind::Vm) => {
            let mut vm = manager.store.lock::<Vm>(ip, grants)?;
            let mut ownership = vm.read::<Ownership>()?.clone();
            let changed = change(&mut ownership);
            if changed {
                *vm.write::<Ownership>()? = ownership;
            }
            changed
        }
        None => false,
    };
    Ok(changed)
}

impl HostStateManager {
    /// Plan with the configured policy, then apply what still holds under the
    /// locks. Returns how many actions changed something.
    #[instrument(skip(self), fields(policy = self.policy.name()))]
    pub fn run_fairness_pass(&self) -> Result<usize> {
        let fleet = self.list_resources()?;
        let mut applied = 0;

        for action in self.policy.plan(&fleet) {
            let result = match action {
                FairnessAction::RequestRelease { ref resource } => with_ownership(self, resource, |ownership| {
                    let asked = ownership.next_owner.is_some()
                        && ownership.current_owner.is_some()
                        && ownership.state != ResourceState::ReleaseRequested;
                    if asked {
                        ownership.state = ResourceState::ReleaseRequested;
                    }
                    asked
                })
                .map(|changed| changed.then(|| (resource.clone(), "release requested".to_string()))),
                FairnessAction::QueueOnVm { ref vm, ref next_owner } => with_ownership(self, vm, |ownership| {
                    let free = ownership.next_owner.is_none() && ownership.current_owner.is_some();
                    if free {
                        ownership.enqueue(next_owner);
                    }
                    free
                })
                .map(|changed| changed.then(|| (vm.clone(), format!("{} queued for the server", next_owner)))),
            };

            match result {
                Ok(Some((resource, message))) => {
                    applied += 1;
                    self.record(&resource, EventLevel::Info, message);
                }
                Ok(None) => {}
                // the resource went away since the plan was made
                Err(DirectorError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if applied > 0 {
            info!(applied, "Fairness pass done");
        }
        Ok(applied)
    }

    /// Run the fairness pass every `fairness_interval` until the handle goes.
    pub fn spawn_maintenance(&self) -> std::io::Result<MaintenanceHandle> {
        let stop = Deadline::never();
        let manager = self.clone();
        let signal = stop.clone();
        let interval = self.config.fairness_interval;

        let thread = thread::Builder::new()
            .name("fairness".to_string())
            .spawn(move || {
                info!(?interval, "Fairness loop started");
                while signal.sleep(interval).is_ok() {
                    if let Err(err) = manager.run_fairness_pass() {
                        error!(error = %err, "Fairness pass failed");
                    }
                }
                info!("Fairness loop stopped");
            })?;

        Ok(MaintenanceHandle {
            stop,
            thread: Some(thread),
        })
    }
}
