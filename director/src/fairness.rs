//! Fairness policies.
//!
//! A policy looks at a detached copy of the fleet and says which resources
//! should be asked back from their owners. It never changes anything itself;
//! the state manager re-checks every action under the resource's locks before
//! applying it, so a stale plan is harmless.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::FairnessKind;
use crate::records::{Blade, Ownership, ResourceState, Vm};

/// Detached view of every resource, taken without locks.
#[derive(Debug, Clone, Default)]
pub struct FleetView {
    pub blades: Vec<Blade>,
    pub vms: Vec<Vm>,
    /// Owner recorded on VM servers, never counted as a requestor.
    pub director: String,
}

impl FleetView {
    pub fn children_of<'a>(&'a self, server: &'a str) -> impl Iterator<Item = &'a Vm> + 'a {
        self.vms.iter().filter(move |vm| vm.parent_ip() == server)
    }

    /// Resources each requestor holds. A VM counts as its share of the server.
    pub fn allocations(&self) -> BTreeMap<String, f64> {
        let mut allocations: BTreeMap<String, f64> = BTreeMap::new();
        for blade in &self.blades {
            if blade.is_vm_server() {
                let children: Vec<&Vm> = self.children_of(blade.ip()).collect();
                let share = 1.0 / children.len().max(1) as f64;
                for vm in children {
                    if let Some(owner) = self.requestor(&vm.ownership().current_owner) {
                        *allocations.entry(owner.to_string()).or_default() += share;
                    }
                }
            } else if let Some(owner) = self.requestor(&blade.ownership().current_owner) {
                *allocations.entry(owner.to_string()).or_default() += 1.0;
            }
        }
        allocations
    }

    /// Everyone holding or waiting for something.
    pub fn requestors(&self) -> BTreeSet<String> {
        let ownerships = self
            .blades
            .iter()
            .map(Blade::ownership)
            .chain(self.vms.iter().map(Vm::ownership));
        let mut requestors = BTreeSet::new();
        for ownership in ownerships {
            for who in [&ownership.current_owner, &ownership.next_owner] {
                if let Some(who) = self.requestor(who) {
                    requestors.insert(who.to_string());
                }
            }
        }
        requestors
    }

    fn requestor<'a>(&self, who: &'a Option<String>) -> Option<&'a str> {
        who.as_deref()
            .filter(|who| !who.is_empty() && *who != self.director)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FairnessAction {
    /// Ask the owner of `resource` to give it up to its queued requestor.
    RequestRelease { resource: String },
    /// Queue `next_owner` on a VM so its server can be handed over once
    /// every VM is gone.
    QueueOnVm { vm: String, next_owner: String },
}

pub trait FairnessPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn plan(&self, fleet: &FleetView) -> Vec<FairnessAction>;
}

pub fn policy_for(kind: FairnessKind) -> Box<dyn FairnessPolicy> {
    match kind {
        FairnessKind::AllowAny => Box::new(AllowAny),
        FairnessKind::Fair => Box::new(Fair),
    }
}

fn wants_release(ownership: &Ownership) -> bool {
    ownership.next_owner.is_some() && ownership.state != ResourceState::ReleaseRequested
}

/// Release to the next owner, and queue them on every VM of the server.
fn hand_over(fleet: &FleetView, blade: &Blade, next_owner: &str, actions: &mut Vec<FairnessAction>) {
    if wants_release(blade.ownership()) {
        actions.push(FairnessAction::RequestRelease {
            resource: blade.ip().to_string(),
        });
    }
    if blade.is_vm_server() {
        for vm in fleet.children_of(blade.ip()) {
            if vm.ownership().next_owner.is_none() && vm.ownership().current_owner.is_some() {
                actions.push(FairnessAction::QueueOnVm {
                    vm: vm.ip().to_string(),
                    next_owner: next_owner.to_string(),
                });
            }
        }
    }
}

/// Anyone queued gets the resource as soon as its owner lets go.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAny;

impl FairnessPolicy for AllowAny {
    fn name(&self) -> &'static str {
        "allowAny"
    }

    fn plan(&self, fleet: &FleetView) -> Vec<FairnessAction> {
        let mut actions = Vec::new();
        for blade in &fleet.blades {
            if let Some(ref next) = blade.ownership().next_owner {
                hand_over(fleet, blade, next, &mut actions);
            }
        }
        for vm in &fleet.vms {
            if wants_release(vm.ownership()) {
                actions.push(FairnessAction::RequestRelease {
                    resource: vm.ip().to_string(),
                });
            }
        }
        actions
    }
}

/// Move resources from requestors above their fair share to requestors below
/// it, but only where the under-served requestor is already queued.
///
/// A VM server only moves when every VM on it belongs to over-quota
/// requestors, so servers shared with anyone at or below quota never move.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fair;

impl Fair {
    pub fn fair_share(fleet: &FleetView) -> Option<f64> {
        let requestors = fleet.requestors().len();
        (requestors > 0).then(|| fleet.blades.len() as f64 / requestors as f64)
    }
}

impl FairnessPolicy for Fair {
    fn name(&self) -> &'static str {
        "fair"
    }

    fn plan(&self, fleet: &FleetView) -> Vec<FairnessAction> {
        let Some(share) = Self::fair_share(fleet) else {
            return Vec::new();
        };
        let allocations = fleet.allocations();
        let held = |who: &str| allocations.get(who).copied().unwrap_or(0.0);
        let over = |who: &Option<String>| who.as_deref().is_some_and(|who| held(who) > share);

        let mut actions = Vec::new();
        for under in fleet.requestors().iter().filter(|who| held(who.as_str()) < share) {
            let target = fleet.blades.iter().find(|blade| {
                let ownership = blade.ownership();
                if !ownership.is_queued_for(under) {
                    return false;
                }
                if blade.is_vm_server() {
                    let mut children = fleet.children_of(blade.ip()).peekable();
                    children.peek().is_some()
                        && children.all(|vm| over(&vm.ownership().current_owner))
                } else {
                    over(&ownership.current_owner)
                }
            });

            if let Some(blade) = target {
                hand_over(fleet, blade, under, &mut actions);
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::records::{BladeSpec, VirtualHardware, VmNetwork};

    fn blade(ip: &str, owner: Option<&str>, next: Option<&str>) -> Blade {
        let mut blade = Blade::new(BladeSpec::from_ip(ip), "clean", Utc::now());
        let ownership = blade_ownership(&mut blade);
        if let Some(owner) = owner {
            ownership.claim(owner, Utc::now());
        }
        if let Some(next) = next {
            ownership.next_owner = Some(next.to_string());
        }
        blade
    }

    fn blade_ownership(blade: &mut Blade) -> &mut Ownership {
        <Ownership as crate::records::Section<Blade>>::of_mut(blade)
    }

    fn vm(ip: &str, parent: &str, owner: &str) -> Vm {
        let network = VmNetwork {
            display_name: ip.into(),
            eth0_mac: String::new(),
            eth1_mac: String::new(),
            iscsi_ip: ip.into(),
            kernel_debug_port: 0,
            kernel_debug_key: String::new(),
        };
        let hardware = VirtualHardware {
            cpu_count: 1,
            memory_mb: 4096,
        };
        Vm::new(ip, parent, 0, network, hardware, owner, "clean", Utc::now())
    }

    fn server(ip: &str, next: Option<&str>) -> Blade {
        let mut blade = blade(ip, None, None);
        blade_ownership(&mut blade).claim_for_director("vmserver", Utc::now());
        blade_ownership(&mut blade).next_owner = next.map(str::to_string);
        <crate::records::VmServer as crate::records::Section<Blade>>::of_mut(&mut blade).active = true;
        blade
    }

    fn fleet(blades: Vec<Blade>, vms: Vec<Vm>) -> FleetView {
        FleetView {
            blades,
            vms,
            director: "vmserver".into(),
        }
    }

    #[test]
    fn vms_count_as_a_share_of_their_server() {
        let fleet = fleet(
            vec![blade("1.1.1.1", Some("A"), None), server("2.2.2.2", None)],
            vec![vm("2.2.3.2", "2.2.2.2", "A"), vm("2.2.4.2", "2.2.2.2", "B")],
        );
        let allocations = fleet.allocations();
        assert_eq!(allocations["A"], 1.5);
        assert_eq!(allocations["B"], 0.5);
        assert!(!fleet.requestors().contains("vmserver"));
    }

    #[test]
    fn allow_any_hands_over_everything_queued() {
        let fleet = fleet(
            vec![blade("1.1.1.1", Some("A"), Some("B")), server("2.2.2.2", Some("C"))],
            vec![vm("2.2.3.2", "2.2.2.2", "A")],
        );
        let actions = AllowAny.plan(&fleet);
        assert!(actions.contains(&FairnessAction::RequestRelease {
            resource: "1.1.1.1".into()
        }));
        assert!(actions.contains(&FairnessAction::QueueOnVm {
            vm: "2.2.3.2".into(),
            next_owner: "C".into()
        }));
    }

    #[test]
    fn fair_only_moves_from_over_to_under_quota() {
        // A holds three of four blades, B holds one and waits for one of A's
        let fleet = fleet(
            vec![
                blade("1.1.1.1", Some("A"), Some("B")),
                blade("2.2.2.2", Some("A"), None),
                blade("3.3.3.3", Some("A"), None),
                blade("4.4.4.4", Some("B"), Some("A")),
            ],
            vec![],
        );
        let actions = Fair.plan(&fleet);
        assert_eq!(
            actions,
            vec![FairnessAction::RequestRelease {
                resource: "1.1.1.1".into()
            }]
        );
    }

    #[test]
    fn fair_never_moves_mixed_vm_servers() {
        // C holds one share through a VM but is under quota, so the server stays
        let fleet = fleet(
            vec![
                blade("1.1.1.1", Some("A"), None),
                blade("3.3.3.3", Some("A"), None),
                server("2.2.2.2", Some("B")),
            ],
            vec![vm("2.2.3.2", "2.2.2.2", "A"), vm("2.2.4.2", "2.2.2.2", "C")],
        );
        assert!(Fair.plan(&fleet).is_empty());
    }
}
