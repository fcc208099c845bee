//! Persisted resource records.
//!
//! A record is an immutable identity plus a handful of *sections*. Each
//! section belongs to exactly one lock category, so a handle can only reach a
//! section through a grant on that category (see [`crate::lockable`]). The
//! store persists sections independently, which lets two writers holding
//! different categories of the same resource flush without clobbering each
//! other.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lockable::Permits;
use crate::locks::{Grants, LockSet};

/// Section name under which the identity is stored.
pub const IDENTITY: &str = "identity";

/// Section name -> JSON body, the unit the store works with.
pub type Sections = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Blade,
    Vm,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Blade => "blade",
            RecordKind::Vm => "vm",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: RecordKind;
    /// Every section and the category guarding it.
    const SECTIONS: &'static [(&'static str, LockSet)];

    fn key(&self) -> &str;

    fn parent(&self) -> Option<&str> {
        None
    }

    /// Refuse grants that would interfere with a transition in flight.
    fn admit(&self, _grants: Grants, _permits: Permits) -> Result<(), String> {
        Ok(())
    }

    fn section_names(set: LockSet) -> Vec<&'static str> {
        Self::SECTIONS
            .iter()
            .filter(|(_, category)| set.intersects(*category))
            .map(|(name, _)| *name)
            .collect()
    }
}

/// A piece of a record reachable only under one lock category.
pub trait Section<E: Record> {
    const NAME: &'static str;
    const CATEGORY: LockSet;

    fn of(record: &E) -> &Self;
    fn of_mut(record: &mut E) -> &mut Self;
}

/// Wires section fields of a record to their categories.
macro_rules! sections {
    ($record:ty { $($field:ident : $section:ty => $category:expr),* $(,)? }) => {
        $(
            impl $crate::records::Section<$record> for $section {
                const NAME: &'static str = stringify!($field);
                const CATEGORY: $crate::locks::LockSet = $category;

                fn of(record: &$record) -> &Self {
                    &record.$field
                }

                fn of_mut(record: &mut $record) -> &mut Self {
                    &mut record.$field
                }
            }
        )*

        impl $record {
            pub(crate) const SECTION_TABLE: &'static [(&'static str, $crate::locks::LockSet)] =
                &[$((stringify!($field), $category)),*];
        }
    };
}
pub(crate) use sections;

mod blade;
mod vm;

pub use blade::{Bios, BiosDeploy, Blade, BladeNetwork, BladeSpec, VmDeploy, VmDeployState, VmServer};
pub use vm::{VirtualHardware, Vm, VmHardwareSpec, VmNetwork, VmProvisioning, VmSoftwareSpec};

/// Serialize the identity and the sections guarded by `set`.
pub fn encode<E: Record>(record: &E, set: LockSet, with_identity: bool) -> serde_json::Result<Sections> {
    let mut all = match serde_json::to_value(record)? {
        Value::Object(map) => map,
        _ => {
            return Err(<serde_json::Error as serde::ser::Error>::custom(
                "record did not serialize to an object",
            ));
        }
    };

    let mut sections = Sections::new();
    if with_identity {
        if let Some(identity) = all.remove(IDENTITY) {
            sections.insert(IDENTITY.to_string(), identity);
        }
    }
    for name in E::section_names(set) {
        if let Some(body) = all.remove(name) {
            sections.insert(name.to_string(), body);
        }
    }
    Ok(sections)
}

pub fn decode<E: Record>(sections: Sections) -> serde_json::Result<E> {
    serde_json::from_value(Value::Object(sections.into_iter().collect()))
}

/// Overwrite the sections of `record` guarded by `set` with the ones in `fresh`.
pub fn merge<E: Record>(record: &E, fresh: &Sections, set: LockSet) -> serde_json::Result<E> {
    let mut current = encode(record, LockSet::all(), true)?;
    for name in E::section_names(set) {
        if let Some(body) = fresh.get(name) {
            current.insert(name.to_string(), body.clone());
        }
    }
    decode(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    Unused,
    ReleaseRequested,
    InUseByDirector,
    InUse,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Unused => "unused",
            ResourceState::ReleaseRequested => "releaseRequested",
            ResourceState::InUseByDirector => "inUseByDirector",
            ResourceState::InUse => "inUse",
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What `get_status` reports to a requestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceStatus {
    Unused,
    Yours,
    NotYours,
    ReleasePending,
    NotFound,
}

/// Who has a resource and who is waiting for it. Shared by blades and VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub state: ResourceState,
    pub current_owner: Option<String>,
    pub next_owner: Option<String>,
    pub last_keep_alive: DateTime<Utc>,
}

impl Ownership {
    pub fn unused(now: DateTime<Utc>) -> Self {
        Self {
            state: ResourceState::Unused,
            current_owner: None,
            next_owner: None,
            last_keep_alive: now,
        }
    }

    pub fn owned_by(owner: &str, now: DateTime<Utc>) -> Self {
        let mut ownership = Self::unused(now);
        ownership.claim(owner, now);
        ownership
    }

    pub fn is_owned_by(&self, who: &str) -> bool {
        self.current_owner.as_deref() == Some(who)
    }

    pub fn is_queued_for(&self, who: &str) -> bool {
        self.next_owner.as_deref() == Some(who)
    }

    pub fn claim(&mut self, owner: &str, now: DateTime<Utc>) {
        self.state = ResourceState::InUse;
        self.current_owner = Some(owner.to_string());
        self.next_owner = None;
        self.last_keep_alive = now;
    }

    pub fn claim_for_director(&mut self, director: &str, now: DateTime<Utc>) {
        self.state = ResourceState::InUseByDirector;
        self.current_owner = Some(director.to_string());
        self.next_owner = None;
        self.last_keep_alive = now;
    }

    /// Take the single queue slot.
    pub fn enqueue(&mut self, who: &str) {
        self.next_owner = Some(who.to_string());
        self.state = ResourceState::ReleaseRequested;
    }

    /// Hand the resource to whoever is queued, or free it. Returns the new owner.
    pub fn promote_or_free(&mut self, now: DateTime<Utc>) -> Option<String> {
        match self.next_owner.take() {
            Some(next) => {
                self.claim(&next, now);
                Some(next)
            }
            None => {
                *self = Self::unused(now);
                None
            }
        }
    }

    pub fn keep_alive_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Some(ref owner) = self.current_owner else {
            return false;
        };
        if owner.is_empty() {
            return false;
        }
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now > self.last_keep_alive + timeout,
            Err(_) => false,
        }
    }

    pub fn status_for(&self, who: &str) -> ResourceStatus {
        match self.state {
            ResourceState::Unused => ResourceStatus::Unused,
            ResourceState::ReleaseRequested if self.is_owned_by(who) || self.is_queued_for(who) => {
                ResourceStatus::ReleasePending
            }
            ResourceState::InUse | ResourceState::InUseByDirector if self.is_owned_by(who) => {
                ResourceStatus::Yours
            }
            _ => ResourceStatus::NotYours,
        }
    }

    /// Check the state/owner invariants hold.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            ResourceState::Unused => self.current_owner.is_none() && self.next_owner.is_none(),
            ResourceState::InUse | ResourceState::InUseByDirector => self.current_owner.is_some(),
            ResourceState::ReleaseRequested => {
                self.current_owner.is_some() && self.next_owner.is_some()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub current: String,
}
