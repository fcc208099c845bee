//! Lock categories and the table of per-resource locks.
//!
//! Every resource has one [`ResourceLock`]. The lock is split into independent
//! categories so that, say, a BIOS write in flight does not block somebody
//! reading who owns the blade.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

mod resource_lock;

pub use resource_lock::{HolderId, ResourceLock};

bitflags::bitflags! {
    /// A set of lock categories. Single-bit values name one category.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockSet: u16 {
        const OWNERSHIP = 1 << 0;
        const BIOS = 1 << 1;
        const SNAPSHOT = 1 << 2;
        const NAS_OPERATIONS = 1 << 3;
        const VM_CREATION = 1 << 4;
        const VM_DEPLOY_STATE = 1 << 5;
        const IP_ADDRESSES = 1 << 6;
        const VIRTUAL_HARDWARE = 1 << 7;
        const LONG_RUNNING_BIOS = 1 << 8;
    }
}

/// Number of distinct categories, used to size per-category arrays.
pub(crate) const CATEGORY_COUNT: usize = 9;

impl LockSet {
    /// Slot of a single-category set in per-category arrays.
    pub(crate) fn index(self) -> usize {
        self.bits().trailing_zeros() as usize
    }

    /// Name of the first category in the set, for diagnostics.
    pub fn name(self) -> &'static str {
        self.iter_names().next().map(|(name, _)| name).unwrap_or("NONE")
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// A read set and a write set. Writing a category implies reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Grants {
    pub read: LockSet,
    pub write: LockSet,
}

impl Grants {
    pub fn new(read: LockSet, write: LockSet) -> Self {
        Self {
            read: read | write,
            write,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn read(read: LockSet) -> Self {
        Self::new(read, LockSet::empty())
    }

    pub fn write(write: LockSet) -> Self {
        Self::new(LockSet::empty(), write)
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
    }
}

impl fmt::Display for Grants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "read={} write={}", self.read, self.write)
    }
}

/// How long a caller may wait for each phase of an acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockTimeouts {
    pub reader: Duration,
    pub writer: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            reader: Duration::from_secs(30),
            writer: Duration::from_secs(10),
        }
    }
}

/// Who holds a category, captured when a wait gives up.
#[derive(Debug, Clone)]
pub struct HolderInfo {
    pub thread: String,
    pub writer: bool,
    pub held_for: Duration,
    pub backtrace: Option<String>,
}

impl fmt::Display for HolderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, held for {:?})",
            self.thread,
            if self.writer { "writer" } else { "reader" },
            self.held_for
        )?;
        if let Some(ref bt) = self.backtrace {
            write!(f, "\n{}", bt)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum LockError {
    /// The same logical thread already holds this category through another handle.
    Reentrant { resource: String, category: LockSet },
    Timeout {
        resource: String,
        category: LockSet,
        waited: Duration,
        holders: Vec<HolderInfo>,
    },
    /// Release of a grant that was never taken.
    NotHeld { resource: String, category: LockSet },
    Misuse {
        resource: String,
        category: LockSet,
        reason: &'static str,
    },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Reentrant { resource, category } => write!(
                f,
                "{} of {} is already held by this thread",
                category, resource
            ),
            LockError::Timeout {
                resource,
                category,
                waited,
                holders,
            } => {
                write!(
                    f,
                    "timed out after {:?} waiting for {} of {}",
                    waited, category, resource
                )?;
                for holder in holders {
                    write!(f, "\n  held by {}", holder)?;
                }
                Ok(())
            }
            LockError::NotHeld { resource, category } => {
                write!(f, "{} of {} is not held", category, resource)
            }
            LockError::Misuse {
                resource,
                category,
                reason,
            } => write!(f, "misuse of {} on {}: {}", category, resource, reason),
        }
    }
}

impl std::error::Error for LockError {}

/// Lazily populated map from resource key to its lock.
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<ResourceLock>>>,
    timeouts: LockTimeouts,
}

impl LockTable {
    pub fn new(timeouts: LockTimeouts) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeouts,
        }
    }

    pub fn get(&self, key: &str) -> Arc<ResourceLock> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ResourceLock::new(key, self.timeouts)))
            .clone()
    }

    /// True when no category of any known resource is held.
    pub fn all_unlocked(&self) -> bool {
        self.locks.lock().values().all(|lock| lock.is_unlocked())
    }
}
