//! Lock-guarded record handles.
//!
//! A [`Locked`] handle is the only way to reach a record's sections. It takes
//! its grants from the resource lock when created, loads the record, and on
//! drop writes back whatever was changed and gives the grants back. Moving the
//! handle moves the lock with it; there is no other way to hand it over.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::error::{Access, DirectorError, Result};
use crate::locks::{Grants, HolderId, LockError, LockSet, LockTable, ResourceLock};
use crate::records::{self, Record, Section};
use crate::store::{self, HostDb};

/// Exemptions from the in-flight transition checks done by [`Record::admit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permits {
    /// The caller is the BIOS worker of this resource.
    pub during_bios: bool,
    /// The caller is bringing this blade up as a VM server.
    pub during_vm_deploy: bool,
}

impl Permits {
    pub fn during_bios() -> Self {
        Self {
            during_bios: true,
            ..Self::default()
        }
    }

    pub fn during_vm_deploy() -> Self {
        Self {
            during_vm_deploy: true,
            ..Self::default()
        }
    }
}

/// Store plus lock table; hands out [`Locked`] handles.
#[derive(Clone)]
pub struct LockedStore {
    db: Arc<dyn HostDb>,
    locks: Arc<LockTable>,
}

impl LockedStore {
    pub fn new(db: Arc<dyn HostDb>, locks: Arc<LockTable>) -> Self {
        Self { db, locks }
    }

    pub fn db(&self) -> &dyn HostDb {
        self.db.as_ref()
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Lock `key` with `grants` and load it. Blocks until the grants are given.
    pub fn lock<E: Record>(&self, key: &str, grants: Grants) -> Result<Locked<E>> {
        Locked::acquire(self, key, grants, Permits::default())
    }

    pub fn lock_with<E: Record>(&self, key: &str, grants: Grants, permits: Permits) -> Result<Locked<E>> {
        Locked::acquire(self, key, grants, permits)
    }
}

pub struct Locked<E: Record> {
    record: E,
    grants: Grants,
    /// Sections written through this handle and not yet flushed.
    dirty: LockSet,
    permits: Permits,
    holder: HolderId,
    lock: Arc<ResourceLock>,
    db: Arc<dyn HostDb>,
}

impl<E: Record> Locked<E> {
    fn acquire(store: &LockedStore, key: &str, grants: Grants, permits: Permits) -> Result<Self> {
        let grants = Grants::new(grants.read, grants.write);
        let holder = thread::current().id();
        let lock = store.locks.get(key);
        lock.acquire(holder, Grants::none(), grants)?;

        let give_back = |lock: &ResourceLock| {
            if let Err(err) = lock.release(holder, grants.read, grants.write) {
                error!(resource = %key, error = %err, "Failed to give back grants");
            }
        };

        let record = match store::load_record::<E>(store.db.as_ref(), key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                give_back(&lock);
                return Err(DirectorError::NotFound(key.to_string()));
            }
            Err(err) => {
                give_back(&lock);
                return Err(err.into());
            }
        };

        if let Err(reason) = record.admit(grants, permits) {
            give_back(&lock);
            return Err(DirectorError::AccessDenied {
                resource: key.to_string(),
                reason,
            });
        }

        debug!(resource = %key, grants = %grants, "Acquired handle");
        Ok(Self {
            record,
            grants,
            dirty: LockSet::empty(),
            permits,
            holder,
            lock,
            db: store.db.clone(),
        })
    }

    pub fn key(&self) -> &str {
        self.record.key()
    }

    pub fn parent(&self) -> Option<&str> {
        self.record.parent()
    }

    pub fn grants(&self) -> Grants {
        self.grants
    }

    pub fn read<S: Section<E>>(&self) -> Result<&S> {
        if !self.grants.read.contains(S::CATEGORY) {
            return Err(self.violation::<S>(Access::Read));
        }
        Ok(S::of(&self.record))
    }

    pub fn write<S: Section<E>>(&mut self) -> Result<&mut S> {
        if !self.grants.write.contains(S::CATEGORY) {
            return Err(self.violation::<S>(Access::Write));
        }
        self.dirty |= S::CATEGORY;
        Ok(S::of_mut(&mut self.record))
    }

    fn violation<S: Section<E>>(&self, access: Access) -> DirectorError {
        DirectorError::LockViolation {
            resource: self.key().to_string(),
            section: S::NAME,
            access,
        }
    }

    /// Add `more` to the held grants.
    ///
    /// Sections of categories not readable before are reloaded, since another
    /// writer may have changed them in the meantime. On failure the handle is
    /// left exactly as it was.
    pub fn upgrade(&mut self, more: Grants) -> Result<()> {
        let target = Grants::new(
            self.grants.read | more.read,
            self.grants.write | more.write,
        );
        if target == self.grants {
            return Ok(());
        }
        self.lock.acquire(self.holder, self.grants, target)?;

        let fresh_read = target.read.difference(self.grants.read);
        let fresh_write = target.write.difference(self.grants.write);
        let checked = self.reload(fresh_read).and_then(|_| {
            self.record
                .admit(target, self.permits)
                .map_err(|reason| DirectorError::AccessDenied {
                    resource: self.key().to_string(),
                    reason,
                })
        });

        if let Err(err) = checked {
            if let Err(undo) = self.lock.release(self.holder, fresh_read, fresh_write) {
                error!(resource = %self.key(), error = %undo, "Failed to roll back upgrade");
            }
            return Err(err);
        }

        self.grants = target;
        Ok(())
    }

    /// Shrink the held grants to `target`, flushing sections whose write
    /// grant goes away.
    pub fn downgrade_to(&mut self, target: Grants) -> Result<()> {
        let target = Grants::new(target.read, target.write);
        if !self.grants.read.contains(target.read) || !self.grants.write.contains(target.write) {
            return Err(LockError::Misuse {
                resource: self.key().to_string(),
                category: target.read.difference(self.grants.read)
                    | target.write.difference(self.grants.write),
                reason: "downgrade asked for grants not held",
            }
            .into());
        }

        let lost_write = self.grants.write.difference(target.write);
        let lost_read = self.grants.read.difference(target.read);
        self.flush_set(self.dirty & lost_write)?;
        self.lock.release(self.holder, lost_read, lost_write)?;
        self.grants = target;
        Ok(())
    }

    /// Write back every dirty section now, keeping the grants.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_set(self.dirty)
    }

    /// Delete the record and give back every grant. Needs write on ownership.
    pub fn delete(mut self) -> Result<()> {
        if !self.grants.write.contains(LockSet::OWNERSHIP) {
            return Err(DirectorError::LockViolation {
                resource: self.key().to_string(),
                section: records::IDENTITY,
                access: Access::Write,
            });
        }
        self.dirty = LockSet::empty();
        self.db.delete(E::KIND, self.record.key())?;
        debug!(resource = %self.key(), "Deleted record");
        Ok(())
    }

    fn flush_set(&mut self, set: LockSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }
        store::save_sections(self.db.as_ref(), &self.record, set)?;
        self.dirty.remove(set);
        Ok(())
    }

    fn reload(&mut self, set: LockSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }
        let fresh = self
            .db
            .load(E::KIND, self.record.key())?
            .ok_or_else(|| DirectorError::NotFound(self.record.key().to_string()))?;
        self.record = records::merge(&self.record, &fresh, set)
            .map_err(|err| DirectorError::Store(err.into()))?;
        Ok(())
    }
}

impl<E: Record> Drop for Locked<E> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(resource = %self.key(), error = %err, "Failed to flush handle on drop");
        }
        if let Err(err) = self
            .lock
            .release(self.holder, self.grants.read, self.grants.write)
        {
            error!(resource = %self.key(), error = %err, "Failed to release handle on drop");
        }
    }
}

impl<E: Record + std::fmt::Debug> std::fmt::Debug for Locked<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locked")
            .field("key", &self.key())
            .field("grants", &self.grants)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use chrono::Utc;

    use super::*;
    use crate::locks::LockTimeouts;
    use crate::records::{Bios, BiosDeploy, Blade, BladeSpec, Ownership};
    use crate::store::MemoryHostDb;

    fn setup() -> LockedStore {
        let db: Arc<dyn HostDb> = Arc::new(MemoryHostDb::new());
        let blade = Blade::new(BladeSpec::from_ip("1.1.1.1"), "clean", Utc::now());
        store::insert_record(db.as_ref(), &blade).unwrap();
        LockedStore::new(db, Arc::new(LockTable::new(LockTimeouts::default())))
    }

    #[test]
    fn access_outside_grants_is_a_violation() {
        let store = setup();
        let mut handle = store
            .lock::<Blade>("1.1.1.1", Grants::read(LockSet::OWNERSHIP))
            .unwrap();
        assert!(handle.read::<Ownership>().is_ok());
        assert!(matches!(
            handle.write::<Ownership>(),
            Err(DirectorError::LockViolation {
                section: "ownership",
                access: Access::Write,
                ..
            })
        ));
        assert!(matches!(
            handle.read::<Bios>(),
            Err(DirectorError::LockViolation {
                section: "bios",
                access: Access::Read,
                ..
            })
        ));
    }

    #[test]
    fn unknown_resource_is_not_found_and_leaves_no_lock() {
        let store = setup();
        let err = store
            .lock::<Blade>("9.9.9.9", Grants::write(LockSet::OWNERSHIP))
            .unwrap_err();
        assert!(matches!(err, DirectorError::NotFound(_)));
        assert!(store.locks().all_unlocked());
    }

    #[test]
    fn drop_flushes_and_releases() {
        let store = setup();
        {
            let mut handle = store
                .lock::<Blade>("1.1.1.1", Grants::write(LockSet::OWNERSHIP))
                .unwrap();
            handle.write::<Ownership>().unwrap().claim("A", Utc::now());
        }
        assert!(store.locks().all_unlocked());

        let handle = store
            .lock::<Blade>("1.1.1.1", Grants::read(LockSet::OWNERSHIP))
            .unwrap();
        assert!(handle.read::<Ownership>().unwrap().is_owned_by("A"));
    }

    #[test]
    fn downgrade_flushes_released_writes() {
        let store = setup();
        let mut handle = store
            .lock::<Blade>("1.1.1.1", Grants::write(LockSet::OWNERSHIP | LockSet::BIOS))
            .unwrap();
        handle.write::<Ownership>().unwrap().claim("A", Utc::now());
        handle.write::<Bios>().unwrap().last_deployed = Some("<bios/>".into());

        handle
            .downgrade_to(Grants::new(LockSet::OWNERSHIP | LockSet::BIOS, LockSet::BIOS))
            .unwrap();
        let stored: Blade = store::load_record(store.db(), "1.1.1.1").unwrap().unwrap();
        assert!(stored.ownership().is_owned_by("A"));
        // still held for write, not flushed yet
        assert_eq!(stored.bios().last_deployed, None);

        assert!(handle.downgrade_to(Grants::write(LockSet::SNAPSHOT)).is_err());
        drop(handle);
        let stored: Blade = store::load_record(store.db(), "1.1.1.1").unwrap().unwrap();
        assert_eq!(stored.bios().last_deployed.as_deref(), Some("<bios/>"));
    }

    #[test]
    fn upgrade_rereads_sections_changed_by_others() {
        let store = setup();
        let mut handle = store.lock::<Blade>("1.1.1.1", Grants::none()).unwrap();

        let other = store.clone();
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut writer = other
                .lock::<Blade>("1.1.1.1", Grants::write(LockSet::OWNERSHIP))
                .unwrap();
            writer.write::<Ownership>().unwrap().claim("B", Utc::now());
            drop(writer);
            done_tx.send(()).unwrap();
        });
        done_rx.recv().unwrap();

        handle.upgrade(Grants::read(LockSet::OWNERSHIP)).unwrap();
        assert!(handle.read::<Ownership>().unwrap().is_owned_by("B"));
    }

    #[test]
    fn bios_in_flight_denies_handles_without_permit() {
        let store = setup();
        {
            let mut handle = store
                .lock::<Blade>("1.1.1.1", Grants::write(LockSet::LONG_RUNNING_BIOS))
                .unwrap();
            handle.write::<BiosDeploy>().unwrap().in_progress = true;
        }

        let grants = Grants::new(LockSet::LONG_RUNNING_BIOS, LockSet::BIOS);
        let err = store.lock::<Blade>("1.1.1.1", grants).unwrap_err();
        assert!(matches!(err, DirectorError::AccessDenied { .. }));
        assert!(store.locks().all_unlocked());
        assert!(
            store
                .lock_with::<Blade>("1.1.1.1", grants, Permits::during_bios())
                .is_ok()
        );
    }

    #[test]
    fn delete_needs_ownership_write() {
        let store = setup();
        let handle = store
            .lock::<Blade>("1.1.1.1", Grants::read(LockSet::OWNERSHIP))
            .unwrap();
        assert!(handle.delete().is_err());
        assert!(store.locks().all_unlocked());

        let handle = store
            .lock::<Blade>("1.1.1.1", Grants::write(LockSet::OWNERSHIP))
            .unwrap();
        handle.delete().unwrap();
        assert!(store.locks().all_unlocked());
        assert!(store.db().kind_of("1.1.1.1").unwrap().is_none());
    }
}
