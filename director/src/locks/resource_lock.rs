//! Per-resource reader/writer lock, one independent lock per category.
//!
//! Taking a write grant always goes through a read grant first and is then
//! upgraded in place: the upgrader slot is claimed while still holding the
//! read grant, new readers are held back, and the write grant is given once
//! the other readers drain. No other writer can slip in between.
//!
//! Holders are identified by the logical thread that created the handle.
//! A thread asking for a category it already holds through another handle is
//! a bug and is refused rather than left to deadlock.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use super::{CATEGORY_COUNT, Grants, HolderInfo, LockError, LockSet, LockTimeouts};

pub type HolderId = ThreadId;

#[derive(Debug)]
struct Holder {
    id: HolderId,
    thread_name: Option<String>,
    since: Instant,
    backtrace: Arc<Backtrace>,
}

impl Holder {
    fn current(id: HolderId) -> Self {
        Self {
            id,
            thread_name: std::thread::current().name().map(str::to_string),
            since: Instant::now(),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
}

#[derive(Debug, Default)]
struct CategoryState {
    readers: Vec<Holder>,
    writer: Option<HolderId>,
    /// Reader that is on its way to becoming the writer.
    upgrader: Option<HolderId>,
}

impl CategoryState {
    fn reads(&self, id: HolderId) -> bool {
        self.readers.iter().any(|h| h.id == id)
    }

    fn touches(&self, id: HolderId) -> bool {
        self.reads(id) || self.writer == Some(id) || self.upgrader == Some(id)
    }

    fn only_reader(&self, id: HolderId) -> bool {
        self.readers.len() == 1 && self.reads(id)
    }

    fn drop_reader(&mut self, id: HolderId) {
        self.readers.retain(|h| h.id != id);
    }

    fn drop_writer(&mut self, id: HolderId) {
        if self.writer == Some(id) {
            self.writer = None;
        }
        if self.upgrader == Some(id) {
            self.upgrader = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.upgrader.is_none()
    }

    fn holders(&self) -> Vec<HolderInfo> {
        self.readers
            .iter()
            .map(|h| HolderInfo {
                thread: match h.thread_name {
                    Some(ref name) => format!("{:?} '{}'", h.id, name),
                    None => format!("{:?}", h.id),
                },
                writer: self.writer == Some(h.id),
                held_for: h.since.elapsed(),
                backtrace: match h.backtrace.status() {
                    BacktraceStatus::Captured => Some(h.backtrace.to_string()),
                    _ => None,
                },
            })
            .collect()
    }
}

type Slots = [CategoryState; CATEGORY_COUNT];

/// What one acquisition call changed, so a failure can be rolled back.
enum Taken {
    Read(LockSet),
    Upgrade(LockSet),
}

pub struct ResourceLock {
    key: String,
    timeouts: LockTimeouts,
    slots: Mutex<Slots>,
    changed: Condvar,
}

impl ResourceLock {
    pub fn new(key: &str, timeouts: LockTimeouts) -> Self {
        Self {
            key: key.to_string(),
            timeouts,
            slots: Mutex::new(std::array::from_fn(|_| CategoryState::default())),
            changed: Condvar::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Take every category in `wanted` that `held` does not already cover.
    ///
    /// Blocks until granted. On any failure the grants taken by this call are
    /// given back, so the holder ends up exactly where it started.
    pub fn acquire(&self, holder: HolderId, held: Grants, wanted: Grants) -> Result<(), LockError> {
        let wanted = Grants::new(wanted.read, wanted.write);
        let mut slots = self.slots.lock();
        let mut taken: Vec<Taken> = Vec::new();

        for category in wanted.read.iter() {
            let want_write = wanted.write.contains(category);
            if held.write.contains(category) || (held.read.contains(category) && !want_write) {
                continue;
            }

            let step = if held.read.contains(category) {
                self.upgrade(&mut slots, holder, category)
                    .map(|_| taken.push(Taken::Upgrade(category)))
            } else {
                match self.take_read(&mut slots, holder, category, want_write) {
                    Ok(()) => {
                        taken.push(Taken::Read(category));
                        if want_write {
                            let deadline = Instant::now() + self.timeouts.writer;
                            self.drain_readers(&mut slots, holder, category, deadline)
                                .map(|_| taken.push(Taken::Upgrade(category)))
                        } else {
                            Ok(())
                        }
                    }
                    Err(err) => Err(err),
                }
            };

            if let Err(err) = step {
                for undo in taken.into_iter().rev() {
                    match undo {
                        Taken::Read(c) => {
                            let slot = &mut slots[c.index()];
                            slot.drop_writer(holder);
                            slot.drop_reader(holder);
                        }
                        Taken::Upgrade(c) => slots[c.index()].drop_writer(holder),
                    }
                }
                self.changed.notify_all();
                return Err(err);
            }
        }

        Ok(())
    }

    /// Give back grants.
    ///
    /// Categories in `write` lose their writer grant; if they are also in
    /// `read` the reader grant goes too, otherwise the holder keeps reading.
    /// Categories only in `read` lose the reader grant, which is refused while
    /// the holder still writes them.
    pub fn release(&self, holder: HolderId, read: LockSet, write: LockSet) -> Result<(), LockError> {
        let mut slots = self.slots.lock();

        for category in write.iter() {
            if slots[category.index()].writer != Some(holder) {
                return Err(LockError::NotHeld {
                    resource: self.key.clone(),
                    category,
                });
            }
        }
        for category in read.difference(write).iter() {
            let slot = &slots[category.index()];
            if slot.writer == Some(holder) {
                return Err(LockError::Misuse {
                    resource: self.key.clone(),
                    category,
                    reason: "reader released while the writer grant is still held",
                });
            }
            if !slot.reads(holder) {
                return Err(LockError::NotHeld {
                    resource: self.key.clone(),
                    category,
                });
            }
        }

        for category in write.iter() {
            let slot = &mut slots[category.index()];
            slot.drop_writer(holder);
            if read.contains(category) {
                slot.drop_reader(holder);
            }
        }
        for category in read.difference(write).iter() {
            slots[category.index()].drop_reader(holder);
        }

        drop(slots);
        self.changed.notify_all();
        Ok(())
    }

    /// Turn writer grants in `set` back into reader grants.
    pub fn downgrade(&self, holder: HolderId, set: LockSet) -> Result<(), LockError> {
        self.release(holder, LockSet::empty(), set)
    }

    /// Grants the lock currently records for `holder`.
    pub fn held_by(&self, holder: HolderId) -> Grants {
        let slots = self.slots.lock();
        let mut grants = Grants::none();
        for category in LockSet::all().iter() {
            let slot = &slots[category.index()];
            if slot.reads(holder) {
                grants.read |= category;
            }
            if slot.writer == Some(holder) {
                grants.write |= category;
            }
        }
        grants
    }

    pub fn is_unlocked(&self) -> bool {
        self.slots.lock().iter().all(CategoryState::is_idle)
    }

    /// True when `holder` holds exactly these grants.
    pub fn assert_locks(&self, holder: HolderId, read: LockSet, write: LockSet) -> bool {
        self.held_by(holder) == Grants::new(read, write)
    }

    fn take_read(
        &self,
        slots: &mut MutexGuard<'_, Slots>,
        holder: HolderId,
        category: LockSet,
        for_upgrade: bool,
    ) -> Result<(), LockError> {
        if slots[category.index()].touches(holder) {
            return Err(LockError::Reentrant {
                resource: self.key.clone(),
                category,
            });
        }

        let deadline = Instant::now() + self.timeouts.reader;
        self.wait(slots, category, deadline, |slot| {
            slot.writer.is_none() && slot.upgrader.is_none()
        })?;

        let slot = &mut slots[category.index()];
        slot.readers.push(Holder::current(holder));
        if for_upgrade {
            slot.upgrader = Some(holder);
        }
        Ok(())
    }

    fn upgrade(
        &self,
        slots: &mut MutexGuard<'_, Slots>,
        holder: HolderId,
        category: LockSet,
    ) -> Result<(), LockError> {
        if !slots[category.index()].reads(holder) {
            return Err(LockError::NotHeld {
                resource: self.key.clone(),
                category,
            });
        }

        let deadline = Instant::now() + self.timeouts.writer;
        self.wait(slots, category, deadline, |slot| slot.upgrader.is_none())?;
        slots[category.index()].upgrader = Some(holder);

        if let Err(err) = self.drain_readers(slots, holder, category, deadline) {
            slots[category.index()].upgrader = None;
            self.changed.notify_all();
            return Err(err);
        }
        Ok(())
    }

    /// Second half of an upgrade: wait until we are the only reader left.
    fn drain_readers(
        &self,
        slots: &mut MutexGuard<'_, Slots>,
        holder: HolderId,
        category: LockSet,
        deadline: Instant,
    ) -> Result<(), LockError> {
        self.wait(slots, category, deadline, |slot| slot.only_reader(holder))?;
        slots[category.index()].writer = Some(holder);
        Ok(())
    }

    fn wait<F>(
        &self,
        slots: &mut MutexGuard<'_, Slots>,
        category: LockSet,
        deadline: Instant,
        ready: F,
    ) -> Result<(), LockError>
    where
        F: Fn(&CategoryState) -> bool,
    {
        let started = Instant::now();
        loop {
            if ready(&slots[category.index()]) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let holders = slots[category.index()].holders();
                warn!(
                    resource = %self.key,
                    category = %category,
                    holders = holders.len(),
                    "Lock wait timed out"
                );
                return Err(LockError::Timeout {
                    resource: self.key.clone(),
                    category,
                    waited: started.elapsed(),
                    holders,
                });
            }
            self.changed.wait_until(slots, deadline);
        }
    }
}

impl std::fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn short() -> LockTimeouts {
        LockTimeouts {
            reader: Duration::from_millis(200),
            writer: Duration::from_millis(200),
        }
    }

    fn me() -> HolderId {
        thread::current().id()
    }

    #[test]
    fn write_then_release_leaves_lock_idle() {
        let lock = ResourceLock::new("1.1.1.1", short());
        lock.acquire(me(), Grants::none(), Grants::write(LockSet::OWNERSHIP))
            .unwrap();
        assert!(lock.assert_locks(me(), LockSet::OWNERSHIP, LockSet::OWNERSHIP));

        lock.release(me(), LockSet::OWNERSHIP, LockSet::OWNERSHIP).unwrap();
        assert!(lock.is_unlocked());
    }

    #[test]
    fn releasing_only_write_keeps_reader() {
        let lock = ResourceLock::new("1.1.1.1", short());
        lock.acquire(me(), Grants::none(), Grants::write(LockSet::BIOS))
            .unwrap();

        lock.downgrade(me(), LockSet::BIOS).unwrap();
        assert!(lock.assert_locks(me(), LockSet::BIOS, LockSet::empty()));

        lock.release(me(), LockSet::BIOS, LockSet::empty()).unwrap();
        assert!(lock.is_unlocked());
    }

    #[test]
    fn reader_cannot_be_released_under_writer() {
        let lock = ResourceLock::new("1.1.1.1", short());
        lock.acquire(me(), Grants::none(), Grants::write(LockSet::SNAPSHOT))
            .unwrap();
        let err = lock
            .release(me(), LockSet::SNAPSHOT, LockSet::empty())
            .unwrap_err();
        assert!(matches!(err, LockError::Misuse { .. }));
    }

    #[test]
    fn second_handle_on_same_thread_is_refused() {
        let lock = ResourceLock::new("1.1.1.1", short());
        lock.acquire(me(), Grants::none(), Grants::read(LockSet::OWNERSHIP))
            .unwrap();
        let err = lock
            .acquire(me(), Grants::none(), Grants::read(LockSet::OWNERSHIP))
            .unwrap_err();
        assert!(matches!(err, LockError::Reentrant { .. }));
    }

    #[test]
    fn readers_share_and_writer_times_out_with_holders() {
        let lock = Arc::new(ResourceLock::new("1.1.1.1", short()));
        lock.acquire(me(), Grants::none(), Grants::read(LockSet::OWNERSHIP))
            .unwrap();

        let other = lock.clone();
        let result = thread::spawn(move || {
            let id = thread::current().id();
            other
                .acquire(id, Grants::none(), Grants::read(LockSet::OWNERSHIP))
                .unwrap();
            other.release(id, LockSet::OWNERSHIP, LockSet::empty()).unwrap();
            other.acquire(id, Grants::none(), Grants::write(LockSet::OWNERSHIP))
        })
        .join()
        .unwrap();

        match result {
            Err(LockError::Timeout { holders, category, .. }) => {
                assert_eq!(category, LockSet::OWNERSHIP);
                // both the blocking reader and the would-be writer are listed
                assert_eq!(holders.len(), 2);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        // the failed writer must not leave anything behind
        assert!(lock.assert_locks(me(), LockSet::OWNERSHIP, LockSet::empty()));
        lock.release(me(), LockSet::OWNERSHIP, LockSet::empty()).unwrap();
        assert!(lock.is_unlocked());
    }

    #[test]
    fn categories_are_independent() {
        let lock = Arc::new(ResourceLock::new("1.1.1.1", short()));
        lock.acquire(me(), Grants::none(), Grants::write(LockSet::BIOS))
            .unwrap();

        let other = lock.clone();
        thread::spawn(move || {
            let id = thread::current().id();
            other
                .acquire(id, Grants::none(), Grants::write(LockSet::OWNERSHIP))
                .unwrap();
            other.release(id, LockSet::OWNERSHIP, LockSet::OWNERSHIP).unwrap();
        })
        .join()
        .unwrap();

        lock.release(me(), LockSet::BIOS, LockSet::BIOS).unwrap();
        assert!(lock.is_unlocked());
    }

    #[test]
    fn upgrade_waits_for_readers_to_leave() {
        let lock = Arc::new(ResourceLock::new(
            "1.1.1.1",
            LockTimeouts {
                reader: Duration::from_secs(5),
                writer: Duration::from_secs(5),
            },
        ));
        let (reading_tx, reading_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let other = lock.clone();
        let reader = thread::spawn(move || {
            let id = thread::current().id();
            other
                .acquire(id, Grants::none(), Grants::read(LockSet::OWNERSHIP))
                .unwrap();
            reading_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            other.release(id, LockSet::OWNERSHIP, LockSet::empty()).unwrap();
        });

        reading_rx.recv().unwrap();
        lock.acquire(me(), Grants::none(), Grants::read(LockSet::OWNERSHIP))
            .unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            done_tx.send(()).unwrap();
        });

        lock.acquire(
            me(),
            Grants::read(LockSet::OWNERSHIP),
            Grants::write(LockSet::OWNERSHIP),
        )
        .unwrap();
        assert!(lock.assert_locks(me(), LockSet::OWNERSHIP, LockSet::OWNERSHIP));

        reader.join().unwrap();
        releaser.join().unwrap();
        lock.release(me(), LockSet::OWNERSHIP, LockSet::OWNERSHIP).unwrap();
        assert!(lock.is_unlocked());
    }
}
