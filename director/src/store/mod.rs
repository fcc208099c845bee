//! Persistence Port
//!
//! The director only talks to storage through [`HostDb`]. Records are kept as
//! an identity plus independently stored sections (see [`crate::records`]);
//! `update` touches only the sections it is given.
//!
//! Two implementations ship with the crate: [`MemoryHostDb`] for tests and
//! throwaway runs, and [`SqliteHostDb`] for a persistent director.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::locks::LockSet;
use crate::records::{self, Record, RecordKind, Sections};

mod memory;
mod sqlite;

pub use memory::MemoryHostDb;
pub use sqlite::SqliteHostDb;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
    Encoding(serde_json::Error),
    InvalidData(String),
    NotFound(String),
    AlreadyExists(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(err) => write!(f, "Database error: {}", err),
            StoreError::Encoding(err) => write!(f, "Encoding error: {}", err),
            StoreError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            StoreError::NotFound(key) => write!(f, "Not found: {}", key),
            StoreError::AlreadyExists(key) => write!(f, "Already exists: {}", key),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(err) => Some(err),
            StoreError::Encoding(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding(err)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(EventLevel::Info),
            "warn" => Some(EventLevel::Warn),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

/// One line of a resource's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub id: Uuid,
    pub resource: String,
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

impl ResourceEvent {
    pub fn new(resource: &str, at: DateTime<Utc>, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            resource: resource.to_string(),
            at,
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.at.to_rfc3339(),
            self.level.as_str(),
            self.resource,
            self.message
        )
    }
}

// ============================================================================
// Port
// ============================================================================

/// Storage for sectioned records and their event trail.
///
/// Keys are unique across kinds. Implementations assume a single writer per
/// section, which the lock table guarantees.
pub trait HostDb: Send + Sync {
    /// Store a new record. Fails with `AlreadyExists` if the key is taken.
    fn insert(&self, kind: RecordKind, key: &str, parent: Option<&str>, sections: Sections) -> Result<()>;

    /// All stored sections of a record, or `None` if there is no such record
    /// of that kind.
    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<Sections>>;

    /// Replace the given sections, leaving the others untouched.
    fn update(&self, kind: RecordKind, key: &str, sections: Sections) -> Result<()>;

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;

    fn kind_of(&self, key: &str) -> Result<Option<RecordKind>>;

    /// Keys of every record of `kind`, sorted.
    fn keys(&self, kind: RecordKind) -> Result<Vec<String>>;

    /// Keys of the records whose parent is `parent`, sorted.
    fn children(&self, parent: &str) -> Result<Vec<String>>;

    /// Drop every record and event.
    fn clear(&self) -> Result<()>;

    fn append_event(&self, event: &ResourceEvent) -> Result<()>;

    /// Events of one resource, oldest first.
    fn events(&self, resource: &str) -> Result<Vec<ResourceEvent>>;
}

// ============================================================================
// Typed helpers
// ============================================================================

pub fn load_record<E: Record>(db: &dyn HostDb, key: &str) -> Result<Option<E>> {
    match db.load(E::KIND, key)? {
        Some(sections) => Ok(Some(records::decode(sections)?)),
        None => Ok(None),
    }
}

pub fn insert_record<E: Record>(db: &dyn HostDb, record: &E) -> Result<()> {
    let sections = records::encode(record, LockSet::all(), true)?;
    db.insert(E::KIND, record.key(), record.parent(), sections)
}

/// Write back the sections of `record` guarded by `set`.
pub fn save_sections<E: Record>(db: &dyn HostDb, record: &E, set: LockSet) -> Result<()> {
    let sections = records::encode(record, set, false)?;
    if sections.is_empty() {
        return Ok(());
    }
    db.update(E::KIND, record.key(), sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Blade, BladeSpec};

    pub(crate) fn exercise(db: &dyn HostDb) {
        let now = Utc::now();
        let blade = Blade::new(BladeSpec::from_ip("1.1.1.1"), "clean", now);
        insert_record(db, &blade).unwrap();
        assert!(matches!(
            insert_record(db, &blade),
            Err(StoreError::AlreadyExists(_))
        ));

        assert_eq!(db.kind_of("1.1.1.1").unwrap(), Some(RecordKind::Blade));
        assert!(db.load(RecordKind::Vm, "1.1.1.1").unwrap().is_none());
        assert_eq!(load_record::<Blade>(db, "1.1.1.1").unwrap(), Some(blade.clone()));

        // partial update keeps unrelated sections
        let mut claimed = blade.clone();
        let mut sections = records::encode(&claimed, LockSet::all(), true).unwrap();
        sections.retain(|name, _| name == "ownership");
        let mut ownership = claimed.ownership().clone();
        ownership.claim("A", now);
        sections.insert("ownership".into(), serde_json::to_value(&ownership).unwrap());
        db.update(RecordKind::Blade, "1.1.1.1", sections).unwrap();
        claimed = load_record::<Blade>(db, "1.1.1.1").unwrap().unwrap();
        assert!(claimed.ownership().is_owned_by("A"));
        assert_eq!(claimed.network(), blade.network());

        db.insert(RecordKind::Vm, "1.1.2.1", Some("1.1.1.1"), Sections::new())
            .unwrap();
        assert_eq!(db.children("1.1.1.1").unwrap(), vec!["1.1.2.1".to_string()]);
        assert_eq!(db.keys(RecordKind::Blade).unwrap(), vec!["1.1.1.1".to_string()]);

        db.append_event(&ResourceEvent::new("1.1.1.1", now, EventLevel::Info, "first"))
            .unwrap();
        db.append_event(&ResourceEvent::new("1.1.1.1", now, EventLevel::Warn, "second"))
            .unwrap();
        let events = db.events("1.1.1.1").unwrap();
        assert_eq!(
            events.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert_eq!(events[1].level, EventLevel::Warn);

        db.delete(RecordKind::Vm, "1.1.2.1").unwrap();
        assert!(db.children("1.1.1.1").unwrap().is_empty());
        assert!(matches!(
            db.delete(RecordKind::Vm, "1.1.2.1"),
            Err(StoreError::NotFound(_))
        ));

        db.clear().unwrap();
        assert!(db.keys(RecordKind::Blade).unwrap().is_empty());
        assert!(db.events("1.1.1.1").unwrap().is_empty());
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryHostDb::new());
    }
}
