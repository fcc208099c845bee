use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{HostDb, ResourceEvent, Result, StoreError};
use crate::records::{RecordKind, Sections};

#[derive(Debug)]
struct Row {
    kind: RecordKind,
    parent: Option<String>,
    sections: Sections,
}

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<String, Row>,
    events: Vec<ResourceEvent>,
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryHostDb {
    state: Mutex<State>,
}

impl MemoryHostDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostDb for MemoryHostDb {
    fn insert(&self, kind: RecordKind, key: &str, parent: Option<&str>, sections: Sections) -> Result<()> {
        let mut state = self.state.lock();
        if state.rows.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        state.rows.insert(
            key.to_string(),
            Row {
                kind,
                parent: parent.map(str::to_string),
                sections,
            },
        );
        Ok(())
    }

    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<Sections>> {
        let state = self.state.lock();
        Ok(state
            .rows
            .get(key)
            .filter(|row| row.kind == kind)
            .map(|row| row.sections.clone()))
    }

    fn update(&self, kind: RecordKind, key: &str, sections: Sections) -> Result<()> {
        let mut state = self.state.lock();
        match state.rows.get_mut(key) {
            Some(row) if row.kind == kind => {
                row.sections.extend(sections);
                Ok(())
            }
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.rows.get(key) {
            Some(row) if row.kind == kind => {
                state.rows.remove(key);
                Ok(())
            }
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn kind_of(&self, key: &str) -> Result<Option<RecordKind>> {
        Ok(self.state.lock().rows.get(key).map(|row| row.kind))
    }

    fn keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .filter(|(_, row)| row.kind == kind)
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn children(&self, parent: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .filter(|(_, row)| row.parent.as_deref() == Some(parent))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.rows.clear();
        state.events.clear();
        Ok(())
    }

    fn append_event(&self, event: &ResourceEvent) -> Result<()> {
        self.state.lock().events.push(event.clone());
        Ok(())
    }

    fn events(&self, resource: &str) -> Result<Vec<ResourceEvent>> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .filter(|event| event.resource == resource)
            .cloned()
            .collect())
    }
}
