//! SQLite-backed store.
//!
//! The director core is blocking, so every query is driven to completion on a
//! tokio runtime handle. The pool holds a single connection: the lock table
//! already serializes writers per section, and SQLite wants one writer anyway.

use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::runtime::Handle;
use tracing::info;
use uuid::Uuid;

use super::{EventLevel, HostDb, ResourceEvent, Result, StoreError};
use crate::records::{RecordKind, Sections};

pub struct SqliteHostDb {
    pool: SqlitePool,
    runtime: Handle,
}

impl SqliteHostDb {
    /// Open (creating if missing) the database at `database_url`.
    ///
    /// Must not be called from inside an async task; use a blocking thread.
    pub fn open(database_url: &str, runtime: Handle) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = runtime.block_on(
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options),
        )?;

        let db = Self { pool, runtime };
        db.run(db.initialize_tables())?;
        info!("Database initialized at {}", database_url);
        Ok(db)
    }

    fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.runtime.block_on(fut)
    }

    async fn initialize_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                parent TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sections (
                key TEXT NOT NULL,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (key, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                resource TEXT NOT NULL,
                at TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_resource ON events(resource)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn kind_of_async(&self, key: &str) -> Result<Option<RecordKind>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT kind FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((kind,)) => Ok(Some(parse_kind(&kind)?)),
            None => Ok(None),
        }
    }

    async fn upsert_sections(&self, key: &str, sections: &Sections) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (name, body) in sections {
            sqlx::query(
                r#"
                INSERT INTO sections (key, name, body) VALUES (?, ?, ?)
                ON CONFLICT(key, name) DO UPDATE SET body = excluded.body
                "#,
            )
            .bind(key)
            .bind(name)
            .bind(serde_json::to_string(body)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_kind(kind: &str) -> Result<RecordKind> {
    match kind {
        "blade" => Ok(RecordKind::Blade),
        "vm" => Ok(RecordKind::Vm),
        other => Err(StoreError::InvalidData(format!("unknown record kind '{}'", other))),
    }
}

impl HostDb for SqliteHostDb {
    fn insert(&self, kind: RecordKind, key: &str, parent: Option<&str>, sections: Sections) -> Result<()> {
        self.run(async {
            if self.kind_of_async(key).await?.is_some() {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            sqlx::query("INSERT INTO records (key, kind, parent) VALUES (?, ?, ?)")
                .bind(key)
                .bind(kind.as_str())
                .bind(parent)
                .execute(&self.pool)
                .await?;
            self.upsert_sections(key, &sections).await
        })
    }

    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<Sections>> {
        self.run(async {
            if self.kind_of_async(key).await? != Some(kind) {
                return Ok(None);
            }
            let rows: Vec<(String, String)> =
                sqlx::query_as("SELECT name, body FROM sections WHERE key = ?")
                    .bind(key)
                    .fetch_all(&self.pool)
                    .await?;

            let mut sections = Sections::new();
            for (name, body) in rows {
                sections.insert(name, serde_json::from_str(&body)?);
            }
            Ok(Some(sections))
        })
    }

    fn update(&self, kind: RecordKind, key: &str, sections: Sections) -> Result<()> {
        self.run(async {
            if self.kind_of_async(key).await? != Some(kind) {
                return Err(StoreError::NotFound(key.to_string()));
            }
            self.upsert_sections(key, &sections).await
        })
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.run(async {
            if self.kind_of_async(key).await? != Some(kind) {
                return Err(StoreError::NotFound(key.to_string()));
            }
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM sections WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM records WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn kind_of(&self, key: &str) -> Result<Option<RecordKind>> {
        self.run(self.kind_of_async(key))
    }

    fn keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        self.run(async {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT key FROM records WHERE kind = ? ORDER BY key")
                    .bind(kind.as_str())
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(key,)| key).collect())
        })
    }

    fn children(&self, parent: &str) -> Result<Vec<String>> {
        self.run(async {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT key FROM records WHERE parent = ? ORDER BY key")
                    .bind(parent)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(key,)| key).collect())
        })
    }

    fn clear(&self) -> Result<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            for table in ["sections", "records", "events"] {
                sqlx::query(&format!("DELETE FROM {}", table))
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn append_event(&self, event: &ResourceEvent) -> Result<()> {
        self.run(async {
            sqlx::query(
                "INSERT INTO events (id, resource, at, level, message) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(event.id.to_string())
            .bind(&event.resource)
            .bind(event.at.to_rfc3339())
            .bind(event.level.as_str())
            .bind(&event.message)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn events(&self, resource: &str) -> Result<Vec<ResourceEvent>> {
        self.run(async {
            let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
                "SELECT id, resource, at, level, message FROM events WHERE resource = ? ORDER BY seq",
            )
            .bind(resource)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(id, resource, at, level, message)| -> Result<ResourceEvent> {
                    Ok(ResourceEvent {
                        id: Uuid::parse_str(&id)
                            .map_err(|e| StoreError::InvalidData(format!("event id '{}': {}", id, e)))?,
                        resource,
                        at: DateTime::parse_from_rfc3339(&at)
                            .map_err(|e| StoreError::InvalidData(format!("event time '{}': {}", at, e)))?
                            .with_timezone(&Utc),
                        level: EventLevel::parse(&level)
                            .ok_or_else(|| StoreError::InvalidData(format!("event level '{}'", level)))?,
                        message,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_contract() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let db = SqliteHostDb::open("sqlite::memory:", runtime.handle().clone()).unwrap();
        crate::store::tests::exercise(&db);
    }
}
