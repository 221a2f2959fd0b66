//! Persistence of finished measurement sessions.
//!
//! The measurement controller hands each finished [`SessionRecord`] to a
//! [`SessionStore`]. [`SqliteSessionStore`] keeps them in a local SQLite
//! database; [`MemorySessionStore`] keeps them in memory and can be told to
//! fail, for exercising the retry path.

use crate::measurement::types::{CorrelatedPoint, Sample, SessionOwner, SessionRecord};
use crate::storage::schema::{CURRENT_VERSION, SCHEMA, SCHEMA_VERSION_TABLE};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// Persistence collaborator for finished sessions.
pub trait SessionStore: Send + Sync {
    /// Persist a record. Saving the same id twice replaces the first copy.
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Sessions of one athlete, newest first.
    fn list(&self, user_id: &str, athlete_id: &str) -> Result<Vec<SessionRecord>, StoreError>;

    /// Remove a session.
    fn delete(&self, id: &Uuid) -> Result<(), StoreError>;
}

/// Session store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Rejected by store: {0}")]
    Rejected(String),
}

/// SQLite-backed session store.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
        }

        let conn =
            Connection::open(path).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored sessions across all owners.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        Ok(count as usize)
    }

    /// Fetch one session by id.
    pub fn get(&self, id: &Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, user_id, athlete_id, user_email, recorded_at, samples_json, series_json
                 FROM sessions WHERE id = ?1",
                [id.to_string()],
                SessionRow::from_row,
            )
            .optional()
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        row.map(SessionRow::into_record).transpose()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let samples_json = serde_json::to_string(&record.samples)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let series_json = record
            .series
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO sessions
                 (id, user_id, athlete_id, user_email, recorded_at, sample_count,
                  samples_json, series_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.owner.user_id,
                    record.owner.athlete_id,
                    record.owner.user_email,
                    format_timestamp(&record.timestamp),
                    record.samples.len() as i64,
                    samples_json,
                    series_json,
                    format_timestamp(&Utc::now()),
                ],
            )
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        tracing::info!(
            "Saved session {} ({} samples) for athlete {}",
            record.id,
            record.samples.len(),
            record.owner.athlete_id
        );
        Ok(())
    }

    fn list(&self, user_id: &str, athlete_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, athlete_id, user_email, recorded_at, samples_json, series_json
                 FROM sessions WHERE user_id = ?1 AND athlete_id = ?2
                 ORDER BY recorded_at DESC, rowid DESC",
            )
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        let rows = stmt
            .query_map(params![user_id, athlete_id], SessionRow::from_row)
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StoreError::QueryFailed(e.to_string()))?;
            records.push(row.into_record()?);
        }

        Ok(records)
    }

    fn delete(&self, id: &Uuid) -> Result<(), StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", [id.to_string()])
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        if deleted == 0 {
            return Err(StoreError::NotFound(*id));
        }
        tracing::info!("Deleted session {}", id);
        Ok(())
    }
}

fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA_VERSION_TABLE)
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

    let version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

    if version < 1 {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, datetime('now'))",
            [CURRENT_VERSION],
        )
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        tracing::info!("Session database migrated to version {}", CURRENT_VERSION);
    }

    Ok(())
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Raw row as read from the sessions table.
struct SessionRow {
    id: String,
    user_id: String,
    athlete_id: String,
    user_email: Option<String>,
    recorded_at: String,
    samples_json: String,
    series_json: Option<String>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            athlete_id: row.get(2)?,
            user_email: row.get(3)?,
            recorded_at: row.get(4)?,
            samples_json: row.get(5)?,
            series_json: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<SessionRecord, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?
            .with_timezone(&Utc);
        let samples: Vec<Sample> = serde_json::from_str(&self.samples_json)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let series: Option<Vec<CorrelatedPoint>> = self
            .series_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        Ok(SessionRecord {
            id,
            owner: SessionOwner {
                user_id: self.user_id,
                athlete_id: self.athlete_id,
                user_email: self.user_email,
            },
            timestamp,
            samples,
            series,
        })
    }
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<Vec<SessionRecord>>,
    fail_saves: AtomicBool,
    save_attempts: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Saves attempted so far, failed ones included.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    /// Stored records, oldest first.
    pub fn records(&self) -> Vec<SessionRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SessionRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("store unavailable".to_string()));
        }

        let mut records = self.lock();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    fn list(&self, user_id: &str, athlete_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut matching: Vec<SessionRecord> = self
            .lock()
            .iter()
            .filter(|r| r.owner.user_id == user_id && r.owner.athlete_id == athlete_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse for newest first
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        matching.reverse();
        Ok(matching)
    }

    fn delete(&self, id: &Uuid) -> Result<(), StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| r.id != *id);
        if records.len() == before {
            return Err(StoreError::NotFound(*id));
        }
        Ok(())
    }
}
