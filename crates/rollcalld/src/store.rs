//! SQLite adapter for the repository boundary.
//!
//! Subjects carry their encoding as JSON text. Attendance timestamps are
//! RFC 3339 UTC with fixed microsecond precision so they sort as text.

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{
    AttendanceEvent, Encoding, Repository, RepositoryError, SubjectId, SubjectRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("encoding serialization: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("bad timestamp {0:?}")]
    Timestamp(String),
    #[error("cannot create {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("subject not found: {0}")]
    NotFound(SubjectId),
}

/// Subject row without its encoding, for listings.
#[derive(Debug, Clone)]
pub struct SubjectSummary {
    pub id: SubjectId,
    pub name: String,
    pub photo_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub encoding_len: usize,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS subjects (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL,
        encoding    TEXT NOT NULL,
        photo_path  TEXT,
        created_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_id  INTEGER NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
        recorded_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_attendance_subject
        ON attendance(subject_id, recorded_at);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::debug!(path = %path.display(), "opened database");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn add_subject(&self, name: &str, encoding: &Encoding) -> Result<SubjectId, StoreError> {
        let json = serde_json::to_string(&encoding.values)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO subjects (name, encoding, created_at) VALUES (?1, ?2, ?3)",
            params![name, json, format_timestamp(Utc::now())],
        )?;
        Ok(SubjectId(conn.last_insert_rowid()))
    }

    pub fn set_photo_path(&self, id: SubjectId, photo_path: &str) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE subjects SET photo_path = ?1 WHERE id = ?2",
            params![photo_path, id.0],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    pub fn list_subjects(&self) -> Result<Vec<SubjectSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, encoding, photo_path, created_at FROM subjects ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut subjects = Vec::new();
        for row in rows {
            let (id, name, encoding, photo_path, created_at) = row?;
            let values: Vec<f32> = serde_json::from_str(&encoding)?;
            subjects.push(SubjectSummary {
                id: SubjectId(id),
                name,
                photo_path,
                created_at: parse_timestamp(&created_at)?,
                encoding_len: values.len(),
            });
        }
        Ok(subjects)
    }

    /// Delete a subject and its attendance history. Returns false if absent.
    pub fn remove_subject(&self, id: SubjectId) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM subjects WHERE id = ?1", params![id.0])?;
        Ok(removed > 0)
    }

    fn load_records(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, encoding FROM subjects ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, display_name, encoding) = row?;
            let values: Vec<f32> = serde_json::from_str(&encoding)?;
            records.push(SubjectRecord {
                id: SubjectId(id),
                display_name,
                encoding: Encoding::new(values),
            });
        }
        Ok(records)
    }

    fn latest_event(&self, id: SubjectId) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<String> = self
            .conn()
            .query_row(
                "SELECT MAX(recorded_at) FROM attendance WHERE subject_id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        latest.as_deref().map(parse_timestamp).transpose()
    }

    fn insert_event(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO attendance (subject_id, recorded_at) VALUES (?1, ?2)",
            params![event.subject_id.0, format_timestamp(event.timestamp)],
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Repository for SqliteStore {
    fn subject_encodings(&self) -> Result<Vec<SubjectRecord>, RepositoryError> {
        self.load_records().map_err(query_error)
    }

    fn last_event_timestamp(
        &self,
        subject_id: SubjectId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        self.latest_event(subject_id).map_err(query_error)
    }

    fn record_event(&self, event: &AttendanceEvent) -> Result<(), RepositoryError> {
        self.insert_event(event).map_err(query_error)
    }
}

fn query_error(e: StoreError) -> RepositoryError {
    let transient = matches!(
        &e,
        StoreError::Sql(rusqlite::Error::SqliteFailure(code, _))
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
            )
    );
    if transient {
        RepositoryError::Unavailable(e.to_string())
    } else {
        RepositoryError::Query(e.to_string())
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}
