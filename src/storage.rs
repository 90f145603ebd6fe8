//! Persistence seams.
//!
//! - `EventStore`: append-only event records, listed newest first per owner
//! - `BlobStore`: artifact bytes addressed by `<owner>/<eventId>/<file>`
//! - `SettingsStore`: the flat per-owner settings record
//!
//! All stores are synchronous; async callers run them on the blocking pool.
//! SQLite and filesystem implementations back the daemon, in-memory ones
//! back tests.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::artifact::BundleIssue;
use crate::oracle::AnalysisVerdict;
use crate::settings::Settings;
use crate::TriggerSource;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid blob path '{0}'")]
    InvalidPath(String),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// Location and digest of one stored artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    pub path: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

impl StoredBlob {
    fn describe(path: &str, url: String, bytes: &[u8]) -> Self {
        Self {
            path: path.to_string(),
            url,
            sha256: hex::encode(Sha256::digest(bytes)),
            size: bytes.len() as u64,
        }
    }
}

/// Persisted form of one finalized capture.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub owner: String,
    pub source: TriggerSource,
    pub captured_at: DateTime<Utc>,
    pub media_name: String,
    pub verdict: Option<AnalysisVerdict>,
    pub video: Option<StoredBlob>,
    pub photo: Option<StoredBlob>,
    pub report: StoredBlob,
    #[serde(default)]
    pub issues: Vec<BundleIssue>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn blobs(&self) -> impl Iterator<Item = &StoredBlob> {
        self.video
            .iter()
            .chain(self.photo.iter())
            .chain(std::iter::once(&self.report))
    }
}

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

pub trait EventStore: Send + Sync {
    /// Append a record; returns its id.
    fn append(&self, record: &EventRecord) -> Result<String, StoreError>;

    /// Records for `owner`, newest capture first.
    fn list_by_owner(&self, owner: &str) -> Result<Vec<EventRecord>, StoreError>;

    /// Remove every record for `owner`; returns how many were removed.
    fn delete_all(&self, owner: &str) -> Result<usize, StoreError>;
}

pub trait BlobStore: Send + Sync {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<StoredBlob, StoreError>;

    /// Delete a blob. Deleting a missing blob succeeds.
    fn delete(&self, path: &str) -> Result<(), StoreError>;
}

pub trait SettingsStore: Send + Sync {
    fn load_settings(&self, owner: &str) -> Result<Option<Settings>, StoreError>;

    fn save_settings(&self, owner: &str, settings: &Settings) -> Result<(), StoreError>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        lock(&self.conn).execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS capture_events (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              owner TEXT NOT NULL,
              captured_at_ms INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS owner_settings (
              owner TEXT PRIMARY KEY,
              updated_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_owner_captured
              ON capture_events(owner, captured_at_ms);
            "#,
        )?;
        Ok(())
    }
}

impl EventStore for SqliteEventStore {
    fn append(&self, record: &EventRecord) -> Result<String, StoreError> {
        let payload_json = serde_json::to_string(record)?;
        lock(&self.conn).execute(
            r#"
            INSERT INTO capture_events(id, owner, captured_at_ms, created_at, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.id,
                record.owner,
                record.captured_at.timestamp_millis(),
                record.created_at.timestamp(),
                payload_json
            ],
        )?;
        Ok(record.id.clone())
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<EventRecord>, StoreError> {
        let payloads = {
            let conn = lock(&self.conn);
            let mut stmt = conn.prepare(
                "SELECT payload_json FROM capture_events WHERE owner = ?1 \
                 ORDER BY captured_at_ms DESC, seq DESC",
            )?;
            let mut rows = stmt.query(params![owner])?;
            let mut payloads = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row.get(0)?;
                payloads.push(payload);
            }
            payloads
        };

        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    fn delete_all(&self, owner: &str) -> Result<usize, StoreError> {
        let removed = lock(&self.conn).execute(
            "DELETE FROM capture_events WHERE owner = ?1",
            params![owner],
        )?;
        Ok(removed)
    }
}

impl SettingsStore for SqliteEventStore {
    fn load_settings(&self, owner: &str) -> Result<Option<Settings>, StoreError> {
        let payload: Option<String> = lock(&self.conn)
            .query_row(
                "SELECT payload_json FROM owner_settings WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str::<Settings>(&json)?.clamped())),
            None => Ok(None),
        }
    }

    fn save_settings(&self, owner: &str, settings: &Settings) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&settings.clamped())?;
        lock(&self.conn).execute(
            r#"
            INSERT INTO owner_settings(owner, updated_at, payload_json)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(owner) DO UPDATE SET
              updated_at = excluded.updated_at,
              payload_json = excluded.payload_json
            "#,
            params![owner, Utc::now().timestamp(), payload_json],
        )?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    records: Mutex<Vec<EventRecord>>,
    settings: Mutex<HashMap<String, Settings>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, record: &EventRecord) -> Result<String, StoreError> {
        lock(&self.records).push(record.clone());
        Ok(record.id.clone())
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<EventRecord>, StoreError> {
        let mut out: Vec<EventRecord> = lock(&self.records)
            .iter()
            .rev()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        // Stable: later appends win ties.
        out.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        Ok(out)
    }

    fn delete_all(&self, owner: &str) -> Result<usize, StoreError> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|r| r.owner != owner);
        Ok(before - records.len())
    }
}

impl SettingsStore for InMemoryEventStore {
    fn load_settings(&self, owner: &str) -> Result<Option<Settings>, StoreError> {
        Ok(lock(&self.settings).get(owner).copied())
    }

    fn save_settings(&self, owner: &str, settings: &Settings) -> Result<(), StoreError> {
        lock(&self.settings).insert(owner.to_string(), settings.clamped());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Blob stores
// ----------------------------------------------------------------------------

/// Relative, `/`-separated, no empty, `.` or `..` segments.
fn validate_blob_path(path: &str) -> Result<(), StoreError> {
    let ok = !path.contains('\\')
        && path
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_for(path: &Path) -> String {
        let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        url::Url::from_file_path(&absolute)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", absolute.display()))
    }
}

impl BlobStore for FilesystemBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<StoredBlob, StoreError> {
        validate_blob_path(path)?;
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        write_atomic(&full, bytes)?;
        Ok(StoredBlob::describe(path, Self::url_for(&full), bytes))
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_blob_path(path)?;
        let full = self.root.join(path);
        match fs::remove_file(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&full, e)),
        }
        // Drop the per-event directory once it is empty.
        if let Some(parent) = full.parent() {
            if parent != self.root {
                let _ = fs::remove_dir(parent);
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(data).map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.blobs).get(path).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<StoredBlob, StoreError> {
        validate_blob_path(path)?;
        lock(&self.blobs).insert(path.to_string(), bytes.to_vec());
        Ok(StoredBlob::describe(path, format!("mem://{}", path), bytes))
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_blob_path(path)?;
        lock(&self.blobs).remove(path);
        Ok(())
    }
}
