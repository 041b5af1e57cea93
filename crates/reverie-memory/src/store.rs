//! Append-only Memory Store.
//!
//! Persists [`Memory`] records together with their embedding vectors to a
//! local SQLite database.  Records are never updated or deleted; a correction
//! is a new record whose `supersedes` names the original, which is then
//! hidden from every stream.
//!
//! # Storage layout
//!
//! | column           | type    | description                                |
//! |------------------|---------|--------------------------------------------|
//! | id               | TEXT    | Caller-assigned primary key                |
//! | user_id          | TEXT    | Owning user                                |
//! | content          | TEXT    | Reflective text                            |
//! | embedding        | BLOB    | Little-endian f32 vector (4 × N bytes)     |
//! | ts               | INTEGER | Timestamp, microseconds since the epoch    |
//! | valence          | REAL    | Emotional valence in `[-1, 1]`             |
//! | dominant_emotion | TEXT    | Emotion label                              |
//! | phase_tag        | TEXT    | expansion / contraction / renewal / unknown |
//! | source_type      | TEXT    | chat / journal / check-in                  |
//! | supersedes       | TEXT    | Id this record corrects (nullable)         |
//! | superseded_by    | TEXT    | Id of the correcting record (nullable)     |
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use reverie_memory::store::MemoryStore;
//! use reverie_types::{Memory, PhaseTag, SourceType};
//!
//! let store = MemoryStore::open_in_memory(3).unwrap();
//! let memory = Memory {
//!     id: "m-1".to_string(),
//!     user_id: "user-a".to_string(),
//!     content: "Long walk after the interview".to_string(),
//!     embedding: vec![0.1, 0.9, 0.3],
//!     timestamp: Utc::now(),
//!     emotional_valence: 0.4,
//!     dominant_emotion: "calm".to_string(),
//!     phase_tag: PhaseTag::Renewal,
//!     source_type: SourceType::Journal,
//!     supersedes: None,
//! };
//! assert!(!store.append(memory.clone()).unwrap().is_duplicate());
//! assert!(store.append(memory).unwrap().is_duplicate());
//!
//! let streamed: Vec<_> = store.stream_since("user-a", None).collect();
//! assert_eq!(streamed.len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use reverie_types::{Memory, PhaseTag, ReverieError, SourceType};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::debug;

/// Rows fetched per round-trip by a [`MemoryStream`].
const DEFAULT_PAGE_SIZE: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from memory store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid memory: {0}")]
    Invalid(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for ReverieError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(msg) => ReverieError::Validation(msg),
            other => ReverieError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AppendOutcome
// ─────────────────────────────────────────────────────────────────────────────

/// Result of [`MemoryStore::append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The record was new and has been written.
    Inserted(Memory),
    /// A record with this id already existed; it is returned unchanged.
    Duplicate(Memory),
}

impl AppendOutcome {
    pub fn memory(&self) -> &Memory {
        match self {
            AppendOutcome::Inserted(m) | AppendOutcome::Duplicate(m) => m,
        }
    }

    pub fn into_memory(self) -> Memory {
        match self {
            AppendOutcome::Inserted(m) | AppendOutcome::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding / timestamp helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub(crate) fn micros_to_datetime(col: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(col, micros))
}

const MEMORY_COLUMNS: &str = "id, user_id, content, embedding, ts, valence, \
                              dominant_emotion, phase_tag, source_type, supersedes";

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let blob: Vec<u8> = row.get(3)?;
    let ts: i64 = row.get(4)?;
    let valence: f64 = row.get(5)?;
    let phase: String = row.get(7)?;
    let source: String = row.get(8)?;
    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        embedding: bytes_to_embedding(&blob),
        timestamp: micros_to_datetime(4, ts)?,
        emotional_valence: valence as f32,
        dominant_emotion: row.get(6)?,
        phase_tag: PhaseTag::from_label(&phase),
        source_type: SourceType::from_label(&source).unwrap_or_default(),
        supersedes: row.get(9)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed, append-only memory log.
///
/// The connection sits behind a mutex so a single store can be shared by all
/// per-user ingestion actors; each operation holds the lock for one short
/// statement or transaction.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    dimensions: usize,
}

impl MemoryStore {
    /// Open (or create) a persistent SQLite database at `path` that accepts
    /// embeddings of exactly `dimensions` components.
    pub fn open(path: &str, dimensions: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, dimensions)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory(dimensions: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, dimensions)
    }

    fn with_connection(conn: Connection, dimensions: usize) -> Result<Self, StoreError> {
        if dimensions == 0 {
            return Err(StoreError::Invalid("embedding dimensions must be positive".into()));
        }
        let store = Self {
            conn: Mutex::new(conn),
            dimensions,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id               TEXT NOT NULL PRIMARY KEY,
                user_id          TEXT NOT NULL,
                content          TEXT NOT NULL,
                embedding        BLOB NOT NULL,
                ts               INTEGER NOT NULL,
                valence          REAL NOT NULL,
                dominant_emotion TEXT NOT NULL,
                phase_tag        TEXT NOT NULL,
                source_type      TEXT NOT NULL,
                supersedes       TEXT,
                superseded_by    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_memories_user_ts
                ON memories (user_id, ts, id);
            CREATE TABLE IF NOT EXISTS memory_clusters (
                id                TEXT NOT NULL PRIMARY KEY,
                user_id           TEXT NOT NULL,
                centroid          BLOB NOT NULL,
                member_ids        TEXT NOT NULL,
                concepts          TEXT NOT NULL,
                emotional_context REAL NOT NULL,
                phase_context     TEXT NOT NULL,
                strength_score    REAL NOT NULL,
                state             TEXT NOT NULL,
                last_updated      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_clusters_user
                ON memory_clusters (user_id);
            CREATE TABLE IF NOT EXISTS released_memories (
                memory_id   TEXT NOT NULL PRIMARY KEY,
                user_id     TEXT NOT NULL,
                released_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_released_memories_user
                ON released_memories (user_id);",
        )?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Embedding length every appended memory must have.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Append `memory` to the log.
    ///
    /// Idempotent by id: if a record with the same id exists it is returned
    /// unchanged as [`AppendOutcome::Duplicate`] and nothing is written, even
    /// when the new payload would not validate.
    ///
    /// # Errors
    ///
    /// [`StoreError::Invalid`] for a malformed record (wrong embedding
    /// length, missing user, valence out of range) or a correction that does
    /// not refer to an existing memory of the same user.
    pub fn append(&self, memory: Memory) -> Result<AppendOutcome, StoreError> {
        let mut conn = self.lock()?;
        if let Some(existing) = Self::get_with(&conn, &memory.id)? {
            debug!(memory_id = %memory.id, "duplicate append ignored");
            return Ok(AppendOutcome::Duplicate(existing));
        }
        memory
            .validate(self.dimensions)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let tx = conn.transaction()?;
        if let Some(target) = &memory.supersedes {
            let updated = tx.execute(
                "UPDATE memories SET superseded_by = ?1
                 WHERE id = ?2 AND user_id = ?3",
                params![memory.id, target, memory.user_id],
            )?;
            if updated == 0 {
                return Err(StoreError::Invalid(format!(
                    "correction {} refers to unknown memory {target}",
                    memory.id
                )));
            }
        }
        tx.execute(
            "INSERT INTO memories
                 (id, user_id, content, embedding, ts, valence,
                  dominant_emotion, phase_tag, source_type, supersedes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                memory.id,
                memory.user_id,
                memory.content,
                embedding_to_bytes(&memory.embedding),
                memory.timestamp.timestamp_micros(),
                memory.emotional_valence as f64,
                memory.dominant_emotion,
                memory.phase_tag.as_str(),
                memory.source_type.as_str(),
                memory.supersedes,
            ],
        )?;
        tx.commit()?;
        Ok(AppendOutcome::Inserted(memory))
    }

    fn get_with(conn: &Connection, id: &str) -> Result<Option<Memory>, StoreError> {
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_memory).optional()?)
    }

    /// Fetch a single memory by id, superseded or not.
    pub fn get(&self, id: &str) -> Result<Option<Memory>, StoreError> {
        let conn = self.lock()?;
        Self::get_with(&conn, id)
    }

    /// Fetch the given ids, ordered by timestamp.  Unknown ids are skipped.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Memory>, StoreError> {
        let conn = self.lock()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(m) = Self::get_with(&conn, id)? {
                out.push(m);
            }
        }
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// `true` when a later correction has replaced `id`.
    pub fn is_superseded(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let by: Option<Option<String>> = conn
            .query_row(
                "SELECT superseded_by FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(by, Some(Some(_))))
    }

    /// Lazily stream the live (non-superseded) memories of `user_id` with a
    /// timestamp at or after `since`, oldest first.
    pub fn stream_since(&self, user_id: &str, since: Option<DateTime<Utc>>) -> MemoryStream<'_> {
        MemoryStream::new(self, user_id, since)
    }

    /// Distinct user ids with at least one memory.
    pub fn users(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM memories ORDER BY user_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of live memories stored for `user_id`.
    pub fn count_for_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE user_id = ?1 AND superseded_by IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn fetch_page(
        &self,
        user_id: &str,
        after: &(i64, String),
        limit: usize,
    ) -> Result<Vec<Memory>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE user_id = ?1 AND superseded_by IS NULL
               AND (ts > ?2 OR (ts = ?2 AND id > ?3))
             ORDER BY ts ASC, id ASC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, after.0, after.1, limit as i64],
            row_to_memory,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStream
// ─────────────────────────────────────────────────────────────────────────────

/// Lazy, finite, restartable sequence of one user's memories.
///
/// Pages through the store with a `(timestamp, id)` keyset cursor, so
/// records appended while the stream is being consumed are picked up if they
/// sort after the cursor.  [`restart`][MemoryStream::restart] rewinds to the
/// original lower bound.
pub struct MemoryStream<'a> {
    store: &'a MemoryStore,
    user_id: String,
    start: (i64, String),
    cursor: (i64, String),
    buffer: VecDeque<Memory>,
    page_size: usize,
    exhausted: bool,
}

impl<'a> MemoryStream<'a> {
    fn new(store: &'a MemoryStore, user_id: &str, since: Option<DateTime<Utc>>) -> Self {
        // An empty id sorts before every real id, making the bound inclusive.
        let start = (
            since.map(|s| s.timestamp_micros()).unwrap_or(i64::MIN),
            String::new(),
        );
        Self {
            store,
            user_id: user_id.to_string(),
            cursor: start.clone(),
            start,
            buffer: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            exhausted: false,
        }
    }

    /// Override the number of rows fetched per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rewind to the beginning of the stream.
    pub fn restart(&mut self) {
        self.cursor = self.start.clone();
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for MemoryStream<'_> {
    type Item = Result<Memory, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.fetch_page(&self.user_id, &self.cursor, self.page_size) {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.cursor = (last.timestamp.timestamp_micros(), last.id.clone());
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
