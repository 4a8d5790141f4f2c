//! Dead-letter store for contract updates that exhausted their retries
//!
//! Entries stay until a replay succeeds (`ContractUpdater::replay_dead_letters`).
//! The SQLite backend uses WAL mode; the connection sits behind a mutex since
//! rusqlite connections are not `Sync`.

use super::types::{CreditDimension, CreditDimensionUpdate};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub update: CreditDimensionUpdate,
    pub error: String,
    pub attempts: u32,
    pub created_at: i64,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist an exhausted update; returns the entry id
    async fn record(&self, update: &CreditDimensionUpdate, error: &str, attempts: u32) -> PipelineResult<i64>;

    /// Oldest entries first
    async fn pending(&self, limit: usize) -> PipelineResult<Vec<DeadLetterEntry>>;

    async fn remove(&self, id: i64) -> PipelineResult<()>;

    async fn count(&self) -> PipelineResult<usize>;
}

pub struct SqliteDeadLetterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDeadLetterStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> PipelineResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::DeadLetter(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> PipelineResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_address    TEXT NOT NULL,
                dimension       INTEGER NOT NULL,
                raw_data_points TEXT NOT NULL,
                weights         TEXT NOT NULL,
                error           TEXT NOT NULL,
                attempts        INTEGER NOT NULL,
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letters_user ON dead_letters(user_address, dimension);
            "#,
        )?;

        log::info!("✅ Dead-letter store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// u128 does not fit SQLite INTEGER; arrays are stored as JSON arrays of
// decimal strings.
fn encode_points(points: &[u128]) -> PipelineResult<String> {
    let as_strings: Vec<String> = points.iter().map(|p| p.to_string()).collect();
    Ok(serde_json::to_string(&as_strings)?)
}

fn decode_points(raw: &str) -> PipelineResult<Vec<u128>> {
    let as_strings: Vec<String> = serde_json::from_str(raw)?;
    as_strings
        .iter()
        .map(|s| {
            s.parse::<u128>()
                .map_err(|e| PipelineError::DeadLetter(format!("corrupt data point {}: {}", s, e)))
        })
        .collect()
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn record(&self, update: &CreditDimensionUpdate, error: &str, attempts: u32) -> PipelineResult<i64> {
        let raw = encode_points(update.raw_data_points())?;
        let weights = encode_points(update.weights())?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.lock();
        conn.execute(
            "INSERT INTO dead_letters
                (user_address, dimension, raw_data_points, weights, error, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                update.user_address(),
                update.dimension().index(),
                raw,
                weights,
                error,
                attempts,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        log::warn!(
            "📮 Dead-lettered update #{} for {} / {} ({} points): {}",
            id,
            update.user_address(),
            update.dimension(),
            update.len(),
            error
        );
        Ok(id)
    }

    async fn pending(&self, limit: usize) -> PipelineResult<Vec<DeadLetterEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_address, dimension, raw_data_points, weights, error, attempts, created_at
             FROM dead_letters ORDER BY id ASC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u8>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, user, dim, raw, weights, error, attempts, created_at) = row?;
            let dimension = CreditDimension::from_index(dim)
                .ok_or_else(|| PipelineError::DeadLetter(format!("unknown dimension {} in entry {}", dim, id)))?;
            let update = CreditDimensionUpdate::new(&user, dimension, decode_points(&raw)?, decode_points(&weights)?)?;
            entries.push(DeadLetterEntry {
                id,
                update,
                error,
                attempts,
                created_at,
            });
        }
        Ok(entries)
    }

    async fn remove(&self, id: i64) -> PipelineResult<()> {
        self.lock()
            .execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn count(&self) -> PipelineResult<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
