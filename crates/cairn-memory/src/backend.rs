//! Durable storage behind the memory tree.
//!
//! The in-memory tree is authoritative while the process runs; a
//! [`StorageBackend`] receives every committed batch of changes and replays
//! them on the next start.  A batch is applied atomically or not at all, and
//! the store only updates its in-memory state after the backend accepted the
//! batch.
//!
//! # Storage layout
//!
//! [`SqliteBackend`] keeps a single table `memory_nodes`:
//!
//! | column        | type    | description                              |
//! |---------------|---------|------------------------------------------|
//! | path          | TEXT    | canonical key, primary key               |
//! | kind          | TEXT    | `leaf` or `directory`                    |
//! | content       | TEXT    | leaf content (empty for directories)     |
//! | version       | INTEGER | monotonic per-leaf version               |
//! | size          | INTEGER | content length in bytes                  |
//! | last_modified | TEXT    | RFC-3339 UTC timestamp                   |
//!
//! # Example
//!
//! ```rust
//! use cairn_memory::backend::{BackendOp, SqliteBackend, StorageBackend};
//! use cairn_memory::MemoryNode;
//!
//! let backend = SqliteBackend::open_in_memory().unwrap();
//! let node = MemoryNode::leaf("/memories/a.md", "hello".into(), 1);
//! backend.apply(&[BackendOp::Put(node.clone())]).unwrap();
//!
//! assert_eq!(backend.load_all().unwrap(), vec![node]);
//! ```

use std::sync::Mutex;

use cairn_types::CairnError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use thiserror::Error;

use crate::node::{MemoryNode, NodeKind};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt row for {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<BackendError> for CairnError {
    fn from(e: BackendError) -> Self {
        CairnError::Internal(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// One change inside a committed batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    /// Insert or replace the node at `node.path`.
    Put(MemoryNode),
    /// Remove the node at the given key.
    Remove(String),
    /// Remove everything.
    Clear,
}

pub trait StorageBackend: Send + Sync {
    /// Short label used in logs and status output.
    fn name(&self) -> &str;

    /// Every persisted node, ordered by path.
    fn load_all(&self) -> Result<Vec<MemoryNode>, BackendError>;

    /// Apply `ops` in order as a single atomic batch.
    fn apply(&self, ops: &[BackendOp]) -> Result<(), BackendError>;
}

/// Keeps nothing; the tree lives only as long as the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl StorageBackend for NullBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load_all(&self) -> Result<Vec<MemoryNode>, BackendError> {
        Ok(Vec::new())
    }

    fn apply(&self, _ops: &[BackendOp]) -> Result<(), BackendError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteBackend
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed persistence, one transaction per batch.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> Result<(), BackendError> {
        self.connection()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_nodes (
                path          TEXT NOT NULL PRIMARY KEY,
                kind          TEXT NOT NULL,
                content       TEXT NOT NULL,
                version       INTEGER NOT NULL,
                size          INTEGER NOT NULL,
                last_modified TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|_| BackendError::Unavailable("connection mutex poisoned".into()))
    }
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn load_all(&self) -> Result<Vec<MemoryNode>, BackendError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT path, kind, content, version, size, last_modified
             FROM memory_nodes
             ORDER BY path ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let content: String = row.get(2)?;
            let version: i64 = row.get(3)?;
            let size: i64 = row.get(4)?;
            let ts: String = row.get(5)?;
            Ok((path, kind, content, version, size, ts))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (path, kind, content, version, size, ts) = row?;
            let corrupt = |reason: String| BackendError::Corrupt {
                path: path.clone(),
                reason,
            };
            let kind = kind.parse::<NodeKind>().map_err(|e| corrupt(e.to_string()))?;
            let last_modified = ts
                .parse::<DateTime<Utc>>()
                .map_err(|e| corrupt(e.to_string()))?;
            let version = u64::try_from(version).map_err(|e| corrupt(e.to_string()))?;
            let size = usize::try_from(size).map_err(|e| corrupt(e.to_string()))?;
            nodes.push(MemoryNode {
                path,
                content,
                version,
                size,
                last_modified,
                kind,
            });
        }
        Ok(nodes)
    }

    fn apply(&self, ops: &[BackendOp]) -> Result<(), BackendError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                BackendOp::Put(node) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO memory_nodes
                             (path, kind, content, version, size, last_modified)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            node.path,
                            node.kind.as_str(),
                            node.content,
                            node.version as i64,
                            node.size as i64,
                            node.last_modified.to_rfc3339(),
                        ],
                    )?;
                }
                BackendOp::Remove(path) => {
                    tx.execute("DELETE FROM memory_nodes WHERE path = ?1", params![path])?;
                }
                BackendOp::Clear => {
                    tx.execute("DELETE FROM memory_nodes", [])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
