//! `cairn-memory` – persistent, path-addressable memory.
//!
//! Agents keep notes, plans and progress here so they survive context
//! resets.  The tree is shared by every session of the process and stays
//! correct under concurrent access: each mutation is serialised per path by
//! the kernel's lock manager and commits atomically.
//!
//! # Modules
//!
//! - [`node`] – [`MemoryNode`], [`MemoryView`], [`WriteMode`] and
//!   [`MemoryStats`].
//! - [`store`] – [`MemoryStore`]: versioned CRUD (`view`, `create_update`,
//!   `insert`, `str_replace`, `delete`, `rename`, `clear_all`).
//! - [`backend`] – the [`StorageBackend`][backend::StorageBackend] trait with
//!   an in-process [`NullBackend`][backend::NullBackend] and a SQLite
//!   implementation.

pub mod backend;
pub mod node;
pub mod store;

pub use backend::{BackendError, NullBackend, SqliteBackend, StorageBackend};
pub use node::{MemoryNode, MemoryStats, MemoryView, NodeKind, WriteMode};
pub use store::{DEFAULT_CHUNK_LIMIT, DEFAULT_LOCK_TTL, MemoryConfig, MemoryStore};
