//! [`LockManager`] – advisory per-path exclusive locks with TTL recovery.
//!
//! Every memory mutation acquires the lock of the single path it touches and
//! holds it until the new node is committed.  A holder that crashes or is
//! cancelled never wedges a path: once a lock outlives its TTL it is treated
//! as abandoned and the next acquirer reclaims it.
//!
//! Tokens carry a unique id, so a holder whose lock was reclaimed can neither
//! release the new holder's lock nor commit under it ([`LockManager::is_held`]
//! returns `false`).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use cairn_kernel::lock_manager::LockManager;
//!
//! let locks = LockManager::new();
//! let token = locks.acquire("/memories/a", "writer-1", Duration::from_secs(5)).unwrap();
//! assert!(locks.is_held(&token));
//!
//! // A second holder times out while the first one is live.
//! assert!(locks.acquire("/memories/a", "writer-2", Duration::from_millis(10)).is_err());
//!
//! // Disjoint paths never contend.
//! assert!(locks.acquire("/memories/b", "writer-2", Duration::from_millis(10)).is_ok());
//!
//! locks.release(token);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cairn_types::CairnError;
use tracing::{debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Proof of a granted lock.  Hand it back to [`LockManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub path: String,
    pub holder_id: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
    id: u64,
}

impl LockToken {
    /// `true` once the lock has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }
}

/// Snapshot of the live lock on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub path: String,
    pub holder_id: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct LockEntry {
    id: u64,
    holder_id: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }

    fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LockManager
// ────────────────────────────────────────────────────────────────────────────

/// Per-path exclusive lock table.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, LockEntry>>,
    released: Condvar,
    next_id: AtomicU64,
}

impl LockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock on `path` for `holder_id`.
    ///
    /// Blocks for at most `ttl` while another live holder owns the path.  An
    /// existing lock whose TTL has elapsed is reclaimed immediately.
    ///
    /// # Errors
    ///
    /// [`CairnError::LockTimeout`] when the path stayed locked for the whole
    /// wait.
    pub fn acquire(
        &self,
        path: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, CairnError> {
        let started = Instant::now();
        let deadline = started + ttl;
        let mut table = self.table();

        loop {
            let wait_for = match table.get(path) {
                Some(entry) if !entry.is_expired() => entry.remaining(),
                Some(stale) => {
                    warn!(
                        path,
                        abandoned_by = %stale.holder_id,
                        "reclaiming lock held past its TTL"
                    );
                    Duration::ZERO
                }
                None => Duration::ZERO,
            };

            if wait_for.is_zero() {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let acquired_at = Instant::now();
                table.insert(
                    path.to_string(),
                    LockEntry {
                        id,
                        holder_id: holder_id.to_string(),
                        acquired_at,
                        ttl,
                    },
                );
                debug!(path, holder_id, "lock granted");
                return Ok(LockToken {
                    path: path.to_string(),
                    holder_id: holder_id.to_string(),
                    acquired_at,
                    ttl,
                    id,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CairnError::LockTimeout {
                    path: path.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
            // Wake on release, on the holder's expiry, or on our own deadline,
            // whichever comes first.
            let timeout = wait_for.min(deadline - now);
            table = match self.released.wait_timeout(table, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Like [`acquire`][Self::acquire] but returns a [`LockGuard`] that
    /// releases the lock when dropped.
    pub fn acquire_guard(
        &self,
        path: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockGuard<'_>, CairnError> {
        let token = self.acquire(path, holder_id, ttl)?;
        Ok(LockGuard {
            manager: self,
            token,
        })
    }

    /// Release the lock identified by `token`.
    ///
    /// Returns `false` when the lock had already expired and been reclaimed
    /// by another holder; the newer lock is left untouched.
    pub fn release(&self, token: LockToken) -> bool {
        let mut table = self.table();
        let owned = table.get(&token.path).is_some_and(|e| e.id == token.id);
        if owned {
            table.remove(&token.path);
            drop(table);
            self.released.notify_all();
            debug!(path = %token.path, holder_id = %token.holder_id, "lock released");
        } else {
            warn!(
                path = %token.path,
                holder_id = %token.holder_id,
                "release of a lock that was already reclaimed"
            );
        }
        owned
    }

    /// `true` while `token` is still the live, unexpired lock on its path.
    pub fn is_held(&self, token: &LockToken) -> bool {
        self.table()
            .get(&token.path)
            .is_some_and(|e| e.id == token.id && !e.is_expired())
    }

    /// The live lock on `path`, if any.
    pub fn holder(&self, path: &str) -> Option<LockInfo> {
        self.table()
            .get(path)
            .filter(|e| !e.is_expired())
            .map(|e| LockInfo {
                path: path.to_string(),
                holder_id: e.holder_id.clone(),
                acquired_at: e.acquired_at,
                ttl: e.ttl,
            })
    }

    /// Drop every lock whose TTL has elapsed and return how many were swept.
    pub fn reap_expired(&self) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, e| !e.is_expired());
        let reaped = before - table.len();
        drop(table);
        if reaped > 0 {
            self.released.notify_all();
        }
        reaped
    }

    /// Number of entries currently in the table (including expired ones not
    /// yet reclaimed).
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        // A panic while holding the table cannot leave an entry half-written,
        // so a poisoned mutex is still consistent.
        self.locks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RAII guard
// ────────────────────────────────────────────────────────────────────────────

/// Releases its lock on drop, so an early return or a panic inside a
/// mutation never leaves the path locked until TTL expiry.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    token: LockToken,
}

impl LockGuard<'_> {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// `true` while the guarded lock has not expired or been reclaimed.
    pub fn is_held(&self) -> bool {
        self.manager.is_held(&self.token)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.token.clone());
    }
}
