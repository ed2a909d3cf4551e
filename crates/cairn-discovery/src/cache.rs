//! [`ResultCache`] – per-session memoisation of discovery results.
//!
//! Entries are keyed by `(session_id, query signature, catalog generation)`.
//! When a session asks with a newer generation, every entry it cached under
//! the old one is dropped before the lookup, so a stale ranking is never
//! served.  The cache never affects correctness: disabled, every call simply
//! computes.
//!
//! Sessions that are never ended do not accumulate: with a TTL, expired
//! entries are swept from every session at most once per TTL period as new
//! results are stored, and beyond `max_sessions` the least recently used
//! session is evicted.
//!
//! # Example
//!
//! ```
//! use cairn_discovery::cache::{CacheConfig, ResultCache};
//!
//! let cache: ResultCache<Vec<String>> = ResultCache::new(CacheConfig::default());
//!
//! let first = cache
//!     .get_or_compute("s1", "email send", 1, || Ok::<_, ()>(vec!["email_sender".into()]))
//!     .unwrap();
//! let again = cache
//!     .get_or_compute("s1", "email send", 1, || -> Result<Vec<String>, ()> { unreachable!() })
//!     .unwrap();
//! assert_eq!(first, again);
//! assert_eq!(cache.stats().hits, 1);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

/// Default per-session entry cap.
pub const DEFAULT_MAX_ENTRIES_PER_SESSION: usize = 128;

/// Default cap on sessions holding cached results.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entry lifetime; `None` keeps entries until the session ends.
    pub ttl: Option<Duration>,
    /// Oldest entries are evicted beyond this many per session.
    pub max_entries_per_session: usize,
    /// Least recently used sessions are evicted beyond this many.
    pub max_sessions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
            max_entries_per_session: DEFAULT_MAX_ENTRIES_PER_SESSION,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Counters reported by [`ResultCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub sessions: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

struct SessionEntries<V> {
    generation: u64,
    entries: HashMap<String, CachedEntry<V>>,
    last_used: Instant,
}

impl<V> SessionEntries<V> {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: HashMap::new(),
            last_used: Instant::now(),
        }
    }
}

type SessionTable<V> = HashMap<String, SessionEntries<V>>;

/// Session-scoped cache of computed values.
pub struct ResultCache<V> {
    sessions: Mutex<SessionTable<V>>,
    config: CacheConfig,
    /// When expired entries were last swept from every session.
    swept_at: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            swept_at: Mutex::new(Instant::now()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached value for the key, or run `compute` and cache its
    /// success.
    ///
    /// `compute` runs outside the cache lock.  Its result is stored only if
    /// the session has not moved on to a newer generation meanwhile; errors
    /// are never cached.
    pub fn get_or_compute<F, E>(
        &self,
        session_id: &str,
        signature: &str,
        generation: u64,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return compute();
        }

        if let Some(value) = self.lookup(session_id, signature, generation) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(session_id, signature, generation, "discovery cache hit");
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let value = compute()?;
        self.store(session_id, signature, generation, value.clone());
        Ok(value)
    }

    /// Drop every entry of `session_id`.  Returns whether it had any state.
    pub fn invalidate(&self, session_id: &str) -> bool {
        self.table().remove(session_id).is_some()
    }

    pub fn clear(&self) {
        self.table().clear();
    }

    /// Sweep entries older than the TTL.  Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.config.ttl else {
            return 0;
        };
        let purged = purge_older_than(&mut self.table(), ttl);
        *self.sweep_marker() = Instant::now();
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table();
        CacheStats {
            sessions: table.len(),
            entries: table.values().map(|s| s.entries.len()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, session_id: &str, signature: &str, generation: u64) -> Option<V> {
        let mut table = self.table();
        let session = table.get_mut(session_id)?;
        session.last_used = Instant::now();
        if session.generation < generation {
            debug!(
                session_id,
                old = session.generation,
                new = generation,
                "catalog changed, dropping cached results"
            );
            *session = SessionEntries::new(generation);
            return None;
        }
        if session.generation != generation {
            return None;
        }
        let expired = match (self.config.ttl, session.entries.get(signature)) {
            (_, None) => return None,
            (Some(ttl), Some(entry)) => entry.inserted_at.elapsed() > ttl,
            (None, Some(_)) => false,
        };
        if expired {
            session.entries.remove(signature);
            return None;
        }
        session.entries.get(signature).map(|e| e.value.clone())
    }

    fn store(&self, session_id: &str, signature: &str, generation: u64, value: V) {
        let mut table = self.table();
        self.sweep_if_due(&mut table);
        if !table.contains_key(session_id) {
            self.make_room(&mut table);
        }
        let session = table
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntries::new(generation));
        session.last_used = Instant::now();
        if session.generation < generation {
            *session = SessionEntries::new(generation);
        }
        if session.generation != generation {
            return;
        }
        session.entries.insert(
            signature.to_string(),
            CachedEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        while session.entries.len() > self.config.max_entries_per_session.max(1) {
            let oldest = session
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    session.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Sweep expired entries when a full TTL period has passed since the
    /// last sweep.
    fn sweep_if_due(&self, table: &mut SessionTable<V>) {
        let Some(ttl) = self.config.ttl else {
            return;
        };
        let mut swept_at = self.sweep_marker();
        if swept_at.elapsed() < ttl {
            return;
        }
        *swept_at = Instant::now();
        let purged = purge_older_than(table, ttl);
        if purged > 0 {
            debug!(purged, "expired discovery results swept");
        }
    }

    /// Evict least recently used sessions until one more fits.
    fn make_room(&self, table: &mut SessionTable<V>) {
        while table.len() >= self.config.max_sessions.max(1) {
            let idle = table
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| k.clone());
            match idle {
                Some(key) => {
                    table.remove(&key);
                    debug!(session_id = %key, "idle session evicted from discovery cache");
                }
                None => break,
            }
        }
    }

    fn table(&self) -> MutexGuard<'_, SessionTable<V>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sweep_marker(&self) -> MutexGuard<'_, Instant> {
        self.swept_at.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Drop entries older than `ttl` and sessions left empty.  Returns how many
/// entries went.
fn purge_older_than<V>(table: &mut SessionTable<V>, ttl: Duration) -> usize {
    let mut purged = 0;
    for session in table.values_mut() {
        let before = session.entries.len();
        session.entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        purged += before - session.entries.len();
    }
    table.retain(|_, s| !s.entries.is_empty());
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;

    fn cache() -> ResultCache<u32> {
        ResultCache::new(CacheConfig::default())
    }

    fn compute_counting(calls: &Cell<u32>, value: u32) -> impl FnOnce() -> Result<u32, ()> + '_ {
        move || {
            calls.set(calls.get() + 1);
            Ok(value)
        }
    }

    #[test]
    fn second_lookup_hits() {
        let c = cache();
        let calls = Cell::new(0);
        assert_eq!(c.get_or_compute("s", "q", 1, compute_counting(&calls, 7)), Ok(7));
        assert_eq!(c.get_or_compute("s", "q", 1, compute_counting(&calls, 8)), Ok(7));
        assert_eq!(calls.get(), 1);
        let stats = c.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn sessions_are_isolated() {
        let c = cache();
        let calls = Cell::new(0);
        c.get_or_compute("a", "q", 1, compute_counting(&calls, 1)).unwrap();
        assert_eq!(c.get_or_compute("b", "q", 1, compute_counting(&calls, 2)), Ok(2));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn newer_generation_never_serves_stale_entries() {
        let c = cache();
        c.get_or_compute("s", "q", 1, || Ok::<_, ()>(1)).unwrap();
        c.get_or_compute("s", "other", 1, || Ok::<_, ()>(5)).unwrap();
        assert_eq!(c.get_or_compute("s", "q", 2, || Ok::<_, ()>(2)), Ok(2));
        // The whole session was reset, not just the looked-up key.
        assert_eq!(c.stats().entries, 1);
    }

    #[test]
    fn older_generation_is_computed_but_not_stored() {
        let c = cache();
        c.get_or_compute("s", "q", 3, || Ok::<_, ()>(3)).unwrap();
        assert_eq!(c.get_or_compute("s", "q", 2, || Ok::<_, ()>(2)), Ok(2));
        assert_eq!(c.get_or_compute("s", "q", 3, || Ok::<_, ()>(99)), Ok(3));
    }

    #[test]
    fn errors_are_not_cached() {
        let c = cache();
        assert_eq!(c.get_or_compute("s", "q", 1, || Err::<u32, _>("boom")), Err("boom"));
        assert_eq!(c.get_or_compute("s", "q", 1, || Ok::<_, &str>(4)), Ok(4));
    }

    #[test]
    fn invalidate_drops_session() {
        let c = cache();
        c.get_or_compute("s", "q", 1, || Ok::<_, ()>(1)).unwrap();
        assert!(c.invalidate("s"));
        assert!(!c.invalidate("s"));
        assert_eq!(c.get_or_compute("s", "q", 1, || Ok::<_, ()>(2)), Ok(2));
    }

    #[test]
    fn ttl_expires_entries() {
        let c = ResultCache::new(CacheConfig {
            ttl: Some(Duration::from_millis(10)),
            ..CacheConfig::default()
        });
        c.get_or_compute("s", "q", 1, || Ok::<_, ()>(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(c.get_or_compute("s", "q", 1, || Ok::<_, ()>(2)), Ok(2));

        c.get_or_compute("s", "r", 1, || Ok::<_, ()>(3)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(c.purge_expired(), 2);
        assert_eq!(c.stats().sessions, 0);
    }

    #[test]
    fn oldest_entry_evicted_beyond_cap() {
        let c = ResultCache::new(CacheConfig {
            max_entries_per_session: 2,
            ..CacheConfig::default()
        });
        for (i, sig) in ["a", "b", "c"].into_iter().enumerate() {
            c.get_or_compute("s", sig, 1, || Ok::<_, ()>(i as u32)).unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(c.stats().entries, 2);
        assert_eq!(c.get_or_compute("s", "a", 1, || Ok::<_, ()>(42)), Ok(42));
    }

    #[test]
    fn abandoned_sessions_are_swept_once_expired() {
        let c = ResultCache::new(CacheConfig {
            ttl: Some(Duration::from_millis(20)),
            ..CacheConfig::default()
        });
        for session in ["gone-1", "gone-2", "gone-3"] {
            c.get_or_compute(session, "q", 1, || Ok::<_, ()>(1)).unwrap();
        }
        assert_eq!(c.stats().sessions, 3);

        thread::sleep(Duration::from_millis(30));
        // Only a live session keeps storing; the abandoned ones are reclaimed.
        c.get_or_compute("live", "q", 1, || Ok::<_, ()>(2)).unwrap();
        let stats = c.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn least_recently_used_session_evicted_beyond_cap() {
        let c = ResultCache::new(CacheConfig {
            max_sessions: 2,
            ..CacheConfig::default()
        });
        c.get_or_compute("old", "q", 1, || Ok::<_, ()>(1)).unwrap();
        thread::sleep(Duration::from_millis(2));
        c.get_or_compute("busy", "q", 1, || Ok::<_, ()>(2)).unwrap();
        thread::sleep(Duration::from_millis(2));
        // A hit refreshes "old", so "busy" is now the idle one.
        assert_eq!(c.get_or_compute("old", "q", 1, || Ok::<_, ()>(9)), Ok(1));
        thread::sleep(Duration::from_millis(2));

        c.get_or_compute("new", "q", 1, || Ok::<_, ()>(3)).unwrap();
        assert_eq!(c.stats().sessions, 2);
        assert_eq!(c.get_or_compute("old", "q", 1, || Ok::<_, ()>(9)), Ok(1));
        assert_eq!(c.get_or_compute("busy", "q", 1, || Ok::<_, ()>(7)), Ok(7));
    }

    #[test]
    fn disabled_cache_always_computes() {
        let c = ResultCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let calls = Cell::new(0);
        c.get_or_compute("s", "q", 1, compute_counting(&calls, 1)).unwrap();
        c.get_or_compute("s", "q", 1, compute_counting(&calls, 1)).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(c.stats().entries, 0);
    }
}
