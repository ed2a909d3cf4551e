//! [`RepeatQueryGuard`] – detects a session re-issuing a fruitless query.
//!
//! An agent that gets nothing back from discovery tends to ask the same
//! question again verbatim.  The guard keeps a rolling window of the last
//! *N* query signatures per session; when the window is full, every entry is
//! identical and the latest attempt still found nothing, [`record`] returns
//! `true` and the caller tells the agent to change terminology or conclude
//! that the capability is absent.
//!
//! At most `max_sessions` windows are kept; a new session beyond that evicts
//! the one that has been idle longest.
//!
//! [`record`]: RepeatQueryGuard::record
//!
//! # Example
//!
//! ```rust
//! use cairn_runtime::retry_guard::RepeatQueryGuard;
//!
//! let guard = RepeatQueryGuard::new(3);
//!
//! assert!(!guard.record("s1", "launch satellite", false));
//! assert!(!guard.record("s1", "launch satellite", false));
//! assert!(guard.record("s1", "launch satellite", false)); // third fruitless repeat
//!
//! // Other sessions are tracked independently.
//! assert!(!guard.record("s2", "launch satellite", false));
//!
//! guard.reset("s1");
//! assert!(!guard.record("s1", "launch satellite", false));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Default number of identical fruitless queries that trips the guard.
pub const DEFAULT_REPEAT_THRESHOLD: usize = 3;

/// Default cap on sessions with a tracked window.
pub const DEFAULT_MAX_TRACKED_SESSIONS: usize = 1024;

struct Window {
    signatures: VecDeque<String>,
    last_used: Instant,
}

/// Per-session detector of repeated fruitless discovery queries.
pub struct RepeatQueryGuard {
    /// Consecutive identical signatures that count as a repeat; `0` disables.
    threshold: usize,
    max_sessions: usize,
    history: Mutex<HashMap<String, Window>>,
}

impl Default for RepeatQueryGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPEAT_THRESHOLD)
    }
}

impl RepeatQueryGuard {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            max_sessions: DEFAULT_MAX_TRACKED_SESSIONS,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the number of sessions tracked at once (minimum 1).
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record that `session_id` just issued `signature`.
    ///
    /// Returns `true` when the last `threshold` signatures of the session are
    /// identical and this attempt (`found` is `false`) came back empty.
    pub fn record(&self, session_id: &str, signature: &str, found: bool) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut history = self.table();
        if !history.contains_key(session_id) {
            while history.len() >= self.max_sessions {
                let idle = history
                    .iter()
                    .min_by_key(|(_, w)| w.last_used)
                    .map(|(k, _)| k.clone());
                let Some(idle) = idle else { break };
                history.remove(&idle);
            }
        }
        let window = history
            .entry(session_id.to_string())
            .or_insert_with(|| Window {
                signatures: VecDeque::new(),
                last_used: Instant::now(),
            });
        window.last_used = Instant::now();
        window.signatures.push_back(signature.to_string());
        while window.signatures.len() > self.threshold {
            window.signatures.pop_front();
        }
        !found && is_repeating(&window.signatures, self.threshold)
    }

    /// `true` while the session's window holds `threshold` identical entries.
    pub fn is_repeating(&self, session_id: &str) -> bool {
        self.threshold > 0
            && self
                .table()
                .get(session_id)
                .is_some_and(|w| is_repeating(&w.signatures, self.threshold))
    }

    /// Number of sessions with a live window.
    pub fn tracked_sessions(&self) -> usize {
        self.table().len()
    }

    /// Forget the history of `session_id`.
    pub fn reset(&self, session_id: &str) {
        self.table().remove(session_id);
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn is_repeating(window: &VecDeque<String>, threshold: usize) -> bool {
    window.len() >= threshold && window.iter().all(|s| s == &window[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varied_queries_never_trip() {
        let guard = RepeatQueryGuard::new(3);
        assert!(!guard.record("s", "a", false));
        assert!(!guard.record("s", "b", false));
        assert!(!guard.record("s", "a", false));
    }

    #[test]
    fn trips_at_threshold_and_stays_tripped() {
        let guard = RepeatQueryGuard::new(3);
        guard.record("s", "q", false);
        guard.record("s", "q", false);
        assert!(guard.record("s", "q", false));
        assert!(guard.record("s", "q", false));
        assert!(guard.is_repeating("s"));
    }

    #[test]
    fn successful_repeat_does_not_trip() {
        let guard = RepeatQueryGuard::new(2);
        guard.record("s", "q", true);
        assert!(!guard.record("s", "q", true));
        assert!(guard.is_repeating("s"));
    }

    #[test]
    fn different_query_breaks_streak() {
        let guard = RepeatQueryGuard::new(3);
        guard.record("s", "q", false);
        guard.record("s", "q", false);
        guard.record("s", "other", false);
        assert!(!guard.is_repeating("s"));
    }

    #[test]
    fn window_slides() {
        let guard = RepeatQueryGuard::new(3);
        for sig in ["a", "b", "a", "c", "c"] {
            guard.record("s", sig, false);
        }
        assert!(guard.record("s", "c", false));
    }

    #[test]
    fn zero_threshold_disables() {
        let guard = RepeatQueryGuard::new(0);
        for _ in 0..5 {
            assert!(!guard.record("s", "q", false));
        }
        assert!(!guard.is_repeating("s"));
    }

    #[test]
    fn reset_clears_one_session_only() {
        let guard = RepeatQueryGuard::new(2);
        for session in ["a", "b"] {
            guard.record(session, "q", false);
            guard.record(session, "q", false);
        }
        guard.reset("a");
        assert!(!guard.is_repeating("a"));
        assert!(guard.is_repeating("b"));
    }

    #[test]
    fn idle_sessions_evicted_beyond_cap() {
        let guard = RepeatQueryGuard::new(2).with_max_sessions(2);
        guard.record("idle", "q", false);
        guard.record("idle", "q", false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        guard.record("active", "q", false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        guard.record("newcomer", "q", false);

        assert_eq!(guard.tracked_sessions(), 2);
        assert!(!guard.is_repeating("idle"));
        // The evicted session starts over.
        assert!(!guard.record("idle", "q", false));
    }
}
