//! [`RetrievalIndex`] – BM25 ranking over the registered tool catalog.
//!
//! Each descriptor is indexed under the terms of its name, description, tags
//! and parameter property names.  Registration and removal touch only the
//! postings of the descriptor's own terms and bump the catalog
//! **generation**.
//!
//! A search runs against a [`CatalogSnapshot`], which holds the index's read
//! lock for its lifetime: a concurrent registration waits until the
//! evaluation finished, so no score is ever computed against a half-updated
//! catalog.
//!
//! # Scoring
//!
//! For each query term `t` present in descriptor `d`:
//!
//! ```text
//! idf(t)    = ln(1 + (N - n_t + 0.5) / (n_t + 0.5))
//! raw(d)    = Σ idf(t) · tf(t,d) / (tf(t,d) + k1 · (1 - b + b · len(d) / avg_len))
//! score(d)  = raw(d) / Σ idf(t) over query terms known to the catalog
//! ```
//!
//! Every saturation factor is below 1, so `score` lies in `[0, 1]`.
//!
//! # Example
//!
//! ```
//! use cairn_discovery::enricher::Query;
//! use cairn_discovery::index::RetrievalIndex;
//! use cairn_types::ToolDescriptor;
//!
//! let index = RetrievalIndex::default();
//! index
//!     .add_descriptor(ToolDescriptor::new("email_sender", "send email message to a recipient"))
//!     .unwrap();
//! index
//!     .add_descriptor(ToolDescriptor::new("weather_lookup", "get the weather forecast"))
//!     .unwrap();
//!
//! let query = Query::from_terms("s", vec!["send".into(), "email".into()]);
//! let top = index.search(&query, 5, 0.15).next().unwrap();
//! assert_eq!(top.tool_name, "email_sender");
//! assert!(top.score > 0.15 && top.score <= 1.0);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cairn_types::{CairnError, ToolDescriptor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enricher::Query;
use crate::text::tokenize;

/// Default relevance cut-off.
pub const DEFAULT_THRESHOLD: f64 = 0.15;

/// BM25 free parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Length normalisation strength.
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// One ranked tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub tool_name: String,
    /// Relevance in `[0, 1]`.
    pub score: f64,
    /// Query terms the descriptor contains, in query order.
    pub matched_terms: Vec<String>,
    /// Registration ordinal, used to break score ties.
    #[serde(skip)]
    pub registration_order: u64,
}

fn rank_order(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.registration_order.cmp(&b.registration_order))
}

/// A finite, ranked, single-pass sequence of results.
#[derive(Debug, Default)]
pub struct RankedResults {
    inner: std::vec::IntoIter<RetrievalResult>,
}

impl RankedResults {
    fn from_sorted(results: Vec<RetrievalResult>) -> Self {
        Self {
            inner: results.into_iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl Iterator for RankedResults {
    type Item = RetrievalResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for RankedResults {}

impl FromIterator<RetrievalResult> for RankedResults {
    /// Collects and ranks: score descending, registration order ascending.
    fn from_iter<I: IntoIterator<Item = RetrievalResult>>(iter: I) -> Self {
        let mut results: Vec<RetrievalResult> = iter.into_iter().collect();
        results.sort_by(rank_order);
        Self::from_sorted(results)
    }
}

/// Merge the rankings of several queries, keeping each tool's best score.
///
/// The merged sequence is re-ranked and cut to `top_k`.
pub fn merge_results<I>(sets: I, top_k: usize) -> RankedResults
where
    I: IntoIterator<Item = RankedResults>,
{
    let mut best: HashMap<String, RetrievalResult> = HashMap::new();
    for result in sets.into_iter().flatten() {
        match best.get(&result.tool_name) {
            Some(existing) if existing.score >= result.score => {}
            _ => {
                best.insert(result.tool_name.clone(), result);
            }
        }
    }
    let mut merged: Vec<RetrievalResult> = best.into_values().collect();
    merged.sort_by(rank_order);
    merged.truncate(top_k);
    RankedResults::from_sorted(merged)
}

// ─────────────────────────────────────────────────────────────────────────────
// Index state
// ─────────────────────────────────────────────────────────────────────────────

struct IndexedTool {
    descriptor: ToolDescriptor,
    /// Term → frequency within this descriptor.
    terms: HashMap<String, u32>,
    len: usize,
}

#[derive(Default)]
struct IndexState {
    /// Registration ordinal → tool, iterated in registration order.
    tools: BTreeMap<u64, IndexedTool>,
    by_name: HashMap<String, u64>,
    /// Term → (ordinal → tf).
    postings: HashMap<String, BTreeMap<u64, u32>>,
    total_len: usize,
    generation: u64,
    next_ordinal: u64,
}

fn descriptor_terms(desc: &ToolDescriptor) -> Vec<String> {
    let mut terms = tokenize(&desc.name);
    terms.extend(tokenize(&desc.description));
    for tag in &desc.tags {
        terms.extend(tokenize(tag));
    }
    for param in desc.parameter_names() {
        terms.extend(tokenize(param));
    }
    terms
}

// ─────────────────────────────────────────────────────────────────────────────
// RetrievalIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Inverted index over the tool catalog.
#[derive(Default)]
pub struct RetrievalIndex {
    state: RwLock<IndexState>,
    params: Bm25Params,
}

impl RetrievalIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            params,
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Register `desc` and return the new catalog generation.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name, `Conflict` if the name is taken.
    pub fn add_descriptor(&self, desc: ToolDescriptor) -> Result<u64, CairnError> {
        if desc.name.trim().is_empty() {
            return Err(CairnError::Validation("tool name must not be empty".into()));
        }
        let mut state = self.write_state();
        if state.by_name.contains_key(&desc.name) {
            return Err(CairnError::Conflict(format!(
                "tool {:?} is already registered",
                desc.name
            )));
        }

        let all_terms = descriptor_terms(&desc);
        let mut terms: HashMap<String, u32> = HashMap::new();
        for t in &all_terms {
            *terms.entry(t.clone()).or_default() += 1;
        }

        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        for (term, tf) in &terms {
            state
                .postings
                .entry(term.clone())
                .or_default()
                .insert(ordinal, *tf);
        }
        state.total_len += all_terms.len();
        state.by_name.insert(desc.name.clone(), ordinal);
        let name = desc.name.clone();
        state.tools.insert(
            ordinal,
            IndexedTool {
                descriptor: desc,
                terms,
                len: all_terms.len(),
            },
        );
        state.generation += 1;
        debug!(tool = %name, terms = all_terms.len(), generation = state.generation, "tool registered");
        Ok(state.generation)
    }

    /// Remove the tool called `name` and return the new catalog generation.
    pub fn remove_descriptor(&self, name: &str) -> Result<u64, CairnError> {
        let mut state = self.write_state();
        let ordinal = state
            .by_name
            .remove(name)
            .ok_or_else(|| CairnError::NotFound(format!("tool {name:?} is not registered")))?;
        if let Some(tool) = state.tools.remove(&ordinal) {
            for term in tool.terms.keys() {
                if let Some(list) = state.postings.get_mut(term) {
                    list.remove(&ordinal);
                    if list.is_empty() {
                        state.postings.remove(term);
                    }
                }
            }
            state.total_len -= tool.len;
        }
        state.generation += 1;
        debug!(tool = name, generation = state.generation, "tool removed");
        Ok(state.generation)
    }

    pub fn generation(&self) -> u64 {
        self.read_state().generation
    }

    pub fn len(&self) -> usize {
        self.read_state().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        let state = self.read_state();
        let ordinal = state.by_name.get(name)?;
        state.tools.get(ordinal).map(|t| t.descriptor.clone())
    }

    /// Every registered descriptor, in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.read_state()
            .tools
            .values()
            .map(|t| t.descriptor.clone())
            .collect()
    }

    /// Pin the current catalog generation for one or more searches.
    pub fn snapshot(&self) -> CatalogSnapshot<'_> {
        CatalogSnapshot {
            state: self.read_state(),
            params: self.params,
        }
    }

    /// One-shot search against a fresh snapshot.
    pub fn search(&self, query: &Query, top_k: usize, threshold: f64) -> RankedResults {
        self.snapshot().search(query, top_k, threshold)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, IndexState> {
        // Writers finish every postings update before releasing the lock.
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CatalogSnapshot
// ─────────────────────────────────────────────────────────────────────────────

/// A read-locked, fixed-generation view of the catalog.
pub struct CatalogSnapshot<'a> {
    state: RwLockReadGuard<'a, IndexState>,
    params: Bm25Params,
}

impl CatalogSnapshot<'_> {
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn len(&self) -> usize {
        self.state.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.tools.is_empty()
    }

    /// The descriptor registered as `name` in this generation.
    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        let ordinal = self.state.by_name.get(name)?;
        self.state.tools.get(ordinal).map(|t| &t.descriptor)
    }

    /// Rank the catalog against `query`.
    ///
    /// Results scoring below `threshold` are dropped; at most `top_k` are
    /// returned.  An empty catalog, or a query sharing no term with it,
    /// yields an empty sequence.
    pub fn search(&self, query: &Query, top_k: usize, threshold: f64) -> RankedResults {
        let mut seen = BTreeSet::new();
        let terms: Vec<String> = query
            .enriched_terms
            .iter()
            .flat_map(|t| tokenize(t))
            .filter(|t| seen.insert(t.clone()))
            .collect();
        self.search_terms(&terms, top_k, threshold)
    }

    fn search_terms(&self, terms: &[String], top_k: usize, threshold: f64) -> RankedResults {
        let state = &self.state;
        let n = state.tools.len();
        if n == 0 || top_k == 0 {
            return RankedResults::default();
        }
        let avg_len = state.total_len as f64 / n as f64;
        let Bm25Params { k1, b } = self.params;

        let mut raw: BTreeMap<u64, (f64, Vec<String>)> = BTreeMap::new();
        let mut idf_total = 0.0;
        for term in terms {
            let Some(list) = state.postings.get(term) else {
                continue;
            };
            let n_t = list.len() as f64;
            let idf = (1.0 + (n as f64 - n_t + 0.5) / (n_t + 0.5)).ln();
            idf_total += idf;
            for (&ordinal, &tf) in list {
                let Some(tool) = state.tools.get(&ordinal) else {
                    continue;
                };
                let tf = f64::from(tf);
                let len_norm = if avg_len > 0.0 {
                    1.0 - b + b * tool.len as f64 / avg_len
                } else {
                    1.0
                };
                let entry = raw.entry(ordinal).or_insert_with(|| (0.0, Vec::new()));
                entry.0 += idf * tf / (tf + k1 * len_norm);
                entry.1.push(term.clone());
            }
        }
        if idf_total <= 0.0 {
            return RankedResults::default();
        }

        let mut results: Vec<RetrievalResult> = raw
            .into_iter()
            .filter_map(|(ordinal, (score, matched_terms))| {
                let score = (score / idf_total).clamp(0.0, 1.0);
                if score < threshold {
                    return None;
                }
                let tool = state.tools.get(&ordinal)?;
                Some(RetrievalResult {
                    tool_name: tool.descriptor.name.clone(),
                    score,
                    matched_terms,
                    registration_order: ordinal,
                })
            })
            .collect();
        results.sort_by(rank_order);
        results.truncate(top_k);
        RankedResults::from_sorted(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn q(terms: &[&str]) -> Query {
        Query::from_terms("test", terms.iter().map(|t| t.to_string()).collect())
    }

    fn catalog() -> RetrievalIndex {
        let index = RetrievalIndex::default();
        index
            .add_descriptor(
                ToolDescriptor::new("email_sender", "send email message to a recipient")
                    .with_tags(["communication"])
                    .with_parameters(json!({
                        "type": "object",
                        "properties": {
                            "recipient": {"type": "string"},
                            "subject": {"type": "string"},
                            "body": {"type": "string"}
                        }
                    })),
            )
            .unwrap();
        index
            .add_descriptor(ToolDescriptor::new(
                "calendar_event_creator",
                "create a calendar event with date time and participants",
            ))
            .unwrap();
        index
            .add_descriptor(ToolDescriptor::new(
                "weather_lookup",
                "get the current weather forecast for a location",
            ))
            .unwrap();
        index
            .add_descriptor(ToolDescriptor::new(
                "file_uploader",
                "upload a file or document to cloud storage",
            ))
            .unwrap();
        index
    }

    #[test]
    fn scores_are_normalised_and_sorted() {
        let index = catalog();
        let results: Vec<_> = index
            .search(&q(&["send", "email", "create", "calendar", "weather", "file"]), 10, 0.0)
            .collect();
        assert!(!results.is_empty());
        for r in &results {
            assert!((0.0..=1.0).contains(&r.score), "{}: {}", r.tool_name, r.score);
        }
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn ties_break_by_registration_order() {
        let index = RetrievalIndex::default();
        for name in ["zeta_tool", "alpha_tool", "mid_tool"] {
            index
                .add_descriptor(ToolDescriptor::new(name, "convert units"))
                .unwrap();
        }
        let names: Vec<_> = index
            .search(&q(&["convert"]), 10, 0.0)
            .map(|r| r.tool_name)
            .collect();
        assert_eq!(names, vec!["zeta_tool", "alpha_tool", "mid_tool"]);
    }

    #[test]
    fn parameter_names_and_tags_are_indexed() {
        let index = catalog();
        let top = index.search(&q(&["subject", "communication"]), 1, 0.0).next().unwrap();
        assert_eq!(top.tool_name, "email_sender");
        assert_eq!(top.matched_terms, vec!["subject", "communication"]);
    }

    #[test]
    fn threshold_and_top_k_bound_results() {
        let index = catalog();
        let query = q(&["send", "email", "weather", "upload"]);
        assert_eq!(index.search(&query, 2, 0.0).len(), 2);
        assert!(index.search(&query, 10, 0.99).is_empty());
        assert!(index.search(&query, 0, 0.0).is_empty());
    }

    #[test]
    fn unknown_terms_yield_empty_sequence() {
        let index = catalog();
        assert!(index.search(&q(&["launch", "satellite"]), 5, 0.15).is_empty());
        assert!(RetrievalIndex::default().search(&q(&["send"]), 5, 0.0).is_empty());
    }

    #[test]
    fn add_and_remove_bump_generation() {
        let index = RetrievalIndex::default();
        assert_eq!(index.generation(), 0);
        assert_eq!(index.add_descriptor(ToolDescriptor::new("a", "alpha")).unwrap(), 1);
        assert_eq!(index.add_descriptor(ToolDescriptor::new("b", "beta")).unwrap(), 2);
        assert_eq!(index.remove_descriptor("a").unwrap(), 3);
        assert_eq!(index.len(), 1);
        assert_eq!(index.descriptors()[0].name, "b");
    }

    #[test]
    fn duplicate_and_missing_descriptors() {
        let index = catalog();
        assert!(matches!(
            index.add_descriptor(ToolDescriptor::new("email_sender", "again")),
            Err(CairnError::Conflict(_))
        ));
        assert!(matches!(
            index.remove_descriptor("nope"),
            Err(CairnError::NotFound(_))
        ));
        assert!(matches!(
            index.add_descriptor(ToolDescriptor::new("  ", "blank")),
            Err(CairnError::Validation(_))
        ));
        assert_eq!(index.generation(), 4);
    }

    #[test]
    fn removed_tool_no_longer_matches() {
        let index = catalog();
        index.remove_descriptor("email_sender").unwrap();
        let names: Vec<_> = index
            .search(&q(&["email", "recipient"]), 5, 0.0)
            .map(|r| r.tool_name)
            .collect();
        assert!(names.is_empty());
        assert!(index.descriptor("email_sender").is_none());
    }

    #[test]
    fn merge_keeps_max_score_per_tool() {
        let mk = |name: &str, score: f64, order: u64| RetrievalResult {
            tool_name: name.into(),
            score,
            matched_terms: vec![],
            registration_order: order,
        };
        let a = RankedResults::from_sorted(vec![mk("x", 0.4, 0), mk("y", 0.3, 1)]);
        let b = RankedResults::from_sorted(vec![mk("y", 0.9, 1), mk("z", 0.2, 2)]);
        let merged: Vec<_> = merge_results([a, b], 10)
            .map(|r| (r.tool_name, r.score))
            .collect();
        assert_eq!(
            merged,
            vec![("y".to_string(), 0.9), ("x".to_string(), 0.4), ("z".to_string(), 0.2)]
        );
    }

    #[test]
    fn snapshot_pins_generation_against_concurrent_registration() {
        let index = Arc::new(catalog());
        let snapshot = index.snapshot();
        let pinned = snapshot.generation();

        let registered = Arc::new(Barrier::new(2));
        let writer = {
            let index = Arc::clone(&index);
            let registered = Arc::clone(&registered);
            thread::spawn(move || {
                registered.wait();
                index
                    .add_descriptor(ToolDescriptor::new("email_blaster", "send bulk email"))
                    .unwrap()
            })
        };
        registered.wait();
        // The writer is blocked on the snapshot's read lock.
        thread::sleep(std::time::Duration::from_millis(20));
        let names: Vec<_> = snapshot
            .search(&q(&["email"]), 10, 0.0)
            .map(|r| r.tool_name)
            .collect();
        assert_eq!(names, vec!["email_sender"]);
        assert_eq!(snapshot.generation(), pinned);
        drop(snapshot);

        assert_eq!(writer.join().unwrap(), pinned + 1);
        assert_eq!(index.search(&q(&["email"]), 10, 0.0).len(), 2);
    }

    #[test]
    fn collecting_ranks_results() {
        let mk = |name: &str, score: f64, order: u64| RetrievalResult {
            tool_name: name.into(),
            score,
            matched_terms: vec![],
            registration_order: order,
        };
        let ranked: Vec<_> = vec![mk("b", 0.2, 1), mk("a", 0.2, 0), mk("c", 0.7, 2)]
            .into_iter()
            .collect::<RankedResults>()
            .map(|r| r.tool_name)
            .collect();
        assert_eq!(ranked, vec!["c", "a", "b"]);
    }

    #[test]
    fn snapshot_resolves_descriptors() {
        let index = catalog();
        let snapshot = index.snapshot();
        assert_eq!(
            snapshot.descriptor("weather_lookup").map(|d| d.description.as_str()),
            Some("get the current weather forecast for a location")
        );
        assert!(snapshot.descriptor("nope").is_none());
    }

    #[test]
    fn serialised_result_omits_registration_order() {
        let result = RetrievalResult {
            tool_name: "x".into(),
            score: 0.5,
            matched_terms: vec!["a".into()],
            registration_order: 7,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("registration_order").is_none());
    }
}
