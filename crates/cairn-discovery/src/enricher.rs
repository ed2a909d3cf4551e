//! [`QueryEnricher`] – turns a raw request into BM25-friendly queries.
//!
//! Short requests like "send an email to my team" share few literal terms
//! with the descriptions of the tools that could serve them.  The enricher
//! widens each request with fixed tables of synonyms, related domain terms
//! and parameter-name hints, then bounds the result to a length the index
//! ranks well.
//!
//! Compound requests ("analyze the sales data and email the report") become
//! one [`Query`] per actionable clause; the caller searches each and merges
//! the rankings with [`merge_results`][crate::index::merge_results].
//!
//! Enrichment is deterministic: the same text and tables always produce the
//! same terms in the same order.
//!
//! # Example
//!
//! ```
//! use cairn_discovery::enricher::{QueryEnricher, SessionContext};
//!
//! let enricher = QueryEnricher::new();
//! let queries = enricher
//!     .enrich("send an email to my team", &SessionContext::new("s-1"))
//!     .unwrap();
//!
//! assert_eq!(queries.len(), 1);
//! let terms = &queries[0].enriched_terms;
//! for t in ["send", "email", "team", "recipient"] {
//!     assert!(terms.iter().any(|x| x == t), "missing {t}");
//! }
//!
//! assert!(enricher.enrich("hello there!", &SessionContext::new("s-1")).is_err());
//! ```

use std::collections::{HashMap, HashSet};

use cairn_types::CairnError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::{self, tokenize};

/// Enriched text length the enricher aims for.
pub const TARGET_QUERY_CHARS: usize = 150;
/// Enriched text is truncated beyond this length.
pub const MAX_QUERY_CHARS: usize = 200;
/// Shorter enriched text is rejected as under-specified.
pub const MIN_QUERY_CHARS: usize = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Per-session information the enricher is given with each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

/// One enriched discovery query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub raw_text: String,
    /// Terms in priority order: original terms first, enrichment after.
    pub enriched_terms: Vec<String>,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    /// Set when the enriched text hit the hard cap and was cut.
    pub truncated: bool,
}

impl Query {
    /// A query over exactly `terms`, bypassing enrichment.
    pub fn from_terms(session_id: impl Into<String>, terms: Vec<String>) -> Self {
        Self {
            raw_text: terms.join(" "),
            enriched_terms: terms,
            session_id: session_id.into(),
            issued_at: Utc::now(),
            truncated: false,
        }
    }

    /// The enriched text, space separated.
    pub fn text(&self) -> String {
        self.enriched_terms.join(" ")
    }

    /// Order-insensitive cache key: the sorted, de-duplicated terms.
    pub fn signature(&self) -> String {
        let mut terms: Vec<&str> = self.enriched_terms.iter().map(String::as_str).collect();
        terms.sort_unstable();
        terms.dedup();
        terms.join(" ")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in tables
// ─────────────────────────────────────────────────────────────────────────────

type Table = &'static [(&'static str, &'static [&'static str])];

/// Verbs that make a clause actionable.  Entries are in folded form.
const ACTION_VERBS: &[&str] = &[
    "add", "analyze", "book", "buy", "calculate", "cancel", "check", "compute", "convert",
    "create", "delete", "deploy", "download", "edit", "export", "fetch", "find", "generate",
    "get", "import", "launch", "list", "load", "look", "make", "modify", "monitor", "notify",
    "open", "order", "pay", "play", "post", "publish", "read", "remove", "retrieve", "run",
    "save", "schedule", "search", "send", "set", "share", "show", "start", "stop",
    "summarize", "track", "transfer", "translate", "update", "upload", "view", "write",
];

/// Words that never make a request actionable on their own.
const PLEASANTRIES: &[&str] = &[
    "afternoon", "bye", "cheer", "cool", "day", "doing", "evening", "fine", "good", "goodbye",
    "great", "hello", "hey", "hi", "how", "morning", "nice", "no", "ok", "okay", "sure",
    "thank", "thanks", "there", "what", "welcome", "who", "why", "yes",
];

const SYNONYMS: Table = &[
    ("send", &["transmit", "deliver", "dispatch", "notify"]),
    ("create", &["generate", "make", "build", "new"]),
    ("delete", &["remove", "erase", "discard"]),
    ("update", &["modify", "edit", "change"]),
    ("modify", &["update", "edit", "change"]),
    ("schedule", &["plan", "book", "arrange"]),
    ("cancel", &["abort", "revoke", "stop"]),
    ("write", &["compose", "draft", "author"]),
    ("generate", &["create", "produce", "build"]),
    ("post", &["publish", "share", "submit"]),
    ("publish", &["post", "release", "share"]),
    ("get", &["retrieve", "fetch", "obtain"]),
    ("retrieve", &["get", "fetch", "obtain"]),
    ("fetch", &["get", "retrieve", "download"]),
    ("check", &["view", "retrieve", "get", "fetch", "show"]),
    ("find", &["search", "lookup", "locate"]),
    ("search", &["find", "lookup", "query"]),
    ("list", &["enumerate", "show", "browse"]),
    ("show", &["display", "view", "list"]),
    ("read", &["view", "open", "load"]),
    ("upload", &["send", "transfer", "submit", "attach"]),
    ("download", &["fetch", "retrieve", "save"]),
    ("analyze", &["process", "calculate", "statistic"]),
    ("launch", &["start", "initiate", "deploy", "run"]),
    ("book", &["reserve", "schedule"]),
    ("email", &["message", "correspondence", "mail"]),
    ("message", &["email", "notification", "text"]),
    ("team", &["group", "colleague"]),
    ("calendar", &["schedule", "agenda"]),
    ("meeting", &["appointment", "event"]),
    ("file", &["document", "attachment"]),
    ("document", &["file", "report"]),
    ("report", &["document", "summary"]),
    ("weather", &["forecast", "climate"]),
    ("data", &["dataset", "record"]),
    ("picture", &["image", "photo"]),
    ("photo", &["image", "picture"]),
];

const RELATED: Table = &[
    ("send", &["communicate", "delivery"]),
    ("email", &["communication", "inbox"]),
    ("message", &["communication", "chat"]),
    ("team", &["recipient", "member"]),
    ("calendar", &["event", "appointment", "meeting"]),
    ("meeting", &["calendar", "invite"]),
    ("weather", &["temperature", "condition"]),
    ("file", &["storage", "upload"]),
    ("upload", &["storage", "cloud"]),
    ("report", &["export", "pdf", "format"]),
    ("sale", &["revenue", "metric"]),
    ("data", &["statistic", "metric", "aggregation"]),
    ("analyze", &["summary", "insight"]),
    ("tomorrow", &["date", "upcoming"]),
];

const PARAM_HINTS: Table = &[
    ("email", &["recipient", "subject", "body", "attachment"]),
    ("message", &["recipient", "body"]),
    ("send", &["recipient"]),
    ("calendar", &["date", "time", "participant", "duration"]),
    ("meeting", &["date", "time", "location", "participant"]),
    ("schedule", &["date", "time"]),
    ("weather", &["location", "city", "date"]),
    ("file", &["filename", "path", "size"]),
    ("upload", &["filename", "destination"]),
    ("search", &["keyword", "filter"]),
    ("report", &["title", "format"]),
];

fn owned(table: Table) -> HashMap<String, Vec<String>> {
    table
        .iter()
        .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// QueryEnricher
// ─────────────────────────────────────────────────────────────────────────────

/// Table-driven query expansion.
#[derive(Debug, Clone)]
pub struct QueryEnricher {
    actions: HashSet<String>,
    synonyms: HashMap<String, Vec<String>>,
    related: HashMap<String, Vec<String>>,
    param_hints: HashMap<String, Vec<String>>,
}

impl Default for QueryEnricher {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEnricher {
    /// An enricher loaded with the built-in tables.
    pub fn new() -> Self {
        Self {
            actions: ACTION_VERBS.iter().map(|s| s.to_string()).collect(),
            synonyms: owned(SYNONYMS),
            related: owned(RELATED),
            param_hints: owned(PARAM_HINTS),
        }
    }

    /// An enricher with empty tables and no action verbs.
    pub fn empty() -> Self {
        Self {
            actions: HashSet::new(),
            synonyms: HashMap::new(),
            related: HashMap::new(),
            param_hints: HashMap::new(),
        }
    }

    /// Treat `verb` as an action verb.
    pub fn add_action(&mut self, verb: &str) {
        self.actions.insert(text::fold(&verb.to_lowercase()));
    }

    pub fn add_synonyms(&mut self, term: &str, synonyms: &[&str]) {
        extend_table(&mut self.synonyms, term, synonyms);
    }

    pub fn add_related(&mut self, term: &str, related: &[&str]) {
        extend_table(&mut self.related, term, related);
    }

    pub fn add_param_hints(&mut self, term: &str, hints: &[&str]) {
        extend_table(&mut self.param_hints, term, hints);
    }

    pub fn is_action(&self, term: &str) -> bool {
        self.actions.contains(term)
    }

    /// Enrich `raw_text` into one query per actionable clause.
    ///
    /// # Errors
    ///
    /// [`CairnError::Validation`] when the text is empty, carries nothing
    /// but greetings or stop words, or stays under [`MIN_QUERY_CHARS`] after
    /// enrichment.
    pub fn enrich(&self, raw_text: &str, ctx: &SessionContext) -> Result<Vec<Query>, CairnError> {
        if raw_text.trim().is_empty() {
            return Err(CairnError::Validation("discovery query is empty".into()));
        }

        let groups = self.actionable_groups(raw_text);
        if groups.is_empty() {
            return Err(CairnError::Validation(format!(
                "{raw_text:?} is not an actionable request; skip tool discovery"
            )));
        }

        let issued_at = Utc::now();
        groups
            .into_iter()
            .map(|terms| {
                let (enriched_terms, truncated) = self.expand(&terms);
                let len = joined_len(&enriched_terms);
                if len < MIN_QUERY_CHARS {
                    return Err(CairnError::Validation(format!(
                        "query {:?} is under-specified ({len} characters after enrichment, \
                         need {MIN_QUERY_CHARS}); describe the action and its object",
                        terms.join(" ")
                    )));
                }
                Ok(Query {
                    raw_text: raw_text.to_string(),
                    enriched_terms,
                    session_id: ctx.session_id.clone(),
                    issued_at,
                    truncated,
                })
            })
            .collect()
    }

    /// Split into clauses, fold action-less clauses into the preceding one,
    /// and drop groups made only of pleasantries.
    fn actionable_groups(&self, raw_text: &str) -> Vec<Vec<String>> {
        let mut groups: Vec<(Vec<String>, bool)> = Vec::new();
        for clause in split_clauses(raw_text) {
            let terms: Vec<String> = tokenize(&clause)
                .into_iter()
                .filter(|t| !PLEASANTRIES.contains(&t.as_str()))
                .collect();
            if terms.is_empty() {
                continue;
            }
            let has_action = terms.iter().any(|t| self.is_action(t));
            match groups.last_mut() {
                Some((group, _)) if !has_action => group.extend(terms),
                _ => groups.push((terms, has_action)),
            }
        }
        groups
            .into_iter()
            .map(|(mut terms, _)| {
                dedup_in_place(&mut terms);
                terms
            })
            .collect()
    }

    /// Expand `originals` by tier and bound the result.
    fn expand(&self, originals: &[String]) -> (Vec<String>, bool) {
        let lookup = |table: &HashMap<String, Vec<String>>, t: &String| -> Vec<String> {
            table.get(t).cloned().unwrap_or_default()
        };

        let mut tiers: Vec<Vec<String>> = vec![Vec::new(); 4];
        for t in originals {
            let syns = lookup(&self.synonyms, t);
            let split = syns.len().min(2);
            tiers[0].extend(syns[..split].iter().cloned());
            tiers[1].extend(lookup(&self.related, t));
            tiers[2].extend(lookup(&self.param_hints, t));
            tiers[3].extend(syns[split..].iter().cloned());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut out: Vec<String> = Vec::new();
        for t in originals {
            if seen.insert(t) {
                out.push(t.clone());
            }
        }

        if joined_len(&out) > MAX_QUERY_CHARS {
            truncate_terms(&mut out, MAX_QUERY_CHARS);
            return (out, true);
        }

        let mut len = joined_len(&out);
        'fill: for tier in &tiers {
            for t in tier {
                if seen.contains(t.as_str()) {
                    continue;
                }
                let added = if out.is_empty() { t.len() } else { t.len() + 1 };
                if len + added > TARGET_QUERY_CHARS {
                    break 'fill;
                }
                seen.insert(t);
                out.push(t.clone());
                len += added;
            }
        }
        (out, false)
    }
}

fn extend_table(table: &mut HashMap<String, Vec<String>>, term: &str, values: &[&str]) {
    let entry = table.entry(text::fold(&term.to_lowercase())).or_default();
    for v in values {
        let v = text::fold(&v.to_lowercase());
        if !entry.contains(&v) {
            entry.push(v);
        }
    }
}

/// Split on `,` `;` `.` and the connectives `and` / `then`.
fn split_clauses(raw: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for piece in raw.split_inclusive([',', ';', '.', '\n']) {
        let ends_clause = piece.ends_with([',', ';', '.', '\n']);
        for word in piece.split(|c: char| c.is_whitespace() || ",;.".contains(c)) {
            if word.is_empty() {
                continue;
            }
            if word.eq_ignore_ascii_case("and") || word.eq_ignore_ascii_case("then") {
                flush(&mut clauses, &mut current);
            } else {
                current.push(word);
            }
        }
        if ends_clause {
            flush(&mut clauses, &mut current);
        }
    }
    flush(&mut clauses, &mut current);
    clauses
}

fn flush(clauses: &mut Vec<String>, current: &mut Vec<&str>) {
    if !current.is_empty() {
        clauses.push(current.join(" "));
        current.clear();
    }
}

fn dedup_in_place(terms: &mut Vec<String>) {
    let mut seen = HashSet::new();
    terms.retain(|t| seen.insert(t.clone()));
}

fn joined_len(terms: &[String]) -> usize {
    let chars: usize = terms.iter().map(String::len).sum();
    chars + terms.len().saturating_sub(1)
}

/// Drop trailing terms until the joined text fits in `cap`; a single
/// over-long term is cut at a character boundary.
fn truncate_terms(terms: &mut Vec<String>, cap: usize) {
    while terms.len() > 1 && joined_len(terms) > cap {
        terms.pop();
    }
    if let Some(only) = terms.first_mut()
        && only.len() > cap
    {
        let mut end = cap;
        while !only.is_char_boundary(end) {
            end -= 1;
        }
        only.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new("session-1")
    }

    fn enrich(text: &str) -> Vec<Query> {
        QueryEnricher::new().enrich(text, &ctx()).unwrap()
    }

    #[test]
    fn email_request_gains_recipient_and_synonyms() {
        let q = &enrich("Send an email to my team")[0];
        assert_eq!(&q.enriched_terms[..3], ["send", "email", "team"]);
        for t in ["recipient", "transmit", "message", "group"] {
            assert!(q.enriched_terms.iter().any(|x| x == t), "missing {t}");
        }
        assert!(!q.truncated);
        assert_eq!(q.session_id, "session-1");
        assert_eq!(q.raw_text, "Send an email to my team");
    }

    #[test]
    fn enriched_text_respects_target() {
        let q = &enrich("schedule a meeting on my calendar")[0];
        let len = q.text().len();
        assert!((MIN_QUERY_CHARS..=TARGET_QUERY_CHARS).contains(&len), "{len}");
    }

    #[test]
    fn launch_satellite_is_long_enough() {
        let q = &enrich("launch satellite")[0];
        assert!(q.text().len() >= MIN_QUERY_CHARS);
        assert!(q.enriched_terms.iter().any(|t| t == "start"));
    }

    #[test]
    fn greetings_and_empty_input_are_rejected() {
        let e = QueryEnricher::new();
        for text in ["", "   ", "hello!", "Good morning, thanks", "to the and of"] {
            assert!(
                matches!(e.enrich(text, &ctx()), Err(CairnError::Validation(_))),
                "{text:?}"
            );
        }
    }

    #[test]
    fn under_specified_query_is_rejected() {
        let err = QueryEnricher::new().enrich("satellite", &ctx()).unwrap_err();
        assert!(err.to_string().contains("under-specified"));
    }

    #[test]
    fn compound_request_yields_one_query_per_action() {
        let qs = enrich("Analyze this sales data and create a report");
        assert_eq!(qs.len(), 2);
        assert_eq!(&qs[0].enriched_terms[..3], ["analyze", "sale", "data"]);
        assert_eq!(&qs[1].enriched_terms[..2], ["create", "report"]);
    }

    #[test]
    fn clause_without_action_joins_previous() {
        let qs = enrich("send an email to Alice and Bob");
        assert_eq!(qs.len(), 1);
        assert!(qs[0].enriched_terms.iter().any(|t| t == "bob"));
    }

    #[test]
    fn leading_greeting_clause_is_dropped() {
        let qs = enrich("Hi there, can you check the weather tomorrow?");
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].enriched_terms[0], "check");
    }

    #[test]
    fn overlong_request_is_truncated() {
        let long: String = (0..60).map(|i| format!("widget{i} ")).collect();
        let q = &enrich(&format!("create {long}"))[0];
        assert!(q.truncated);
        assert!(q.text().len() <= MAX_QUERY_CHARS);
        assert_eq!(q.enriched_terms[0], "create");
    }

    #[test]
    fn enrichment_is_deterministic() {
        let a = enrich("upload a file and send an email");
        let b = enrich("upload a file and send an email");
        let terms = |qs: &[Query]| qs.iter().map(|q| q.enriched_terms.clone()).collect::<Vec<_>>();
        assert_eq!(terms(&a), terms(&b));
    }

    #[test]
    fn signature_ignores_order_and_duplicates() {
        let a = Query::from_terms("s", vec!["b".into(), "a".into(), "b".into()]);
        let b = Query::from_terms("s", vec!["a".into(), "b".into()]);
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature(), "a b");
    }

    #[test]
    fn custom_tables_extend_builtins() {
        let mut e = QueryEnricher::empty();
        e.add_action("Dock");
        e.add_synonyms("dock", &["berth", "moor", "park"]);
        e.add_related("spacecraft", &["orbiter", "capsule", "station"]);
        let q = &e.enrich("dock the spacecraft", &ctx()).unwrap()[0];
        assert_eq!(
            q.enriched_terms,
            vec!["dock", "spacecraft", "berth", "moor", "orbiter", "capsule", "station", "park"]
        );
    }
}
