//! [`Dispatcher`] – the single entry point of the Cairn core.
//!
//! Every tool call issued by a reasoning loop flows through
//! [`Dispatcher::handle`]:
//!
//! 1. **Gatekeep** – the [`CallGate`] checks the tool name, the presence and
//!    JSON type of required parameters, and refuses credential-like content in
//!    memory writes.
//! 2. **Route** – `tools_retriever` goes to discovery (enrich → snapshot →
//!    cached BM25 search → merge), every `memory_*` tool to the
//!    [`MemoryStore`].
//! 3. **Format** – the outcome, success or failure, becomes exactly one
//!    [`Observation`].
//!
//! The catalog and the memory tree are built here and live as long as the
//! dispatcher.  The dispatcher is `Send + Sync`; share it behind an `Arc` to
//! serve several sessions from several threads.
//!
//! # Example
//!
//! ```rust
//! use cairn_runtime::dispatcher::{CoreConfig, Dispatcher};
//! use cairn_types::{ObservationStatus, ToolCall, ToolDescriptor};
//!
//! let core = Dispatcher::new(CoreConfig::default()).unwrap();
//! core.register_tool(ToolDescriptor::new(
//!     "email_sender",
//!     "send email message to a recipient",
//! ))
//! .unwrap();
//!
//! let obs = core.handle(
//!     "session-1",
//!     &ToolCall::new("tools_retriever").arg("query", "send an email to my team"),
//! );
//! assert_eq!(obs.status, ObservationStatus::Success);
//! assert_eq!(obs.top_match.as_deref(), Some("email_sender"));
//!
//! let obs = core.handle(
//!     "session-1",
//!     &ToolCall::new("memory_create_update")
//!         .arg("path", "/memories/notes/team.md")
//!         .arg("content", "team list: alice, bob"),
//! );
//! assert!(obs.is_success());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cairn_discovery::{
    Bm25Params, CacheConfig, CacheStats, DEFAULT_THRESHOLD, Query, QueryEnricher, RankedResults,
    ResultCache, RetrievalIndex, RetrievalResult, SessionContext, merge_results,
};
use cairn_kernel::{CallGate, KnownToolRule, ParamType, RequiredParamsRule, SecretContentRule};
use cairn_memory::{
    MemoryConfig, MemoryNode, MemoryStats, MemoryStore, MemoryView, NullBackend, SqliteBackend,
    StorageBackend, WriteMode,
};
use cairn_types::{CairnError, Observation, ToolCall, ToolDescriptor};
use schemars::schema::RootSchema;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::observation::{MatchedTool, ObservationFormatter};
use crate::retry_guard::{DEFAULT_REPEAT_THRESHOLD, RepeatQueryGuard};

// ─────────────────────────────────────────────────────────────────────────────
// Served tools
// ─────────────────────────────────────────────────────────────────────────────

pub const TOOLS_RETRIEVER: &str = "tools_retriever";
pub const MEMORY_VIEW: &str = "memory_view";
pub const MEMORY_CREATE_UPDATE: &str = "memory_create_update";
pub const MEMORY_INSERT: &str = "memory_insert";
pub const MEMORY_STR_REPLACE: &str = "memory_str_replace";
pub const MEMORY_DELETE: &str = "memory_delete";
pub const MEMORY_RENAME: &str = "memory_rename";
pub const MEMORY_CLEAR_ALL: &str = "memory_clear_all";

/// Every tool name [`Dispatcher::handle`] accepts.
pub const SERVED_TOOLS: [&str; 8] = [
    TOOLS_RETRIEVER,
    MEMORY_VIEW,
    MEMORY_CREATE_UPDATE,
    MEMORY_INSERT,
    MEMORY_STR_REPLACE,
    MEMORY_DELETE,
    MEMORY_RENAME,
    MEMORY_CLEAR_ALL,
];

/// Default number of tools returned by discovery.
pub const DEFAULT_TOP_K: usize = 5;

/// Handled calls between two [`Dispatcher::sweep`] passes.
pub const SWEEP_EVERY_CALLS: u64 = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`Dispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Root of the memory namespace.
    pub path_prefix: String,
    pub max_segment_len: usize,
    /// Maximum leaf size in bytes.
    pub chunk_limit: usize,
    /// Path-lock TTL; also the longest a writer waits for a lock.
    pub lock_ttl: Duration,
    pub create_on_append: bool,
    pub bm25: Bm25Params,
    /// Default relevance cut-off when a call does not pass `threshold`.
    pub threshold: f64,
    /// Default result count when a call does not pass `top_k`.
    pub top_k: usize,
    pub cache: CacheConfig,
    /// SQLite database backing the memory tree.
    /// If `None`, an in-memory store is used (data lost on exit).
    pub persistence_path: Option<String>,
    /// Accept credential-like content in memory writes.
    pub allow_secrets: bool,
    /// Identical fruitless queries before the caller is told to give up;
    /// `0` disables the guard.
    pub repeat_query_threshold: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let memory = MemoryConfig::default();
        Self {
            path_prefix: memory.path_prefix,
            max_segment_len: memory.max_segment_len,
            chunk_limit: memory.chunk_limit,
            lock_ttl: memory.lock_ttl,
            create_on_append: memory.create_on_append,
            bm25: Bm25Params::default(),
            threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            cache: CacheConfig::default(),
            persistence_path: None,
            allow_secrets: false,
            repeat_query_threshold: DEFAULT_REPEAT_THRESHOLD,
        }
    }
}

impl CoreConfig {
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            path_prefix: self.path_prefix.clone(),
            max_segment_len: self.max_segment_len,
            chunk_limit: self.chunk_limit,
            lock_ttl: self.lock_ttl,
            create_on_append: self.create_on_append,
        }
    }
}

/// Point-in-time report returned by [`Dispatcher::status`].
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub tools: usize,
    pub generation: u64,
    pub memory: MemoryStats,
    pub cache: CacheStats,
    pub backend: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Routes tool calls to discovery or memory and formats every outcome.
pub struct Dispatcher {
    config: CoreConfig,
    gate: CallGate,
    enricher: QueryEnricher,
    index: RetrievalIndex,
    cache: ResultCache<Vec<RetrievalResult>>,
    memory: MemoryStore,
    repeat_guard: RepeatQueryGuard,
    handled: AtomicU64,
}

impl Dispatcher {
    /// Build the catalog, the memory tree and the call gate.
    ///
    /// With a `persistence_path` the memory tree is replayed from the SQLite
    /// database at that path.
    pub fn new(config: CoreConfig) -> Result<Self, CairnError> {
        if config.top_k == 0 {
            return Err(CairnError::Validation("top_k must be at least 1".into()));
        }
        check_threshold(config.threshold)?;
        if config.lock_ttl.is_zero() {
            return Err(CairnError::Validation("lock_ttl must be greater than zero".into()));
        }

        let backend: Box<dyn StorageBackend> = match &config.persistence_path {
            Some(path) => Box::new(SqliteBackend::open(path)?),
            None => Box::new(NullBackend),
        };
        let memory = MemoryStore::open(config.memory_config(), backend)?;

        info!(
            prefix = %config.path_prefix,
            backend = memory.backend_name(),
            threshold = config.threshold,
            top_k = config.top_k,
            "cairn core initialised"
        );

        Ok(Self {
            gate: build_gate(config.allow_secrets),
            enricher: QueryEnricher::new(),
            index: RetrievalIndex::new(config.bm25),
            cache: ResultCache::new(config.cache.clone()),
            memory,
            repeat_guard: RepeatQueryGuard::new(config.repeat_query_threshold)
                .with_max_sessions(config.cache.max_sessions),
            handled: AtomicU64::new(0),
            config,
        })
    }

    /// Replace the built-in enrichment tables.
    pub fn with_enricher(mut self, enricher: QueryEnricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn index(&self) -> &RetrievalIndex {
        &self.index
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    // ── Tool calls ──────────────────────────────────────────────────────────

    /// Gate, execute and format one tool call on behalf of `session_id`.
    #[instrument(skip(self, call), fields(tool = %call.tool_name))]
    pub fn handle(&self, session_id: &str, call: &ToolCall) -> Observation {
        if (self.handled.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY_CALLS == 0 {
            self.sweep();
        }
        if let Err(e) = self.gate.verify(call) {
            warn!(session_id, error = %e, "tool call rejected");
            return ObservationFormatter::error(&call.tool_name, &e);
        }

        let obs = if call.tool_name == TOOLS_RETRIEVER {
            self.discover(session_id, call)
                .unwrap_or_else(|e| ObservationFormatter::error(TOOLS_RETRIEVER, &e))
        } else {
            ObservationFormatter::format(&call.tool_name, self.memory_call(call))
        };

        if let Some(kind) = obs.error_kind {
            debug!(session_id, %kind, "tool call failed");
        } else {
            debug!(session_id, status = %obs.status, "tool call handled");
        }
        obs
    }

    /// Handle a batch in order.  Calls are independent: a failure does not
    /// stop the following ones.
    pub fn handle_all(&self, session_id: &str, calls: &[ToolCall]) -> Vec<Observation> {
        calls.iter().map(|c| self.handle(session_id, c)).collect()
    }

    // ── Catalog ─────────────────────────────────────────────────────────────

    /// Register a tool.  Returns the new catalog generation.
    pub fn register_tool(&self, desc: ToolDescriptor) -> Result<u64, CairnError> {
        self.index.add_descriptor(desc)
    }

    /// Remove a tool.  Returns the new catalog generation.
    pub fn remove_tool(&self, name: &str) -> Result<u64, CairnError> {
        self.index.remove_descriptor(name)
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Drop the cached results and repeat history of `session_id`.
    pub fn end_session(&self, session_id: &str) {
        let had_cache = self.cache.invalidate(session_id);
        self.repeat_guard.reset(session_id);
        debug!(session_id, had_cache, "session ended");
    }

    /// Reclaim state left behind by abandoned sessions and writers: expired
    /// cached results and path locks held past their TTL.  Runs on its own
    /// every [`SWEEP_EVERY_CALLS`] calls.  Returns how many items went.
    pub fn sweep(&self) -> usize {
        let entries = self.cache.purge_expired();
        let locks = self.memory.locks().reap_expired();
        if entries + locks > 0 {
            info!(entries, locks, "swept expired state");
        }
        entries + locks
    }

    pub fn status(&self) -> CoreStatus {
        let (tools, generation) = {
            let snapshot = self.index.snapshot();
            (snapshot.len(), snapshot.generation())
        };
        CoreStatus {
            tools,
            generation,
            memory: self.memory.stats(),
            cache: self.cache.stats(),
            backend: self.memory.backend_name().to_string(),
        }
    }

    // ── Schemas ─────────────────────────────────────────────────────────────

    /// JSON Schema of the [`ToolCall`] request envelope.
    pub fn tool_call_schema() -> RootSchema {
        schemars::schema_for!(ToolCall)
    }

    /// Descriptors of the tools this core serves, with parameter schemas,
    /// ready to be shown to a reasoning loop.
    pub fn served_tools() -> Vec<ToolDescriptor> {
        fn string(description: &str) -> Value {
            json!({ "type": "string", "description": description })
        }
        fn schema(properties: Value, required: &[&str]) -> Value {
            json!({ "type": "object", "properties": properties, "required": required })
        }

        vec![
            ToolDescriptor::new(
                TOOLS_RETRIEVER,
                "Find the tools able to perform a request. Describe the action and its object.",
            )
            .with_parameters(schema(
                json!({
                    "query": string("What needs to be done, in plain words"),
                    "top_k": { "type": "integer", "minimum": 1 },
                    "threshold": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                }),
                &["query"],
            )),
            ToolDescriptor::new(MEMORY_VIEW, "Read a memory file or list a memory directory.")
                .with_parameters(schema(json!({ "path": string("Absolute memory path") }), &["path"])),
            ToolDescriptor::new(
                MEMORY_CREATE_UPDATE,
                "Create, overwrite or append to a memory file.",
            )
            .with_parameters(schema(
                json!({
                    "path": string("Absolute memory path"),
                    "content": string("File content"),
                    "mode": { "type": "string", "enum": ["create", "overwrite", "append"] }
                }),
                &["path", "content"],
            )),
            ToolDescriptor::new(MEMORY_INSERT, "Insert a line into a memory file.").with_parameters(
                schema(
                    json!({
                        "path": string("Absolute memory path"),
                        "line_number": { "type": "integer", "minimum": 0 },
                        "content": string("Line to insert")
                    }),
                    &["path", "line_number", "content"],
                ),
            ),
            ToolDescriptor::new(
                MEMORY_STR_REPLACE,
                "Replace the single occurrence of a string in a memory file.",
            )
            .with_parameters(schema(
                json!({
                    "path": string("Absolute memory path"),
                    "find": string("Exact text to replace; must occur once"),
                    "replace": string("Replacement text")
                }),
                &["path", "find", "replace"],
            )),
            ToolDescriptor::new(MEMORY_DELETE, "Delete a memory file or directory.").with_parameters(
                schema(
                    json!({
                        "path": string("Absolute memory path"),
                        "recursive": { "type": "boolean" }
                    }),
                    &["path"],
                ),
            ),
            ToolDescriptor::new(MEMORY_RENAME, "Move a memory file to a new path.").with_parameters(
                schema(
                    json!({
                        "old_path": string("Current path"),
                        "new_path": string("Target path; must not exist")
                    }),
                    &["old_path", "new_path"],
                ),
            ),
            ToolDescriptor::new(MEMORY_CLEAR_ALL, "Delete every memory.")
                .with_parameters(schema(json!({}), &[])),
        ]
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    fn discover(&self, session_id: &str, call: &ToolCall) -> Result<Observation, CairnError> {
        let raw = str_param(call, "query")?;
        let top_k = match u64_param(call, "top_k")? {
            Some(k) => usize::try_from(k)
                .map_err(|_| CairnError::Validation(format!("top_k {k} is out of range")))?,
            None => self.config.top_k,
        };
        if top_k == 0 {
            return Err(CairnError::Validation("top_k must be at least 1".into()));
        }
        let threshold = f64_param(call, "threshold")?.unwrap_or(self.config.threshold);
        check_threshold(threshold)?;

        let queries = self.enricher.enrich(raw, &SessionContext::new(session_id))?;

        // Every query of the request is ranked against one generation.
        let snapshot = self.index.snapshot();
        let generation = snapshot.generation();
        let rankings = queries
            .iter()
            .map(|query| {
                let key = format!("{}|k={top_k}|t={threshold}", query.signature());
                self.cache
                    .get_or_compute(session_id, &key, generation, || {
                        Ok::<_, CairnError>(snapshot.search(query, top_k, threshold).collect())
                    })
                    .map(|results| results.into_iter().collect::<RankedResults>())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let matches: Vec<MatchedTool> = merge_results(rankings, top_k)
            .filter_map(|r| {
                let desc = snapshot.descriptor(&r.tool_name)?;
                Some(MatchedTool {
                    name: r.tool_name,
                    score: r.score,
                    matched_terms: r.matched_terms,
                    description: desc.description.clone(),
                    parameters: desc.parameters.clone(),
                })
            })
            .collect();
        drop(snapshot);

        let signature = join(&queries, Query::signature);
        let stuck = self
            .repeat_guard
            .record(session_id, &signature, !matches.is_empty());
        if stuck {
            warn!(session_id, query = %signature, "repeated fruitless discovery query");
        }

        info!(
            session_id,
            generation,
            queries = queries.len(),
            results = matches.len(),
            top = matches.first().map(|m| m.name.as_str()).unwrap_or("-"),
            "discovery served"
        );
        Ok(ObservationFormatter::discovery(
            &join(&queries, Query::text),
            matches,
            stuck,
            queries.iter().any(|q| q.truncated),
        ))
    }

    // ── Memory ──────────────────────────────────────────────────────────────

    fn memory_call(&self, call: &ToolCall) -> Result<Value, CairnError> {
        let memory = &self.memory;
        match call.tool_name.as_str() {
            MEMORY_VIEW => Ok(view_json(memory.view(str_param(call, "path")?)?)),
            MEMORY_CREATE_UPDATE => {
                let mode = match opt_str_param(call, "mode")? {
                    Some(mode) => mode.parse::<WriteMode>()?,
                    None => WriteMode::default(),
                };
                let node = memory.create_update(
                    str_param(call, "path")?,
                    str_param(call, "content")?,
                    mode,
                )?;
                Ok(write_json(&node))
            }
            MEMORY_INSERT => {
                let line = u64_param(call, "line_number")?
                    .ok_or_else(|| missing(call, "line_number"))?;
                // Lines past the end append, so saturating is lossless.
                let line = usize::try_from(line).unwrap_or(usize::MAX);
                let node = memory.insert(
                    str_param(call, "path")?,
                    line,
                    str_param(call, "content")?,
                )?;
                Ok(write_json(&node))
            }
            MEMORY_STR_REPLACE => {
                let node = memory.str_replace(
                    str_param(call, "path")?,
                    str_param(call, "find")?,
                    str_param(call, "replace")?,
                )?;
                Ok(write_json(&node))
            }
            MEMORY_DELETE => {
                let path = str_param(call, "path")?;
                let recursive = bool_param(call, "recursive")?.unwrap_or(false);
                let removed = memory.delete(path, recursive)?;
                Ok(json!({ "path": memory.resolver().resolve(path)?.key(), "removed": removed }))
            }
            MEMORY_RENAME => {
                let old_path = str_param(call, "old_path")?;
                let node = memory.rename(old_path, str_param(call, "new_path")?)?;
                Ok(json!({
                    "old_path": memory.resolver().resolve(old_path)?.key(),
                    "new_path": node.path,
                    "version": node.version,
                }))
            }
            MEMORY_CLEAR_ALL => Ok(json!({ "removed_leaves": memory.clear_all()? })),
            other => Err(CairnError::Validation(format!("unknown tool {other:?}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_gate(allow_secrets: bool) -> CallGate {
    let mut gate = CallGate::new();
    gate.add_rule(Box::new(KnownToolRule::new(SERVED_TOOLS)));
    gate.add_rule(Box::new(
        RequiredParamsRule::new()
            .require(TOOLS_RETRIEVER, "query", ParamType::String)
            .require(MEMORY_VIEW, "path", ParamType::String)
            .require(MEMORY_CREATE_UPDATE, "path", ParamType::String)
            .require(MEMORY_CREATE_UPDATE, "content", ParamType::String)
            .require(MEMORY_INSERT, "path", ParamType::String)
            .require(MEMORY_INSERT, "line_number", ParamType::Integer)
            .require(MEMORY_INSERT, "content", ParamType::String)
            .require(MEMORY_STR_REPLACE, "path", ParamType::String)
            .require(MEMORY_STR_REPLACE, "find", ParamType::String)
            .require(MEMORY_STR_REPLACE, "replace", ParamType::String)
            .require(MEMORY_DELETE, "path", ParamType::String)
            .require(MEMORY_RENAME, "old_path", ParamType::String)
            .require(MEMORY_RENAME, "new_path", ParamType::String),
    ));
    if !allow_secrets {
        gate.add_rule(Box::new(
            SecretContentRule::new()
                .guard(MEMORY_CREATE_UPDATE, "content")
                .guard(MEMORY_INSERT, "content")
                .guard(MEMORY_STR_REPLACE, "replace"),
        ));
    }
    gate
}

fn check_threshold(threshold: f64) -> Result<(), CairnError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(CairnError::Validation(format!(
            "threshold {threshold} must lie in [0, 1]"
        )))
    }
}

fn join(queries: &[Query], f: impl Fn(&Query) -> String) -> String {
    queries.iter().map(f).collect::<Vec<_>>().join(" | ")
}

fn missing(call: &ToolCall, name: &str) -> CairnError {
    CairnError::Validation(format!("{} requires parameter {name:?}", call.tool_name))
}

fn wrong_type(call: &ToolCall, name: &str, expected: &str) -> CairnError {
    CairnError::Validation(format!(
        "parameter {name:?} of {} must be {expected}",
        call.tool_name
    ))
}

fn str_param<'a>(call: &'a ToolCall, name: &str) -> Result<&'a str, CairnError> {
    opt_str_param(call, name)?.ok_or_else(|| missing(call, name))
}

fn opt_str_param<'a>(call: &'a ToolCall, name: &str) -> Result<Option<&'a str>, CairnError> {
    match call.parameters.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(wrong_type(call, name, "a string")),
    }
}

fn u64_param(call: &ToolCall, name: &str) -> Result<Option<u64>, CairnError> {
    match call.parameters.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| wrong_type(call, name, "a non-negative integer")),
    }
}

fn f64_param(call: &ToolCall, name: &str) -> Result<Option<f64>, CairnError> {
    match call.parameters.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| wrong_type(call, name, "a number")),
    }
}

fn bool_param(call: &ToolCall, name: &str) -> Result<Option<bool>, CairnError> {
    match call.parameters.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(wrong_type(call, name, "a boolean")),
    }
}

fn view_json(view: MemoryView) -> Value {
    match view {
        MemoryView::File(node) => json!({
            "path": node.path,
            "kind": node.kind.as_str(),
            "content": node.content,
            "version": node.version,
            "size": node.size,
            "last_modified": node.last_modified.to_rfc3339(),
        }),
        MemoryView::Directory { path, children } => json!({
            "path": path,
            "kind": "directory",
            "children": children,
        }),
    }
}

fn write_json(node: &MemoryNode) -> Value {
    json!({
        "path": node.path,
        "version": node.version,
        "size": node.size,
        "last_modified": node.last_modified.to_rfc3339(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
