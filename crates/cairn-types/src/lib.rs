//! `cairn-types` – shared vocabulary of the Cairn core.
//!
//! Everything that crosses a crate boundary lives here: the error taxonomy
//! every operation reports through, the [`ToolDescriptor`] catalog entry, the
//! [`ToolCall`] request contract and the [`Observation`] envelope returned for
//! every call.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A capability the discovery index can rank.
///
/// Descriptors are immutable once registered; changing one means removing it
/// and registering a replacement, which bumps the catalog generation twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name (e.g. `"email_sender"`).
    pub name: String,
    /// Free-text description of what the tool does.
    pub description: String,
    /// JSON Schema object describing the tool's parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Free-form classification tags (e.g. `["communication"]`).
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::Value::Null,
            tags: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Names of the properties declared in the parameter schema, if any.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// A tool invocation issued by the reasoning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    /// Name of the tool to invoke (e.g. `"memory_view"`).
    pub tool_name: String,
    /// Named arguments.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Outcome class of an [`Observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ObservationStatus {
    Success,
    Error,
    /// The call completed but the outcome is incomplete or empty (e.g. no
    /// tool matched a discovery query).
    Partial,
}

impl std::fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationStatus::Success => write!(f, "success"),
            ObservationStatus::Error => write!(f, "error"),
            ObservationStatus::Partial => write!(f, "partial"),
        }
    }
}

/// Uniform envelope wrapping the result of every tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Observation {
    pub tool_name: String,
    pub status: ObservationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Enriched query text (discovery calls only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    /// An envelope with the given status and no payload.
    pub fn new(tool_name: impl Into<String>, status: ObservationStatus) -> Self {
        Self {
            tool_name: tool_name.into(),
            status,
            output: None,
            error_message: None,
            error_kind: None,
            query: None,
            results_count: None,
            top_match: None,
            top_score: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ObservationStatus::Success
    }
}

/// Discriminant of [`CairnError`], stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AmbiguousMatch,
    SizeLimitExceeded,
    LockTimeout,
    ValidationError,
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::AmbiguousMatch => "AmbiguousMatch",
            ErrorKind::SizeLimitExceeded => "SizeLimitExceeded",
            ErrorKind::LockTimeout => "LockTimeout",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::InternalError => "InternalError",
        };
        f.write_str(s)
    }
}

/// Error taxonomy shared by the discovery index and the memory store.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CairnError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ambiguous match: {0}")]
    AmbiguousMatch(String),

    #[error("Size limit exceeded: {size} bytes > limit of {limit} bytes")]
    SizeLimitExceeded { size: usize, limit: usize },

    #[error("Lock timeout on {path} after {waited_ms} ms")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CairnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CairnError::NotFound(_) => ErrorKind::NotFound,
            CairnError::Conflict(_) => ErrorKind::Conflict,
            CairnError::AmbiguousMatch(_) => ErrorKind::AmbiguousMatch,
            CairnError::SizeLimitExceeded { .. } => ErrorKind::SizeLimitExceeded,
            CairnError::LockTimeout { .. } => ErrorKind::LockTimeout,
            CairnError::Validation(_) => ErrorKind::ValidationError,
            CairnError::Internal(_) => ErrorKind::InternalError,
        }
    }
}
