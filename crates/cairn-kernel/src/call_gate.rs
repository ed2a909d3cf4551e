//! [`CallGate`] – guard clauses every tool call passes before dispatch.
//!
//! Rules the reasoning loop is expected to respect are enforced here
//! programmatically instead of being left to model compliance.  Every
//! registered [`CallRule`] is evaluated in order; the first violation returns
//! a [`CairnError::Validation`] and the call is **not** dispatched.
//!
//! Built-in rules:
//! - [`KnownToolRule`] – the tool name must be one the core serves.
//! - [`RequiredParamsRule`] – per-tool mandatory parameters must be present
//!   and carry the expected JSON type.
//! - [`SecretContentRule`] – memory writes must not persist credential-like
//!   material.
//!
//! # Example
//!
//! ```
//! use cairn_kernel::call_gate::{CallGate, KnownToolRule, ParamType, RequiredParamsRule};
//! use cairn_types::ToolCall;
//!
//! let mut gate = CallGate::new();
//! gate.add_rule(Box::new(KnownToolRule::new(["memory_view"])));
//! gate.add_rule(Box::new(
//!     RequiredParamsRule::new().require("memory_view", "path", ParamType::String),
//! ));
//!
//! assert!(gate.verify(&ToolCall::new("memory_view").arg("path", "/memories/")).is_ok());
//! assert!(gate.verify(&ToolCall::new("memory_view")).is_err());
//! assert!(gate.verify(&ToolCall::new("rm_rf")).is_err());
//! ```

use std::collections::{HashMap, HashSet};

use cairn_types::{CairnError, ToolCall};
use serde_json::Value;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single precondition a tool call must satisfy.
pub trait CallRule: Send + Sync {
    /// Human-readable name used in rejection messages.
    fn name(&self) -> &str;

    /// Return `Ok(())` when `call` satisfies the rule, or
    /// [`CairnError::Validation`] when it does not.
    fn check(&self, call: &ToolCall) -> Result<(), CairnError>;
}

// ────────────────────────────────────────────────────────────────────────────
// CallGate
// ────────────────────────────────────────────────────────────────────────────

/// Ordered rule engine applied to every incoming [`ToolCall`].
#[derive(Default)]
pub struct CallGate {
    rules: Vec<Box<dyn CallRule>>,
}

impl CallGate {
    /// Create a gate with no rules (every call passes).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule.  Rules run in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn CallRule>) {
        self.rules.push(rule);
    }

    /// Validate `call` against every rule, returning the first violation.
    pub fn verify(&self, call: &ToolCall) -> Result<(), CairnError> {
        for rule in &self.rules {
            rule.check(call)?;
        }
        Ok(())
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects calls to tools the core does not serve.
pub struct KnownToolRule {
    tools: HashSet<String>,
}

impl KnownToolRule {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }
}

impl CallRule for KnownToolRule {
    fn name(&self) -> &str {
        "known_tool"
    }

    fn check(&self, call: &ToolCall) -> Result<(), CairnError> {
        if self.tools.contains(&call.tool_name) {
            Ok(())
        } else {
            Err(CairnError::Validation(format!(
                "[{}] unknown tool {:?}",
                self.name(),
                call.tool_name
            )))
        }
    }
}

/// Expected JSON type of a required parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    /// A non-negative integer.
    Integer,
    Boolean,
    Any,
}

impl ParamType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Any => !value.is_null(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            ParamType::String => "a string",
            ParamType::Integer => "a non-negative integer",
            ParamType::Boolean => "a boolean",
            ParamType::Any => "a value",
        }
    }
}

/// Per-tool mandatory parameters and their types.
#[derive(Default)]
pub struct RequiredParamsRule {
    required: HashMap<String, Vec<(String, ParamType)>>,
}

impl RequiredParamsRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: `tool` requires `param` of type `ty`.
    pub fn require(mut self, tool: &str, param: &str, ty: ParamType) -> Self {
        self.required
            .entry(tool.to_string())
            .or_default()
            .push((param.to_string(), ty));
        self
    }
}

impl CallRule for RequiredParamsRule {
    fn name(&self) -> &str {
        "required_params"
    }

    fn check(&self, call: &ToolCall) -> Result<(), CairnError> {
        let Some(params) = self.required.get(&call.tool_name) else {
            return Ok(());
        };
        for (param, ty) in params {
            match call.parameters.get(param) {
                None | Some(Value::Null) => {
                    return Err(CairnError::Validation(format!(
                        "[{}] {} requires parameter {param:?}",
                        self.name(),
                        call.tool_name
                    )));
                }
                Some(v) if !ty.accepts(v) => {
                    return Err(CairnError::Validation(format!(
                        "[{}] parameter {param:?} of {} must be {}",
                        self.name(),
                        call.tool_name,
                        ty.label()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Refuses to persist credential-like strings through memory writes.
pub struct SecretContentRule {
    /// tool name → parameters whose string values are scanned.
    guarded: HashMap<String, Vec<String>>,
}

impl SecretContentRule {
    pub fn new() -> Self {
        Self {
            guarded: HashMap::new(),
        }
    }

    /// Builder: scan `param` of `tool`.
    pub fn guard(mut self, tool: &str, param: &str) -> Self {
        self.guarded
            .entry(tool.to_string())
            .or_default()
            .push(param.to_string());
        self
    }
}

impl Default for SecretContentRule {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRule for SecretContentRule {
    fn name(&self) -> &str {
        "secret_content"
    }

    fn check(&self, call: &ToolCall) -> Result<(), CairnError> {
        let Some(params) = self.guarded.get(&call.tool_name) else {
            return Ok(());
        };
        for param in params {
            if let Some(text) = call.parameters.get(param).and_then(Value::as_str)
                && let Some(kind) = detect_secret(text)
            {
                return Err(CairnError::Validation(format!(
                    "[{}] parameter {param:?} appears to contain a {kind}; \
                     secrets are not persisted to memory",
                    self.name()
                )));
            }
        }
        Ok(())
    }
}

/// Heuristic scan for well-known credential shapes.
pub fn detect_secret(text: &str) -> Option<&'static str> {
    if text.contains("-----BEGIN") && text.contains("PRIVATE KEY") {
        return Some("private key");
    }
    let is_key_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    for token in text.split(|c: char| c.is_whitespace() || "\"'`,;:=()[]{}<>".contains(c)) {
        if !token.chars().all(is_key_char) {
            continue;
        }
        if token.starts_with("sk-") && token.len() >= 23 {
            return Some("API key");
        }
        if (token.starts_with("ghp_") || token.starts_with("github_pat_")) && token.len() >= 24 {
            return Some("GitHub token");
        }
        if (token.starts_with("xoxb-") || token.starts_with("xoxp-")) && token.len() >= 20 {
            return Some("Slack token");
        }
        if token.len() == 20
            && token.starts_with("AKIA")
            && token.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Some("AWS access key");
        }
    }
    None
}
