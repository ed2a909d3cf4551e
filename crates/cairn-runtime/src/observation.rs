//! [`ObservationFormatter`] – turns operation outcomes into [`Observation`]s.
//!
//! Every tool call, successful or not, produces exactly one envelope.  Errors
//! carry their [`ErrorKind`][cairn_types::ErrorKind] and message; discovery
//! calls additionally report the enriched query and a summary of the best
//! match.  An empty discovery result is `partial`, never an error.
//!
//! [`render_block`] lays a batch of observations out in the transcript format
//! the reasoning loop reads back:
//!
//! ```text
//! OBSERVATION RESULT FROM TOOL CALLS
//! <observations>
//!   <observation>
//!     <tool_name>memory_view</tool_name>
//!     <status>success</status>
//!     ...
//!   </observation>
//! </observations>
//! END OF OBSERVATIONS
//! ```

use cairn_types::{CairnError, Observation, ObservationStatus};
use serde::Serialize;
use serde_json::{Value, json};

pub const BLOCK_HEADER: &str = "OBSERVATION RESULT FROM TOOL CALLS";
pub const BLOCK_FOOTER: &str = "END OF OBSERVATIONS";

const RETRY_SUGGESTION: &str = "No tool matched this request. Retry once with broader or \
     alternative terms describing the action and the object it acts on.";

const GIVE_UP_SUGGESTION: &str = "The same request has found nothing several times in a row. \
     Change the terminology substantially, or conclude that no available tool provides \
     this capability.";

/// A ranked tool as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedTool {
    pub name: String,
    pub score: f64,
    pub matched_terms: Vec<String>,
    pub description: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

/// Builders for [`Observation`] envelopes.
pub struct ObservationFormatter;

impl ObservationFormatter {
    pub fn success(tool_name: &str, output: Value) -> Observation {
        Observation {
            output: Some(output),
            ..Observation::new(tool_name, ObservationStatus::Success)
        }
    }

    pub fn partial(tool_name: &str, output: Value) -> Observation {
        Observation {
            output: Some(output),
            ..Observation::new(tool_name, ObservationStatus::Partial)
        }
    }

    pub fn error(tool_name: &str, err: &CairnError) -> Observation {
        Observation {
            error_message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Observation::new(tool_name, ObservationStatus::Error)
        }
    }

    /// Wrap the outcome of a non-discovery operation.
    ///
    /// ```
    /// use cairn_runtime::observation::ObservationFormatter;
    /// use cairn_types::{CairnError, ErrorKind, ObservationStatus};
    ///
    /// let obs = ObservationFormatter::format(
    ///     "memory_delete",
    ///     Err(CairnError::NotFound("/memories/nope".into())),
    /// );
    /// assert_eq!(obs.status, ObservationStatus::Error);
    /// assert_eq!(obs.error_kind, Some(ErrorKind::NotFound));
    /// ```
    pub fn format(tool_name: &str, outcome: Result<Value, CairnError>) -> Observation {
        match outcome {
            Ok(output) => Self::success(tool_name, output),
            Err(e) => Self::error(tool_name, &e),
        }
    }

    /// Envelope for a `tools_retriever` call.
    ///
    /// `stuck` switches the empty-result suggestion to the give-up wording;
    /// `truncated` is echoed in the output when the enriched text was cut.
    pub fn discovery(
        query_text: &str,
        matches: Vec<MatchedTool>,
        stuck: bool,
        truncated: bool,
    ) -> Observation {
        let results_count = matches.len();
        let top = matches.first().map(|m| (m.name.clone(), m.score));

        let mut output = json!({ "matched_tools": matches });
        if truncated {
            output["query_truncated"] = Value::Bool(true);
        }

        let status = if results_count == 0 {
            let suggestion = if stuck {
                GIVE_UP_SUGGESTION
            } else {
                RETRY_SUGGESTION
            };
            output["suggestion"] = Value::String(suggestion.to_string());
            ObservationStatus::Partial
        } else {
            ObservationStatus::Success
        };

        Observation {
            output: Some(output),
            query: Some(query_text.to_string()),
            results_count: Some(results_count),
            top_match: top.as_ref().map(|(name, _)| name.clone()),
            top_score: top.map(|(_, score)| score),
            ..Observation::new("tools_retriever", status)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcript rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Render `observations` as one marker-delimited, XML-escaped block.
pub fn render_block(observations: &[Observation]) -> String {
    let mut out = String::new();
    out.push_str(BLOCK_HEADER);
    out.push_str("\n<observations>\n");
    for obs in observations {
        out.push_str("  <observation>\n");
        element(&mut out, "tool_name", &obs.tool_name);
        if let Some(query) = &obs.query {
            element(&mut out, "query", query);
        }
        element(&mut out, "status", &obs.status.to_string());
        if let Some(count) = obs.results_count {
            element(&mut out, "results_count", &count.to_string());
        }
        if let Some(top) = &obs.top_match {
            element(&mut out, "top_match", top);
        }
        if let Some(score) = obs.top_score {
            element(&mut out, "top_score", &format!("{score:.4}"));
        }
        if let Some(output) = &obs.output {
            element(&mut out, "output", &output.to_string());
        }
        if let Some(kind) = obs.error_kind {
            element(&mut out, "error_kind", &kind.to_string());
        }
        if let Some(message) = &obs.error_message {
            element(&mut out, "error_message", message);
        }
        out.push_str("  </observation>\n");
    }
    out.push_str("</observations>\n");
    out.push_str(BLOCK_FOOTER);
    out
}

fn element(out: &mut String, name: &str, text: &str) {
    out.push_str("    <");
    out.push_str(name);
    out.push('>');
    out.push_str(&escape(text));
    out.push_str("</");
    out.push_str(name);
    out.push_str(">\n");
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
