//! Tool catalog files.
//!
//! A catalog is a TOML document of `[[tools]]` tables:
//!
//! ```toml
//! [[tools]]
//! name = "email_sender"
//! description = "Send an email message to a recipient"
//! tags = ["communication"]
//!
//! [tools.parameters.recipient]
//! type = "string"
//! description = "Address of the recipient"
//! ```
//!
//! Parameters become a JSON Schema object on the registered
//! [`ToolDescriptor`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use cairn_runtime::Dispatcher;
use cairn_types::ToolDescriptor;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::warn;

/// Catalog served when no `catalog_path` is configured.
const BUILTIN_CATALOG: &str = r#"
[[tools]]
name = "email_sender"
description = "Send an email message to a recipient"
tags = ["communication"]
[tools.parameters.recipient]
description = "Address of the recipient"
[tools.parameters.subject]
description = "Subject line"
[tools.parameters.body]
description = "Message body"

[[tools]]
name = "calendar_event_creator"
description = "Create a calendar event or meeting with date, time and participants"
tags = ["productivity"]
[tools.parameters.title]
[tools.parameters.date]
[tools.parameters.participants]
type = "array"

[[tools]]
name = "weather_lookup"
description = "Get the current weather forecast for a location"
tags = ["information"]
[tools.parameters.location]
[tools.parameters.date]

[[tools]]
name = "file_uploader"
description = "Upload a file or document to cloud storage"
tags = ["storage"]
[tools.parameters.filename]
[tools.parameters.destination]

[[tools]]
name = "report_generator"
description = "Generate a report document from data, exported as pdf or another format"
tags = ["analytics"]
[tools.parameters.title]
[tools.parameters.format]

[[tools]]
name = "data_analyzer"
description = "Analyze a dataset and compute summary statistics and metrics"
tags = ["analytics"]
[tools.parameters.dataset]
"#;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tools: Vec<ToolEntry>,
}

#[derive(Debug, Deserialize)]
struct ToolEntry {
    name: String,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    parameters: BTreeMap<String, ParamEntry>,
}

#[derive(Debug, Deserialize)]
struct ParamEntry {
    #[serde(default = "default_param_type", rename = "type")]
    kind: String,
    #[serde(default)]
    description: Option<String>,
}

fn default_param_type() -> String {
    "string".to_string()
}

impl ToolEntry {
    fn into_descriptor(self) -> ToolDescriptor {
        let parameters = if self.parameters.is_empty() {
            Value::Null
        } else {
            let properties: Map<String, Value> = self
                .parameters
                .into_iter()
                .map(|(name, p)| {
                    let mut schema = json!({ "type": p.kind });
                    if let Some(description) = p.description {
                        schema["description"] = Value::String(description);
                    }
                    (name, schema)
                })
                .collect();
            json!({ "type": "object", "properties": properties })
        };
        ToolDescriptor::new(self.name, self.description)
            .with_tags(self.tags)
            .with_parameters(parameters)
    }
}

/// Parse catalog text into descriptors, in file order.
pub fn parse(raw: &str) -> Result<Vec<ToolDescriptor>, String> {
    let file: CatalogFile =
        toml::from_str(raw).map_err(|e| format!("Failed to parse catalog: {}", e))?;
    Ok(file
        .tools
        .into_iter()
        .map(ToolEntry::into_descriptor)
        .collect())
}

pub fn load_file(path: &Path) -> Result<Vec<ToolDescriptor>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read catalog at {}: {}", path.display(), e))?;
    parse(&raw)
}

pub fn builtin() -> Vec<ToolDescriptor> {
    // The embedded catalog is covered by `builtin_catalog_parses`.
    parse(BUILTIN_CATALOG).unwrap_or_default()
}

/// Register `tools` with `core`.  Rejected entries are logged and skipped;
/// returns how many were registered.
pub fn register_all(core: &Dispatcher, tools: Vec<ToolDescriptor>) -> usize {
    let mut registered = 0;
    for tool in tools {
        let name = tool.name.clone();
        match core.register_tool(tool) {
            Ok(_) => registered += 1,
            Err(e) => warn!(tool = %name, error = %e, "catalog entry skipped"),
        }
    }
    registered
}
