//! Value types held by the memory tree.

use std::str::FromStr;

use cairn_types::CairnError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a node carries content or only children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Leaf,
    Directory,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Leaf => "leaf",
            NodeKind::Directory => "directory",
        }
    }
}

impl FromStr for NodeKind {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leaf" => Ok(NodeKind::Leaf),
            "directory" => Ok(NodeKind::Directory),
            other => Err(CairnError::Internal(format!("unknown node kind {other:?}"))),
        }
    }
}

/// One entry of the memory tree.
///
/// `version` starts at 1 and grows by exactly one per committed mutation of
/// the leaf.  Directory nodes are created implicitly and never re-versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
    /// Canonical absolute key (e.g. `/memories/projects/plan.md`).
    pub path: String,
    pub content: String,
    pub version: u64,
    /// Content length in bytes.
    pub size: usize,
    pub last_modified: DateTime<Utc>,
    pub kind: NodeKind,
}

impl MemoryNode {
    pub fn leaf(path: impl Into<String>, content: String, version: u64) -> Self {
        Self {
            path: path.into(),
            size: content.len(),
            content,
            version,
            last_modified: Utc::now(),
            kind: NodeKind::Leaf,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: String::new(),
            version: 1,
            size: 0,
            last_modified: Utc::now(),
            kind: NodeKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// How [`create_update`][crate::MemoryStore::create_update] treats an
/// existing leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Fail with `Conflict` if the leaf exists.
    Create,
    /// Replace the content, creating the leaf if needed.
    #[default]
    Overwrite,
    /// Concatenate to the existing content.
    Append,
}

impl FromStr for WriteMode {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(WriteMode::Create),
            "overwrite" => Ok(WriteMode::Overwrite),
            "append" => Ok(WriteMode::Append),
            other => Err(CairnError::Validation(format!(
                "unknown write mode {other:?} (expected create, overwrite or append)"
            ))),
        }
    }
}

/// Result of viewing a path.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryView {
    File(MemoryNode),
    Directory { path: String, children: Vec<String> },
}

/// Point-in-time counters over the whole tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub leaves: usize,
    /// Directories including the namespace root.
    pub directories: usize,
    pub total_bytes: usize,
}
