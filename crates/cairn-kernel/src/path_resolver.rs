//! [`PathResolver`] – normalises and validates hierarchical memory keys.
//!
//! Every memory path lives under a configurable namespace prefix (default
//! `/memories`).  [`PathResolver::resolve`] turns caller input into a
//! [`ResolvedPath`]: a list of validated segments.  Relative input is joined
//! under the prefix, absolute input must already lie beneath it.
//!
//! The tree itself is kept flat: [`PathIndex`] maps each directory key to the
//! ordered set of its immediate children, so there are no parent pointers and
//! no way to build a cycle.
//!
//! # Example
//!
//! ```
//! use cairn_kernel::path_resolver::PathResolver;
//!
//! let resolver = PathResolver::new("/memories", 64).unwrap();
//!
//! let p = resolver.resolve("projects/x/plan.md").unwrap();
//! assert_eq!(p.key(), "/memories/projects/x/plan.md");
//!
//! assert!(resolver.resolve("/memories/../etc/passwd").is_err());
//! assert!(resolver.resolve("/memories/a//b").is_err());
//! ```

use std::collections::{BTreeSet, HashMap};

use cairn_types::CairnError;

/// Default namespace every memory path is rooted at.
pub const DEFAULT_PREFIX: &str = "/memories";

/// Default upper bound on the length of a single path segment, in bytes.
pub const DEFAULT_MAX_SEGMENT_LEN: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// ResolvedPath
// ─────────────────────────────────────────────────────────────────────────────

/// A validated, normalised memory path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedPath {
    segments: Vec<String>,
    /// `true` when the caller wrote a trailing slash (`/memories/projects/`).
    dir_hint: bool,
}

impl ResolvedPath {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Canonical string key, always absolute and without a trailing slash.
    pub fn key(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn is_dir_hint(&self) -> bool {
        self.dir_hint
    }

    /// Last segment, or `""` for the filesystem-style root `/`.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// The enclosing directory, or `None` for `/`.
    pub fn parent(&self) -> Option<ResolvedPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(ResolvedPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
            dir_hint: true,
        })
    }

    /// `true` if `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &ResolvedPath) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }
}

impl std::fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PathResolver
// ─────────────────────────────────────────────────────────────────────────────

/// Validates caller paths against the namespace prefix and segment rules.
#[derive(Debug, Clone)]
pub struct PathResolver {
    prefix: Vec<String>,
    max_segment_len: usize,
}

impl PathResolver {
    /// Build a resolver rooted at `prefix`.
    ///
    /// The prefix itself must be absolute and obey the same segment rules as
    /// any other path; `"/"` roots the namespace at the top level.
    pub fn new(prefix: &str, max_segment_len: usize) -> Result<Self, CairnError> {
        if max_segment_len == 0 {
            return Err(CairnError::Validation(
                "max segment length must be positive".into(),
            ));
        }
        let trimmed = prefix.trim();
        if !trimmed.starts_with('/') {
            return Err(CairnError::Validation(format!(
                "namespace prefix must be absolute: {prefix:?}"
            )));
        }
        let mut segments = Vec::new();
        for seg in trimmed.split('/').filter(|s| !s.is_empty()) {
            validate_segment(seg, max_segment_len)?;
            segments.push(seg.to_string());
        }
        Ok(Self {
            prefix: segments,
            max_segment_len,
        })
    }

    /// The namespace root as a resolved path.
    pub fn root(&self) -> ResolvedPath {
        ResolvedPath {
            segments: self.prefix.clone(),
            dir_hint: true,
        }
    }

    pub fn max_segment_len(&self) -> usize {
        self.max_segment_len
    }

    /// Normalise and validate `path`.
    ///
    /// # Errors
    ///
    /// [`CairnError::Validation`] for empty input, empty segments, `.`/`..`
    /// escapes, backslashes or control characters, over-long segments, and
    /// absolute paths outside the namespace prefix.
    pub fn resolve(&self, path: &str) -> Result<ResolvedPath, CairnError> {
        let raw = path.trim();
        if raw.is_empty() {
            return Err(CairnError::Validation("path is empty".into()));
        }
        let absolute = raw.starts_with('/');
        let dir_hint = raw.len() > 1 && raw.ends_with('/');

        let body = raw.trim_start_matches('/');
        let body = body.strip_suffix('/').unwrap_or(body);

        let mut given = Vec::new();
        if !body.is_empty() {
            for seg in body.split('/') {
                validate_segment(seg, self.max_segment_len)?;
                given.push(seg.to_string());
            }
        }

        let segments = if absolute {
            if !given.starts_with(&self.prefix) {
                return Err(CairnError::Validation(format!(
                    "path {raw:?} is outside the {} namespace",
                    self.root()
                )));
            }
            given
        } else {
            let mut joined = self.prefix.clone();
            joined.extend(given);
            joined
        };

        let is_root = segments.len() == self.prefix.len();
        Ok(ResolvedPath {
            segments,
            dir_hint: dir_hint || is_root,
        })
    }
}

fn validate_segment(seg: &str, max_len: usize) -> Result<(), CairnError> {
    if seg.is_empty() {
        return Err(CairnError::Validation("path contains an empty segment".into()));
    }
    if seg == "." || seg == ".." {
        return Err(CairnError::Validation(format!(
            "path segment {seg:?} is not allowed"
        )));
    }
    if seg.contains('\\') || seg.chars().any(char::is_control) {
        return Err(CairnError::Validation(format!(
            "path segment {seg:?} contains a forbidden character"
        )));
    }
    if seg.len() > max_len {
        return Err(CairnError::Validation(format!(
            "path segment exceeds {max_len} bytes"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// PathIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Parent → children index over canonical path keys.
///
/// A key present in the index is a directory; leaves only ever appear inside
/// their parent's child set.
#[derive(Debug, Clone)]
pub struct PathIndex {
    root: ResolvedPath,
    children: HashMap<String, BTreeSet<String>>,
}

impl PathIndex {
    /// An index holding only the (always present) root directory.
    pub fn new(root: ResolvedPath) -> Self {
        let mut children = HashMap::new();
        children.insert(root.key(), BTreeSet::new());
        Self { root, children }
    }

    pub fn root(&self) -> &ResolvedPath {
        &self.root
    }

    pub fn is_dir(&self, key: &str) -> bool {
        self.children.contains_key(key)
    }

    /// `true` if the directory `key` has at least one child.
    pub fn has_children(&self, key: &str) -> bool {
        self.children.get(key).is_some_and(|c| !c.is_empty())
    }

    /// Attach `path` under its parent, creating any missing ancestor
    /// directories.  Returns the directories that had to be created, outermost
    /// first.
    pub fn link(&mut self, path: &ResolvedPath, as_dir: bool) -> Vec<ResolvedPath> {
        if path == &self.root || !path.starts_with(&self.root) {
            return Vec::new();
        }
        let mut missing = Vec::new();
        let mut cursor = path.parent();
        while let Some(dir) = cursor {
            if self.children.contains_key(&dir.key()) {
                break;
            }
            cursor = dir.parent();
            missing.push(dir);
        }
        missing.reverse();
        for dir in &missing {
            self.attach(dir);
            self.children.insert(dir.key(), BTreeSet::new());
        }
        self.attach(path);
        if as_dir {
            self.children.entry(path.key()).or_default();
        }
        missing
    }

    /// Detach `key` from its parent and drop its own child set.  Descendants
    /// are the caller's responsibility (see [`descendants`][Self::descendants]).
    pub fn unlink(&mut self, path: &ResolvedPath) {
        let key = path.key();
        if let Some(parent) = path.parent()
            && let Some(set) = self.children.get_mut(&parent.key())
        {
            set.remove(&key);
        }
        if path != &self.root {
            self.children.remove(&key);
        }
    }

    /// Unlink `path` together with everything beneath it.  Returns the removed
    /// keys, deepest first, `path` itself last.
    pub fn remove_subtree(&mut self, path: &ResolvedPath) -> Vec<String> {
        let mut removed = self.descendants(&path.key());
        for key in &removed {
            self.children.remove(key);
        }
        self.unlink(path);
        removed.push(path.key());
        removed
    }

    /// Every key beneath `key`, depth-first, deepest entries first.
    pub fn descendants(&self, key: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(kids) = self.children.get(key) {
            for child in kids {
                out.extend(self.descendants(child));
                out.push(child.clone());
            }
        }
        out
    }

    /// Ordered immediate children of the directory at `path`.  Directory
    /// children carry a trailing slash.
    ///
    /// # Errors
    ///
    /// [`CairnError::NotFound`] if `path` is not a known directory.
    pub fn list_children(&self, path: &ResolvedPath) -> Result<Vec<String>, CairnError> {
        let kids = self
            .children
            .get(&path.key())
            .ok_or_else(|| CairnError::NotFound(format!("no directory at {path}")))?;
        Ok(kids
            .iter()
            .map(|k| {
                if self.children.contains_key(k) {
                    format!("{k}/")
                } else {
                    k.clone()
                }
            })
            .collect())
    }

    /// Drop everything except the root.
    pub fn clear(&mut self) {
        self.children.clear();
        self.children.insert(self.root.key(), BTreeSet::new());
    }

    fn attach(&mut self, path: &ResolvedPath) {
        if let Some(parent) = path.parent() {
            self.children
                .entry(parent.key())
                .or_default()
                .insert(path.key());
        }
    }
}
