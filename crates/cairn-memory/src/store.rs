//! [`MemoryStore`] – versioned CRUD over the path-addressable memory tree.
//!
//! The tree is a flat map from canonical key to [`MemoryNode`] plus a
//! [`PathIndex`] of parent → children links.  Readers take the tree's read
//! lock for the duration of a lookup and always observe fully committed
//! nodes.  Every mutation:
//!
//! 1. resolves and validates the path,
//! 2. acquires the path's exclusive lock from the [`LockManager`],
//! 3. enters the namespace section, shared for leaf changes under existing
//!    directories and exclusive for anything that creates or removes a
//!    directory,
//! 4. plans the new nodes from a short read of the tree,
//! 5. hands the batch to the [`StorageBackend`] with no tree lock held,
//! 6. publishes the nodes in a brief write section.
//!
//! Mutations of disjoint leaves therefore commit in parallel, and readers
//! never wait on backend I/O.  Any failure before step 6 leaves the tree
//! exactly as it was.
//!
//! # Example
//!
//! ```rust
//! use cairn_memory::{MemoryConfig, MemoryStore, MemoryView, WriteMode};
//!
//! let store = MemoryStore::in_memory(MemoryConfig::default()).unwrap();
//!
//! store.create_update("notes/todo.md", "buy milk", WriteMode::Create).unwrap();
//! let node = store.create_update("notes/todo.md", "\nwalk dog", WriteMode::Append).unwrap();
//! assert_eq!(node.version, 2);
//!
//! match store.view("/memories/notes/").unwrap() {
//!     MemoryView::Directory { children, .. } => {
//!         assert_eq!(children, vec!["/memories/notes/todo.md"]);
//!     }
//!     MemoryView::File(_) => unreachable!(),
//! }
//! ```

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use cairn_kernel::{LockGuard, LockManager, PathIndex, PathResolver, ResolvedPath};
use cairn_kernel::path_resolver::{DEFAULT_MAX_SEGMENT_LEN, DEFAULT_PREFIX};
use cairn_types::CairnError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendOp, NullBackend, StorageBackend};
use crate::node::{MemoryNode, MemoryStats, MemoryView, NodeKind, WriteMode};

/// Default upper bound on a leaf's content, in bytes.
pub const DEFAULT_CHUNK_LIMIT: usize = 64 * 1024;

/// Default lock TTL, which also bounds how long a writer waits.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub path_prefix: String,
    pub max_segment_len: usize,
    /// Maximum leaf content size in bytes; larger writes are rejected.
    pub chunk_limit: usize,
    pub lock_ttl: Duration,
    /// Let `append` create a missing leaf instead of failing with `NotFound`.
    pub create_on_append: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path_prefix: DEFAULT_PREFIX.to_string(),
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            chunk_limit: DEFAULT_CHUNK_LIMIT,
            lock_ttl: DEFAULT_LOCK_TTL,
            create_on_append: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tree
// ─────────────────────────────────────────────────────────────────────────────

struct MemoryTree {
    nodes: HashMap<String, MemoryNode>,
    index: PathIndex,
}

impl MemoryTree {
    fn new(root: ResolvedPath) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(root.key(), MemoryNode::directory(root.key()));
        Self {
            nodes,
            index: PathIndex::new(root),
        }
    }

    /// Ancestor directories of `path` that do not exist yet, outermost first.
    ///
    /// Fails with `Conflict` when an ancestor is a leaf.
    fn missing_dirs(&self, path: &ResolvedPath) -> Result<Vec<MemoryNode>, CairnError> {
        let mut missing = Vec::new();
        let mut cursor = path.parent();
        while let Some(dir) = cursor {
            let key = dir.key();
            if let Some(node) = self.nodes.get(&key) {
                if !node.is_dir() {
                    return Err(CairnError::Conflict(format!(
                        "{key} is a file, cannot create {path} beneath it"
                    )));
                }
                break;
            }
            if !dir.starts_with(self.index.root()) {
                break;
            }
            missing.push(MemoryNode::directory(key));
            cursor = dir.parent();
        }
        missing.reverse();
        Ok(missing)
    }

    /// Link and store `node` together with its new ancestor directories.
    /// Directories that already exist are left as they are.
    fn publish(&mut self, path: &ResolvedPath, dirs: Vec<MemoryNode>, node: MemoryNode) {
        self.index.link(path, node.is_dir());
        for dir in dirs {
            self.nodes.entry(dir.path.clone()).or_insert(dir);
        }
        self.nodes.insert(node.path.clone(), node);
    }

    fn clear(&mut self) {
        let root = self.index.root().clone();
        self.index.clear();
        self.nodes.clear();
        self.nodes.insert(root.key(), MemoryNode::directory(root.key()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// Hierarchical, versioned memory shared by every session of the process.
pub struct MemoryStore {
    config: MemoryConfig,
    resolver: PathResolver,
    locks: LockManager,
    /// Shared by leaf mutations, exclusive for directory creation/removal.
    namespace: RwLock<()>,
    tree: RwLock<MemoryTree>,
    backend: Box<dyn StorageBackend>,
}

/// Hold on the namespace section for the length of one mutation.
enum NamespaceGuard<'a> {
    Shared { _guard: RwLockReadGuard<'a, ()> },
    Exclusive { _guard: RwLockWriteGuard<'a, ()> },
}

impl MemoryStore {
    /// A store that lives only as long as the process.
    pub fn in_memory(config: MemoryConfig) -> Result<Self, CairnError> {
        Self::open(config, Box::new(NullBackend))
    }

    /// Build a store over `backend`, replaying every node it persisted.
    ///
    /// Persisted nodes outside the configured namespace, or whose path no
    /// longer validates, are skipped with a warning.
    ///
    /// # Errors
    ///
    /// `ValidationError` for an invalid prefix or a zero lock TTL (every
    /// lock would expire before its commit).
    pub fn open(config: MemoryConfig, backend: Box<dyn StorageBackend>) -> Result<Self, CairnError> {
        if config.lock_ttl.is_zero() {
            return Err(CairnError::Validation("lock TTL must be greater than zero".into()));
        }
        let resolver = PathResolver::new(&config.path_prefix, config.max_segment_len)?;
        let root = resolver.root();
        let mut tree = MemoryTree::new(root.clone());

        let persisted = backend.load_all()?;
        let mut loaded = 0usize;
        for node in persisted {
            let resolved = match resolver.resolve(&node.path) {
                Ok(p) if p.key() != root.key() => p,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %node.path, error = %e, "skipping persisted node");
                    continue;
                }
            };
            // Ancestors missing from the backend are re-derived here.
            let dirs = match tree.missing_dirs(&resolved) {
                Ok(dirs) => dirs,
                Err(e) => {
                    warn!(path = %node.path, error = %e, "skipping persisted node");
                    continue;
                }
            };
            let node = MemoryNode {
                path: resolved.key(),
                ..node
            };
            if node.is_dir() && tree.nodes.get(&node.path).is_some_and(MemoryNode::is_dir) {
                continue;
            }
            tree.publish(&resolved, dirs, node);
            loaded += 1;
        }
        info!(backend = backend.name(), nodes = loaded, root = %root, "memory store opened");

        Ok(Self {
            config,
            resolver,
            locks: LockManager::new(),
            namespace: RwLock::new(()),
            tree: RwLock::new(tree),
            backend,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// The per-path lock table guarding every mutation.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Content of a leaf, or the ordered child listing of a directory.
    pub fn view(&self, path: &str) -> Result<MemoryView, CairnError> {
        let resolved = self.resolver.resolve(path)?;
        let key = resolved.key();
        let tree = self.read_tree();
        match tree.nodes.get(&key) {
            Some(node) if node.is_dir() => Ok(MemoryView::Directory {
                children: tree.index.list_children(&resolved)?,
                path: key.clone(),
            }),
            Some(node) => Ok(MemoryView::File(node.clone())),
            None => Err(CairnError::NotFound(format!("no memory at {key}"))),
        }
    }

    /// Ordered immediate children of a directory.
    pub fn list_children(&self, path: &str) -> Result<Vec<String>, CairnError> {
        let resolved = self.resolver.resolve(path)?;
        self.read_tree().index.list_children(&resolved)
    }

    pub fn stats(&self) -> MemoryStats {
        let tree = self.read_tree();
        tree.nodes
            .values()
            .fold(MemoryStats::default(), |mut stats, node| {
                match node.kind {
                    NodeKind::Leaf => {
                        stats.leaves += 1;
                        stats.total_bytes += node.size;
                    }
                    NodeKind::Directory => stats.directories += 1,
                }
                stats
            })
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    /// Create, overwrite or append to the leaf at `path`.
    ///
    /// # Errors
    ///
    /// - `Conflict` for `create` on an existing node, or when `path` (or an
    ///   ancestor) is of the wrong kind.
    /// - `NotFound` for `append` on a missing leaf unless `create_on_append`.
    /// - `SizeLimitExceeded` when the resulting content is over the chunk
    ///   limit.
    pub fn create_update(
        &self,
        path: &str,
        content: &str,
        mode: WriteMode,
    ) -> Result<MemoryNode, CairnError> {
        let create_on_append = self.config.create_on_append;
        self.write_leaf(path, "create_update", |key, current| match (mode, current) {
            (WriteMode::Create, Some(_)) => {
                Err(CairnError::Conflict(format!("{key} already exists")))
            }
            (WriteMode::Append, Some(node)) => Ok(format!("{}{content}", node.content)),
            (WriteMode::Append, None) if !create_on_append => {
                Err(CairnError::NotFound(format!("cannot append to missing {key}")))
            }
            _ => Ok(content.to_string()),
        })
    }

    /// Insert `content` as a new line before line `line_number` (0-based).
    /// Indexes past the end append a final line.
    pub fn insert(
        &self,
        path: &str,
        line_number: usize,
        content: &str,
    ) -> Result<MemoryNode, CairnError> {
        self.write_leaf(path, "insert", |key, current| {
            let node = current.ok_or_else(|| CairnError::NotFound(format!("no memory at {key}")))?;
            // A trailing newline terminates the last line rather than opening
            // an empty one.
            let (body, terminated) = match node.content.strip_suffix('\n') {
                Some(body) => (body, true),
                None => (node.content.as_str(), false),
            };
            let mut lines: Vec<&str> = if body.is_empty() && !terminated {
                Vec::new()
            } else {
                body.split('\n').collect()
            };
            let at = line_number.min(lines.len());
            lines.insert(at, content);
            let mut joined = lines.join("\n");
            if terminated {
                joined.push('\n');
            }
            Ok(joined)
        })
    }

    /// Replace the single occurrence of `find` with `replace`.
    pub fn str_replace(
        &self,
        path: &str,
        find: &str,
        replace: &str,
    ) -> Result<MemoryNode, CairnError> {
        if find.is_empty() {
            return Err(CairnError::Validation("search text must not be empty".into()));
        }
        self.write_leaf(path, "str_replace", |key, current| {
            let node = current.ok_or_else(|| CairnError::NotFound(format!("no memory at {key}")))?;
            match node.content.matches(find).count() {
                0 => Err(CairnError::NotFound(format!("{find:?} does not occur in {key}"))),
                1 => Ok(node.content.replacen(find, replace, 1)),
                n => Err(CairnError::AmbiguousMatch(format!(
                    "{find:?} occurs {n} times in {key}; include more context"
                ))),
            }
        })
    }

    /// Remove the node at `path`.  Non-empty directories need `recursive`.
    ///
    /// Returns the number of nodes removed.
    pub fn delete(&self, path: &str, recursive: bool) -> Result<usize, CairnError> {
        let resolved = self.resolver.resolve(path)?;
        let key = resolved.key();
        if self.is_root(&resolved) {
            return Err(CairnError::Validation(format!(
                "{key} is the namespace root; use clear_all to reset it"
            )));
        }

        let guard = self.lock(&key, "delete")?;
        let (_namespace, doomed) = self.plan(|tree| {
            let node = tree
                .nodes
                .get(&key)
                .ok_or_else(|| CairnError::NotFound(format!("no memory at {key}")))?;
            if node.is_dir() && tree.index.has_children(&key) && !recursive {
                return Err(CairnError::Conflict(format!(
                    "{key} is not empty; pass recursive to delete it"
                )));
            }
            let mut doomed = tree.index.descendants(&key);
            doomed.push(key.clone());
            Ok((doomed, node.is_dir()))
        })?;

        ensure_held(&guard)?;
        let ops: Vec<BackendOp> = doomed.iter().cloned().map(BackendOp::Remove).collect();
        self.backend.apply(&ops)?;

        let mut tree = self.write_tree();
        warn_if_lapsed(&guard);
        for removed in tree.index.remove_subtree(&resolved) {
            tree.nodes.remove(&removed);
        }
        debug!(path = %key, removed = doomed.len(), "memory node deleted");
        Ok(doomed.len())
    }

    /// Move the leaf at `old_path` to `new_path`, keeping its version,
    /// content and timestamp.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<MemoryNode, CairnError> {
        let from = self.resolver.resolve(old_path)?;
        let to = self.resolver.resolve(new_path)?;
        if self.is_root(&from) || self.is_root(&to) {
            return Err(CairnError::Validation(
                "the namespace root cannot be renamed or replaced".into(),
            ));
        }
        let (from_key, to_key) = (from.key(), to.key());

        // Canonical order so two crossing renames cannot deadlock.
        let (first, second) = if from_key <= to_key {
            (&from_key, &to_key)
        } else {
            (&to_key, &from_key)
        };
        let first_guard = self.lock(first, "rename")?;
        let second_guard = if first != second {
            Some(self.lock(second, "rename")?)
        } else {
            None
        };

        let (_namespace, (moved, dirs)) = self.plan(|tree| {
            let source = tree
                .nodes
                .get(&from_key)
                .ok_or_else(|| CairnError::NotFound(format!("no memory at {from_key}")))?;
            if source.is_dir() {
                return Err(CairnError::Validation(format!(
                    "{from_key} is a directory; only leaves can be renamed"
                )));
            }
            if tree.nodes.contains_key(&to_key) {
                return Err(CairnError::Conflict(format!("{to_key} already exists")));
            }
            let moved = MemoryNode {
                path: to_key.clone(),
                ..source.clone()
            };
            let dirs = tree.missing_dirs(&to)?;
            let structural = !dirs.is_empty();
            Ok(((moved, dirs), structural))
        })?;

        ensure_held(&first_guard)?;
        if let Some(guard) = &second_guard {
            ensure_held(guard)?;
        }
        let mut ops = vec![BackendOp::Remove(from_key.clone())];
        ops.extend(dirs.iter().cloned().map(BackendOp::Put));
        ops.push(BackendOp::Put(moved.clone()));
        self.backend.apply(&ops)?;

        let mut tree = self.write_tree();
        warn_if_lapsed(&first_guard);
        tree.index.unlink(&from);
        tree.nodes.remove(&from_key);
        tree.publish(&to, dirs, moved.clone());
        debug!(from = %from_key, to = %to_key, version = moved.version, "memory node renamed");
        Ok(moved)
    }

    /// Remove every node below the root.  Returns how many leaves were
    /// dropped.
    pub fn clear_all(&self) -> Result<usize, CairnError> {
        let _namespace = self.namespace(true);
        self.backend.apply(&[BackendOp::Clear])?;
        let mut tree = self.write_tree();
        let leaves = tree.nodes.values().filter(|n| !n.is_dir()).count();
        tree.clear();
        warn!(leaves, "memory tree cleared");
        Ok(leaves)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Shared commit path for every leaf mutation.  `compute` receives the
    /// current leaf (if any) and returns the new content.
    fn write_leaf<F>(&self, path: &str, op: &'static str, compute: F) -> Result<MemoryNode, CairnError>
    where
        F: FnOnce(&str, Option<&MemoryNode>) -> Result<String, CairnError>,
    {
        let resolved = self.resolver.resolve(path)?;
        let key = resolved.key();
        if self.is_root(&resolved) {
            return Err(CairnError::Conflict(format!("{key} is a directory")));
        }

        let guard = self.lock(&key, op)?;
        let (_namespace, (current, dirs)) = self.plan(|tree| {
            let current = tree.nodes.get(&key);
            if current.is_some_and(MemoryNode::is_dir) {
                return Err(CairnError::Conflict(format!("{key} is a directory")));
            }
            let dirs = tree.missing_dirs(&resolved)?;
            let structural = !dirs.is_empty();
            Ok(((current.cloned(), dirs), structural))
        })?;

        let content = compute(&key, current.as_ref())?;
        if content.len() > self.config.chunk_limit {
            return Err(CairnError::SizeLimitExceeded {
                size: content.len(),
                limit: self.config.chunk_limit,
            });
        }
        let version = current.as_ref().map_or(1, |n| n.version + 1);
        let node = MemoryNode::leaf(key.clone(), content, version);

        ensure_held(&guard)?;
        let mut ops: Vec<BackendOp> = dirs.iter().cloned().map(BackendOp::Put).collect();
        ops.push(BackendOp::Put(node.clone()));
        self.backend.apply(&ops)?;

        let mut tree = self.write_tree();
        warn_if_lapsed(&guard);
        tree.publish(&resolved, dirs, node.clone());
        debug!(op, path = %key, version, size = node.size, "memory node committed");
        Ok(node)
    }

    /// Enter the namespace section and run `plan` against the current tree.
    ///
    /// `plan` returns its result plus whether the mutation creates or removes
    /// a directory; such mutations are re-planned under the exclusive
    /// section.  The tree's read lock is released before this returns.
    fn plan<T, F>(&self, mut plan: F) -> Result<(NamespaceGuard<'_>, T), CairnError>
    where
        F: FnMut(&MemoryTree) -> Result<(T, bool), CairnError>,
    {
        let mut exclusive = false;
        loop {
            let namespace = self.namespace(exclusive);
            let (planned, structural) = plan(&*self.read_tree())?;
            if structural && !exclusive {
                exclusive = true;
                continue;
            }
            return Ok((namespace, planned));
        }
    }

    fn namespace(&self, exclusive: bool) -> NamespaceGuard<'_> {
        // The section guards no data of its own, so poisoning carries no
        // meaning here.
        if exclusive {
            NamespaceGuard::Exclusive {
                _guard: self.namespace.write().unwrap_or_else(|p| p.into_inner()),
            }
        } else {
            NamespaceGuard::Shared {
                _guard: self.namespace.read().unwrap_or_else(|p| p.into_inner()),
            }
        }
    }

    fn lock(&self, key: &str, op: &str) -> Result<LockGuard<'_>, CairnError> {
        let holder = format!("{op}-{}", Uuid::new_v4());
        self.locks.acquire_guard(key, &holder, self.config.lock_ttl)
    }

    fn is_root(&self, path: &ResolvedPath) -> bool {
        path.segments() == self.resolver.root().segments()
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, MemoryTree> {
        // Publication happens after every fallible step, so a panic cannot
        // leave the tree half-updated.
        self.tree.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, MemoryTree> {
        self.tree.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Refuse to commit once our lock has expired and may have been reclaimed.
fn ensure_held(guard: &LockGuard<'_>) -> Result<(), CairnError> {
    if guard.is_held() {
        Ok(())
    } else {
        let token = guard.token();
        Err(CairnError::LockTimeout {
            path: token.path.clone(),
            waited_ms: u64::try_from(token.acquired_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// The backend already holds the batch, so the tree follows it even when the
/// lock ran out during the write.
fn warn_if_lapsed(guard: &LockGuard<'_>) {
    if !guard.is_held() {
        warn!(path = %guard.token().path, "lock TTL elapsed during backend commit");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, SqliteBackend};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Instant;

    fn store() -> MemoryStore {
        MemoryStore::in_memory(MemoryConfig::default()).unwrap()
    }

    fn content_of(store: &MemoryStore, path: &str) -> (String, u64) {
        match store.view(path).unwrap() {
            MemoryView::File(node) => (node.content, node.version),
            other => panic!("expected a file, got {other:?}"),
        }
    }

    /// Accepts nothing; used to prove failed commits leave no trace.
    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }
        fn load_all(&self) -> Result<Vec<MemoryNode>, BackendError> {
            Ok(Vec::new())
        }
        fn apply(&self, _ops: &[BackendOp]) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("disk unplugged".into()))
        }
    }

    /// Accepts everything, slowly.
    struct SlowBackend(Duration);

    impl StorageBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }
        fn load_all(&self) -> Result<Vec<MemoryNode>, BackendError> {
            Ok(Vec::new())
        }
        fn apply(&self, _ops: &[BackendOp]) -> Result<(), BackendError> {
            thread::sleep(self.0);
            Ok(())
        }
    }

    // ── create_update ───────────────────────────────────────────────────────

    #[test]
    fn create_overwrite_append_versions() {
        let s = store();
        let p = "/memories/plan.md";
        assert_eq!(s.create_update(p, "X", WriteMode::Create).unwrap().version, 1);
        assert_eq!(content_of(&s, p), ("X".into(), 1));

        s.create_update(p, "Y", WriteMode::Overwrite).unwrap();
        assert_eq!(content_of(&s, p), ("Y".into(), 2));

        s.create_update(p, "Z", WriteMode::Append).unwrap();
        assert_eq!(content_of(&s, p), ("YZ".into(), 3));
    }

    #[test]
    fn create_on_existing_path_conflicts() {
        let s = store();
        s.create_update("a.md", "one", WriteMode::Create).unwrap();
        let err = s.create_update("a.md", "two", WriteMode::Create).unwrap_err();
        assert!(matches!(err, CairnError::Conflict(_)));
        assert_eq!(content_of(&s, "a.md"), ("one".into(), 1));
    }

    #[test]
    fn overwrite_creates_missing_leaf() {
        let s = store();
        let node = s.create_update("fresh.md", "hi", WriteMode::Overwrite).unwrap();
        assert_eq!(node.version, 1);
    }

    #[test]
    fn append_to_missing_leaf_is_not_found_unless_configured() {
        let s = store();
        let err = s.create_update("log.md", "x", WriteMode::Append).unwrap_err();
        assert!(matches!(err, CairnError::NotFound(_)));

        let lenient = MemoryStore::in_memory(MemoryConfig {
            create_on_append: true,
            ..MemoryConfig::default()
        })
        .unwrap();
        assert_eq!(
            lenient.create_update("log.md", "x", WriteMode::Append).unwrap().version,
            1
        );
    }

    #[test]
    fn oversized_write_is_rejected_not_truncated() {
        let s = MemoryStore::in_memory(MemoryConfig {
            chunk_limit: 8,
            ..MemoryConfig::default()
        })
        .unwrap();
        s.create_update("a", "12345", WriteMode::Create).unwrap();
        let err = s.create_update("a", "6789", WriteMode::Append).unwrap_err();
        assert_eq!(err, CairnError::SizeLimitExceeded { size: 9, limit: 8 });
        assert_eq!(content_of(&s, "a"), ("12345".into(), 1));
    }

    #[test]
    fn ancestors_are_created_implicitly() {
        let s = store();
        s.create_update("projects/x/plan.md", "p", WriteMode::Create).unwrap();
        assert_eq!(s.list_children("/memories/").unwrap(), vec!["/memories/projects/"]);
        assert_eq!(
            s.list_children("projects/x/").unwrap(),
            vec!["/memories/projects/x/plan.md"]
        );
    }

    #[test]
    fn writing_beneath_a_leaf_conflicts() {
        let s = store();
        s.create_update("a.md", "leaf", WriteMode::Create).unwrap();
        let err = s.create_update("a.md/b.md", "x", WriteMode::Create).unwrap_err();
        assert!(matches!(err, CairnError::Conflict(_)));
    }

    #[test]
    fn writing_to_a_directory_conflicts() {
        let s = store();
        s.create_update("dir/a.md", "x", WriteMode::Create).unwrap();
        assert!(matches!(
            s.create_update("dir", "x", WriteMode::Overwrite),
            Err(CairnError::Conflict(_))
        ));
        assert!(matches!(
            s.create_update("/memories", "x", WriteMode::Overwrite),
            Err(CairnError::Conflict(_))
        ));
    }

    #[test]
    fn invalid_paths_are_validation_errors() {
        let s = store();
        for bad in ["", "/memories/../etc", "/elsewhere/a", "a//b"] {
            let err = s.create_update(bad, "x", WriteMode::Overwrite).unwrap_err();
            assert_eq!(err.kind(), cairn_types::ErrorKind::ValidationError, "{bad:?}");
        }
    }

    // ── view ────────────────────────────────────────────────────────────────

    #[test]
    fn view_missing_is_not_found() {
        assert!(matches!(store().view("nope.md"), Err(CairnError::NotFound(_))));
    }

    #[test]
    fn view_root_lists_children_in_order() {
        let s = store();
        s.create_update("b.md", "b", WriteMode::Create).unwrap();
        s.create_update("a/c.md", "c", WriteMode::Create).unwrap();
        match s.view("/memories").unwrap() {
            MemoryView::Directory { path, children } => {
                assert_eq!(path, "/memories");
                assert_eq!(children, vec!["/memories/a/", "/memories/b.md"]);
            }
            other => panic!("expected directory, got {other:?}"),
        }
    }

    // ── insert / str_replace ────────────────────────────────────────────────

    #[test]
    fn insert_at_line_and_clamps() {
        let s = store();
        s.create_update("l.md", "one\nthree", WriteMode::Create).unwrap();
        s.insert("l.md", 1, "two").unwrap();
        assert_eq!(content_of(&s, "l.md").0, "one\ntwo\nthree");

        let node = s.insert("l.md", 99, "four").unwrap();
        assert_eq!(node.content, "one\ntwo\nthree\nfour");
        assert_eq!(node.version, 3);

        s.insert("l.md", 0, "zero").unwrap();
        assert!(content_of(&s, "l.md").0.starts_with("zero\none"));
    }

    #[test]
    fn insert_keeps_trailing_newline_as_terminator() {
        let s = store();
        s.create_update("t.md", "one\nthree\n", WriteMode::Create).unwrap();
        assert_eq!(s.insert("t.md", 99, "four").unwrap().content, "one\nthree\nfour\n");
        assert_eq!(s.insert("t.md", 1, "two").unwrap().content, "one\ntwo\nthree\nfour\n");

        s.create_update("blank.md", "\n", WriteMode::Create).unwrap();
        assert_eq!(s.insert("blank.md", 5, "x").unwrap().content, "\nx\n");
    }

    #[test]
    fn insert_into_missing_leaf_is_not_found() {
        assert!(matches!(store().insert("x.md", 0, "a"), Err(CairnError::NotFound(_))));
    }

    #[test]
    fn insert_into_empty_leaf() {
        let s = store();
        s.create_update("e.md", "", WriteMode::Create).unwrap();
        assert_eq!(s.insert("e.md", 5, "only").unwrap().content, "only");
    }

    #[test]
    fn str_replace_single_occurrence() {
        let s = store();
        s.create_update("r.md", "status: draft", WriteMode::Create).unwrap();
        let node = s.str_replace("r.md", "draft", "final").unwrap();
        assert_eq!(node.content, "status: final");
        assert_eq!(node.version, 2);
    }

    #[test]
    fn str_replace_absent_and_ambiguous() {
        let s = store();
        s.create_update("r.md", "a b a", WriteMode::Create).unwrap();
        assert!(matches!(s.str_replace("r.md", "zzz", "y"), Err(CairnError::NotFound(_))));
        assert!(matches!(
            s.str_replace("r.md", "a", "y"),
            Err(CairnError::AmbiguousMatch(_))
        ));
        assert!(matches!(s.str_replace("r.md", "", "y"), Err(CairnError::Validation(_))));
        assert_eq!(content_of(&s, "r.md"), ("a b a".into(), 1));
    }

    // ── delete ──────────────────────────────────────────────────────────────

    #[test]
    fn delete_missing_is_not_found() {
        assert!(matches!(store().delete("ghost.md", false), Err(CairnError::NotFound(_))));
    }

    #[test]
    fn delete_leaf() {
        let s = store();
        s.create_update("a.md", "x", WriteMode::Create).unwrap();
        assert_eq!(s.delete("a.md", false).unwrap(), 1);
        assert!(matches!(s.view("a.md"), Err(CairnError::NotFound(_))));
    }

    #[test]
    fn delete_non_empty_directory_needs_recursive() {
        let s = store();
        s.create_update("d/a.md", "x", WriteMode::Create).unwrap();
        s.create_update("d/e/b.md", "y", WriteMode::Create).unwrap();

        assert!(matches!(s.delete("d/", false), Err(CairnError::Conflict(_))));
        assert_eq!(s.delete("d/", true).unwrap(), 4);
        assert!(s.list_children("/memories").unwrap().is_empty());
        assert_eq!(s.stats().leaves, 0);
    }

    #[test]
    fn delete_root_is_rejected() {
        assert!(matches!(store().delete("/memories", true), Err(CairnError::Validation(_))));
    }

    #[test]
    fn recreated_leaf_restarts_at_version_one() {
        let s = store();
        s.create_update("a.md", "x", WriteMode::Create).unwrap();
        s.create_update("a.md", "y", WriteMode::Overwrite).unwrap();
        s.delete("a.md", false).unwrap();
        assert_eq!(s.create_update("a.md", "z", WriteMode::Create).unwrap().version, 1);
    }

    // ── rename ──────────────────────────────────────────────────────────────

    #[test]
    fn rename_moves_content_and_version() {
        let s = store();
        s.create_update("a.md", "v1", WriteMode::Create).unwrap();
        s.create_update("a.md", "v2", WriteMode::Overwrite).unwrap();

        let moved = s.rename("a.md", "archive/b.md").unwrap();
        assert_eq!(moved.path, "/memories/archive/b.md");
        assert_eq!(content_of(&s, "archive/b.md"), ("v2".into(), 2));
        assert!(matches!(s.view("a.md"), Err(CairnError::NotFound(_))));
    }

    #[test]
    fn rename_onto_existing_conflicts() {
        let s = store();
        s.create_update("a.md", "a", WriteMode::Create).unwrap();
        s.create_update("b.md", "b", WriteMode::Create).unwrap();
        assert!(matches!(s.rename("a.md", "b.md"), Err(CairnError::Conflict(_))));
        assert_eq!(content_of(&s, "a.md").0, "a");
        assert_eq!(content_of(&s, "b.md").0, "b");
    }

    #[test]
    fn rename_missing_and_directory() {
        let s = store();
        assert!(matches!(s.rename("x.md", "y.md"), Err(CairnError::NotFound(_))));
        s.create_update("d/a.md", "a", WriteMode::Create).unwrap();
        assert!(matches!(s.rename("d", "e"), Err(CairnError::Validation(_))));
    }

    // ── clear_all / stats ───────────────────────────────────────────────────

    #[test]
    fn clear_all_removes_everything_but_root() {
        let s = store();
        s.create_update("a.md", "x", WriteMode::Create).unwrap();
        s.create_update("d/b.md", "y", WriteMode::Create).unwrap();
        assert_eq!(s.clear_all().unwrap(), 2);
        assert!(s.list_children("/memories").unwrap().is_empty());
        assert_eq!(
            s.stats(),
            MemoryStats {
                leaves: 0,
                directories: 1,
                total_bytes: 0
            }
        );
    }

    #[test]
    fn stats_count_leaves_and_bytes() {
        let s = store();
        s.create_update("a.md", "abc", WriteMode::Create).unwrap();
        s.create_update("d/b.md", "de", WriteMode::Create).unwrap();
        let stats = s.stats();
        assert_eq!(stats.leaves, 2);
        assert_eq!(stats.directories, 2);
        assert_eq!(stats.total_bytes, 5);
    }

    // ── concurrency & locking ───────────────────────────────────────────────

    #[test]
    fn concurrent_writers_produce_sequential_versions() {
        let s = Arc::new(store());
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|text| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    s.create_update("shared.md", text, WriteMode::Overwrite).unwrap()
                })
            })
            .collect();

        let mut results: Vec<MemoryNode> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_by_key(|n| n.version);
        assert_eq!(results[0].version, 1);
        assert_eq!(results[1].version, 2);
        assert_eq!(content_of(&s, "shared.md"), (results[1].content.clone(), 2));
    }

    #[test]
    fn many_appenders_lose_no_update() {
        let s = Arc::new(store());
        s.create_update("log.md", "", WriteMode::Create).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                thread::spawn(move || {
                    for _ in 0..10 {
                        s.create_update("log.md", "x", WriteMode::Append).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let (content, version) = content_of(&s, "log.md");
        assert_eq!(content.len(), 80);
        assert_eq!(version, 81);
    }

    #[test]
    fn held_lock_times_out_writer_and_leaves_node_unchanged() {
        let s = MemoryStore::in_memory(MemoryConfig {
            lock_ttl: Duration::from_millis(30),
            ..MemoryConfig::default()
        })
        .unwrap();
        s.create_update("a.md", "before", WriteMode::Create).unwrap();

        let _other = s
            .locks()
            .acquire("/memories/a.md", "other-session", Duration::from_secs(10))
            .unwrap();
        let err = s.create_update("a.md", "after", WriteMode::Overwrite).unwrap_err();
        assert!(matches!(err, CairnError::LockTimeout { .. }));
        assert_eq!(content_of(&s, "a.md"), ("before".into(), 1));
    }

    #[test]
    fn abandoned_lock_is_reclaimed_by_next_writer() {
        let s = store();
        let _crashed = s
            .locks()
            .acquire("/memories/a.md", "crashed", Duration::from_millis(10))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(s.create_update("a.md", "ok", WriteMode::Create).unwrap().version, 1);
        assert!(s.locks().holder("/memories/a.md").is_none());
    }

    #[test]
    fn disjoint_paths_do_not_block_each_other() {
        let s = MemoryStore::in_memory(MemoryConfig {
            lock_ttl: Duration::from_millis(30),
            ..MemoryConfig::default()
        })
        .unwrap();
        let _held = s
            .locks()
            .acquire("/memories/a.md", "other", Duration::from_secs(10))
            .unwrap();
        assert!(s.create_update("b.md", "free", WriteMode::Create).is_ok());
    }

    #[test]
    fn commits_on_disjoint_paths_overlap_and_readers_do_not_wait() {
        let delay = Duration::from_millis(300);
        let s = Arc::new(
            MemoryStore::open(MemoryConfig::default(), Box::new(SlowBackend(delay))).unwrap(),
        );
        s.create_update("r.md", "read me", WriteMode::Create).unwrap();

        let barrier = Arc::new(Barrier::new(3));
        let writers: Vec<_> = ["a.md", "b.md"]
            .into_iter()
            .map(|path| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    s.create_update(path, "x", WriteMode::Create).unwrap()
                })
            })
            .collect();

        barrier.wait();
        let started = Instant::now();
        thread::sleep(Duration::from_millis(50));
        let read_at = Instant::now();
        assert_eq!(content_of(&s, "r.md").0, "read me");
        let read_latency = read_at.elapsed();

        for w in writers {
            assert_eq!(w.join().unwrap().version, 1);
        }
        let total = started.elapsed();

        assert!(read_latency < delay / 2, "view waited {read_latency:?}");
        assert!(total < delay * 2 - Duration::from_millis(100), "writes took {total:?}");
    }

    #[test]
    fn racing_writers_share_a_new_parent_directory() {
        let s = Arc::new(store());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    s.create_update(&format!("fresh/n{i}.md"), "x", WriteMode::Create)
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.list_children("fresh/").unwrap().len(), 4);
        assert_eq!(s.list_children("/memories").unwrap(), vec!["/memories/fresh/"]);
        assert_eq!(s.stats().directories, 2);
    }

    #[test]
    fn zero_lock_ttl_is_rejected() {
        let err = MemoryStore::in_memory(MemoryConfig {
            lock_ttl: Duration::ZERO,
            ..MemoryConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, CairnError::Validation(_)));
    }

    // ── backends ────────────────────────────────────────────────────────────

    #[test]
    fn backend_failure_is_internal_and_changes_nothing() {
        let s = MemoryStore::open(MemoryConfig::default(), Box::new(BrokenBackend)).unwrap();
        let err = s.create_update("a/b.md", "x", WriteMode::Create).unwrap_err();
        assert_eq!(err.kind(), cairn_types::ErrorKind::InternalError);
        assert!(matches!(s.view("a/b.md"), Err(CairnError::NotFound(_))));
        assert!(s.list_children("/memories").unwrap().is_empty());
        assert!(s.locks().is_empty());
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("memory.db");
        let db = db.to_str().unwrap();

        {
            let s = MemoryStore::open(
                MemoryConfig::default(),
                Box::new(SqliteBackend::open(db).unwrap()),
            )
            .unwrap();
            s.create_update("p/a.md", "one", WriteMode::Create).unwrap();
            s.create_update("p/a.md", "two", WriteMode::Overwrite).unwrap();
            s.create_update("b.md", "gone", WriteMode::Create).unwrap();
            s.rename("b.md", "c.md").unwrap();
            s.delete("c.md", false).unwrap();
        }

        let s = MemoryStore::open(
            MemoryConfig::default(),
            Box::new(SqliteBackend::open(db).unwrap()),
        )
        .unwrap();
        assert_eq!(content_of(&s, "p/a.md"), ("two".into(), 2));
        assert_eq!(s.list_children("/memories").unwrap(), vec!["/memories/p/"]);
        assert!(matches!(s.view("b.md"), Err(CairnError::NotFound(_))));
        assert!(matches!(s.view("c.md"), Err(CairnError::NotFound(_))));
    }

    #[test]
    fn reopen_skips_nodes_outside_namespace() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .apply(&[
                BackendOp::Put(MemoryNode::leaf("/other/a.md", "x".into(), 1)),
                BackendOp::Put(MemoryNode::leaf("/memories/k.md", "y".into(), 4)),
            ])
            .unwrap();
        let s = MemoryStore::open(MemoryConfig::default(), Box::new(backend)).unwrap();
        assert_eq!(s.stats().leaves, 1);
        assert_eq!(content_of(&s, "k.md"), ("y".into(), 4));
    }
}
