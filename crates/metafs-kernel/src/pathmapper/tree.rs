//! Arena-backed tree of mapped paths.
//!
//! Nodes live in a single `Vec` and refer to each other by [`NodeId`].
//! Parent links are plain ids, so there are no ownership cycles. Freed
//! slots are reused by later insertions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{VfsError, VfsResult};
use crate::path;
use crate::stats::UsageStats;
use crate::types::XattrMap;

/// Stable index of a node in a [`MappedTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Arbitrary metadata attached to a mapped node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapOptions {
    /// Free-form key/value options.
    pub values: Map<String, Value>,
    /// Extended attributes served from memory rather than the backing file.
    pub xattr: XattrMap,
}

impl MapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Add an in-memory extended attribute.
    pub fn with_xattr(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.xattr.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Merge `other` into these options; `other` wins on conflicts.
    pub fn merge(&mut self, other: MapOptions) {
        self.values.extend(other.values);
        self.xattr.extend(other.xattr);
    }
}

/// File or directory payload of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    File {
        real_path: PathBuf,
        /// Backing file size as last observed.
        stats_size: u64,
    },
    Directory {
        children: BTreeMap<String, NodeId>,
    },
}

/// A node in the mapped tree.
#[derive(Debug, Clone)]
pub struct MappedNode {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
    pub options: MapOptions,
}

impl MappedNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Backing file, for file nodes.
    pub fn real_path(&self) -> Option<&Path> {
        match &self.kind {
            NodeKind::File { real_path, .. } => Some(real_path),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn stats_size(&self) -> u64 {
        match self.kind {
            NodeKind::File { stats_size, .. } => stats_size,
            NodeKind::Directory { .. } => 0,
        }
    }

    fn children(&self) -> Option<&BTreeMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }
}

/// Current size of a backing file, zero when it cannot be read.
fn observed_size(real_path: &Path) -> u64 {
    std::fs::metadata(real_path).map(|m| m.len()).unwrap_or(0)
}

/// Tree of virtual paths projected onto real files.
#[derive(Debug)]
pub struct MappedTree {
    nodes: Vec<Option<MappedNode>>,
    free: Vec<usize>,
    stats: Arc<UsageStats>,
}

impl Default for MappedTree {
    fn default() -> Self {
        Self::new(UsageStats::new())
    }
}

impl MappedTree {
    const ROOT: NodeId = NodeId(0);

    /// Create a tree holding only the root directory.
    pub fn new(stats: Arc<UsageStats>) -> Self {
        stats.record(0, 1);
        let root = MappedNode {
            name: String::new(),
            parent: None,
            kind: NodeKind::Directory {
                children: BTreeMap::new(),
            },
            options: MapOptions::default(),
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            stats,
        }
    }

    pub fn root(&self) -> NodeId {
        Self::ROOT
    }

    pub fn stats(&self) -> &Arc<UsageStats> {
        &self.stats
    }

    /// Number of live nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn get(&self, id: NodeId) -> Option<&MappedNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut MappedNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Resolve a virtual path without creating anything.
    pub fn node_id(&self, virtual_path: &str) -> Option<NodeId> {
        let mut current = Self::ROOT;
        for component in path::scan_path(virtual_path) {
            current = *self.get(current)?.children()?.get(component)?;
        }
        Some(current)
    }

    pub fn node(&self, virtual_path: &str) -> Option<&MappedNode> {
        self.node_id(virtual_path).and_then(|id| self.get(id))
    }

    /// The real file behind a virtual path.
    pub fn unmap(&self, virtual_path: &str) -> Option<&Path> {
        self.node(virtual_path).and_then(MappedNode::real_path)
    }

    /// Names of a directory's children, sorted.
    pub fn children(&self, id: NodeId) -> Option<Vec<String>> {
        self.get(id)?.children().map(|c| c.keys().cloned().collect())
    }

    /// Rebuild the virtual path of a node.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = self.get(id);
        while let Some(node) = current {
            if node.parent.is_none() {
                break;
            }
            names.push(node.name.as_str());
            current = node.parent.and_then(|p| self.get(p));
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Look up an option on a node or, failing that, on its nearest
    /// ancestor that sets it.
    pub fn inherited_option(&self, id: NodeId, key: &str) -> Option<&Value> {
        let mut current = Some(id);
        while let Some(node) = current.and_then(|id| self.get(id)) {
            if let Some(value) = node.options.get(key) {
                return Some(value);
            }
            current = node.parent;
        }
        None
    }

    fn alloc(&mut self, node: MappedNode) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.get(parent)?.children()?.get(name).copied()
    }

    fn insert_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = self.alloc(MappedNode {
            name: name.to_string(),
            parent: Some(parent),
            kind,
            options: MapOptions::default(),
        });
        if let Some(MappedNode {
            kind: NodeKind::Directory { children },
            ..
        }) = self.get_mut(parent)
        {
            children.insert(name.to_string(), id);
        }
        self.stats.record(0, 1);
        id
    }

    /// Walk `components`, creating missing directories.
    fn ensure_dirs(&mut self, components: &[&str], virtual_path: &str) -> VfsResult<NodeId> {
        let mut current = Self::ROOT;
        for component in components {
            current = match self.child(current, component) {
                Some(id) => {
                    if self.get(id).is_some_and(MappedNode::is_file) {
                        return Err(VfsError::not_a_directory(virtual_path));
                    }
                    id
                }
                None => self.insert_child(
                    current,
                    component,
                    NodeKind::Directory {
                        children: BTreeMap::new(),
                    },
                ),
            };
        }
        Ok(current)
    }

    /// Map `real_path` to appear at `virtual_path`.
    ///
    /// Intermediate directories are created as needed. Mapping over an
    /// existing file node repoints it and merges the options.
    pub fn map_file(
        &mut self,
        real_path: impl Into<PathBuf>,
        virtual_path: &str,
        options: MapOptions,
    ) -> VfsResult<NodeId> {
        let real_path = real_path.into();
        let components = path::scan_path(virtual_path);
        let Some((file_name, dirs)) = components.split_last() else {
            return Err(VfsError::invalid_path(virtual_path));
        };
        let parent = self.ensure_dirs(dirs, virtual_path)?;

        let size = observed_size(&real_path);
        let id = match self.child(parent, file_name) {
            Some(id) => {
                let Some(node) = self.get_mut(id) else {
                    return Err(VfsError::not_found(virtual_path));
                };
                let NodeKind::File { stats_size, .. } = node.kind else {
                    return Err(VfsError::is_a_directory(virtual_path));
                };
                node.kind = NodeKind::File {
                    real_path,
                    stats_size: size,
                };
                self.stats.record(size as i64 - stats_size as i64, 0);
                id
            }
            None => {
                let id = self.insert_child(
                    parent,
                    file_name,
                    NodeKind::File {
                        real_path,
                        stats_size: size,
                    },
                );
                self.stats.record(size as i64, 0);
                id
            }
        };
        if let Some(node) = self.get_mut(id) {
            node.options.merge(options);
        }
        Ok(id)
    }

    /// Create a directory node, and any missing parents, with options.
    pub fn mkdir(&mut self, virtual_path: &str, options: MapOptions) -> VfsResult<NodeId> {
        let components = path::scan_path(virtual_path);
        let id = self.ensure_dirs(&components, virtual_path)?;
        if let Some(node) = self.get_mut(id) {
            node.options.merge(options);
        }
        Ok(id)
    }

    /// Account for a file node's backing file now being `size` bytes.
    ///
    /// The size is only applied while the node still points at
    /// `real_path`. Returns the size delta applied.
    pub fn set_size(&mut self, id: NodeId, real_path: &Path, size: u64) -> Option<i64> {
        let stats = Arc::clone(&self.stats);
        let node = self.get_mut(id)?;
        let NodeKind::File {
            real_path: current,
            stats_size,
        } = &mut node.kind
        else {
            return None;
        };
        if current.as_path() != real_path {
            return None;
        }
        let delta = size as i64 - *stats_size as i64;
        *stats_size = size;
        stats.record(delta, 0);
        Some(delta)
    }

    /// Remove a file node or an empty directory node.
    fn remove(&mut self, id: NodeId) {
        if id == Self::ROOT {
            return;
        }
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        self.free.push(id.0);
        if let Some(MappedNode {
            kind: NodeKind::Directory { children },
            ..
        }) = node.parent.and_then(|p| self.get_mut(p))
        {
            children.remove(&node.name);
        }
        self.stats.record(-(node.stats_size() as i64), -1);
    }

    /// Remove a single file node by virtual path, returning its backing path.
    pub fn unmap_file(&mut self, virtual_path: &str) -> Option<PathBuf> {
        let id = self.node_id(virtual_path)?;
        let real_path = self.get(id)?.real_path()?.to_path_buf();
        self.remove(id);
        Some(real_path)
    }

    /// Remove every file node for which `discard` returns true, then any
    /// directory left empty as a result. Returns the number of nodes
    /// removed.
    ///
    /// Only directories emptied by this pass are removed. A directory
    /// that was already empty, such as one made with [`MappedTree::mkdir`]
    /// to carry options, is kept. The root is never removed.
    pub fn cleanup<F>(&mut self, mut discard: F) -> usize
    where
        F: FnMut(&MappedNode) -> bool,
    {
        self.cleanup_dir(Self::ROOT, &mut discard)
    }

    fn cleanup_dir<F>(&mut self, dir: NodeId, discard: &mut F) -> usize
    where
        F: FnMut(&MappedNode) -> bool,
    {
        let children: Vec<NodeId> = self
            .get(dir)
            .and_then(MappedNode::children)
            .map(|c| c.values().copied().collect())
            .unwrap_or_default();

        let mut removed = 0;
        for id in children {
            let Some(node) = self.get(id) else {
                continue;
            };
            if node.is_file() {
                if discard(node) {
                    self.remove(id);
                    removed += 1;
                }
            } else {
                let below = self.cleanup_dir(id, discard);
                removed += below;
                let now_empty = self
                    .get(id)
                    .and_then(MappedNode::children)
                    .is_some_and(BTreeMap::is_empty);
                if below > 0 && now_empty {
                    self.remove(id);
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn test_map_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let real = write_file(dir.path(), "x.txt", b"abc");

        let mut tree = MappedTree::default();
        tree.map_file(&real, "/t/x", MapOptions::new()).unwrap();

        assert_eq!(tree.unmap("/t/x"), Some(real.as_path()));
        assert!(tree.node("/t").unwrap().is_dir());
        assert!(tree.node("/t/x").unwrap().is_file());
        assert!(tree.node("/t/missing").is_none());
        assert!(tree.node("/t/x/deeper").is_none());
        assert_eq!(tree.children(tree.root()).unwrap(), vec!["t"]);
        assert_eq!(tree.path_of(tree.node_id("/t/x").unwrap()), "/t/x");

        // root, /t, /t/x
        assert_eq!(tree.stats().used_nodes(), 3);
        assert_eq!(tree.stats().used_space(), 3);
    }

    #[test]
    fn test_file_and_directory_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let real = write_file(dir.path(), "f", b"1");
        let mut tree = MappedTree::default();
        tree.map_file(&real, "/a/f", MapOptions::new()).unwrap();

        assert!(matches!(
            tree.map_file(&real, "/a/f/g", MapOptions::new()),
            Err(VfsError::NotADirectory(_))
        ));
        assert!(matches!(
            tree.map_file(&real, "/a", MapOptions::new()),
            Err(VfsError::IsADirectory(_))
        ));
        assert!(matches!(
            tree.map_file(&real, "/", MapOptions::new()),
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_remap_merges_options_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let small = write_file(dir.path(), "small", b"12");
        let large = write_file(dir.path(), "large", b"123456");
        let mut tree = MappedTree::default();

        tree.map_file(&small, "/f", MapOptions::new().with("a", 1))
            .unwrap();
        tree.map_file(&large, "/f", MapOptions::new().with("b", 2))
            .unwrap();

        let node = tree.node("/f").unwrap();
        assert_eq!(node.real_path(), Some(large.as_path()));
        assert_eq!(node.options.get("a"), Some(&Value::from(1)));
        assert_eq!(node.options.get("b"), Some(&Value::from(2)));
        assert_eq!(tree.stats().used_space(), 6);
        assert_eq!(tree.stats().used_nodes(), 2);
    }

    #[test]
    fn test_cleanup_removes_stale_and_empty_parents() {
        let dir = tempfile::tempdir().unwrap();
        let keep = write_file(dir.path(), "keep", b"k");
        let gone = write_file(dir.path(), "gone", b"gg");

        let mut tree = MappedTree::default();
        tree.map_file(&keep, "/a/keep", MapOptions::new()).unwrap();
        tree.map_file(&gone, "/a/gone", MapOptions::new()).unwrap();
        tree.map_file(&gone, "/b/c/gone", MapOptions::new()).unwrap();
        tree.mkdir("/empty", MapOptions::new()).unwrap();
        assert_eq!(tree.len(), 8);

        std::fs::remove_file(&gone).unwrap();
        let removed = tree.cleanup(|node| node.real_path().is_none_or(|p| !p.exists()));

        // /a/gone, /b/c/gone, /b/c, /b
        assert_eq!(removed, 4);
        assert!(tree.node("/a/keep").is_some());
        assert!(tree.node("/a/gone").is_none());
        assert!(tree.node("/b").is_none());
        assert!(tree.node("/empty").is_some());
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.stats().used_nodes(), 4);
        assert_eq!(tree.stats().used_space(), 1);
    }

    #[test]
    fn test_slots_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let real = write_file(dir.path(), "r", b"");
        let mut tree = MappedTree::default();
        tree.map_file(&real, "/x", MapOptions::new()).unwrap();
        tree.cleanup(|_| true);
        let id = tree.map_file(&real, "/y", MapOptions::new()).unwrap();
        assert_eq!(id, NodeId(1));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_inherited_option() {
        let dir = tempfile::tempdir().unwrap();
        let real = write_file(dir.path(), "r", b"");
        let mut tree = MappedTree::default();
        tree.mkdir("/ro", MapOptions::new().with("read_only", true))
            .unwrap();
        let id = tree.map_file(&real, "/ro/sub/f", MapOptions::new()).unwrap();
        assert_eq!(tree.inherited_option(id, "read_only"), Some(&Value::Bool(true)));

        let other = tree.map_file(&real, "/rw/f", MapOptions::new()).unwrap();
        assert!(tree.inherited_option(other, "read_only").is_none());
    }

    #[test]
    fn test_set_size() {
        let dir = tempfile::tempdir().unwrap();
        let real = write_file(dir.path(), "grow", b"ab");
        let other = write_file(dir.path(), "other", b"");
        let mut tree = MappedTree::default();
        let id = tree.map_file(&real, "/g", MapOptions::new()).unwrap();
        assert_eq!(tree.stats().used_space(), 2);

        assert_eq!(tree.set_size(id, &real, 6), Some(4));
        assert_eq!(tree.set_size(id, &real, 6), Some(0));
        // a size observed for a file the node no longer maps is dropped
        assert_eq!(tree.set_size(id, &other, 100), None);
        assert_eq!(tree.set_size(tree.root(), &real, 1), None);
        assert_eq!(tree.stats().used_space(), 6);

        assert_eq!(tree.unmap_file("/g"), Some(real));
        assert_eq!(tree.stats().used_space(), 0);
    }
}
