//! In-memory directory trees produced by `walk_dir`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use driveshare_common::{DrivePath, Error, Result};

/// A file or directory node in a walked tree.
///
/// Every node owns its children exclusively; a tree is rebuilt from scratch
/// on every walk and never shared between walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub is_directory: bool,
    pub absolute_path: DrivePath,
    /// File size in bytes; always `None` for directories.
    pub size: Option<u64>,
    pub children: Vec<FileNode>,
}

impl FileNode {
    /// Create an empty directory node.
    pub fn directory(path: DrivePath) -> Self {
        Self {
            name: path.display_name().to_string(),
            is_directory: true,
            absolute_path: path,
            size: None,
            children: Vec::new(),
        }
    }

    /// Create a file node.
    pub fn file(path: DrivePath, size: u64) -> Self {
        Self {
            name: path.display_name().to_string(),
            is_directory: false,
            absolute_path: path,
            size: Some(size),
            children: Vec::new(),
        }
    }

    /// Direct child by name.
    pub fn child(&self, name: &str) -> Option<&FileNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Number of nodes below this one.
    pub fn descendant_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&FileNode> = self.children.iter().collect();
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

/// Builds a tree from entries arriving in any order where parents may or may
/// not have been seen yet.
///
/// Nodes live in a flat arena indexed by path, so attaching an entry to its
/// parent is a single map lookup. Missing ancestors are created as
/// directories. The final tree is assembled in one backwards pass, which
/// works because a parent is always allocated before any of its children.
pub struct TreeBuilder {
    root: DrivePath,
    nodes: Vec<FileNode>,
    children: Vec<Vec<usize>>,
    index: HashMap<DrivePath, usize>,
}

impl TreeBuilder {
    /// Start a tree rooted at `root`.
    pub fn new(root: DrivePath) -> Self {
        let mut index = HashMap::new();
        index.insert(root.clone(), 0);
        Self {
            nodes: vec![FileNode::directory(root.clone())],
            children: vec![Vec::new()],
            index,
            root,
        }
    }

    /// Add an entry below the root.
    ///
    /// Re-adding a known path is a no-op, except that a file later seen as a
    /// directory is promoted to one.
    ///
    /// # Errors
    /// - `InvalidInput` if `path` is not below the root
    pub fn insert(&mut self, path: DrivePath, is_directory: bool, size: u64) -> Result<()> {
        if path == self.root {
            return Ok(());
        }
        if !path.components().starts_with(self.root.components()) {
            return Err(Error::InvalidInput(format!(
                "{} is outside of walk root {}",
                path, self.root
            )));
        }

        if let Some(&idx) = self.index.get(&path) {
            if is_directory {
                self.promote(idx);
            }
            return Ok(());
        }

        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let parent_idx = self.ensure_directory(&parent);
        let node = if is_directory {
            FileNode::directory(path.clone())
        } else {
            FileNode::file(path.clone(), size)
        };
        self.attach(parent_idx, path, node);
        Ok(())
    }

    /// Finish and return the root node.
    pub fn build(self) -> FileNode {
        let TreeBuilder {
            root,
            nodes,
            children,
            ..
        } = self;
        let mut built: Vec<Option<FileNode>> = (0..nodes.len()).map(|_| None).collect();
        for (idx, mut node) in nodes.into_iter().enumerate().rev() {
            node.children = children[idx]
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            built[idx] = Some(node);
        }
        built
            .into_iter()
            .next()
            .flatten()
            .unwrap_or_else(|| FileNode::directory(root))
    }

    fn ensure_directory(&mut self, path: &DrivePath) -> usize {
        if let Some(&idx) = self.index.get(path) {
            self.promote(idx);
            return idx;
        }
        let mut parent_idx = 0;
        for prefix in path.prefixes().skip(self.root.components().len()) {
            parent_idx = match self.index.get(&prefix) {
                Some(&idx) => {
                    self.promote(idx);
                    idx
                }
                None => {
                    let node = FileNode::directory(prefix.clone());
                    self.attach(parent_idx, prefix, node)
                }
            };
        }
        parent_idx
    }

    fn attach(&mut self, parent_idx: usize, path: DrivePath, node: FileNode) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.children.push(Vec::new());
        self.children[parent_idx].push(idx);
        self.index.insert(path, idx);
        idx
    }

    fn promote(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        if !node.is_directory {
            node.is_directory = true;
            node.size = None;
        }
    }
}

/// Reconstruct a tree from flat object keys.
///
/// Keys are split on `/`; every intermediate segment is a directory, and so
/// is a key that ends in `/` or has zero bytes. Keys outside `root` or with
/// segments that do not form a valid path are skipped.
pub fn tree_from_keys<I>(root: &DrivePath, entries: I) -> FileNode
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut builder = TreeBuilder::new(root.clone());
    for (key, size) in entries {
        let path = match DrivePath::parse(&key) {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping object key {}: {}", key, e);
                continue;
            }
        };
        let is_directory = key.ends_with('/') || size == 0;
        if let Err(e) = builder.insert(path, is_directory, size) {
            warn!("Skipping object key {}: {}", key, e);
        }
    }
    builder.build()
}
