//! Depth-first walks over listing APIs.

use async_trait::async_trait;
use tracing::debug;

use driveshare_common::{DrivePath, Result};

use crate::tree::{FileNode, TreeBuilder};

/// One child returned by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
}

impl ListedEntry {
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            size: 0,
        }
    }

    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            size,
        }
    }
}

/// Something that can list the direct children of a directory.
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    /// List the direct children of `path`.
    ///
    /// # Errors
    /// - `NotFound` if `path` does not exist
    /// - `NotADirectory` if `path` is a file
    async fn list_children(&self, path: &DrivePath) -> Result<Vec<ListedEntry>>;
}

/// Visit every entry below `root` in depth-first preorder.
///
/// A directory's subtree is fully visited before its next sibling. The first
/// listing or visitor error stops the walk and is returned; entries visited
/// before it stay visited.
pub async fn walk<L, F>(lister: &L, root: &DrivePath, mut visit: F) -> Result<()>
where
    L: DirectoryLister + ?Sized,
    F: FnMut(&DrivePath, &ListedEntry) -> Result<()> + Send,
{
    let first = lister.list_children(root).await?;
    let mut stack = vec![(root.clone(), first.into_iter())];

    while let Some((dir, entries)) = stack.last_mut() {
        let entry = match entries.next() {
            Some(entry) => entry,
            None => {
                stack.pop();
                continue;
            }
        };
        let path = dir.join(&entry.name)?;
        visit(&path, &entry)?;
        if entry.is_directory {
            let children = lister.list_children(&path).await?;
            stack.push((path, children.into_iter()));
        }
    }
    Ok(())
}

/// Materialize the complete tree below `root`.
pub async fn walk_tree<L>(lister: &L, root: &DrivePath) -> Result<FileNode>
where
    L: DirectoryLister + ?Sized,
{
    let mut builder = TreeBuilder::new(root.clone());
    walk(lister, root, |path, entry| {
        builder.insert(path.clone(), entry.is_directory, entry.size)
    })
    .await?;
    let tree = builder.build();
    debug!("Walked {}: {} entries", root, tree.descendant_count());
    Ok(tree)
}
