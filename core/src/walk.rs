//! Traversal of the object graph below a root tree.

use crate::store::{ObjectStore, ObjectStoreExt};
use crate::tree::{EntryKind, Tree, TreeEntry};
use crate::{Digest, Error, Result};
use std::collections::{HashMap, HashSet};

/// Every object reachable from a root tree.
#[derive(Debug)]
pub struct Closure {
    pub root: Digest,
    /// Trees that were present, decoded and verified.
    pub trees: HashMap<Digest, Tree>,
    /// Content digests referenced by file and symlink entries.
    pub blobs: HashSet<Digest>,
    /// Referenced digests that are absent from the store, sorted.
    pub missing: Vec<Digest>,
}

impl Closure {
    pub fn new(root: Digest) -> Self {
        Self {
            root,
            trees: HashMap::new(),
            blobs: HashSet::new(),
            missing: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.trees.len() + self.blobs.len()
    }

    /// Fails with [`Error::ObjectNotFound`] naming the first missing digest.
    pub fn ensure_complete(&self) -> Result<()> {
        match self.missing.first() {
            Some(digest) => Err(Error::ObjectNotFound { digest: *digest }),
            None => Ok(()),
        }
    }

    pub fn digests(&self) -> impl Iterator<Item = Digest> + '_ {
        self.trees.keys().chain(self.blobs.iter()).copied()
    }

    pub fn tree(&self, digest: &Digest) -> Result<&Tree> {
        self.trees
            .get(digest)
            .ok_or(Error::ObjectNotFound { digest: *digest })
    }
}

/// Resolves the closure of `root` one tree level at a time, with a single
/// `batch_has` per level and one for all blobs.
///
/// Absent objects are collected in [`Closure::missing`]; corrupt or
/// undecodable trees fail the walk.
pub async fn closure<S: ObjectStore + ?Sized>(store: &S, root: &Digest) -> Result<Closure> {
    let mut result = Closure::new(*root);
    let mut visited: HashSet<Digest> = HashSet::from([*root]);
    let mut frontier = vec![*root];

    while !frontier.is_empty() {
        let present = store.batch_has(&frontier).await?;
        let mut next = Vec::new();
        for digest in frontier {
            if !present.contains(&digest) {
                result.missing.push(digest);
                continue;
            }
            let tree = store.get_tree(&digest).await?;
            for (_, entry) in tree.entries() {
                match entry.kind {
                    EntryKind::Directory => {
                        if visited.insert(entry.digest) {
                            next.push(entry.digest);
                        }
                    }
                    kind if kind.has_content() => {
                        result.blobs.insert(entry.digest);
                    }
                    _ => {}
                }
            }
            result.trees.insert(digest, tree);
        }
        frontier = next;
    }

    let blobs: Vec<Digest> = result.blobs.iter().copied().collect();
    result.missing.extend(store.missing(&blobs).await?);
    result.missing.sort();
    Ok(result)
}

/// Looks up a `/`-separated path below `root`.
pub async fn resolve_path<S: ObjectStore + ?Sized>(
    store: &S,
    root: &Digest,
    path: &str,
) -> Result<(String, TreeEntry)> {
    let mut current = *root;
    let mut found: Option<(String, TreeEntry)> = None;

    for component in path.split('/').filter(|c| !c.is_empty()) {
        if let Some((_, entry)) = &found {
            if !entry.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is not a directory in this snapshot",
                    path
                )));
            }
            current = entry.digest;
        }
        let tree = store.get_tree(&current).await?;
        let entry = tree.get(component).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("path '{}' does not exist in this snapshot", path))
        })?;
        found = Some((component.to_string(), entry));
    }

    found.ok_or_else(|| Error::InvalidArgument("empty path".to_string()))
}

/// Every entry below `root` as `(relative path, entry)`, depth first in name
/// order. Fails if any tree in the closure is missing.
pub async fn list_entries<S: ObjectStore + ?Sized>(
    store: &S,
    root: &Digest,
) -> Result<Vec<(String, TreeEntry)>> {
    let closure = closure(store, root).await?;
    let mut out = Vec::new();
    collect_entries(&closure, root, "", &mut out)?;
    Ok(out)
}

fn collect_entries(
    closure: &Closure,
    digest: &Digest,
    prefix: &str,
    out: &mut Vec<(String, TreeEntry)>,
) -> Result<()> {
    let tree = closure.tree(digest)?;
    for (name, entry) in tree.entries() {
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };
        out.push((path.clone(), entry.clone()));
        if entry.is_dir() {
            collect_entries(closure, &entry.digest, &path, out)?;
        }
    }
    Ok(())
}
