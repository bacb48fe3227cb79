use crate::hasher::digest_of;
use crate::{Digest, Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker embedded in every encoded tree. Bumping [`TREE_VERSION`] changes
/// the bytes of every tree and therefore every tree digest.
pub const TREE_FORMAT: &str = "hashvault-tree";
pub const TREE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl EntryKind {
    /// Kinds whose digest refers to a blob rather than a tree.
    pub fn has_content(&self) -> bool {
        matches!(self, EntryKind::File | EntryKind::Symlink)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Permission bits only (no file type bits).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub digest: Digest,
    pub meta: EntryMeta,
}

impl TreeEntry {
    pub fn new(kind: EntryKind, digest: Digest, meta: EntryMeta) -> Self {
        Self { kind, digest, meta }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink)
    }
}

/// A directory listing: entry name to {kind, digest, metadata}.
///
/// Entries are kept in a `BTreeMap`, so iteration and encoding are always in
/// byte-wise name order regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

#[derive(Serialize)]
struct EncodeTree<'a> {
    format: &'a str,
    version: u32,
    entries: &'a BTreeMap<String, TreeEntry>,
}

#[derive(Deserialize)]
struct DecodeTree {
    format: String,
    version: u32,
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry. Names that could escape a directory on
    /// restore are refused.
    pub fn insert(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<()> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(Error::InvalidTree(format!("invalid entry name {:?}", name)));
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &TreeEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical bytes of this tree.
    pub fn encode(&self) -> Bytes {
        let doc = EncodeTree {
            format: TREE_FORMAT,
            version: TREE_VERSION,
            entries: &self.entries,
        };
        // Only strings, integers and maps of string keys: serialization cannot fail.
        let data = serde_json::to_vec(&doc).unwrap_or_default();
        Bytes::from(data)
    }

    pub fn digest(&self) -> Digest {
        digest_of(&self.encode())
    }

    /// Decodes a tree, accepting only the exact canonical encoding.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let doc: DecodeTree = serde_json::from_slice(data)
            .map_err(|e| Error::InvalidTree(format!("malformed tree: {}", e)))?;
        if doc.format != TREE_FORMAT || doc.version != TREE_VERSION {
            return Err(Error::UnsupportedFormat {
                format: doc.format,
                version: doc.version,
            });
        }
        if let Some(name) = doc.entries.keys().find(|name| !is_valid_name(name)) {
            return Err(Error::InvalidTree(format!("invalid entry name {:?}", name)));
        }
        let tree = Self {
            entries: doc.entries,
        };
        if tree.encode().as_ref() != data {
            return Err(Error::InvalidTree("tree is not canonically encoded".to_string()));
        }
        Ok(tree)
    }

    /// Digests of every object this tree references directly.
    pub fn references(&self) -> impl Iterator<Item = Digest> + '_ {
        self.entries.values().map(|entry| entry.digest)
    }

    pub fn subtrees(&self) -> impl Iterator<Item = (&str, Digest)> {
        self.entries()
            .filter(|(_, entry)| entry.is_dir())
            .map(|(name, entry)| (name, entry.digest))
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.meta.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_file()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_dir()).count()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}
