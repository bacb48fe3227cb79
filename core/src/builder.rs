//! Filesystem scanning: turns a directory into tree objects, bottom-up.
//!
//! The builder never writes to a store. It produces a [`BuildOutput`] that
//! holds every encoded tree (children before parents) and a handle on the
//! content of every blob, which the sync negotiator later uploads on demand.
//!
//! When a prior root is supplied, file entries whose kind and metadata are
//! unchanged since that snapshot keep their old digest without re-reading the
//! file. Directories are always listed again.

use crate::hasher;
use crate::store::{ObjectStore, ObjectStoreExt};
use crate::tree::{EntryKind, EntryMeta, Tree, TreeEntry};
use crate::{Digest, Error, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Files hashed concurrently within one directory.
    pub concurrency: usize,
    /// Gitignore-style patterns, matched relative to each backup root.
    pub exclude: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            exclude: Vec::new(),
        }
    }
}

/// Where the bytes of a blob come from at upload time.
#[derive(Debug, Clone)]
pub enum BlobSource {
    /// Re-read (and re-hashed) from disk.
    File(PathBuf),
    /// Already in memory, e.g. a symlink target.
    Inline(Bytes),
}

#[derive(Debug, Clone)]
pub struct PendingBlob {
    pub digest: Digest,
    pub source: BlobSource,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct PendingTree {
    pub digest: Digest,
    pub data: Bytes,
    /// 0 for a directory without subdirectories, otherwise one more than the
    /// tallest child.
    pub height: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub special: u64,
    pub bytes_hashed: u64,
    /// Files whose digest was taken from the prior snapshot.
    pub reused: u64,
    /// Entries that vanished, were unreadable or had non-UTF-8 names.
    pub skipped: u64,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub root: Digest,
    /// Distinct trees in post-order: every tree follows the trees it references.
    pub trees: Vec<PendingTree>,
    pub blobs: HashMap<Digest, PendingBlob>,
    pub stats: BuildStats,
}

impl BuildOutput {
    /// Every object digest this build references, blobs first.
    pub fn candidates(&self) -> Vec<Digest> {
        self.blobs
            .keys()
            .copied()
            .chain(self.trees.iter().map(|tree| tree.digest))
            .collect()
    }
}

#[derive(Default)]
struct ScanState {
    trees: Vec<PendingTree>,
    seen_trees: HashSet<Digest>,
    blobs: HashMap<Digest, PendingBlob>,
    stats: BuildStats,
}

impl ScanState {
    fn add_blob(&mut self, digest: Digest, source: BlobSource, size: u64) {
        self.blobs.entry(digest).or_insert(PendingBlob {
            digest,
            source,
            size,
        });
    }

    fn add_tree(&mut self, tree: &Tree, height: u32, path: &Path) -> Digest {
        let data = tree.encode();
        let digest = hasher::digest_of(&data);
        if self.seen_trees.insert(digest) {
            self.trees.push(PendingTree {
                digest,
                data,
                height,
                path: path.to_path_buf(),
            });
        }
        digest
    }

    fn finish(self, root: Digest) -> BuildOutput {
        BuildOutput {
            root,
            trees: self.trees,
            blobs: self.blobs,
            stats: self.stats,
        }
    }
}

pub struct TreeBuilder<'a> {
    options: BuildOptions,
    prior: Option<&'a dyn ObjectStore>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(options: BuildOptions) -> Self {
        Self {
            options,
            prior: None,
        }
    }

    /// Store holding the prior snapshot's trees, consulted for metadata reuse.
    pub fn with_prior(mut self, store: &'a dyn ObjectStore) -> Self {
        self.prior = Some(store);
        self
    }

    /// Builds the tree of a single directory; its tree becomes the root.
    pub async fn build(&self, path: &Path, prior_root: Option<Digest>) -> Result<BuildOutput> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let excludes = self.excludes(path)?;
        let mut state = ScanState::default();
        let (root, _) = self
            .build_dir(&mut state, path, prior_root, &excludes)
            .await?;

        info!(
            root = %root,
            files = state.stats.files,
            dirs = state.stats.dirs,
            reused = state.stats.reused,
            "Scanned {}",
            path.display()
        );
        Ok(state.finish(root))
    }

    /// Builds several directories under one synthetic root tree whose entries
    /// are the given names.
    pub async fn build_roots(
        &self,
        roots: &[(String, PathBuf)],
        prior_root: Option<Digest>,
    ) -> Result<BuildOutput> {
        let prior_tree = match prior_root {
            Some(digest) => self.prior_tree(&digest).await,
            None => None,
        };

        let mut state = ScanState::default();
        let mut tree = Tree::new();
        let mut height = 0;

        for (name, path) in roots {
            if tree.get(name).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "backup root name '{}' is used twice",
                    name
                )));
            }
            let metadata = tokio::fs::metadata(path).await?;
            if !metadata.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a directory",
                    path.display()
                )));
            }

            let previous = prior_tree
                .as_ref()
                .and_then(|prior| prior.get(name))
                .filter(|entry| entry.is_dir())
                .map(|entry| entry.digest);
            let excludes = self.excludes(path)?;
            let (digest, sub_height) = self
                .build_dir(&mut state, path, previous, &excludes)
                .await?;
            height = height.max(sub_height + 1);

            let meta = entry_meta(&metadata, EntryKind::Directory);
            tree.insert(name.clone(), TreeEntry::new(EntryKind::Directory, digest, meta))?;
        }

        let root = state.add_tree(&tree, height, Path::new(""));
        info!(
            root = %root,
            roots = roots.len(),
            files = state.stats.files,
            reused = state.stats.reused,
            "Scanned backup roots"
        );
        Ok(state.finish(root))
    }

    fn build_dir<'s>(
        &'s self,
        state: &'s mut ScanState,
        path: &'s Path,
        prior: Option<Digest>,
        excludes: &'s Gitignore,
    ) -> BoxFuture<'s, Result<(Digest, u32)>> {
        Box::pin(async move {
            let mut read_dir = tokio::fs::read_dir(path).await?;
            state.stats.dirs += 1;
            let prior_tree = match prior {
                Some(digest) => self.prior_tree(&digest).await,
                None => None,
            };

            let mut tree = Tree::new();
            let mut height = 0;
            let mut to_hash = Vec::new();

            while let Some(dirent) = read_dir.next_entry().await? {
                let child = dirent.path();
                let name = match dirent.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => {
                        warn!("Skipping {}: name is not valid UTF-8", child.display());
                        state.stats.skipped += 1;
                        continue;
                    }
                };

                let metadata = match tokio::fs::symlink_metadata(&child).await {
                    Ok(metadata) => metadata,
                    Err(e) if is_vanished(&e) => {
                        warn!("Skipping {}: {}", child.display(), e);
                        state.stats.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let kind = entry_kind(&metadata);
                if excludes
                    .matched(&child, kind == EntryKind::Directory)
                    .is_ignore()
                {
                    debug!("Excluded {}", child.display());
                    continue;
                }

                let meta = entry_meta(&metadata, kind);
                let previous = prior_tree
                    .as_ref()
                    .and_then(|prior| prior.get(&name))
                    .filter(|entry| entry.kind == kind);

                match kind {
                    EntryKind::Directory => {
                        let built = self
                            .build_dir(state, &child, previous.map(|entry| entry.digest), excludes)
                            .await;
                        match built {
                            Ok((digest, sub_height)) => {
                                height = height.max(sub_height + 1);
                                tree.insert(name, TreeEntry::new(kind, digest, meta))?;
                            }
                            Err(Error::Io(e)) if is_vanished(&e) => {
                                warn!("Skipping directory {}: {}", child.display(), e);
                                state.stats.skipped += 1;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    EntryKind::File => match previous.filter(|entry| entry.meta == meta) {
                        Some(entry) => {
                            state.stats.files += 1;
                            state.stats.reused += 1;
                            state.add_blob(entry.digest, BlobSource::File(child), meta.size);
                            tree.insert(name, entry.clone())?;
                        }
                        None => to_hash.push((name, child, meta)),
                    },
                    EntryKind::Symlink => {
                        let target = match tokio::fs::read_link(&child).await {
                            Ok(target) => target,
                            Err(e) if is_vanished(&e) => {
                                warn!("Skipping {}: {}", child.display(), e);
                                state.stats.skipped += 1;
                                continue;
                            }
                            Err(e) => return Err(e.into()),
                        };
                        let data = Bytes::from(link_bytes(&target));
                        let digest = hasher::digest_of(&data);
                        let size = data.len() as u64;
                        state.stats.symlinks += 1;
                        state.add_blob(digest, BlobSource::Inline(data), size);
                        tree.insert(name, TreeEntry::new(kind, digest, EntryMeta { size, ..meta }))?;
                    }
                    EntryKind::Fifo
                    | EntryKind::Socket
                    | EntryKind::CharDevice
                    | EntryKind::BlockDevice => {
                        state.stats.special += 1;
                        let meta = EntryMeta { size: 0, ..meta };
                        tree.insert(name, TreeEntry::new(kind, Digest::empty(), meta))?;
                    }
                }
            }

            let hashed: Vec<_> = stream::iter(to_hash)
                .map(|(name, child, meta)| async move {
                    let result = hasher::digest_file(&child).await;
                    (name, child, meta, result)
                })
                .buffer_unordered(self.options.concurrency.max(1))
                .collect()
                .await;

            for (name, child, meta, result) in hashed {
                match result {
                    Ok((digest, size)) => {
                        state.stats.files += 1;
                        state.stats.bytes_hashed += size;
                        state.add_blob(digest, BlobSource::File(child), size);
                        let meta = EntryMeta { size, ..meta };
                        tree.insert(name, TreeEntry::new(EntryKind::File, digest, meta))?;
                    }
                    Err(Error::Io(e)) if is_vanished(&e) => {
                        warn!("Skipping {}: {}", child.display(), e);
                        state.stats.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            let digest = state.add_tree(&tree, height, path);
            debug!(digest = %digest, entries = tree.len(), "Built tree for {}", path.display());
            Ok((digest, height))
        })
    }

    async fn prior_tree(&self, digest: &Digest) -> Option<Tree> {
        let store = self.prior?;
        match store.get_tree(digest).await {
            Ok(tree) => Some(tree),
            Err(e) => {
                warn!(digest = %digest, "Prior tree unavailable, hashing from scratch: {}", e);
                None
            }
        }
    }

    fn excludes(&self, root: &Path) -> Result<Gitignore> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in &self.options.exclude {
            builder.add_line(None, pattern).map_err(|e| {
                Error::InvalidArgument(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
        }
        builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("invalid exclude patterns: {}", e)))
    }
}

fn is_vanished(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

#[cfg(unix)]
fn entry_kind(metadata: &Metadata) -> EntryKind {
    use std::os::unix::fs::FileTypeExt;

    let file_type = metadata.file_type();
    if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_fifo() {
        EntryKind::Fifo
    } else if file_type.is_socket() {
        EntryKind::Socket
    } else if file_type.is_char_device() {
        EntryKind::CharDevice
    } else {
        EntryKind::BlockDevice
    }
}

#[cfg(not(unix))]
fn entry_kind(metadata: &Metadata) -> EntryKind {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

/// Directory sizes are recorded as 0 so that tree digests do not depend on
/// how the filesystem allocates directory blocks.
#[cfg(unix)]
fn entry_meta(metadata: &Metadata, kind: EntryKind) -> EntryMeta {
    use std::os::unix::fs::MetadataExt;

    EntryMeta {
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: if kind == EntryKind::Directory {
            0
        } else {
            metadata.len()
        },
        mtime: metadata.mtime(),
        mtime_nsec: metadata.mtime_nsec() as u32,
    }
}

#[cfg(not(unix))]
fn entry_meta(metadata: &Metadata, kind: EntryKind) -> EntryMeta {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .unwrap_or_default();
    let mode = match (kind, metadata.permissions().readonly()) {
        (EntryKind::Directory, _) => 0o755,
        (_, true) => 0o444,
        (_, false) => 0o644,
    };

    EntryMeta {
        mode,
        uid: 0,
        gid: 0,
        size: if kind == EntryKind::Directory {
            0
        } else {
            metadata.len()
        },
        mtime: modified.as_secs() as i64,
        mtime_nsec: modified.subsec_nanos(),
    }
}

#[cfg(unix)]
fn link_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().into_owned().into_bytes()
}
