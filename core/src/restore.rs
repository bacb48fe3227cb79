//! Materializes trees back onto the filesystem.

use crate::snapshot::Snapshot;
use crate::store::{ObjectStore, ObjectStoreExt};
use crate::tree::{EntryKind, EntryMeta, TreeEntry};
use crate::walk::{self, Closure};
use crate::{Digest, Error, Result};
use futures::future::BoxFuture;
use std::io;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Which stored attributes are reapplied, and whether existing files may be
/// replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    pub permissions: bool,
    /// Requires privileges to change owners; off by default.
    pub ownership: bool,
    pub times: bool,
    pub overwrite: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            permissions: true,
            ownership: false,
            times: true,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub fifos: u64,
    /// Sockets and device nodes, which are never recreated.
    pub skipped: u64,
    pub bytes_written: u64,
}

pub struct Restorer<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    options: RestoreOptions,
}

impl<'a, S: ObjectStore + ?Sized> Restorer<'a, S> {
    pub fn new(store: &'a S, options: RestoreOptions) -> Self {
        Self { store, options }
    }

    pub async fn restore_snapshot(&self, snapshot: &Snapshot, target: &Path) -> Result<RestoreStats> {
        info!(
            client = %snapshot.client,
            id = snapshot.id,
            "Restoring snapshot to {}",
            target.display()
        );
        self.restore_tree(&snapshot.root, target).await
    }

    /// Restores the contents of tree `root` into `target`.
    ///
    /// Every reachable object is checked first; if anything is missing the
    /// call fails with [`Error::ObjectNotFound`] before `target` is touched.
    pub async fn restore_tree(&self, root: &Digest, target: &Path) -> Result<RestoreStats> {
        let closure = walk::closure(self.store, root).await?;
        closure.ensure_complete()?;

        tokio::fs::create_dir_all(target).await?;
        let mut stats = RestoreStats::default();
        self.restore_dir(&closure, root, target, &mut stats).await?;

        info!(
            files = stats.files,
            dirs = stats.dirs,
            bytes = stats.bytes_written,
            "Restored {}",
            target.display()
        );
        Ok(stats)
    }

    /// Restores the single entry at `path` (relative to `root`) as
    /// `target/<entry name>`.
    pub async fn restore_path(&self, root: &Digest, path: &str, target: &Path) -> Result<RestoreStats> {
        let (name, entry) = walk::resolve_path(self.store, root, path).await?;

        let closure = if entry.is_dir() {
            walk::closure(self.store, &entry.digest).await?
        } else {
            let mut single = Closure::new(entry.digest);
            if entry.kind.has_content() {
                single.blobs.insert(entry.digest);
                single.missing = self.store.missing(&[entry.digest]).await?;
            }
            single
        };
        closure.ensure_complete()?;

        tokio::fs::create_dir_all(target).await?;
        let mut stats = RestoreStats::default();
        self.restore_entry(&closure, &entry, &target.join(&name), &mut stats)
            .await?;
        Ok(stats)
    }

    fn restore_dir<'s>(
        &'s self,
        closure: &'s Closure,
        digest: &'s Digest,
        dir: &'s Path,
        stats: &'s mut RestoreStats,
    ) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            let tree = closure.tree(digest)?;
            for (name, entry) in tree.entries() {
                self.restore_entry(closure, entry, &dir.join(name), stats)
                    .await?;
            }
            Ok(())
        })
    }

    async fn restore_entry(
        &self,
        closure: &Closure,
        entry: &TreeEntry,
        path: &Path,
        stats: &mut RestoreStats,
    ) -> Result<()> {
        match entry.kind {
            EntryKind::Directory => {
                if !self.reuse_directory(path).await? {
                    tokio::fs::create_dir(path).await?;
                }
                self.restore_dir(closure, &entry.digest, path, stats).await?;
                stats.dirs += 1;
            }
            EntryKind::File => {
                self.clear_existing(path).await?;
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .await?;
                let written = self.store.get_into(&entry.digest, &mut file).await?;
                file.flush().await?;
                stats.files += 1;
                stats.bytes_written += written;
            }
            EntryKind::Symlink => {
                let target = self.store.get_verified(&entry.digest).await?;
                self.clear_existing(path).await?;
                create_symlink(&target, path).await?;
                stats.symlinks += 1;
            }
            EntryKind::Fifo => {
                self.clear_existing(path).await?;
                create_fifo(path, entry.meta.mode)?;
                stats.fifos += 1;
            }
            EntryKind::Socket | EntryKind::CharDevice | EntryKind::BlockDevice => {
                warn!("Not restoring {:?} at {}", entry.kind, path.display());
                stats.skipped += 1;
                return Ok(());
            }
        }

        self.apply_meta(path, entry.kind, &entry.meta).await
    }

    /// With `overwrite`, unlinks whatever non-directory occupies `path` so the
    /// entry is created fresh and never written through a symlink.
    async fn clear_existing(&self, path: &Path) -> Result<()> {
        if !self.options.overwrite {
            return Ok(());
        }
        let existing = match tokio::fs::symlink_metadata(path).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if existing.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", path.display()),
            )));
        }
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    /// Whether an existing real directory at `path` may be restored into.
    /// Symlinks and other entries are unlinked first when overwriting.
    async fn reuse_directory(&self, path: &Path) -> Result<bool> {
        if !self.options.overwrite {
            return Ok(false);
        }
        match tokio::fs::symlink_metadata(path).await {
            Ok(existing) if existing.is_dir() => Ok(true),
            Ok(_) => {
                tokio::fs::remove_file(path).await?;
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ownership first, then times, then permissions: changing the owner can
    /// clear set-id bits and a restrictive mode can block opening the entry.
    async fn apply_meta(&self, path: &Path, kind: EntryKind, meta: &EntryMeta) -> Result<()> {
        if self.options.ownership {
            set_owner(path, meta.uid, meta.gid)?;
        }
        if kind == EntryKind::Symlink {
            return Ok(());
        }
        if self.options.times {
            set_mtime(path, meta.mtime, meta.mtime_nsec).await?;
        }
        if self.options.permissions {
            set_mode(path, meta.mode).await?;
        }
        debug!("Applied metadata to {}", path.display());
        Ok(())
    }
}

#[cfg(unix)]
async fn create_symlink(target: &[u8], path: &Path) -> Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    tokio::fs::symlink(OsStr::from_bytes(target), path).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(_target: &[u8], path: &Path) -> Result<()> {
    warn!("Symlinks are not supported here, skipping {}", path.display());
    Ok(())
}

#[cfg(unix)]
fn create_fifo(path: &Path, mode: u32) -> Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(mode as nix::libc::mode_t))
        .map_err(|errno| Error::Io(io::Error::from(errno)))
}

#[cfg(not(unix))]
fn create_fifo(path: &Path, _mode: u32) -> Result<()> {
    Err(Error::InvalidArgument(format!(
        "cannot create FIFO {} on this platform",
        path.display()
    )))
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: u32, _gid: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

async fn set_mtime(path: &Path, secs: i64, nsec: u32) -> Result<()> {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let offset = Duration::new(secs.unsigned_abs(), 0);
    let base = if secs >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    let Some(mtime) = base.and_then(|t: SystemTime| t.checked_add(Duration::from_nanos(nsec.into())))
    else {
        warn!("Modification time of {} is out of range", path.display());
        return Ok(());
    };

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        let file = open_for_times(&path)?;
        file.set_times(std::fs::FileTimes::new().set_modified(mtime))
    })
    .await
    .map_err(|e| Error::Other(format!("metadata task failed: {}", e)))??;
    Ok(())
}

/// Opens without blocking so that FIFOs can be handled like any other entry,
/// and without following a symlink planted in place of the entry.
#[cfg(unix)]
fn open_for_times(path: &Path) -> io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_NOFOLLOW)
        .open(path)
}

#[cfg(not(unix))]
fn open_for_times(path: &Path) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new().write(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildOptions, TreeBuilder};
    use crate::memory::MemoryStore;
    use crate::sync::SyncNegotiator;
    use std::fs;
    use tempfile::TempDir;

    async fn backed_up(source: &Path, store: &MemoryStore) -> Digest {
        let output = TreeBuilder::new(BuildOptions::default())
            .build(source, None)
            .await
            .unwrap();
        SyncNegotiator::new(store).sync(&output).await.unwrap();
        output.root
    }

    fn source() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc/conf.d")).unwrap();
        fs::write(dir.path().join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();
        fs::write(dir.path().join("etc/conf.d/net"), b"dhcp").unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_restores_contents() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;

        let dst = TempDir::new().unwrap();
        let stats = Restorer::new(&store, RestoreOptions::default())
            .restore_tree(&root, dst.path())
            .await
            .unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 2);
        assert_eq!(
            fs::read(dst.path().join("etc/hosts")).unwrap(),
            b"127.0.0.1 localhost\n"
        );
        assert_eq!(fs::read(dst.path().join("etc/conf.d/net")).unwrap(), b"dhcp");
        assert!(fs::read(dst.path().join("empty")).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restores_mode_mtime_symlink_and_fifo() {
        use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};

        let src = source();
        let script = src.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        std::os::unix::fs::symlink("etc/hosts", src.path().join("hosts-link")).unwrap();
        create_fifo(&src.path().join("pipe"), 0o600).unwrap();

        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;
        let dst = TempDir::new().unwrap();
        Restorer::new(&store, RestoreOptions::default())
            .restore_tree(&root, dst.path())
            .await
            .unwrap();

        let original = fs::metadata(&script).unwrap();
        let restored = fs::metadata(dst.path().join("run.sh")).unwrap();
        assert_eq!(restored.mode() & 0o7777, 0o750);
        assert_eq!(restored.mtime(), original.mtime());
        assert_eq!(restored.mtime_nsec(), original.mtime_nsec());

        let etc = fs::metadata(dst.path().join("etc")).unwrap();
        assert_eq!(etc.mtime(), fs::metadata(src.path().join("etc")).unwrap().mtime());

        let link = fs::read_link(dst.path().join("hosts-link")).unwrap();
        assert_eq!(link, Path::new("etc/hosts"));
        let pipe = fs::symlink_metadata(dst.path().join("pipe")).unwrap();
        assert!(pipe.file_type().is_fifo());
    }

    #[tokio::test]
    async fn test_missing_object_fails_before_writing() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;
        store.delete(&Digest::of(b"dhcp")).await.unwrap();

        let dst = TempDir::new().unwrap();
        let target = dst.path().join("restore");
        let err = Restorer::new(&store, RestoreOptions::default())
            .restore_tree(&root, &target)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_corrupt_object_aborts_restore() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;
        store
            .tamper(&Digest::of(b"dhcp"), bytes::Bytes::from_static(b"dhcq"))
            .await;

        let dst = TempDir::new().unwrap();
        let err = Restorer::new(&store, RestoreOptions::default())
            .restore_tree(&root, dst.path())
            .await
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_restores_a_single_path() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;
        let restorer = Restorer::new(&store, RestoreOptions::default());

        let dst = TempDir::new().unwrap();
        restorer.restore_path(&root, "etc/conf.d", dst.path()).await.unwrap();
        assert_eq!(fs::read(dst.path().join("conf.d/net")).unwrap(), b"dhcp");
        assert!(!dst.path().join("etc").exists());

        restorer.restore_path(&root, "etc/hosts", dst.path()).await.unwrap();
        assert!(dst.path().join("hosts").is_file());
    }

    #[tokio::test]
    async fn test_existing_files_are_kept_unless_overwrite() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;

        let dst = TempDir::new().unwrap();
        fs::write(dst.path().join("empty"), b"local edits").unwrap();

        let err = Restorer::new(&store, RestoreOptions::default())
            .restore_tree(&root, dst.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));

        let overwrite = RestoreOptions {
            overwrite: true,
            ..Default::default()
        };
        Restorer::new(&store, overwrite)
            .restore_tree(&root, dst.path())
            .await
            .unwrap();
        assert!(fs::read(dst.path().join("empty")).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_replaces_symlink_without_following_it() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("f"), b"from backup").unwrap();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;

        let elsewhere = TempDir::new().unwrap();
        let victim = elsewhere.path().join("victim");
        fs::write(&victim, b"precious").unwrap();
        let dst = TempDir::new().unwrap();
        std::os::unix::fs::symlink(&victim, dst.path().join("f")).unwrap();

        let overwrite = RestoreOptions {
            overwrite: true,
            ..Default::default()
        };
        Restorer::new(&store, overwrite)
            .restore_tree(&root, dst.path())
            .await
            .unwrap();

        assert_eq!(fs::read(&victim).unwrap(), b"precious");
        let restored = fs::symlink_metadata(dst.path().join("f")).unwrap();
        assert!(restored.file_type().is_file());
        assert_eq!(fs::read(dst.path().join("f")).unwrap(), b"from backup");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_does_not_descend_through_symlinked_directory() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;

        let elsewhere = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), dst.path().join("etc")).unwrap();

        let overwrite = RestoreOptions {
            overwrite: true,
            ..Default::default()
        };
        Restorer::new(&store, overwrite)
            .restore_tree(&root, dst.path())
            .await
            .unwrap();

        assert_eq!(fs::read_dir(elsewhere.path()).unwrap().count(), 0);
        let etc = fs::symlink_metadata(dst.path().join("etc")).unwrap();
        assert!(etc.file_type().is_dir());
        assert_eq!(fs::read(dst.path().join("etc/conf.d/net")).unwrap(), b"dhcp");
    }

    #[tokio::test]
    async fn test_overwrite_refuses_to_replace_directory_with_file() {
        let src = source();
        let store = MemoryStore::new();
        let root = backed_up(src.path(), &store).await;

        let dst = TempDir::new().unwrap();
        fs::create_dir(dst.path().join("empty")).unwrap();

        let overwrite = RestoreOptions {
            overwrite: true,
            ..Default::default()
        };
        let err = Restorer::new(&store, overwrite)
            .restore_tree(&root, dst.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert!(dst.path().join("empty").is_dir());
    }
}
