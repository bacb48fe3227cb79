use crate::backend::{Backend, BackendType, ByteChunks};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use hashvault_core::hasher::READ_SIZE;
use hashvault_core::{Error, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;
use walkdir::WalkDir;

const TEMP_PREFIX: &str = ".tmp-";

/// Stores each key as a file below `base_path`.
///
/// Writes go to a temporary file in the destination directory and are then
/// renamed (or hard-linked, for `write_new`) into place, so a key is never
/// visible half-written. Spooled uploads are linked in from the store root.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn target_dir(&self, full_path: &Path) -> Result<PathBuf> {
        let parent = full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&parent).await?;
        Ok(parent)
    }

    async fn stage(&self, key: &str, data: Bytes) -> Result<(NamedTempFile, PathBuf)> {
        let full_path = self.full_path(key);
        let parent = self.target_dir(&full_path).await?;

        let staged = tokio::task::spawn_blocking(move || -> io::Result<NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&parent)?;
            file.write_all(&data)?;
            file.as_file().sync_all()?;
            Ok(file)
        })
        .await
        .map_err(join_error)??;
        Ok((staged, full_path))
    }
}

/// Links `source` into place as `target`, copying when the two are on
/// different filesystems. `false` if `target` already exists.
fn link_new(source: &Path, target: &Path, parent: &Path) -> io::Result<bool> {
    match std::fs::hard_link(source, target) {
        Ok(()) => return Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
            ) =>
        {
            debug!("Cannot link {} ({}), copying", source.display(), e);
        }
        Err(e) => return Err(e),
    }

    let mut staged = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    let mut input = std::fs::File::open(source)?;
    io::copy(&mut input, &mut staged)?;
    staged.as_file().sync_all()?;
    match staged.persist_noclobber(target) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Other(format!("blocking task failed: {}", e))
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)).await?)
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.full_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let (staged, target) = self.stage(key, data).await?;
        tokio::task::spawn_blocking(move || staged.persist(&target).map(|_| ()))
            .await
            .map_err(join_error)?
            .map_err(|e| Error::Io(e.error))
    }

    async fn write_new(&self, key: &str, data: Bytes) -> Result<bool> {
        let (staged, target) = self.stage(key, data).await?;
        let persisted = tokio::task::spawn_blocking(move || staged.persist_noclobber(&target))
            .await
            .map_err(join_error)?;

        match persisted {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(key, "Key already present, keeping existing value");
                Ok(false)
            }
            Err(e) => Err(Error::Io(e.error)),
        }
    }

    async fn write_new_file(&self, key: &str, file: &Path) -> Result<bool> {
        let target = self.full_path(key);
        let parent = self.target_dir(&target).await?;
        let source = file.to_path_buf();

        let created = tokio::task::spawn_blocking(move || link_new(&source, &target, &parent))
            .await
            .map_err(join_error)??;
        if !created {
            debug!(key, "Key already present, keeping existing value");
        }
        Ok(created)
    }

    async fn read_stream(&self, key: &str) -> Result<Option<ByteChunks>> {
        let file = match fs::File::open(self.full_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let chunks = stream::try_unfold(file, |mut file| async move {
            let mut buffer = BytesMut::with_capacity(READ_SIZE);
            if file.read_buf(&mut buffer).await? == 0 {
                return Ok::<_, Error>(None);
            }
            Ok(Some((buffer.freeze(), file)))
        });
        Ok(Some(chunks.boxed()))
    }

    fn spool_dir(&self) -> Option<PathBuf> {
        Some(self.base_path.clone())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.base_path.clone();
        let root = self.full_path(prefix);

        let keys = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| {
                    Error::Io(
                        e.into_io_error()
                            .unwrap_or_else(|| io::Error::other("directory walk failed")),
                    )
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                let key: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                keys.push(key.join("/"));
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(join_error)??;

        Ok(keys)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    fn location(&self) -> String {
        self.base_path.display().to_string()
    }
}
