use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use hashvault_core::Result;
use std::path::{Path, PathBuf};

/// A value read back in chunks, so large objects never sit in memory whole.
pub type ByteChunks = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    S3,
}

/// Raw key/value storage underneath a [`crate::BackendStore`].
///
/// Keys are `/`-separated relative paths. A write must become visible to
/// readers atomically: a concurrent `read` returns either nothing or the
/// complete value.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// `None` if nothing is stored under `key`.
    async fn read(&self, key: &str) -> Result<Option<Bytes>>;

    /// Creates or replaces `key`.
    async fn write(&self, key: &str, data: Bytes) -> Result<()>;

    /// Creates `key` only if it does not exist yet. Returns `false`, leaving
    /// the existing value untouched, when it does.
    async fn write_new(&self, key: &str, data: Bytes) -> Result<bool>;

    /// [`Backend::write_new`] with the value taken from a complete local file,
    /// which must not change during the call.
    async fn write_new_file(&self, key: &str, file: &Path) -> Result<bool>;

    /// Streaming [`Backend::read`].
    async fn read_stream(&self, key: &str) -> Result<Option<ByteChunks>>;

    /// Where uploads are spooled before `write_new_file`. Backends that can
    /// link a file into place return a directory on their own filesystem;
    /// `None` means the system temp directory.
    fn spool_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every key below `prefix`, recursively, in sorted order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend_type(&self) -> BackendType;

    /// Human-readable location, used in errors and logs.
    fn location(&self) -> String;
}
