use crate::backend::{Backend, BackendType};
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use hashvault_core::hasher::{READ_SIZE, StreamHasher};
use hashvault_core::snapshot::{NewSnapshot, Snapshot, SnapshotLog};
use hashvault_core::store::{check_claim, ObjectStore};
use hashvault_core::{ClientId, Digest, Error, Result, SnapshotId, StoreConfig};
use std::collections::{BTreeSet, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const CONFIG_KEY: &str = "config";
const OBJECTS_PREFIX: &str = "objects";
const SNAPSHOTS_PREFIX: &str = "snapshots";
const STORE_FORMAT: &str = "hashvault-store";
/// Parallel existence checks in one `batch_has`.
const HAS_CONCURRENCY: usize = 32;
/// Attempts at claiming a snapshot id before reporting contention.
const APPEND_ATTEMPTS: usize = 16;
/// Spool files share the local backend's temp-file prefix so listings skip them.
const SPOOL_PREFIX: &str = ".tmp-spool-";

/// An object store and snapshot log on top of any [`Backend`].
///
/// # Layout
///
/// ```text
/// store/
/// ├── config                       # StoreConfig (JSON)
/// ├── objects/ab/abcdef…           # blobs and trees, keyed by digest
/// └── snapshots/<client>/<id>.json # one record per snapshot
/// ```
///
/// Objects and snapshot records are only ever created, never modified in
/// place. Both go through [`Backend::write_new`]: for objects a lost race
/// means identical bytes are already there, and for snapshots it means the
/// id was taken and the next one is tried.
pub struct BackendStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    retry: RetryConfig,
}

impl BackendStore {
    /// Creates a new, empty store. Fails with [`Error::StoreExists`] if the
    /// backend already holds one.
    pub async fn init(backend: Arc<dyn Backend>) -> Result<Self> {
        backend.init().await?;
        let location = backend.location();

        let config = StoreConfig::default();
        let data = serde_json::to_vec_pretty(&config)?;
        if !backend.write_new(CONFIG_KEY, Bytes::from(data)).await? {
            return Err(Error::StoreExists { path: location });
        }

        info!(store = %config.id, "Initialized store at {}", location);
        let retry = default_retry(backend.backend_type());
        Ok(Self {
            backend,
            config,
            retry,
        })
    }

    pub async fn open(backend: Arc<dyn Backend>) -> Result<Self> {
        let location = backend.location();
        let data = backend
            .read(CONFIG_KEY)
            .await?
            .ok_or_else(|| Error::StoreNotFound {
                path: location.clone(),
            })?;

        let config: StoreConfig = serde_json::from_slice(&data)?;
        if config.version != StoreConfig::VERSION {
            return Err(Error::UnsupportedFormat {
                format: STORE_FORMAT.to_string(),
                version: config.version,
            });
        }
        if !config.has_valid_layout() {
            return Err(Error::InvalidArgument(format!(
                "store {} has an unusable object layout: shard width {}, depth {}",
                location, config.shard_width, config.shard_depth
            )));
        }

        debug!(store = %config.id, "Opened store at {}", location);
        let retry = default_retry(backend.backend_type());
        Ok(Self {
            backend,
            config,
            retry,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Ends in `/` so that listing `laptop` does not also match `laptop-2`.
    fn snapshot_prefix(client: &ClientId) -> String {
        format!("{}/{}/", SNAPSHOTS_PREFIX, client)
    }

    fn snapshot_key(client: &ClientId, id: SnapshotId) -> String {
        format!("{}{:020}.json", Self::snapshot_prefix(client), id)
    }

    /// Copies `source` into a private spool file, hashing it on the way. The
    /// upload then reads the spool, so a source modified mid-upload cannot
    /// end up stored under a stale digest.
    async fn spool(&self, digest: &Digest, source: &Path) -> Result<(NamedTempFile, u64)> {
        let dir = self.backend.spool_dir();
        let source = source.to_path_buf();
        let digest = *digest;

        tokio::task::spawn_blocking(move || spool_file(&digest, &source, dir.as_deref()))
            .await
            .map_err(|e| Error::Other(format!("spool task failed: {}", e)))?
    }

    fn parse_snapshot_id(key: &str) -> Option<SnapshotId> {
        key.rsplit('/').next()?.strip_suffix(".json")?.parse().ok()
    }

    async fn snapshot_ids(&self, client: &ClientId) -> Result<Vec<SnapshotId>> {
        let prefix = Self::snapshot_prefix(client);
        let keys = retry_with_backoff(&self.retry, "list snapshots", || {
            self.backend.list(&prefix)
        })
        .await?;
        let mut ids: Vec<SnapshotId> = keys
            .iter()
            .filter_map(|key| Self::parse_snapshot_id(key))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn read_snapshot(&self, client: &ClientId, id: SnapshotId) -> Result<Option<Snapshot>> {
        let key = Self::snapshot_key(client, id);
        let data = retry_with_backoff(&self.retry, "read snapshot", || self.backend.read(&key))
            .await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}

fn spool_file(digest: &Digest, source: &Path, dir: Option<&Path>) -> Result<(NamedTempFile, u64)> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(SPOOL_PREFIX);
    let mut spool = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            builder.tempfile_in(dir)?
        }
        None => builder.tempfile()?,
    };

    let mut input = std::fs::File::open(source)?;
    let mut hasher = StreamHasher::new();
    let mut buffer = vec![0u8; READ_SIZE];
    loop {
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        spool.write_all(&buffer[..n])?;
    }
    spool.as_file().sync_all()?;

    let actual = hasher.finalize();
    if actual != *digest {
        warn!(digest = %digest, actual = %actual, "Rejected upload of {}", source.display());
        return Err(Error::Corruption {
            digest: *digest,
            actual,
        });
    }
    Ok((spool, hasher.bytes_hashed()))
}

fn default_retry(backend_type: BackendType) -> RetryConfig {
    match backend_type {
        BackendType::Local => RetryConfig::none(),
        BackendType::S3 => RetryConfig::persistent(),
    }
}

#[async_trait]
impl ObjectStore for BackendStore {
    async fn has(&self, digest: &Digest) -> Result<bool> {
        let key = self.config.object_key(digest);
        retry_with_backoff(&self.retry, "has", || self.backend.exists(&key)).await
    }

    async fn batch_has(&self, digests: &[Digest]) -> Result<HashSet<Digest>> {
        let checked: Vec<(Digest, bool)> = stream::iter(digests.iter().copied())
            .map(|digest| async move { Ok::<_, Error>((digest, self.has(&digest).await?)) })
            .buffer_unordered(HAS_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(checked
            .into_iter()
            .filter_map(|(digest, present)| present.then_some(digest))
            .collect())
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<()> {
        check_claim(digest, &data)?;
        let key = self.config.object_key(digest);
        let created = retry_with_backoff(&self.retry, "put", || {
            self.backend.write_new(&key, data.clone())
        })
        .await?;
        if created {
            debug!(digest = %digest, size = data.len(), "Stored object");
        }
        Ok(())
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let key = self.config.object_key(digest);
        retry_with_backoff(&self.retry, "get", || self.backend.read(&key))
            .await?
            .ok_or(Error::ObjectNotFound { digest: *digest })
    }

    async fn put_file(&self, digest: &Digest, path: &Path) -> Result<u64> {
        let key = self.config.object_key(digest);
        let (spool, size) = self.spool(digest, path).await?;
        let spooled: PathBuf = spool.path().to_path_buf();

        let created = retry_with_backoff(&self.retry, "put file", || {
            self.backend.write_new_file(&key, &spooled)
        })
        .await?;
        drop(spool);
        if created {
            debug!(digest = %digest, size, "Stored object from {}", path.display());
        }
        Ok(size)
    }

    async fn get_into(
        &self,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let key = self.config.object_key(digest);
        let mut chunks = retry_with_backoff(&self.retry, "get", || self.backend.read_stream(&key))
            .await?
            .ok_or(Error::ObjectNotFound { digest: *digest })?;

        let mut hasher = StreamHasher::new();
        while let Some(chunk) = chunks.try_next().await? {
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
        }

        let actual = hasher.finalize();
        if actual != *digest {
            return Err(Error::Corruption {
                digest: *digest,
                actual,
            });
        }
        Ok(hasher.bytes_hashed())
    }

    async fn list(&self) -> Result<Vec<Digest>> {
        let keys = retry_with_backoff(&self.retry, "list objects", || {
            self.backend.list(OBJECTS_PREFIX)
        })
        .await?;

        let mut digests = Vec::with_capacity(keys.len());
        for key in keys {
            match key.rsplit('/').next().map(str::parse::<Digest>) {
                Some(Ok(digest)) => digests.push(digest),
                _ => warn!(key = %key, "Ignoring unexpected key in object area"),
            }
        }
        digests.sort();
        Ok(digests)
    }

    async fn delete(&self, digest: &Digest) -> Result<bool> {
        let key = self.config.object_key(digest);
        retry_with_backoff(&self.retry, "delete", || self.backend.delete(&key)).await
    }
}

#[async_trait]
impl SnapshotLog for BackendStore {
    async fn append_snapshot(&self, snapshot: NewSnapshot) -> Result<Snapshot> {
        for _ in 0..APPEND_ATTEMPTS {
            let next = self
                .snapshot_ids(&snapshot.client)
                .await?
                .last()
                .map_or(1, |last| last + 1);
            let record = snapshot.clone().into_snapshot(next);
            let key = Self::snapshot_key(&record.client, next);
            let data = Bytes::from(serde_json::to_vec_pretty(&record)?);

            let created = retry_with_backoff(&self.retry, "append snapshot", || {
                self.backend.write_new(&key, data.clone())
            })
            .await?;
            if created {
                return Ok(record);
            }
            debug!(client = %record.client, id = next, "Snapshot id taken concurrently, retrying");
        }

        Err(Error::Transport(format!(
            "could not claim a snapshot id for {} after {} attempts",
            snapshot.client, APPEND_ATTEMPTS
        )))
    }

    async fn snapshots(&self, client: &ClientId) -> Result<Vec<Snapshot>> {
        let mut records = Vec::new();
        for id in self.snapshot_ids(client).await? {
            if let Some(record) = self.read_snapshot(client, id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn snapshot(&self, client: &ClientId, id: SnapshotId) -> Result<Snapshot> {
        self.read_snapshot(client, id)
            .await?
            .ok_or_else(|| Error::SnapshotNotFound {
                client: client.clone(),
                id,
            })
    }

    async fn snapshot_clients(&self) -> Result<Vec<ClientId>> {
        let keys = retry_with_backoff(&self.retry, "list clients", || {
            self.backend.list(SNAPSHOTS_PREFIX)
        })
        .await?;

        let clients: BTreeSet<ClientId> = keys
            .iter()
            .filter_map(|key| key.split('/').nth(1))
            .filter_map(|name| ClientId::new(name).ok())
            .collect();
        Ok(clients.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBackend;
    use hashvault_core::store::ObjectStoreExt;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> BackendStore {
        BackendStore::init(Arc::new(LocalBackend::new(dir.path())))
            .await
            .unwrap()
            .with_retry(RetryConfig::none())
    }

    fn client() -> ClientId {
        ClientId::new("db-01").unwrap()
    }

    #[tokio::test]
    async fn test_init_and_open() {
        let dir = TempDir::new().unwrap();
        let created = store(&dir).await;

        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        let opened = BackendStore::open(backend.clone()).await.unwrap();
        assert_eq!(opened.config(), created.config());

        let err = BackendStore::init(backend).await.err().unwrap();
        assert!(matches!(err, Error::StoreExists { .. }));
    }

    #[tokio::test]
    async fn test_open_without_store_fails() {
        let dir = TempDir::new().unwrap();
        let err = BackendStore::open(Arc::new(LocalBackend::new(dir.path())))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::StoreNotFound { .. }));
    }

    #[tokio::test]
    async fn test_objects_are_sharded_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let data = Bytes::from_static(b"sharded");
        let digest = Digest::of(&data);

        store.put(&digest, data.clone()).await.unwrap();
        store.put(&digest, data.clone()).await.unwrap();

        let hex = digest.to_hex();
        assert!(dir.path().join("objects").join(&hex[..2]).join(&hex).is_file());
        assert_eq!(store.get_verified(&digest).await.unwrap(), data);
        assert_eq!(store.list().await.unwrap(), vec![digest]);
    }

    #[tokio::test]
    async fn test_mismatched_put_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let claimed = Digest::of(b"claimed");

        let err = store.put(&claimed, Bytes::from_static(b"actual")).await.unwrap_err();
        assert!(err.is_corruption());
        assert!(!store.has(&claimed).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_has_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let present = Digest::of(b"p");
        store.put(&present, Bytes::from_static(b"p")).await.unwrap();
        let absent = Digest::of(b"a");

        assert_eq!(
            store.batch_has(&[present, absent]).await.unwrap(),
            HashSet::from([present])
        );
        assert!(store.delete(&present).await.unwrap());
        assert!(!store.delete(&present).await.unwrap());
        assert!(store.get(&present).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_snapshot_ids_are_sequential() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let root = Digest::of(b"root");

        let first = store
            .append_snapshot(NewSnapshot::new(client(), root))
            .await
            .unwrap();
        let second = store
            .append_snapshot(NewSnapshot::new(client(), root).with_parent(Some(first.id)))
            .await
            .unwrap();
        store
            .append_snapshot(NewSnapshot::new(ClientId::new("web").unwrap(), root))
            .await
            .unwrap();

        assert_eq!((first.id, second.id), (1, 2));
        let listed = store.snapshots(&client()).await.unwrap();
        assert_eq!(listed, vec![first, second.clone()]);
        assert_eq!(store.snapshot(&client(), 2).await.unwrap(), second);
        assert!(store.snapshot(&client(), 9).await.unwrap_err().is_not_found());
        assert_eq!(
            store.snapshot_clients().await.unwrap(),
            vec![client(), ClientId::new("web").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir).await);
        let root = Digest::of(b"root");

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.append_snapshot(NewSnapshot::new(client(), root)).await
                })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_open_rejects_unusable_layout() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        BackendStore::init(backend.clone()).await.unwrap();

        let broken = StoreConfig {
            shard_width: 40,
            shard_depth: 2,
            ..StoreConfig::default()
        };
        backend
            .write(CONFIG_KEY, Bytes::from(serde_json::to_vec(&broken).unwrap()))
            .await
            .unwrap();

        let err = BackendStore::open(backend).await.err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_put_file_and_get_into_stream() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let source = TempDir::new().unwrap();
        let path = source.path().join("large.bin");
        let data: Vec<u8> = (0..READ_SIZE * 3 + 5).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let digest = Digest::of(&data);

        assert_eq!(store.put_file(&digest, &path).await.unwrap(), data.len() as u64);
        assert_eq!(store.put_file(&digest, &path).await.unwrap(), data.len() as u64);
        assert_eq!(store.list().await.unwrap(), vec![digest]);

        let mut restored = Vec::new();
        let written = store.get_into(&digest, &mut restored).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_put_file_rejects_changed_source() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let source = TempDir::new().unwrap();
        let path = source.path().join("file");
        std::fs::write(&path, b"edited after scan").unwrap();
        let claimed = Digest::of(b"as scanned");

        let err = store.put_file(&claimed, &path).await.unwrap_err();
        assert!(err.is_corruption());
        assert!(!store.has(&claimed).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(SPOOL_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_get_into_detects_tampered_object() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let data = Bytes::from_static(b"original object");
        let digest = Digest::of(&data);
        store.put(&digest, data).await.unwrap();

        let on_disk = dir.path().join(store.config().object_key(&digest));
        std::fs::write(&on_disk, b"flipped bits").unwrap();

        let mut sink = Vec::new();
        let err = store.get_into(&digest, &mut sink).await.unwrap_err();
        assert!(err.is_corruption());
        assert!(store
            .get_into(&Digest::of(b"absent"), &mut sink)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_clients_sharing_a_name_prefix_are_separate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let laptop = ClientId::new("laptop").unwrap();
        let laptop_2 = ClientId::new("laptop-2").unwrap();
        let root = Digest::of(b"root");

        for _ in 0..3 {
            store
                .append_snapshot(NewSnapshot::new(laptop_2.clone(), root))
                .await
                .unwrap();
        }
        let first = store
            .append_snapshot(NewSnapshot::new(laptop.clone(), root))
            .await
            .unwrap();

        assert_eq!(BackendStore::snapshot_prefix(&laptop), "snapshots/laptop/");
        assert_eq!(first.id, 1);
        assert_eq!(store.snapshots(&laptop).await.unwrap(), vec![first]);
        assert_eq!(store.snapshots(&laptop_2).await.unwrap().len(), 3);
    }
}
