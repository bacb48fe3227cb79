use crate::store::Store;
use crate::walk;
use crate::{ClientId, Digest, Error, Result, SnapshotId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// An immutable record pinning a root tree for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub client: ClientId,
    pub root: Digest,
    pub time: DateTime<Utc>,
    pub parent: Option<SnapshotId>,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    pub fn summary(&self) -> String {
        format!(
            "#{} of {} - root {} on {} at {}",
            self.id,
            self.client,
            self.root.short_string(),
            self.hostname,
            self.time.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// A snapshot about to be committed. The id and timestamp are assigned by
/// the [`SnapshotLog`] on append.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub client: ClientId,
    pub root: Digest,
    pub parent: Option<SnapshotId>,
    pub hostname: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl NewSnapshot {
    pub fn new(client: ClientId, root: Digest) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            client,
            root,
            parent: None,
            hostname,
            description: None,
            tags: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: Option<SnapshotId>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_hostname(mut self, hostname: String) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Materializes the record under the id chosen by the log.
    pub fn into_snapshot(self, id: SnapshotId) -> Snapshot {
        Snapshot {
            id,
            client: self.client,
            root: self.root,
            time: Utc::now(),
            parent: self.parent,
            hostname: self.hostname,
            description: self.description,
            tags: self.tags,
        }
    }
}

/// Append-only, per-client snapshot storage.
///
/// `append_snapshot` assigns the next id for the client (1 for the first
/// record, never reused) and publishes the record atomically: a concurrent
/// reader observes either no record or the complete one. The log does not
/// check dependencies; [`SnapshotManager::create_snapshot`] does.
#[async_trait]
pub trait SnapshotLog: Send + Sync {
    async fn append_snapshot(&self, snapshot: NewSnapshot) -> Result<Snapshot>;

    /// All snapshots of `client`, ordered by id.
    async fn snapshots(&self, client: &ClientId) -> Result<Vec<Snapshot>>;

    async fn snapshot(&self, client: &ClientId, id: SnapshotId) -> Result<Snapshot>;

    async fn snapshot_clients(&self) -> Result<Vec<ClientId>>;
}

/// Commit protocol for snapshots: a record is only appended once every
/// object reachable from its root is present.
pub struct SnapshotManager<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> SnapshotManager<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn create_snapshot(&self, snapshot: NewSnapshot) -> Result<Snapshot> {
        if let Some(parent) = snapshot.parent {
            self.store.snapshot(&snapshot.client, parent).await?;
        }

        let closure = walk::closure(self.store, &snapshot.root).await?;
        if !closure.missing.is_empty() {
            warn!(
                client = %snapshot.client,
                root = %snapshot.root,
                missing = closure.missing.len(),
                "Refusing snapshot with unresolved dependencies"
            );
            return Err(Error::DependencyMissing {
                digest: snapshot.root,
                missing: closure.missing,
            });
        }

        let created = self.store.append_snapshot(snapshot).await?;
        info!(
            client = %created.client,
            id = created.id,
            root = %created.root,
            objects = closure.object_count(),
            "Snapshot committed"
        );
        Ok(created)
    }

    pub async fn list_snapshots(&self, client: &ClientId) -> Result<Vec<Snapshot>> {
        self.store.snapshots(client).await
    }

    pub async fn get_snapshot(&self, client: &ClientId, id: SnapshotId) -> Result<Snapshot> {
        self.store.snapshot(client, id).await
    }

    pub async fn latest_snapshot(&self, client: &ClientId) -> Result<Option<Snapshot>> {
        Ok(self.store.snapshots(client).await?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::ObjectStore;
    use crate::tree::{EntryKind, EntryMeta, Tree, TreeEntry};
    use bytes::Bytes;

    fn client() -> ClientId {
        ClientId::new("laptop").unwrap()
    }

    fn meta() -> EntryMeta {
        EntryMeta {
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 5,
            mtime: 0,
            mtime_nsec: 0,
        }
    }

    async fn store_tree_with_blob(store: &MemoryStore, upload_blob: bool) -> Digest {
        let blob = Bytes::from_static(b"hello");
        let blob_digest = Digest::of(&blob);
        if upload_blob {
            store.put(&blob_digest, blob).await.unwrap();
        }
        let mut tree = Tree::new();
        tree.insert("x.txt", TreeEntry::new(EntryKind::File, blob_digest, meta()))
            .unwrap();
        let data = tree.encode();
        let digest = Digest::of(&data);
        store.put(&digest, data).await.unwrap();
        digest
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_per_client() {
        let store = MemoryStore::new();
        let root = store_tree_with_blob(&store, true).await;
        let manager = SnapshotManager::new(&store);

        let first = manager.create_snapshot(NewSnapshot::new(client(), root)).await.unwrap();
        let second = manager
            .create_snapshot(NewSnapshot::new(client(), root).with_parent(Some(first.id)))
            .await
            .unwrap();
        let other = manager
            .create_snapshot(NewSnapshot::new(ClientId::new("server").unwrap(), root))
            .await
            .unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.parent, Some(1));
        assert_eq!(other.id, 1);

        let listed: Vec<SnapshotId> = manager
            .list_snapshots(&client())
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, vec![1, 2]);
        assert_eq!(manager.latest_snapshot(&client()).await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_missing_blob_blocks_commit() {
        let store = MemoryStore::new();
        let root = store_tree_with_blob(&store, false).await;
        let manager = SnapshotManager::new(&store);

        let err = manager
            .create_snapshot(NewSnapshot::new(client(), root))
            .await
            .unwrap_err();
        match err {
            Error::DependencyMissing { digest, missing } => {
                assert_eq!(digest, root);
                assert_eq!(missing, vec![Digest::of(b"hello")]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(manager.list_snapshots(&client()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_blocks_commit() {
        let store = MemoryStore::new();
        let manager = SnapshotManager::new(&store);
        let root = Tree::new().digest();

        let err = manager
            .create_snapshot(NewSnapshot::new(client(), root))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyMissing { .. }));
    }

    #[tokio::test]
    async fn test_unknown_parent_is_rejected() {
        let store = MemoryStore::new();
        let root = store_tree_with_blob(&store, true).await;
        let manager = SnapshotManager::new(&store);

        let err = manager
            .create_snapshot(NewSnapshot::new(client(), root).with_parent(Some(7)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { id: 7, .. }));
    }

    #[tokio::test]
    async fn test_get_unknown_snapshot_is_not_found() {
        let store = MemoryStore::new();
        let manager = SnapshotManager::new(&store);
        let err = manager.get_snapshot(&client(), 1).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.latest_snapshot(&client()).await.unwrap().is_none());
    }
}
