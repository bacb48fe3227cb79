use crate::snapshot::{NewSnapshot, Snapshot, SnapshotLog};
use crate::store::{check_claim, ObjectStore};
use crate::{ClientId, Digest, Error, Result, SnapshotId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// In-memory store for tests and embedding.
///
/// Objects and snapshot records live behind `RwLock`s; a snapshot append holds
/// the write lock while choosing the id and publishing the record. Counters
/// record how many puts were received and how many actually wrote an object.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<Digest, Bytes>>,
    snapshots: RwLock<BTreeMap<ClientId, Vec<Snapshot>>>,
    puts: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .await
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }

    /// Number of `put` calls received, including no-op repeats.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `put` calls that stored a new object.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrites stored bytes without any check. Test hook for simulating
    /// on-disk corruption.
    pub async fn tamper(&self, digest: &Digest, data: Bytes) {
        self.objects.write().await.insert(*digest, data);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(digest))
    }

    async fn batch_has(&self, digests: &[Digest]) -> Result<HashSet<Digest>> {
        let objects = self.objects.read().await;
        Ok(digests
            .iter()
            .filter(|digest| objects.contains_key(digest))
            .copied()
            .collect())
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        check_claim(digest, &data)?;
        let mut objects = self.objects.write().await;
        if !objects.contains_key(digest) {
            objects.insert(*digest, data);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(digest)
            .cloned()
            .ok_or(Error::ObjectNotFound { digest: *digest })
    }

    async fn list(&self) -> Result<Vec<Digest>> {
        let mut digests: Vec<Digest> = self.objects.read().await.keys().copied().collect();
        digests.sort();
        Ok(digests)
    }

    async fn delete(&self, digest: &Digest) -> Result<bool> {
        Ok(self.objects.write().await.remove(digest).is_some())
    }
}

#[async_trait]
impl SnapshotLog for MemoryStore {
    async fn append_snapshot(&self, snapshot: NewSnapshot) -> Result<Snapshot> {
        let mut snapshots = self.snapshots.write().await;
        let records = snapshots.entry(snapshot.client.clone()).or_default();
        let id: SnapshotId = records.last().map_or(1, |last| last.id + 1);
        let record = snapshot.into_snapshot(id);
        records.push(record.clone());
        Ok(record)
    }

    async fn snapshots(&self, client: &ClientId) -> Result<Vec<Snapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(client)
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot(&self, client: &ClientId, id: SnapshotId) -> Result<Snapshot> {
        self.snapshots
            .read()
            .await
            .get(client)
            .and_then(|records| records.iter().find(|s| s.id == id))
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound {
                client: client.clone(),
                id,
            })
    }

    async fn snapshot_clients(&self) -> Result<Vec<ClientId>> {
        Ok(self.snapshots.read().await.keys().cloned().collect())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("puts", &self.put_count())
            .field("writes", &self.write_count())
            .finish()
    }
}
