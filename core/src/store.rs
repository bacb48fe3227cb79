use crate::hasher;
use crate::snapshot::SnapshotLog;
use crate::tree::Tree;
use crate::{Digest, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Content-addressed object store: digest to immutable bytes.
///
/// Implementations must satisfy:
/// - `put` of a digest that is already present is a successful no-op.
/// - `put` rejects bytes that do not hash to the claimed digest with
///   [`Error::Corruption`] and leaves the store unchanged.
/// - `get` returns exactly the bytes stored, or [`Error::ObjectNotFound`].
/// - All operations are safe to call concurrently; concurrent puts of the same
///   digest carry identical bytes and need no coordination.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn has(&self, digest: &Digest) -> Result<bool>;

    /// Subset of `digests` that is present. Equivalent to calling `has` for
    /// each digest; stores behind a remote boundary answer it in one exchange.
    async fn batch_has(&self, digests: &[Digest]) -> Result<HashSet<Digest>> {
        let mut present = HashSet::new();
        for digest in digests {
            if self.has(digest).await? {
                present.insert(*digest);
            }
        }
        Ok(present)
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<()>;

    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    /// Stores the contents of a local file under `digest`, returning its
    /// size. Same contract as `put`: a file that no longer hashes to `digest`
    /// fails with [`Error::Corruption`] and nothing is stored.
    ///
    /// The default reads the whole file; stores backed by disk or network
    /// override it to stream.
    async fn put_file(&self, digest: &Digest, path: &Path) -> Result<u64> {
        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;
        self.put(digest, Bytes::from(data)).await?;
        Ok(size)
    }

    /// Writes an object to `writer`, re-hashing it on the way, and returns
    /// the number of bytes written. On [`Error::Corruption`] the writer has
    /// already received the bad bytes.
    async fn get_into(
        &self,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let data = self.get(digest).await?;
        hasher::verify(digest, &data)?;
        writer.write_all(&data).await?;
        Ok(data.len() as u64)
    }

    /// Every stored digest. Used by garbage collection.
    async fn list(&self) -> Result<Vec<Digest>>;

    /// Removes an object, returning whether it existed. Only garbage
    /// collection may call this: deleting a referenced object breaks restores.
    async fn delete(&self, digest: &Digest) -> Result<bool>;
}

/// Verified reads on top of any [`ObjectStore`].
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    /// Fetches an object and re-hashes it against `digest`.
    async fn get_verified(&self, digest: &Digest) -> Result<Bytes> {
        let data = self.get(digest).await?;
        hasher::verify(digest, &data)?;
        Ok(data)
    }

    /// Fetches, verifies and decodes a tree object.
    async fn get_tree(&self, digest: &Digest) -> Result<Tree> {
        let data = self.get_verified(digest).await?;
        Tree::decode(&data)
    }

    /// Digests from `digests` that are absent, in input order.
    async fn missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let present = self.batch_has(digests).await?;
        Ok(digests
            .iter()
            .filter(|digest| !present.contains(digest))
            .copied()
            .collect())
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreExt for T {}

/// A complete store: objects plus per-client snapshot records.
pub trait Store: ObjectStore + SnapshotLog {}

impl<T: ObjectStore + SnapshotLog + ?Sized> Store for T {}

/// Checks a `put` claim before anything is written.
pub fn check_claim(digest: &Digest, data: &[u8]) -> Result<()> {
    let actual = hasher::digest_of(data);
    if actual != *digest {
        warn!(digest = %digest, actual = %actual, "Rejected put with mismatched digest");
        return Err(Error::Corruption {
            digest: *digest,
            actual,
        });
    }
    Ok(())
}
