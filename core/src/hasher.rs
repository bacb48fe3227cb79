//! Content digests for blobs and tree objects.
//!
//! Files are hashed in fixed-size reads so that memory use does not depend on
//! file size. Tree objects are hashed over their canonical encoding (see
//! [`crate::tree::Tree::encode`]), never over a combination of child digests.

use crate::{Digest, Error, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read granularity for streaming hashes.
pub const READ_SIZE: usize = 1024 * 1024;

/// Digest of an in-memory byte sequence.
pub fn digest_of(data: &[u8]) -> Digest {
    Digest::of(data)
}

/// Fails with [`Error::Corruption`] unless `data` hashes to `expected`.
pub fn verify(expected: &Digest, data: &[u8]) -> Result<()> {
    let actual = digest_of(data);
    if actual != *expected {
        return Err(Error::Corruption {
            digest: *expected,
            actual,
        });
    }
    Ok(())
}

/// Incremental hasher. Feeding the same bytes in any split produces the same
/// digest as [`digest_of`] over the concatenation.
#[derive(Default, Clone)]
pub struct StreamHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(&self) -> Digest {
        Digest::from(self.inner.finalize())
    }
}

/// Hash everything readable from `reader`, returning the digest and byte count.
pub async fn digest_reader<R>(mut reader: R) -> Result<(Digest, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = StreamHasher::new();
    let mut buffer = vec![0u8; READ_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok((hasher.finalize(), hasher.bytes_hashed()))
}

pub async fn digest_file(path: &Path) -> Result<(Digest, u64)> {
    let file = tokio::fs::File::open(path).await?;
    digest_reader(file).await
}
