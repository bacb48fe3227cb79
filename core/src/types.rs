use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content fingerprint: the BLAKE3 hash of an object's bytes.
///
/// Digest equality is the only identity test for stored objects. File blobs
/// and tree objects share one namespace keyed by this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of a complete in-memory byte sequence.
    pub fn of(data: &[u8]) -> Self {
        Self::from(blake3::hash(data))
    }

    /// Digest of the empty byte string.
    pub fn empty() -> Self {
        Self::of(&[])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut array = [0u8; 32];
        hex::decode_to_slice(s, &mut array)?;
        Ok(Self(array))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short_string())
    }
}

/// Per-client snapshot sequence number. Starts at 1, never reused.
pub type SnapshotId = u64;

/// Identity of a backup client.
///
/// Client ids end up as storage key segments, so only ASCII alphanumerics,
/// `-`, `_` and `.` are accepted and the id may not start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    const MAX_LEN: usize = 128;

    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if id.is_empty() || id.len() > Self::MAX_LEN || id.starts_with('.') || !valid_chars {
            return Err(crate::Error::InvalidClient(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ClientId::new(s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Layout parameters persisted at the root of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub version: u32,
    pub id: String,
    /// Hex characters per shard directory level.
    pub shard_width: usize,
    /// Number of shard directory levels above each object.
    pub shard_depth: usize,
}

impl StoreConfig {
    pub const VERSION: u32 = 1;

    /// Whether `object_key` can shard a 64-character hex digest with this
    /// layout. Checked when a store is opened, since the file is external input.
    pub fn has_valid_layout(&self) -> bool {
        self.shard_width >= 1
            && self
                .shard_width
                .checked_mul(self.shard_depth)
                .is_some_and(|prefix| prefix < 64)
    }

    /// Storage key for an object, e.g. `objects/ab/abcdef...` with the
    /// default layout.
    pub fn object_key(&self, digest: &Digest) -> String {
        let hex = digest.to_hex();
        let mut key = String::from("objects");
        for level in 0..self.shard_depth {
            let start = level * self.shard_width;
            key.push('/');
            key.push_str(&hex[start..start + self.shard_width]);
        }
        key.push('/');
        key.push_str(&hex);
        key
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            shard_width: 2,
            shard_depth: 1,
        }
    }
}
