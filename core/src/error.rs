use crate::types::{ClientId, Digest, SnapshotId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object not found: {digest}")]
    ObjectNotFound { digest: Digest },

    #[error("Snapshot {id} not found for client {client}")]
    SnapshotNotFound { client: ClientId, id: SnapshotId },

    #[error("Object {digest} is corrupt: content hashes to {actual}")]
    Corruption { digest: Digest, actual: Digest },

    #[error("Cannot commit {digest}: {} referenced object(s) missing", missing.len())]
    DependencyMissing { digest: Digest, missing: Vec<Digest> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid tree object: {0}")]
    InvalidTree(String),

    #[error("Unsupported format {format} version {version}")]
    UnsupportedFormat { format: String, version: u32 },

    #[error("Store not found at {path}")]
    StoreNotFound { path: String },

    #[error("Store already exists at {path}")]
    StoreExists { path: String },

    #[error("Invalid client identity: {0}")]
    InvalidClient(String),

    #[error("Source changed during backup: {}", path.display())]
    SourceChanged { path: PathBuf },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound { .. } | Error::SnapshotNotFound { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_missing_reports_count() {
        let err = Error::DependencyMissing {
            digest: Digest::of(b"root"),
            missing: vec![Digest::of(b"a"), Digest::of(b"b")],
        };
        assert!(err.to_string().contains("2 referenced object(s) missing"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::ObjectNotFound { digest: Digest::empty() }.is_not_found());
        assert!(!Error::Transport("reset".into()).is_not_found());
    }
}
