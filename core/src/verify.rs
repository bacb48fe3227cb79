use crate::snapshot::Snapshot;
use crate::store::{ObjectStore, ObjectStoreExt};
use crate::tree::Tree;
use crate::{Digest, Error, Result, SnapshotId};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tracing::{info, warn};

const CHECK_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub snapshot_id: SnapshotId,
    pub objects_checked: usize,
    pub missing: Vec<Digest>,
    pub corrupt: Vec<Digest>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

enum Fetched {
    Ok(Bytes),
    Missing,
    Corrupt,
}

/// Re-reads every object reachable from the snapshot and re-hashes it.
///
/// Missing and corrupt objects are collected rather than returned as errors so
/// that one report covers the whole snapshot. Subtrees below a bad tree cannot
/// be checked. Transport failures still abort the check.
pub async fn check_snapshot<S: ObjectStore + ?Sized>(
    store: &S,
    snapshot: &Snapshot,
) -> Result<CheckReport> {
    let mut report = CheckReport {
        snapshot_id: snapshot.id,
        objects_checked: 0,
        missing: Vec::new(),
        corrupt: Vec::new(),
    };
    let mut visited: HashSet<Digest> = HashSet::from([snapshot.root]);
    let mut blobs: HashSet<Digest> = HashSet::new();
    let mut frontier = vec![snapshot.root];

    while let Some(digest) = frontier.pop() {
        report.objects_checked += 1;
        let data = match fetch(store, &digest).await? {
            Fetched::Ok(data) => data,
            Fetched::Missing => {
                report.missing.push(digest);
                continue;
            }
            Fetched::Corrupt => {
                report.corrupt.push(digest);
                continue;
            }
        };
        let tree = match Tree::decode(&data) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(digest = %digest, "Undecodable tree: {}", e);
                report.corrupt.push(digest);
                continue;
            }
        };
        for (_, entry) in tree.entries() {
            if entry.is_dir() {
                if visited.insert(entry.digest) {
                    frontier.push(entry.digest);
                }
            } else if entry.kind.has_content() {
                blobs.insert(entry.digest);
            }
        }
    }

    let results: Vec<(Digest, Result<Fetched>)> = stream::iter(blobs)
        .map(|digest| async move { (digest, fetch(store, &digest).await) })
        .buffer_unordered(CHECK_CONCURRENCY)
        .collect()
        .await;
    for (digest, result) in results {
        report.objects_checked += 1;
        match result? {
            Fetched::Ok(_) => {}
            Fetched::Missing => report.missing.push(digest),
            Fetched::Corrupt => report.corrupt.push(digest),
        }
    }

    report.missing.sort();
    report.corrupt.sort();
    info!(
        id = snapshot.id,
        checked = report.objects_checked,
        missing = report.missing.len(),
        corrupt = report.corrupt.len(),
        "Snapshot check finished"
    );
    Ok(report)
}

async fn fetch<S: ObjectStore + ?Sized>(store: &S, digest: &Digest) -> Result<Fetched> {
    match store.get_verified(digest).await {
        Ok(data) => Ok(Fetched::Ok(data)),
        Err(e) if e.is_not_found() => Ok(Fetched::Missing),
        Err(Error::Corruption { actual, .. }) => {
            warn!(digest = %digest, actual = %actual, "Stored object does not match its digest");
            Ok(Fetched::Corrupt)
        }
        Err(e) => Err(e),
    }
}
