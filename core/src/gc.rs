use crate::store::Store;
use crate::walk;
use crate::{Digest, Result};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub snapshots: usize,
    pub reachable: usize,
    pub examined: usize,
    /// Objects deleted, or that would be deleted on a dry run.
    pub swept: usize,
    /// Digests referenced by some snapshot but absent from the store.
    pub dangling: Vec<Digest>,
}

/// Mark-and-sweep over every snapshot of every client.
///
/// Objects uploaded by a backup that has not committed yet are unreachable and
/// get swept; that backup's commit then fails its closure check instead of
/// recording a snapshot with missing objects, and a retry uploads them again.
pub async fn collect_garbage<S: Store + ?Sized>(store: &S, dry_run: bool) -> Result<GcReport> {
    let mut report = GcReport::default();
    let mut reachable: HashSet<Digest> = HashSet::new();
    let mut dangling: HashSet<Digest> = HashSet::new();

    for client in store.snapshot_clients().await? {
        for snapshot in store.snapshots(&client).await? {
            report.snapshots += 1;
            if reachable.contains(&snapshot.root) {
                continue;
            }
            let closure = walk::closure(store, &snapshot.root).await?;
            if !closure.is_complete() {
                warn!(
                    client = %client,
                    id = snapshot.id,
                    missing = closure.missing.len(),
                    "Snapshot references missing objects"
                );
                dangling.extend(closure.missing.iter().copied());
            }
            reachable.extend(closure.digests());
        }
    }
    report.reachable = reachable.len();

    for digest in store.list().await? {
        report.examined += 1;
        if reachable.contains(&digest) {
            continue;
        }
        report.swept += 1;
        if dry_run {
            debug!(digest = %digest, "Would remove unreferenced object");
        } else if store.delete(&digest).await? {
            debug!(digest = %digest, "Removed unreferenced object");
        }
    }

    report.dangling = dangling.into_iter().collect();
    report.dangling.sort();
    info!(
        snapshots = report.snapshots,
        reachable = report.reachable,
        swept = report.swept,
        dry_run,
        "Garbage collection finished"
    );
    Ok(report)
}
