use crate::builder::{BlobSource, BuildOutput, PendingBlob, PendingTree};
use crate::store::ObjectStore;
use crate::{Digest, Error, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashSet};
use std::io;
use tracing::{debug, info};

/// Outcome of negotiation: which candidates the store lacks.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub present: HashSet<Digest>,
    pub missing_blobs: Vec<Digest>,
    /// Missing trees in children-before-parents order.
    pub missing_trees: Vec<Digest>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.missing_blobs.is_empty() && self.missing_trees.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub candidates: usize,
    pub already_present: usize,
    pub blobs_uploaded: usize,
    pub trees_uploaded: usize,
    pub bytes_uploaded: u64,
}

/// Uploads the objects of a build that the store does not already have.
///
/// All candidates are checked with one `batch_has`. Missing blobs go first,
/// then missing trees level by level from the leaves up, so no tree is ever
/// stored before everything it references.
pub struct SyncNegotiator<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    concurrency: usize,
}

impl<'a, S: ObjectStore + ?Sized> SyncNegotiator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            concurrency: 8,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn negotiate(&self, output: &BuildOutput) -> Result<SyncPlan> {
        let candidates = output.candidates();
        let present = self.store.batch_has(&candidates).await?;

        let mut missing_blobs: Vec<Digest> = output
            .blobs
            .keys()
            .filter(|digest| !present.contains(digest))
            .copied()
            .collect();
        missing_blobs.sort();
        let missing_trees = output
            .trees
            .iter()
            .map(|tree| tree.digest)
            .filter(|digest| !present.contains(digest))
            .collect();

        let plan = SyncPlan {
            present,
            missing_blobs,
            missing_trees,
        };
        debug!(
            candidates = candidates.len(),
            present = plan.present.len(),
            missing_blobs = plan.missing_blobs.len(),
            missing_trees = plan.missing_trees.len(),
            "Negotiated upload set"
        );
        Ok(plan)
    }

    pub async fn upload(&self, output: &BuildOutput, plan: &SyncPlan) -> Result<SyncReport> {
        let mut report = SyncReport {
            candidates: output.blobs.len() + output.trees.len(),
            already_present: plan.present.len(),
            ..Default::default()
        };

        let blobs = plan
            .missing_blobs
            .iter()
            .map(|digest| {
                output
                    .blobs
                    .get(digest)
                    .ok_or(Error::ObjectNotFound { digest: *digest })
            })
            .collect::<Result<Vec<&PendingBlob>>>()?;

        let sizes: Vec<u64> = stream::iter(blobs)
            .map(|blob| self.upload_blob(blob))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        report.blobs_uploaded = sizes.len();
        report.bytes_uploaded = sizes.iter().sum();

        let missing: HashSet<&Digest> = plan.missing_trees.iter().collect();
        let mut levels: BTreeMap<u32, Vec<&PendingTree>> = BTreeMap::new();
        for tree in output.trees.iter().filter(|tree| missing.contains(&tree.digest)) {
            levels.entry(tree.height).or_default().push(tree);
        }

        for (height, trees) in levels {
            let count = trees.len();
            let sizes: Vec<u64> = stream::iter(trees)
                .map(|tree| async move {
                    self.store.put(&tree.digest, tree.data.clone()).await?;
                    Ok::<_, Error>(tree.data.len() as u64)
                })
                .buffer_unordered(self.concurrency)
                .try_collect()
                .await?;
            report.trees_uploaded += count;
            report.bytes_uploaded += sizes.iter().sum::<u64>();
            debug!(height, trees = count, "Uploaded tree level");
        }

        if !self.store.has(&output.root).await? {
            return Err(Error::DependencyMissing {
                digest: output.root,
                missing: vec![output.root],
            });
        }

        info!(
            root = %output.root,
            blobs = report.blobs_uploaded,
            trees = report.trees_uploaded,
            bytes = report.bytes_uploaded,
            skipped = report.already_present,
            "Upload complete"
        );
        Ok(report)
    }

    pub async fn sync(&self, output: &BuildOutput) -> Result<SyncReport> {
        let plan = self.negotiate(output).await?;
        self.upload(output, &plan).await
    }

    async fn upload_blob(&self, blob: &PendingBlob) -> Result<u64> {
        match &blob.source {
            BlobSource::Inline(data) => {
                self.store.put(&blob.digest, data.clone()).await?;
                Ok(data.len() as u64)
            }
            BlobSource::File(path) => match self.store.put_file(&blob.digest, path).await {
                Ok(size) => Ok(size),
                Err(Error::Corruption { .. }) => Err(Error::SourceChanged { path: path.clone() }),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    Err(Error::SourceChanged { path: path.clone() })
                }
                Err(e) => Err(e),
            },
        }
    }
}
