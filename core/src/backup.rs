use crate::builder::{BuildOptions, BuildOutput, BuildStats, TreeBuilder};
use crate::snapshot::{NewSnapshot, Snapshot, SnapshotManager};
use crate::store::Store;
use crate::sync::{SyncNegotiator, SyncPlan, SyncReport};
use crate::{ClientId, Digest, Error, Result, SnapshotId};
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info};
use uuid::Uuid;

/// Lifecycle of one backup run. `Failed` is reachable from every state
/// before `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Building,
    Uploading,
    Committing,
    Complete,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Building => "building",
            RunState::Uploading => "uploading",
            RunState::Committing => "committing",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which snapshot, if any, the new one is recorded against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParentSelection {
    #[default]
    Latest,
    None,
    Id(SnapshotId),
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub build: BuildOptions,
    pub parent: ParentSelection,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub hostname: Option<String>,
    pub sync_concurrency: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            build: BuildOptions::default(),
            parent: ParentSelection::Latest,
            description: None,
            tags: Vec::new(),
            hostname: None,
            sync_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub snapshot: Snapshot,
    pub build: BuildStats,
    pub sync: SyncReport,
}

/// What a run would upload, computed by [`BackupRun::plan`].
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub parent: Option<SnapshotId>,
    pub root: Digest,
    pub build: BuildStats,
    pub sync: SyncPlan,
}

/// One attempt at creating a snapshot: scan, upload, commit.
///
/// Nothing is recorded unless the run reaches `Committing` and the commit
/// succeeds. Objects uploaded by a failed run stay behind as orphans and are
/// reported present by the next attempt's negotiation.
pub struct BackupRun<'a, S: Store> {
    store: &'a S,
    client: ClientId,
    options: BackupOptions,
    state: RunState,
    run_id: Uuid,
}

impl<'a, S: Store> BackupRun<'a, S> {
    pub fn new(store: &'a S, client: ClientId, options: BackupOptions) -> Self {
        Self {
            store,
            client,
            options,
            state: RunState::Building,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub async fn execute(&mut self, paths: &[PathBuf]) -> Result<BackupOutcome> {
        match self.run(paths).await {
            Ok(outcome) => {
                self.transition(RunState::Complete);
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    run = %self.run_id,
                    client = %self.client,
                    state = %self.state,
                    "Backup run failed: {}",
                    e
                );
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    /// Scans and negotiates without uploading or committing anything.
    pub async fn plan(&mut self, paths: &[PathBuf]) -> Result<BackupPlan> {
        let parent = self.resolve_parent().await?;
        let output = self.build(paths, parent.as_ref()).await?;
        let sync = SyncNegotiator::new(self.store).negotiate(&output).await?;
        Ok(BackupPlan {
            parent: parent.map(|p| p.id),
            root: output.root,
            build: output.stats,
            sync,
        })
    }

    async fn resolve_parent(&self) -> Result<Option<Snapshot>> {
        let manager = SnapshotManager::new(self.store);
        let parent = match self.options.parent {
            ParentSelection::Latest => manager.latest_snapshot(&self.client).await?,
            ParentSelection::None => None,
            ParentSelection::Id(id) => Some(manager.get_snapshot(&self.client, id).await?),
        };
        if let Some(parent) = &parent {
            info!(run = %self.run_id, parent = parent.id, "Using parent snapshot");
        }
        Ok(parent)
    }

    async fn run(&mut self, paths: &[PathBuf]) -> Result<BackupOutcome> {
        let manager = SnapshotManager::new(self.store);
        let parent = self.resolve_parent().await?;

        self.transition(RunState::Building);
        let output = self.build(paths, parent.as_ref()).await?;

        self.transition(RunState::Uploading);
        let sync = SyncNegotiator::new(self.store)
            .with_concurrency(self.options.sync_concurrency)
            .sync(&output)
            .await?;

        self.transition(RunState::Committing);
        let mut record = NewSnapshot::new(self.client.clone(), output.root)
            .with_parent(parent.map(|p| p.id))
            .with_description(self.options.description.clone())
            .with_tags(self.options.tags.clone());
        if let Some(hostname) = &self.options.hostname {
            record = record.with_hostname(hostname.clone());
        }
        let snapshot = manager.create_snapshot(record).await?;

        Ok(BackupOutcome {
            snapshot,
            build: output.stats,
            sync,
        })
    }

    async fn build(&self, paths: &[PathBuf], parent: Option<&Snapshot>) -> Result<BuildOutput> {
        let builder = TreeBuilder::new(self.options.build.clone()).with_prior(self.store);
        let prior_root = parent.map(|p| p.root);

        match paths {
            [] => Err(Error::InvalidArgument(
                "at least one path must be given".to_string(),
            )),
            [path] => builder.build(path, prior_root).await,
            _ => {
                let roots = paths
                    .iter()
                    .map(|path| {
                        let name = path
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .ok_or_else(|| {
                                Error::InvalidArgument(format!(
                                    "cannot name backup root {}",
                                    path.display()
                                ))
                            })?;
                        Ok((name, path.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                builder.build_roots(&roots, prior_root).await
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        info!(run = %self.run_id, client = %self.client, "{} -> {}", self.state, next);
        self.state = next;
    }
}
