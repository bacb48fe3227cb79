use crate::config::Config;
use anyhow::{Result, anyhow};
use clap::Args;
use hashvault_core::{BackupOptions, BackupRun, BuildOptions, ParentSelection, SnapshotId};
use std::path::PathBuf;
use tracing::info;

use super::format_bytes;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Paths to back up (defaults to the configured paths)")]
    paths: Vec<PathBuf>,

    #[arg(long, help = "Snapshot tags")]
    tag: Vec<String>,

    #[arg(long, help = "Exclude patterns (gitignore syntax)")]
    exclude: Vec<String>,

    #[arg(long, help = "Snapshot description")]
    description: Option<String>,

    #[arg(long, conflicts_with = "no_parent", help = "Parent snapshot ID (defaults to the latest)")]
    parent: Option<SnapshotId>,

    #[arg(long, help = "Hash every file instead of reusing the parent's digests")]
    no_parent: bool,

    #[arg(long, help = "Hostname override")]
    hostname: Option<String>,

    #[arg(long, help = "Files hashed and objects uploaded concurrently")]
    concurrency: Option<usize>,

    #[arg(long, help = "Dry run - report what would be uploaded")]
    dry_run: bool,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let store = super::open_store(cli, config).await?;
        let client = super::client_id(cli, config)?;

        let paths = if self.paths.is_empty() {
            config.paths.clone()
        } else {
            self.paths.clone()
        };
        if paths.is_empty() {
            return Err(anyhow!("At least one path must be specified"));
        }

        let options = self.options(config)?;
        info!("Starting backup of {} paths for client {}", paths.len(), client);
        let mut run = BackupRun::new(&store, client, options);

        if self.dry_run {
            println!("DRY RUN - no data will be written");
            let pb = super::spinner(cli, "Scanning files...")?;
            let plan = run.plan(&paths).await;
            pb.finish_and_clear();
            let plan = plan?;

            match plan.parent {
                Some(parent) => println!("👪 Parent: #{}", parent),
                None => println!("👪 Parent: none"),
            }
            println!(
                "📁 Scanned {} files, {} directories ({} hashed, {} reused)",
                plan.build.files,
                plan.build.dirs,
                format_bytes(plan.build.bytes_hashed),
                plan.build.reused
            );
            println!(
                "⬆️  Would upload {} blobs and {} trees ({} already stored)",
                plan.sync.missing_blobs.len(),
                plan.sync.missing_trees.len(),
                plan.sync.present.len()
            );
            println!("🌳 Root: {}", plan.root);
            return Ok(());
        }

        let pb = super::spinner(cli, "Scanning and uploading...")?;
        let outcome = run.execute(&paths).await;
        pb.finish_and_clear();
        let outcome = outcome?;

        println!("✅ Backup completed!");
        println!("📸 {}", outcome.snapshot.summary());
        println!(
            "📁 Files: {}  Directories: {}  Symlinks: {}",
            outcome.build.files, outcome.build.dirs, outcome.build.symlinks
        );
        println!(
            "🔍 Hashed: {}  Reused from parent: {}",
            format_bytes(outcome.build.bytes_hashed),
            outcome.build.reused
        );
        println!(
            "⬆️  Uploaded: {} blobs, {} trees ({})",
            outcome.sync.blobs_uploaded,
            outcome.sync.trees_uploaded,
            format_bytes(outcome.sync.bytes_uploaded)
        );
        if outcome.build.skipped > 0 {
            println!("⚠️  Skipped {} unreadable entries", outcome.build.skipped);
        }
        Ok(())
    }

    fn options(&self, config: &Config) -> Result<BackupOptions> {
        let defaults = BackupOptions::default();
        let concurrency = self
            .concurrency
            .or(config.concurrency)
            .unwrap_or(defaults.sync_concurrency);
        if concurrency == 0 {
            return Err(anyhow!("--concurrency must be at least 1"));
        }

        let mut exclude = config.exclude.clone();
        exclude.extend(self.exclude.iter().cloned());

        let parent = match (self.no_parent, self.parent) {
            (true, _) => ParentSelection::None,
            (false, Some(id)) => ParentSelection::Id(id),
            (false, None) => ParentSelection::Latest,
        };

        Ok(BackupOptions {
            build: BuildOptions {
                concurrency,
                exclude,
            },
            parent,
            description: self.description.clone(),
            tags: self.tag.clone(),
            hostname: self.hostname.clone(),
            sync_concurrency: concurrency,
        })
    }
}
