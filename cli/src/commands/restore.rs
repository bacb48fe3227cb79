use crate::config::Config;
use anyhow::Result;
use clap::Args;
use hashvault_core::{RestoreOptions, Restorer};
use std::path::PathBuf;
use tracing::info;

use super::format_bytes;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot ID to restore from (or 'latest')")]
    snapshot: String,

    #[arg(help = "Target directory for restore")]
    target: PathBuf,

    #[arg(long, help = "Restore only this path within the snapshot")]
    path: Option<String>,

    #[arg(long, help = "Replace files that already exist in the target")]
    overwrite: bool,

    #[arg(long, help = "Restore file owners (usually requires root)")]
    ownership: bool,

    #[arg(long, help = "Do not restore permission bits")]
    no_permissions: bool,

    #[arg(long, help = "Do not restore modification times")]
    no_times: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let store = super::open_store(cli, config).await?;
        let client = super::client_id(cli, config)?;

        info!("Loading snapshot: {}", self.snapshot);
        let snapshot = super::find_snapshot(&store, &client, &self.snapshot).await?;

        println!("📸 Restoring snapshot: #{}", snapshot.id);
        println!("📅 Created: {}", snapshot.time.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("🖥️  Host: {}", snapshot.hostname);
        println!("📂 Target: {}", self.target.display());

        let options = RestoreOptions {
            permissions: !self.no_permissions,
            ownership: self.ownership,
            times: !self.no_times,
            overwrite: self.overwrite,
        };
        let restorer = Restorer::new(&store, options);

        let pb = super::spinner(cli, "Restoring files...")?;
        let stats = match &self.path {
            Some(path) => restorer.restore_path(&snapshot.root, path, &self.target).await,
            None => restorer.restore_snapshot(&snapshot, &self.target).await,
        };
        pb.finish_and_clear();
        let stats = stats?;

        println!("✅ Restore completed!");
        println!(
            "📁 Restored: {} files, {} directories, {} symlinks, {} fifos ({})",
            stats.files,
            stats.dirs,
            stats.symlinks,
            stats.fifos,
            format_bytes(stats.bytes_written)
        );
        if stats.skipped > 0 {
            println!("⚠️  Skipped: {}", stats.skipped);
        }
        println!("📂 Location: {}", self.target.display());
        Ok(())
    }
}
