use crate::config::Config;
use anyhow::Result;
use clap::Args;
use hashvault_core::collect_garbage;
use tracing::info;

#[derive(Args)]
pub struct GcCommand {
    #[arg(long, help = "Report unreferenced objects without deleting them")]
    dry_run: bool,
}

impl GcCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let store = super::open_store(cli, config).await?;

        info!("Collecting garbage in {}", store.location());
        let pb = super::spinner(cli, "Marking reachable objects...")?;
        let report = collect_garbage(&store, self.dry_run).await;
        pb.finish_and_clear();
        let report = report?;

        println!(
            "🔍 {} snapshots reference {} of {} stored objects",
            report.snapshots, report.reachable, report.examined
        );
        if self.dry_run {
            println!("🗑️  Would delete {} objects", report.swept);
        } else {
            println!("🗑️  Deleted {} objects", report.swept);
        }
        if !report.dangling.is_empty() {
            println!(
                "⚠️  {} referenced objects are missing; run `hashvault check`",
                report.dangling.len()
            );
        }
        Ok(())
    }
}
