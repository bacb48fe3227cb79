use crate::config::Config;
use anyhow::{Result, anyhow};
use clap::Args;
use hashvault_core::{SnapshotLog, check_snapshot};

#[derive(Args)]
pub struct CheckCommand {
    #[arg(help = "Snapshot ID (or 'latest'); all snapshots of the client when omitted")]
    snapshot: Option<String>,
}

impl CheckCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let store = super::open_store(cli, config).await?;
        let client = super::client_id(cli, config)?;

        let snapshots = match &self.snapshot {
            Some(selector) => vec![super::find_snapshot(&store, &client, selector).await?],
            None => store.snapshots(&client).await?,
        };
        if snapshots.is_empty() {
            println!("No snapshots found");
            return Ok(());
        }

        let pb = super::spinner(cli, "Checking objects...")?;
        let mut damaged = 0;
        for snapshot in &snapshots {
            pb.set_message(format!("Checking snapshot #{}", snapshot.id));
            let report = check_snapshot(&store, snapshot).await?;
            pb.suspend(|| {
                if report.is_ok() {
                    println!(
                        "✅ #{}: {} objects ok",
                        report.snapshot_id, report.objects_checked
                    );
                } else {
                    println!(
                        "❌ #{}: {} missing, {} corrupt of {} objects",
                        report.snapshot_id,
                        report.missing.len(),
                        report.corrupt.len(),
                        report.objects_checked
                    );
                    for digest in &report.missing {
                        println!("   missing {}", digest);
                    }
                    for digest in &report.corrupt {
                        println!("   corrupt {}", digest);
                    }
                }
            });
            if !report.is_ok() {
                damaged += 1;
            }
        }
        pb.finish_and_clear();

        if damaged > 0 {
            return Err(anyhow!("{} of {} snapshots are damaged", damaged, snapshots.len()));
        }
        Ok(())
    }
}
