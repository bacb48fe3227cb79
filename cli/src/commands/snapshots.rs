use crate::config::Config;
use anyhow::{Result, anyhow};
use clap::Args;
use hashvault_core::{Snapshot, SnapshotLog};

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, help = "List snapshots of every client in the store")]
    all_clients: bool,

    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Filter by hostname")]
    hostname: Option<String>,

    #[arg(long, help = "Filter by tag")]
    tag: Vec<String>,

    #[arg(long, help = "Show latest N snapshots")]
    latest: Option<usize>,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let store = super::open_store(cli, config).await?;

        let clients = if self.all_clients {
            store.snapshot_clients().await?
        } else {
            vec![super::client_id(cli, config)?]
        };

        let mut snapshots = Vec::new();
        for client in &clients {
            snapshots.extend(store.snapshots(client).await?);
        }
        self.filter(&mut snapshots);

        let format = self.format.as_deref().unwrap_or("table");
        match format {
            "table" => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }
                println!(
                    "{:<8} {:<16} {:<20} {:<15} {:<8} {:<12} {}",
                    "ID", "Client", "Date", "Host", "Parent", "Root", "Tags"
                );
                println!("{:-<100}", "");
                for snapshot in &snapshots {
                    let parent = snapshot
                        .parent
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<8} {:<16} {:<20} {:<15} {:<8} {:<12} {}",
                        snapshot.id,
                        snapshot.client,
                        snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        parent,
                        snapshot.root.short_string(),
                        snapshot.tags.join(",")
                    );
                    if let Some(description) = &snapshot.description {
                        println!("         {}", description);
                    }
                }
            }
            "json" => {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            }
            _ => {
                return Err(anyhow!("Unsupported format: {}", format));
            }
        }

        Ok(())
    }

    fn filter(&self, snapshots: &mut Vec<Snapshot>) {
        if let Some(hostname) = &self.hostname {
            snapshots.retain(|s| s.hostname == *hostname);
        }
        if !self.tag.is_empty() {
            snapshots.retain(|s| s.tags.iter().any(|tag| self.tag.contains(tag)));
        }
        if let Some(latest) = self.latest {
            snapshots.sort_by(|a, b| b.time.cmp(&a.time));
            snapshots.truncate(latest);
            snapshots.reverse();
        }
    }
}
