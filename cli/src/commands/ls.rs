use crate::config::Config;
use anyhow::Result;
use chrono::DateTime;
use clap::Args;
use hashvault_core::{EntryKind, TreeEntry, walk};

use super::format_bytes;

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Snapshot ID (or 'latest')")]
    snapshot: String,

    #[arg(help = "Path within snapshot")]
    path: Option<String>,

    #[arg(short, long, help = "Show kind, mode, size and modification time")]
    long: bool,
}

impl LsCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let store = super::open_store(cli, config).await?;
        let client = super::client_id(cli, config)?;
        let snapshot = super::find_snapshot(&store, &client, &self.snapshot).await?;

        let path = self
            .path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty());

        let entries = match path {
            None => walk::list_entries(&store, &snapshot.root).await?,
            Some(path) => {
                let (_, entry) = walk::resolve_path(&store, &snapshot.root, path).await?;
                let mut entries = vec![(path.to_string(), entry.clone())];
                if entry.is_dir() {
                    entries.extend(
                        walk::list_entries(&store, &entry.digest)
                            .await?
                            .into_iter()
                            .map(|(name, child)| (format!("{}/{}", path, name), child)),
                    );
                }
                entries
            }
        };

        for (name, entry) in &entries {
            if self.long {
                println!("{}", long_line(name, entry));
            } else {
                println!("{}", name);
            }
        }
        Ok(())
    }
}

fn long_line(name: &str, entry: &TreeEntry) -> String {
    let kind = match entry.kind {
        EntryKind::File => '-',
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::Fifo => 'p',
        EntryKind::Socket => 's',
        EntryKind::CharDevice => 'c',
        EntryKind::BlockDevice => 'b',
    };
    let mtime = DateTime::from_timestamp(entry.meta.mtime, entry.meta.mtime_nsec)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{}{:04o} {:>5} {:>5} {:>10} {} {}",
        kind,
        entry.meta.mode,
        entry.meta.uid,
        entry.meta.gid,
        format_bytes(entry.meta.size),
        mtime,
        name
    )
}
