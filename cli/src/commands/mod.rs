pub mod backup;
pub mod check;
pub mod gc;
pub mod init;
pub mod ls;
pub mod restore;
pub mod snapshots;

use crate::config::Config;
use anyhow::{Result, anyhow};
use hashvault_backends::{Backend, BackendStore, backend_for};
use hashvault_core::{ClientId, Snapshot, SnapshotId, SnapshotManager};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub fn store_location(cli: &crate::Cli, config: &Config) -> Result<String> {
    cli.store
        .clone()
        .or_else(|| config.store.clone())
        .ok_or_else(|| anyhow!("Store location required (--store, HASHVAULT_STORE or config file)"))
}

pub async fn connect(location: &str, cli: &crate::Cli, config: &Config) -> Result<Arc<dyn Backend>> {
    let endpoint = cli.s3_endpoint.as_deref().or(config.s3_endpoint.as_deref());
    Ok(backend_for(location, endpoint).await?)
}

pub async fn open_store(cli: &crate::Cli, config: &Config) -> Result<BackendStore> {
    let location = store_location(cli, config)?;
    info!("Opening store at: {}", location);
    let backend = connect(&location, cli, config).await?;
    Ok(BackendStore::open(backend).await?)
}

pub fn client_id(cli: &crate::Cli, config: &Config) -> Result<ClientId> {
    let name = cli
        .client
        .as_deref()
        .or(config.client.as_deref())
        .ok_or_else(|| anyhow!("Client name required (--client, HASHVAULT_CLIENT or config file)"))?;
    Ok(ClientId::new(name)?)
}

/// Accepts a numeric snapshot id or `latest`.
pub async fn find_snapshot(
    store: &BackendStore,
    client: &ClientId,
    selector: &str,
) -> Result<Snapshot> {
    let manager = SnapshotManager::new(store);
    if selector == "latest" {
        return manager
            .latest_snapshot(client)
            .await?
            .ok_or_else(|| anyhow!("No snapshots found for client {}", client));
    }
    let id: SnapshotId = selector
        .parse()
        .map_err(|_| anyhow!("Invalid snapshot id: {} (expected a number or 'latest')", selector))?;
    Ok(manager.get_snapshot(client, id).await?)
}

pub fn spinner(cli: &crate::Cli, message: &'static str) -> Result<ProgressBar> {
    if cli.quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats_byte_counts() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
