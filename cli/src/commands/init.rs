use crate::config::Config;
use anyhow::Result;
use clap::Args;
use hashvault_backends::BackendStore;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(help = "Store location (path or s3://bucket/prefix)")]
    location: Option<String>,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &Config) -> Result<()> {
        let location = match &self.location {
            Some(location) => location.clone(),
            None => super::store_location(cli, config)?,
        };

        info!("Initializing store at: {}", location);
        let backend = super::connect(&location, cli, config).await?;
        let store = BackendStore::init(backend).await?;

        println!("✅ Initialized store at {}", store.location());
        println!("🆔 Store id: {}", store.config().id);
        Ok(())
    }
}
