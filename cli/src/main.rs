mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, check::CheckCommand, gc::GcCommand, init::InitCommand, ls::LsCommand,
    restore::RestoreCommand, snapshots::SnapshotsCommand,
};
use config::Config;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "hashvault",
    about = "Content-addressed incremental backups",
    long_about = "Hashvault stores directory trees as deduplicated, content-addressed objects and \
                  uploads only what the store does not already hold"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "HASHVAULT_STORE", help = "Store location (path or s3://bucket/prefix)")]
    store: Option<String>,

    #[arg(long, global = true, env = "HASHVAULT_CLIENT", help = "Client name snapshots are recorded under")]
    client: Option<String>,

    #[arg(long, global = true, env = "HASHVAULT_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "HASHVAULT_S3_ENDPOINT", help = "S3-compatible endpoint URL")]
    s3_endpoint: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new store")]
    Init(InitCommand),

    #[command(about = "Create a new snapshot")]
    Backup(BackupCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),

    #[command(about = "Restore files from a snapshot")]
    Restore(RestoreCommand),

    #[command(about = "List files in a snapshot")]
    Ls(LsCommand),

    #[command(about = "Verify every object reachable from snapshots")]
    Check(CheckCommand),

    #[command(about = "Delete objects no snapshot references")]
    Gc(GcCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    let config = Config::load(cli.config.as_deref())?;
    debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Backup(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Restore(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Ls(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Check(ref cmd) => cmd.run(&cli, &config).await,
        Commands::Gc(ref cmd) => cmd.run(&cli, &config).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("hashvault={}", level)))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
