use anyhow::Result;
use campanile::cli::{self, Cli};
use campanile::config::Config;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = match &cli.workspace {
        Some(workspace) => Config::load_from_workspace(workspace)?,
        None => Config::load_or_init()?,
    };

    cli::dispatch(cli, config).await
}
