//! Store node HTTP server binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use store::clock::SystemClock;
use store::peer::{Peer, StaticPeers};
use store::server::{AppState, CliArgs, StoreServer};
use store::storage::create_store;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("store node failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> store::Result<()> {
    let config = args.to_config()?;
    tracing::info!("Starting store node with config: {:?}", config);

    let store = create_store(&config.storage).await?;
    let local = Peer::new(config.advertise_addr(), config.cluster.role);
    let peers = Arc::new(StaticPeers::new(
        local,
        config.cluster.peers.iter().map(Peer::from),
    ));

    let state = AppState::new(store, peers, Arc::new(SystemClock), &config)?;
    StoreServer::new(state, config.port).run().await
}
