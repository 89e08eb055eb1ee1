use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skybridge::config::{Args, Credentials};
use skybridge::feed::atproto::AtClient;
use skybridge::irc::server::{self, ServerState};
use skybridge::sync::Synchronizer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("skybridge={default_level}"))),
        )
        .init();

    let creds = Credentials::from_env()?;
    info!(handle = %creds.handle, "logging in to Bluesky");
    let client = AtClient::login(&creds.handle, &creds.app_password).await?;
    info!(did = %client.session.did, "session established");

    let state = Arc::new(RwLock::new(ServerState::new()));

    let sync = Synchronizer::new(client, Arc::clone(&state));
    tokio::spawn(sync.run());

    let addr = format!("{}:{}", args.bind, args.port);
    tokio::select! {
        result = server::run(&addr, state) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
