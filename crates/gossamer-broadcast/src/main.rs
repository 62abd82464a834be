//! Broadcast node binary
//!
//! Speaks the line-delimited JSON protocol on stdin/stdout. Logs go to stderr.

use std::process::ExitCode;
use std::sync::Arc;

use gossamer_broadcast::{BroadcastConfig, BroadcastServer, Gossiper, ValueStore};
use gossamer_node::Node;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the protocol, so logs must not touch it
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broadcast_node=info,gossamer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Broadcast node failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> gossamer_broadcast::Result<()> {
    let config = BroadcastConfig::from_env()?;
    tracing::info!(?config, "Starting broadcast node");

    let store = Arc::new(ValueStore::new());
    let node = Node::stdio();
    BroadcastServer::new(Arc::clone(&store), config.clone()).register(&node)?;

    let gossiper = Gossiper::new(config).start(store, node.clone());
    let outcome = node.run(tokio::io::stdin()).await;
    gossiper.stop().await;

    outcome?;
    Ok(())
}
