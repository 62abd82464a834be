//! Gossamer Broadcast - fault-tolerant value dissemination
//!
//! Every node learns values from clients (`broadcast`) and from peers
//! (`gossip`), and answers `read` with everything it knows. Two mechanisms
//! spread values:
//!
//! - **Eager forwarding**: a newly learned value is pushed straight to the
//!   node's neighbors. Fast, but a lost message is never resent.
//! - **Anti-entropy**: the [`Gossiper`] periodically pushes the full value set
//!   to a few random peers. Slower, but repairs any loss, so every node
//!   eventually holds the same set.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gossamer_broadcast::{BroadcastConfig, BroadcastServer, Gossiper, ValueStore};
//! use gossamer_node::Node;
//!
//! let config = BroadcastConfig::from_env()?;
//! let store = Arc::new(ValueStore::new());
//! let node = Node::stdio();
//!
//! BroadcastServer::new(Arc::clone(&store), config.clone()).register(&node)?;
//! let gossiper = Gossiper::new(config).start(store, node.clone());
//! node.run(tokio::io::stdin()).await?;
//! gossiper.stop().await;
//! ```

pub mod config;
pub mod error;
pub mod gossiper;
pub mod sampler;
pub mod server;
pub mod store;

pub use config::BroadcastConfig;
pub use error::{Error, Result};
pub use gossiper::{Gossiper, RunningGossiper};
pub use sampler::sample_peers;
pub use server::{BroadcastServer, Payload};
pub use store::{Value, ValueStore};
