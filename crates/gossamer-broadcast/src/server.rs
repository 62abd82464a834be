//! Broadcast protocol handlers.
//!
//! | Request | Reply | Effect |
//! |---|---|---|
//! | `topology` | `topology_ok` | record this node's neighbors (first one wins) |
//! | `broadcast` | `broadcast_ok` | learn a value, eagerly forward it if new |
//! | `read` | `read_ok` | report every known value |
//! | `gossip` | `gossip_ok` (only if it has a `msg_id`) | merge a peer's values |

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use gossamer_node::{ErrorCode, Message, Node, RpcError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::BroadcastConfig;
use crate::error::Result;
use crate::store::{Value, ValueStore};

/// Message types this server registers handlers for.
pub const MESSAGE_TYPES: [&str; 4] = ["topology", "broadcast", "read", "gossip"];

/// Typed bodies of the broadcast workload, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Topology {
        topology: HashMap<String, Vec<String>>,
    },
    TopologyOk,
    Broadcast {
        message: Value,
    },
    BroadcastOk,
    Read,
    ReadOk {
        messages: Vec<Value>,
    },
    Gossip {
        messages: Vec<Value>,
    },
    GossipOk,
}

struct ServerState {
    store: Arc<ValueStore>,
    config: BroadcastConfig,
    neighbors: OnceLock<Vec<String>>,
}

/// Handler set for the broadcast workload. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastServer {
    state: Arc<ServerState>,
}

impl BroadcastServer {
    /// Create handlers backed by `store`.
    pub fn new(store: Arc<ValueStore>, config: BroadcastConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                store,
                config,
                neighbors: OnceLock::new(),
            }),
        }
    }

    /// The store the handlers read and write.
    pub fn store(&self) -> &Arc<ValueStore> {
        &self.state.store
    }

    /// Neighbors from the topology message, once one has arrived.
    pub fn neighbors(&self) -> Option<&[String]> {
        self.state.neighbors.get().map(Vec::as_slice)
    }

    /// Register the `topology`, `broadcast`, `read` and `gossip` handlers.
    pub fn register(&self, node: &Node) -> Result<()> {
        for msg_type in MESSAGE_TYPES {
            let server = self.clone();
            node.handle(msg_type, move |node, msg| {
                let server = server.clone();
                async move { server.dispatch(node, msg).await }
            })?;
        }
        Ok(())
    }

    async fn dispatch(&self, node: Node, msg: Message) -> gossamer_node::Result<()> {
        match msg.payload::<Payload>()? {
            Payload::Topology { topology } => self.topology(&node, &msg, topology).await,
            Payload::Broadcast { message } => self.broadcast(&node, &msg, message).await,
            Payload::Read => self.read(&node, &msg).await,
            Payload::Gossip { messages } => self.gossip(&node, &msg, messages).await,
            _ => Err(RpcError::new(
                ErrorCode::NotSupported,
                format!("{} is not a request", msg.kind()),
            )
            .into()),
        }
    }

    async fn topology(
        &self,
        node: &Node,
        msg: &Message,
        mut topology: HashMap<String, Vec<String>>,
    ) -> gossamer_node::Result<()> {
        let own = node
            .id()
            .and_then(|id| topology.remove(id))
            .unwrap_or_default();

        match self.state.neighbors.set(own) {
            Ok(()) => debug!(neighbors = ?self.neighbors(), "Recorded topology"),
            Err(_) => debug!("Topology already recorded, ignoring"),
        }

        node.reply(msg, Payload::TopologyOk).await
    }

    async fn broadcast(&self, node: &Node, msg: &Message, value: Value) -> gossamer_node::Result<()> {
        let learned = self.state.store.try_add(value).await;
        trace!(%value, learned, src = %msg.src, "Broadcast received");

        if learned && self.state.config.eager_fanout {
            self.forward(node, &msg.src, value).await;
        }

        node.reply(msg, Payload::BroadcastOk).await
    }

    async fn read(&self, node: &Node, msg: &Message) -> gossamer_node::Result<()> {
        let messages = self.state.store.snapshot().await.into_iter().collect();
        node.reply(msg, Payload::ReadOk { messages }).await
    }

    async fn gossip(&self, node: &Node, msg: &Message, messages: Vec<Value>) -> gossamer_node::Result<()> {
        let received = messages.len();
        let learned = self.state.store.merge(messages).await;
        if learned > 0 {
            debug!(src = %msg.src, received, learned, "Merged gossip");
        }

        node.reply(msg, Payload::GossipOk).await
    }

    /// Push a newly learned value to direct neighbors, skipping ourselves and
    /// whoever told us. Failures are left for anti-entropy to repair.
    async fn forward(&self, node: &Node, src: &str, value: Value) {
        let Some(self_id) = node.id() else {
            return;
        };

        let targets = self.neighbors().unwrap_or_else(|| node.peer_ids());
        let body = Payload::Gossip {
            messages: vec![value],
        };

        for peer in targets.iter().filter(|p| p.as_str() != self_id && p.as_str() != src) {
            if let Err(e) = node.send(peer, &body).await {
                warn!(peer = %peer, %value, "Eager forward failed: {}", e);
            }
        }
    }
}
