//! In-process simulated cluster for end-to-end broadcast tests.
//!
//! Each node runs the real runtime and broadcast handlers over in-memory
//! pipes. A router task per node reads its output and delivers each line:
//!
//! - to another node's input, dropping node-to-node traffic with probability
//!   `loss`
//! - to the simulated client otherwise, where replies are matched to the
//!   request that caused them
//!
//! Client traffic is never dropped, so the network is lossy but never
//! partitions a node from its clients.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gossamer_broadcast::{BroadcastConfig, BroadcastServer, Gossiper, RunningGossiper, Value, ValueStore};
use gossamer_node::{Error, Message, Node, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value as Json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Id the simulated client sends from.
pub const CLIENT_ID: &str = "c1";

/// How long `request` waits for a reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 1 << 20;

type ReplySlots = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

/// Shape of a simulated cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes, named `n1..=nN`.
    pub nodes: usize,
    /// Probability of dropping each node-to-node message, in `0.0..=1.0`.
    pub loss: f64,
    /// Seed for the routers' drop decisions.
    pub seed: u64,
    /// Configuration shared by every node.
    pub broadcast: BroadcastConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            loss: 0.0,
            seed: 0,
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    #[must_use]
    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }
}

struct SimNode {
    inbox: mpsc::UnboundedSender<String>,
    server: BroadcastServer,
    gossiper: RunningGossiper,
    run: JoinHandle<Result<()>>,
}

/// A running cluster plus a client attached to every node.
pub struct Cluster {
    ids: Vec<String>,
    nodes: HashMap<String, SimNode>,
    slots: ReplySlots,
    next_msg_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Start every node and complete the init handshake with each.
    pub async fn start(config: ClusterConfig) -> gossamer_broadcast::Result<Self> {
        let ids: Vec<String> = (1..=config.nodes).map(|i| format!("n{}", i)).collect();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let slots: ReplySlots = Arc::default();

        let mut inboxes = HashMap::new();
        let mut inbox_rxs = Vec::new();
        for id in &ids {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(id.clone(), tx);
            inbox_rxs.push(rx);
        }

        let mut nodes = HashMap::new();
        let mut background = Vec::new();

        for (index, (id, inbox_rx)) in ids.iter().zip(inbox_rxs).enumerate() {
            let (input_writer, input_reader) = tokio::io::duplex(PIPE_CAPACITY);
            let (output_writer, output_reader) = tokio::io::duplex(PIPE_CAPACITY);

            let node = Node::new(output_writer);
            let store = Arc::new(ValueStore::new());
            let server = BroadcastServer::new(Arc::clone(&store), config.broadcast.clone());
            server.register(&node)?;

            let gossiper = Gossiper::new(config.broadcast.clone()).start(store, node.clone());
            let run = tokio::spawn(async move { node.run(input_reader).await });

            background.push(tokio::spawn(pump(inbox_rx, input_writer, shutdown_rx.clone())));
            background.push(tokio::spawn(route(
                id.clone(),
                output_reader,
                inboxes.clone(),
                Arc::clone(&slots),
                config.loss,
                StdRng::seed_from_u64(config.seed.wrapping_add(index as u64)),
            )));

            nodes.insert(
                id.clone(),
                SimNode {
                    inbox: inboxes[id].clone(),
                    server,
                    gossiper,
                    run,
                },
            );
        }

        let cluster = Self {
            ids,
            nodes,
            slots,
            next_msg_id: AtomicU64::new(0),
            shutdown,
            background,
        };

        for id in &cluster.ids {
            let reply = cluster
                .request(id, json!({"type": "init", "node_id": id, "node_ids": cluster.ids}))
                .await?;
            debug!(node = %id, reply = %reply.kind(), "Node initialized");
        }

        Ok(cluster)
    }

    /// Every node id, in order.
    pub fn node_ids(&self) -> &[String] {
        &self.ids
    }

    /// Send `body` from the client and wait for the correlated reply.
    ///
    /// An error reply comes back as [`Error::Rpc`].
    pub async fn request(&self, node: &str, body: Json) -> Result<Message> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id, tx);

        let mut body = body;
        body["msg_id"] = json!(msg_id);
        self.deliver(node, body)?;

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::ReplyDropped),
            Err(_) => {
                self.slots
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&msg_id);
                return Err(Error::Timeout(REQUEST_TIMEOUT));
            }
        };

        match reply.rpc_error() {
            Some(e) => Err(Error::Rpc(e)),
            None => Ok(reply),
        }
    }

    /// Send `body` from the client without waiting for anything.
    pub fn send(&self, node: &str, body: Json) -> Result<()> {
        self.deliver(node, body)
    }

    /// `broadcast` a value to `node`.
    pub async fn broadcast(&self, node: &str, value: i64) -> Result<Message> {
        self.request(node, json!({"type": "broadcast", "message": value}))
            .await
    }

    /// `read` the values known to `node`.
    pub async fn read(&self, node: &str) -> Result<BTreeSet<Value>> {
        let reply = self.request(node, json!({"type": "read"})).await?;
        let messages: Vec<Value> = serde_json::from_value(reply.body["messages"].clone())?;
        Ok(messages.into_iter().collect())
    }

    /// Whether `node`'s receive loop is still running.
    pub fn is_running(&self, node: &str) -> bool {
        self.nodes
            .get(node)
            .is_some_and(|sim| !sim.run.is_finished())
    }

    /// Direct look at a node's store, bypassing the protocol.
    pub async fn store_of(&self, node: &str) -> BTreeSet<Value> {
        match self.nodes.get(node) {
            Some(sim) => sim.server.store().snapshot().await,
            None => BTreeSet::new(),
        }
    }

    /// Poll until every node's store contains `expected`, or `deadline` passes.
    pub async fn wait_for_convergence(&self, expected: &BTreeSet<Value>, deadline: Duration) -> bool {
        let poll = async {
            loop {
                let mut converged = true;
                for id in &self.ids {
                    if !self.store_of(id).await.is_superset(expected) {
                        converged = false;
                        break;
                    }
                }
                if converged {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(deadline, poll).await.is_ok()
    }

    /// Stop gossip, close every input, and collect each node's `run` result.
    pub async fn shutdown(self) -> HashMap<String, Result<()>> {
        let mut results = HashMap::new();

        let mut runs = Vec::new();
        for (id, sim) in self.nodes {
            sim.gossiper.stop().await;
            runs.push((id, sim.run));
        }

        // Pumps close the node inputs, which ends each receive loop.
        let _ = self.shutdown.send(true);

        for (id, run) in runs {
            let result = match run.await {
                Ok(result) => result,
                Err(e) => Err(Error::Io(std::io::Error::other(e.to_string()))),
            };
            results.insert(id, result);
        }

        for task in self.background {
            task.abort();
        }
        results
    }

    fn deliver(&self, node: &str, body: Json) -> Result<()> {
        let sim = self.nodes.get(node).ok_or_else(|| {
            Error::Rpc(gossamer_node::RpcError::new(
                gossamer_node::ErrorCode::NodeNotFound,
                format!("no node {}", node),
            ))
        })?;

        let line = Message::new(CLIENT_ID, node, body).to_line()?;
        if sim.inbox.send(line).is_err() {
            warn!(node, "Node input already closed");
        }
        Ok(())
    }
}

/// Feed queued lines into a node's input until shutdown.
async fn pump(
    mut inbox: mpsc::UnboundedReceiver<String>,
    mut input: DuplexStream,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            line = inbox.recv() => {
                let Some(mut line) = line else { break };
                line.push('\n');
                if input.write_all(line.as_bytes()).await.is_err() {
                    // The node stopped reading.
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Deliver everything a node writes.
async fn route(
    from: String,
    output: DuplexStream,
    inboxes: HashMap<String, mpsc::UnboundedSender<String>>,
    slots: ReplySlots,
    loss: f64,
    mut rng: StdRng,
) {
    let mut lines = BufReader::new(output).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg = match Message::from_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(node = %from, "Node wrote an undecodable line: {}", e);
                continue;
            }
        };

        if let Some(inbox) = inboxes.get(&msg.dest) {
            if loss > 0.0 && rng.gen_bool(loss) {
                trace!(src = %msg.src, dest = %msg.dest, msg_type = %msg.kind(), "Dropped");
                continue;
            }
            let _ = inbox.send(line);
            continue;
        }

        let in_reply_to = msg.header().ok().and_then(|h| h.in_reply_to);
        let slot = in_reply_to.and_then(|id| {
            slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
        });
        match slot {
            Some(slot) => {
                let _ = slot.send(msg);
            }
            None => debug!(node = %from, dest = %msg.dest, "Client message with no waiting request"),
        }
    }
}
