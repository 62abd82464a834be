//! Node Runtime - identity, handler dispatch, request/reply correlation.
//!
//! A [`Node`] reads newline-delimited JSON messages from an input channel and
//! writes them to an output channel. Each received message runs on its own
//! tokio task, so a slow handler never stalls the receive loop.
//!
//! # Shared state
//!
//! Three independently guarded resources, none held across handler logic:
//!
//! - handler registry: written during setup, read once per message
//! - pending RPCs: `msg_id` counter plus reply callbacks, held for O(1) bookkeeping
//! - output writer: held for exactly one line, so lines never interleave
//!
//! # Routing
//!
//! ```text
//! line ─► Message::from_line ─► header
//!           in_reply_to set?  ─► pending callback (or drop as orphan)
//!           type == "init"    ─► built-in handshake
//!           otherwise         ─► registered handler (or fatal NoHandler)
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, ErrorCode, Result, RpcError};
use crate::message::{body_object, Message};

/// Message type of the initialization handshake, answered by the runtime itself.
pub const INIT: &str = "init";

/// A registered request handler.
///
/// Handlers receive a handle to the node they run on, so they never need to
/// capture one (which would keep the node alive through its own registry).
pub type Handler = Arc<dyn Fn(Node, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A one-shot reply callback registered by [`Node::rpc`].
pub type Callback = Box<dyn FnOnce(Message) -> BoxFuture<'static, Result<()>> + Send>;

/// Identity assigned by the init handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// This node's id.
    pub id: String,
    /// Every node in the cluster, including this one.
    pub peer_ids: Vec<String>,
}

#[derive(Deserialize)]
struct InitPayload {
    node_id: String,
    #[serde(default)]
    node_ids: Vec<String>,
}

#[derive(Default)]
struct PendingRpcs {
    next_msg_id: u64,
    callbacks: HashMap<u64, Callback>,
}

struct Inner {
    identity: OnceLock<NodeIdentity>,
    handlers: RwLock<HashMap<String, Handler>>,
    pending: Mutex<PendingRpcs>,
    output: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

/// A cluster participant speaking line-delimited JSON.
///
/// Cloning is cheap; all clones share one identity, registry, and output.
/// Separate `Node::new` calls produce fully independent nodes.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.inner.identity.get())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node that writes its outbound messages to `output`.
    pub fn new<W>(output: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                identity: OnceLock::new(),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(PendingRpcs::default()),
                output: tokio::sync::Mutex::new(Box::new(output)),
            }),
        }
    }

    /// Create a node writing to the process's stdout.
    ///
    /// Pair with `node.run(tokio::io::stdin())`.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Set this node's identity. Happens exactly once per node.
    pub fn initialize(&self, id: impl Into<String>, peer_ids: Vec<String>) -> Result<()> {
        let identity = NodeIdentity {
            id: id.into(),
            peer_ids,
        };
        let id = identity.id.clone();
        let peers = identity.peer_ids.len();

        self.inner
            .identity
            .set(identity)
            .map_err(|_| Error::AlreadyInitialized)?;

        info!(node_id = %id, peers, "Node initialized");
        Ok(())
    }

    /// The identity set by the init handshake, if it has happened.
    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.inner.identity.get()
    }

    /// This node's id, if initialized.
    pub fn id(&self) -> Option<&str> {
        self.identity().map(|identity| identity.id.as_str())
    }

    /// Every node id in the cluster (empty before initialization).
    pub fn peer_ids(&self) -> &[String] {
        self.identity()
            .map(|identity| identity.peer_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the init handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.inner.identity.get().is_some()
    }

    /// Register the handler for one message type.
    ///
    /// Fails immediately with [`Error::DuplicateHandler`] if the type already
    /// has a handler; `init` is always taken by the runtime.
    pub fn handle<F, Fut>(&self, msg_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let msg_type = msg_type.into();
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if msg_type == INIT || handlers.contains_key(&msg_type) {
            return Err(Error::DuplicateHandler(msg_type));
        }

        debug!(msg_type = %msg_type, "Registered handler");
        let handler: Handler = Arc::new(move |node: Node, msg: Message| handler(node, msg).boxed());
        handlers.insert(msg_type, handler);
        Ok(())
    }

    /// Send a fire-and-forget message. Never waits for a remote response.
    pub async fn send<B: Serialize>(&self, dest: &str, body: B) -> Result<()> {
        let src = self.id().ok_or(Error::NotInitialized)?.to_string();
        self.write(&src, dest, body_object(body)?).await
    }

    /// Reply to `request`, routing to its sender and setting `in_reply_to`.
    ///
    /// Requests without a `msg_id` expect no reply, so nothing is sent.
    pub async fn reply<B: Serialize>(&self, request: &Message, body: B) -> Result<()> {
        let Some(msg_id) = request.header()?.msg_id else {
            trace!(src = %request.src, msg_type = %request.kind(), "Request has no msg_id, not replying");
            return Ok(());
        };

        let mut body = body_object(body)?;
        body.insert("in_reply_to".to_string(), Value::from(msg_id));

        // Before init the only sensible source is the address we were reached at.
        let src = self.id().unwrap_or(&request.dest).to_string();
        self.write(&src, &request.src, body).await
    }

    /// Send a request and invoke `on_reply` once, on its own task, when the
    /// correlated reply arrives.
    ///
    /// Returns the allocated `msg_id`. If no reply ever arrives the callback
    /// stays registered.
    pub async fn rpc<B, F, Fut>(&self, dest: &str, body: B, on_reply: F) -> Result<u64>
    where
        B: Serialize,
        F: FnOnce(Message) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let src = self.id().ok_or(Error::NotInitialized)?.to_string();
        let mut body = body_object(body)?;

        let msg_id = {
            let mut pending = self.lock_pending();
            pending.next_msg_id += 1;
            let msg_id = pending.next_msg_id;
            let callback: Callback = Box::new(move |reply: Message| on_reply(reply).boxed());
            pending.callbacks.insert(msg_id, callback);
            msg_id
        };
        body.insert("msg_id".to_string(), Value::from(msg_id));

        if let Err(e) = self.write(&src, dest, body).await {
            self.forget(msg_id);
            return Err(e);
        }
        Ok(msg_id)
    }

    /// Send a request and wait for its reply, suspending only the caller.
    ///
    /// An error reply comes back as [`Error::Rpc`]. On timeout (or if this
    /// future is dropped) the callback is removed, so a late reply is logged
    /// and dropped as an orphan. The request itself is not retracted.
    pub async fn sync_rpc<B: Serialize>(&self, dest: &str, body: B, timeout: Duration) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let msg_id = self
            .rpc(dest, body, move |reply| async move {
                // The waiter may have given up already.
                let _ = tx.send(reply);
                Ok(())
            })
            .await?;
        let _slot = PendingSlot {
            node: self,
            msg_id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => match reply.rpc_error() {
                Some(e) => Err(Error::Rpc(e)),
                None => Ok(reply),
            },
            Ok(Err(_)) => Err(Error::ReplyDropped),
            Err(_) => {
                debug!(dest, msg_id, ?timeout, "RPC timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_rpcs(&self) -> usize {
        self.lock_pending().callbacks.len()
    }

    /// Run the receive loop until `input` is exhausted.
    ///
    /// Returns once every dispatched handler and callback has finished. A
    /// malformed line or a request with no handler is fatal: the loop stops
    /// reading, aborts in-flight work, and returns the error.
    pub async fn run<R>(&self, input: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(input).lines();
        let mut tasks = JoinSet::new();

        let outcome = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::Io(e)),
            };

            if line.trim().is_empty() {
                continue;
            }

            if let Err(e) = self.dispatch(&line, &mut tasks) {
                break Err(e);
            }

            // Reap finished tasks so the set only tracks in-flight work.
            while tasks.try_join_next().is_some() {}
        };

        match outcome {
            Ok(()) => {
                debug!(in_flight = tasks.len(), "Input closed, waiting for handlers");
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        error!("Handler task failed: {}", e);
                    }
                }
                info!("Receive loop finished");
                Ok(())
            }
            Err(e) => {
                error!("Receive loop stopped: {}", e);
                tasks.shutdown().await;
                Err(e)
            }
        }
    }

    fn dispatch(&self, line: &str, tasks: &mut JoinSet<()>) -> Result<()> {
        let msg = Message::from_line(line)?;
        let header = msg.header()?;
        trace!(src = %msg.src, msg_type = %header.kind, msg_id = ?header.msg_id, "Received");

        if let Some(in_reply_to) = header.in_reply_to {
            let callback = self.lock_pending().callbacks.remove(&in_reply_to);
            match callback {
                Some(callback) => {
                    tasks.spawn(run_callback(callback, msg));
                }
                None => debug!(in_reply_to, src = %msg.src, "Ignoring reply with no pending callback"),
            }
            return Ok(());
        }

        let node = self.clone();
        if header.kind == INIT {
            tasks.spawn(async move {
                let init = node.clone();
                node.invoke(msg, move |msg| async move { init.handle_init(msg).await })
                    .await;
            });
            return Ok(());
        }

        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&header.kind)
            .cloned()
            .ok_or(Error::NoHandler {
                msg_type: header.kind,
            })?;

        tasks.spawn(async move {
            let handler_node = node.clone();
            node.invoke(msg, move |msg| handler(handler_node, msg)).await;
        });
        Ok(())
    }

    /// Run one handler, converting any failure into an error reply.
    async fn invoke<F, Fut>(&self, msg: Message, handler: F)
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let request = msg.clone();
        let outcome = AssertUnwindSafe(async move { handler(msg).await })
            .catch_unwind()
            .await;

        let rpc_error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(Error::Rpc(e))) => {
                debug!(msg_type = %request.kind(), code = e.code.code(), "Handler returned protocol error: {}", e.text);
                e
            }
            Ok(Err(e)) => {
                warn!(msg_type = %request.kind(), src = %request.src, "Handler failed: {}", e);
                e.into_rpc_error()
            }
            Err(panic) => {
                let text = panic_message(panic.as_ref());
                error!(msg_type = %request.kind(), src = %request.src, "Handler panicked: {}", text);
                RpcError::crash(format!("handler panicked: {}", text))
            }
        };

        if let Err(e) = self.reply(&request, rpc_error.to_body()).await {
            warn!("Failed to send error reply: {}", e);
        }
    }

    async fn handle_init(&self, msg: Message) -> Result<()> {
        let init: InitPayload = msg.payload()?;
        self.initialize(init.node_id, init.node_ids)
            .map_err(|e| match e {
                Error::AlreadyInitialized => Error::Rpc(RpcError::new(
                    ErrorCode::MalformedRequest,
                    "node already initialized",
                )),
                other => other,
            })?;
        self.reply(&msg, serde_json::json!({ "type": "init_ok" })).await
    }

    async fn write(&self, src: &str, dest: &str, body: Map<String, Value>) -> Result<()> {
        let msg = Message::new(src, dest, Value::Object(body));
        let mut line = msg.to_line()?;
        line.push('\n');

        let mut output = self.inner.output.lock().await;
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
        drop(output);

        trace!(dest, msg_type = %msg.kind(), "Sent");
        Ok(())
    }

    fn forget(&self, msg_id: u64) {
        self.lock_pending().callbacks.remove(&msg_id);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingRpcs> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a `sync_rpc` callback when the waiter goes away. A no-op if the
/// reply already consumed it.
struct PendingSlot<'a> {
    node: &'a Node,
    msg_id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.node.forget(self.msg_id);
    }
}

async fn run_callback(callback: Callback, reply: Message) {
    let in_reply_to = reply.header().ok().and_then(|h| h.in_reply_to);
    match AssertUnwindSafe(async move { callback(reply).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(?in_reply_to, "Reply callback failed: {}", e),
        Err(panic) => error!(?in_reply_to, "Reply callback panicked: {}", panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
