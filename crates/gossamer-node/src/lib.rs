//! Gossamer Node - runtime for line-delimited JSON cluster participants
//!
//! A node reads one JSON message per line from an input channel, dispatches
//! each to a handler registered for its `type`, and writes replies and
//! requests as single lines on an output channel.
//!
//! # Overview
//!
//! - **Envelope**: `{"src", "dest", "body"}`, with routing fields in the body
//! - **Handshake**: the runtime answers `init` itself and records the node's
//!   identity and the cluster membership
//! - **Replies**: `reply` routes to the requester and fills in `in_reply_to`
//! - **RPC**: `rpc` registers a one-shot callback; `sync_rpc` awaits the reply
//!   with a deadline
//! - **Errors**: a failing handler produces an `error` reply carrying a
//!   protocol code instead of stopping the node
//!
//! # Example
//!
//! ```rust,ignore
//! use gossamer_node::Node;
//! use serde_json::json;
//!
//! let node = Node::stdio();
//! node.handle("echo", |node, msg| async move {
//!     let echo = msg.body["echo"].clone();
//!     node.reply(&msg, json!({"type": "echo_ok", "echo": echo})).await
//! })?;
//! node.run(tokio::io::stdin()).await?;
//! ```

pub mod error;
pub mod message;
pub mod node;

pub use error::{Error, ErrorCode, Result, RpcError};
pub use message::{Header, Message};
pub use node::{Callback, Handler, Node, NodeIdentity, INIT};
