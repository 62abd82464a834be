//! Error types for gossamer-broadcast.

use thiserror::Error;

/// Result type for broadcast operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running a broadcast node.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying node runtime failed.
    #[error("node error: {0}")]
    Node(#[from] gossamer_node::Error),

    /// A configuration value was missing or out of range.
    #[error("config error: {0}")]
    Config(String),
}
