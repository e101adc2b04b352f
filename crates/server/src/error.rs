//! Structured errors for the invalidation bridge.
//!
//! None of these are fatal to a request: the proxy logs them and moves on.

use std::io;
use std::net::SocketAddr;

/// Errors raised while sending, receiving or handling bridge messages.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Message could not be serialized.
    #[error("BRIDGE_ENCODE: {0}")]
    Encode(String),

    /// Inbound datagram or payload was not a valid message.
    #[error("BRIDGE_DECODE: {0}")]
    Decode(String),

    /// Delivery to one sibling failed.
    #[error("BRIDGE_SEND: {peer}: {source}")]
    Send { peer: String, source: io::Error },

    /// Transport socket could not be bound.
    #[error("BRIDGE_BIND: {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    /// A registered action handler failed.
    #[error("BRIDGE_HANDLER: {action}: {reason}")]
    Handler { action: String, reason: String },
}
