//! Error types for node client operations.

use thiserror::Error;

/// Transport and lifecycle failures for commands sent to a node.
///
/// A Redis error reply is not a `NodeError`: it comes back as
/// `Ok(Frame::Error(..))` because the command was delivered and answered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The client is not currently connected; the command was not sent.
    #[error("not connected")]
    Disconnected,

    /// The in-flight command queue is full; the command was not sent.
    #[error("command queue full")]
    QueueFull,

    /// The connection failed while the command was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The client was stopped before the command completed.
    #[error("client stopped")]
    Stopped,
}
