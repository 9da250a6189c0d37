//! cinder-node: async TCP client for a single Redis-compatible node.
//!
//! Each node gets one client task that owns the socket. The task connects
//! in the background, reconnects with backoff after failures, pipelines
//! commands with a bounded in-flight queue, and reports connection status
//! (up, down, queue backpressure) on an event channel tagged with the
//! node's address.
//!
//! Commands are fire-and-forget from the caller's perspective: enqueueing
//! never blocks, and the reply arrives on a oneshot channel. A Redis error
//! reply (`-ERR ...`) is a *successful* delivery: the reply resolves
//! `Ok(Frame::Error(..))`; `Err(NodeError)` always means a transport,
//! queue, or lifecycle failure.

mod addr;
mod client;
mod error;

pub use addr::Addr;
pub use client::{
    Auth, ConnectionStatus, DownReason, NodeClient, NodeHandle, NodeOptions, StatusUpdate,
};
pub use error::NodeError;
