//! Error types for cluster coordination.

use thiserror::Error;

/// Construction-time configuration errors.
///
/// These are the only errors that fail fast: the coordinator absorbs all
/// data-plane errors once it is running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one seed node is required")]
    NoSeeds,

    #[error("update_slot_wait must be non-zero")]
    ZeroUpdateSlotWait,
}

/// Errors surfaced by the public API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The coordinator task has stopped; the handle is defunct.
    #[error("cluster coordinator stopped")]
    Stopped,
}
