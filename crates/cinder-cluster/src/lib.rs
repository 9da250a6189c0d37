//! cinder-cluster: topology coordinator for a Redis Cluster client.
//!
//! The coordinator owns one client per cluster node, keeps a local slot
//! map reconciled against the authoritative topology (via `CLUSTER
//! SLOTS`), classifies cluster health, and publishes state-change events.
//! Command routers sit on top: they take snapshots with
//! [`ClusterClient::slot_map_info`], route keys with [`key_slot`] and
//! [`SlotMap::lookup`], and feed redirects back through
//! [`ClusterClient::connect_node`] and [`ClusterClient::update_slots`].
//!
//! # Quick start
//!
//! ```rust,ignore
//! use cinder_cluster::{Addr, ClusterClient, ClusterOptions, key_slot};
//!
//! let seeds = vec![Addr::new("redis-1", 6379), Addr::new("redis-2", 6379)];
//! let cluster = ClusterClient::start(seeds, ClusterOptions::default())?;
//!
//! let info = cluster.slot_map_info().await?;
//! let slot = key_slot(b"user:42");
//! if let Some(range) = info.slot_map.lookup(slot) {
//!     let node = &info.clients[&range.master];
//!     let reply = node.exec(vec!["GET".into(), "user:42".into()]).await?;
//! }
//! ```

mod config;
mod coordinator;
mod error;
mod events;
mod redirect;
mod slots;

pub use cinder_node::{
    Addr, Auth, ConnectionStatus, DownReason, NodeError, NodeHandle, NodeOptions,
};
pub use config::ClusterOptions;
pub use coordinator::{ClusterClient, ClusterHealth, SlotMapInfo};
pub use error::{ClusterError, ConfigError};
pub use events::{ClusterEvent, NokReason};
pub use redirect::{Redirect, RedirectKind};
pub use slots::{key_slot, SlotMap, SlotMapError, SlotRange, SLOT_COUNT};
