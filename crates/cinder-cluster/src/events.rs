//! Cluster state-change events.
//!
//! Everything observable about the coordinator flows through
//! [`ClusterEvent`]: health edges, accepted slot-map changes, refresh
//! errors, and per-client connection status decorated with master-ness.
//! Delivery is fire-and-forget: a slow subscriber loses events rather
//! than blocking the coordinator.

use std::fmt;

use cinder_node::{Addr, ConnectionStatus};
use tokio::sync::mpsc;
use tracing::debug;

use crate::slots::SlotMap;

/// Why the cluster is not usable.
///
/// Reasons are evaluated in this order; the first failing check wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NokReason {
    /// The slot map lists fewer than two shards.
    TooFewNodes,
    /// The ranges do not contiguously cover all 16384 slots.
    NotAllSlotsCovered,
    /// Some range has fewer replicas than the configured minimum.
    TooFewReplicas,
    /// A master is not reachable.
    MasterDown,
    /// A master's command queue is backpressured.
    MasterQueueFull,
}

impl fmt::Display for NokReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NokReason::TooFewNodes => "too_few_nodes",
            NokReason::NotAllSlotsCovered => "not_all_slots_covered",
            NokReason::TooFewReplicas => "too_few_replicas",
            NokReason::MasterDown => "master_down",
            NokReason::MasterQueueFull => "master_queue_full",
        };
        f.write_str(s)
    }
}

/// Events delivered to coordinator subscribers.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// The cluster became usable. Edge-triggered.
    ClusterOk,
    /// The cluster became unusable. Edge-triggered; subsequent reason
    /// changes while already NOK are not re-notified.
    ClusterNok(NokReason),
    /// A slot-map change was accepted. Fired exactly once per change.
    SlotMapUpdated { slot_map: SlotMap, version: u64 },
    /// A `CLUSTER SLOTS` refresh got a Redis-side error or an
    /// undecodable payload. Health is unaffected.
    ClusterSlotsError(String),
    /// A per-client transport event, decorated with whether the address
    /// is currently a known master.
    ConnectionStatus {
        addr: Addr,
        status: ConnectionStatus,
        is_master: bool,
    },
}

/// Fans an event out to every subscriber without blocking.
pub(crate) fn fan_out(subscribers: &[mpsc::Sender<ClusterEvent>], event: &ClusterEvent) {
    for (i, tx) in subscribers.iter().enumerate() {
        if tx.try_send(event.clone()).is_err() {
            debug!("subscriber {i} not keeping up, dropping event");
        }
    }
}
