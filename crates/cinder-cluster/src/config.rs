//! Coordinator configuration.

use std::time::Duration;

use cinder_node::NodeOptions;
use tokio::sync::mpsc;

use crate::error::ConfigError;
use crate::events::ClusterEvent;

/// Configuration for [`ClusterClient::start`](crate::ClusterClient::start).
///
/// All knobs are fixed after construction.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Wait between `CLUSTER SLOTS` refresh attempts while the cluster is
    /// not usable (and after a redirection-triggered refresh).
    pub update_slot_wait: Duration,
    /// Minimum replicas every range must have for the cluster to count as
    /// usable.
    pub min_replicas: usize,
    /// Grace period between dropping a client from the active map and
    /// stopping it, so in-flight replies are not lost.
    pub close_wait: Duration,
    /// Options forwarded to each per-node client.
    pub node: NodeOptions,
    /// Event sinks. Delivery is lossy under backpressure.
    pub subscribers: Vec<mpsc::Sender<ClusterEvent>>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            update_slot_wait: Duration::from_millis(500),
            min_replicas: 1,
            close_wait: Duration::from_secs(10),
            node: NodeOptions::default(),
            subscribers: Vec::new(),
        }
    }
}

impl ClusterOptions {
    /// Validates the options. Called at startup; a failure here is the
    /// only way construction fails.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.update_slot_wait.is_zero() {
            return Err(ConfigError::ZeroUpdateSlotWait);
        }
        Ok(())
    }
}
