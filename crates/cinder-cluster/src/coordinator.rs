//! The cluster coordinator actor.
//!
//! One task owns all mutable state: the per-node clients, the
//! reachability and backpressure sets, the slot map and its version, the
//! health classification, and the refresh timer. Everything reaches that
//! state as a message: caller queries carry a oneshot reply channel,
//! client status arrives on a dedicated channel the run loop selects
//! over, and timers post token-tagged tick messages. No other component
//! mutates coordinator state.
//!
//! # Health
//!
//! The cluster is usable ([`ClusterHealth::Ok`]) when the slot map has at
//! least two shards, covers every slot, every range meets the replica
//! minimum, every master is reachable, and no master is backpressured.
//! Transitions are edge-triggered: one event per OK↔NOK flip, never one
//! per reason change. While NOK, a refresh timer keeps `CLUSTER SLOTS`
//! queries going until the topology heals.

use std::collections::{HashMap, HashSet};

use cinder_node::{
    Addr, ConnectionStatus, DownReason, NodeClient, NodeError, NodeHandle, StatusUpdate,
};
use cinder_protocol::Frame;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ClusterOptions;
use crate::error::{ClusterError, ConfigError};
use crate::events::{fan_out, ClusterEvent, NokReason};
use crate::slots::SlotMap;

/// Externally observable cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    /// Usable: complete slot map, reachable masters, no backpressure.
    Ok,
    /// Not usable; refresh queries are running.
    Nok,
}

/// A consistent snapshot of the routing state.
#[derive(Debug, Clone)]
pub struct SlotMapInfo {
    /// Version of the snapshot; bumps on every accepted map change.
    pub version: u64,
    /// The canonical slot map.
    pub slot_map: SlotMap,
    /// Clients for every address the map mentions. Handles are aliases;
    /// they become defunct `close_wait` after an address is dropped from
    /// the map.
    pub clients: HashMap<Addr, NodeHandle>,
}

enum Msg {
    GetSlotMapInfo {
        reply: oneshot::Sender<SlotMapInfo>,
    },
    ConnectNode {
        addr: Addr,
        reply: oneshot::Sender<NodeHandle>,
    },
    UpdateSlots {
        seen_version: u64,
        preferred: Option<Addr>,
    },
    SlotReply {
        version: u64,
        result: Result<Frame, NodeError>,
    },
    RefreshTick {
        token: u64,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Flow {
    Continue,
    Stop,
}

/// Handle to a running cluster coordinator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    tx: mpsc::Sender<Msg>,
}

impl ClusterClient {
    /// Starts the coordinator: validates the options, eagerly opens a
    /// client per seed, and spawns the actor task.
    ///
    /// The cluster starts out NOK; the first refresh fires once a seed
    /// connection comes up. Must be called from within a tokio runtime.
    pub fn start(seeds: Vec<Addr>, options: ClusterOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        if seeds.is_empty() {
            return Err(ConfigError::NoSeeds);
        }

        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = mpsc::channel(256);
        let mut coordinator = Coordinator::new(seeds, options, msg_tx.clone(), status_tx);
        coordinator.open_seed_clients();
        tokio::spawn(coordinator.run(msg_rx, status_rx));

        Ok(Self { tx: msg_tx })
    }

    /// Stops the coordinator: every known client is stopped, then the
    /// actor terminates. Waits for the teardown to be acknowledged.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Stop { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Returns a consistent snapshot of version, slot map, and the
    /// clients serving it.
    pub async fn slot_map_info(&self) -> Result<SlotMapInfo, ClusterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Msg::GetSlotMapInfo { reply: reply_tx })
            .await
            .map_err(|_| ClusterError::Stopped)?;
        reply_rx.await.map_err(|_| ClusterError::Stopped)
    }

    /// Returns the client for `addr`, opening one if the address is
    /// unknown. Used when a MOVED redirect targets a node the slot map
    /// has not mentioned yet.
    pub async fn connect_node(&self, addr: Addr) -> Result<NodeHandle, ClusterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Msg::ConnectNode {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClusterError::Stopped)?;
        reply_rx.await.map_err(|_| ClusterError::Stopped)
    }

    /// Non-blocking hint that the slot map at `seen_version` produced a
    /// redirect. If the version is still current, a refresh is armed
    /// (querying `preferred` when it is a known node); a stale version
    /// means a newer map is already in, and the hint is dropped.
    pub fn update_slots(&self, seen_version: u64, preferred: Option<Addr>) {
        let _ = self.tx.try_send(Msg::UpdateSlots {
            seen_version,
            preferred,
        });
    }
}

struct Coordinator {
    options: ClusterOptions,
    /// Seed addresses, in configuration order. Never mutated; preferred
    /// when choosing whom to query.
    initial_nodes: Vec<Addr>,
    /// Every live client, keyed by address.
    nodes: HashMap<Addr, NodeHandle>,
    /// Addresses whose client currently reports a connection.
    up: HashSet<Addr>,
    /// Master addresses derived from the current slot map.
    masters: HashSet<Addr>,
    /// Addresses whose client reports queue backpressure.
    queue_full: HashSet<Addr>,
    slot_map: SlotMap,
    version: u64,
    health: ClusterHealth,
    /// Token of the armed refresh timer, if any. A tick whose token does
    /// not match belongs to a timer that was superseded and is ignored.
    refresh_token: Option<u64>,
    next_token: u64,
    msg_tx: mpsc::Sender<Msg>,
    status_tx: mpsc::Sender<StatusUpdate>,
}

impl Coordinator {
    fn new(
        seeds: Vec<Addr>,
        options: ClusterOptions,
        msg_tx: mpsc::Sender<Msg>,
        status_tx: mpsc::Sender<StatusUpdate>,
    ) -> Self {
        Self {
            options,
            initial_nodes: seeds,
            nodes: HashMap::new(),
            up: HashSet::new(),
            masters: HashSet::new(),
            queue_full: HashSet::new(),
            slot_map: SlotMap::default(),
            version: 1,
            health: ClusterHealth::Nok,
            refresh_token: None,
            next_token: 0,
            msg_tx,
            status_tx,
        }
    }

    fn open_seed_clients(&mut self) {
        for seed in self.initial_nodes.clone() {
            self.open_client(seed);
        }
    }

    async fn run(
        mut self,
        mut msg_rx: mpsc::Receiver<Msg>,
        mut status_rx: mpsc::Receiver<StatusUpdate>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = msg_rx.recv() => {
                    if let Flow::Stop = self.handle_msg(msg) {
                        break;
                    }
                }
                Some(update) = status_rx.recv() => self.handle_status(update),
                else => break,
            }
        }
        info!("cluster coordinator stopped");
    }

    fn handle_msg(&mut self, msg: Msg) -> Flow {
        match msg {
            Msg::GetSlotMapInfo { reply } => {
                let mut clients = HashMap::new();
                for addr in self.slot_map.addrs() {
                    if let Some(handle) = self.nodes.get(&addr) {
                        clients.insert(addr, handle.clone());
                    }
                }
                let _ = reply.send(SlotMapInfo {
                    version: self.version,
                    slot_map: self.slot_map.clone(),
                    clients,
                });
            }

            Msg::ConnectNode { addr, reply } => {
                let handle = match self.nodes.get(&addr) {
                    Some(handle) => handle.clone(),
                    None => self.open_client(addr),
                };
                let _ = reply.send(handle);
            }

            Msg::UpdateSlots {
                seen_version,
                preferred,
            } => {
                // a stale version means the caller's map predates the
                // current one; a refresh already handled it
                if seen_version == self.version {
                    self.arm_refresh(preferred);
                }
            }

            Msg::SlotReply { version, result } => self.handle_slot_reply(version, result),

            Msg::RefreshTick { token } => {
                if self.refresh_token == Some(token) {
                    self.refresh_token = None;
                    if self.health == ClusterHealth::Nok {
                        self.arm_refresh(None);
                    }
                }
            }

            Msg::Stop { reply } => {
                for (_, handle) in self.nodes.drain() {
                    handle.stop();
                }
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn handle_status(&mut self, update: StatusUpdate) {
        let StatusUpdate { addr, status } = update;
        match &status {
            ConnectionStatus::Up { .. } => {
                debug!("connection to {addr} is up");
                self.up.insert(addr.clone());
            }
            ConnectionStatus::Down(DownReason::SocketClosed) => {
                // a clean peer-side close is recovered by reconnect;
                // dropping the address from `up` here would flip the
                // cluster NOK on every graceful close
                debug!("connection to {addr} closed by peer");
            }
            ConnectionStatus::Down(reason) => {
                debug!("connection to {addr} is down: {reason:?}");
                self.up.remove(&addr);
                self.queue_full.remove(&addr);
            }
            ConnectionStatus::QueueFull => {
                self.queue_full.insert(addr.clone());
            }
            ConnectionStatus::QueueOk => {
                self.queue_full.remove(&addr);
            }
        }

        let is_master = self.masters.contains(&addr);
        self.publish(ClusterEvent::ConnectionStatus {
            addr,
            status,
            is_master,
        });
        self.reclassify();
    }

    /// Handles a `CLUSTER SLOTS` completion tagged with the version that
    /// was current when the query was sent.
    fn handle_slot_reply(&mut self, version: u64, result: Result<Frame, NodeError>) {
        if version < self.version {
            debug!(
                "discarding stale slot reply (version {version}, current {})",
                self.version
            );
            return;
        }

        let frame = match result {
            Ok(Frame::Error(e)) => {
                warn!("CLUSTER SLOTS returned an error: {e}");
                self.publish(ClusterEvent::ClusterSlotsError(e));
                return;
            }
            Ok(frame) => frame,
            Err(e) => {
                // transport or queue failure; the periodic refresh retries
                debug!("slot refresh failed: {e}");
                return;
            }
        };

        let new_map = match SlotMap::from_frame(&frame) {
            Ok(map) => map,
            Err(e) => {
                warn!("undecodable CLUSTER SLOTS reply: {e}");
                self.publish(ClusterEvent::ClusterSlotsError(e.to_string()));
                return;
            }
        };

        if new_map == self.slot_map {
            return;
        }
        self.install_map(new_map);
    }

    /// Applies an accepted slot-map change: opens clients for new
    /// addresses, schedules stale ones for delayed closure, bumps the
    /// version, publishes the update, and reclassifies.
    fn install_map(&mut self, new_map: SlotMap) {
        let new_addrs = new_map.addrs();

        for addr in &new_addrs {
            if !self.nodes.contains_key(addr) {
                self.open_client(addr.clone());
            }
        }

        // a node that is still reachable is kept even when the new map
        // stops mentioning it: maps produced during cluster startup can
        // transiently omit live nodes
        let removed: Vec<Addr> = self
            .nodes
            .keys()
            .filter(|addr| {
                !self.initial_nodes.contains(*addr)
                    && !new_addrs.contains(*addr)
                    && !self.up.contains(*addr)
            })
            .cloned()
            .collect();

        let mut stale = Vec::with_capacity(removed.len());
        for addr in &removed {
            if let Some(handle) = self.nodes.remove(addr) {
                stale.push(handle);
            }
            self.queue_full.remove(addr);
        }
        if !stale.is_empty() {
            debug!(
                "closing {} stale clients after {:?}",
                stale.len(),
                self.options.close_wait
            );
            let close_wait = self.options.close_wait;
            tokio::spawn(async move {
                // grace period so in-flight replies on these clients can
                // still be delivered
                tokio::time::sleep(close_wait).await;
                for handle in stale {
                    handle.stop();
                }
            });
        }

        self.version += 1;
        self.masters = new_map.masters();
        self.slot_map = new_map;
        info!(
            "slot map updated: version {}, {} ranges, {} nodes",
            self.version,
            self.slot_map.len(),
            self.nodes.len()
        );
        self.publish(ClusterEvent::SlotMapUpdated {
            slot_map: self.slot_map.clone(),
            version: self.version,
        });
        self.reclassify();
    }

    fn open_client(&mut self, addr: Addr) -> NodeHandle {
        debug!("opening client for {addr}");
        let handle = NodeClient::start(
            addr.clone(),
            self.options.node.clone(),
            self.status_tx.clone(),
        );
        self.nodes.insert(addr, handle.clone());
        handle
    }

    /// Derives the first failing health check, or `None` when usable.
    fn classify(&self) -> Option<NokReason> {
        if self.slot_map.len() < 2 {
            Some(NokReason::TooFewNodes)
        } else if !self.slot_map.covers_all_slots() {
            Some(NokReason::NotAllSlotsCovered)
        } else if !self.slot_map.has_min_replicas(self.options.min_replicas) {
            Some(NokReason::TooFewReplicas)
        } else if !self.masters.is_subset(&self.up) {
            Some(NokReason::MasterDown)
        } else if !self.masters.is_disjoint(&self.queue_full) {
            Some(NokReason::MasterQueueFull)
        } else {
            None
        }
    }

    /// Recomputes health after any mutation of `up`, `queue_full`,
    /// `masters`, or the slot map, emitting edge events and keeping the
    /// refresh timer in step.
    fn reclassify(&mut self) {
        match (self.health, self.classify()) {
            (ClusterHealth::Ok, Some(reason)) => {
                warn!("cluster not usable: {reason}");
                self.health = ClusterHealth::Nok;
                self.publish(ClusterEvent::ClusterNok(reason));
                self.arm_refresh(None);
            }
            (ClusterHealth::Nok, Some(_)) => {
                // reason changes while already NOK are not re-notified
                if self.refresh_token.is_none() {
                    self.arm_refresh(None);
                }
            }
            (ClusterHealth::Nok, None) => {
                info!("cluster usable");
                self.health = ClusterHealth::Ok;
                self.publish(ClusterEvent::ClusterOk);
                // disarm: a tick already in flight no longer matches
                self.refresh_token = None;
            }
            (ClusterHealth::Ok, None) => {}
        }
    }

    /// Arms the refresh: sends one `CLUSTER SLOTS` query and starts the
    /// one-shot timer. A no-op when already armed; returns without arming
    /// when no node is reachable (reclassification retries once `up`
    /// grows).
    fn arm_refresh(&mut self, preferred: Option<Addr>) {
        if self.refresh_token.is_some() {
            return;
        }
        let Some(target) = self.pick_target(preferred) else {
            debug!("no reachable node to refresh the slot map from");
            return;
        };
        self.send_cluster_slots(&target);

        let token = self.next_token;
        self.next_token += 1;
        self.refresh_token = Some(token);

        let tx = self.msg_tx.clone();
        let wait = self.options.update_slot_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            // the coordinator may be gone; a lost tick is harmless
            let _ = tx.send(Msg::RefreshTick { token }).await;
        });
    }

    /// Picks whom to ask for `CLUSTER SLOTS`: the preferred node when it
    /// is still known, else the first reachable seed, else the smallest
    /// reachable address (deterministic), else nobody.
    fn pick_target(&self, preferred: Option<Addr>) -> Option<Addr> {
        if let Some(addr) = preferred {
            if self.nodes.contains_key(&addr) {
                return Some(addr);
            }
        }
        for seed in &self.initial_nodes {
            if self.up.contains(seed) {
                return Some(seed.clone());
            }
        }
        self.up.iter().min().cloned()
    }

    /// Issues `CLUSTER SLOTS` asynchronously; the completion posts a
    /// version-tagged message back to the mailbox. The actor never awaits
    /// the reply inline.
    fn send_cluster_slots(&self, target: &Addr) {
        let Some(handle) = self.nodes.get(target) else {
            return;
        };
        debug!("refreshing slot map from {target}");
        let pending = handle.command(vec!["CLUSTER".into(), "SLOTS".into()]);
        let tx = self.msg_tx.clone();
        let version = self.version;
        tokio::spawn(async move {
            let result = pending.await.unwrap_or(Err(NodeError::Stopped));
            let _ = tx.send(Msg::SlotReply { version, result }).await;
        });
    }

    fn publish(&self, event: ClusterEvent) {
        fan_out(&self.options.subscribers, &event);
    }
}
