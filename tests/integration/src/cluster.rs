//! End-to-end coordinator tests against fake cluster nodes.

use std::time::Duration;

use cinder_cluster::{
    key_slot, Addr, ClusterClient, ClusterEvent, ClusterOptions, ConnectionStatus, DownReason,
    NodeOptions, NokReason,
};
use cinder_protocol::Frame;
use tokio::sync::mpsc;

use crate::helpers::{expect_event, init_logging, slots_reply, FakeNode};

fn fast_options(events: mpsc::Sender<ClusterEvent>) -> ClusterOptions {
    ClusterOptions {
        update_slot_wait: Duration::from_millis(50),
        close_wait: Duration::from_millis(100),
        subscribers: vec![events],
        node: NodeOptions {
            reconnect_wait_min: Duration::from_millis(20),
            reconnect_wait_max: Duration::from_millis(100),
            ..NodeOptions::default()
        },
        ..ClusterOptions::default()
    }
}

struct TestCluster {
    nodes: Vec<FakeNode>,
    map: Frame,
    client: ClusterClient,
    events: mpsc::Receiver<ClusterEvent>,
}

impl TestCluster {
    fn node(&self, i: usize) -> &FakeNode {
        &self.nodes[i]
    }

    fn set_slots_everywhere(&self, reply: &Frame) {
        for node in &self.nodes {
            node.set_slots(reply.clone());
        }
    }
}

/// Spins up four fake nodes (two masters, two replicas), starts the
/// coordinator with the masters as seeds, and waits for OK.
async fn start_cluster() -> TestCluster {
    init_logging();

    let mut nodes = Vec::new();
    for name in ["node-a", "node-b", "node-c", "node-d"] {
        nodes.push(FakeNode::start(name).await);
    }
    let map = slots_reply(&[
        (0, 8191, nodes[0].addr(), vec![nodes[2].addr()]),
        (8192, 16383, nodes[1].addr(), vec![nodes[3].addr()]),
    ]);
    for node in &nodes {
        node.set_slots(map.clone());
    }

    let (event_tx, mut events) = mpsc::channel(256);
    let seeds = vec![nodes[0].addr(), nodes[1].addr()];
    let client = ClusterClient::start(seeds, fast_options(event_tx)).unwrap();

    expect_event(&mut events, |e| matches!(e, ClusterEvent::ClusterOk)).await;

    TestCluster {
        nodes,
        map,
        client,
        events,
    }
}

#[tokio::test]
async fn happy_startup_reaches_ok_and_routes() {
    let mut cluster = start_cluster().await;

    let info = cluster.client.slot_map_info().await.unwrap();
    assert_eq!(info.version, 2);
    assert_eq!(info.slot_map.len(), 2);
    // a client exists for every node the map mentions
    assert_eq!(info.clients.len(), 4);
    for node in &cluster.nodes {
        assert!(info.clients.contains_key(&node.addr()));
    }

    // route a command through the snapshot, like a command router would
    let slot = key_slot(b"hello");
    let range = info.slot_map.lookup(slot).unwrap();
    let handle = &info.clients[&range.master];
    let reply = handle.exec(vec!["PING".into()]).await.unwrap();
    assert_eq!(reply, Frame::Simple("PONG".into()));

    // no spurious health or map events after the initial OK; the
    // replicas' own up notifications are the only thing still arriving
    tokio::time::sleep(Duration::from_millis(150)).await;
    while let Ok(event) = cluster.events.try_recv() {
        assert!(
            matches!(event, ClusterEvent::ConnectionStatus { .. }),
            "unexpected event after OK: {event:?}"
        );
    }

    cluster.client.stop().await;
    assert!(cluster.client.slot_map_info().await.is_err());
}

#[tokio::test]
async fn clean_peer_close_keeps_cluster_ok() {
    let mut cluster = start_cluster().await;

    // master b closes its connections cleanly; the listener stays up
    cluster.node(1).close_connections();

    expect_event(&mut cluster.events, |e| {
        matches!(
            e,
            ClusterEvent::ConnectionStatus {
                status: ConnectionStatus::Down(DownReason::SocketClosed),
                ..
            }
        )
    })
    .await;

    // no NOK follows within a grace window
    let nok = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Some(ClusterEvent::ClusterNok(reason)) = cluster.events.recv().await {
                return reason;
            }
        }
    })
    .await;
    assert!(nok.is_err(), "clean close must not flip the cluster NOK");

    let info = cluster.client.slot_map_info().await.unwrap();
    assert_eq!(info.version, 2, "no topology change happened");
    cluster.client.stop().await;
}

#[tokio::test]
async fn master_failure_flips_nok_and_recovery_restores_ok() {
    let mut cluster = start_cluster().await;

    // master b goes away hard: RST on live connections, listener down
    let b_addr = cluster.node(1).addr();
    cluster.node(1).stop();
    cluster.node(1).reset_connections();

    let event = expect_event(&mut cluster.events, |e| {
        matches!(e, ClusterEvent::ClusterNok(_))
    })
    .await;
    assert!(matches!(
        event,
        ClusterEvent::ClusterNok(NokReason::MasterDown)
    ));

    // the node comes back on the same port; the client reconnects and
    // the periodic refresh settles things down
    let revived = FakeNode::start_on("node-b", &b_addr).await;
    revived.set_slots(cluster.map.clone());

    expect_event(&mut cluster.events, |e| matches!(e, ClusterEvent::ClusterOk)).await;
    cluster.client.stop().await;
}

#[tokio::test]
async fn update_slots_picks_up_a_reshuffled_map() {
    let mut cluster = start_cluster().await;

    // the cluster swaps the replicas between the two shards
    let reshuffled = slots_reply(&[
        (0, 8191, cluster.node(0).addr(), vec![cluster.node(3).addr()]),
        (8192, 16383, cluster.node(1).addr(), vec![cluster.node(2).addr()]),
    ]);
    cluster.set_slots_everywhere(&reshuffled);

    // a router observed a redirect against version 2
    cluster.client.update_slots(2, Some(cluster.node(0).addr()));

    let event = expect_event(&mut cluster.events, |e| {
        matches!(e, ClusterEvent::SlotMapUpdated { .. })
    })
    .await;
    let ClusterEvent::SlotMapUpdated { version, slot_map } = event else {
        unreachable!();
    };
    assert_eq!(version, 3);
    let first = &slot_map.ranges()[0];
    assert_eq!(first.replicas, vec![cluster.node(3).addr()]);

    // same nodes, full coverage: health never wavered
    let info = cluster.client.slot_map_info().await.unwrap();
    assert_eq!(info.version, 3);
    assert_eq!(info.clients.len(), 4);
    cluster.client.stop().await;
}

#[tokio::test]
async fn stale_update_slots_hint_is_ignored() {
    let mut cluster = start_cluster().await;

    // a different map is available, but the hint is tagged with an old
    // version, so no refresh happens on its account
    let reshuffled = slots_reply(&[
        (0, 8191, cluster.node(0).addr(), vec![cluster.node(3).addr()]),
        (8192, 16383, cluster.node(1).addr(), vec![cluster.node(2).addr()]),
    ]);
    cluster.set_slots_everywhere(&reshuffled);
    cluster.client.update_slots(1, None);

    let updated = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Some(ClusterEvent::SlotMapUpdated { .. }) = cluster.events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(updated.is_err(), "stale hint must not trigger a refresh");

    let info = cluster.client.slot_map_info().await.unwrap();
    assert_eq!(info.version, 2);
    cluster.client.stop().await;
}

#[tokio::test]
async fn seeds_are_validated_before_spawn() {
    let (event_tx, _events) = mpsc::channel(16);
    let err = ClusterClient::start(vec![], fast_options(event_tx)).unwrap_err();
    assert_eq!(err.to_string(), "at least one seed node is required");

    let (event_tx, _events) = mpsc::channel(16);
    let options = ClusterOptions {
        update_slot_wait: Duration::ZERO,
        ..fast_options(event_tx)
    };
    let err = ClusterClient::start(vec![Addr::new("127.0.0.1", 6379)], options).unwrap_err();
    assert_eq!(err.to_string(), "update_slot_wait must be non-zero");
}
