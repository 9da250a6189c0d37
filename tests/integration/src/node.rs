//! Node client behavior against a live fake node.

use cinder_cluster::SlotMap;
use cinder_node::{ConnectionStatus, DownReason, NodeClient, NodeOptions};
use tokio::sync::mpsc;

use crate::helpers::{init_logging, slots_reply, FakeNode};

fn fast_options() -> NodeOptions {
    NodeOptions {
        reconnect_wait_min: std::time::Duration::from_millis(20),
        reconnect_wait_max: std::time::Duration::from_millis(100),
        ..NodeOptions::default()
    }
}

#[tokio::test]
async fn handshake_and_slot_fetch() {
    init_logging();
    let node = FakeNode::start("fake-1").await;
    let replica = FakeNode::start("fake-2").await;
    node.set_slots(slots_reply(&[(0, 16383, node.addr(), vec![replica.addr()])]));

    let (status_tx, mut status_rx) = mpsc::channel(16);
    let options = NodeOptions {
        use_cluster_id: true,
        ..fast_options()
    };
    let handle = NodeClient::start(node.addr(), options, status_tx);

    let up = status_rx.recv().await.unwrap();
    assert_eq!(
        up.status,
        ConnectionStatus::Up {
            cluster_id: Some("fake-1".into())
        }
    );

    let reply = handle
        .exec(vec!["CLUSTER".into(), "SLOTS".into()])
        .await
        .unwrap();
    let map = SlotMap::from_frame(&reply).unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.ranges()[0].master, node.addr());
    assert_eq!(map.ranges()[0].replicas, vec![replica.addr()]);
    assert!(map.covers_all_slots());

    handle.stop();
}

#[tokio::test]
async fn survives_a_clean_server_close() {
    init_logging();
    let node = FakeNode::start("fake-1").await;

    let (status_tx, mut status_rx) = mpsc::channel(16);
    let handle = NodeClient::start(node.addr(), fast_options(), status_tx);

    let up = status_rx.recv().await.unwrap();
    assert!(matches!(up.status, ConnectionStatus::Up { .. }));

    node.close_connections();
    let down = status_rx.recv().await.unwrap();
    assert_eq!(
        down.status,
        ConnectionStatus::Down(DownReason::SocketClosed)
    );

    // reconnects on its own and keeps serving commands
    let up = status_rx.recv().await.unwrap();
    assert!(matches!(up.status, ConnectionStatus::Up { .. }));
    let reply = handle.exec(vec!["PING".into()]).await.unwrap();
    assert_eq!(reply.as_str(), Some("PONG"));

    handle.stop();
}
