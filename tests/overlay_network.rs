//! Overlay transport integration tests
//!
//! Stream peers, the mixing queue, the discovery adapters, and mesh
//! topology behavior over real localhost sockets.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use veilnet_core::{Frame, MeshRole, MeshSettings, MeshType, NodeId, OverlayConfig, WireContact};
use veilnet_overlay::{NodeEvent, OverlayNode};

fn test_config() -> OverlayConfig {
    OverlayConfig {
        port: 0,
        cover_traffic_enabled: false,
        mixing_delay_max_ms: 50,
        ..OverlayConfig::default()
    }
}

async fn start_node(
    config: OverlayConfig,
) -> (OverlayNode, mpsc::UnboundedReceiver<NodeEvent>) {
    OverlayNode::start("127.0.0.1".parse().unwrap(), config)
        .await
        .unwrap()
}

async fn wait_for_peer(rx: &mut mpsc::UnboundedReceiver<NodeEvent>) -> u64 {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("peer event timeout")
            .expect("event channel closed");
        if let NodeEvent::PeerConnected { peer_id } = event {
            return peer_id;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mixing_releases_every_frame() {
    let (a, mut a_events) = start_node(test_config()).await;
    let (b, mut b_events) = start_node(test_config()).await;

    let peer = a.connect_peer(b.tcp_addr()).await.unwrap();
    let _ = wait_for_peer(&mut a_events).await;
    let _ = wait_for_peer(&mut b_events).await;

    // 20 frames enter in order; all must come out of the mixer, in
    // whatever order it releases them
    for n in 0..20 {
        assert!(a.send_to_peer(peer, &Frame::AnonymousMessage { payload: json!(n) }));
    }

    let mut seen = HashSet::new();
    while seen.len() < 20 {
        let event = tokio::time::timeout(Duration::from_secs(2), b_events.recv())
            .await
            .expect("mixer release timeout")
            .expect("event channel closed");
        if let NodeEvent::AnonymousMessage { payload } = event {
            seen.insert(payload.as_i64().unwrap());
        }
    }
    assert_eq!(seen.len(), 20);

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_and_store_adapters_reach_the_dht() {
    let (a, mut a_events) = start_node(test_config()).await;
    let (b, mut b_events) = start_node(test_config()).await;

    let peer = a.connect_peer(b.tcp_addr()).await.unwrap();
    let _ = wait_for_peer(&mut a_events).await;
    let _ = wait_for_peer(&mut b_events).await;

    let discovered = NodeId::random();
    assert!(a.send_to_peer(
        peer,
        &Frame::PeerDiscovery {
            contacts: vec![WireContact {
                node_id: discovered,
                address: "127.0.0.1:4567".into(),
            }],
        },
    ));

    let stored_key = NodeId::random();
    assert!(a.send_to_peer(
        peer,
        &Frame::DhtQuery {
            key: stored_key,
            value: Some(json!("pushed over the stream")),
        },
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(b.dht().closest(&discovered, 1)[0].id, discovered);
    assert_eq!(
        b.dht().local_value(&stored_key),
        Some(json!("pushed over the stream"))
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn hole_punch_between_overlay_nodes() {
    let (a, _a_events) = start_node(test_config()).await;
    let (b, _b_events) = start_node(test_config()).await;

    assert!(a.hole_punch(b.dht().local_addr().unwrap()).await.unwrap());

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn structured_leaf_dials_its_supernodes() {
    let supernode_config = OverlayConfig {
        mesh: MeshSettings {
            mesh_type: MeshType::Structured,
            role: MeshRole::Supernode,
            ..MeshSettings::default()
        },
        ..test_config()
    };
    let (supernode, mut supernode_events) = start_node(supernode_config).await;

    let leaf_config = OverlayConfig {
        mesh: MeshSettings {
            mesh_type: MeshType::Structured,
            role: MeshRole::Leaf,
            supernode_list: vec![supernode.tcp_addr().to_string()],
            ..MeshSettings::default()
        },
        ..test_config()
    };
    let (leaf, mut leaf_events) = start_node(leaf_config).await;

    let _ = wait_for_peer(&mut leaf_events).await;
    let _ = wait_for_peer(&mut supernode_events).await;
    assert_eq!(leaf.peer_count(), 1);
    assert_eq!(supernode.peer_count(), 1);

    leaf.shutdown();
    supernode.shutdown();
}
