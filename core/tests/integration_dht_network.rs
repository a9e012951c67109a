// DHT behavior across a small in-process network: bootstrap population,
// replicated values, signed record resolution, and mailbox drains.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hushlink_core::config::CoreConfig;
use hushlink_core::dht::{DhtNode, RoutingTable, Storage};
use hushlink_core::net::ConnectionManager;
use hushlink_core::{Identity, NodeId};

fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.dht.request_timeout = Duration::from_secs(2);
    config.connection.connect_timeout = Duration::from_secs(2);
    config.dht.rpc_rate.burst = 10_000.0;
    config.dht.rpc_rate.per_second = 10_000.0;
    config
}

fn build_node() -> Arc<DhtNode> {
    let (identity, _) = Identity::generate();
    let identity = Arc::new(identity);
    let config = test_config();
    let routing = Arc::new(RoutingTable::new(identity.node_id(), config.dht.k));
    let storage = Arc::new(Storage::new(config.storage.clone()));
    let connections = ConnectionManager::new(
        config.connection.clone(),
        identity.node_id(),
        identity.encryption_public_key().to_vec(),
        Arc::clone(&routing),
    );
    DhtNode::new(
        identity,
        config.dht.clone(),
        routing,
        storage,
        connections,
    )
}

async fn start_on_loopback(node: &Arc<DhtNode>) -> SocketAddr {
    let bound = node.start(0).await.expect("node starts");
    SocketAddr::new("127.0.0.1".parse().unwrap(), bound.port())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_populates_every_routing_table() {
    let seed = build_node();
    let seed_addr = start_on_loopback(&seed).await;

    let mut nodes = vec![seed];
    for _ in 0..5 {
        let node = build_node();
        start_on_loopback(&node).await;
        node.bootstrap(&[seed_addr]).await.expect("bootstrap");
        nodes.push(node);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    for node in &nodes {
        assert!(
            node.stats().routing_nodes >= 1,
            "every node knows at least one peer"
        );
    }
    // The seed has been contacted by everyone.
    assert!(nodes[0].stats().routing_nodes >= 5);

    for node in &nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn value_survives_the_publisher_leaving() {
    let seed = build_node();
    let seed_addr = start_on_loopback(&seed).await;

    let publisher = build_node();
    start_on_loopback(&publisher).await;
    publisher.bootstrap(&[seed_addr]).await.unwrap();

    let key = NodeId::from_string("durable-key");
    let stored = publisher
        .store_value(key, b"survives churn".to_vec(), 3600)
        .await
        .unwrap();
    assert!(stored >= 1);
    publisher.stop();

    let reader = build_node();
    start_on_loopback(&reader).await;
    reader.bootstrap(&[seed_addr]).await.unwrap();
    assert_eq!(
        reader.find_value(key).await,
        Some(b"survives churn".to_vec())
    );

    seed.stop();
    reader.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn username_records_resolve_across_the_network() {
    let seed = build_node();
    let seed_addr = start_on_loopback(&seed).await;

    let mut nodes = Vec::new();
    for _ in 0..3 {
        let node = build_node();
        start_on_loopback(&node).await;
        node.bootstrap(&[seed_addr]).await.unwrap();
        nodes.push(node);
    }

    nodes[0].publish_public_key("carol").await.unwrap();

    for node in &nodes[1..] {
        let record = node.lookup_public_key("carol").await.unwrap();
        assert!(record.verify_signature());
    }

    seed.stop();
    for node in &nodes {
        node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mailboxes_replicate_and_drain_once() {
    let seed = build_node();
    let seed_addr = start_on_loopback(&seed).await;

    let sender = build_node();
    start_on_loopback(&sender).await;
    sender.bootstrap(&[seed_addr]).await.unwrap();

    let recipient = build_node();
    start_on_loopback(&recipient).await;
    recipient.bootstrap(&[seed_addr]).await.unwrap();

    // The recipient's key hash addresses its mailbox; resolve it the way a
    // sender would, through the published record.
    recipient.publish_public_key("dave").await.unwrap();
    let recipient_pk = sender
        .lookup_public_key("dave")
        .await
        .unwrap()
        .encryption_public_key;

    for content in [b"first".to_vec(), b"second".to_vec(), b"third".to_vec()] {
        sender
            .store_offline_message(&recipient_pk, content)
            .await
            .unwrap();
    }

    let drained = recipient.get_offline_messages().await;
    let firsts: Vec<_> = drained
        .iter()
        .filter(|m| m.as_slice() == b"first")
        .collect();
    assert!(!firsts.is_empty(), "replicated mailbox returns the messages");

    // Replication may duplicate across nodes, but a second drain is empty.
    assert!(recipient.get_offline_messages().await.is_empty());

    seed.stop();
    sender.stop();
    recipient.stop();
}
