//! Teardown-contract tests: the process map must be empty before the
//! broker stops, disconnected peers are reaped, and detached handles are
//! rejected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comrpc::{
    BrokerConfig, BrokerError, Communicator, CommunicatorClient, LocalObject, NodeId,
    ObjectResolver, ProxyRegistry,
};

fn unique_node(label: &str) -> NodeId {
    let id = std::process::id();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    NodeId::new(
        std::env::temp_dir()
            .join(format!("comrpc-{}-{}-{}.sock", label, id, ts))
            .to_string_lossy()
            .into_owned(),
    )
}

struct NoObjects;

#[async_trait]
impl ObjectResolver for NoObjects {
    async fn resolve(
        &self,
        _class_name: Option<&str>,
        _interface_id: u32,
        _version: u32,
    ) -> Option<Arc<dyn LocalObject>> {
        None
    }
}

fn broker(node: &NodeId) -> Communicator {
    Communicator::new(
        node.clone(),
        Arc::new(NoObjects),
        ProxyRegistry::new(),
        BrokerConfig::default(),
    )
    .expect("broker must bind")
}

#[tokio::test]
async fn test_close_with_live_process_is_rejected() {
    let node = unique_node("close-live");
    let broker = broker(&node);

    let client = CommunicatorClient::new(node, ProxyRegistry::new(), BrokerConfig::default());
    client.open(Duration::from_secs(2)).await.unwrap();

    let pid = std::process::id();
    assert_eq!(broker.process_count(), 1);

    // Stopping with a live peer violates the teardown contract; the
    // listener must remain untouched.
    match broker.close().await {
        Err(BrokerError::ProcessesAlive(n)) => assert_eq!(n, 1),
        other => panic!("expected ProcessesAlive, got {:?}", other.err()),
    }

    // The listener is still accepting: terminate the peer and stop.
    let process = broker.process(pid).expect("peer is still registered");
    process.terminate().await.unwrap();
    assert_eq!(broker.process_count(), 0);
    broker.close().await.unwrap();

    let _ = client.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_terminate_revokes_served_and_closes_channel() {
    let node = unique_node("terminate");
    let broker = broker(&node);

    let client = CommunicatorClient::new(node, ProxyRegistry::new(), BrokerConfig::default());
    client.open(Duration::from_secs(2)).await.unwrap();
    assert!(client.is_open());

    let pid = std::process::id();
    let process = broker.process(pid).unwrap();
    assert!(process.is_valid());

    process.terminate().await.unwrap();
    assert!(!process.is_valid(), "terminate closes the peer channel");
    assert_eq!(broker.process_count(), 0);

    // Terminating again through the same handle is a no-op.
    process.terminate().await.unwrap();

    broker.close().await.unwrap();
    let _ = client.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_disconnected_peer_is_reaped() {
    let node = unique_node("reap");
    let broker = broker(&node);

    let client = CommunicatorClient::new(node, ProxyRegistry::new(), BrokerConfig::default());
    client.open(Duration::from_secs(2)).await.unwrap();
    assert_eq!(broker.process_count(), 1);

    client.close(Duration::from_secs(1)).await.unwrap();

    // The connection task notices the disconnect and flushes the entry.
    let mut reaped = false;
    for _ in 0..100 {
        broker.reap_closed();
        if broker.process_count() == 0 {
            reaped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reaped, "disconnected peer must be flushed from the map");

    broker.close().await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "detached")]
async fn test_terminate_on_detached_handle_is_flagged() {
    let node = unique_node("detached");
    let broker = broker(&node);

    let client = CommunicatorClient::new(node, ProxyRegistry::new(), BrokerConfig::default());
    client.open(Duration::from_secs(2)).await.unwrap();

    let pid = std::process::id();
    let process = broker.process(pid).unwrap();
    process.terminate().await.unwrap();
    broker.close().await.unwrap();
    drop(broker);

    // The owning communicator is gone; using the handle is a caller bug.
    let _ = process.terminate().await;
}
