//! Shared fixtures for the end-to-end tests: nodes on ephemeral localhost
//! ports with isolated temp directories, plus a raw TCP client for
//! speaking the wire protocol directly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use lynk::protocol::envelope::{Envelope, MSG_HANDSHAKE};
use lynk::protocol::frame;
use lynk::{ChatStore, Identity, Node, NodeConfig, NodeEvent};

pub struct TestNode {
    pub node: Arc<Node>,
    pub events: UnboundedReceiver<NodeEvent>,
    pub store: Arc<ChatStore>,
    pub port: u16,
    pub dir: TempDir,
}

pub fn identity(device_id: &str) -> Identity {
    Identity {
        device_id: device_id.to_string(),
        device_name: format!("{device_id}-host"),
        platform: "pc".to_string(),
    }
}

pub async fn spawn_node(device_id: &str) -> TestNode {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChatStore::open(dir.path().join("data")).unwrap());
    let config = NodeConfig {
        tcp_port: 0,
        received_dir: dir.path().join("received"),
    };
    let (node, events) = Node::new(identity(device_id), config, store.clone());
    let port = node.start(None).await.unwrap();
    TestNode {
        node,
        events,
        store,
        port,
        dir,
    }
}

/// Dial `from -> to` and wait until the handshake registered both ways.
pub async fn connect(from: &TestNode, to: &TestNode) {
    from.node.connect("127.0.0.1", to.port).await.unwrap();
    let to_id = to.node.identity().device_id.clone();
    let from_id = from.node.identity().device_id.clone();
    wait_until(
        || {
            from.node.peers().iter().any(|p| p.device_id == to_id)
                && to.node.peers().iter().any(|p| p.device_id == from_id)
        },
        "handshake to complete",
    )
    .await;
}

pub async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Pull events until one matches, failing after a few seconds.
pub async fn expect_event<F>(
    events: &mut UnboundedReceiver<NodeEvent>,
    what: &str,
    matches: F,
) -> NodeEvent
where
    F: Fn(&NodeEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Open a raw connection to a node and perform only the handshake.
pub async fn raw_connect(port: u16, identity: &Identity) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let handshake = Envelope::new(identity, MSG_HANDSHAKE, serde_json::Value::Null);
    stream
        .write_all(&frame::encode_json(&handshake).unwrap())
        .await
        .unwrap();
    stream
}

pub async fn send_envelope(stream: &mut TcpStream, envelope: &Envelope) {
    stream
        .write_all(&frame::encode_json(envelope).unwrap())
        .await
        .unwrap();
}

/// True if the remote closes the stream within the timeout. Drains and
/// discards whatever the node sent first.
pub async fn remote_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return true,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => return true,
            Err(_) => return false,
        }
    }
}
