//! UDP broadcast discovery.
//!
//! Every node broadcasts a `discovery_request` to the LAN every few
//! seconds and unicasts a `discovery_response` back to any foreign
//! requester. Responses stream to the connection manager, which dials
//! devices it has not connected yet. Broadcast is used over multicast
//! because home routers pass it without IGMP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identity::{self, Identity};

/// UDP port for discovery traffic.
pub const DISCOVERY_PORT: u16 = 50000;

const BROADCAST_ADDR: &str = "255.255.255.255";
const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

const KIND_REQUEST: &str = "discovery_request";
const KIND_RESPONSE: &str = "discovery_response";

/// A peer sighted on the LAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovered {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub ip: String,
    pub tcp_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryPacket {
    #[serde(rename = "type")]
    kind: String,
    device_id: String,
    device_name: String,
    platform: String,
    ip: String,
    tcp_port: u16,
    timestamp: u64,
}

impl DiscoveryPacket {
    fn new(kind: &str, identity: &Identity, tcp_port: u16) -> Self {
        Self {
            kind: kind.to_string(),
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            platform: identity.platform.clone(),
            ip: identity::local_ip(),
            tcp_port,
            timestamp: identity::timestamp(),
        }
    }
}

/// Run discovery until `shutdown` fires: one broadcast loop, one listener.
pub async fn run_discovery(
    identity: Identity,
    tcp_port: u16,
    discovery_port: u16,
    found: mpsc::UnboundedSender<Discovered>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let socket = bind_broadcast_socket(discovery_port)?;
    let socket = Arc::new(socket);
    info!(port = discovery_port, "discovery running");

    let broadcaster = tokio::spawn(broadcast_loop(
        socket.clone(),
        identity.clone(),
        tcp_port,
        discovery_port,
    ));
    let listener = tokio::spawn(listen_loop(
        socket,
        identity,
        tcp_port,
        discovery_port,
        found,
    ));

    let _ = shutdown.changed().await;
    broadcaster.abort();
    listener.abort();
    Ok(())
}

fn bind_broadcast_socket(port: u16) -> Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(std_sock)?)
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    identity: Identity,
    tcp_port: u16,
    discovery_port: u16,
) {
    let dest = format!("{BROADCAST_ADDR}:{discovery_port}");
    loop {
        let packet = DiscoveryPacket::new(KIND_REQUEST, &identity, tcp_port);
        match serde_json::to_vec(&packet) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, &dest).await {
                    debug!("broadcast failed: {e}");
                }
            }
            Err(e) => warn!("encoding discovery packet failed: {e}"),
        }
        tokio::time::sleep(BROADCAST_INTERVAL).await;
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    identity: Identity,
    tcp_port: u16,
    discovery_port: u16,
    found: mpsc::UnboundedSender<Discovered>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("discovery recv failed: {e}");
                continue;
            }
        };
        let packet: DiscoveryPacket = match serde_json::from_slice(&buf[..n]) {
            Ok(packet) => packet,
            // Malformed packets are someone else's traffic on this port.
            Err(_) => continue,
        };
        if packet.device_id == identity.device_id {
            continue;
        }

        match packet.kind.as_str() {
            KIND_REQUEST => {
                let reply = DiscoveryPacket::new(KIND_RESPONSE, &identity, tcp_port);
                if let Ok(data) = serde_json::to_vec(&reply) {
                    let dest = SocketAddr::new(from.ip(), discovery_port);
                    if let Err(e) = socket.send_to(&data, dest).await {
                        debug!("discovery response failed: {e}");
                    }
                }
            }
            KIND_RESPONSE => {
                let _ = found.send(Discovered {
                    device_id: packet.device_id,
                    device_name: packet.device_name,
                    platform: packet.platform,
                    ip: packet.ip,
                    tcp_port: packet.tcp_port,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_wire_format_matches_protocol() {
        let identity = Identity {
            device_id: "dev-1".to_string(),
            device_name: "box".to_string(),
            platform: "pc".to_string(),
        };
        let packet = DiscoveryPacket::new(KIND_REQUEST, &identity, 60000);
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["type"], "discovery_request");
        assert_eq!(value["device_id"], "dev-1");
        assert_eq!(value["tcp_port"], 60000);
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn foreign_junk_does_not_parse() {
        assert!(serde_json::from_slice::<DiscoveryPacket>(b"SSDP-NOTIFY").is_err());
    }
}
