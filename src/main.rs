//! Interactive CLI node.
//!
//! Runs the TCP listener, UDP discovery, and a command shell on stdin.
//! Incoming activity prints asynchronously between prompts. An optional
//! first argument overrides the TCP port so two nodes can share a machine.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use lynk::net::NodeEvent;
use lynk::{discovery, ChatStore, Identity, Node, NodeConfig, TCP_PORT};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tcp_port = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("port must be a number")?,
        None => TCP_PORT,
    };

    let identity = Identity::load_or_create(Path::new("."))?;
    let store = Arc::new(ChatStore::open("data")?);
    let config = NodeConfig {
        tcp_port,
        ..NodeConfig::default()
    };
    let (node, mut events) = Node::new(identity.clone(), config, store);

    let (found_tx, found_rx) = mpsc::unbounded_channel();
    let port = node.start(Some(found_rx)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(discovery::run_discovery(
        identity.clone(),
        port,
        discovery::DISCOVERY_PORT,
        found_tx,
        shutdown_rx,
    ));

    println!("lynk node");
    println!("device: {} ({})", identity.device_name, identity.device_id);
    println!("listening on tcp {port}; type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" {
                    break;
                }
                if let Err(e) = run_command(&node, line).await {
                    println!("error: {e}");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    node.shutdown().await;
    Ok(())
}

async fn run_command(node: &Arc<Node>, line: &str) -> Result<()> {
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "help" => {
            println!("commands:");
            println!("  peers");
            println!("  discoveries");
            println!("  connect <ip> <port>");
            println!("  connect_discovered <device_id>");
            println!("  msg <peer_id> <text>");
            println!("  history <peer_id>");
            println!("  groups");
            println!("  group_create <name> [peer_id,peer_id,...]");
            println!("  group_invite <group_id> <peer_id,peer_id,...>");
            println!("  group_accept <group_id>");
            println!("  group_reject <group_id>");
            println!("  group_send <group_id> <text>");
            println!("  group_history <group_id>");
            println!("  sendfile <peer_id> <path>");
            println!("  quit");
        }
        "peers" => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("no peers");
            }
            for peer in peers {
                println!("{} {}", peer.device_id, peer.device_name);
            }
        }
        "discoveries" => {
            let found = node.discoveries();
            if found.is_empty() {
                println!("no discoveries");
            }
            for d in found {
                println!("{} {} {}:{}", d.device_id, d.device_name, d.ip, d.tcp_port);
            }
        }
        "connect" => {
            let (ip, port) = rest
                .split_once(' ')
                .context("usage: connect <ip> <port>")?;
            let port: u16 = port.trim().parse().context("port must be a number")?;
            node.connect(ip, port).await?;
        }
        "connect_discovered" => {
            anyhow::ensure!(!rest.is_empty(), "usage: connect_discovered <device_id>");
            let found = node
                .discoveries()
                .into_iter()
                .find(|d| d.device_id == rest)
                .context("device not found")?;
            node.connect(&found.ip, found.tcp_port).await?;
        }
        "msg" => {
            let (peer_id, text) = rest.split_once(' ').context("usage: msg <peer_id> <text>")?;
            node.send_direct(peer_id, text).await?;
        }
        "history" => {
            anyhow::ensure!(!rest.is_empty(), "usage: history <peer_id>");
            let entries = node.direct_history(rest)?;
            if entries.is_empty() {
                println!("no history");
            }
            for entry in entries {
                let text = entry.payload["text"].as_str().unwrap_or("");
                println!("{} {}: {}", entry.timestamp, entry.device_id, text);
            }
        }
        "groups" => {
            let groups = node.groups();
            if groups.is_empty() {
                println!("no groups");
            }
            for (group_id, record) in groups {
                let members: Vec<&str> = record.members.iter().map(String::as_str).collect();
                println!(
                    "{group_id} {} master={} members={}",
                    record.name,
                    record.master_id,
                    members.join(",")
                );
            }
        }
        "group_create" => {
            anyhow::ensure!(
                !rest.is_empty(),
                "usage: group_create <name> [peer_id,peer_id,...]"
            );
            let (name, members) = match rest.split_once(' ') {
                Some((name, list)) => (name, parse_id_list(list)),
                None => (rest, Vec::new()),
            };
            let group_id = node.create_group(name, &members).await?;
            println!("group created: {group_id}");
        }
        "group_invite" => {
            let (group_id, list) = rest
                .split_once(' ')
                .context("usage: group_invite <group_id> <peer_id,peer_id,...>")?;
            for peer_id in parse_id_list(list) {
                match node.invite(group_id, &peer_id).await {
                    Ok(()) => println!("invite sent to {peer_id}"),
                    Err(e) => println!("invite to {peer_id} failed: {e}"),
                }
            }
        }
        "group_accept" => {
            anyhow::ensure!(!rest.is_empty(), "usage: group_accept <group_id>");
            node.accept_invite(rest).await?;
            println!("join request sent");
        }
        "group_reject" => {
            anyhow::ensure!(!rest.is_empty(), "usage: group_reject <group_id>");
            node.reject_invite(rest).await?;
            println!("invite rejected");
        }
        "group_send" => {
            let (group_id, text) = rest
                .split_once(' ')
                .context("usage: group_send <group_id> <text>")?;
            node.send_group(group_id, text).await?;
        }
        "group_history" => {
            anyhow::ensure!(!rest.is_empty(), "usage: group_history <group_id>");
            let entries = node.group_history(rest)?;
            if entries.is_empty() {
                println!("no group history");
            }
            for entry in entries {
                let text = entry.payload["text"].as_str().unwrap_or("");
                let sender = entry.payload["from_id"].as_str().unwrap_or(&entry.device_id);
                println!("{} {}: {}", entry.timestamp, sender, text);
            }
        }
        "sendfile" => {
            let (peer_id, path) = rest
                .split_once(' ')
                .context("usage: sendfile <peer_id> <path>")?;
            node.send_file(peer_id, Path::new(path)).await?;
        }
        _ => println!("unknown command; try 'help'"),
    }
    Ok(())
}

fn parse_id_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerConnected { device_id, device_name } => {
            println!("\nconnected: {device_id} ({device_name})");
        }
        NodeEvent::PeerDisconnected { device_id } => {
            println!("\ndisconnected: {device_id}");
        }
        NodeEvent::Discovered { device_id, device_name, ip, tcp_port } => {
            println!("\ndiscovered: {device_id} {device_name} {ip}:{tcp_port}");
        }
        NodeEvent::DirectMessage { device_id, text } => {
            println!("\n[{device_id}] {text}");
        }
        NodeEvent::GroupMessage { group_id, device_id, text } => {
            println!("\n[group {group_id}] {device_id}: {text}");
        }
        NodeEvent::GroupInvite { group_id, name, master_id, inviter_id } => {
            println!("\ninvite: group={group_id} name={name} master={master_id} from={inviter_id}");
            println!("use: group_accept {group_id} or group_reject {group_id}");
        }
        NodeEvent::GroupNotice { text } => {
            println!("\n[group] {text}");
        }
        NodeEvent::SendProgress { filename, bytes_sent, total, .. } => {
            println!("\n[file send] {filename}: {bytes_sent}/{total} bytes");
        }
        NodeEvent::ReceiveProgress { filename, bytes_written, total, .. } => {
            println!("\n[file recv] {filename}: {bytes_written}/{total} bytes");
        }
        NodeEvent::FileSent { device_id, filename } => {
            println!("\n[file sent] {filename} -> {device_id}");
        }
        NodeEvent::FileReceived { device_id, path, .. } => {
            println!("\n[{device_id}] file received: {}", path.display());
        }
        NodeEvent::TransferFailed { device_id, filename } => {
            println!("\n[{device_id}] transfer failed: {filename}");
        }
    }
}
