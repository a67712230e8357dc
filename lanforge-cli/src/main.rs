//! LanForge CLI (spec.md §6 — "external collaborator, illustrative").
//!
//! Owns exactly the things the core doesn't: argument parsing, env var
//! resolution, the stdin command loop, and turning `UiEvent`s into terminal
//! output. Everything stateful — the room, the connection, the migration —
//! lives in `lanforge_core::peer`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use lanforge_core::discovery::Discoverer;
use lanforge_core::peer::{self, PeerConfig, PeerHandle, UiEvent};
use lanforge_core::{coordinator, DeviceId, JoinCode};
use lanforge_transport::tcp::TcpTransport;
use lanforge_transport::{ReliableTransport, DEFAULT_COORDINATOR_PORT};

const DISCOVER_WINDOW: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "lanforge")]
#[command(about = "LanForge: offline LAN multiplayer session continuity", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a coordinator on the default port, connect as its own client,
    /// create a room, and begin announcing it.
    Host { name: Option<String> },
    /// Listen 5s for host announcements and print each one discovered.
    Discover,
    /// Connect to LANFORGE_SERVER_URL (or the default) and join a room.
    Join { name: String, join_code: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let device_id = resolve_device_id();
    let transport: Arc<dyn ReliableTransport> = Arc::new(TcpTransport::new());

    match args.command {
        Command::Host { name } => run_host(device_id, transport, name).await,
        Command::Discover => run_discover().await,
        Command::Join { name, join_code } => {
            if join_code.trim().is_empty() {
                bail!("join requires a joinCode");
            }
            run_join(device_id, transport, name, join_code).await
        }
    }
}

/// `LANFORGE_DEVICE_ID` if set, else a synthesized id held only for the
/// life of this process (spec.md §6 — "persisted state: none").
fn resolve_device_id() -> DeviceId {
    match std::env::var("LANFORGE_DEVICE_ID") {
        Ok(v) if !v.is_empty() => DeviceId::from(v),
        _ => DeviceId::from(format!("dev-{}", uuid::Uuid::new_v4())),
    }
}

fn resolve_name(cli_name: Option<String>, fallback: &str) -> String {
    cli_name
        .or_else(|| std::env::var("LANFORGE_CLIENT_NAME").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| fallback.to_string())
}

fn resolve_server_url() -> String {
    std::env::var("LANFORGE_SERVER_URL").unwrap_or_else(|_| "ws://localhost:8080".to_string())
}

/// Strips a `ws://`/`tcp://` scheme, leaving the bare `host:port` the TCP
/// transport dials.
fn strip_scheme(url: &str) -> &str {
    match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    }
}

async fn run_host(device_id: DeviceId, transport: Arc<dyn ReliableTransport>, name: Option<String>) -> Result<()> {
    let name = resolve_name(name, "Host");
    let bind_addr = format!("0.0.0.0:{DEFAULT_COORDINATOR_PORT}");
    let coordinator_handle = coordinator::spawn(transport.clone(), &bind_addr, None).await?;
    let connect_addr = coordinator_handle.local_addr().to_string();
    tracing::info!("coordinator listening on {connect_addr}");

    let (peer, ui_rx) = peer::spawn(PeerConfig {
        device_id,
        name: name.clone(),
        transport,
        server_addr: connect_addr,
    })
    .await;
    peer.attach_local_coordinator(coordinator_handle);
    peer.create_room(None);

    println!("Hosting as {name}. Type to chat, /kick <deviceId> to remove a member, Ctrl-D to quit.");
    run_session(peer, ui_rx).await
}

async fn run_join(
    device_id: DeviceId,
    transport: Arc<dyn ReliableTransport>,
    name: String,
    join_code: String,
) -> Result<()> {
    let addr = strip_scheme(&resolve_server_url()).to_string();
    let (peer, ui_rx) = peer::spawn(PeerConfig {
        device_id,
        name: name.clone(),
        transport,
        server_addr: addr,
    })
    .await;
    peer.join_room(JoinCode::from(join_code));

    println!("Joining as {name}. Type to chat, /kick <deviceId> to remove a member, Ctrl-D to quit.");
    run_session(peer, ui_rx).await
}

async fn run_discover() -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut discoverer = Discoverer::new();
    discoverer.start(move |host| {
        let _ = tx.send(host);
    }).await?;

    let deadline = tokio::time::sleep(DISCOVER_WINDOW);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            host = rx.recv() => {
                let Some(host) = host else { break };
                println!(
                    "Found Room: roomId={} joinCode={} at {}:{}",
                    host.room_id, host.join_code, host.ip, host.port
                );
            }
        }
    }
    discoverer.stop().await;
    Ok(())
}

/// Drives the interactive session: stdin lines become CHAT/KICK commands,
/// and `UiEvent`s from the peer engine become terminal output, until the
/// user sends EOF (Ctrl-D) or the peer engine shuts down.
async fn run_session(peer: PeerHandle, mut ui_rx: mpsc::UnboundedReceiver<UiEvent>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => dispatch_stdin_line(&peer, line),
                    None => break,
                }
            }
            event = ui_rx.recv() => {
                match event {
                    Some(event) => print_event(event),
                    None => break,
                }
            }
        }
    }
    peer.leave_room();
    peer.shutdown().await;
    Ok(())
}

/// Bare text → CHAT; `/kick <deviceId>` → KICK (spec.md §6).
fn dispatch_stdin_line(peer: &PeerHandle, line: String) {
    if let Some(target) = line.strip_prefix("/kick ") {
        peer.kick(DeviceId::from(target.trim()));
    } else if !line.trim().is_empty() {
        peer.send_chat(line);
    }
}

fn print_event(event: UiEvent) {
    match event {
        UiEvent::Chat { from_name, text, .. } => println!("{from_name}: {text}"),
        UiEvent::Snapshot(s) => {
            tracing::debug!(
                "room {} now has {} member(s), joinCode={}",
                s.room.room_id,
                s.room.members.len(),
                s.room.join_code
            );
        }
        UiEvent::Error { reason, code } => {
            println!("error: {reason}{}", code.map(|c| format!(" ({c})")).unwrap_or_default());
        }
        UiEvent::Kicked { reason } => println!("you were removed from the room: {reason}"),
        UiEvent::MigrationAbandoned => {
            println!("lost the coordinator and could not recover a cached room; exiting");
        }
    }
}
