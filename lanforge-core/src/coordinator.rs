//! Coordinator (C4, spec.md §4.4).
//!
//! One actor task owns the `RoomRegistry`; every accepted connection gets
//! its own task that owns the `Connection` object and forwards decoded
//! frames to the actor over an unbounded channel, then relays the actor's
//! replies back out over the same connection. This mirrors the pack's
//! room-actor shape (mpsc command channel, the connection's own outbound
//! sender standing in for a reply channel) generalized from a single room
//! actor to a whole coordinator process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use lanforge_transport::{Connection, Listener, ReliableTransport};

use crate::error::{CoordinatorError, ErrorCode, RoomError};
use crate::ids::{fresh_client_id, ClientId, DeviceId, RoomId};
use crate::protocol::{
    decode_frame, encode_frame, now_ms, ChatPayload, CreateRoomPayload, Frame, FramePayload,
    HelloPayload, JoinRoomPayload, KickPayload,
};
use crate::room::{ChatEntry, RoomRegistry, Snapshot};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

struct ConnState {
    device_id: Option<DeviceId>,
    name: Option<String>,
    room_id: Option<RoomId>,
    last_active: Instant,
    outbound: mpsc::UnboundedSender<String>,
}

enum ActorMsg {
    Accepted {
        client_id: ClientId,
        outbound: mpsc::UnboundedSender<String>,
    },
    Frame {
        client_id: ClientId,
        frame: Frame,
    },
    Malformed {
        client_id: ClientId,
        reason: String,
    },
    Closed {
        client_id: ClientId,
    },
    HeartbeatTick,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A running coordinator. Dropping this handle leaks its background tasks;
/// call [`CoordinatorHandle::shutdown`] to release the listening port.
pub struct CoordinatorHandle {
    local_addr: String,
    actor_tx: mpsc::UnboundedSender<ActorMsg>,
    stop: Arc<Notify>,
    accept_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    actor_task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stops accepting new connections, drains the actor, and waits for
    /// every background task to finish so the port can be re-bound
    /// immediately (spec.md §5: "the coordinator must release it cleanly
    /// on stop so that a future re-election on the same device succeeds").
    pub async fn shutdown(self) {
        self.stop.notify_waiters();
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.actor_tx.send(ActorMsg::Shutdown { reply: reply_tx });
        let _ = reply_rx.await;
        let _ = self.accept_task.await;
        let _ = self.heartbeat_task.await;
        let _ = self.actor_task.await;
    }
}

/// Binds `bind_addr` on `transport` and starts serving. If `restore` is
/// given, the room registry is seeded from it before the first connection
/// is accepted (spec.md §4.4 "Restore").
pub async fn spawn(
    transport: Arc<dyn ReliableTransport>,
    bind_addr: &str,
    restore: Option<Snapshot>,
) -> anyhow::Result<CoordinatorHandle> {
    let listener = transport.bind(bind_addr).await?;
    let local_addr = listener.local_addr();

    let mut registry = RoomRegistry::new();
    if let Some(snapshot) = restore {
        registry.restore(snapshot);
    }

    let (actor_tx, actor_rx) = mpsc::unbounded_channel();
    let stop = Arc::new(Notify::new());

    let actor_task = tokio::spawn(run_actor(registry, actor_rx));

    let accept_tx = actor_tx.clone();
    let accept_stop = stop.clone();
    let accept_task = tokio::spawn(accept_loop(listener, accept_tx, accept_stop));

    let heartbeat_tx = actor_tx.clone();
    let heartbeat_stop = stop.clone();
    let heartbeat_task = tokio::spawn(heartbeat_loop(heartbeat_tx, heartbeat_stop));

    Ok(CoordinatorHandle {
        local_addr,
        actor_tx,
        stop,
        accept_task,
        heartbeat_task,
        actor_task,
    })
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    actor_tx: mpsc::UnboundedSender<ActorMsg>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => {
                let conn = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let client_id = fresh_client_id();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                if actor_tx
                    .send(ActorMsg::Accepted { client_id: client_id.clone(), outbound: out_tx })
                    .is_err()
                {
                    break;
                }
                tokio::spawn(connection_loop(client_id, conn, out_rx, actor_tx.clone()));
            }
        }
    }
}

async fn connection_loop(
    client_id: ClientId,
    mut conn: Box<dyn Connection>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    actor_tx: mpsc::UnboundedSender<ActorMsg>,
) {
    loop {
        tokio::select! {
            line = conn.recv_line() => {
                match line {
                    Ok(Some(line)) => {
                        match decode_frame(&line) {
                            Ok(frame) => {
                                let _ = actor_tx.send(ActorMsg::Frame { client_id: client_id.clone(), frame });
                            }
                            Err(e) => {
                                let _ = actor_tx.send(ActorMsg::Malformed {
                                    client_id: client_id.clone(),
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = actor_tx.send(ActorMsg::Closed { client_id: client_id.clone() });
                        break;
                    }
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(line) => {
                        if let Err(e) = conn.send_line(&line).await {
                            tracing::warn!("send to {} failed: {e}", conn.peer_description());
                            let _ = actor_tx.send(ActorMsg::Closed { client_id: client_id.clone() });
                            break;
                        }
                    }
                    None => {
                        let _ = conn.shutdown().await;
                        break;
                    }
                }
            }
        }
    }
}

async fn heartbeat_loop(actor_tx: mpsc::UnboundedSender<ActorMsg>, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                if actor_tx.send(ActorMsg::HeartbeatTick).is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_actor(mut registry: RoomRegistry, mut rx: mpsc::UnboundedReceiver<ActorMsg>) {
    let mut conns: HashMap<ClientId, ConnState> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            ActorMsg::Accepted { client_id, outbound } => {
                conns.insert(
                    client_id,
                    ConnState {
                        device_id: None,
                        name: None,
                        room_id: None,
                        last_active: Instant::now(),
                        outbound,
                    },
                );
            }
            ActorMsg::Frame { client_id, frame } => handle_frame(&mut registry, &mut conns, client_id, frame),
            ActorMsg::Malformed { client_id, reason } => {
                reply(
                    &conns,
                    &client_id,
                    Frame::error("malformed", reason, Some(ErrorCode::MalformedFrame.as_str())),
                );
            }
            ActorMsg::Closed { client_id } => handle_closed(&mut registry, &mut conns, client_id),
            ActorMsg::HeartbeatTick => handle_heartbeat(&mut registry, &mut conns),
            ActorMsg::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn handle_frame(
    registry: &mut RoomRegistry,
    conns: &mut HashMap<ClientId, ConnState>,
    client_id: ClientId,
    frame: Frame,
) {
    if let Some(state) = conns.get_mut(&client_id) {
        state.last_active = Instant::now();
    }
    let request_id = frame.request_id;

    match frame.payload {
        FramePayload::Ping(_) => {
            reply(conns, &client_id, Frame::pong(request_id, ClientId::server(), now_ms()));
        }

        // A reply to our own heartbeat PING; last_active was already
        // refreshed above, nothing further to do.
        FramePayload::Pong(_) => {}

        FramePayload::Hello(HelloPayload { device_id, name }) => {
            let rebound_room = registry.rebind_client(&device_id, client_id.clone());
            if let Some(state) = conns.get_mut(&client_id) {
                state.device_id = Some(device_id);
                state.name = Some(name);
                state.room_id = rebound_room;
            }
            reply(conns, &client_id, Frame::welcome(request_id, client_id.clone()));
        }

        FramePayload::CreateRoom(CreateRoomPayload { .. }) => match require_identity(conns, &client_id) {
            Some((device_id, name)) => match registry.create_room(device_id, client_id.clone(), name) {
                Ok(room) => {
                    if let Some(state) = conns.get_mut(&client_id) {
                        state.room_id = Some(room.room_id.clone());
                    }
                    broadcast_snapshot(registry, conns, &room.room_id);
                }
                Err(e) => reply_room_error(conns, &client_id, &request_id, e),
            },
            None => reply_unauthenticated(conns, &client_id, &request_id),
        },

        FramePayload::JoinRoom(JoinRoomPayload { join_code }) => match require_identity(conns, &client_id) {
            Some((device_id, name)) => {
                match registry.join_room_by_code(&join_code, device_id, client_id.clone(), name) {
                    Ok(room) => {
                        if let Some(state) = conns.get_mut(&client_id) {
                            state.room_id = Some(room.room_id.clone());
                        }
                        broadcast_snapshot(registry, conns, &room.room_id);
                    }
                    Err(e) => reply_room_error(conns, &client_id, &request_id, e),
                }
            }
            None => reply_unauthenticated(conns, &client_id, &request_id),
        },

        FramePayload::LeaveRoom(_) => match require_identity(conns, &client_id) {
            Some((device_id, _name)) => {
                let room_id = conns.get(&client_id).and_then(|s| s.room_id.clone());
                if let Some(room_id) = room_id {
                    match registry.leave_room(&room_id, &device_id) {
                        Ok(Some(_)) => broadcast_snapshot(registry, conns, &room_id),
                        Ok(None) => {}
                        Err(e) => reply_room_error(conns, &client_id, &request_id, e),
                    }
                    if let Some(state) = conns.get_mut(&client_id) {
                        state.room_id = None;
                    }
                }
            }
            None => reply_unauthenticated(conns, &client_id, &request_id),
        },

        FramePayload::Chat(ChatPayload { text, .. }) => match require_identity(conns, &client_id) {
            Some((device_id, _name)) => {
                let room_id = conns.get(&client_id).and_then(|s| s.room_id.clone());
                match room_id {
                    Some(room_id) => match registry.append_chat(&room_id, &device_id, text) {
                        Ok(entry) => {
                            broadcast_chat(registry, conns, &room_id, &entry);
                            broadcast_snapshot(registry, conns, &room_id);
                        }
                        Err(e) => reply_room_error(conns, &client_id, &request_id, e),
                    },
                    None => reply_room_error(conns, &client_id, &request_id, RoomError::NotInRoom),
                }
            }
            None => reply_unauthenticated(conns, &client_id, &request_id),
        },

        FramePayload::Kick(KickPayload { target_device_id }) => match require_identity(conns, &client_id) {
            Some((device_id, _name)) => {
                let room_id = conns.get(&client_id).and_then(|s| s.room_id.clone());
                match room_id {
                    Some(room_id) => {
                        let target_client = find_client_by_device(conns, &target_device_id);
                        match registry.kick(&room_id, &device_id, &target_device_id) {
                            Ok(_room) => {
                                if let Some(target_client) = target_client {
                                    reply(
                                        conns,
                                        &target_client,
                                        Frame::kicked("kick", "removed by host"),
                                    );
                                    conns.remove(&target_client);
                                }
                                broadcast_snapshot(registry, conns, &room_id);
                            }
                            Err(e) => reply_room_error(conns, &client_id, &request_id, e),
                        }
                    }
                    None => reply_room_error(conns, &client_id, &request_id, RoomError::NotInRoom),
                }
            }
            None => reply_unauthenticated(conns, &client_id, &request_id),
        },

        FramePayload::Welcome(_) | FramePayload::Error(_) | FramePayload::Kicked(_) | FramePayload::StateSnapshot(_) => {
            reply_unsupported(conns, &client_id, &request_id);
        }
    }
}

fn handle_closed(registry: &mut RoomRegistry, conns: &mut HashMap<ClientId, ConnState>, client_id: ClientId) {
    let Some(state) = conns.remove(&client_id) else {
        return;
    };
    let (Some(device_id), Some(room_id)) = (state.device_id, state.room_id) else {
        return;
    };
    match registry.leave_room(&room_id, &device_id) {
        Ok(Some(_)) => broadcast_snapshot(registry, conns, &room_id),
        Ok(None) => {}
        Err(e) => tracing::debug!("leave_room on connection close failed: {e}"),
    }
}

fn handle_heartbeat(registry: &mut RoomRegistry, conns: &mut HashMap<ClientId, ConnState>) {
    let now = Instant::now();
    let timed_out: Vec<ClientId> = conns
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_active) > HEARTBEAT_TIMEOUT)
        .map(|(id, _)| id.clone())
        .collect();

    for client_id in timed_out {
        tracing::info!("closing {client_id} after heartbeat timeout");
        handle_closed(registry, conns, client_id);
    }

    let ping = Frame::ping("heartbeat", ClientId::server(), now_ms());
    if let Ok(line) = encode_frame(&ping) {
        for state in conns.values() {
            let _ = state.outbound.send(line.clone());
        }
    }
}

fn require_identity(conns: &HashMap<ClientId, ConnState>, client_id: &ClientId) -> Option<(DeviceId, String)> {
    let state = conns.get(client_id)?;
    Some((state.device_id.clone()?, state.name.clone()?))
}

fn find_client_by_device(conns: &HashMap<ClientId, ConnState>, device_id: &DeviceId) -> Option<ClientId> {
    conns
        .iter()
        .find(|(_, s)| s.device_id.as_ref() == Some(device_id))
        .map(|(id, _)| id.clone())
}

fn reply(conns: &HashMap<ClientId, ConnState>, client_id: &ClientId, frame: Frame) {
    let Some(state) = conns.get(client_id) else {
        return;
    };
    match encode_frame(&frame) {
        Ok(line) => {
            let _ = state.outbound.send(line);
        }
        Err(e) => tracing::warn!("failed to encode outgoing {} frame: {e}", frame.payload.kind_name()),
    }
}

fn reply_unauthenticated(conns: &HashMap<ClientId, ConnState>, client_id: &ClientId, request_id: &str) {
    reply(
        conns,
        client_id,
        Frame::error(
            request_id,
            CoordinatorError::Unauthenticated.to_string(),
            Some(ErrorCode::Unauthenticated.as_str()),
        ),
    );
}

fn reply_unsupported(conns: &HashMap<ClientId, ConnState>, client_id: &ClientId, request_id: &str) {
    reply(
        conns,
        client_id,
        Frame::error(
            request_id,
            CoordinatorError::UnsupportedMessageType.to_string(),
            Some(ErrorCode::UnsupportedMessageType.as_str()),
        ),
    );
}

fn reply_room_error(conns: &HashMap<ClientId, ConnState>, client_id: &ClientId, request_id: &str, error: RoomError) {
    let code = ErrorCode::from(&error);
    reply(conns, client_id, Frame::error(request_id, error.to_string(), Some(code.as_str())));
}

fn broadcast_snapshot(registry: &RoomRegistry, conns: &HashMap<ClientId, ConnState>, room_id: &RoomId) {
    let Ok(snapshot) = registry.make_snapshot(room_id) else {
        return;
    };
    let members = snapshot.room.members.clone();
    let frame = Frame::state_snapshot("broadcast", snapshot);
    for member in &members {
        reply(conns, &member.client_id, frame.clone());
    }
}

fn broadcast_chat(registry: &RoomRegistry, conns: &HashMap<ClientId, ConnState>, room_id: &RoomId, entry: &ChatEntry) {
    let Some(room) = registry.get(room_id) else {
        return;
    };
    let frame = Frame::chat_broadcast(
        "broadcast",
        entry.from_device_id.clone(),
        entry.from_name.clone(),
        entry.text.clone(),
        entry.timestamp,
    );
    for member in &room.members {
        reply(conns, &member.client_id, frame.clone());
    }
}
