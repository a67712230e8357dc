//! Announcer / Discoverer (C2, spec.md §4.2).
//!
//! Connectionless link-local UDP presence, grounded in the pack's other
//! UDP-broadcast presence code (`wichain-network`'s `periodic_broadcast`/
//! `recv_loop` pair): one socket, one periodic-send task, one receive-loop
//! task. Re-architected per spec.md §9's redesign note as instance-owned
//! objects with explicit `start`/`stop` lifecycles rather than process-wide
//! singletons — a second `start` is a logged no-op, not a crash.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::ids::{ClientId, JoinCode, RoomId};

/// Link-local discovery UDP port (spec.md §6).
pub const DISCOVERY_PORT: u16 = 42069;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3);
const WIRE_PREFIX: &str = "LANFORGE_HOST";
const MAX_DGRAM: usize = 2048;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("announcer requires a non-empty roomId, joinCode and hostClientId")]
    MissingAnnounceFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceParams {
    pub room_id: RoomId,
    pub join_code: JoinCode,
    pub host_client_id: ClientId,
    pub port: u16,
}

impl AnnounceParams {
    fn to_wire(&self) -> String {
        format!(
            "{WIRE_PREFIX} {} {} {} {}",
            self.room_id, self.join_code, self.host_client_id, self.port
        )
    }
}

/// One discovered host, deduplicated by `(ip, port)` within a discovery
/// window (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct DiscoveredHost {
    pub ip: IpAddr,
    pub port: u16,
    pub room_id: RoomId,
    pub join_code: JoinCode,
    pub host_client_id: ClientId,
    pub last_seen: Instant,
}

fn parse_datagram(src: IpAddr, bytes: &[u8]) -> Option<DiscoveredHost> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut fields = text.trim_end().split_ascii_whitespace();
    if fields.next()? != WIRE_PREFIX {
        return None;
    }
    let room_id = fields.next()?;
    let join_code = fields.next()?;
    let host_client_id = fields.next()?;
    let port: u16 = fields.next()?.parse().ok()?;

    Some(DiscoveredHost {
        ip: src,
        port,
        room_id: RoomId::from(room_id),
        join_code: JoinCode::from(join_code),
        host_client_id: ClientId::from(host_client_id),
        last_seen: Instant::now(),
    })
}

/// Periodically broadcasts this host's presence while active. At most one
/// announcer runs per peer.
pub struct Announcer {
    task: Option<JoinHandle<()>>,
    stop: Option<Arc<Notify>>,
}

impl Announcer {
    pub fn new() -> Self {
        Self {
            task: None,
            stop: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Starts broadcasting `params` every 3s. A second call while already
    /// running is a no-op (spec.md §4.2).
    pub async fn start(&mut self, params: AnnounceParams) -> Result<(), DiscoveryError> {
        if self.is_running() {
            tracing::debug!("announcer already running; ignoring duplicate start");
            return Ok(());
        }
        if params.room_id.as_str().is_empty()
            || params.join_code.as_str().is_empty()
            || params.host_client_id.as_str().is_empty()
        {
            return Err(DiscoveryError::MissingAnnounceFields);
        }

        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("announcer failed to bind a send socket: {e}");
                return Ok(());
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            tracing::warn!("announcer could not enable broadcast: {e}");
        }

        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let broadcast_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT);
        let payload = params.to_wire();

        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = socket.send_to(payload.as_bytes(), broadcast_addr).await {
                    tracing::warn!("announce send failed, will retry: {e}");
                }
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
                }
            }
        });

        self.task = Some(task);
        self.stop = Some(stop);
        Ok(())
    }

    /// Cancels the send timer and closes the socket.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.notify_one();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Default for Announcer {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for announcements and reports each newly-seen `(ip, port)` pair
/// exactly once per discovery window.
pub struct Discoverer {
    task: Option<JoinHandle<()>>,
    stop: Option<Arc<Notify>>,
}

impl Discoverer {
    pub fn new() -> Self {
        Self {
            task: None,
            stop: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Binds the well-known discovery port and invokes `on_discovered` the
    /// first time a given `(ip, port)` is seen; later datagrams from the
    /// same key only refresh bookkeeping, silently. At most one discoverer
    /// runs per peer (spec.md §4.2); a second `start` is a no-op.
    pub async fn start<F>(&mut self, on_discovered: F) -> std::io::Result<()>
    where
        F: Fn(DiscoveredHost) + Send + Sync + 'static,
    {
        if self.is_running() {
            tracing::debug!("discoverer already running; ignoring duplicate start");
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
        socket.set_broadcast(true).ok();

        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();

        let task = tokio::spawn(async move {
            let mut seen: HashMap<(IpAddr, u16), Instant> = HashMap::new();
            let mut buf = vec![0u8; MAX_DGRAM];
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    recvd = socket.recv_from(&mut buf) => {
                        let (len, src) = match recvd {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!("discovery recv error: {e}");
                                continue;
                            }
                        };
                        let Some(host) = parse_datagram(src.ip(), &buf[..len]) else {
                            continue;
                        };
                        let key = (host.ip, host.port);
                        if seen.insert(key, host.last_seen).is_none() {
                            on_discovered(host);
                        }
                    }
                }
            }
        });

        self.task = Some(task);
        self.stop = Some(stop);
        Ok(())
    }

    /// Closes the socket and clears discovery state (spec.md §4.2/§5).
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.notify_one();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Default for Discoverer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_datagram() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        let host = parse_datagram(src, b"LANFORGE_HOST room-1 ABC123 client-9 8080").unwrap();
        assert_eq!(host.ip, src);
        assert_eq!(host.port, 8080);
        assert_eq!(host.room_id, RoomId::from("room-1"));
        assert_eq!(host.join_code, JoinCode::from("ABC123"));
        assert_eq!(host.host_client_id, ClientId::from("client-9"));
    }

    #[test]
    fn rejects_wrong_prefix() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(parse_datagram(src, b"SOMETHING_ELSE room-1 ABC123 client-9 8080").is_none());
    }

    #[test]
    fn rejects_too_few_fields() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(parse_datagram(src, b"LANFORGE_HOST room-1 ABC123").is_none());
    }

    #[test]
    fn rejects_unparseable_port() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(parse_datagram(src, b"LANFORGE_HOST room-1 ABC123 client-9 not-a-port").is_none());
    }

    #[tokio::test]
    async fn announcer_refuses_to_start_with_missing_fields() {
        let mut announcer = Announcer::new();
        let err = announcer
            .start(AnnounceParams {
                room_id: RoomId::from(""),
                join_code: JoinCode::from("ABC123"),
                host_client_id: ClientId::from("c1"),
                port: 8080,
            })
            .await
            .unwrap_err();
        assert_eq!(err, DiscoveryError::MissingAnnounceFields);
        assert!(!announcer.is_running());
    }

    #[tokio::test]
    async fn second_announcer_start_is_a_no_op() {
        let mut announcer = Announcer::new();
        let params = AnnounceParams {
            room_id: RoomId::from("room-1"),
            join_code: JoinCode::from("ABC123"),
            host_client_id: ClientId::from("c1"),
            port: 8080,
        };
        announcer.start(params.clone()).await.unwrap();
        announcer.start(params).await.unwrap();
        announcer.stop().await;
    }
}
