//! In-memory transport for tests: a process-wide registry of "listeners" by
//! address string, backed by `tokio::sync::mpsc` line channels instead of
//! sockets. Lets coordinator/peer integration tests and the self-host case
//! exercise the exact same `Connection`/`Listener` trait objects the TCP
//! transport uses, without binding a real port.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Connection, Listener, ReliableTransport};

type PendingConn = (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>);

struct Registry {
    // addr -> channel the listener uses to receive freshly-dialed connections
    listeners: HashMap<String, mpsc::UnboundedSender<PendingConn>>,
}

static REGISTRY: std::sync::OnceLock<Mutex<Registry>> = std::sync::OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            listeners: HashMap::new(),
        })
    })
}

#[derive(Default)]
pub struct LoopbackTransport;

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReliableTransport for LoopbackTransport {
    async fn bind(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = registry().lock().unwrap();
        if reg.listeners.contains_key(addr) {
            return Err(anyhow!("address {addr} already bound"));
        }
        reg.listeners.insert(addr.to_string(), tx);
        Ok(Box::new(LoopbackListener {
            addr: addr.to_string(),
            incoming: rx,
        }))
    }

    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let dial_tx = {
            let reg = registry().lock().unwrap();
            reg.listeners
                .get(addr)
                .cloned()
                .ok_or_else(|| anyhow!("no loopback listener bound at {addr}"))?
        };

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel::<String>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<String>();

        dial_tx
            .send((to_client_tx, to_server_rx))
            .map_err(|_| anyhow!("loopback listener at {addr} gone"))?;

        Ok(Box::new(LoopbackConnection {
            outbound: to_server_tx,
            inbound: to_client_rx,
            peer: format!("loopback:{addr}"),
        }))
    }
}

pub struct LoopbackListener {
    addr: String,
    incoming: mpsc::UnboundedReceiver<PendingConn>,
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        registry().lock().unwrap().listeners.remove(&self.addr);
    }
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        let (outbound, inbound) = self
            .incoming
            .recv()
            .await
            .ok_or_else(|| anyhow!("loopback listener {} closed", self.addr))?;
        Ok(Box::new(LoopbackConnection {
            outbound,
            inbound,
            peer: "loopback:client".to_string(),
        }))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

pub struct LoopbackConnection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    peer: String,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.outbound
            .send(line.to_string())
            .map_err(|_| anyhow!("loopback peer gone"))
    }

    async fn recv_line(&mut self) -> Result<Option<String>> {
        Ok(self.inbound.recv().await)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inbound.close();
        Ok(())
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }
}
