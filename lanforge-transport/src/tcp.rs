//! TCP implementation of [`crate::ReliableTransport`].
//!
//! Frames travel as newline-delimited UTF-8 text, matching spec.md's "UTF-8
//! text objects" framing — `tokio_util::codec::LinesCodec` over a `Framed`
//! `TcpStream`, the same `Framed`-wrapped-socket shape the pack uses
//! elsewhere for line/byte framing (e.g. `lrthrome`'s `BytesCodec`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use crate::{Connection, Listener, ReliableTransport};

const MAX_LINE_BYTES: usize = 64 * 1024;

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReliableTransport for TcpTransport {
    async fn bind(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding TCP listener on {addr}"))?;
        Ok(Box::new(TcpListenerHandle { listener }))
    }

    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        Ok(Box::new(TcpConnection { framed, peer }))
    }
}

struct TcpListenerHandle {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        let (stream, addr) = self.listener.accept().await?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        Ok(Box::new(TcpConnection {
            framed,
            peer: addr.to_string(),
        }))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

struct TcpConnection {
    framed: Framed<TcpStream, LinesCodec>,
    peer: String,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.framed.send(line).await.context("sending line")
    }

    async fn recv_line(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(err)) => Err(err).context("reading line"),
            None => Ok(None),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().shutdown().await.context("shutdown")
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }
}
