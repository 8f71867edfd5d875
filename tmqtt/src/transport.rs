//! The seam between a connection and its byte stream.
//!
//! Connections only exchange decoded [`Packet`]s. Any `Framed` stream whose codec speaks
//! `Packet` is a transport, so listeners, TLS and websockets stay outside the core.
//! [`ChannelTransport`] wires a connection to an in-process client.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::packet::Packet;
use crate::types::MqttError;
use crate::Result;

#[async_trait]
pub trait Transport: Send {
    /// Next packet from the peer. `None` once the peer closed the stream; an error when
    /// the bytes received do not decode to a packet.
    async fn recv(&mut self) -> Option<std::result::Result<Packet, MqttError>>;

    async fn send(&mut self, packet: Packet) -> Result<()>;

    async fn close(&mut self);

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[async_trait]
impl<Io, C> Transport for Framed<Io, C>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
    C: Decoder<Item = Packet> + Encoder<Packet> + Send + Unpin,
    <C as Decoder>::Error: fmt::Display,
    <C as Encoder<Packet>>::Error: std::error::Error + Send + Sync + 'static,
{
    async fn recv(&mut self) -> Option<std::result::Result<Packet, MqttError>> {
        match self.next().await? {
            Ok(p) => Some(Ok(p)),
            Err(e) => Some(Err(MqttError::Protocol(
                crate::packet::DisconnectReasonCode::MalformedPacket,
                e.to_string(),
            ))),
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        SinkExt::send(self, packet).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = <Self as SinkExt<Packet>>::close(self).await {
            log::debug!("transport close error, {}", e);
        }
    }
}

/// Server side of an in-process connection.
pub struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<Packet>,
    tx: Option<mpsc::UnboundedSender<Packet>>,
    remote_addr: Option<SocketAddr>,
}

/// Client side of an in-process connection.
pub struct ChannelClient {
    tx: Option<mpsc::UnboundedSender<Packet>>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl ChannelTransport {
    pub fn pair(remote_addr: Option<SocketAddr>) -> (ChannelTransport, ChannelClient) {
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport { rx: server_rx, tx: Some(to_client), remote_addr },
            ChannelClient { tx: Some(to_server), rx: client_rx },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Option<std::result::Result<Packet, MqttError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| MqttError::SendError("transport closed".into()))?;
        tx.send(packet).map_err(|_| MqttError::SendError("peer gone".into()))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.tx.take();
        self.rx.close();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl ChannelClient {
    /// Returns false once the server side has closed.
    pub fn send(&self, packet: Packet) -> bool {
        self.tx.as_ref().map(|tx| tx.send(packet).is_ok()).unwrap_or(false)
    }

    /// Next packet from the server, `None` after the server closed the connection.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    /// Drops the client's sending half, which the server sees as the stream closing.
    pub fn close(&mut self) {
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_pair_exchanges_packets() {
        let (mut server, mut client) = ChannelTransport::pair(None);
        assert!(client.send(Packet::PingRequest));
        assert_eq!(server.recv().await.unwrap().unwrap(), Packet::PingRequest);

        server.send(Packet::PingResponse).await.unwrap();
        assert_eq!(client.recv().await, Some(Packet::PingResponse));

        client.close();
        assert!(server.recv().await.is_none());

        server.close().await;
        assert!(client.recv().await.is_none());
        assert!(server.send(Packet::PingResponse).await.is_err());
    }
}
