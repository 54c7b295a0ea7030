use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::UdpSocket;

pub mod connection;
pub mod session;

/// The session-wide constants a connection needs when building replies: this
///  session's identity and its clock epoch.
#[derive(Debug)]
pub struct SessionIdentity {
    pub ssrc: u32,
    pub name: String,
    pub start_time: Instant,
}

/// Fire-and-forget datagram sends. Abstracting the socket at this seam keeps
///  the connection state machine testable without real sockets.
#[async_trait]
pub trait DatagramSender: Send + Sync {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl DatagramSender for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.send_to(buf, to).await?;
        Ok(())
    }
}
