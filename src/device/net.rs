//! Network and interface collaborators
//!
//! The device never opens sockets or interfaces itself. It is handed a
//! [`Bind`] to send datagrams through and a [`TunWriter`] to deliver
//! decrypted packets to.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Sends datagrams to peers
#[async_trait]
pub trait Bind: Send + Sync {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<()>;
}

/// Receives decrypted packets from peers
#[async_trait]
pub trait TunWriter: Send + Sync {
    async fn write(&self, packet: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl Bind for UdpSocket {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        let sent = self.send_to(buf, to).await?;
        if sent != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", sent, buf.len()),
            ));
        }
        Ok(())
    }
}
