//! SecureGuard peer core
//!
//! Peer management for a WireGuard-style tunnel: per-peer session state and
//! key rotation, the packet pipeline between the interface and the socket,
//! and the timers that drive handshakes and keepalives.
//!
//! # Features
//!
//! - Peer registry with capacity limit and duplicate detection
//! - previous/current/next keypair rotation with forward-secret erasure
//! - Per-peer ordered delivery over shared crypto workers
//! - Handshake retransmission, passive and persistent keepalives
//! - Pluggable handshake engine, socket and interface
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use secureguard_peer::{Bind, Device, DeviceConfig, HandshakeEngine, StaticIdentity, TunWriter};
//!
//! async fn run(engine: Arc<dyn HandshakeEngine>, tun: Arc<dyn TunWriter>) -> std::io::Result<()> {
//!     let socket = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:51820").await?);
//!
//!     let device = Device::new(StaticIdentity::generate(), engine, tun, DeviceConfig::default());
//!     let bind: Arc<dyn Bind> = socket.clone();
//!     device.bind_update(Some(bind));
//!     device.up().await;
//!
//!     let mut buf = [0u8; 65535];
//!     loop {
//!         let (len, from) = socket.recv_from(&mut buf).await?;
//!         if let Err(e) = device.handle_datagram(&buf[..len], from).await {
//!             eprintln!("Dropped datagram from {}: {}", from, e);
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod peer;
pub mod protocol;

pub use config::WireGuardConfig;
pub use crypto::{PrivateKey, PublicKey, StaticIdentity};
pub use device::{Bind, Device, DeviceConfig, PeerEvent, TunWriter};
pub use error::{Result, SecureGuardError};
pub use peer::{Peer, PeerStatus};
pub use protocol::{HandshakeEngine, SessionKeys};
