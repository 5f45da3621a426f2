//! Shared harness for integration tests
//!
//! - `MockEngine`: a toy handshake that still authenticates static keys and
//!   derives per-session keys from fresh ephemerals
//! - `Network`: an in-memory datagram router between devices
//! - `ChannelTun`: an interface that forwards delivered packets to a channel
//! - `GatedBind`, `GatedTun`: wrappers that block until the test lets
//!   traffic through

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use zeroize::Zeroizing;

use secureguard_peer::crypto::x25519::{generate_keypair, shared_secret};
use secureguard_peer::crypto::{PublicKey, StaticIdentity};
use secureguard_peer::error::CryptoError;
use secureguard_peer::protocol::Handshake;
use secureguard_peer::{Bind, Device, DeviceConfig, HandshakeEngine, SessionKeys, TunWriter};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_key(data: &[u8], at: usize) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&data[at..at + 32]);
    key
}

fn malformed(what: &str) -> CryptoError {
    CryptoError::Handshake {
        reason: format!("malformed {}", what),
    }
}

/// Initiation: type(1) | reserved(3) | sender(4) | static(32) | ephemeral(32) | proof(32)
pub const INITIATION_LEN: usize = 104;
/// Response: type(1) | reserved(3) | sender(4) | receiver(4) | ephemeral(32)
pub const RESPONSE_LEN: usize = 44;

/// Toy handshake: the initiator proves its static key with the
/// static-static secret, the session secret is DH of the two ephemerals
/// and the preshared key is mixed into the transport keys.
pub struct MockEngine;

impl HandshakeEngine for MockEngine {
    fn create_initiation(
        &self,
        identity: &StaticIdentity,
        handshake: &mut Handshake,
        sender_index: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let (ephemeral_private, ephemeral_public) = generate_keypair();
        *handshake.local_ephemeral = *ephemeral_private;
        *handshake.hash = ephemeral_public;

        let mut msg = vec![1u8, 0, 0, 0];
        msg.extend_from_slice(&sender_index.to_le_bytes());
        msg.extend_from_slice(identity.public_key());
        msg.extend_from_slice(&ephemeral_public);
        msg.extend_from_slice(handshake.precomputed_static_static());
        Ok(msg)
    }

    fn initiator_static(
        &self,
        _identity: &StaticIdentity,
        msg: &[u8],
    ) -> Result<PublicKey, CryptoError> {
        if msg.len() != INITIATION_LEN {
            return Err(malformed("initiation"));
        }
        Ok(read_key(msg, 8))
    }

    fn consume_initiation(
        &self,
        _identity: &StaticIdentity,
        handshake: &mut Handshake,
        msg: &[u8],
    ) -> Result<u32, CryptoError> {
        if msg.len() != INITIATION_LEN {
            return Err(malformed("initiation"));
        }
        if read_key(msg, 8) != *handshake.remote_static() {
            return Err(CryptoError::Handshake {
                reason: "initiation for another peer".to_string(),
            });
        }
        if read_key(msg, 72) != *handshake.precomputed_static_static() {
            return Err(CryptoError::Handshake {
                reason: "static key proof mismatch".to_string(),
            });
        }
        handshake.remote_ephemeral = read_key(msg, 40);
        *handshake.hash = handshake.remote_ephemeral;
        Ok(read_u32(msg, 4))
    }

    fn create_response(
        &self,
        _identity: &StaticIdentity,
        handshake: &mut Handshake,
        sender_index: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let (ephemeral_private, ephemeral_public) = generate_keypair();
        *handshake.chain_key = *shared_secret(&ephemeral_private, &handshake.remote_ephemeral);
        *handshake.local_ephemeral = *ephemeral_private;

        let mut msg = vec![2u8, 0, 0, 0];
        msg.extend_from_slice(&sender_index.to_le_bytes());
        msg.extend_from_slice(&handshake.remote_index().to_le_bytes());
        msg.extend_from_slice(&ephemeral_public);
        Ok(msg)
    }

    fn consume_response(
        &self,
        _identity: &StaticIdentity,
        handshake: &mut Handshake,
        msg: &[u8],
    ) -> Result<u32, CryptoError> {
        if msg.len() != RESPONSE_LEN {
            return Err(malformed("response"));
        }
        handshake.remote_ephemeral = read_key(msg, 12);
        *handshake.chain_key = *shared_secret(&handshake.local_ephemeral, &handshake.remote_ephemeral);
        Ok(read_u32(msg, 4))
    }

    fn derive_keys(&self, handshake: &Handshake, is_initiator: bool) -> SessionKeys {
        let mut first = Zeroizing::new([0u8; 32]);
        let mut second = Zeroizing::new([0u8; 32]);
        for i in 0..32 {
            first[i] = handshake.chain_key[i] ^ handshake.preshared_key()[i];
            second[i] = first[i] ^ 0x5a;
        }

        if is_initiator {
            SessionKeys {
                send: first,
                receive: second,
            }
        } else {
            SessionKeys {
                send: second,
                receive: first,
            }
        }
    }
}

/// One datagram in flight
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
    pub to: SocketAddr,
}

/// Bind that records every datagram and optionally forwards it to a router
pub struct TestBind {
    local: SocketAddr,
    sent: Mutex<Vec<Datagram>>,
    forward: Option<mpsc::UnboundedSender<Datagram>>,
}

impl TestBind {
    /// A bind that only records
    pub fn recording(local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
            forward: None,
        })
    }

    pub fn sent(&self) -> Vec<Datagram> {
        self.sent.lock().clone()
    }

    /// Datagrams sent whose first byte is `msg_type`
    pub fn sent_of_type(&self, msg_type: u8) -> Vec<Datagram> {
        self.sent
            .lock()
            .iter()
            .filter(|d| d.data.first() == Some(&msg_type))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Bind for TestBind {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        let datagram = Datagram {
            data: buf.to_vec(),
            from: self.local,
            to,
        };
        self.sent.lock().push(datagram.clone());
        if let Some(forward) = &self.forward {
            forward
                .send(datagram)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "network closed"))?;
        }
        Ok(())
    }
}

/// Interface that hands every delivered packet to a channel
pub struct ChannelTun {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTun {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl TunWriter for ChannelTun {
    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        self.tx
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))
    }
}

/// Bind that holds every send until `open` lets it through
pub struct GatedBind {
    inner: Arc<TestBind>,
    gate: Semaphore,
}

impl GatedBind {
    pub fn new(inner: Arc<TestBind>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
        })
    }

    /// Let `sends` more datagrams through
    pub fn open(&self, sends: usize) {
        self.gate.add_permits(sends);
    }
}

#[async_trait]
impl Bind for GatedBind {
    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?;
        permit.forget();
        self.inner.send(buf, to).await
    }
}

/// Channel interface that holds every write until `open` lets it through
pub struct GatedTun {
    inner: Arc<ChannelTun>,
    gate: Semaphore,
}

impl GatedTun {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (inner, rx) = ChannelTun::new();
        let tun = Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
        });
        (tun, rx)
    }

    /// Let `writes` more packets through
    pub fn open(&self, writes: usize) {
        self.gate.add_permits(writes);
    }
}

#[async_trait]
impl TunWriter for GatedTun {
    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?;
        permit.forget();
        self.inner.write(packet).await
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn small_config() -> DeviceConfig {
    DeviceConfig {
        crypt_workers: 2,
        ..DeviceConfig::default()
    }
}

/// A device wired to a recording bind and a channel interface
pub struct Node {
    pub device: Arc<Device>,
    pub bind: Arc<TestBind>,
    pub tun_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub addr: SocketAddr,
}

impl Node {
    pub fn public_key(&self) -> PublicKey {
        self.device.public_key()
    }
}

/// Standalone device whose bind only records
pub fn standalone(port: u16, config: DeviceConfig) -> Node {
    let (tun, tun_rx) = ChannelTun::new();
    let device = Device::new(StaticIdentity::generate(), Arc::new(MockEngine), tun, config);
    let bind = TestBind::recording(addr(port));
    let as_bind: Arc<dyn Bind> = bind.clone();
    device.bind_update(Some(as_bind));
    Node {
        device,
        bind,
        tun_rx,
        addr: addr(port),
    }
}

/// In-memory network routing datagrams between devices by address
pub struct Network {
    tx: mpsc::UnboundedSender<Datagram>,
    routes: Arc<Mutex<HashMap<SocketAddr, Arc<Device>>>>,
}

impl Network {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Datagram>();
        let routes: Arc<Mutex<HashMap<SocketAddr, Arc<Device>>>> = Arc::default();

        let table = Arc::clone(&routes);
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                let target = table.lock().get(&datagram.to).cloned();
                if let Some(device) = target {
                    let _ = device.handle_datagram(&datagram.data, datagram.from).await;
                }
            }
        });

        Self { tx, routes }
    }

    /// Create a device attached to this network at `port`
    pub fn node(&self, port: u16, config: DeviceConfig) -> Node {
        let (tun, tun_rx) = ChannelTun::new();
        self.node_with_tun(port, config, tun, tun_rx)
    }

    /// Like `node`, delivering packets to `tun` whose output lands on `tun_rx`
    pub fn node_with_tun(
        &self,
        port: u16,
        config: DeviceConfig,
        tun: Arc<dyn TunWriter>,
        tun_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Node {
        let device = Device::new(StaticIdentity::generate(), Arc::new(MockEngine), tun, config);
        let bind = Arc::new(TestBind {
            local: addr(port),
            sent: Mutex::new(Vec::new()),
            forward: Some(self.tx.clone()),
        });
        let as_bind: Arc<dyn Bind> = bind.clone();
        device.bind_update(Some(as_bind));
        self.routes.lock().insert(addr(port), Arc::clone(&device));

        Node {
            device,
            bind,
            tun_rx,
            addr: addr(port),
        }
    }

    /// Stop routing datagrams to `addr`
    pub fn unplug(&self, addr: SocketAddr) {
        self.routes.lock().remove(&addr);
    }
}

/// Two devices that know each other; `a` knows `b`'s endpoint
pub async fn connected_pair(network: &Network) -> (Node, Node) {
    let a = network.node(51001, small_config());
    let b = network.node(51002, small_config());
    connect(&a, &b).await;
    (a, b)
}

/// Make `a` and `b` peers of each other and bring both up
pub async fn connect(a: &Node, b: &Node) {
    let peer_b = a.device.new_peer(b.public_key()).await.unwrap();
    peer_b.set_endpoint(Some(b.addr));
    b.device.new_peer(a.public_key()).await.unwrap();

    a.device.up().await;
    b.device.up().await;
}
