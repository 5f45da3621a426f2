//! Device: the peer registry
//!
//! A [`Device`] owns the local static identity, the set of peers keyed by
//! their public keys, the receiver index table and the shared crypto
//! pipeline. It routes incoming datagrams to peers and drives peers through
//! up, down and close transitions.

pub mod index;
pub mod net;
pub mod pipeline;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::broadcast;

use crate::config::WireGuardConfig;
use crate::crypto::{PrivateKey, PublicKey, StaticIdentity};
use crate::error::{PeerError, ProtocolError, Result};
use crate::peer::{Peer, PeerStatus};
use crate::protocol::messages::{get_message_type, response_receiver_index};
use crate::protocol::{HandshakeEngine, Keypair, MessageType, TransportHeader};

pub use index::{IndexEntry, IndexTable};
pub use net::{Bind, TunWriter};
pub use pipeline::CryptPipeline;

/// Default maximum number of peers per device
pub const MAX_PEERS: usize = 1 << 16;

/// Capacity of the broadcast channel carrying peer events
const EVENT_CHANNEL_SIZE: usize = 256;

/// Tunables of a device
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub max_peers: usize,
    /// Packets held per peer while no session exists
    pub staged_queue_size: usize,
    pub outbound_queue_size: usize,
    pub inbound_queue_size: usize,
    /// Jobs buffered ahead of the shared crypto workers
    pub crypt_queue_size: usize,
    pub crypt_workers: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS,
            staged_queue_size: 128,
            outbound_queue_size: 1024,
            inbound_queue_size: 1024,
            crypt_queue_size: 1024,
            crypt_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Notable changes in a peer's life, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added { public_key: PublicKey },
    Removed { public_key: PublicKey },
    /// A handshake finished and a fresh keypair is in use
    HandshakeComplete { public_key: PublicKey },
    /// Handshake retries ran out
    Unreachable { public_key: PublicKey, attempts: u32 },
    /// Keys were wiped after a long silence
    KeyMaterialZeroed { public_key: PublicKey },
}

pub struct Device {
    config: DeviceConfig,
    identity: RwLock<StaticIdentity>,
    peers: Mutex<HashMap<PublicKey, Arc<Peer>>>,
    is_up: AtomicBool,
    is_closed: AtomicBool,
    /// Serializes up, down, close and peer creation
    state: tokio::sync::Mutex<()>,
    net: RwLock<Option<Arc<dyn Bind>>>,
    tun: Arc<dyn TunWriter>,
    engine: Arc<dyn HandshakeEngine>,
    index_table: IndexTable,
    pipeline: CryptPipeline,
    events: broadcast::Sender<PeerEvent>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("public_key", &BASE64.encode(self.public_key()))
            .field("peers", &self.peer_count())
            .field("is_up", &self.is_up())
            .field("is_closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create a device in the down state
    ///
    /// Must be called from within a tokio runtime; the crypto workers are
    /// spawned immediately.
    pub fn new(
        identity: StaticIdentity,
        engine: Arc<dyn HandshakeEngine>,
        tun: Arc<dyn TunWriter>,
        config: DeviceConfig,
    ) -> Arc<Self> {
        let pipeline = CryptPipeline::new(config.crypt_workers, config.crypt_queue_size);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        tracing::info!(
            "Device created with public key {}",
            BASE64.encode(identity.public_key())
        );

        Arc::new(Self {
            config,
            identity: RwLock::new(identity),
            peers: Mutex::new(HashMap::new()),
            is_up: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(()),
            net: RwLock::new(None),
            tun,
            engine,
            index_table: IndexTable::new(),
            pipeline,
            events,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn public_key(&self) -> PublicKey {
        *self.identity.read().public_key()
    }

    pub(crate) fn identity(&self) -> RwLockReadGuard<'_, StaticIdentity> {
        self.identity.read()
    }

    pub(crate) fn engine(&self) -> &dyn HandshakeEngine {
        self.engine.as_ref()
    }

    pub(crate) fn tun(&self) -> &dyn TunWriter {
        self.tun.as_ref()
    }

    pub fn index_table(&self) -> &IndexTable {
        &self.index_table
    }

    pub fn pipeline(&self) -> &CryptPipeline {
        &self.pipeline
    }

    pub fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Release a keypair's receiver index; its keys are wiped on last drop
    pub fn delete_keypair(&self, keypair: &Keypair) {
        self.index_table.delete(keypair.local_index());
    }

    // ========================================================================
    // Peer registry
    // ========================================================================

    /// Register a peer for `public_key`
    ///
    /// The peer is started right away if the device is up.
    pub async fn new_peer(
        self: &Arc<Self>,
        public_key: PublicKey,
    ) -> std::result::Result<Arc<Peer>, PeerError> {
        let _state = self.state.lock().await;

        if self.is_closed() {
            return Err(PeerError::DeviceClosed);
        }

        let peer = {
            let identity = self.identity.read();
            let mut peers = self.peers.lock();

            if peers.len() >= self.config.max_peers {
                return Err(PeerError::PeerLimitExceeded {
                    limit: self.config.max_peers,
                });
            }
            if peers.contains_key(&public_key) {
                return Err(PeerError::DuplicatePeer {
                    key: BASE64.encode(public_key),
                });
            }

            let peer = Peer::new(self, public_key, identity.static_static(&public_key));
            peers.insert(public_key, Arc::clone(&peer));
            peer
        };

        tracing::info!("{} - Added", peer);
        self.emit(PeerEvent::Added { public_key });

        if self.is_up() {
            peer.start().await;
        }

        Ok(peer)
    }

    pub fn lookup_peer(&self, public_key: &PublicKey) -> Option<Arc<Peer>> {
        self.peers.lock().get(public_key).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stop and forget a peer; returns false if it was not registered
    pub async fn remove_peer(&self, public_key: &PublicKey) -> bool {
        let _state = self.state.lock().await;
        self.remove_peer_locked(public_key).await
    }

    async fn remove_peer_locked(&self, public_key: &PublicKey) -> bool {
        let peer = self.peers.lock().remove(public_key);
        let peer = match peer {
            Some(peer) => peer,
            None => return false,
        };

        peer.stop().await;
        // A peer that never ran still holds its handshake index
        peer.clear_all();

        tracing::info!("{} - Removed", peer);
        self.emit(PeerEvent::Removed {
            public_key: *public_key,
        });
        true
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        self.peers().iter().map(|peer| peer.status()).collect()
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Bring the device up and start every peer
    pub async fn up(&self) {
        let _state = self.state.lock().await;
        if self.is_closed() || self.is_up.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Device up");

        for peer in self.peers() {
            peer.start().await;
            if peer.persistent_keepalive_interval() > 0 {
                peer.send_keepalive().await;
            }
        }
    }

    /// Take the device down, stopping every peer and wiping their sessions
    pub async fn down(&self) {
        let _state = self.state.lock().await;
        if !self.is_up.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Device down");

        for peer in self.peers() {
            peer.stop().await;
        }
    }

    /// Shut the device down for good
    ///
    /// Removes every peer, drops the bind and waits for the crypto workers
    /// to exit.
    pub async fn close(&self) {
        let _state = self.state.lock().await;
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Device closing");

        self.net.write().take();
        self.is_up.store(false, Ordering::Release);

        let keys: Vec<PublicKey> = self.peers.lock().keys().copied().collect();
        for key in keys {
            self.remove_peer_locked(&key).await;
        }

        self.pipeline.close();
        self.pipeline.join().await;

        tracing::info!("Device closed");
    }

    /// Replace the socket peers send through
    pub fn bind_update(&self, bind: Option<Arc<dyn Bind>>) {
        let has_bind = bind.is_some();
        *self.net.write() = bind;
        tracing::debug!("Bind updated (bound: {})", has_bind);
    }

    pub fn bind(&self) -> Option<Arc<dyn Bind>> {
        self.net.read().clone()
    }

    /// Switch to a new local static key
    ///
    /// A peer registered under our own new public key is removed. Every
    /// other peer gets a fresh static-static secret and must handshake again.
    pub async fn set_private_key(&self, private_key: PrivateKey) {
        let _state = self.state.lock().await;

        let identity = StaticIdentity::new(private_key);
        let public_key = *identity.public_key();
        if public_key == self.public_key() {
            return;
        }

        if self.lookup_peer(&public_key).is_some() {
            tracing::info!("Removing peer that matches the new local key");
            self.remove_peer_locked(&public_key).await;
        }

        let peers = {
            let mut current = self.identity.write();
            *current = identity;
            let peers = self.peers();
            for peer in &peers {
                peer.set_precomputed_static_static(current.static_static(peer.public_key()));
            }
            peers
        };

        tracing::info!("Local key changed to {}", BASE64.encode(public_key));

        for peer in peers {
            peer.expire_current_keypairs();
        }
    }

    /// Apply a parsed configuration, creating or updating peers
    pub async fn apply_config(self: &Arc<Self>, config: &WireGuardConfig) -> Result<()> {
        let key_changed = *self.identity.read().private_key() != *config.interface.private_key;
        if key_changed {
            self.set_private_key(config.interface.private_key.clone())
                .await;
        }
        if let Some(port) = config.interface.listen_port {
            tracing::debug!("Listen port {} is left to the bind owner", port);
        }

        for peer_config in &config.peers {
            let peer = match self.lookup_peer(&peer_config.public_key) {
                Some(peer) => peer,
                None => self.new_peer(peer_config.public_key).await?,
            };

            peer.set_preshared_key(peer_config.preshared_key);
            peer.set_disable_roaming(peer_config.disable_roaming);
            if let Some(endpoint) = peer_config.endpoint {
                peer.set_endpoint(Some(endpoint));
            }

            let keepalive = u32::from(peer_config.persistent_keepalive.unwrap_or(0));
            if peer.set_persistent_keepalive_interval(keepalive) && self.is_up() {
                peer.send_keepalive().await;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Route one datagram received from `from`
    pub async fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        match get_message_type(data)? {
            MessageType::HandshakeInitiation => {
                let remote = {
                    let identity = self.identity.read();
                    self.engine.initiator_static(&identity, data)?
                };
                let peer = self
                    .lookup_peer(&remote)
                    .ok_or(ProtocolError::UnknownPeer)?;
                peer.consume_initiation(data, from).await
            }
            MessageType::HandshakeResponse => {
                let index = response_receiver_index(data)?;
                let peer = match self.index_table.lookup(index) {
                    Some(IndexEntry::Handshake(peer)) => peer.upgrade(),
                    _ => None,
                };
                let peer = peer.ok_or(ProtocolError::InvalidReceiverIndex { index })?;
                peer.consume_response(data, from).await
            }
            MessageType::CookieReply => {
                tracing::trace!("Ignoring cookie reply from {}", from);
                Ok(())
            }
            MessageType::TransportData => {
                let header = TransportHeader::from_bytes(data)?;
                let index = header.receiver_index;
                let (peer, keypair) = match self.index_table.lookup(index) {
                    Some(IndexEntry::Keypair { peer, keypair }) => (peer.upgrade(), keypair.upgrade()),
                    _ => (None, None),
                };
                let (peer, keypair) = match (peer, keypair) {
                    (Some(peer), Some(keypair)) => (peer, keypair),
                    _ => return Err(ProtocolError::InvalidReceiverIndex { index }.into()),
                };

                if keypair.is_expired() {
                    return Err(ProtocolError::SessionExpired.into());
                }

                peer.enqueue_inbound(
                    keypair,
                    header.counter,
                    TransportHeader::payload(data).to_vec(),
                    data.len(),
                    from,
                )
                .await?;
                Ok(())
            }
        }
    }
}
