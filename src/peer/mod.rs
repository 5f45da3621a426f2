//! Remote peers
//!
//! A [`Peer`] owns the session state for one remote static key, its packet
//! queues and the two sequential tasks that drain them, and its timers. The
//! [`Device`] creates peers and starts them while it is up.
//!
//! Locking:
//! - `endpoint` is a read-write lock of its own
//! - `session` guards the handshake and keypairs and is never held across an
//!   await point
//! - `queue` serializes [`Peer::start`] and [`Peer::stop`] and holds the
//!   worker handles `stop` waits on

mod queue;
mod receive;
mod send;
pub mod timers;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::crypto::PublicKey;
use crate::device::{Device, PeerEvent};
use crate::error::{NetworkError, QueueError};
use crate::protocol::{Handshake, Keypairs};

pub use queue::{InboundElement, OutboundElement, StagedQueue};
pub use timers::TimerKind;

use queue::PeerQueues;
use timers::Timers;

/// Handshake and keypairs, guarded together
pub(crate) struct Session {
    pub handshake: Handshake,
    pub keypairs: Keypairs,
}

pub struct Peer {
    device: Weak<Device>,
    remote_static: PublicKey,
    is_running: AtomicBool,
    endpoint: RwLock<Option<SocketAddr>>,
    disable_roaming: AtomicBool,
    /// Seconds, zero when disabled
    persistent_keepalive_interval: AtomicU32,
    session: Mutex<Session>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    /// Unix nanoseconds, zero before the first handshake
    last_handshake_nanos: AtomicI64,
    queue: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    queues: RwLock<Option<PeerQueues>>,
    staged: OnceLock<StagedQueue>,
    flush: tokio::sync::Mutex<()>,
    timers: Timers,
}

/// Point-in-time view of a peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub running: bool,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake_unix_nanos: Option<i64>,
    pub persistent_keepalive_interval: u32,
    pub disable_roaming: bool,
    pub handshake_state: &'static str,
    pub has_session: bool,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = BASE64.encode(self.remote_static);
        if key.len() == 44 {
            write!(f, "peer({}…{})", &key[0..4], &key[39..43])
        } else {
            write!(f, "peer(invalid)")
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_static", &BASE64.encode(self.remote_static))
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub(crate) fn new(
        device: &Arc<Device>,
        remote_static: PublicKey,
        precomputed_static_static: Zeroizing<[u8; 32]>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            device: Arc::downgrade(device),
            remote_static,
            is_running: AtomicBool::new(false),
            endpoint: RwLock::new(None),
            disable_roaming: AtomicBool::new(false),
            persistent_keepalive_interval: AtomicU32::new(0),
            session: Mutex::new(Session {
                handshake: Handshake::new(remote_static, precomputed_static_static),
                keypairs: Keypairs::default(),
            }),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake_nanos: AtomicI64::new(0),
            queue: tokio::sync::Mutex::new(Vec::new()),
            queues: RwLock::new(None),
            staged: OnceLock::new(),
            flush: tokio::sync::Mutex::new(()),
            timers: Timers::new(weak.clone()),
        })
    }

    pub(crate) fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the peer's queues, tasks and timers
    ///
    /// Does nothing when already running or when the device is closed.
    pub async fn start(self: &Arc<Self>) {
        let device = match self.device() {
            Some(device) if !device.is_closed() => device,
            _ => return,
        };

        let mut workers = self.queue.lock().await;
        if self.is_running() {
            return;
        }

        tracing::debug!("{} - Starting", self);

        self.session.lock().handshake.reset_last_sent();

        let config = device.config();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size.max(1));
        self.staged
            .get_or_init(|| StagedQueue::new(config.staged_queue_size));

        // Keep the shared crypto workers alive while we submit to them
        if !device.pipeline().open() {
            tracing::debug!("{} - Crypto pipeline closed, not starting", self);
            return;
        }

        *self.queues.write() = Some(PeerQueues {
            outbound: outbound_tx,
            inbound: inbound_tx,
        });

        self.timers.init();

        workers.push(tokio::spawn(
            Arc::clone(self).run_sequential_sender(outbound_rx),
        ));
        workers.push(tokio::spawn(
            Arc::clone(self).run_sequential_receiver(inbound_rx),
        ));

        self.is_running.store(true, Ordering::Release);
    }

    /// Stop the peer and wipe its session
    ///
    /// Waits for both sequential tasks to drain their queues and exit. Does
    /// nothing when not running.
    pub async fn stop(&self) {
        let mut workers = self.queue.lock().await;
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::debug!("{} - Stopping", self);

        self.timers.stop();

        // Dropping the senders closes both queues
        self.queues.write().take();

        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("{} - Worker task failed: {}", self, e);
            }
        }

        if let Some(device) = self.device() {
            device.pipeline().close();
        }

        self.clear_all();
    }

    /// Release every keypair, wipe the handshake and drop staged packets
    pub fn clear_all(&self) {
        let device = self.device();

        {
            let mut session = self.session.lock();
            let released = session.keypairs.take_all();
            let index = session.handshake.clear();

            if let Some(device) = &device {
                for keypair in &released {
                    device.delete_keypair(keypair);
                }
                if let Some(index) = index {
                    device.index_table().delete(index);
                }
            }
        }

        self.flush_staged_packets();
    }

    /// Force a fresh handshake before any more data is sent
    pub fn expire_current_keypairs(&self) {
        let device = self.device();
        let mut session = self.session.lock();

        if let Some(index) = session.handshake.clear() {
            if let Some(device) = &device {
                device.index_table().delete(index);
            }
        }
        session.handshake.reset_last_sent();
        session.keypairs.exhaust_current_and_next();
    }

    pub fn flush_staged_packets(&self) {
        if let Some(staged) = self.staged.get() {
            let dropped = staged.flush();
            if dropped > 0 {
                tracing::trace!("{} - Flushed {} staged packets", self, dropped);
            }
        }
    }

    // ========================================================================
    // Endpoint and configuration
    // ========================================================================

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    pub fn set_endpoint(&self, endpoint: Option<SocketAddr>) {
        *self.endpoint.write() = endpoint;
    }

    /// Learn the endpoint from an authenticated packet unless roaming is off
    pub fn set_endpoint_from_packet(&self, endpoint: SocketAddr) {
        if self.disable_roaming.load(Ordering::Acquire) {
            return;
        }
        let mut current = self.endpoint.write();
        if *current != Some(endpoint) {
            tracing::debug!("{} - Endpoint changed to {}", self, endpoint);
            *current = Some(endpoint);
        }
    }

    pub fn disable_roaming(&self) -> bool {
        self.disable_roaming.load(Ordering::Acquire)
    }

    pub fn set_disable_roaming(&self, disable: bool) {
        self.disable_roaming.store(disable, Ordering::Release);
    }

    pub fn persistent_keepalive_interval(&self) -> u32 {
        self.persistent_keepalive_interval.load(Ordering::Acquire)
    }

    /// Set the persistent keepalive interval in seconds
    ///
    /// Returns true when this turned persistent keepalive on.
    pub fn set_persistent_keepalive_interval(&self, secs: u32) -> bool {
        let old = self
            .persistent_keepalive_interval
            .swap(secs, Ordering::AcqRel);
        old == 0 && secs != 0
    }

    pub fn set_preshared_key(&self, key: Option<[u8; 32]>) {
        self.session.lock().handshake.set_preshared_key(key);
    }

    pub(crate) fn set_precomputed_static_static(&self, secret: Zeroizing<[u8; 32]>) {
        self.session
            .lock()
            .handshake
            .set_precomputed_static_static(secret);
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    /// Send an already framed message to the peer's endpoint
    ///
    /// Messages racing a closing device are dropped without error.
    pub async fn send_raw(&self, buf: &[u8]) -> Result<(), NetworkError> {
        let device = match self.device() {
            Some(device) => device,
            None => return Ok(()),
        };

        let bind = match device.bind() {
            Some(bind) => bind,
            None if device.is_closed() => return Ok(()),
            None => return Err(NetworkError::NoBind),
        };

        let endpoint = self.endpoint().ok_or(NetworkError::NoEndpoint)?;

        bind.send(buf, endpoint)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;

        self.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn outbound_sender(&self) -> Result<mpsc::Sender<OutboundElement>, QueueError> {
        self.queues
            .read()
            .as_ref()
            .map(|queues| queues.outbound.clone())
            .ok_or(QueueError::Closed)
    }

    pub(crate) fn inbound_sender(&self) -> Result<mpsc::Sender<InboundElement>, QueueError> {
        self.queues
            .read()
            .as_ref()
            .map(|queues| queues.inbound.clone())
            .ok_or(QueueError::Closed)
    }

    // ========================================================================
    // Stats and inspection
    // ========================================================================

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_rx_bytes(&self, len: usize) {
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn last_handshake(&self) -> Option<SystemTime> {
        match self.last_handshake_nanos.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(UNIX_EPOCH + std::time::Duration::from_nanos(nanos as u64)),
        }
    }

    fn mark_handshake_complete(&self) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(1);
        self.last_handshake_nanos.store(nanos, Ordering::Release);
    }

    pub fn staged_len(&self) -> usize {
        self.staged.get().map_or(0, StagedQueue::len)
    }

    /// Inspect the handshake and keypairs under the session lock
    pub fn with_session<R>(&self, f: impl FnOnce(&Handshake, &Keypairs) -> R) -> R {
        let session = self.session.lock();
        f(&session.handshake, &session.keypairs)
    }

    pub fn status(&self) -> PeerStatus {
        let (handshake_state, has_session) = self.with_session(|handshake, keypairs| {
            (handshake.state().as_str(), keypairs.current().is_some())
        });
        let last_handshake = self.last_handshake_nanos.load(Ordering::Acquire);

        PeerStatus {
            public_key: BASE64.encode(self.remote_static),
            endpoint: self.endpoint(),
            running: self.is_running(),
            tx_bytes: self.tx_bytes(),
            rx_bytes: self.rx_bytes(),
            last_handshake_unix_nanos: (last_handshake != 0).then_some(last_handshake),
            persistent_keepalive_interval: self.persistent_keepalive_interval(),
            disable_roaming: self.disable_roaming(),
            handshake_state,
            has_session,
        }
    }

    pub(crate) fn emit(&self, event: impl FnOnce(PublicKey) -> PeerEvent) {
        if let Some(device) = self.device() {
            device.emit(event(self.remote_static));
        }
    }
}
