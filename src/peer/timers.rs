//! Per-peer protocol timers
//!
//! Five one-shot timers drive handshake retransmission, passive and
//! persistent keepalives, rekeying when the remote goes quiet and the final
//! zeroing of key material. Protocol events re-arm or disarm them through the
//! `timers_*` hooks below.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::device::PeerEvent;
use crate::peer::Peer;
use crate::protocol::{
    KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_TIMEOUT,
    REKEY_TIMEOUT_JITTER_MAX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    RetransmitHandshake,
    SendKeepalive,
    NewHandshake,
    ZeroKeyMaterial,
    PersistentKeepalive,
}

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    worker: Option<JoinHandle<()>>,
}

/// State shared between a timer and its worker task
#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    changed: Notify,
}

impl TimerShared {
    fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// Take the deadline if it is still `expected`
    fn claim(&self, expected: Instant) -> bool {
        let mut state = self.state.lock();
        if state.deadline != Some(expected) {
            return false;
        }
        state.deadline = None;
        true
    }
}

/// One re-armable deadline
///
/// A single worker task per timer sleeps until the current deadline and moves
/// its sleep when the deadline changes. Callbacks run on the worker, so a
/// callback may re-arm its own timer.
pub(crate) struct Timer {
    kind: TimerKind,
    peer: Weak<Peer>,
    shared: Arc<TimerShared>,
}

impl Timer {
    fn new(kind: TimerKind, peer: Weak<Peer>) -> Self {
        Self {
            kind,
            peer,
            shared: Arc::new(TimerShared::default()),
        }
    }

    /// Arm the timer to fire after `delay`, replacing any pending deadline
    pub(crate) fn modify(&self, delay: Duration) {
        let mut state = self.shared.state.lock();
        state.deadline = Some(Instant::now() + delay);

        let running = state
            .worker
            .as_ref()
            .map_or(false, |worker| !worker.is_finished());
        if running {
            self.shared.changed.notify_one();
        } else {
            state.worker = Some(tokio::spawn(run_timer(
                Arc::clone(&self.shared),
                self.kind,
                self.peer.clone(),
            )));
        }
    }

    /// Disarm the timer; a callback already running is left to finish
    pub(crate) fn delete(&self) {
        self.shared.state.lock().deadline = None;
        self.shared.changed.notify_one();
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.shared.deadline().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(worker) = self.shared.state.lock().worker.take() {
            worker.abort();
        }
    }
}

async fn run_timer(shared: Arc<TimerShared>, kind: TimerKind, peer: Weak<Peer>) {
    let sleep = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(sleep);

    loop {
        let deadline = match shared.deadline() {
            Some(deadline) => deadline,
            None => {
                shared.changed.notified().await;
                continue;
            }
        };

        sleep.as_mut().reset(deadline);
        tokio::select! {
            _ = &mut sleep => {}
            _ = shared.changed.notified() => continue,
        }

        if !shared.claim(deadline) {
            continue;
        }
        match peer.upgrade() {
            Some(peer) => peer.on_timer_expired(kind).await,
            None => return,
        }
    }
}

pub(crate) struct Timers {
    retransmit_handshake: Timer,
    send_keepalive: Timer,
    new_handshake: Timer,
    zero_key_material: Timer,
    persistent_keepalive: Timer,
    pub(crate) handshake_attempts: AtomicU32,
    need_another_keepalive: AtomicBool,
    pub(crate) sent_last_minute_handshake: AtomicBool,
}

impl Timers {
    pub(crate) fn new(peer: Weak<Peer>) -> Self {
        Self {
            retransmit_handshake: Timer::new(TimerKind::RetransmitHandshake, peer.clone()),
            send_keepalive: Timer::new(TimerKind::SendKeepalive, peer.clone()),
            new_handshake: Timer::new(TimerKind::NewHandshake, peer.clone()),
            zero_key_material: Timer::new(TimerKind::ZeroKeyMaterial, peer.clone()),
            persistent_keepalive: Timer::new(TimerKind::PersistentKeepalive, peer),
            handshake_attempts: AtomicU32::new(0),
            need_another_keepalive: AtomicBool::new(false),
            sent_last_minute_handshake: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self, kind: TimerKind) -> &Timer {
        match kind {
            TimerKind::RetransmitHandshake => &self.retransmit_handshake,
            TimerKind::SendKeepalive => &self.send_keepalive,
            TimerKind::NewHandshake => &self.new_handshake,
            TimerKind::ZeroKeyMaterial => &self.zero_key_material,
            TimerKind::PersistentKeepalive => &self.persistent_keepalive,
        }
    }

    /// Reset counters and flags before the peer starts
    pub(crate) fn init(&self) {
        self.handshake_attempts.store(0, Ordering::Release);
        self.need_another_keepalive.store(false, Ordering::Release);
        self.sent_last_minute_handshake.store(false, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.retransmit_handshake.delete();
        self.send_keepalive.delete();
        self.new_handshake.delete();
        self.zero_key_material.delete();
        self.persistent_keepalive.delete();
    }
}

fn jitter() -> Duration {
    let max = REKEY_TIMEOUT_JITTER_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

impl Peer {
    /// Whether timer hooks may arm timers at all
    pub(crate) fn timers_active(&self) -> bool {
        self.is_running() && self.device().map_or(false, |device| device.is_up())
    }

    pub fn is_timer_pending(&self, kind: TimerKind) -> bool {
        self.timers.get(kind).is_pending()
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.timers.handshake_attempts.load(Ordering::Acquire)
    }

    pub(crate) async fn on_timer_expired(self: Arc<Self>, kind: TimerKind) {
        if !self.timers_active() {
            return;
        }

        match kind {
            TimerKind::RetransmitHandshake => self.expired_retransmit_handshake().await,
            TimerKind::SendKeepalive => self.expired_send_keepalive().await,
            TimerKind::NewHandshake => self.expired_new_handshake().await,
            TimerKind::ZeroKeyMaterial => self.expired_zero_key_material(),
            TimerKind::PersistentKeepalive => self.expired_persistent_keepalive().await,
        }
    }

    async fn expired_retransmit_handshake(self: &Arc<Self>) {
        let attempts = self.timers.handshake_attempts.load(Ordering::Acquire);
        if attempts > MAX_TIMER_HANDSHAKES {
            tracing::warn!(
                "{} - Handshake did not complete after {} attempts, giving up",
                self,
                attempts + 1
            );
            self.emit(|public_key| PeerEvent::Unreachable {
                public_key,
                attempts: attempts + 1,
            });

            if self.timers_active() {
                self.timers.send_keepalive.delete();
            }
            self.flush_staged_packets();
            if self.timers_active() && !self.timers.zero_key_material.is_pending() {
                self.timers.zero_key_material.modify(REJECT_AFTER_TIME * 3);
            }
        } else {
            self.timers.handshake_attempts.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(
                "{} - Handshake did not complete after {} seconds, retrying (try {})",
                self,
                REKEY_TIMEOUT.as_secs(),
                attempts + 2
            );
            if let Err(e) = self.send_handshake_initiation(true).await {
                tracing::debug!("{} - Failed to retry handshake: {}", self, e);
            }
        }
    }

    async fn expired_send_keepalive(self: &Arc<Self>) {
        self.send_keepalive().await;
        if self.timers.need_another_keepalive.swap(false, Ordering::AcqRel) && self.timers_active() {
            self.timers.send_keepalive.modify(KEEPALIVE_TIMEOUT);
        }
    }

    async fn expired_new_handshake(self: &Arc<Self>) {
        tracing::debug!(
            "{} - Retrying handshake because we stopped hearing back after {} seconds",
            self,
            (KEEPALIVE_TIMEOUT + REKEY_TIMEOUT).as_secs()
        );
        if let Err(e) = self.send_handshake_initiation(false).await {
            tracing::debug!("{} - Failed to send handshake initiation: {}", self, e);
        }
    }

    fn expired_zero_key_material(&self) {
        tracing::info!(
            "{} - Removing all keys, since we haven't received a new one in {} seconds",
            self,
            (REJECT_AFTER_TIME * 3).as_secs()
        );
        self.clear_all();
        self.emit(|public_key| PeerEvent::KeyMaterialZeroed { public_key });
    }

    async fn expired_persistent_keepalive(self: &Arc<Self>) {
        if self.persistent_keepalive_interval() > 0 {
            self.send_keepalive().await;
        }
    }

    /// After an authenticated data packet is sent
    pub(crate) fn timers_data_sent(&self) {
        if self.timers_active() && !self.timers.new_handshake.is_pending() {
            self.timers
                .new_handshake
                .modify(KEEPALIVE_TIMEOUT + REKEY_TIMEOUT + jitter());
        }
    }

    /// After an authenticated data packet is received
    pub(crate) fn timers_data_received(&self) {
        if self.timers_active() {
            if !self.timers.send_keepalive.is_pending() {
                self.timers.send_keepalive.modify(KEEPALIVE_TIMEOUT);
            } else {
                self.timers.need_another_keepalive.store(true, Ordering::Release);
            }
        }
    }

    /// After any authenticated packet is sent: keepalive, data or handshake
    pub(crate) fn timers_any_authenticated_packet_sent(&self) {
        if self.timers_active() {
            self.timers.send_keepalive.delete();
        }
    }

    /// After any authenticated packet is received: keepalive, data or handshake
    pub(crate) fn timers_any_authenticated_packet_received(&self) {
        if self.timers_active() {
            self.timers.new_handshake.delete();
        }
    }

    pub(crate) fn timers_handshake_initiated(&self) {
        if self.timers_active() {
            self.timers.retransmit_handshake.modify(REKEY_TIMEOUT + jitter());
        }
    }

    /// After a response is consumed, or the first message under a new
    /// responder keypair arrives
    pub(crate) fn timers_handshake_complete(&self) {
        if self.timers_active() {
            self.timers.retransmit_handshake.delete();
        }
        self.timers.handshake_attempts.store(0, Ordering::Release);
        self.timers
            .sent_last_minute_handshake
            .store(false, Ordering::Release);
        self.mark_handshake_complete();
        tracing::debug!("{} - Handshake complete", self);
        self.emit(|public_key| PeerEvent::HandshakeComplete { public_key });
    }

    /// After new session keys are derived
    pub(crate) fn timers_session_derived(&self) {
        if self.timers_active() {
            self.timers.zero_key_material.modify(REJECT_AFTER_TIME * 3);
        }
    }

    /// Before an authenticated packet is sent, or after one is received
    pub(crate) fn timers_any_authenticated_packet_traversal(&self) {
        let keepalive = self.persistent_keepalive_interval();
        if keepalive > 0 && self.timers_active() {
            self.timers
                .persistent_keepalive
                .modify(Duration::from_secs(u64::from(keepalive)));
        }
    }
}
