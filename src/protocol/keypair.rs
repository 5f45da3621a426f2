//! Transport keypairs for WireGuard
//!
//! A keypair is one session epoch: a send key with its counter and a receive
//! key with its anti-replay window. Each peer rotates three of them through
//! the previous, current and next slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::crypto::aead;
use crate::error::{CryptoError, ProtocolError};
use crate::protocol::handshake::SessionKeys;
use crate::protocol::messages::TransportHeader;
use crate::protocol::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME};

/// Size of the anti-replay window in packets
const WINDOW_SIZE: u64 = 128;

/// Anti-replay window for tracking received packet counters
///
/// Uses a sliding window bitmap to efficiently track which counters
/// have been seen, preventing replay attacks.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    /// Highest counter value seen
    highest: u64,
    /// Bit N represents (highest - N) for N in 0..WINDOW_SIZE
    bitmap: u128,
}

impl ReplayWindow {
    /// Create a new replay window
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a counter is valid (not a replay) and update window
    ///
    /// Returns true if the counter is valid (first time seen and within window)
    pub fn validate(&mut self, counter: u64) -> bool {
        if counter >= REJECT_AFTER_MESSAGES {
            return false;
        }

        // Nothing seen yet
        if self.bitmap == 0 {
            self.highest = counter;
            self.bitmap = 1;
            return true;
        }

        if counter > self.highest {
            let shift = counter - self.highest;
            if shift >= WINDOW_SIZE {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = counter;
            return true;
        }

        let diff = self.highest - counter;
        if diff >= WINDOW_SIZE {
            // Too old, outside window
            return false;
        }

        let bit = 1u128 << diff;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// Symmetric session keys for one epoch
pub struct Keypair {
    send_key: Zeroizing<[u8; 32]>,
    receive_key: Zeroizing<[u8; 32]>,
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
    created: Instant,
    is_initiator: bool,
    local_index: u32,
    remote_index: u32,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .field("send_counter", &self.send_counter())
            .finish_non_exhaustive()
    }
}

impl Keypair {
    /// Create a keypair from freshly derived session keys
    pub fn new(keys: SessionKeys, is_initiator: bool, local_index: u32, remote_index: u32) -> Self {
        Self {
            send_key: keys.send,
            receive_key: keys.receive,
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
            created: Instant::now(),
            is_initiator,
            local_index,
            remote_index,
        }
    }

    /// Reserve the next send counter
    ///
    /// Counters are handed out exactly once and never wrap: once the reject
    /// threshold is reached every further call fails.
    pub fn next_counter(&self) -> Result<u64, ProtocolError> {
        self.send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < REJECT_AFTER_MESSAGES).then_some(n + 1)
            })
            .map_err(|_| ProtocolError::KeyExhausted)
    }

    /// Next counter that would be handed out
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Acquire)
    }

    /// Make this keypair permanently unusable for sending
    pub fn exhaust(&self) {
        self.send_counter.store(REJECT_AFTER_MESSAGES, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.send_counter() >= REJECT_AFTER_MESSAGES
    }

    /// Time since the keypair was derived
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Keypairs older than REJECT_AFTER_TIME may neither send nor receive
    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    /// Seal `plaintext` under `counter` into a complete transport message
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sealed = aead::seal(&self.send_key, counter, plaintext)?;
        Ok(TransportHeader::build_message(self.remote_index, counter, &sealed))
    }

    /// Open the sealed payload of a transport message
    pub fn open(&self, counter: u64, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::open(&self.receive_key, counter, sealed)
    }

    /// Check a received counter against the replay window
    pub fn validate_counter(&self, counter: u64) -> bool {
        self.replay.lock().validate(counter)
    }
}

/// The three rotation slots of a peer
#[derive(Debug, Default)]
pub struct Keypairs {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

impl Keypairs {
    pub fn previous(&self) -> Option<&Arc<Keypair>> {
        self.previous.as_ref()
    }

    /// The only keypair used for new encryption
    pub fn current(&self) -> Option<&Arc<Keypair>> {
        self.current.as_ref()
    }

    pub fn next(&self) -> Option<&Arc<Keypair>> {
        self.next.as_ref()
    }

    /// Install a freshly derived keypair
    ///
    /// The initiator may use its keypair immediately, so it becomes current.
    /// The responder must wait for the first transport message, so it parks
    /// in next. Returns the keypairs that fell out of every slot.
    pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut released = Vec::new();
        let previous = self.previous.take();

        if keypair.is_initiator() {
            match self.next.take() {
                Some(next) => {
                    self.previous = Some(next);
                    released.extend(self.current.take());
                }
                None => self.previous = self.current.take(),
            }
            released.extend(previous);
            self.current = Some(keypair);
        } else {
            released.extend(self.next.replace(keypair));
            released.extend(previous);
        }

        released
    }

    /// Promote next to current after a transport message arrived under it
    ///
    /// Returns `None` when `received` is not the keypair waiting in next,
    /// otherwise the keypair retired out of previous (if any).
    pub fn promote_next(&mut self, received: &Arc<Keypair>) -> Option<Option<Arc<Keypair>>> {
        match &self.next {
            Some(next) if Arc::ptr_eq(next, received) => {}
            _ => return None,
        }

        let retired = self.previous.take();
        self.previous = self.current.take();
        self.current = self.next.take();
        Some(retired)
    }

    /// Force current and next to the reject threshold
    pub fn exhaust_current_and_next(&mut self) {
        for keypair in self.current.iter().chain(self.next.iter()) {
            keypair.exhaust();
        }
    }

    /// Empty all three slots
    pub fn take_all(&mut self) -> Vec<Arc<Keypair>> {
        [self.previous.take(), self.current.take(), self.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_none() && self.current.is_none() && self.next.is_none()
    }
}
