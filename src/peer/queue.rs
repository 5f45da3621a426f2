//! Per-peer packet queues
//!
//! Staged packets wait for a usable keypair. Outbound and inbound elements
//! travel through bounded channels to the peer's sequential tasks, each
//! holding the one-shot slot its crypto result will land in.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::device::pipeline::CryptResult;
use crate::protocol::Keypair;

/// A packet sealed (or being sealed) for transmission
pub struct OutboundElement {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    /// Plaintext length; zero marks a keepalive
    pub len: usize,
    pub sealed: oneshot::Receiver<CryptResult>,
}

impl OutboundElement {
    pub fn is_keepalive(&self) -> bool {
        self.len == 0
    }
}

/// A transport message opened (or being opened) for delivery
pub struct InboundElement {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    /// Size of the message on the wire
    pub wire_len: usize,
    pub endpoint: SocketAddr,
    pub opened: oneshot::Receiver<CryptResult>,
}

/// Senders of the two sequential queues; present only while the peer runs
pub(crate) struct PeerQueues {
    pub outbound: mpsc::Sender<OutboundElement>,
    pub inbound: mpsc::Sender<InboundElement>,
}

/// Bounded FIFO of plaintext packets waiting for a session
///
/// When full, the oldest packet is dropped to make room.
pub struct StagedQueue {
    packets: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl StagedQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a packet; returns true if the oldest packet was dropped
    pub fn push(&self, packet: Vec<u8>) -> bool {
        let mut packets = self.packets.lock();
        let dropped = if packets.len() >= self.capacity {
            packets.pop_front().is_some()
        } else {
            false
        };
        packets.push_back(packet);
        dropped
    }

    /// Return a packet to the head of the queue
    ///
    /// Used when a packet was popped but could not be given a counter. If the
    /// queue filled up in the meantime the returned packet is the one dropped.
    pub fn push_front(&self, packet: Vec<u8>) {
        let mut packets = self.packets.lock();
        if packets.len() < self.capacity {
            packets.push_front(packet);
        }
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.packets.lock().pop_front()
    }

    /// Drop every staged packet; returns how many were dropped
    pub fn flush(&self) -> usize {
        let mut packets = self.packets.lock();
        let count = packets.len();
        packets.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}
