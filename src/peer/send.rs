//! Outbound path
//!
//! Application packets are staged, given a counter under the current
//! keypair, pushed onto the outbound queue and handed to the shared crypto
//! workers. The sequential sender then transmits them in queue order.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::device::pipeline::CryptJob;
use crate::error::{QueueError, SecureGuardError};
use crate::peer::{OutboundElement, Peer};
use crate::protocol::{
    HandshakeState, Keypair, KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES,
    REKEY_AFTER_TIME, REKEY_TIMEOUT,
};

impl Peer {
    /// Queue an application packet and try to send everything staged
    ///
    /// Packets for a peer that is not running are dropped.
    pub async fn send_packet(self: &Arc<Self>, packet: Vec<u8>) {
        if !self.is_running() {
            tracing::trace!("{} - Dropping packet, peer not running", self);
            return;
        }
        self.stage_packet(packet);
        self.send_staged_packets().await;
    }

    pub(crate) fn stage_packet(&self, packet: Vec<u8>) {
        if let Some(staged) = self.staged.get() {
            if staged.push(packet) {
                tracing::trace!("{} - Staged queue full, dropped oldest packet", self);
            }
        }
    }

    /// Queue a keepalive unless data is already waiting, then flush
    pub async fn send_keepalive(self: &Arc<Self>) {
        if let Some(staged) = self.staged.get() {
            if staged.is_empty() && self.is_running() {
                staged.push(Vec::new());
                tracing::trace!("{} - Sending keepalive packet", self);
            }
        }
        self.send_staged_packets().await;
    }

    /// Move staged packets onto the outbound queue
    ///
    /// Without a usable keypair this starts a handshake instead and leaves
    /// the packets staged.
    pub async fn send_staged_packets(self: &Arc<Self>) {
        let staged = match self.staged.get() {
            Some(staged) => staged,
            None => return,
        };
        let device = match self.device() {
            Some(device) => device,
            None => return,
        };

        // One flush at a time so counters enter the outbound queue in order
        let flush = self.flush.lock().await;

        'top: loop {
            if staged.is_empty() || !device.is_up() {
                return;
            }

            let current = self.session.lock().keypairs.current().cloned();
            let keypair = match current {
                Some(keypair) if !keypair.is_exhausted() && !keypair.is_expired() => keypair,
                _ => break 'top,
            };

            while let Some(packet) = staged.pop() {
                let counter = match keypair.next_counter() {
                    Ok(counter) => counter,
                    Err(_) => {
                        staged.push_front(packet);
                        continue 'top;
                    }
                };

                if let Err(e) = self.enqueue_outbound(&keypair, counter, packet).await {
                    tracing::trace!("{} - Dropping outbound packet: {}", self, e);
                }
            }
            return;
        }

        drop(flush);
        if let Err(e) = self.send_handshake_initiation(false).await {
            tracing::debug!("{} - Failed to send handshake initiation: {}", self, e);
        }
    }

    async fn enqueue_outbound(
        &self,
        keypair: &Arc<Keypair>,
        counter: u64,
        packet: Vec<u8>,
    ) -> Result<(), QueueError> {
        let device = self.device().ok_or(QueueError::Closed)?;
        let outbound = self.outbound_sender()?;

        let (done, sealed) = oneshot::channel();
        let element = OutboundElement {
            keypair: Arc::clone(keypair),
            counter,
            len: packet.len(),
            sealed,
        };

        // The slot joins the sequential queue before the job is submitted
        outbound.send(element).await.map_err(|_| QueueError::Closed)?;
        device
            .pipeline()
            .submit(CryptJob::Seal {
                keypair: Arc::clone(keypair),
                counter,
                plaintext: packet,
                done,
            })
            .await
    }

    /// Send a handshake initiation unless one went out within REKEY_TIMEOUT
    pub async fn send_handshake_initiation(
        self: &Arc<Self>,
        is_retry: bool,
    ) -> Result<(), SecureGuardError> {
        if !is_retry {
            self.timers.handshake_attempts.store(0, Ordering::Release);
        }

        let device = match self.device() {
            Some(device) => device,
            None => return Ok(()),
        };

        let msg = {
            let identity = device.identity();
            let mut guard = self.session.lock();
            let session = &mut *guard;

            if let Some(sent) = session.handshake.last_sent_handshake() {
                if sent.elapsed() < REKEY_TIMEOUT {
                    return Ok(());
                }
            }
            session.handshake.mark_sent(Instant::now());

            if let Some(old) = session.handshake.clear() {
                device.index_table().delete(old);
            }
            let index = device.index_table().new_index_for_handshake(self);
            session.handshake.set_local_index(index);

            let msg = device
                .engine()
                .create_initiation(&identity, &mut session.handshake, index)?;
            session.handshake.set_state(HandshakeState::InitiationCreated);
            msg
        };

        tracing::debug!("{} - Sending handshake initiation", self);

        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();

        let result = self.send_raw(&msg).await;
        if let Err(e) = &result {
            tracing::warn!("{} - Failed to send handshake initiation: {}", self, e);
        }

        self.timers_handshake_initiated();
        result.map_err(SecureGuardError::from)
    }

    /// Start a handshake if the current keypair is due for rotation
    pub(crate) async fn keep_key_fresh_sending(self: &Arc<Self>) {
        let current = self.session.lock().keypairs.current().cloned();
        let keypair = match current {
            Some(keypair) => keypair,
            None => return,
        };

        let due = keypair.send_counter() > REKEY_AFTER_MESSAGES
            || (keypair.is_initiator() && keypair.age() > REKEY_AFTER_TIME);
        if due {
            if let Err(e) = self.send_handshake_initiation(false).await {
                tracing::debug!("{} - Failed to rekey: {}", self, e);
            }
        }
    }

    /// Start one last handshake before an initiator keypair stops receiving
    pub(crate) async fn keep_key_fresh_receiving(self: &Arc<Self>) {
        if self.timers.sent_last_minute_handshake.load(Ordering::Acquire) {
            return;
        }

        let current = self.session.lock().keypairs.current().cloned();
        let keypair = match current {
            Some(keypair) if keypair.is_initiator() => keypair,
            _ => return,
        };

        if keypair.age() > REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT {
            self.timers
                .sent_last_minute_handshake
                .store(true, Ordering::Release);
            if let Err(e) = self.send_handshake_initiation(false).await {
                tracing::debug!("{} - Failed to send last minute handshake: {}", self, e);
            }
        }
    }

    /// Transmit sealed elements in the order they were queued
    pub(crate) async fn run_sequential_sender(
        self: Arc<Self>,
        mut outbound: mpsc::Receiver<OutboundElement>,
    ) {
        tracing::trace!("{} - Sequential sender started", self);

        while let Some(element) = outbound.recv().await {
            let is_keepalive = element.is_keepalive();
            let msg = match element.sealed.await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    tracing::trace!("{} - Dropping packet that failed to seal: {}", self, e);
                    continue;
                }
                Err(_) => continue,
            };

            self.timers_any_authenticated_packet_traversal();
            self.timers_any_authenticated_packet_sent();

            let result = self.send_raw(&msg).await;
            if !is_keepalive {
                self.timers_data_sent();
            }
            if let Err(e) = result {
                tracing::warn!("{} - Failed to send data packet: {}", self, e);
                continue;
            }

            self.keep_key_fresh_sending().await;
        }

        tracing::trace!("{} - Sequential sender stopped", self);
    }
}
