//! Inbound path
//!
//! Handshake messages are consumed directly. Transport messages are queued
//! for decryption and delivered to the interface by the sequential receiver
//! in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::device::pipeline::CryptJob;
use crate::device::Device;
use crate::error::{ProtocolError, QueueError, SecureGuardError};
use crate::peer::{InboundElement, Peer, Session};
use crate::protocol::{HandshakeState, Keypair};

impl Peer {
    /// Turn a finished handshake into a keypair and rotate it in
    ///
    /// Returns the keypairs that fell out of rotation.
    fn begin_symmetric_session(
        &self,
        device: &Device,
        session: &mut Session,
    ) -> Result<Vec<Arc<Keypair>>, ProtocolError> {
        let is_initiator = match session.handshake.state() {
            HandshakeState::ResponseConsumed => true,
            HandshakeState::ResponseCreated => false,
            state => {
                return Err(ProtocolError::UnexpectedHandshakeState {
                    state: state.as_str(),
                })
            }
        };

        let keys = device.engine().derive_keys(&session.handshake, is_initiator);
        let keypair = Arc::new(Keypair::new(
            keys,
            is_initiator,
            session.handshake.local_index(),
            session.handshake.remote_index(),
        ));

        // The handshake's index now routes to the keypair
        device
            .index_table()
            .swap_index_for_keypair(keypair.local_index(), &keypair);
        let _ = session.handshake.clear();

        tracing::debug!(
            "{} - Derived new keypair (local index {}, initiator: {})",
            self,
            keypair.local_index(),
            is_initiator
        );

        Ok(session.keypairs.install(keypair))
    }

    /// Responder side: consume an initiation and answer it
    pub(crate) async fn consume_initiation(
        self: &Arc<Self>,
        msg: &[u8],
        from: SocketAddr,
    ) -> Result<(), SecureGuardError> {
        let device = match self.device() {
            Some(device) => device,
            None => return Ok(()),
        };

        let (response, released) = {
            let identity = device.identity();
            let mut guard = self.session.lock();
            let session = &mut *guard;

            let remote_index =
                device
                    .engine()
                    .consume_initiation(&identity, &mut session.handshake, msg)?;
            session.handshake.set_remote_index(remote_index);
            session.handshake.set_state(HandshakeState::InitiationConsumed);
            session.handshake.mark_sent(Instant::now());

            let index = device.index_table().new_index_for_handshake(self);
            let old = session.handshake.local_index();
            device.index_table().delete(old);
            session.handshake.set_local_index(index);

            let response = device
                .engine()
                .create_response(&identity, &mut session.handshake, index)?;
            session.handshake.set_state(HandshakeState::ResponseCreated);

            let released = self.begin_symmetric_session(&device, session)?;
            (response, released)
        };

        for keypair in &released {
            device.delete_keypair(keypair);
        }

        tracing::debug!("{} - Received handshake initiation", self);

        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_received();
        self.set_endpoint_from_packet(from);
        self.add_rx_bytes(msg.len());

        self.timers_session_derived();
        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();

        tracing::debug!("{} - Sending handshake response", self);
        self.send_raw(&response).await?;
        Ok(())
    }

    /// Initiator side: consume the response to our initiation
    pub(crate) async fn consume_response(
        self: &Arc<Self>,
        msg: &[u8],
        from: SocketAddr,
    ) -> Result<(), SecureGuardError> {
        let device = match self.device() {
            Some(device) => device,
            None => return Ok(()),
        };

        let released = {
            let identity = device.identity();
            let mut guard = self.session.lock();
            let session = &mut *guard;

            let state = session.handshake.state();
            if state != HandshakeState::InitiationCreated {
                return Err(ProtocolError::UnexpectedHandshakeState {
                    state: state.as_str(),
                }
                .into());
            }

            let remote_index =
                device
                    .engine()
                    .consume_response(&identity, &mut session.handshake, msg)?;
            session.handshake.set_remote_index(remote_index);
            session.handshake.set_state(HandshakeState::ResponseConsumed);

            self.begin_symmetric_session(&device, session)?
        };

        for keypair in &released {
            device.delete_keypair(keypair);
        }

        tracing::debug!("{} - Received handshake response", self);

        self.set_endpoint_from_packet(from);
        self.add_rx_bytes(msg.len());
        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_received();

        self.timers_session_derived();
        self.timers_handshake_complete();
        self.send_keepalive().await;
        Ok(())
    }

    /// Queue a transport message for decryption and in-order delivery
    pub(crate) async fn enqueue_inbound(
        &self,
        keypair: Arc<Keypair>,
        counter: u64,
        sealed: Vec<u8>,
        wire_len: usize,
        endpoint: SocketAddr,
    ) -> Result<(), QueueError> {
        let device = self.device().ok_or(QueueError::Closed)?;
        let inbound = self.inbound_sender()?;

        let (done, opened) = oneshot::channel();
        let element = InboundElement {
            keypair: Arc::clone(&keypair),
            counter,
            wire_len,
            endpoint,
            opened,
        };

        inbound.send(element).await.map_err(|_| QueueError::Closed)?;
        device
            .pipeline()
            .submit(CryptJob::Open {
                keypair,
                counter,
                sealed,
                done,
            })
            .await
    }

    /// Promote `keypair` if it is the one waiting in next
    ///
    /// Returns true when this message confirmed a responder handshake.
    pub(crate) fn received_with_keypair(&self, keypair: &Arc<Keypair>) -> bool {
        let retired = {
            let mut session = self.session.lock();
            match session.keypairs.promote_next(keypair) {
                Some(retired) => retired,
                None => return false,
            }
        };

        if let (Some(old), Some(device)) = (retired, self.device()) {
            device.delete_keypair(&old);
        }
        true
    }

    /// Deliver opened packets to the interface in the order they arrived
    pub(crate) async fn run_sequential_receiver(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundElement>,
    ) {
        tracing::trace!("{} - Sequential receiver started", self);

        while let Some(element) = inbound.recv().await {
            let packet = match element.opened.await {
                Ok(Ok(packet)) => packet,
                Ok(Err(e)) => {
                    tracing::trace!("{} - Dropping packet that failed to open: {}", self, e);
                    continue;
                }
                Err(_) => continue,
            };

            if !element.keypair.validate_counter(element.counter) {
                tracing::trace!(
                    "{} - Dropping replayed packet (counter {})",
                    self,
                    element.counter
                );
                continue;
            }

            self.set_endpoint_from_packet(element.endpoint);
            if self.received_with_keypair(&element.keypair) {
                self.timers_handshake_complete();
                self.send_staged_packets().await;
            }

            self.keep_key_fresh_receiving().await;
            self.timers_any_authenticated_packet_traversal();
            self.timers_any_authenticated_packet_received();
            self.add_rx_bytes(element.wire_len);

            if packet.is_empty() {
                tracing::trace!("{} - Received keepalive packet", self);
                continue;
            }
            self.timers_data_received();

            let device = match self.device() {
                Some(device) => device,
                None => continue,
            };
            if let Err(e) = device.tun().write(&packet).await {
                tracing::warn!("{} - Failed to write packet to interface: {}", self, e);
            }
        }

        tracing::trace!("{} - Sequential receiver stopped", self);
    }
}
