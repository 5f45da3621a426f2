//! Handshake state for one peer
//!
//! The Noise computation itself is delegated to a [`HandshakeEngine`]. This
//! module owns the state the engine reads and writes, and the rules for
//! wiping it.

use tokio::time::Instant;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{PublicKey, StaticIdentity};
use crate::error::CryptoError;

/// Transport keys derived at the end of a handshake
pub struct SessionKeys {
    pub send: Zeroizing<[u8; 32]>,
    pub receive: Zeroizing<[u8; 32]>,
}

/// Progress of the handshake in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zeroed => "zeroed",
            Self::InitiationCreated => "initiation-created",
            Self::InitiationConsumed => "initiation-consumed",
            Self::ResponseCreated => "response-created",
            Self::ResponseConsumed => "response-consumed",
        }
    }
}

/// Noise handshake messages and key derivation
///
/// Implementations fill the ephemeral, hash and chaining key fields of the
/// [`Handshake`] they are given. State transitions, index allocation and
/// keypair installation stay with the peer.
pub trait HandshakeEngine: Send + Sync {
    /// Build an initiation message carrying `sender_index`
    fn create_initiation(
        &self,
        identity: &StaticIdentity,
        handshake: &mut Handshake,
        sender_index: u32,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Static public key of the initiator of `msg`, used to route it to a peer
    fn initiator_static(
        &self,
        identity: &StaticIdentity,
        msg: &[u8],
    ) -> Result<PublicKey, CryptoError>;

    /// Absorb an initiation; returns the initiator's sender index
    fn consume_initiation(
        &self,
        identity: &StaticIdentity,
        handshake: &mut Handshake,
        msg: &[u8],
    ) -> Result<u32, CryptoError>;

    /// Build a response to the consumed initiation carrying `sender_index`
    fn create_response(
        &self,
        identity: &StaticIdentity,
        handshake: &mut Handshake,
        sender_index: u32,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Absorb a response; returns the responder's sender index
    fn consume_response(
        &self,
        identity: &StaticIdentity,
        handshake: &mut Handshake,
        msg: &[u8],
    ) -> Result<u32, CryptoError>;

    /// Split the chaining key into transport keys for our role
    fn derive_keys(&self, handshake: &Handshake, is_initiator: bool) -> SessionKeys;
}

/// Handshake state of one peer
pub struct Handshake {
    state: HandshakeState,
    remote_static: PublicKey,
    precomputed_static_static: Zeroizing<[u8; 32]>,
    preshared_key: Zeroizing<[u8; 32]>,
    /// Our ephemeral private key
    pub local_ephemeral: Zeroizing<[u8; 32]>,
    pub remote_ephemeral: [u8; 32],
    pub hash: Zeroizing<[u8; 32]>,
    pub chain_key: Zeroizing<[u8; 32]>,
    local_index: u32,
    remote_index: u32,
    /// `None` means the last initiation was sent arbitrarily long ago
    last_sent_handshake: Option<Instant>,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish_non_exhaustive()
    }
}

impl Handshake {
    pub fn new(remote_static: PublicKey, precomputed_static_static: Zeroizing<[u8; 32]>) -> Self {
        Self {
            state: HandshakeState::Zeroed,
            remote_static,
            precomputed_static_static,
            preshared_key: Zeroizing::new([0u8; 32]),
            local_ephemeral: Zeroizing::new([0u8; 32]),
            remote_ephemeral: [0u8; 32],
            hash: Zeroizing::new([0u8; 32]),
            chain_key: Zeroizing::new([0u8; 32]),
            local_index: 0,
            remote_index: 0,
            last_sent_handshake: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn precomputed_static_static(&self) -> &[u8; 32] {
        &self.precomputed_static_static
    }

    pub(crate) fn set_precomputed_static_static(&mut self, secret: Zeroizing<[u8; 32]>) {
        self.precomputed_static_static = secret;
    }

    /// Preshared key, all zeros when none is configured
    pub fn preshared_key(&self) -> &[u8; 32] {
        &self.preshared_key
    }

    pub(crate) fn set_preshared_key(&mut self, key: Option<[u8; 32]>) {
        *self.preshared_key = key.unwrap_or([0u8; 32]);
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub(crate) fn set_local_index(&mut self, index: u32) {
        self.local_index = index;
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub(crate) fn set_remote_index(&mut self, index: u32) {
        self.remote_index = index;
    }

    pub fn last_sent_handshake(&self) -> Option<Instant> {
        self.last_sent_handshake
    }

    pub(crate) fn mark_sent(&mut self, at: Instant) {
        self.last_sent_handshake = Some(at);
    }

    /// Pretend the last initiation was sent long ago so the next one is not
    /// rate limited
    pub(crate) fn reset_last_sent(&mut self) {
        self.last_sent_handshake = None;
    }

    /// Wipe ephemeral state and forget the index
    ///
    /// Returns the local index that was held so the caller can release it
    /// from the index table. The static-static secret and the preshared key
    /// are kept for the next handshake.
    pub fn clear(&mut self) -> Option<u32> {
        self.local_ephemeral.zeroize();
        self.remote_ephemeral.zeroize();
        self.hash.zeroize();
        self.chain_key.zeroize();
        self.remote_index = 0;
        self.state = HandshakeState::Zeroed;

        match std::mem::take(&mut self.local_index) {
            0 => None,
            index => Some(index),
        }
    }

    /// True when no ephemeral secret survives and no index is held
    pub fn is_zeroed(&self) -> bool {
        self.state == HandshakeState::Zeroed
            && self.local_index == 0
            && self.local_ephemeral.iter().all(|&b| b == 0)
            && self.remote_ephemeral.iter().all(|&b| b == 0)
            && self.hash.iter().all(|&b| b == 0)
            && self.chain_key.iter().all(|&b| b == 0)
    }
}
