//! WireGuard session state
//!
//! This module contains the per-peer protocol state:
//! - Message framing the core routes on
//! - Handshake state and the engine that drives it
//! - Transport keypairs, their rotation slots and the anti-replay window

pub mod handshake;
pub mod keypair;
pub mod messages;

use std::time::Duration;

pub use handshake::{Handshake, HandshakeEngine, HandshakeState, SessionKeys};
pub use keypair::{Keypair, Keypairs, ReplayWindow};
pub use messages::{MessageType, TransportHeader};

/// Initiate rekey after this many messages on one keypair
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Keypairs refuse to send past this counter
/// 2^64 - 2^13 - 1, as in the WireGuard whitepaper
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Initiate rekey after this many seconds
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Reject packets from keypairs older than this
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Give up on a handshake after retrying for this long
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Rekey timeout - retransmit an unanswered initiation after this long
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the random jitter added to handshake timers
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(333);

/// Keepalive timeout - send keepalive if no packet sent within this time
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake retries allowed before a peer is reported unreachable
pub const MAX_TIMER_HANDSHAKES: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;
