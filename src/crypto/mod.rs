//! Cryptographic primitives used by the peer core
//!
//! - ChaCha20-Poly1305 transport sealing and opening (aead)
//! - X25519 keys and the static-static precomputation (x25519)

pub mod aead;
pub mod x25519;

pub use x25519::{PrivateKey, PublicKey, StaticIdentity};
