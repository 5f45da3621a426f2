//! X25519 keys for WireGuard peers
//!
//! Static identities, public key derivation and the static-static shared
//! secret each peer precomputes when it is registered.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};
use zeroize::Zeroizing;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// A peer's static public key, also its identity in the registry
pub type PublicKey = [u8; KEY_LEN];

/// A static private key, wiped when dropped
pub type PrivateKey = Zeroizing<[u8; KEY_LEN]>;

/// Generate a new X25519 keypair
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = DalekPublic::from(&secret);
    (Zeroizing::new(secret.to_bytes()), public.to_bytes())
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> PublicKey {
    let secret = StaticSecret::from(*private_key);
    DalekPublic::from(&secret).to_bytes()
}

/// Compute the static-static shared secret DH(S_local, S_remote)
pub fn shared_secret(private_key: &[u8; KEY_LEN], remote: &PublicKey) -> Zeroizing<[u8; KEY_LEN]> {
    let secret = StaticSecret::from(*private_key);
    let public = DalekPublic::from(*remote);
    Zeroizing::new(secret.diffie_hellman(&public).to_bytes())
}

/// The local static keypair of a device
pub struct StaticIdentity {
    private: PrivateKey,
    public: PublicKey,
}

impl StaticIdentity {
    pub fn new(private: PrivateKey) -> Self {
        let public = public_key(&private);
        Self { private, public }
    }

    pub fn generate() -> Self {
        let (private, public) = generate_keypair();
        Self { private, public }
    }

    pub fn private_key(&self) -> &[u8; KEY_LEN] {
        &self.private
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Precompute DH(S_local, S_remote) for a peer
    pub fn static_static(&self, remote: &PublicKey) -> Zeroizing<[u8; KEY_LEN]> {
        shared_secret(&self.private, remote)
    }
}

impl std::fmt::Debug for StaticIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticIdentity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
