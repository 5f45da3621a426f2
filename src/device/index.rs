//! Receiver index table
//!
//! Maps the 32-bit indices we hand out in handshake messages back to the
//! peer, and later the keypair, that incoming messages belong to.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::Rng;

use crate::peer::Peer;
use crate::protocol::Keypair;

/// What a receiver index currently routes to
#[derive(Debug, Clone)]
pub enum IndexEntry {
    /// A handshake in flight
    Handshake(Weak<Peer>),
    /// An established keypair
    Keypair {
        peer: Weak<Peer>,
        keypair: Weak<Keypair>,
    },
}

#[derive(Debug, Default)]
pub struct IndexTable {
    table: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, non-zero index routed to `peer`'s handshake
    pub fn new_index_for_handshake(&self, peer: &Arc<Peer>) -> u32 {
        let mut rng = OsRng;
        let mut table = self.table.write();
        loop {
            let index = rng.gen_range(1..=u32::MAX);
            if let std::collections::hash_map::Entry::Vacant(slot) = table.entry(index) {
                slot.insert(IndexEntry::Handshake(Arc::downgrade(peer)));
                return index;
            }
        }
    }

    /// Re-point a handshake index at the keypair derived from it
    ///
    /// Does nothing if the index was released in the meantime.
    pub fn swap_index_for_keypair(&self, index: u32, keypair: &Arc<Keypair>) {
        let mut table = self.table.write();
        if let Some(entry) = table.get_mut(&index) {
            let peer = match entry {
                IndexEntry::Handshake(peer) => peer.clone(),
                IndexEntry::Keypair { peer, .. } => peer.clone(),
            };
            *entry = IndexEntry::Keypair {
                peer,
                keypair: Arc::downgrade(keypair),
            };
        }
    }

    pub fn delete(&self, index: u32) {
        if index == 0 {
            return;
        }
        self.table.write().remove(&index);
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        self.table.read().get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
