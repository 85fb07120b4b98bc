//! Peer identity: a short deterministic id derived from a peer's listen address.

use std::fmt;

use sha2::{Digest, Sha256};

/// Width of a peer id on the wire. Shared by every peer in the network.
pub const PEER_ID_LEN: usize = 4;

/// Peer ID: truncated SHA-256 of `"host:port"`. Registry key and sender stamp.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Create a `PeerId` from raw bytes, e.g. a decoded sender stamp.
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Derive the peer id for a (host, port) endpoint. Pure and deterministic:
/// two peers agree on an id as long as they spell the host the same way.
pub fn derive_peer_id(host: &str, port: u16) -> PeerId {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", host, port).as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; PEER_ID_LEN];
    id.copy_from_slice(&digest[..PEER_ID_LEN]);
    PeerId(id)
}
