//! Peer registry: peer id -> address, advertised files, display index.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::identity::{derive_peer_id, PeerId};
use crate::protocol::FileName;

/// A peer's listen endpoint as registered with the rendezvous service.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        derive_peer_id(&self.host, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What the registry knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    /// `None` until discovery confirms the address of a peer first seen through an OFFER.
    pub address: Option<PeerAddr>,
    pub files: BTreeSet<FileName>,
    /// Assigned at first sight, never reused within the process.
    pub display_index: u64,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sight of this peer; carries the freshly assigned display index.
    New(u64),
    Existing,
}

/// In-memory peer table. Not synchronized: the owner wraps it in a lock.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
    next_index: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. A display index is assigned only on first
    /// sight; a given address replaces the stored one; a given file is added
    /// to the set (re-announcements are no-ops).
    pub fn upsert(&mut self, id: PeerId, address: Option<PeerAddr>, file: Option<FileName>) -> Upsert {
        let mut outcome = Upsert::Existing;
        let record = self.peers.entry(id).or_insert_with(|| {
            let display_index = self.next_index;
            self.next_index += 1;
            outcome = Upsert::New(display_index);
            PeerRecord {
                id,
                address: None,
                files: BTreeSet::new(),
                display_index,
            }
        });
        if let Some(address) = address {
            record.address = Some(address);
        }
        if let Some(file) = file {
            record.files.insert(file);
        }
        outcome
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    /// Fill in (or replace) the address of a known peer. Returns false for unknown peers.
    pub fn resolve_address(&mut self, id: &PeerId, address: PeerAddr) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.address = Some(address);
                true
            }
            None => false,
        }
    }

    /// Merge a rendezvous listing: every entry except `self_addr` is upserted
    /// by its derived id. Known peers keep their files and index. Returns the
    /// number of newly seen peers.
    pub fn merge_discovered<I>(&mut self, self_addr: &PeerAddr, entries: I) -> usize
    where
        I: IntoIterator<Item = PeerAddr>,
    {
        let mut added = 0;
        for addr in entries {
            if &addr == self_addr {
                continue;
            }
            let id = addr.peer_id();
            if self.contains(&id) {
                self.resolve_address(&id, addr);
            } else {
                self.upsert(id, Some(addr), None);
                added += 1;
            }
        }
        added
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Lookup by user-facing display index.
    pub fn by_index(&self, index: u64) -> Option<&PeerRecord> {
        self.peers.values().find(|r| r.display_index == index)
    }

    /// Snapshot ordered by display index.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.values().cloned().collect();
        out.sort_by_key(|r| r.display_index);
        out
    }

    /// Peers with a resolved address, ordered by display index. Gossip targets.
    pub fn addresses(&self) -> Vec<(PeerId, PeerAddr)> {
        self.list()
            .into_iter()
            .filter_map(|r| r.address.map(|a| (r.id, a)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
