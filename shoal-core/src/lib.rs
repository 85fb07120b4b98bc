//! Shoal protocol reference implementation.
//! No I/O: the node crate owns sockets and files and drives these types.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{derive_peer_id, PeerId, PEER_ID_LEN};
pub use protocol::{FileName, FileNameError, Message};
pub use wire::{decode, encode, record_len, DecodeError};

pub mod chunk;
pub mod integrity;
pub mod registry;

pub use registry::{PeerAddr, PeerRecord, PeerRegistry, Upsert};
