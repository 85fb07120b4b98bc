//! Shoal wire protocol: message kinds, tags and field widths.

use std::fmt;

use crate::identity::{PeerId, PEER_ID_LEN};

/// Width of the filename field in OFFER and REQUEST records.
pub const FILE_NAME_LEN: usize = 32;
/// Width of the payload field in CHUNK records; also the transfer chunk size.
pub const CHUNK_SIZE: usize = 1024;
/// Width of the checksum field in CHUNK records.
pub const CHECKSUM_LEN: usize = 2;

pub const TAG_OFFER: u8 = b'O';
pub const TAG_ACK: u8 = b'A';
pub const TAG_REQUEST: u8 = b'R';
pub const TAG_CHUNK: u8 = b'T';

/// Record widths, tag byte included.
pub const OFFER_LEN: usize = 1 + PEER_ID_LEN + FILE_NAME_LEN;
pub const ACK_LEN: usize = 1 + PEER_ID_LEN;
pub const REQUEST_LEN: usize = 1 + FILE_NAME_LEN;
pub const CHUNK_LEN: usize = 1 + CHECKSUM_LEN + CHUNK_SIZE;

/// A file name that fits the fixed filename field.
///
/// Names are never truncated: anything empty, longer than [`FILE_NAME_LEN`]
/// bytes of UTF-8, or containing a NUL byte is rejected on both the sending
/// and the receiving side. Trailing NULs are padding on the wire, so a name
/// ending in NUL could not survive a round trip.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FileName(String);

impl FileName {
    pub fn new(name: impl Into<String>) -> Result<Self, FileNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(FileNameError::Empty);
        }
        if name.len() > FILE_NAME_LEN {
            return Err(FileNameError::TooLong(name.len()));
        }
        if name.as_bytes().contains(&0) {
            return Err(FileNameError::ContainsNul);
        }
        Ok(FileName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `/`-separated component; used as the local output file name.
    pub fn base_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileNameError {
    #[error("file name is empty")]
    Empty,
    #[error("file name is {0} bytes, the wire field holds {max}", max = FILE_NAME_LEN)]
    TooLong(usize),
    #[error("file name contains a NUL byte")]
    ContainsNul,
}

/// All wire message kinds. Every kind has a fixed width (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Announce one shared file.
    Offer { sender: PeerId, file: FileName },
    /// Acknowledge an OFFER or a CHUNK.
    Ack { sender: PeerId },
    /// Ask the receiver to stream a file it shares.
    Request { file: FileName },
    /// One chunk of file data. On encode the payload may be short and is
    /// zero-padded; a decoded payload is always [`CHUNK_SIZE`] bytes.
    Chunk { checksum: u16, payload: Vec<u8> },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Offer { .. } => TAG_OFFER,
            Message::Ack { .. } => TAG_ACK,
            Message::Request { .. } => TAG_REQUEST,
            Message::Chunk { .. } => TAG_CHUNK,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Offer { .. } => "OFFER",
            Message::Ack { .. } => "ACK",
            Message::Request { .. } => "REQUEST",
            Message::Chunk { .. } => "CHUNK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_limits() {
        assert!(FileName::new("notes.txt").is_ok());
        assert!(FileName::new("a".repeat(FILE_NAME_LEN)).is_ok());
        assert_eq!(
            FileName::new("a".repeat(FILE_NAME_LEN + 1)),
            Err(FileNameError::TooLong(FILE_NAME_LEN + 1))
        );
        assert_eq!(FileName::new(""), Err(FileNameError::Empty));
        assert_eq!(FileName::new("a\0b"), Err(FileNameError::ContainsNul));
    }

    #[test]
    fn file_name_width_counts_bytes_not_chars() {
        // 11 three-byte characters = 33 bytes
        assert!(FileName::new("€".repeat(11)).is_err());
        assert!(FileName::new("€".repeat(10)).is_ok());
    }

    #[test]
    fn base_name_strips_directories() {
        let name = FileName::new("docs/2024/notes.txt").unwrap();
        assert_eq!(name.base_name(), "notes.txt");
        let flat = FileName::new("notes.txt").unwrap();
        assert_eq!(flat.base_name(), "notes.txt");
    }

    #[test]
    fn record_widths() {
        assert_eq!(OFFER_LEN, 37);
        assert_eq!(ACK_LEN, 5);
        assert_eq!(REQUEST_LEN, 33);
        assert_eq!(CHUNK_LEN, 1027);
    }
}
