//! Framing: fixed-width big-endian records, one layout per tag. No length prefix.
//!
//! | kind    | layout                                    |
//! |---------|-------------------------------------------|
//! | OFFER   | 'O', peer id (4), file name (32, padded)  |
//! | ACK     | 'A', peer id (4)                          |
//! | REQUEST | 'R', file name (32, padded)               |
//! | CHUNK   | 'T', checksum (u16), payload (1024, padded) |

use crate::identity::{PeerId, PEER_ID_LEN};
use crate::protocol::{
    FileName, FileNameError, Message, ACK_LEN, CHUNK_LEN, CHUNK_SIZE, FILE_NAME_LEN, OFFER_LEN,
    REQUEST_LEN, TAG_ACK, TAG_CHUNK, TAG_OFFER, TAG_REQUEST,
};

/// Full record width (tag included) for a tag, or `None` if the tag is unknown.
pub fn record_len(tag: u8) -> Option<usize> {
    match tag {
        TAG_OFFER => Some(OFFER_LEN),
        TAG_ACK => Some(ACK_LEN),
        TAG_REQUEST => Some(REQUEST_LEN),
        TAG_CHUNK => Some(CHUNK_LEN),
        _ => None,
    }
}

/// Encode a message into its fixed-width record.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(record_len(msg.tag()).unwrap_or(0));
    out.push(msg.tag());
    match msg {
        Message::Offer { sender, file } => {
            out.extend_from_slice(sender.as_bytes());
            put_file_name(&mut out, file);
        }
        Message::Ack { sender } => out.extend_from_slice(sender.as_bytes()),
        Message::Request { file } => put_file_name(&mut out, file),
        Message::Chunk { checksum, payload } => {
            if payload.len() > CHUNK_SIZE {
                return Err(EncodeError::PayloadTooLarge(payload.len()));
            }
            out.extend_from_slice(&checksum.to_be_bytes());
            out.extend_from_slice(payload);
            out.resize(CHUNK_LEN, 0);
        }
    }
    Ok(out)
}

fn put_file_name(out: &mut Vec<u8>, file: &FileName) {
    let start = out.len();
    out.extend_from_slice(file.as_str().as_bytes());
    out.resize(start + FILE_NAME_LEN, 0);
}

/// Error encoding a message (only chunk payloads can overflow their field).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("chunk payload is {0} bytes, the wire field holds {max}", max = CHUNK_SIZE)]
    PayloadTooLarge(usize),
}

/// Decode exactly one record. `bytes` must be the whole record, tag included.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    let expected = record_len(tag).ok_or(DecodeError::UnknownTag(tag))?;
    if bytes.len() != expected {
        return Err(DecodeError::Length {
            tag,
            expected,
            actual: bytes.len(),
        });
    }
    let msg = match tag {
        TAG_OFFER => Message::Offer {
            sender: peer_id(&body[..PEER_ID_LEN]),
            file: file_name(&body[PEER_ID_LEN..])?,
        },
        TAG_ACK => Message::Ack {
            sender: peer_id(body),
        },
        TAG_REQUEST => Message::Request {
            file: file_name(body)?,
        },
        _ => Message::Chunk {
            checksum: u16::from_be_bytes([body[0], body[1]]),
            payload: body[2..].to_vec(),
        },
    };
    Ok(msg)
}

fn peer_id(bytes: &[u8]) -> PeerId {
    let mut id = [0u8; PEER_ID_LEN];
    id.copy_from_slice(bytes);
    PeerId::from_bytes(id)
}

/// Strip trailing padding and validate the logical name.
fn file_name(field: &[u8]) -> Result<FileName, DecodeError> {
    let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let name = std::str::from_utf8(&field[..end]).map_err(|_| DecodeError::FileNameEncoding)?;
    Ok(FileName::new(name)?)
}

/// Error decoding a record (unknown tag, wrong width, bad file name).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty record")]
    Empty,
    #[error("unknown record tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("record tag 0x{tag:02x} expects {expected} bytes, got {actual}")]
    Length {
        tag: u8,
        expected: usize,
        actual: usize,
    },
    #[error("file name is not valid UTF-8")]
    FileNameEncoding,
    #[error("invalid file name: {0}")]
    FileName(#[from] FileNameError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_peer_id;
    use crate::integrity::checksum;

    fn name(s: &str) -> FileName {
        FileName::new(s).unwrap()
    }

    #[test]
    fn roundtrip_offer() {
        let msg = Message::Offer {
            sender: derive_peer_id("127.0.0.1", 5000),
            file: name("docs/notes.txt"),
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), OFFER_LEN);
        assert_eq!(bytes[0], b'O');
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn roundtrip_ack_and_request() {
        let ack = Message::Ack {
            sender: derive_peer_id("127.0.0.1", 5001),
        };
        assert_eq!(decode(&encode(&ack).unwrap()).unwrap(), ack);

        let req = Message::Request {
            file: name(&"x".repeat(FILE_NAME_LEN)),
        };
        let bytes = encode(&req).unwrap();
        assert_eq!(bytes.len(), REQUEST_LEN);
        assert_eq!(decode(&bytes).unwrap(), req);
    }

    #[test]
    fn short_chunk_is_padded() {
        let payload = b"hello chunk".to_vec();
        let msg = Message::Chunk {
            checksum: checksum(&payload),
            payload: payload.clone(),
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), CHUNK_LEN);
        match decode(&bytes).unwrap() {
            Message::Chunk {
                checksum: c,
                payload: p,
            } => {
                assert_eq!(c, checksum(&payload));
                assert_eq!(p.len(), CHUNK_SIZE);
                assert_eq!(&p[..payload.len()], payload.as_slice());
                assert!(p[payload.len()..].iter().all(|&b| b == 0));
            }
            other => panic!("expected Chunk, got {:?}", other),
        }
    }

    #[test]
    fn checksum_is_big_endian() {
        let msg = Message::Chunk {
            checksum: 0x1234,
            payload: vec![],
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(&bytes[1..3], &[0x12, 0x34]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let msg = Message::Chunk {
            checksum: 0,
            payload: vec![1; CHUNK_SIZE + 1],
        };
        assert_eq!(
            encode(&msg),
            Err(EncodeError::PayloadTooLarge(CHUNK_SIZE + 1))
        );
    }

    #[test]
    fn wrong_length_is_decode_error() {
        let ack = encode(&Message::Ack {
            sender: derive_peer_id("h", 1),
        })
        .unwrap();
        assert!(matches!(
            decode(&ack[..ACK_LEN - 1]),
            Err(DecodeError::Length { expected: 5, actual: 4, .. })
        ));
        let mut long = ack.clone();
        long.push(0);
        assert!(matches!(decode(&long), Err(DecodeError::Length { .. })));
    }

    #[test]
    fn unknown_tag_and_empty() {
        assert_eq!(decode(&[b'Z', 0, 0]), Err(DecodeError::UnknownTag(b'Z')));
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
        assert_eq!(record_len(b'Z'), None);
    }

    #[test]
    fn all_padding_name_is_rejected() {
        let mut bytes = vec![b'R'];
        bytes.resize(REQUEST_LEN, 0);
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::FileName(FileNameError::Empty))
        );
    }

    #[test]
    fn invalid_utf8_name_is_rejected() {
        let mut bytes = vec![b'R', 0xff, 0xfe];
        bytes.resize(REQUEST_LEN, 0);
        assert_eq!(decode(&bytes), Err(DecodeError::FileNameEncoding));
    }
}
