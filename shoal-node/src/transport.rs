//! Record transport: read and write single fixed-width records on a TCP stream.

use std::time::Duration;

use shoal_core::wire::{self, DecodeError, EncodeError};
use shoal_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Failure reading or writing one record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// Peer closed the connection cleanly between records.
    #[error("connection closed")]
    Closed,
    #[error("connection closed mid-record")]
    Truncated,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed record: {0}")]
    Decode(#[from] DecodeError),
    #[error("cannot encode record: {0}")]
    Encode(#[from] EncodeError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordError {
    /// Connection-level failures (as opposed to protocol errors).
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RecordError::Truncated | RecordError::Timeout(_) | RecordError::Io(_)
        )
    }
}

/// Read exactly one record: the tag byte selects how many more bytes to read.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, RecordError> {
    let mut tag = [0u8; 1];
    if reader.read(&mut tag).await? == 0 {
        return Err(RecordError::Closed);
    }
    let len = wire::record_len(tag[0]).ok_or(DecodeError::UnknownTag(tag[0]))?;
    let mut record = vec![0u8; len];
    record[0] = tag[0];
    match reader.read_exact(&mut record[1..]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RecordError::Truncated)
        }
        Err(e) => return Err(e.into()),
    }
    Ok(wire::decode(&record)?)
}

/// Like [`read_message`], bounded by `limit`.
pub async fn read_message_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<Message, RecordError> {
    tokio::time::timeout(limit, read_message(reader))
        .await
        .map_err(|_| RecordError::Timeout(limit))?
}

/// Encode and send one record.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), RecordError> {
    let bytes = wire::encode(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Open a TCP connection, bounded by `limit`.
pub async fn connect(addr: &str, limit: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )),
    }
}
