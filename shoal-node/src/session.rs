//! Outbound sessions: gossip push of the local file list, and file download.
//!
//! Both are stop-and-wait: one OFFER or CHUNK in flight per connection.

use std::path::{Path, PathBuf};

use shoal_core::chunk::{ChunkError, Reassembler};
use shoal_core::{FileName, Message, PeerAddr, PeerId};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::files;
use crate::node::NodeState;
use crate::transport::{self, RecordError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: PeerAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("expected {expected}, peer sent {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error(transparent)]
    Integrity(#[from] ChunkError),
    #[error("local I/O failure: {0}")]
    LocalIo(#[from] std::io::Error),
    #[error("peer sent no data for {0}")]
    NothingReceived(FileName),
    #[error("refusing to write {0} to the download directory")]
    InvalidOutputName(FileName),
}

impl SessionError {
    /// Connection-level failures mean the peer is gone: drop it from the registry.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            SessionError::Connect { .. } => true,
            // mid-session, a clean close means the peer hung up on us
            SessionError::Record(e) => {
                e.is_connection_failure() || matches!(e, RecordError::Closed)
            }
            _ => false,
        }
    }
}

/// How a download stream ended. The protocol has no end-of-stream marker, so
/// a peer that stalls looks exactly like a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEnd {
    /// Sender closed the connection.
    Closed,
    /// No record within the idle timeout.
    IdleTimeout,
}

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: u64,
    pub end: TransferEnd,
}

async fn open(state: &NodeState, addr: &PeerAddr) -> Result<TcpStream, SessionError> {
    transport::connect(&addr.to_string(), state.config.connect_timeout())
        .await
        .map_err(|source| SessionError::Connect {
            addr: addr.clone(),
            source,
        })
}

async fn forget_on_failure<T>(
    state: &NodeState,
    target: PeerId,
    result: Result<T, SessionError>,
) -> Result<T, SessionError> {
    if let Err(e) = &result {
        if e.is_connection_failure() && state.registry.lock().await.remove(&target).is_some() {
            warn!(peer = %target, error = %e, "peer unreachable, removed");
        }
    }
    result
}

/// Push every shared file to `target` as OFFER records, waiting for an ACK
/// after each. Returns the number of files acknowledged.
pub async fn push_file_list(
    state: &NodeState,
    target: PeerId,
    addr: &PeerAddr,
) -> Result<usize, SessionError> {
    let files = files::list_shared(&state.config.shared_dir).await?;
    let result = forget_on_failure(state, target, push_files(state, addr, &files).await).await;
    match &result {
        Ok(n) => debug!(peer = %target, files = n, "gossip pushed"),
        Err(e) => debug!(peer = %target, error = %e, "gossip push failed"),
    }
    result
}

async fn push_files(
    state: &NodeState,
    addr: &PeerAddr,
    files: &[FileName],
) -> Result<usize, SessionError> {
    let mut stream = open(state, addr).await?;
    let limit = state.config.ack_timeout();
    for file in files {
        let offer = Message::Offer {
            sender: state.self_id,
            file: file.clone(),
        };
        transport::write_message(&mut stream, &offer).await?;
        match transport::read_message_timeout(&mut stream, limit).await {
            Ok(Message::Ack { .. }) => {}
            Ok(other) => {
                warn!(peer = %addr, file = %file, got = other.kind(), "offer not acknowledged");
                return Err(SessionError::Unexpected {
                    expected: "ACK",
                    got: other.kind(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(files.len())
}

/// Download `file` from the peer at `addr` into the configured download directory.
///
/// The output file is created on the first chunk, so a peer that sends
/// nothing leaves nothing behind. Any failure after that deletes the
/// partial output.
pub async fn download(
    state: &NodeState,
    target: PeerId,
    addr: &PeerAddr,
    file: &FileName,
) -> Result<Download, SessionError> {
    let base = file.base_name();
    if base.is_empty() || base == "." || base == ".." {
        return Err(SessionError::InvalidOutputName(file.clone()));
    }
    let mut output = Output::new(state.config.download_dir.join(base));
    let result = pull(state, addr, file, &mut output).await;
    if result.is_err() {
        output.discard().await;
    }
    let result = forget_on_failure(state, target, result).await;
    match &result {
        Ok(d) => info!(
            peer = %target,
            file = %file,
            bytes = d.bytes,
            chunks = d.chunks,
            end = ?d.end,
            "download finished"
        ),
        Err(e) => warn!(peer = %target, file = %file, error = %e, "download failed"),
    }
    result
}

async fn pull(
    state: &NodeState,
    addr: &PeerAddr,
    file: &FileName,
    output: &mut Output,
) -> Result<Download, SessionError> {
    let mut stream = open(state, addr).await?;
    transport::write_message(&mut stream, &Message::Request { file: file.clone() }).await?;

    let idle = state.config.download_idle_timeout();
    let ack = Message::Ack {
        sender: state.self_id,
    };
    let mut reassembler = Reassembler::new();
    let end = loop {
        let (checksum, payload) = match transport::read_message_timeout(&mut stream, idle).await {
            Ok(Message::Chunk { checksum, payload }) => (checksum, payload),
            Ok(other) => {
                return Err(SessionError::Unexpected {
                    expected: "CHUNK",
                    got: other.kind(),
                })
            }
            Err(RecordError::Closed) => break TransferEnd::Closed,
            Err(RecordError::Timeout(_)) => break TransferEnd::IdleTimeout,
            Err(e) => return Err(e.into()),
        };
        if let Some(ready) = reassembler.accept(checksum, payload)? {
            output.write(&ready).await?;
        }
        transport::write_message(&mut stream, &ack).await?;
    };
    if end == TransferEnd::IdleTimeout {
        debug!(file = %file, ?idle, "no record within idle timeout, treating as end of file");
    }

    let chunks = reassembler.chunks();
    match reassembler.finish() {
        Some(tail) => output.write(&tail).await?,
        None => return Err(SessionError::NothingReceived(file.clone())),
    }
    output.flush().await?;
    Ok(Download {
        path: output.path.clone(),
        bytes: output.bytes,
        chunks,
        end,
    })
}

/// Download target, created lazily on the first write.
struct Output {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    bytes: u64,
}

impl Output {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            bytes: 0,
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            self.file = Some(tokio::fs::File::create(&self.path).await?);
        }
        if let Some(f) = self.file.as_mut() {
            f.write_all(data).await?;
        }
        self.bytes += data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush().await,
            None => Ok(()),
        }
    }

    /// Remove the partial output. Files this session did not create are left alone.
    async fn discard(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        discard(&self.path).await;
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "partial download removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove partial download"),
    }
}
