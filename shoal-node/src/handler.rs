//! Inbound connections: accept loop and the per-connection message loop.
//!
//! Per connection: IDLE -> (OFFER) -> ACK sent -> IDLE, or IDLE -> (REQUEST)
//! -> streaming CHUNK/ACK pairs -> IDLE, until the peer closes or sends
//! something undecodable.

use std::net::SocketAddr;
use std::sync::Arc;

use shoal_core::chunk;
use shoal_core::protocol::CHUNK_SIZE;
use shoal_core::{FileName, Message, PeerId, Upsert};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::node::NodeState;
use crate::transport::{self, RecordError};
use crate::{discovery, files, session};

/// Failure serving one REQUEST.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("{0} is not shared here")]
    NotShared(FileName),
    #[error("cannot read {file}: {source}")]
    LocalIo {
        file: FileName,
        source: std::io::Error,
    },
    #[error("chunk not acknowledged: peer sent {0}")]
    NotAcknowledged(&'static str),
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl ServeError {
    /// Local failures end the stream but keep the connection usable.
    fn is_local(&self) -> bool {
        matches!(self, ServeError::NotShared(_) | ServeError::LocalIo { .. })
    }
}

/// Accept connections until `stop` is raised; one task per connection, no
/// admission limit. Dropping the listener on exit closes the socket.
pub async fn accept_loop(
    listener: TcpListener,
    state: Arc<NodeState>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, from)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, from, state).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            },
            _ = stop.changed() => {}
        }
        if *stop.borrow() || stop.has_changed().is_err() {
            break;
        }
    }
    debug!("accept loop stopped");
}

/// Run the message loop for one connection. Never panics or propagates:
/// every failure ends only this connection.
pub async fn handle_connection<S>(mut stream: S, from: SocketAddr, state: Arc<NodeState>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first_contact: Option<PeerId> = None;
    loop {
        let msg = match transport::read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(RecordError::Closed) => break,
            Err(e) => {
                warn!(%from, error = %e, "closing connection");
                break;
            }
        };
        match msg {
            Message::Offer { sender, file } => {
                debug!(%from, peer = %sender, file = %file, "offer");
                let upsert = state.registry.lock().await.upsert(sender, None, Some(file));
                if let Upsert::New(index) = upsert {
                    info!(peer = %sender, index, "new peer announced itself");
                    first_contact = Some(sender);
                }
                let ack = Message::Ack {
                    sender: state.self_id,
                };
                if let Err(e) = transport::write_message(&mut stream, &ack).await {
                    warn!(%from, error = %e, "cannot acknowledge offer");
                    break;
                }
            }
            Message::Request { file } => match serve_file(&mut stream, &state, &file).await {
                Ok(chunks) => info!(%from, file = %file, chunks, "file sent"),
                Err(e) if e.is_local() => warn!(%from, error = %e, "request failed"),
                Err(e) => {
                    warn!(%from, file = %file, error = %e, "stream aborted");
                    break;
                }
            },
            other => debug!(%from, kind = other.kind(), "ignoring unsolicited record"),
        }
    }
    drop(stream);

    if let Some(peer) = first_contact {
        reciprocate(&state, peer).await;
    }
}

/// First contact from an unknown peer: learn its address, then gossip back.
async fn reciprocate(state: &NodeState, peer: PeerId) {
    if let Err(e) = discovery::refresh(state).await {
        warn!(peer = %peer, error = %e, "discovery refresh failed");
    }
    let addr = state
        .registry
        .lock()
        .await
        .get(&peer)
        .and_then(|r| r.address.clone());
    match addr {
        Some(addr) => {
            if let Err(e) = session::push_file_list(state, peer, &addr).await {
                warn!(peer = %peer, error = %e, "reciprocal gossip failed");
            }
        }
        None => warn!(peer = %peer, "address still unknown, not gossiping back"),
    }
}

/// Stream one shared file as CHUNK records, one in flight, each acknowledged
/// before the next. Returns the number of chunks sent.
async fn serve_file<S>(stream: &mut S, state: &NodeState, file: &FileName) -> Result<u64, ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local_io = |source| ServeError::LocalIo {
        file: file.clone(),
        source,
    };
    let path = files::locate(&state.config.shared_dir, file)
        .await
        .ok_or_else(|| ServeError::NotShared(file.clone()))?;
    let meta = tokio::fs::metadata(&path).await.map_err(local_io)?;
    let mut source = tokio::fs::File::open(&path).await.map_err(local_io)?;
    debug!(file = %file, chunks = chunk::chunk_count(meta.len()), "streaming");

    let limit = state.config.ack_timeout();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = fill(&mut source, &mut buf).await.map_err(local_io)?;
        if n == 0 {
            break;
        }
        transport::write_message(stream, &chunk::chunk_message(&buf[..n])).await?;
        match transport::read_message_timeout(stream, limit).await? {
            Message::Ack { .. } => sent += 1,
            other => return Err(ServeError::NotAcknowledged(other.kind())),
        }
        if n < CHUNK_SIZE {
            break;
        }
    }
    Ok(sent)
}

/// Read until `buf` is full or the file ends, so only the last chunk is short.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use shoal_core::protocol::CHUNK_SIZE;
    use shoal_core::{derive_peer_id, PeerAddr};
    use std::path::Path;
    use tokio::io::DuplexStream;

    fn state(shared: &Path) -> Arc<NodeState> {
        let config = Config {
            shared_dir: shared.to_path_buf(),
            // nothing listens on port 1: reciprocal discovery fails fast
            rendezvous: "127.0.0.1:1".to_string(),
            rendezvous_timeout_ms: 200,
            connect_timeout_ms: 200,
            ack_timeout_ms: 500,
            ..Config::default()
        };
        Arc::new(NodeState::new(config, PeerAddr::new("127.0.0.1", 7000)))
    }

    fn serve(state: &Arc<NodeState>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(8192);
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        tokio::spawn(handle_connection(server, from, state.clone()));
        client
    }

    fn name(s: &str) -> FileName {
        FileName::new(s).unwrap()
    }

    #[tokio::test]
    async fn offer_is_recorded_and_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);
        let sender = derive_peer_id("127.0.0.1", 7001);

        for file in ["a.txt", "b.txt", "a.txt"] {
            let offer = Message::Offer {
                sender,
                file: name(file),
            };
            transport::write_message(&mut client, &offer).await.unwrap();
            let reply = transport::read_message(&mut client).await.unwrap();
            assert_eq!(
                reply,
                Message::Ack {
                    sender: state.self_id
                }
            );
        }
        let registry = state.registry.lock().await;
        let record = registry.get(&sender).unwrap();
        assert_eq!(record.display_index, 0);
        assert_eq!(record.files.len(), 2);
        assert!(record.address.is_none());
    }

    #[tokio::test]
    async fn request_streams_acknowledged_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 100).map(|i| (i % 251) as u8 + 1).collect();
        std::fs::write(dir.path().join("data.bin"), &data).unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);

        let request = Message::Request {
            file: name("data.bin"),
        };
        transport::write_message(&mut client, &request).await.unwrap();
        let ack = Message::Ack {
            sender: derive_peer_id("127.0.0.1", 7001),
        };
        let mut received = Vec::new();
        for expected_len in [CHUNK_SIZE, CHUNK_SIZE, 100] {
            match transport::read_message(&mut client).await.unwrap() {
                Message::Chunk { checksum, payload } => {
                    assert!(shoal_core::integrity::verify_chunk(&payload, checksum));
                    received.extend_from_slice(&payload[..expected_len]);
                }
                other => panic!("expected Chunk, got {:?}", other),
            }
            transport::write_message(&mut client, &ack).await.unwrap();
        }
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn missing_file_sends_nothing_and_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);

        for file in ["missing.txt", "../escape.txt"] {
            let request = Message::Request { file: name(file) };
            transport::write_message(&mut client, &request).await.unwrap();
        }
        // the connection is still in IDLE: an offer is acknowledged, no chunk came first
        let offer = Message::Offer {
            sender: derive_peer_id("127.0.0.1", 7001),
            file: name("x.txt"),
        };
        transport::write_message(&mut client, &offer).await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await.unwrap(),
            Message::Ack { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directory_outside_share_is_not_served() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"top secret").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);

        let request = Message::Request {
            file: name("link/secret.txt"),
        };
        transport::write_message(&mut client, &request).await.unwrap();
        let offer = Message::Offer {
            sender: derive_peer_id("127.0.0.1", 7001),
            file: name("x.txt"),
        };
        transport::write_message(&mut client, &offer).await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await.unwrap(),
            Message::Ack { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_record_closes_connection() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);
        client.write_all(b"Zgarbage").await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await,
            Err(RecordError::Closed)
        ));
    }

    #[tokio::test]
    async fn unacknowledged_chunk_aborts_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![1u8; CHUNK_SIZE * 3]).unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);

        let request = Message::Request {
            file: name("big.bin"),
        };
        transport::write_message(&mut client, &request).await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await.unwrap(),
            Message::Chunk { .. }
        ));
        // answer the chunk with a request instead of an ACK
        transport::write_message(&mut client, &request).await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await,
            Err(RecordError::Closed)
        ));
    }

    #[tokio::test]
    async fn silent_client_times_out_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![1u8; CHUNK_SIZE * 3]).unwrap();
        let state = state(dir.path());
        let mut client = serve(&state);

        let request = Message::Request {
            file: name("big.bin"),
        };
        transport::write_message(&mut client, &request).await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await.unwrap(),
            Message::Chunk { .. }
        ));
        // no ACK: the server gives up after ack_timeout_ms and closes
        let started = tokio::time::Instant::now();
        let next = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            transport::read_message(&mut client),
        )
        .await
        .unwrap();
        assert!(matches!(next, Err(RecordError::Closed)));
        assert!(started.elapsed() >= std::time::Duration::from_millis(400));
    }

    #[tokio::test]
    async fn unresolved_new_peer_gets_no_reciprocal_gossip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let state = state(dir.path());
        let peer_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer_listener.local_addr().unwrap().port();
        let sender = derive_peer_id("127.0.0.1", peer_port);

        let (mut client, server) = tokio::io::duplex(8192);
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let conn = tokio::spawn(handle_connection(server, from, state.clone()));
        let offer = Message::Offer {
            sender,
            file: name("b.txt"),
        };
        transport::write_message(&mut client, &offer).await.unwrap();
        assert!(matches!(
            transport::read_message(&mut client).await.unwrap(),
            Message::Ack { .. }
        ));
        drop(client);
        // rendezvous is down: the refresh fails and reciprocation is skipped
        tokio::time::timeout(std::time::Duration::from_secs(5), conn)
            .await
            .unwrap()
            .unwrap();

        let registry = state.registry.lock().await;
        let record = registry.get(&sender).unwrap();
        assert!(record.address.is_none());
        drop(registry);
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(300),
            peer_listener.accept()
        )
        .await
        .is_err());
    }
}
