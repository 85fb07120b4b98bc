//! Node lifecycle: bind, discover, serve, gossip, download, shut down.

use std::net::SocketAddr;
use std::sync::Arc;

use shoal_core::{
    derive_peer_id, FileName, FileNameError, PeerAddr, PeerId, PeerRecord, PeerRegistry,
};
use tokio::net::TcpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::{self, DiscoveryError};
use crate::session::{self, Download, SessionError};
use crate::{handler, scheduler};

const LISTEN_BACKLOG: u32 = 1024;

/// State shared by every task of one node.
pub struct NodeState {
    pub config: Config,
    /// Address registered with the rendezvous service; the source of `self_id`.
    pub self_addr: PeerAddr,
    pub self_id: PeerId,
    /// Single lock around every registry access. Never held across network I/O.
    pub registry: Mutex<PeerRegistry>,
}

impl NodeState {
    pub fn new(config: Config, self_addr: PeerAddr) -> Self {
        let self_id = derive_peer_id(&self_addr.host, self_addr.port);
        Self {
            config,
            self_addr,
            self_id,
            registry: Mutex::new(PeerRegistry::new()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("node already started")]
    AlreadyStarted,
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("unknown peer: {0}")]
    UnknownPeer(u64),
    #[error("peer {0} has no known address yet")]
    Unresolved(u64),
    #[error("peer {index} does not share {file}")]
    NotAdvertised { index: u64, file: String },
    #[error("invalid file name: {0}")]
    FileName(#[from] FileNameError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A running (or ready to run) peer.
pub struct Node {
    state: Arc<NodeState>,
    /// Bound but not yet listening until `start` succeeds.
    socket: Option<TcpSocket>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the socket without listening. With port 0 the node registers the
    /// port the OS picked, so its id matches what other peers derive.
    pub async fn bind(config: Config) -> Result<Self, NodeError> {
        let bind_addr = format!("{}:{}", config.host, config.port);
        let bind_err = |source| NodeError::Bind {
            addr: bind_addr.clone(),
            source,
        };
        let addr = tokio::net::lookup_host(&bind_addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "host resolves to no address",
                ))
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let port = socket.local_addr().map_err(bind_err)?.port();
        let self_addr = PeerAddr::new(config.host.clone(), port);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            state: Arc::new(NodeState::new(config, self_addr)),
            socket: Some(socket),
            stop_tx,
            tasks: Vec::new(),
        })
    }

    pub fn id(&self) -> PeerId {
        self.state.self_id
    }

    pub fn address(&self) -> &PeerAddr {
        &self.state.self_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Discover peers, start serving, push the file list to every known peer
    /// and start periodic gossip. A discovery failure is fatal: nothing is
    /// started and the socket never enters the listening state.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.socket.is_none() {
            return Err(NodeError::AlreadyStarted);
        }
        discovery::refresh(&self.state).await?;
        let known = self.state.registry.lock().await.len();
        info!(id = %self.state.self_id, addr = %self.state.self_addr, peers = known, "joined network");

        let socket = self.socket.take().ok_or(NodeError::AlreadyStarted)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(|source| NodeError::Bind {
            addr: self.state.self_addr.to_string(),
            source,
        })?;
        self.tasks.push(tokio::spawn(handler::accept_loop(
            listener,
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));

        let targets = self.state.registry.lock().await.addresses();
        let pushes: Vec<JoinHandle<()>> = targets
            .into_iter()
            .map(|(peer, addr)| {
                let state = self.state.clone();
                tokio::spawn(async move {
                    if let Err(e) = session::push_file_list(&state, peer, &addr).await {
                        warn!(peer = %peer, error = %e, "initial gossip failed");
                    }
                })
            })
            .collect();
        for push in pushes {
            let _ = push.await;
        }

        self.tasks.push(tokio::spawn(scheduler::run_gossip(
            self.state.clone(),
            self.stop_tx.subscribe(),
        )));
        Ok(())
    }

    /// Snapshot of known peers, ordered by display index.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.state.registry.lock().await.list()
    }

    /// Download `file` from the peer with display index `index`. The peer must
    /// have advertised the file.
    pub async fn download(&self, index: u64, file: &str) -> Result<Download, NodeError> {
        let file = FileName::new(file)?;
        let (peer, addr) = {
            let registry = self.state.registry.lock().await;
            let record = registry.by_index(index).ok_or(NodeError::UnknownPeer(index))?;
            if !record.files.contains(&file) {
                return Err(NodeError::NotAdvertised {
                    index,
                    file: file.to_string(),
                });
            }
            let addr = record.address.clone().ok_or(NodeError::Unresolved(index))?;
            (record.id, addr)
        };
        Ok(session::download(&self.state, peer, &addr, &file).await?)
    }

    /// Raise the stop flag, close the listener and wait for the background loops.
    pub async fn shutdown(mut self) {
        self.stop_tx.send_replace(true);
        self.socket = None;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(id = %self.state.self_id, "node stopped");
    }
}
