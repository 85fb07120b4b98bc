//! Rendezvous discovery: register this node, fetch every known endpoint, merge into the registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shoal_core::PeerAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::node::NodeState;
use crate::transport;

/// Largest rendezvous reply accepted.
const MAX_REPLY_LEN: u64 = 1024 * 1024;

/// One registered endpoint, as exchanged with the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub host: String,
    pub port: u16,
}

impl From<&PeerAddr> for Registration {
    fn from(addr: &PeerAddr) -> Self {
        Self {
            host: addr.host.clone(),
            port: addr.port,
        }
    }
}

impl From<Registration> for PeerAddr {
    fn from(r: Registration) -> Self {
        PeerAddr::new(r.host, r.port)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply {
    Peers(Vec<Registration>),
    Error { error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("cannot reach rendezvous service at {addr}: {source}")]
    Unreachable {
        addr: String,
        source: std::io::Error,
    },
    #[error("rendezvous exchange failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendezvous service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed rendezvous reply: {0}")]
    Reply(#[from] serde_json::Error),
    #[error("rendezvous service rejected registration: {0}")]
    Rejected(String),
}

/// Register `me` with the rendezvous service and return the full endpoint list.
pub async fn query(
    rendezvous: &str,
    me: &PeerAddr,
    limit: Duration,
) -> Result<Vec<PeerAddr>, DiscoveryError> {
    let mut stream = transport::connect(rendezvous, limit)
        .await
        .map_err(|source| DiscoveryError::Unreachable {
            addr: rendezvous.to_string(),
            source,
        })?;
    let request = serde_json::to_vec(&Registration::from(me))?;
    let exchange = async {
        stream.write_all(&request).await?;
        stream.flush().await?;
        let mut reply = Vec::new();
        (&mut stream).take(MAX_REPLY_LEN).read_to_end(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };
    let reply = tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| DiscoveryError::Timeout(limit))??;
    match serde_json::from_slice::<Reply>(&reply)? {
        Reply::Peers(peers) => Ok(peers.into_iter().map(PeerAddr::from).collect()),
        Reply::Error { error } => Err(DiscoveryError::Rejected(error)),
    }
}

/// Refresh the registry from the rendezvous service. On failure the registry
/// is left untouched. Returns the number of newly seen peers.
pub async fn refresh(state: &NodeState) -> Result<usize, DiscoveryError> {
    let config = &state.config;
    let entries = query(&config.rendezvous, &state.self_addr, config.rendezvous_timeout()).await?;
    debug!(entries = entries.len(), "rendezvous listing");
    let (added, total) = {
        let mut registry = state.registry.lock().await;
        let added = registry.merge_discovered(&state.self_addr, entries);
        (added, registry.len())
    };
    if added > 0 {
        info!(added, total, "discovered new peers");
    }
    Ok(added)
}
