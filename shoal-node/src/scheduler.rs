//! Periodic gossip: re-announce the local file list to every known peer.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::node::NodeState;
use crate::session;

/// Every gossip interval, start one independent push per peer with a known
/// address. Failed pushes remove their peer; nothing is retried before the
/// next round. A peer removed concurrently may still get one wasted push.
pub async fn run_gossip(state: Arc<NodeState>, mut stop: watch::Receiver<bool>) {
    let interval = state.config.gossip_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => {}
        }
        if *stop.borrow() || stop.has_changed().is_err() {
            break;
        }
        let targets = state.registry.lock().await.addresses();
        debug!(peers = targets.len(), "gossip round");
        for (peer, addr) in targets {
            let state = state.clone();
            tokio::spawn(async move {
                let _ = session::push_file_list(&state, peer, &addr).await;
            });
        }
    }
    debug!("gossip scheduler stopped");
}
