//! Shoal peer daemon: rendezvous discovery, file gossip and stop-and-wait
//! transfers on top of `shoal-core`.

pub mod config;
pub mod console;
pub mod discovery;
pub mod files;
pub mod handler;
pub mod node;
pub mod rendezvous;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use config::Config;
pub use node::{Node, NodeError, NodeState};
pub use rendezvous::Rendezvous;
pub use session::{Download, SessionError, TransferEnd};
