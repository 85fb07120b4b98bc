//! Rendezvous service: peers register `{host, port}` and get back every registration so far.
//! In-memory only; no dedup, no eviction.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::discovery::Registration;

/// Largest registration request accepted.
const MAX_REQUEST_LEN: usize = 1024;

pub struct Rendezvous {
    listener: TcpListener,
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl Rendezvous {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registrations: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `stop` flips to true (or its sender is dropped).
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> std::io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "rendezvous listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, from) = accepted?;
                    let registrations = self.registrations.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, from, registrations).await {
                            warn!(%from, error = %e, "rendezvous client failed");
                        }
                    });
                }
                _ = stop.changed() => {}
            }
            if *stop.borrow() || stop.has_changed().is_err() {
                break;
            }
        }
        info!("rendezvous stopped");
        Ok(())
    }
}

async fn handle_client(
    mut stream: TcpStream,
    from: SocketAddr,
    registrations: Arc<Mutex<Vec<Registration>>>,
) -> std::io::Result<()> {
    let reply = match read_registration(&mut stream).await? {
        Some(registration) => {
            debug!(%from, host = %registration.host, port = registration.port, "registered");
            let mut all = registrations.lock().await;
            all.push(registration);
            serde_json::to_vec(&*all)?
        }
        None => {
            warn!(%from, "invalid registration");
            serde_json::to_vec(&serde_json::json!({ "error": "Invalid JSON" }))?
        }
    };
    stream.write_all(&reply).await?;
    stream.shutdown().await
}

/// Read until the bytes so far parse as one registration. Clients do not
/// half-close, so the request ends where the JSON object ends.
async fn read_registration(stream: &mut TcpStream) -> std::io::Result<Option<Registration>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        match serde_json::from_slice::<Registration>(&buf) {
            Ok(registration) => return Ok(Some(registration)),
            Err(e) if e.is_eof() && buf.len() < MAX_REQUEST_LEN => continue,
            Err(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery;
    use shoal_core::PeerAddr;
    use std::time::Duration;

    #[tokio::test]
    async fn returns_every_registration_in_order() {
        let server = Rendezvous::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(stop_rx));

        let a = PeerAddr::new("127.0.0.1", 5000);
        let b = PeerAddr::new("127.0.0.1", 5001);
        let limit = Duration::from_secs(2);
        assert_eq!(discovery::query(&addr, &a, limit).await.unwrap(), vec![a.clone()]);
        assert_eq!(
            discovery::query(&addr, &b, limit).await.unwrap(),
            vec![a.clone(), b.clone()]
        );
        // no dedup
        assert_eq!(discovery::query(&addr, &a, limit).await.unwrap().len(), 3);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_gets_error_object() {
        let server = Rendezvous::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.run(stop_rx));

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"not json").await.unwrap();
        let mut reply = String::new();
        s.read_to_string(&mut reply).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["error"], "Invalid JSON");
    }
}
