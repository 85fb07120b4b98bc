//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Node configuration. File: ~/.config/shoal/config.toml or /etc/shoal/config.toml.
/// Env overrides: SHOAL_HOST, SHOAL_PORT, SHOAL_SHARED_DIR, SHOAL_DOWNLOAD_DIR,
/// SHOAL_RENDEZVOUS, SHOAL_GOSSIP_INTERVAL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host this node listens on and registers with the rendezvous service.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    #[serde(default)]
    pub port: u16,
    /// Directory whose files are advertised and served.
    #[serde(default = "default_dir")]
    pub shared_dir: PathBuf,
    /// Where downloads are written.
    #[serde(default = "default_dir")]
    pub download_dir: PathBuf,
    /// Rendezvous service address.
    #[serde(default = "default_rendezvous")]
    pub rendezvous: String,
    #[serde(default = "default_gossip_interval_secs")]
    pub gossip_interval_secs: u64,
    /// A download ends when no record arrives for this long.
    #[serde(default = "default_download_idle_timeout_ms")]
    pub download_idle_timeout_ms: u64,
    /// Bound on each stop-and-wait ACK wait (gossip and file streaming).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rendezvous_timeout_ms")]
    pub rendezvous_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_rendezvous() -> String {
    "127.0.0.1:12345".to_string()
}
fn default_gossip_interval_secs() -> u64 {
    15
}
fn default_download_idle_timeout_ms() -> u64 {
    2000
}
fn default_ack_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_rendezvous_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            shared_dir: default_dir(),
            download_dir: default_dir(),
            rendezvous: default_rendezvous(),
            gossip_interval_secs: default_gossip_interval_secs(),
            download_idle_timeout_ms: default_download_idle_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
        }
    }
}

impl Config {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_secs)
    }

    pub fn download_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.download_idle_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config {path}: {field} must be greater than zero")]
    Zero { path: PathBuf, field: &'static str },
}

/// Load config: defaults, then config file (explicit path, else first default
/// path that exists), then env vars. CLI flags are applied by the caller.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shoal/config.toml"));
    }
    out.push(PathBuf::from("/etc/shoal/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if c.gossip_interval_secs == 0 {
        return Err(ConfigError::Zero {
            path: path.to_path_buf(),
            field: "gossip_interval_secs",
        });
    }
    Ok(c)
}

/// Apply `SHOAL_*` overrides. Unparsable numeric values and a zero gossip
/// interval are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SHOAL_HOST") {
        c.host = s;
    }
    if let Some(s) = var("SHOAL_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("SHOAL_SHARED_DIR") {
        c.shared_dir = PathBuf::from(s);
    }
    if let Some(s) = var("SHOAL_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(s) = var("SHOAL_RENDEZVOUS") {
        c.rendezvous = s;
    }
    if let Some(s) = var("SHOAL_GOSSIP_INTERVAL_SECS") {
        if let Ok(n @ 1..) = s.parse::<u64>() {
            c.gossip_interval_secs = n;
        }
    }
}
