//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanchat_core::chunk::DEFAULT_CHUNK_SIZE;
use lanchat_core::discovery::{DEFAULT_DISCOVERY_PORT, DEFAULT_DISCOVERY_WINDOW};

use crate::transport::DEFAULT_HANDSHAKE_TIMEOUT;

/// Default TCP port for the session protocol.
pub const DEFAULT_SESSION_PORT: u16 = 9999;

/// Client configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_DISPLAY_NAME, LANCHAT_DISCOVERY_PORT, LANCHAT_SESSION_PORT,
/// LANCHAT_DISCOVERY_TIMEOUT_SECS, LANCHAT_CHUNK_SIZE, LANCHAT_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to peers (default: $USER).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery UDP port (default 8888).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 9999).
    #[serde(default = "default_session_port")]
    pub session_port: u16,
    /// Where discovery requests are sent (default 255.255.255.255).
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,
    /// Discovery collection window in seconds (default 5).
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    /// Seconds an accepted connection has to send its invite (default 10).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Transfer chunk size in bytes (default 8192).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Where completed receptions are moved (default ~/Downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Where incoming blobs are written while streaming (default $TMPDIR/lanchat).
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

fn default_display_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "lanchat".to_string())
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_session_port() -> u16 {
    DEFAULT_SESSION_PORT
}
fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}
fn default_discovery_timeout_secs() -> u64 {
    DEFAULT_DISCOVERY_WINDOW.as_secs()
}
fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join("Downloads"))
        .unwrap_or_else(std::env::temp_dir)
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("lanchat")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            session_port: default_session_port(),
            broadcast_address: default_broadcast_address(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            chunk_size: default_chunk_size(),
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl Config {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `LANCHAT_*` overrides. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LANCHAT_DISPLAY_NAME") {
        if !s.trim().is_empty() {
            c.display_name = s;
        }
    }
    if let Some(p) = var("LANCHAT_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("LANCHAT_SESSION_PORT").and_then(|s| s.parse().ok()) {
        c.session_port = p;
    }
    if let Some(t) = var("LANCHAT_DISCOVERY_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
        c.discovery_timeout_secs = t;
    }
    if let Some(n) = var("LANCHAT_CHUNK_SIZE").and_then(|s| s.parse::<usize>().ok()) {
        if n > 0 {
            c.chunk_size = n;
        }
    }
    if let Some(d) = var("LANCHAT_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(d);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

/// First existing file wins; a file that fails to parse is logged and defaults are used.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let p = paths.iter().find(|p| p.exists())?;
    match read_config(p) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %p.display(), "ignoring config file: {}", e);
            None
        }
    }
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}
