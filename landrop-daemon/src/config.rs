//! Load config from file and environment.
//!
//! File: `~/.config/landrop/config.toml` (first found wins over
//! `/etc/landrop/config.toml`). Env overrides: `LANDROP_TCP_PORT`,
//! `LANDROP_UDP_PORT`, `LANDROP_DOWNLOAD_DIR`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Daemon configuration. Every timeout is stored as whole seconds in the
/// file; code reads them through the `Duration` accessors.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session TCP port (default 9527).
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Discovery UDP port (default 9528).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Transfer chunk size in bytes (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Per-chunk acknowledgement deadline (default 60 s).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: u64,
    /// Resend attempts per chunk before the session fails (default 3).
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Heartbeat send interval (default 10 s).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Silence window before a session is declared dead (default 30 s).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Delay between reconnect attempts (default 5 s).
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// Direct reconnect attempts before falling back to discovery
    /// (default 5).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Dirty-progress write-back interval (default 5 s).
    #[serde(default = "default_state_sync_interval")]
    pub state_sync_interval: u64,
    /// Completed chunks between progress write-backs (default 50).
    #[serde(default = "default_chunks_per_sync")]
    pub chunks_per_sync: u32,
    /// Where received files land; state lives under
    /// `<download_dir>/.lan_share/`.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_tcp_port() -> u16 {
    9527
}
fn default_udp_port() -> u16 {
    9528
}
fn default_chunk_size() -> u32 {
    landrop_core::DEFAULT_CHUNK_SIZE
}
fn default_ack_timeout() -> u64 {
    60
}
fn default_max_retry() -> u32 {
    3
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_state_sync_interval() -> u64 {
    5
}
fn default_chunks_per_sync() -> u32 {
    50
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads"),
        None => PathBuf::from("."),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            chunk_size: default_chunk_size(),
            ack_timeout: default_ack_timeout(),
            max_retry: default_max_retry(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            state_sync_interval: default_state_sync_interval(),
            chunks_per_sync: default_chunks_per_sync(),
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }
    pub fn state_sync_interval(&self) -> Duration {
        Duration::from_secs(self.state_sync_interval)
    }
    /// Maximum frame length for this chunk size.
    pub fn max_frame_len(&self) -> usize {
        landrop_core::wire::max_frame_len(self.chunk_size)
    }
}

/// Targeted-discovery wait; not a config knob.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-attempt TCP connect deadline; not a config knob.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("LANDROP_TCP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.tcp_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANDROP_UDP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.udp_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANDROP_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/landrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/landrop/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
