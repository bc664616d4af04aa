//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shoal_core::{DownloadConfig, PeerId};

/// Node configuration. File: ~/.config/shoal/config.toml or /etc/shoal/config.toml.
/// Env overrides: SHOAL_LISTEN_PORT, SHOAL_DATA_DIR, SHOAL_SHARE_DIR, SHOAL_PEERS
/// (comma separated), SHOAL_UPLOAD_RATE_BPS, SHOAL_LOG_LEVEL, SHOAL_FETCH (comma separated).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport TCP port (default 47600).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Identity key, partial-file indexes and finished downloads.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Files offered to other peers; the file name is the resource key.
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Addresses to dial at startup (`host:port`).
    #[serde(default)]
    pub peers: Vec<String>,
    /// Hex peer ids.
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
    #[serde(default = "default_upload_slots")]
    pub upload_slots: usize,
    /// Upload bandwidth cap in bytes per second; 0 means unlimited.
    #[serde(default)]
    pub upload_rate_bps: u64,
    #[serde(default = "default_downloads_per_peer")]
    pub downloads_per_peer: usize,
    #[serde(default = "default_request_len")]
    pub request_len: u64,
    #[serde(default = "default_chunk_len")]
    pub chunk_len: u64,
    #[serde(default = "default_conversation_timeout_ms")]
    pub conversation_timeout_ms: u64,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Resource keys to download once peers announce them.
    #[serde(default)]
    pub fetch: Vec<String>,
}

fn default_listen_port() -> u16 {
    47600
}
fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/shoal"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/shoal"))
}
fn default_share_dir() -> PathBuf {
    default_data_dir().join("share")
}
fn default_upload_slots() -> usize {
    shoal_core::upload::DEFAULT_SLOTS_PER_PEER
}
fn default_downloads_per_peer() -> usize {
    2
}
fn default_request_len() -> u64 {
    1024 * 1024
}
fn default_chunk_len() -> u64 {
    shoal_core::transfer::DEFAULT_CHUNK_LEN
}
fn default_conversation_timeout_ms() -> u64 {
    30_000
}
fn default_max_channels() -> usize {
    shoal_core::conversation::DEFAULT_MAX_CHANNELS
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
            share_dir: default_share_dir(),
            peers: Vec::new(),
            favorites: Vec::new(),
            blocked: Vec::new(),
            upload_slots: default_upload_slots(),
            upload_rate_bps: 0,
            downloads_per_peer: default_downloads_per_peer(),
            request_len: default_request_len(),
            chunk_len: default_chunk_len(),
            conversation_timeout_ms: default_conversation_timeout_ms(),
            max_channels: default_max_channels(),
            log_level: default_log_level(),
            fetch: Vec::new(),
        }
    }
}

impl Config {
    pub fn conversation_timeout(&self) -> Duration {
        Duration::from_millis(self.conversation_timeout_ms)
    }

    pub fn download(&self) -> DownloadConfig {
        DownloadConfig {
            request_len: self.request_len,
            max_requests_per_peer: self.downloads_per_peer,
            ..DownloadConfig::default()
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("partial")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Parsed `favorites`; malformed entries are logged and skipped.
    pub fn favorite_ids(&self) -> Vec<PeerId> {
        parse_ids("favorites", &self.favorites)
    }

    pub fn blocked_ids(&self) -> Vec<PeerId> {
        parse_ids("blocked", &self.blocked)
    }
}

fn parse_ids(field: &str, raw: &[String]) -> Vec<PeerId> {
    raw.iter()
        .filter_map(|s| match s.parse::<PeerId>() {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(field, value = %s, error = %e, "ignoring malformed peer id");
                None
            }
        })
        .collect()
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("SHOAL_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(d) = var("SHOAL_DATA_DIR") {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(d) = var("SHOAL_SHARE_DIR") {
        c.share_dir = PathBuf::from(d);
    }
    if let Some(s) = var("SHOAL_PEERS") {
        c.peers = split_list(&s);
    }
    if let Some(r) = var("SHOAL_UPLOAD_RATE_BPS").and_then(|s| s.parse::<u64>().ok()) {
        c.upload_rate_bps = r;
    }
    if let Some(l) = var("SHOAL_LOG_LEVEL") {
        c.log_level = l;
    }
    if let Some(s) = var("SHOAL_FETCH") {
        c.fetch = split_list(&s);
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
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

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            return load_path(&p);
        }
    }
    None
}

/// Parse one config file. A file that cannot be read or parsed is reported
/// and treated as absent.
pub fn load_path(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("shoal: cannot read {}: {e}", path.display());
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("shoal: invalid config {}: {e}", path.display());
            None
        }
    }
}
