//! Configuration system for skein.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SKEIN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/skein/config.toml
//!   3. ~/.config/skein/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_PMTU, DEFAULT_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    pub router: RouterConfig,
    pub pmtu: PmtuConfig,
    pub connection_maker: ConnectionMakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Interface frames are captured on and injected into.
    pub interface: String,
    /// Our peer name. Empty = derive from the interface MAC.
    pub name: String,
    /// Mesh password. Empty = no encryption.
    pub password: String,
    /// TCP and UDP port.
    pub port: u16,
    /// Max simultaneous connections.
    pub conn_limit: usize,
    /// Capture socket receive buffer, in MiB.
    pub buf_size_mb: usize,
    /// Peers to connect to at startup, `host` or `host:port`.
    pub peers: Vec<String>,
    /// Also connect to peers learned from topology gossip.
    pub peer_discovery: bool,
    pub mac_max_age_secs: u64,
    /// Log a status dump this often. 0 = only on SIGUSR1.
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmtuConfig {
    pub default_pmtu: usize,
    /// Bytes to shrink by when verification fails or the kernel reports
    /// no path MTU.
    pub decrement: usize,
    pub verify_timeout_ms: u64,
    pub verify_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionMakerConfig {
    pub initial_interval_ms: u64,
    pub max_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            interface: "ethwe".to_string(),
            name: String::new(),
            password: String::new(),
            port: DEFAULT_PORT,
            conn_limit: 30,
            buf_size_mb: 8,
            peers: Vec::new(),
            peer_discovery: true,
            mac_max_age_secs: 600,
            status_interval_secs: 0,
        }
    }
}

impl Default for PmtuConfig {
    fn default() -> Self {
        Self {
            default_pmtu: DEFAULT_PMTU,
            decrement: 8,
            verify_timeout_ms: 10,
            verify_attempts: 8,
        }
    }
}

impl Default for ConnectionMakerConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2000,
            max_interval_secs: 600,
        }
    }
}

impl RouterConfig {
    pub fn mac_max_age(&self) -> Duration {
        Duration::from_secs(self.mac_max_age_secs)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

impl PmtuConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

impl ConnectionMakerConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("skein")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SkeinConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SkeinConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SKEIN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SkeinConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply `SKEIN_<SECTION>__<KEY>` overrides looked up through `var`.
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn flag(v: &str) -> bool {
            v == "true" || v == "1"
        }

        let r = &mut self.router;
        if let Some(v) = var("SKEIN_ROUTER__INTERFACE") {
            r.interface = v;
        }
        if let Some(v) = var("SKEIN_ROUTER__NAME") {
            r.name = v;
        }
        if let Some(v) = var("SKEIN_ROUTER__PASSWORD") {
            r.password = v;
        }
        if let Some(p) = var("SKEIN_ROUTER__PORT").and_then(|v| v.parse().ok()) {
            r.port = p;
        }
        if let Some(n) = var("SKEIN_ROUTER__CONN_LIMIT").and_then(|v| v.parse().ok()) {
            r.conn_limit = n;
        }
        if let Some(n) = var("SKEIN_ROUTER__BUF_SIZE_MB").and_then(|v| v.parse().ok()) {
            r.buf_size_mb = n;
        }
        if let Some(v) = var("SKEIN_ROUTER__PEERS") {
            r.peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("SKEIN_ROUTER__PEER_DISCOVERY") {
            r.peer_discovery = flag(&v);
        }
        if let Some(n) = var("SKEIN_ROUTER__MAC_MAX_AGE_SECS").and_then(|v| v.parse().ok()) {
            r.mac_max_age_secs = n;
        }
        if let Some(n) = var("SKEIN_ROUTER__STATUS_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            r.status_interval_secs = n;
        }

        let p = &mut self.pmtu;
        if let Some(n) = var("SKEIN_PMTU__DEFAULT_PMTU").and_then(|v| v.parse().ok()) {
            p.default_pmtu = n;
        }
        if let Some(n) = var("SKEIN_PMTU__DECREMENT").and_then(|v| v.parse().ok()) {
            p.decrement = n;
        }
        if let Some(n) = var("SKEIN_PMTU__VERIFY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            p.verify_timeout_ms = n;
        }
        if let Some(n) = var("SKEIN_PMTU__VERIFY_ATTEMPTS").and_then(|v| v.parse().ok()) {
            p.verify_attempts = n;
        }

        let cm = &mut self.connection_maker;
        if let Some(n) = var("SKEIN_CONNECTION_MAKER__INITIAL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            cm.initial_interval_ms = n;
        }
        if let Some(n) = var("SKEIN_CONNECTION_MAKER__MAX_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            cm.max_interval_secs = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = SkeinConfig::default();
        assert_eq!(config.router.port, 6783);
        assert_eq!(config.router.conn_limit, 30);
        assert!(config.router.peer_discovery);
        assert!(config.router.status_interval().is_none());
        assert_eq!(config.pmtu.default_pmtu, 65535);
        assert_eq!(config.pmtu.decrement, 8);
        assert_eq!(config.connection_maker.initial_interval(), Duration::from_secs(2));
        assert_eq!(config.connection_maker.max_interval(), Duration::from_secs(600));
    }

    #[test]
    fn overrides_apply_per_key() {
        let env: HashMap<&str, &str> = [
            ("SKEIN_ROUTER__PASSWORD", "s3cret"),
            ("SKEIN_ROUTER__PEERS", "10.0.0.1, 10.0.0.2:7000,,"),
            ("SKEIN_ROUTER__PEER_DISCOVERY", "false"),
            ("SKEIN_ROUTER__PORT", "not-a-port"),
            ("SKEIN_PMTU__DECREMENT", "16"),
            ("SKEIN_CONNECTION_MAKER__MAX_INTERVAL_SECS", "60"),
        ]
        .into_iter()
        .collect();

        let mut config = SkeinConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.router.password, "s3cret");
        assert_eq!(config.router.peers, vec!["10.0.0.1", "10.0.0.2:7000"]);
        assert!(!config.router.peer_discovery);
        // Unparseable values leave the default in place.
        assert_eq!(config.router.port, 6783);
        assert_eq!(config.pmtu.decrement, 16);
        assert_eq!(config.connection_maker.max_interval_secs, 60);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let text = r#"
            [router]
            interface = "eth1"
            peers = ["192.168.1.10"]

            [pmtu]
            verify_attempts = 3
        "#;
        let config: SkeinConfig = toml::from_str(text).unwrap();
        assert_eq!(config.router.interface, "eth1");
        assert_eq!(config.router.peers, vec!["192.168.1.10"]);
        assert_eq!(config.router.conn_limit, 30);
        assert_eq!(config.pmtu.verify_attempts, 3);
        assert_eq!(config.pmtu.decrement, 8);
        assert_eq!(config.connection_maker, ConnectionMakerConfig::default());
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("skein-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("SKEIN_CONFIG", config_path.to_str().unwrap());
        }

        let path = SkeinConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let text = std::fs::read_to_string(&path).unwrap();
        let config: SkeinConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, SkeinConfig::default());

        unsafe {
            std::env::remove_var("SKEIN_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
