//! Configuration for driftmail

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,

    /// IMAP client-facing configuration
    #[serde(default)]
    pub imap: ImapConfig,

    /// On-disk storage roots
    #[serde(default)]
    pub storage: StorageConfig,

    /// Replica synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Authentication configuration (distributor tier)
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker nodes reachable from the distributor, by name
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,

    /// Peer replicas this node synchronizes with, by name
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Replica name; stamps every outbound update and keys vector clocks
    pub name: String,
}

/// IMAP client-facing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Bind address of the distributor listener
    #[serde(default = "default_imap_bind")]
    pub bind: String,

    /// Free-text part of the `* OK IMAP4rev1` greeting
    #[serde(default = "default_greeting")]
    pub greeting: String,

    /// Session inactivity timeout in minutes
    #[serde(default = "default_imap_timeout")]
    pub timeout_minutes: i64,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            bind: default_imap_bind(),
            greeting: default_greeting(),
            timeout_minutes: default_imap_timeout(),
        }
    }
}

fn default_imap_bind() -> String {
    "0.0.0.0:1143".to_string()
}

fn default_greeting() -> String {
    "driftmail ready.".to_string()
}

fn default_imap_timeout() -> i64 {
    30
}

/// On-disk storage roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-user Maildir tree
    #[serde(default = "default_maildir_root")]
    pub maildir_root: PathBuf,

    /// Root of the per-user CRDT log tree
    #[serde(default = "default_crdt_root")]
    pub crdt_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            maildir_root: default_maildir_root(),
            crdt_root: default_crdt_root(),
        }
    }
}

fn default_maildir_root() -> PathBuf {
    PathBuf::from("/var/lib/driftmail/maildir")
}

fn default_crdt_root() -> PathBuf {
    PathBuf::from("/var/lib/driftmail/crdt")
}

/// Replica synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bind address of the update receiver
    #[serde(default = "default_sync_bind")]
    pub bind: String,

    /// Directory holding the outbound log, vector clock and ack cursors
    #[serde(default = "default_sync_state_dir")]
    pub state_dir: PathBuf,

    /// Peer dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-frame send/receive timeout in seconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Initial retry backoff in milliseconds
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_cap")]
    pub retry_cap_ms: u64,

    /// Upper bound of the random jitter added to each backoff, in milliseconds
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,

    /// Undelivered outbound-log entries tolerated before local mutations
    /// start to block
    #[serde(default = "default_outbound_backlog")]
    pub outbound_backlog_max: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind: default_sync_bind(),
            state_dir: default_sync_state_dir(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            retry_base_ms: default_retry_base(),
            retry_cap_ms: default_retry_cap(),
            retry_jitter_ms: default_retry_jitter(),
            outbound_backlog_max: default_outbound_backlog(),
        }
    }
}

fn default_sync_bind() -> String {
    "0.0.0.0:2000".to_string()
}

fn default_sync_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/driftmail/sync")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    30
}

fn default_retry_base() -> u64 {
    250
}

fn default_retry_cap() -> u64 {
    30_000
}

fn default_retry_jitter() -> u64 {
    500
}

fn default_outbound_backlog() -> usize {
    4096
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path to the plain user file
    #[serde(default = "default_auth_file")]
    pub file: PathBuf,

    /// Separator between user name and password in the user file
    #[serde(default = "default_auth_separator")]
    pub separator: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            file: default_auth_file(),
            separator: default_auth_separator(),
        }
    }
}

fn default_auth_file() -> PathBuf {
    PathBuf::from("users.txt")
}

fn default_auth_separator() -> String {
    ";".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A worker node as seen from the distributor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Session-port address the distributor proxies to
    pub address: String,
}

/// A peer replica as seen from a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Sync-port address update messages are shipped to
    pub address: String,
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sections() {
        let sync = SyncConfig::default();
        assert_eq!(sync.retry_base_ms, 250);
        assert_eq!(sync.outbound_backlog_max, 4096);

        let imap = ImapConfig::default();
        assert_eq!(imap.bind, "0.0.0.0:1143");
        assert_eq!(imap.timeout_minutes, 30);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
name = "worker-1"

[imap]
bind = "127.0.0.1:1143"
greeting = "mail.example.com driftmail"

[storage]
maildir_root = "/data/maildir"
crdt_root = "/data/crdt"

[sync]
bind = "127.0.0.1:2000"
retry_base_ms = 100

[workers.worker-1]
address = "10.0.0.2:1143"

[peers.worker-2]
address = "10.0.0.3:2000"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.node.name, "worker-1");
        assert_eq!(config.imap.greeting, "mail.example.com driftmail");
        assert_eq!(config.sync.retry_base_ms, 100);
        assert_eq!(config.sync.retry_cap_ms, 30_000);
        assert_eq!(config.peers["worker-2"].address, "10.0.0.3:2000");
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[node]\nname = \"solo\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node.name, "solo");
        assert!(config.peers.is_empty());
    }
}
