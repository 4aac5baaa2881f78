use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RadonError, RadonResult};

/// Top-level proxy configuration (`radon.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadonConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl RadonConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> RadonResult<Self> {
        toml::from_str(text).map_err(|e| RadonError::Config(e.to_string()))
    }

    /// Load from disk, falling back to defaults when the file is missing or
    /// malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match Self::from_toml(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bad config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
        }
    }
}

/// Policy knobs consumed by the query path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Hard cap on concurrent client sessions.
    pub max_connections: usize,
    /// Per-statement result-bytes cap.
    pub max_result_size: usize,
    /// Cross-shard join row cap.
    pub max_join_rows: usize,
    /// DDL transaction timeout in milliseconds (0 = no limit).
    pub ddl_timeout_ms: u64,
    /// Query transaction timeout in milliseconds (0 = no limit).
    pub query_timeout_ms: u64,
    /// Use XA two-phase commit for multi-shard writes and explicit transactions.
    pub twopc_enable: bool,
    /// Treat `SET autocommit=0` as an implicit `BEGIN`.
    pub autocommit_false_is_txn: bool,
    /// Default read steering: 0 primaries, 1 replicas.
    pub load_balance: u8,
    /// Stream-fetch buffer in bytes.
    pub stream_buffer_size: usize,
    /// Seconds before an idle transaction is reaped (0 = disabled).
    pub idle_txn_timeout_secs: u64,
    /// Allowed client source IPs (empty = allow all).
    pub ips: Vec<String>,
    /// Directory holding `backend.json`.
    pub meta_dir: String,
    /// Age in seconds beyond which the XA sweeper acts on a prepared branch.
    pub xa_recover_horizon_secs: u64,
    /// Workers for the merge-join cartesian step.
    pub join_workers: usize,
    /// Row ceiling for the hash block nested-loop join.
    pub bn_join_row_limit: usize,
    /// Directory probed by the disk watchdog.
    pub disk_check_dir: String,
    /// Disk usage percentage at which writes are refused.
    pub disk_highwater_percent: f64,
    /// Start in read-only mode.
    pub read_only: bool,
    /// Prometheus exporter listen address; empty disables it.
    pub metrics_addr: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_result_size: 1024 * 1024 * 1024,
            max_join_rows: 32768,
            ddl_timeout_ms: 10 * 3600 * 1000,
            query_timeout_ms: 5 * 60 * 1000,
            twopc_enable: true,
            autocommit_false_is_txn: false,
            load_balance: 0,
            stream_buffer_size: 32 * 1024 * 1024,
            idle_txn_timeout_secs: 60,
            ips: Vec::new(),
            meta_dir: "./radon-meta".into(),
            xa_recover_horizon_secs: 3600,
            join_workers: 4,
            bn_join_row_limit: 1024,
            disk_check_dir: ".".into(),
            disk_highwater_percent: 90.0,
            read_only: false,
            metrics_addr: String::new(),
        }
    }
}

/// Hash layout of newly created partitioned tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Total hash slots per table.
    pub slots: usize,
    /// Slots per physical sub-table.
    pub blocks: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slots: 4096,
            blocks: 128,
        }
    }
}

impl RouterConfig {
    pub fn partitions(&self) -> usize {
        (self.slots / self.blocks.max(1)).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,radon=debug".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    #[default]
    Normal,
    Backup,
}

/// One backend shard as persisted in `backend.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// `host:port` of the primary.
    pub address: String,
    /// `host:port` of a read replica; empty when absent.
    #[serde(default)]
    pub replica: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default = "default_backend_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub role: BackendRole,
}

fn default_charset() -> String {
    "utf8mb4".into()
}

fn default_backend_max_connections() -> usize {
    1024
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            replica: String::new(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            charset: default_charset(),
            max_connections: default_backend_max_connections(),
            role: BackendRole::Normal,
        }
    }
}

/// Shape of `backend.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub backup: Option<BackendConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.max_connections, 1024);
        assert!(cfg.twopc_enable);
        assert_eq!(cfg.xa_recover_horizon_secs, 3600);
        assert_eq!(RouterConfig::default().partitions(), 32);
    }

    #[test]
    fn test_partial_toml() {
        let cfg = RadonConfig::from_toml(
            r#"
            [proxy]
            idle_txn_timeout_secs = 0
            load_balance = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.proxy.idle_txn_timeout_secs, 0);
        assert_eq!(cfg.proxy.load_balance, 1);
        assert_eq!(cfg.proxy.max_join_rows, 32768);
        assert_eq!(cfg.router.slots, 4096);
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RadonConfig::load_or_default(&dir.path().join("nope.toml"));
        assert_eq!(cfg.proxy.query_timeout_ms, 300_000);
    }

    #[test]
    fn test_backend_json_defaults() {
        let cfg: BackendsConfig =
            serde_json::from_str(r#"{"backends":[{"name":"b0","address":"127.0.0.1:3306"}]}"#)
                .unwrap();
        assert_eq!(cfg.backends[0].max_connections, 1024);
        assert_eq!(cfg.backends[0].role, BackendRole::Normal);
        assert!(cfg.backup.is_none());
    }
}
