//! Registry of backend shards and factory of transactions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use radon_common::config::{BackendConfig, BackendRole, BackendsConfig};
use radon_common::{RadonError, RadonResult};

use crate::connection::Connector;
use crate::pool::{Pool, PoolStats};
use crate::stats::{QueryRates, TxnCounters};
use crate::txn::Transaction;

pub const BACKEND_FILE: &str = "backend.json";

/// One shard: its primary pool and an optional replica pool.
pub struct Backend {
    config: BackendConfig,
    primary: Arc<Pool>,
    replica: Option<Arc<Pool>>,
}

impl Backend {
    pub fn new(config: BackendConfig, connector: Arc<dyn Connector>) -> Self {
        let primary = Pool::new(config.clone(), config.address.clone(), Arc::clone(&connector));
        let replica = (!config.replica.is_empty())
            .then(|| Pool::new(config.clone(), config.replica.clone(), connector));
        Self {
            config,
            primary,
            replica,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The pool reads should use: the replica when asked and available.
    pub fn pool(&self, on_replica: bool) -> &Arc<Pool> {
        match (&self.replica, on_replica) {
            (Some(r), true) => r,
            _ => &self.primary,
        }
    }

    pub fn primary(&self) -> &Arc<Pool> {
        &self.primary
    }

    pub fn replica(&self) -> Option<&Arc<Pool>> {
        self.replica.as_ref()
    }

    fn close(&self) {
        self.primary.close();
        if let Some(r) = &self.replica {
            r.close();
        }
    }

    fn kill_active(&self) {
        for pool in std::iter::once(&self.primary).chain(self.replica.iter()) {
            for id in pool.active_ids() {
                if let Err(e) = pool.kill(id) {
                    tracing::warn!(backend = %self.config.name, conn_id = id, error = %e, "kill during backend removal failed");
                }
            }
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        std::iter::once(&self.primary)
            .chain(self.replica.iter())
            .all(|p| p.wait_idle(timeout))
    }
}

pub struct Scatter {
    connector: Arc<dyn Connector>,
    meta_dir: PathBuf,
    backends: RwLock<BTreeMap<String, Arc<Backend>>>,
    backup: RwLock<Option<Arc<Backend>>>,
    next_txn_id: AtomicU64,
    rates: Arc<QueryRates>,
    counters: Arc<TxnCounters>,
}

impl Scatter {
    pub fn new(connector: Arc<dyn Connector>, meta_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            meta_dir: meta_dir.into(),
            backends: RwLock::new(BTreeMap::new()),
            backup: RwLock::new(None),
            next_txn_id: AtomicU64::new(0),
            rates: Arc::new(QueryRates::new()),
            counters: Arc::new(TxnCounters::default()),
        })
    }

    pub fn backend_file(&self) -> PathBuf {
        self.meta_dir.join(BACKEND_FILE)
    }

    /// Register the backends listed in `backend.json`, if the file exists.
    pub fn load_config(&self) -> RadonResult<()> {
        let path = self.backend_file();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no backend file yet, starting with an empty scatter");
            return Ok(());
        }
        let conf: BackendsConfig = serde_json::from_slice(&std::fs::read(&path)?)?;
        for b in conf.backends.into_iter().chain(conf.backup) {
            self.add_locked(b)?;
        }
        Ok(())
    }

    fn add_locked(&self, config: BackendConfig) -> RadonResult<()> {
        let backend = Arc::new(Backend::new(config.clone(), Arc::clone(&self.connector)));
        match config.role {
            BackendRole::Backup => {
                let mut backup = self.backup.write();
                if backup.is_some() {
                    return Err(RadonError::Config(format!("backup backend already exists, cannot add[{}]", config.name)));
                }
                *backup = Some(backend);
            }
            BackendRole::Normal => {
                let mut map = self.backends.write();
                if map.contains_key(&config.name) {
                    return Err(RadonError::Config(format!("backend[{}] already exists", config.name)));
                }
                map.insert(config.name.clone(), backend);
            }
        }
        tracing::info!(backend = %config.name, address = %config.address, role = ?config.role, "scatter: backend added");
        Ok(())
    }

    /// Register a backend and persist the topology.
    pub fn add(&self, config: BackendConfig) -> RadonResult<()> {
        self.add_locked(config)?;
        self.flush_config()
    }

    /// Unregister a backend and persist the topology.
    ///
    /// Waits until no transaction holds one of its connections; with `force`
    /// the held connections are killed first.
    pub fn remove(&self, name: &str, force: bool) -> RadonResult<()> {
        let removed = {
            let mut map = self.backends.write();
            match map.remove(name) {
                Some(b) => Some(b),
                None => {
                    let mut backup = self.backup.write();
                    let is_backup = backup.as_ref().map_or(false, |b| b.name() == name);
                    if is_backup {
                        backup.take()
                    } else {
                        None
                    }
                }
            }
        };
        let backend = removed.ok_or_else(|| RadonError::Config(format!("backend[{name}] does not exist")))?;
        if force {
            backend.kill_active();
        }
        while !backend.wait_idle(Duration::from_secs(1)) {
            tracing::info!(backend = %name, "scatter: waiting for in-flight transactions before removal");
        }
        backend.close();
        tracing::info!(backend = %name, "scatter: backend removed");
        self.flush_config()
    }

    /// Persist the topology to `backend.json` through a temp file and rename.
    pub fn flush_config(&self) -> RadonResult<()> {
        let conf = BackendsConfig {
            backends: self.backend_configs_clone(),
            backup: self.backup.read().as_ref().map(|b| b.config().clone()),
        };
        write_atomic(&self.meta_dir, BACKEND_FILE, &serde_json::to_vec_pretty(&conf)?)
    }

    /// Names of the normal backends, sorted.
    pub fn backends(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }

    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.read().get(name).cloned()
    }

    pub fn backend_configs_clone(&self) -> Vec<BackendConfig> {
        self.backends.read().values().map(|b| b.config().clone()).collect()
    }

    pub fn has_backup(&self) -> bool {
        self.backup.read().is_some()
    }

    pub fn query_rates(&self) -> &Arc<QueryRates> {
        &self.rates
    }

    pub fn txn_counters(&self) -> &Arc<TxnCounters> {
        &self.counters
    }

    /// Per-backend primary pool statistics.
    pub fn pool_clone(&self) -> BTreeMap<String, PoolStats> {
        self.backends
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.primary().stats()))
            .collect()
    }

    fn next_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A transaction over every normal backend.
    pub fn create_transaction(&self) -> RadonResult<Arc<Transaction>> {
        let backends = self.backends.read().clone();
        if backends.is_empty() {
            return Err(RadonError::Internal("scatter.create.transaction: backends is empty".into()));
        }
        Ok(Transaction::new(
            self.next_id(),
            backends,
            Arc::clone(&self.counters),
            Arc::clone(&self.rates),
        ))
    }

    /// A transaction pinned to the backup backend.
    pub fn create_backup_transaction(&self) -> RadonResult<Arc<Transaction>> {
        let backup = self
            .backup
            .read()
            .clone()
            .ok_or_else(|| RadonError::Internal("scatter.create.backup.transaction: backup is none".into()))?;
        let mut backends = BTreeMap::new();
        backends.insert(backup.name().to_string(), backup);
        Ok(Transaction::new(
            self.next_id(),
            backends,
            Arc::clone(&self.counters),
            Arc::clone(&self.rates),
        ))
    }

    pub fn close(&self) {
        for b in self.backends.read().values() {
            b.close();
        }
        if let Some(b) = self.backup.read().as_ref() {
            b.close();
        }
    }
}

/// Write `name` inside `dir` via a temp file and an atomic rename.
pub fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> RadonResult<()> {
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{name}.tmp"));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, dir.join(name))?;
    Ok(())
}
