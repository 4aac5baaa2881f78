//! Front of the proxy: everything between a client session and the
//! planner/executor.
//!
//! [`Spanner`] dispatches one client statement (session control, SHOW,
//! admin, DDL, DML); [`Sessions`] tracks who is running what; the
//! [`Manager`] reaps idle transactions and [`DiskCheck`] refuses writes when
//! the disk fills up. [`Proxy`] wires them together.

/// Regex compiled on first use; `None` only for a malformed literal.
macro_rules! static_regex {
    ($pat:expr) => {{
        static RE: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
        RE.get_or_init(|| regex::Regex::new($pat).ok()).as_ref()
    }};
}

/// A possibly qualified, possibly quoted table or database name.
macro_rules! name_re {
    () => {
        r"(?:`[^`]+`|[\w$]+)(?:\s*\.\s*(?:`[^`]+`|[\w$]+))?"
    };
}

pub mod admin;
pub mod classify;
pub mod ddl;
pub mod diskcheck;
pub mod manager;
pub mod policy;
pub mod session;
pub mod sessions;
pub mod show;
pub mod spanner;


use std::path::PathBuf;
use std::sync::Arc;

use radon_backend::Scatter;
use radon_common::config::ProxyConfig;
use radon_common::{RadonError, RadonResult};
use radon_router::Router;

pub use classify::{classify, StmtKind};
pub use diskcheck::DiskCheck;
pub use manager::Manager;
pub use policy::Policy;
pub use session::{LocalSession, Session};
pub use sessions::{SessionStatus, Sessions};
pub use spanner::Spanner;

/// Split `a.b`, `` `a`.`b` `` or `b` into an optional qualifier and a name.
pub fn split_name(raw: &str) -> (Option<String>, String) {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in raw.trim().chars() {
        match c {
            '`' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut cur)),
            c if c.is_whitespace() && !quoted => {}
            c => cur.push(c),
        }
    }
    parts.push(cur);
    match parts.len() {
        1 => (None, parts.remove(0)),
        _ => {
            let name = parts.pop().unwrap_or_default();
            (Some(parts.join(".")), name)
        }
    }
}

pub struct Proxy {
    conf: ProxyConfig,
    spanner: Arc<Spanner>,
    manager: Arc<Manager>,
    disk: Arc<DiskCheck>,
}

impl Proxy {
    pub fn new(conf: ProxyConfig, router: Arc<dyn Router>, scatter: Arc<Scatter>) -> Self {
        let disk_dir = if conf.disk_check_dir.is_empty() {
            PathBuf::from(&conf.meta_dir)
        } else {
            PathBuf::from(&conf.disk_check_dir)
        };
        let disk = DiskCheck::new(disk_dir, conf.disk_highwater_percent);
        let spanner = Spanner::new(conf.clone(), router, scatter, Arc::clone(&disk));
        let manager = Manager::new(Arc::clone(&spanner), conf.idle_txn_timeout_secs);
        Self {
            conf,
            spanner,
            manager,
            disk,
        }
    }

    pub fn spanner(&self) -> &Arc<Spanner> {
        &self.spanner
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn disk(&self) -> &Arc<DiskCheck> {
        &self.disk
    }

    /// Start the background workers.
    pub fn start(&self) {
        self.manager.start();
        self.disk.start();
        tracing::info!(
            max_connections = self.conf.max_connections,
            twopc = self.conf.twopc_enable,
            read_only = self.spanner.policy().read_only(),
            "proxy started"
        );
    }

    /// Close sessions gracefully, then stop the workers and the pools.
    pub fn stop(&self) {
        self.spanner.sessions().close();
        self.manager.stop();
        self.disk.stop();
        self.spanner.scatter().close();
        tracing::info!("proxy stopped");
    }

    /// Accept a client session.
    pub fn session_open(&self, session: Arc<dyn Session>) -> RadonResult<()> {
        if self.spanner.sessions().reaches(self.conf.max_connections) {
            tracing::warn!(addr = %session.addr(), max = self.conf.max_connections, "connection refused: too many connections");
            return Err(RadonError::TooManyConnections);
        }
        self.spanner.sessions().add(session);
        Ok(())
    }

    /// Client disconnect.
    pub fn session_close(&self, id: u32) {
        self.spanner.session_closed(id);
    }
}

#[cfg(test)]
mod name_tests {
    use super::split_name;

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("t"), (None, "t".to_string()));
        assert_eq!(split_name("db.t"), (Some("db".into()), "t".into()));
        assert_eq!(split_name("`db`.`t`"), (Some("db".into()), "t".into()));
        assert_eq!(split_name("`a.b`"), (None, "a.b".into()));
        assert_eq!(split_name(" db . t "), (Some("db".into()), "t".into()));
    }
}
