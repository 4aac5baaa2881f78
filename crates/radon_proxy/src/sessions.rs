//! Registry of live client sessions and the transaction each is running.
//!
//! The map sits under a read-write lock; each entry has its own mutex so a
//! `SHOW PROCESSLIST` snapshot never waits on a statement binding. An entry
//! only holds a weak handle to its transaction: the statement path owns it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use radon_backend::{Transaction, TxnState};

use crate::classify::StmtKind;
use crate::session::Session;

/// Bytes of the running statement kept for diagnostics.
pub const QUERY_PREFIX_LEN: usize = 128;

struct Binding {
    txn: Option<Weak<Transaction>>,
    node: Option<StmtKind>,
    query: String,
    last_activity: Instant,
}

impl Binding {
    fn live_txn(&self) -> Option<Arc<Transaction>> {
        self.txn
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|t| t.state() != TxnState::Finished)
    }
}

struct Entry {
    session: Arc<dyn Session>,
    created: Instant,
    binding: Mutex<Binding>,
}

/// One row of `SHOW PROCESSLIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: u32,
    pub user: String,
    pub host: String,
    pub db: String,
    pub command: &'static str,
    pub time: Duration,
    /// Time since the last statement was bound or finished.
    pub idle: Duration,
    pub node: Option<StmtKind>,
    pub info: String,
    pub txn_id: Option<u64>,
    pub multi_stmt: bool,
}

fn prefix(query: &str) -> String {
    if query.len() <= QUERY_PREFIX_LEN {
        return query.to_string();
    }
    let mut end = QUERY_PREFIX_LEN;
    while !query.is_char_boundary(end) {
        end -= 1;
    }
    query[..end].to_string()
}

/// Abort the bound transaction if the running statement allows it.
fn abort_bound(id: u32, binding: &Binding) {
    let Some(txn) = binding.live_txn() else {
        return;
    };
    let abortable = txn.is_multi_stmt_txn() || binding.node.is_some_and(StmtKind::is_abortable);
    if !abortable {
        tracing::debug!(session_id = id, txn_id = txn.id(), node = ?binding.node, "write in flight, left to finish");
        return;
    }
    if let Err(e) = txn.abort() {
        tracing::warn!(session_id = id, txn_id = txn.id(), error = %e, "abort on session teardown failed");
    }
}

#[derive(Default)]
pub struct Sessions {
    entries: RwLock<HashMap<u32, Arc<Entry>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: u32) -> Option<Arc<Entry>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn add(&self, session: Arc<dyn Session>) {
        let id = session.id();
        let entry = Arc::new(Entry {
            session,
            created: Instant::now(),
            binding: Mutex::new(Binding {
                txn: None,
                node: None,
                query: String::new(),
                last_activity: Instant::now(),
            }),
        });
        let count = {
            let mut entries = self.entries.write();
            entries.insert(id, entry);
            entries.len()
        };
        radon_observability::record_active_sessions(count);
        tracing::debug!(session_id = id, "session added");
    }

    /// Client disconnect.
    pub fn remove(&self, id: u32) {
        let (entry, count) = {
            let mut entries = self.entries.write();
            let entry = entries.remove(&id);
            (entry, entries.len())
        };
        let Some(entry) = entry else {
            return;
        };
        radon_observability::record_active_sessions(count);
        abort_bound(id, &entry.binding.lock());
        tracing::debug!(session_id = id, "session removed");
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Connection cap check at accept time.
    pub fn reaches(&self, max: usize) -> bool {
        self.count() >= max
    }

    /// A statement of `session` starts running under `txn`.
    pub fn txn_binding(&self, id: u32, txn: &Arc<Transaction>, node: StmtKind, query: &str) {
        if let Some(entry) = self.entry(id) {
            let mut b = entry.binding.lock();
            b.txn = Some(Arc::downgrade(txn));
            b.node = Some(node);
            b.query = prefix(query);
            b.last_activity = Instant::now();
        }
    }

    /// The statement finished and its transaction is gone.
    pub fn txn_unbinding(&self, id: u32) {
        if let Some(entry) = self.entry(id) {
            let mut b = entry.binding.lock();
            b.txn = None;
            b.node = None;
            b.query.clear();
            b.last_activity = Instant::now();
        }
    }

    /// A statement inside a client transaction finished; the transaction
    /// stays bound until `is_end`.
    pub fn multi_stmt_txn_unbinding(&self, id: u32, is_end: bool) {
        if let Some(entry) = self.entry(id) {
            let mut b = entry.binding.lock();
            b.node = None;
            b.query.clear();
            if is_end {
                b.txn = None;
            }
            b.last_activity = Instant::now();
        }
    }

    /// Remove the session, drop its connection and abort its transaction
    /// when the running statement allows it.
    pub fn kill(&self, id: u32, reason: &str) -> bool {
        let (entry, count) = {
            let mut entries = self.entries.write();
            let entry = entries.remove(&id);
            (entry, entries.len())
        };
        let Some(entry) = entry else {
            return false;
        };
        radon_observability::record_active_sessions(count);
        tracing::warn!(session_id = id, reason, "session killed");
        let b = entry.binding.lock();
        entry.session.close();
        abort_bound(id, &b);
        true
    }

    /// `KILL QUERY`: abort the running statement, keep the session.
    pub fn kill_query(&self, id: u32) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        abort_bound(id, &entry.binding.lock());
        true
    }

    pub fn session(&self, id: u32) -> Option<Arc<dyn Session>> {
        self.entry(id).map(|e| Arc::clone(&e.session))
    }

    /// Every session, sorted by id.
    pub fn snapshot(&self) -> Vec<SessionStatus> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<SessionStatus> {
        let entries: Vec<Arc<Entry>> = self.entries.read().values().cloned().collect();
        let mut out: Vec<SessionStatus> = entries
            .iter()
            .map(|e| {
                let b = e.binding.lock();
                let txn = b.live_txn();
                SessionStatus {
                    id: e.session.id(),
                    user: e.session.user(),
                    host: e.session.addr(),
                    db: e.session.schema(),
                    command: if b.node.is_some() { "Query" } else { "Sleep" },
                    time: now.saturating_duration_since(e.created),
                    idle: now.saturating_duration_since(b.last_activity),
                    node: b.node,
                    info: b.query.clone(),
                    txn_id: txn.as_ref().map(|t| t.id()),
                    multi_stmt: txn.as_ref().is_some_and(|t| t.is_multi_stmt_txn()),
                }
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Graceful shutdown: close every session not inside a client
    /// transaction or an in-flight write, rescanning once a second until
    /// none is left.
    pub fn close(&self) {
        self.close_every(Duration::from_secs(1));
    }

    pub(crate) fn close_every(&self, interval: Duration) {
        loop {
            let entries: Vec<(u32, Arc<Entry>)> =
                self.entries.read().iter().map(|(id, e)| (*id, Arc::clone(e))).collect();
            if entries.is_empty() {
                return;
            }
            let mut busy = 0usize;
            for (id, entry) in entries {
                let b = entry.binding.lock();
                let pinned = b
                    .live_txn()
                    .is_some_and(|t| t.is_multi_stmt_txn() || !b.node.is_some_and(StmtKind::is_abortable));
                if pinned {
                    busy += 1;
                    continue;
                }
                entry.session.close();
                abort_bound(id, &b);
                drop(b);
                self.entries.write().remove(&id);
            }
            radon_observability::record_active_sessions(self.count());
            if busy == 0 {
                return;
            }
            tracing::info!(sessions = busy, "waiting for sessions in transaction to finish");
            std::thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LocalSession;
    use radon_backend::fakedb::FakeDb;
    use radon_backend::Scatter;
    use radon_common::config::BackendConfig;

    fn scatter(dir: &tempfile::TempDir) -> Arc<Scatter> {
        let scatter = Scatter::new(Arc::new(FakeDb::new()), dir.path());
        scatter.add(BackendConfig::new("b0", "127.0.0.1:3306")).unwrap();
        scatter
    }

    fn local() -> Arc<LocalSession> {
        Arc::new(LocalSession::new("root", "127.0.0.1:5000"))
    }

    #[test]
    fn test_add_remove_reaches() {
        let ss = Sessions::new();
        let a = local();
        let b = local();
        ss.add(a.clone());
        assert!(!ss.reaches(2));
        ss.add(b.clone());
        assert!(ss.reaches(2));
        ss.remove(a.id());
        assert!(!ss.contains(a.id()));
        assert_eq!(ss.count(), 1);
        ss.remove(a.id());
        assert_eq!(ss.count(), 1);
    }

    #[test]
    fn test_binding_truncates_query() {
        let dir = tempfile::tempdir().unwrap();
        let scatter = scatter(&dir);
        let ss = Sessions::new();
        let s = local();
        ss.add(s.clone());
        let txn = scatter.create_transaction().unwrap();
        let long = format!("SELECT '{}'", "é".repeat(200));
        ss.txn_binding(s.id(), &txn, StmtKind::Select, &long);
        let snap = ss.snapshot();
        assert_eq!(snap[0].command, "Query");
        assert!(snap[0].info.len() <= QUERY_PREFIX_LEN);
        assert!(long.starts_with(&snap[0].info));
        assert_eq!(snap[0].txn_id, Some(txn.id()));

        ss.txn_unbinding(s.id());
        let snap = ss.snapshot();
        assert_eq!(snap[0].command, "Sleep");
        assert_eq!(snap[0].txn_id, None);
        txn.finish();
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let ss = Sessions::new();
        let sessions: Vec<_> = (0..5).map(|_| local()).collect();
        for s in sessions.iter().rev() {
            ss.add(s.clone());
        }
        let ids: Vec<u32> = ss.snapshot().iter().map(|s| s.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_kill_aborts_select_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let scatter = scatter(&dir);
        let ss = Sessions::new();
        let s = local();
        ss.add(s.clone());
        let txn = scatter.create_transaction().unwrap();
        ss.txn_binding(s.id(), &txn, StmtKind::Select, "SELECT 1");
        assert!(ss.kill(s.id(), "test"));
        assert!(s.is_closed());
        assert!(txn.is_aborted());
        assert_eq!(txn.state(), TxnState::Finished);
        assert!(ss.snapshot().iter().all(|st| st.id != s.id()));
        assert!(!ss.kill(s.id(), "again"));
    }

    #[test]
    fn test_remove_leaves_write_running() {
        let dir = tempfile::tempdir().unwrap();
        let scatter = scatter(&dir);
        let ss = Sessions::new();
        let s = local();
        ss.add(s.clone());
        let txn = scatter.create_transaction().unwrap();
        ss.txn_binding(s.id(), &txn, StmtKind::Insert, "INSERT INTO t VALUES (1)");
        ss.remove(s.id());
        assert!(!txn.is_aborted());
        txn.finish();
    }

    #[test]
    fn test_multi_stmt_binding_survives_statements() {
        let dir = tempfile::tempdir().unwrap();
        let scatter = scatter(&dir);
        let ss = Sessions::new();
        let s = local();
        ss.add(s.clone());
        let txn = scatter.create_transaction().unwrap();
        txn.set_multi_stmt_txn();
        ss.txn_binding(s.id(), &txn, StmtKind::Insert, "INSERT INTO t VALUES (1)");
        ss.multi_stmt_txn_unbinding(s.id(), false);
        let snap = ss.snapshot();
        assert_eq!(snap[0].node, None);
        assert!(snap[0].multi_stmt);
        ss.multi_stmt_txn_unbinding(s.id(), true);
        assert_eq!(ss.snapshot()[0].txn_id, None);
        txn.finish();
    }

    #[test]
    fn test_close_waits_for_client_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let scatter = scatter(&dir);
        let ss = Arc::new(Sessions::new());
        let idle = local();
        let busy = local();
        ss.add(idle.clone());
        ss.add(busy.clone());
        let txn = scatter.create_transaction().unwrap();
        txn.set_multi_stmt_txn();
        ss.txn_binding(busy.id(), &txn, StmtKind::Begin, "BEGIN");

        let closer = {
            let ss = Arc::clone(&ss);
            std::thread::spawn(move || ss.close_every(Duration::from_millis(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(idle.is_closed());
        assert!(!busy.is_closed());
        txn.finish();
        closer.join().unwrap();
        assert!(busy.is_closed());
        assert_eq!(ss.count(), 0);
    }
}
