//! Per-statement and multi-statement transactions.
//!
//! A transaction fans physical fragments out to backends in parallel (one
//! scoped worker per backend, fragments for the same backend run in order on
//! one connection) and merges the answers in fragment order.
//!
//! Once a branch is open (`begin` for auto two-phase writes, `begin_scatter`
//! for client `BEGIN`), every backend touched keeps one connection for the
//! life of the transaction. With XA the commit runs
//! `XA END` → `XA PREPARE` → `XA COMMIT` across all branches, each phase
//! finishing everywhere before the next starts.
//!
//! `abort` kills every connection the transaction holds from a side
//! connection; blocked workers then fail with a lost-connection error.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use radon_common::{QueryResult, QueryTuple, RadonError, RadonResult, ReqMode, RequestContext, TxnMode};

use crate::pool::{Pool, PooledConn};
use crate::scatter::Backend;
use crate::stats::{QueryRates, TxnCounters};
use crate::xa::make_xid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Init,
    Begin,
    Executing,
    Committing,
    RollingBack,
    Finished,
}

/// How a held connection opens its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchMode {
    /// Autocommit: connections are borrowed per statement.
    None,
    /// `XA START` / two-phase commit.
    Xa,
    /// `BEGIN` / `COMMIT` on each backend, no cross-shard atomicity.
    Local,
}

#[derive(Default)]
struct Branches {
    conns: BTreeMap<String, PooledConn>,
    /// Backends whose branch connection is checked out by a worker.
    busy: HashSet<String>,
}

enum Lease {
    Branch(String, PooledConn),
    Statement(PooledConn),
}

impl Lease {
    fn conn(&mut self) -> &mut PooledConn {
        match self {
            Lease::Branch(_, c) | Lease::Statement(c) => c,
        }
    }
}

enum StreamMsg {
    Chunk(QueryResult),
    Done(RadonResult<()>),
}

pub struct Transaction {
    id: u64,
    xid: String,
    backends: BTreeMap<String, Arc<Backend>>,
    counters: Arc<TxnCounters>,
    rates: Arc<QueryRates>,
    state: Mutex<TxnState>,
    branch: Mutex<BranchMode>,
    branches: Mutex<Branches>,
    branch_cond: Condvar,
    inflight: Mutex<Vec<(Arc<Pool>, u32)>>,
    aborted: AtomicBool,
    prepared: AtomicBool,
    finished: AtomicBool,
    multi_stmt: AtomicBool,
    twopc: AtomicBool,
    exec_on_rep: AtomicBool,
    timeout_ms: AtomicU64,
    max_result_size: AtomicUsize,
    max_join_rows: AtomicUsize,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        backends: BTreeMap<String, Arc<Backend>>,
        counters: Arc<TxnCounters>,
        rates: Arc<QueryRates>,
    ) -> Arc<Self> {
        counters.created();
        Arc::new(Self {
            id,
            xid: make_xid(chrono::Local::now(), id),
            backends,
            counters,
            rates,
            state: Mutex::new(TxnState::Init),
            branch: Mutex::new(BranchMode::None),
            branches: Mutex::new(Branches::default()),
            branch_cond: Condvar::new(),
            inflight: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            multi_stmt: AtomicBool::new(false),
            twopc: AtomicBool::new(true),
            exec_on_rep: AtomicBool::new(false),
            timeout_ms: AtomicU64::new(0),
            max_result_size: AtomicUsize::new(usize::MAX),
            max_join_rows: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn xid(&self) -> &str {
        &self.xid
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    fn set_state(&self, s: TxnState) {
        *self.state.lock() = s;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn set_timeout(&self, ms: u64) {
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_max_result(&self, bytes: usize) {
        self.max_result_size.store(if bytes == 0 { usize::MAX } else { bytes }, Ordering::Relaxed);
    }

    pub fn set_max_join_rows(&self, rows: usize) {
        self.max_join_rows.store(if rows == 0 { usize::MAX } else { rows }, Ordering::Relaxed);
    }

    pub fn max_join_rows(&self) -> usize {
        self.max_join_rows.load(Ordering::Relaxed)
    }

    /// Steer reads to replicas.
    pub fn set_is_exec_on_rep(&self, on: bool) {
        self.exec_on_rep.store(on, Ordering::Relaxed);
    }

    pub fn set_twopc(&self, on: bool) {
        self.twopc.store(on, Ordering::Relaxed);
    }

    pub fn set_multi_stmt_txn(&self) {
        self.multi_stmt.store(true, Ordering::SeqCst);
    }

    pub fn is_multi_stmt_txn(&self) -> bool {
        self.multi_stmt.load(Ordering::SeqCst)
    }

    /// Number of backends with an open branch.
    pub fn branch_count(&self) -> usize {
        let b = self.branches.lock();
        b.conns.len() + b.busy.len()
    }

    fn deadline(&self) -> Option<(Instant, u64)> {
        match self.timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some((Instant::now() + Duration::from_millis(ms), ms)),
        }
    }

    fn check_live(&self) -> RadonResult<()> {
        if self.is_aborted() {
            return Err(RadonError::TxnAbort(format!("transaction[{}] was aborted", self.id)));
        }
        Ok(())
    }

    // ── Connection leases ──

    fn backend(&self, name: &str) -> RadonResult<&Arc<Backend>> {
        self.backends
            .get(name)
            .ok_or_else(|| RadonError::Internal(format!("txn.can.not.find.backend[{name}]")))
    }

    fn register(&self, conn: &PooledConn) {
        self.inflight.lock().push((Arc::clone(conn.pool()), conn.id()));
    }

    fn unregister(&self, conn: &PooledConn) {
        let mut inflight = self.inflight.lock();
        if let Some(pos) = inflight
            .iter()
            .position(|(p, id)| *id == conn.id() && Arc::ptr_eq(p, conn.pool()))
        {
            inflight.swap_remove(pos);
        }
    }

    fn acquire(&self, name: &str, txn_mode: TxnMode) -> RadonResult<Lease> {
        self.check_live()?;
        let backend = self.backend(name)?;
        let mode = *self.branch.lock();
        if mode == BranchMode::None {
            let on_rep = txn_mode == TxnMode::Read && self.exec_on_rep.load(Ordering::Relaxed);
            let conn = backend.pool(on_rep).get()?;
            self.register(&conn);
            return Ok(Lease::Statement(conn));
        }

        {
            let mut branches = self.branches.lock();
            loop {
                if let Some(conn) = branches.conns.remove(name) {
                    branches.busy.insert(name.to_string());
                    return Ok(Lease::Branch(name.to_string(), conn));
                }
                if !branches.busy.contains(name) {
                    branches.busy.insert(name.to_string());
                    break;
                }
                self.branch_cond.wait(&mut branches);
            }
        }

        let opened = backend.primary().get().and_then(|mut conn| {
            self.register(&conn);
            let start = match mode {
                BranchMode::Xa => format!("XA START '{}'", self.xid),
                _ => "BEGIN".to_string(),
            };
            match conn.execute(&start) {
                Ok(_) => Ok(conn),
                Err(e) => {
                    self.unregister(&conn);
                    Err(e)
                }
            }
        });
        match opened {
            Ok(conn) => {
                tracing::debug!(txn_id = self.id, backend = name, xid = %self.xid, "branch opened");
                Ok(Lease::Branch(name.to_string(), conn))
            }
            Err(e) => {
                self.branches.lock().busy.remove(name);
                self.branch_cond.notify_all();
                Err(e)
            }
        }
    }

    fn release(&self, lease: Lease) {
        match lease {
            Lease::Statement(conn) => {
                self.unregister(&conn);
            }
            Lease::Branch(name, conn) => {
                let mut branches = self.branches.lock();
                branches.busy.remove(&name);
                if self.is_aborted() {
                    drop(branches);
                    self.unregister(&conn);
                } else {
                    branches.conns.insert(name, conn);
                }
                self.branch_cond.notify_all();
            }
        }
    }

    // ── Execution ──

    fn resolve(&self, req: &RequestContext) -> RadonResult<Vec<QueryTuple>> {
        match req.mode {
            ReqMode::Normal => Ok(req.querys.clone()),
            ReqMode::ScatterRequest => Ok(self
                .backends
                .keys()
                .map(|b| QueryTuple::new(req.raw_query.clone(), b.clone()))
                .collect()),
            ReqMode::SingleRequest => {
                if self.backends.is_empty() {
                    return Err(RadonError::Internal("txn has no backends".into()));
                }
                let live = self
                    .backends
                    .iter()
                    .find(|(_, b)| b.primary().is_alive())
                    .map(|(name, _)| name.clone())
                    .ok_or_else(|| {
                        RadonError::backend(2003, "HY000", "no live backend for a single-backend request")
                    })?;
                Ok(vec![QueryTuple::new(req.raw_query.clone(), live)])
            }
        }
    }

    /// Dispatch the request's fragments in parallel and merge the answers in
    /// fragment order.
    pub fn execute(&self, req: &RequestContext) -> RadonResult<QueryResult> {
        let querys = self.resolve(req)?;
        self.execute_querys(&querys, req.txn_mode)
    }

    /// Run `sql` on the first live backend in name order.
    pub fn execute_single(&self, sql: &str) -> RadonResult<QueryResult> {
        self.execute(&RequestContext::raw(ReqMode::SingleRequest, TxnMode::Write, sql))
    }

    /// Run `sql` on every backend and concatenate the answers.
    pub fn execute_scatter(&self, sql: &str) -> RadonResult<QueryResult> {
        self.execute(&RequestContext::raw(ReqMode::ScatterRequest, TxnMode::Write, sql))
    }

    pub fn execute_on_this_backend(&self, backend: &str, sql: &str) -> RadonResult<QueryResult> {
        self.backend(backend)?;
        self.execute_querys(&[QueryTuple::new(sql, backend)], TxnMode::Write)
    }

    fn group_by_backend(querys: &[QueryTuple]) -> BTreeMap<&str, Vec<(usize, &str)>> {
        let mut groups: BTreeMap<&str, Vec<(usize, &str)>> = BTreeMap::new();
        for (i, q) in querys.iter().enumerate() {
            groups.entry(q.backend.as_str()).or_default().push((i, q.query.as_str()));
        }
        groups
    }

    fn run_backend(&self, name: &str, items: &[(usize, &str)], txn_mode: TxnMode) -> RadonResult<Vec<(usize, QueryResult)>> {
        let mut lease = self.acquire(name, txn_mode)?;
        let max = self.max_result_size.load(Ordering::Relaxed);
        let mut out = Vec::with_capacity(items.len());
        let mut size = 0usize;
        let mut failed = None;
        for (idx, sql) in items {
            if let Err(e) = self.check_live() {
                failed = Some(e);
                break;
            }
            tracing::trace!(txn_id = self.id, backend = name, sql, "dispatch");
            match lease.conn().execute(sql) {
                Ok(r) => {
                    size += r.size_bytes();
                    if size > max {
                        failed = Some(max_memory_error(max));
                        break;
                    }
                    out.push((*idx, r));
                }
                Err(e) => {
                    tracing::warn!(txn_id = self.id, backend = name, error = %e, "fragment failed");
                    failed = Some(e);
                    break;
                }
            }
        }
        self.release(lease);
        match failed {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    fn execute_querys(&self, querys: &[QueryTuple], txn_mode: TxnMode) -> RadonResult<QueryResult> {
        self.check_live()?;
        self.rates.incr();
        {
            let mut state = self.state.lock();
            if matches!(*state, TxnState::Init | TxnState::Begin) {
                *state = TxnState::Executing;
            }
        }
        let groups = Self::group_by_backend(querys);
        let deadline = self.deadline();
        let mut slots: Vec<Option<QueryResult>> = vec![None; querys.len()];

        let mut first_err: Option<RadonError> = None;
        let mut timed_out = None;
        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            for (name, items) in &groups {
                let tx = tx.clone();
                s.spawn(move || {
                    let _ = tx.send(self.run_backend(name, items, txn_mode));
                });
            }
            drop(tx);
            loop {
                let msg = match (deadline, timed_out) {
                    (Some((at, ms)), None) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::warn!(txn_id = self.id, timeout_ms = ms, "transaction deadline exceeded, aborting");
                            timed_out = Some(ms);
                            self.counters.timed_out();
                            if let Err(e) = self.abort() {
                                tracing::error!(txn_id = self.id, error = %e, "abort after timeout failed");
                            }
                            continue;
                        }
                        other => other.ok(),
                    },
                    _ => rx.recv().ok(),
                };
                match msg {
                    Some(Ok(parts)) => {
                        for (idx, r) in parts {
                            slots[idx] = Some(r);
                        }
                    }
                    Some(Err(e)) => {
                        first_err.get_or_insert(e);
                    }
                    None => break,
                }
            }
        });

        if let Some(ms) = timed_out {
            return Err(RadonError::Timeout(ms));
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        let mut merged = QueryResult::default();
        for r in slots.into_iter().flatten() {
            merged.append_result(r);
        }
        let max = self.max_result_size.load(Ordering::Relaxed);
        if merged.size_bytes() > max {
            return Err(max_memory_error(max));
        }
        Ok(merged)
    }

    /// Fan out with back-pressure: each fragment's rows arrive in chunks of
    /// roughly `buffer_bytes / fragments` and are handed to `on_chunk` as they
    /// come. Only the first delivered chunk carries the field list. A failing
    /// `on_chunk` aborts every shard.
    pub fn execute_stream_fetch(
        &self,
        req: &RequestContext,
        on_chunk: &mut dyn FnMut(QueryResult) -> RadonResult<()>,
        buffer_bytes: usize,
    ) -> RadonResult<()> {
        self.check_live()?;
        self.rates.incr();
        let querys = self.resolve(req)?;
        let groups = Self::group_by_backend(&querys);
        let chunk_bytes = (buffer_bytes / querys.len().max(1)).max(1);
        let deadline = self.deadline();

        let mut sent_fields = false;
        let mut first_err: Option<RadonError> = None;
        let mut consumer_err: Option<RadonError> = None;
        let mut timed_out = None;
        std::thread::scope(|s| {
            let (tx, rx) = mpsc::sync_channel::<StreamMsg>(groups.len().max(1));
            for (name, items) in &groups {
                let tx = tx.clone();
                s.spawn(move || {
                    let done = self.stream_backend(name, items, req.txn_mode, chunk_bytes, &tx);
                    let _ = tx.send(StreamMsg::Done(done));
                });
            }
            drop(tx);
            loop {
                let msg = match (deadline, timed_out) {
                    (Some((at, ms)), None) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                        Err(RecvTimeoutError::Timeout) => {
                            timed_out = Some(ms);
                            self.counters.timed_out();
                            let _ = self.abort();
                            continue;
                        }
                        other => other.ok(),
                    },
                    _ => rx.recv().ok(),
                };
                match msg {
                    Some(StreamMsg::Chunk(mut chunk)) => {
                        if consumer_err.is_some() || timed_out.is_some() {
                            continue;
                        }
                        if sent_fields {
                            chunk.fields.clear();
                        }
                        sent_fields = true;
                        if let Err(e) = on_chunk(chunk) {
                            tracing::warn!(txn_id = self.id, error = %e, "stream consumer failed, aborting shards");
                            consumer_err = Some(e);
                            let _ = self.abort();
                        }
                    }
                    Some(StreamMsg::Done(Err(e))) => {
                        first_err.get_or_insert(e);
                    }
                    Some(StreamMsg::Done(Ok(()))) => {}
                    None => break,
                }
            }
        });

        if let Some(e) = consumer_err {
            return Err(e);
        }
        if let Some(ms) = timed_out {
            return Err(RadonError::Timeout(ms));
        }
        first_err.map_or(Ok(()), Err)
    }

    fn stream_backend(
        &self,
        name: &str,
        items: &[(usize, &str)],
        txn_mode: TxnMode,
        chunk_bytes: usize,
        tx: &mpsc::SyncSender<StreamMsg>,
    ) -> RadonResult<()> {
        let mut lease = self.acquire(name, txn_mode)?;
        let mut outcome = Ok(());
        for (_, sql) in items {
            let mut forward = |chunk: QueryResult| {
                self.check_live()?;
                tx.send(StreamMsg::Chunk(chunk))
                    .map_err(|_| RadonError::TxnAbort("stream consumer is gone".into()))
            };
            outcome = lease.conn().execute_stream(sql, chunk_bytes, &mut forward);
            if outcome.is_err() {
                break;
            }
        }
        self.release(lease);
        outcome
    }

    // ── Two-phase commit ──

    /// Open auto two-phase mode for a single multi-shard write: branches are
    /// started lazily with `XA START` as backends are touched.
    pub fn begin(&self) -> RadonResult<()> {
        self.check_live()?;
        *self.branch.lock() = if self.twopc.load(Ordering::Relaxed) {
            BranchMode::Xa
        } else {
            BranchMode::None
        };
        self.set_state(TxnState::Begin);
        Ok(())
    }

    /// Client `BEGIN`: open a branch on every backend now; backends reached
    /// later are still added on demand.
    pub fn begin_scatter(&self) -> RadonResult<()> {
        self.check_live()?;
        *self.branch.lock() = if self.twopc.load(Ordering::Relaxed) {
            BranchMode::Xa
        } else {
            BranchMode::Local
        };
        self.set_state(TxnState::Begin);
        let names: Vec<String> = self.backends.keys().cloned().collect();
        for name in names {
            let lease = self.acquire(&name, TxnMode::Write)?;
            self.release(lease);
        }
        Ok(())
    }

    fn take_branches(&self) -> Vec<(String, PooledConn)> {
        let mut branches = self.branches.lock();
        while !branches.busy.is_empty() {
            self.branch_cond.wait(&mut branches);
        }
        std::mem::take(&mut branches.conns).into_iter().collect()
    }

    fn restore_branches(&self, held: Vec<(String, PooledConn)>) {
        let mut branches = self.branches.lock();
        for (name, conn) in held {
            branches.conns.insert(name, conn);
        }
    }

    /// Run `sql` on every branch in parallel; results in branch order.
    fn on_each(held: &mut [(String, PooledConn)], sql: &str) -> Vec<RadonResult<()>> {
        if held.len() == 1 {
            return vec![held[0].1.execute(sql).map(|_| ())];
        }
        std::thread::scope(|s| {
            let handles: Vec<_> = held
                .iter_mut()
                .map(|(_, conn)| s.spawn(move || conn.execute(sql).map(|_| ())))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(RadonError::Internal("branch worker panicked".into())))
                })
                .collect()
        })
    }

    /// Commit every open branch. Without open branches this is a no-op.
    pub fn commit(&self) -> RadonResult<()> {
        self.check_live()?;
        let mode = *self.branch.lock();
        let outcome = match mode {
            BranchMode::None => Ok(()),
            BranchMode::Local => self.commit_local(),
            BranchMode::Xa => self.commit_xa(),
        };
        if outcome.is_ok() {
            self.counters.committed();
            metrics::counter!("radon_txn_total", "action" => "commit").increment(1);
        }
        outcome
    }

    fn commit_local(&self) -> RadonResult<()> {
        self.set_state(TxnState::Committing);
        let mut held = self.take_branches();
        let results = Self::on_each(&mut held, "COMMIT");
        self.restore_branches(held);
        results.into_iter().collect()
    }

    fn commit_xa(&self) -> RadonResult<()> {
        self.set_state(TxnState::Committing);
        let mut held = self.take_branches();
        if held.is_empty() {
            return Ok(());
        }
        let xid = self.xid.clone();

        let ended: RadonResult<()> = Self::on_each(&mut held, &format!("XA END '{xid}'")).into_iter().collect();
        let prepared = ended.and_then(|_| {
            Self::on_each(&mut held, &format!("XA PREPARE '{xid}'"))
                .into_iter()
                .collect::<RadonResult<()>>()
        });
        if let Err(e) = prepared {
            tracing::warn!(txn_id = self.id, xid = %xid, error = %e, "xa prepare phase failed, rolling back all branches");
            self.set_state(TxnState::RollingBack);
            let rolled = Self::xa_rollback_all(&mut held, &xid);
            self.restore_branches(held);
            self.counters.xa_rolled_back();
            if let Err(re) = rolled {
                tracing::error!(txn_id = self.id, xid = %xid, error = %re, "xa rollback after failed prepare left branches for the sweeper");
            }
            return Err(e);
        }

        self.prepared.store(true, Ordering::SeqCst);
        let committed = Self::on_each(&mut held, &format!("XA COMMIT '{xid}'"));
        for ((name, _), r) in held.iter().zip(committed) {
            if let Err(e) = r {
                self.counters.xa_commit_error();
                tracing::error!(txn_id = self.id, xid = %xid, backend = %name, error = %e, "xa commit failed after prepare, left for recovery");
            }
        }
        self.counters.xa_committed();
        self.restore_branches(held);
        Ok(())
    }

    /// `XA ROLLBACK` on every branch; a branch the backend already forgot
    /// (`XAER_NOTA`) counts as rolled back.
    fn xa_rollback_all(held: &mut [(String, PooledConn)], xid: &str) -> RadonResult<()> {
        Self::on_each(held, &format!("XA ROLLBACK '{xid}'"))
            .into_iter()
            .filter(|r| !matches!(r, Err(e) if e.is_xaer_nota()))
            .collect()
    }

    /// Roll back a two-phase write whose execution failed: end every branch
    /// and roll it back.
    pub fn rollback_phase_one(&self) -> RadonResult<()> {
        if self.is_aborted() {
            return Ok(());
        }
        let mode = *self.branch.lock();
        if mode != BranchMode::Xa {
            return self.rollback_local();
        }
        self.set_state(TxnState::RollingBack);
        let mut held = self.take_branches();
        if held.is_empty() {
            return Ok(());
        }
        let xid = self.xid.clone();
        for r in Self::on_each(&mut held, &format!("XA END '{xid}'")) {
            if let Err(e) = r {
                tracing::debug!(txn_id = self.id, error = %e, "xa end before rollback");
            }
        }
        let rolled = Self::xa_rollback_all(&mut held, &xid);
        self.restore_branches(held);
        self.counters.rolled_back();
        self.counters.xa_rolled_back();
        rolled
    }

    fn rollback_local(&self) -> RadonResult<()> {
        self.set_state(TxnState::RollingBack);
        let mut held = self.take_branches();
        let results = Self::on_each(&mut held, "ROLLBACK");
        self.restore_branches(held);
        self.counters.rolled_back();
        results.into_iter().collect()
    }

    /// Commit a client transaction.
    pub fn commit_scatter(&self) -> RadonResult<()> {
        self.commit()
    }

    /// Roll back a client transaction.
    pub fn rollback_scatter(&self) -> RadonResult<()> {
        self.rollback_phase_one()
    }

    /// Kill everything this transaction holds and mark it finished. Safe to
    /// call at any time and from any thread. A transaction past `XA PREPARE`
    /// is left alone for the sweeper.
    pub fn abort(&self) -> RadonResult<()> {
        {
            let state = self.state.lock();
            if *state == TxnState::Finished {
                return Ok(());
            }
            if *state == TxnState::Committing && self.prepared.load(Ordering::SeqCst) {
                tracing::warn!(txn_id = self.id, xid = %self.xid, "abort skipped: transaction already prepared");
                return Ok(());
            }
        }
        if self.aborted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.counters.aborted();
        metrics::counter!("radon_txn_total", "action" => "abort").increment(1);

        let targets: Vec<(Arc<Pool>, u32)> = self.inflight.lock().clone();
        tracing::info!(txn_id = self.id, connections = targets.len(), "aborting transaction");
        std::thread::scope(|s| {
            for (pool, id) in &targets {
                s.spawn(move || {
                    if let Err(e) = pool.kill(*id) {
                        tracing::warn!(backend = pool.name(), conn_id = id, error = %e, "kill failed during abort");
                    }
                });
            }
        });

        let idle: Vec<PooledConn> = {
            let mut branches = self.branches.lock();
            std::mem::take(&mut branches.conns).into_values().collect()
        };
        for conn in idle {
            self.unregister(&conn);
        }
        self.branch_cond.notify_all();
        self.set_state(TxnState::Finished);
        Ok(())
    }

    /// Release every held connection. Idempotent.
    pub fn finish(&self) {
        let held = self.take_branches();
        for (_, conn) in held {
            self.unregister(&conn);
        }
        *self.branch.lock() = BranchMode::None;
        self.set_state(TxnState::Finished);
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.counters.finished();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.counters.finished();
        }
    }
}

fn max_memory_error(max: usize) -> RadonError {
    RadonError::Interrupted(format!("max memory usage[{max} bytes] exceeded"))
}

