//! Statement dispatch.
//!
//! `Spanner` is the front desk every client statement goes through: it
//! classifies the text, applies the disk and read-only gates, then either
//! answers locally (session control, SHOW, admin) or plans the statement and
//! runs it under a transaction. DDL, SHOW and XA admin live in sibling
//! modules as further `impl Spanner` blocks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use radon_backend::{Scatter, Transaction, XaRecovery};
use radon_common::config::ProxyConfig;
use radon_common::error::codes;
use radon_common::{Datum, ErrorKind, Field, FieldType, QueryResult, RadonError, RadonResult, ReqMode};
use radon_executor::{ExecContext, Tree};
use radon_planner::{parse_one, Plan, Planner};
use radon_router::Router;

use crate::classify::{classify, strip_leading, StmtKind};
use crate::diskcheck::DiskCheck;
use crate::policy::Policy;
use crate::session::Session;
use crate::sessions::Sessions;

pub type OnResult<'a> = dyn FnMut(QueryResult) -> RadonResult<()> + 'a;

/// Per-session variables set with `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionVars {
    pub streaming_fetch: bool,
    pub autocommit: bool,
}

impl Default for SessionVars {
    fn default() -> Self {
        Self {
            streaming_fetch: false,
            autocommit: true,
        }
    }
}

pub struct Spanner {
    pub(crate) conf: ProxyConfig,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) scatter: Arc<Scatter>,
    pub(crate) planner: Planner,
    pub(crate) sessions: Arc<Sessions>,
    pub(crate) policy: Arc<Policy>,
    pub(crate) disk: Arc<DiskCheck>,
    pub(crate) xa: Arc<XaRecovery>,
    /// Client (`BEGIN ... COMMIT`) transactions by session id.
    txns: DashMap<u32, Arc<Transaction>>,
    vars: DashMap<u32, SessionVars>,
}

impl Spanner {
    pub fn new(
        conf: ProxyConfig,
        router: Arc<dyn Router>,
        scatter: Arc<Scatter>,
        disk: Arc<DiskCheck>,
    ) -> Arc<Self> {
        let planner = Planner::new(Arc::clone(&router)).with_row_num_limit(conf.bn_join_row_limit);
        let policy = Arc::new(Policy::new(conf.read_only, conf.load_balance));
        let xa = XaRecovery::new(Arc::clone(&scatter), conf.xa_recover_horizon_secs);
        Arc::new(Self {
            conf,
            router,
            scatter,
            planner,
            sessions: Arc::new(Sessions::new()),
            policy,
            disk,
            xa,
            txns: DashMap::new(),
            vars: DashMap::new(),
        })
    }

    pub fn conf(&self) -> &ProxyConfig {
        &self.conf
    }

    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn scatter(&self) -> &Arc<Scatter> {
        &self.scatter
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn disk(&self) -> &Arc<DiskCheck> {
        &self.disk
    }

    pub fn xa(&self) -> &Arc<XaRecovery> {
        &self.xa
    }

    pub fn session_vars(&self, id: u32) -> SessionVars {
        self.vars.get(&id).map(|v| *v).unwrap_or_default()
    }

    fn update_vars(&self, id: u32, f: impl FnOnce(&mut SessionVars)) {
        f(&mut self.vars.entry(id).or_default());
    }

    /// The open client transaction of session `id`, if any.
    pub fn multi_stmt_txn(&self, id: u32) -> Option<Arc<Transaction>> {
        self.txns.get(&id).map(|t| Arc::clone(&t))
    }

    /// Number of open client transactions.
    pub fn txns_open(&self) -> usize {
        self.txns.len()
    }

    // ── Entry points ──

    /// `COM_INIT_DB`.
    pub fn com_init_db(&self, session: &dyn Session, db: &str) -> RadonResult<()> {
        self.router.database_acl(db)?;
        if !self.router.is_system_db(db) {
            self.router.check_database(db)?;
        }
        session.set_schema(db);
        tracing::debug!(session_id = session.id(), db, "schema changed");
        Ok(())
    }

    /// `COM_QUERY`. Results are delivered through `on_result`, once for a
    /// plain statement and once per chunk when streaming.
    pub fn com_query(&self, session: &dyn Session, query: &str, on_result: &mut OnResult<'_>) -> RadonResult<()> {
        let id = session.id();
        if !self.sessions.contains(id) {
            return Err(RadonError::Interrupted("session is closed".into()));
        }
        let sql = query.trim().trim_end_matches(';').trim_end();
        let kind = classify(sql);
        let start = Instant::now();
        tracing::debug!(session_id = id, kind = %kind, "com_query");

        let outcome = self
            .gate(kind)
            .and_then(|_| self.dispatch(session, kind, sql, on_result));

        radon_observability::record_query_metrics(start.elapsed(), kind.name(), outcome.is_ok());
        if let Err(e) = &outcome {
            match e.kind() {
                ErrorKind::UserError => tracing::debug!(session_id = id, kind = %kind, error = %e, "statement refused"),
                ErrorKind::Backend | ErrorKind::Transient => {
                    tracing::warn!(session_id = id, kind = %kind, error = %e, "statement failed")
                }
                ErrorKind::InternalBug => tracing::error!(session_id = id, kind = %kind, query = sql, error = %e, "internal error"),
            }
        }
        outcome
    }

    /// `com_query` with every chunk collected into one result.
    pub fn query(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let mut out: Option<QueryResult> = None;
        self.com_query(session, sql, &mut |chunk| {
            match out.as_mut() {
                Some(acc) => acc.append_result(chunk),
                None => out = Some(chunk),
            }
            Ok(())
        })?;
        Ok(out.unwrap_or_default())
    }

    /// Kill session `id` and drop its client transaction.
    pub fn kill_session(&self, id: u32, reason: &str) -> bool {
        let killed = self.sessions.kill(id, reason);
        if killed {
            self.forget(id);
        }
        killed
    }

    /// Client disconnect.
    pub fn session_closed(&self, id: u32) {
        self.sessions.remove(id);
        self.forget(id);
    }

    fn forget(&self, id: u32) {
        self.vars.remove(&id);
        if let Some((_, txn)) = self.txns.remove(&id) {
            if let Err(e) = txn.abort() {
                tracing::warn!(session_id = id, txn_id = txn.id(), error = %e, "abort of client transaction failed");
            }
        }
    }

    // ── Dispatch ──

    /// Disk and read-only gates; reads always pass.
    fn gate(&self, kind: StmtKind) -> RadonResult<()> {
        if !(kind.is_write() || kind.is_ddl()) {
            return Ok(());
        }
        if self.disk.is_highwater() {
            return Err(RadonError::DiskFull);
        }
        if !self.policy.allows(kind) {
            return Err(RadonError::ReadOnly);
        }
        Ok(())
    }

    fn dispatch(&self, session: &dyn Session, kind: StmtKind, sql: &str, on_result: &mut OnResult<'_>) -> RadonResult<()> {
        match kind {
            StmtKind::Select | StmtKind::Insert | StmtKind::Replace | StmtKind::Update | StmtKind::Delete => {
                self.handle_dml(session, kind, sql, on_result)
            }
            k if k.is_ddl() => on_result(self.handle_ddl(session, kind, sql)?),
            StmtKind::Explain => on_result(self.handle_explain(session, sql)?),
            StmtKind::Describe => on_result(self.handle_describe(session, sql)?),
            StmtKind::Show => self.handle_show(session, sql, on_result),
            StmtKind::Maintenance => on_result(self.handle_maintenance(session, sql)?),
            StmtKind::Use => on_result(self.handle_use(session, sql)?),
            StmtKind::Set => on_result(self.handle_set(session, sql)?),
            StmtKind::Kill => on_result(self.handle_kill(sql)?),
            StmtKind::Begin => on_result(self.handle_begin(session)?),
            StmtKind::Commit => on_result(self.handle_commit(session)?),
            StmtKind::Rollback => on_result(self.handle_rollback(session)?),
            StmtKind::Xa => on_result(self.handle_xa(sql)?),
            StmtKind::Radon => Err(RadonError::Unsupported(format!("unsupported: radon admin statement {sql}"))),
            StmtKind::Comment => on_result(self.passthrough(sql)?),
            _ => {
                parse_one(sql)?;
                Err(RadonError::Unsupported(format!("unsupported: query {sql}")))
            }
        }
    }

    // ── Transactions ──

    /// A transaction with the proxy-wide limits applied.
    pub(crate) fn new_txn(&self, timeout_ms: u64) -> RadonResult<Arc<Transaction>> {
        let txn = self.scatter.create_transaction()?;
        txn.set_timeout(timeout_ms);
        txn.set_max_result(self.conf.max_result_size);
        txn.set_max_join_rows(self.conf.max_join_rows);
        txn.set_twopc(self.conf.twopc_enable);
        Ok(txn)
    }

    fn open_multi_stmt_txn(&self, session: &dyn Session) -> RadonResult<Arc<Transaction>> {
        let id = session.id();
        let txn = self.new_txn(self.conf.query_timeout_ms)?;
        txn.set_multi_stmt_txn();
        if let Err(e) = txn.begin_scatter() {
            txn.finish();
            return Err(e);
        }
        self.txns.insert(id, Arc::clone(&txn));
        self.sessions.txn_binding(id, &txn, StmtKind::Begin, "BEGIN");
        radon_observability::record_txn_metrics("begin");
        tracing::debug!(session_id = id, txn_id = txn.id(), "client transaction started");
        Ok(txn)
    }

    fn end_multi_stmt_txn(&self, id: u32, txn: &Arc<Transaction>) {
        self.txns.remove(&id);
        txn.finish();
        self.sessions.multi_stmt_txn_unbinding(id, true);
    }

    fn handle_begin(&self, session: &dyn Session) -> RadonResult<QueryResult> {
        if self.txns.contains_key(&session.id()) {
            tracing::debug!(session_id = session.id(), "BEGIN inside a transaction, committing the open one");
            self.handle_commit(session)?;
        }
        self.open_multi_stmt_txn(session)?;
        Ok(QueryResult::default())
    }

    fn handle_commit(&self, session: &dyn Session) -> RadonResult<QueryResult> {
        let id = session.id();
        let Some(txn) = self.multi_stmt_txn(id) else {
            return Ok(QueryResult::default());
        };
        self.sessions.txn_binding(id, &txn, StmtKind::Commit, "COMMIT");
        let outcome = txn.commit_scatter();
        self.end_multi_stmt_txn(id, &txn);
        outcome.map(|_| QueryResult::default())
    }

    fn handle_rollback(&self, session: &dyn Session) -> RadonResult<QueryResult> {
        let id = session.id();
        let Some(txn) = self.multi_stmt_txn(id) else {
            return Ok(QueryResult::default());
        };
        self.sessions.txn_binding(id, &txn, StmtKind::Rollback, "ROLLBACK");
        let outcome = txn.rollback_scatter();
        self.end_multi_stmt_txn(id, &txn);
        radon_observability::record_txn_metrics("rollback");
        outcome.map(|_| QueryResult::default())
    }

    // ── DML ──

    fn handle_dml(&self, session: &dyn Session, kind: StmtKind, sql: &str, on_result: &mut OnResult<'_>) -> RadonResult<()> {
        let id = session.id();
        if let Some(txn) = self.multi_stmt_txn(id) {
            return self.execute_in_txn(session, &txn, kind, sql, on_result);
        }
        if !self.session_vars(id).autocommit && self.conf.autocommit_false_is_txn {
            let txn = self.open_multi_stmt_txn(session)?;
            return self.execute_in_txn(session, &txn, kind, sql, on_result);
        }
        self.execute_autocommit(session, kind, sql, on_result)
    }

    fn tree(&self, txn: &Arc<Transaction>, plan: Plan) -> Tree {
        let ctx = ExecContext::new(Arc::clone(txn)).with_join_workers(self.conf.join_workers);
        let mut tree = Tree::new(ctx);
        tree.add(plan);
        tree
    }

    /// Backends a write plan touches.
    fn write_fanout(&self, plan: &Plan) -> usize {
        match plan {
            Plan::Insert(p) | Plan::Update(p) | Plan::Delete(p) if p.mode == ReqMode::ScatterRequest => {
                self.scatter.backends().len()
            }
            _ => plan
                .querys()
                .iter()
                .map(|q| q.backend.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
        }
    }

    fn run(&self, session: &dyn Session, tree: &Tree, kind: StmtKind, on_result: &mut OnResult<'_>) -> RadonResult<()> {
        if kind == StmtKind::Select && self.session_vars(session.id()).streaming_fetch {
            return tree.execute_stream_fetch(on_result, self.conf.stream_buffer_size);
        }
        on_result(tree.execute()?)
    }

    fn execute_in_txn(
        &self,
        session: &dyn Session,
        txn: &Arc<Transaction>,
        kind: StmtKind,
        sql: &str,
        on_result: &mut OnResult<'_>,
    ) -> RadonResult<()> {
        let id = session.id();
        let plan = self.planner.build(&session.schema(), sql)?;
        self.sessions.txn_binding(id, txn, kind, sql);
        let tree = self.tree(txn, plan);
        let outcome = self.run(session, &tree, kind, on_result);
        self.sessions.multi_stmt_txn_unbinding(id, false);
        if txn.is_aborted() {
            tracing::warn!(session_id = id, txn_id = txn.id(), "client transaction aborted");
            self.end_multi_stmt_txn(id, txn);
        }
        outcome
    }

    fn execute_autocommit(&self, session: &dyn Session, kind: StmtKind, sql: &str, on_result: &mut OnResult<'_>) -> RadonResult<()> {
        let id = session.id();
        let plan = self.planner.build(&session.schema(), sql)?;
        let twophase = kind.is_write() && self.write_fanout(&plan) > 1;

        let txn = self.new_txn(self.conf.query_timeout_ms)?;
        if kind == StmtKind::Select {
            txn.set_is_exec_on_rep(self.policy.read_on_replica(sql));
        }
        self.sessions.txn_binding(id, &txn, kind, sql);
        let tree = self.tree(&txn, plan);

        let outcome = if twophase {
            txn.begin().and_then(|_| match tree.execute() {
                Ok(res) => txn.commit().and_then(|_| on_result(res)),
                Err(e) => {
                    if let Err(re) = txn.rollback_phase_one() {
                        tracing::warn!(session_id = id, txn_id = txn.id(), error = %re, "rollback after failed write");
                    }
                    Err(e)
                }
            })
        } else {
            self.run(session, &tree, kind, on_result)
        };
        txn.finish();
        self.sessions.txn_unbinding(id);
        outcome
    }

    // ── Session statements ──

    fn handle_use(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(r"(?is)^\s*use\s+(", name_re!(), r")\s*$"))
            .ok_or_else(|| RadonError::Internal("use pattern".into()))?;
        let caps = re
            .captures(sql)
            .ok_or_else(|| RadonError::Parse(format!("syntax error at position {}: {sql}", sql.len())))?;
        let (_, db) = crate::split_name(caps.get(1).map_or("", |m| m.as_str()));
        self.com_init_db(session, &db)?;
        Ok(QueryResult::default())
    }

    fn handle_set(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let id = session.id();
        let body = strip_leading(sql)
            .get(3..)
            .map(str::trim)
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let head = body.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
        if matches!(head.as_str(), "names" | "character" | "charset") {
            return self.passthrough(sql);
        }
        for assignment in split_top_level(body, ',') {
            let Some((name, value)) = assignment.split_once('=') else {
                return Err(RadonError::Parse(format!("syntax error near '{assignment}'")));
            };
            let name = variable_name(name);
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
            match name.as_str() {
                "radon_streaming_fetch" => {
                    let on = parse_switch(&name, &value)?;
                    self.update_vars(id, |v| v.streaming_fetch = on);
                }
                "autocommit" => {
                    let on = parse_switch(&name, &value)?;
                    self.update_vars(id, |v| v.autocommit = on);
                    if on && self.txns.contains_key(&id) {
                        self.handle_commit(session)?;
                    }
                }
                _ => tracing::debug!(session_id = id, variable = %name, "ignoring unknown variable"),
            }
        }
        Ok(QueryResult::default())
    }

    fn handle_kill(&self, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(r"(?i)^\s*kill\s+(?:(query|connection)\s+)?(\d+)\s*$")
            .ok_or_else(|| RadonError::Internal("kill pattern".into()))?;
        let caps = re
            .captures(sql)
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let target: u32 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| RadonError::Parse(format!("bad thread id: {sql}")))?;
        let query_only = caps.get(1).is_some_and(|m| m.as_str().eq_ignore_ascii_case("query"));
        let found = if query_only {
            self.sessions.kill_query(target)
        } else {
            self.kill_session(target, "killed by KILL statement")
        };
        if !found {
            return Err(RadonError::backend(
                codes::ER_NO_SUCH_THREAD,
                "HY000",
                format!("Unknown thread id: {target}"),
            ));
        }
        Ok(QueryResult::default())
    }

    // ── Other statements ──

    fn handle_explain(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(r"(?is)^\s*explain\s+(.+)$").ok_or_else(|| RadonError::Internal("explain pattern".into()))?;
        let inner = re
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        if !matches!(
            classify(inner),
            StmtKind::Select | StmtKind::Insert | StmtKind::Replace | StmtKind::Update | StmtKind::Delete
        ) {
            return Err(RadonError::Unsupported(format!("unsupported: explain of {inner}")));
        }
        let stmt = parse_one(inner)?;
        let json = self.planner.explain(&session.schema(), inner, &stmt)?;
        Ok(QueryResult::new(
            vec![Field::new("EXPLAIN", FieldType::VarString)],
            vec![vec![Datum::Text(json)]],
        ))
    }

    /// `OPTIMIZE`, `CHECK` and `CHECKSUM TABLE`, one fan-out per named table.
    fn handle_maintenance(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(
            r"(?is)^(\s*\w+\s+(?:(?:no_write_to_binlog|local)\s+)?tables?\s+)(.+?)((?:\s+(?:quick|fast|medium|extended|changed|for\s+upgrade))*)\s*$"
        )
        .ok_or_else(|| RadonError::Internal("maintenance pattern".into()))?;
        let caps = re
            .captures(sql)
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let head = caps.get(1).map_or("", |m| m.as_str());
        let tail = caps.get(3).map_or("", |m| m.as_str());
        let names = caps.get(2).map_or("", |m| m.as_str());

        let txn = self.new_txn(self.conf.ddl_timeout_ms)?;
        self.sessions.txn_binding(session.id(), &txn, StmtKind::Maintenance, sql);
        let outcome = (|| -> RadonResult<QueryResult> {
            let mut out = QueryResult::default();
            for raw in split_top_level(names, ',') {
                let (qualifier, table) = crate::split_name(&raw);
                let db = qualifier.unwrap_or_else(|| session.schema());
                self.router.check_database(&db)?;
                let stmt = format!("{head}{}{tail}", raw.trim());
                let plan = self.planner.build_others(&db, &table, &stmt)?;
                out.append_result(self.tree(&txn, plan).execute()?);
            }
            Ok(out)
        })();
        txn.finish();
        self.sessions.txn_unbinding(session.id());
        outcome
    }

    /// Send `sql` unchanged to one backend.
    pub(crate) fn passthrough(&self, sql: &str) -> RadonResult<QueryResult> {
        let txn = self.new_txn(self.conf.query_timeout_ms)?;
        let out = txn.execute_single(sql);
        txn.finish();
        out
    }
}

/// Split on `sep` outside quotes and parentheses.
pub(crate) fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                cur.push(c);
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    cur.push(c);
                }
                '(' => {
                    depth += 1;
                    cur.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    cur.push(c);
                }
                c if c == sep && depth == 0 => out.push(std::mem::take(&mut cur)),
                c => cur.push(c),
            },
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur);
    }
    out.into_iter().map(|p| p.trim().to_string()).collect()
}

/// `@@session.autocommit`, `SESSION autocommit` and `autocommit` all name
/// the same variable.
fn variable_name(raw: &str) -> String {
    let mut name = raw.trim().to_ascii_lowercase();
    for prefix in ["@@session.", "@@local.", "@@global.", "@@", "session ", "local ", "global "] {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest.trim().to_string();
            break;
        }
    }
    name
}

fn parse_switch(name: &str, value: &str) -> RadonResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        _ => Err(RadonError::backend(
            codes::ER_WRONG_VALUE_FOR_VAR,
            "42000",
            format!("Variable '{name}' can't be set to the value of '{value}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_top_level() {
        assert_eq!(split_top_level("a=1, b='x,y', c=f(1,2)", ','), vec!["a=1", "b='x,y'", "c=f(1,2)"]);
        assert_eq!(split_top_level("t1 , `a,b`", ','), vec!["t1", "`a,b`"]);
        assert!(split_top_level("  ", ',').is_empty());
    }

    #[test]
    fn test_variable_names() {
        assert_eq!(variable_name(" @@SESSION.autocommit "), "autocommit");
        assert_eq!(variable_name("session radon_streaming_fetch"), "radon_streaming_fetch");
        assert_eq!(variable_name("@@autocommit"), "autocommit");
        assert_eq!(variable_name("@user_var"), "@user_var");
    }

    #[test]
    fn test_parse_switch() {
        assert!(parse_switch("autocommit", "ON").unwrap());
        assert!(!parse_switch("autocommit", "0").unwrap());
        let err = parse_switch("autocommit", "maybe").unwrap_err();
        assert!(err.is_backend_code(codes::ER_WRONG_VALUE_FOR_VAR));
        assert!(err.to_string().contains("can't be set to the value of 'maybe'"));
    }
}
