//! `SHOW` and `DESCRIBE`.
//!
//! Topology questions are answered from the router and the scatter; table
//! metadata comes from the first physical table of the logical one with the
//! physical name swapped back. Anything unrecognised goes to one backend.

use radon_common::{Datum, Field, FieldType, QueryResult, RadonError, RadonResult, Row};
use radon_router::{ShardType, TableConfig};

use crate::session::Session;
use crate::spanner::{OnResult, Spanner};
use crate::split_name;

pub(crate) fn result_of(columns: &[(&str, FieldType)], rows: Vec<Row>) -> QueryResult {
    let fields = columns.iter().map(|(name, t)| Field::new(*name, *t)).collect();
    QueryResult::new(fields, rows)
}

fn text(s: impl Into<String>) -> Datum {
    Datum::Text(s.into())
}

/// SQL `LIKE`, case-insensitive, with `\` escapes.
pub fn like_match(pattern: &str, s: &str) -> bool {
    #[derive(Clone, Copy)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        toks.push(match c {
            '%' => Tok::Any,
            '_' => Tok::One,
            '\\' => Tok::Lit(chars.next().unwrap_or('\\')),
            c => Tok::Lit(c),
        });
    }
    let s: Vec<char> = s.chars().flat_map(char::to_lowercase).collect();
    // dp[j]: the first i chars of s match the first j tokens.
    let mut dp = vec![false; toks.len() + 1];
    dp[0] = true;
    for j in 0..toks.len() {
        dp[j + 1] = dp[j] && matches!(toks[j], Tok::Any);
    }
    for ch in &s {
        let mut next = vec![false; toks.len() + 1];
        for j in 0..toks.len() {
            next[j + 1] = match toks[j] {
                Tok::Any => next[j] || dp[j + 1],
                Tok::One => dp[j],
                Tok::Lit(l) => dp[j] && l.to_lowercase().eq(std::iter::once(*ch)),
            };
        }
        dp = next;
    }
    dp[toks.len()]
}

/// Shard suffix that recreates `cfg`'s layout.
fn distribution_suffix(cfg: &TableConfig) -> String {
    match cfg.shard_type {
        ShardType::Hash => format!("\nPARTITION BY HASH(`{}`)", cfg.shard_key),
        ShardType::List => {
            let parts: Vec<String> = cfg
                .partitions
                .iter()
                .map(|p| format!("PARTITION {} VALUES IN ({})", p.backend, p.list_values.join(",")))
                .collect();
            format!("\nPARTITION BY LIST(`{}`)({})", cfg.shard_key, parts.join(", "))
        }
        ShardType::Global => "\nGLOBAL".to_string(),
        ShardType::Single => match cfg.partitions.first() {
            Some(p) => format!("\nDISTRIBUTED BY ({})", p.backend),
            None => "\nSINGLE".to_string(),
        },
    }
}

impl Spanner {
    pub(crate) fn handle_show(&self, session: &dyn Session, sql: &str, on_result: &mut OnResult<'_>) -> RadonResult<()> {
        let lower = sql.to_ascii_lowercase();
        let words: Vec<&str> = lower.split_whitespace().skip(1).take(3).collect();
        let word = |i: usize| words.get(i).copied().unwrap_or("");
        let out = match (word(0), word(1)) {
            ("databases" | "schemas", _) => self.show_databases(sql)?,
            ("tables", _) | ("full", "tables") => self.show_tables(session, sql)?,
            ("table", "status") => self.show_table_status(session, sql)?,
            ("create", "table") => self.show_create_table(session, sql)?,
            ("columns" | "fields", _) | ("full", "columns" | "fields") => self.show_columns(session, sql)?,
            ("index" | "indexes" | "keys", _) => self.show_index(session, sql)?,
            ("processlist", _) | ("full", "processlist") => self.show_processlist(),
            ("status", _) => self.show_status(),
            ("queryz", _) => self.show_queryz(),
            ("txnz", _) => self.show_txnz(),
            ("versions", _) => self.show_versions(),
            ("binlog", "events") => {
                return Err(RadonError::Unsupported("unsupported: show binlog events".into()));
            }
            _ => self.passthrough(sql)?,
        };
        on_result(out)
    }

    /// `DESC t` is `SHOW COLUMNS FROM t`.
    pub(crate) fn handle_describe(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(r"(?is)^\s*desc(?:ribe)?\s+(", name_re!(), r")"))
            .ok_or_else(|| RadonError::Internal("describe pattern".into()))?;
        let raw = re
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let (db, table) = self.show_target(session, raw, None)?;
        self.first_segment_query(&db, &table, |phys| format!("SHOW COLUMNS FROM `{db}`.`{phys}`"), None)
    }

    /// Database and table for a SHOW, honouring `FROM db` and qualified names.
    fn show_target(&self, session: &dyn Session, raw: &str, from: Option<&str>) -> RadonResult<(String, String)> {
        let (qualifier, table) = split_name(raw);
        let db = from
            .map(|d| split_name(d).1)
            .or(qualifier)
            .unwrap_or_else(|| session.schema());
        self.router.database_acl(&db)?;
        self.router.check_table(&db, &table)?;
        Ok((db, table))
    }

    /// Run `build(physical)` on the first segment of `db.table`; the
    /// column at `name_col` is renamed back to the logical table.
    fn first_segment_query(
        &self,
        db: &str,
        table: &str,
        build: impl Fn(&str) -> String,
        name_col: Option<usize>,
    ) -> RadonResult<QueryResult> {
        let cfg = self.router.table_config(db, table)?;
        let seg = cfg
            .segments()
            .into_iter()
            .next()
            .ok_or_else(|| RadonError::Internal(format!("table {db}.{table} has no segments")))?;
        let txn = self.new_txn(self.conf.query_timeout_ms)?;
        let out = txn.execute_on_this_backend(&seg.backend, &build(&seg.table));
        txn.finish();
        let mut out = out?;
        if let Some(col) = name_col {
            for row in &mut out.rows {
                if let Some(cell) = row.get_mut(col) {
                    *cell = text(table);
                }
            }
        }
        Ok(out)
    }

    // ── Topology ──

    fn show_databases(&self, sql: &str) -> RadonResult<QueryResult> {
        let like = like_pattern(sql);
        let rows = self
            .router
            .tables()
            .into_keys()
            .filter(|db| like.as_deref().map_or(true, |p| like_match(p, db)))
            .map(|db| vec![text(db)])
            .collect();
        Ok(result_of(&[("Database", FieldType::VarString)], rows))
    }

    fn show_tables(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let full = static_regex!(r"(?i)^\s*show\s+full\s").is_some_and(|re| re.is_match(sql));
        let db = match from_db(sql) {
            Some(db) => db,
            None => session.schema(),
        };
        self.router.database_acl(&db)?;
        self.router.check_database(&db)?;
        let like = like_pattern(sql);
        let tables = self.router.tables().remove(&db).unwrap_or_default();
        let rows: Vec<Row> = tables
            .into_iter()
            .filter(|t| like.as_deref().map_or(true, |p| like_match(p, t)))
            .map(|t| {
                let mut row = vec![text(t)];
                if full {
                    row.push(text("BASE TABLE"));
                }
                row
            })
            .collect();
        let name = format!("Tables_in_{db}");
        let mut columns = vec![(name.as_str(), FieldType::VarString)];
        if full {
            columns.push(("Table_type", FieldType::VarString));
        }
        Ok(result_of(&columns, rows))
    }

    fn show_table_status(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let db = from_db(sql).unwrap_or_else(|| session.schema());
        self.router.database_acl(&db)?;
        self.router.check_database(&db)?;
        let like = like_pattern(sql);
        let mut out = QueryResult::default();
        for table in self.router.tables().remove(&db).unwrap_or_default() {
            if like.as_deref().is_some_and(|p| !like_match(p, &table)) {
                continue;
            }
            let status = self.first_segment_query(
                &db,
                &table,
                |phys| format!("SHOW TABLE STATUS FROM `{db}` LIKE '{phys}'"),
                Some(0),
            )?;
            out.append_result(status);
        }
        Ok(out)
    }

    fn show_create_table(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(r"(?is)^\s*show\s+create\s+table\s+(", name_re!(), r")\s*$"))
            .ok_or_else(|| RadonError::Internal("show create pattern".into()))?;
        let raw = re
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let (db, table) = self.show_target(session, raw, None)?;
        let cfg = self.router.table_config(&db, &table)?;
        let phys = cfg.segments().first().map(|s| s.table.clone()).unwrap_or_default();
        let mut out = self.first_segment_query(&db, &table, |p| format!("SHOW CREATE TABLE `{db}`.`{p}`"), Some(0))?;
        let suffix = distribution_suffix(&cfg);
        for row in &mut out.rows {
            if let Some(Datum::Text(ddl)) = row.get_mut(1) {
                *ddl = format!(
                    "{}{suffix}",
                    ddl.replacen(&format!("`{phys}`"), &format!("`{table}`"), 1)
                );
            }
        }
        Ok(out)
    }

    fn show_columns(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(
            r"(?is)^\s*show\s+(full\s+)?(?:columns|fields)\s+(?:from|in)\s+(",
            name_re!(),
            r")(?:\s+(?:from|in)\s+(",
            name_re!(),
            r"))?"
        ))
        .ok_or_else(|| RadonError::Internal("show columns pattern".into()))?;
        let caps = re
            .captures(sql)
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let full = if caps.get(1).is_some() { "FULL " } else { "" };
        let (db, table) = self.show_target(
            session,
            caps.get(2).map_or("", |m| m.as_str()),
            caps.get(3).map(|m| m.as_str()),
        )?;
        self.first_segment_query(&db, &table, |p| format!("SHOW {full}COLUMNS FROM `{db}`.`{p}`"), None)
    }

    fn show_index(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(
            r"(?is)^\s*show\s+(?:index|indexes|keys)\s+(?:from|in)\s+(",
            name_re!(),
            r")(?:\s+(?:from|in)\s+(",
            name_re!(),
            r"))?"
        ))
        .ok_or_else(|| RadonError::Internal("show index pattern".into()))?;
        let caps = re
            .captures(sql)
            .ok_or_else(|| RadonError::Parse(format!("syntax error: {sql}")))?;
        let (db, table) = self.show_target(
            session,
            caps.get(1).map_or("", |m| m.as_str()),
            caps.get(2).map(|m| m.as_str()),
        )?;
        self.first_segment_query(&db, &table, |p| format!("SHOW INDEX FROM `{db}`.`{p}`"), Some(0))
    }

    // ── Proxy state ──

    fn show_processlist(&self) -> QueryResult {
        let rows = self
            .sessions
            .snapshot()
            .into_iter()
            .map(|s| {
                vec![
                    Datum::UInt64(u64::from(s.id)),
                    text(s.user),
                    text(s.host),
                    if s.db.is_empty() { Datum::Null } else { text(s.db) },
                    text(s.command),
                    Datum::UInt64(s.time.as_secs()),
                    match (s.node, s.txn_id) {
                        (Some(node), _) => text(node.name()),
                        (None, Some(_)) => text("in transaction"),
                        (None, None) => text(""),
                    },
                    if s.info.is_empty() { Datum::Null } else { text(s.info) },
                ]
            })
            .collect();
        result_of(
            &[
                ("Id", FieldType::LongLong),
                ("User", FieldType::VarString),
                ("Host", FieldType::VarString),
                ("db", FieldType::VarString),
                ("Command", FieldType::VarString),
                ("Time", FieldType::LongLong),
                ("State", FieldType::VarString),
                ("Info", FieldType::VarString),
            ],
            rows,
        )
    }

    fn show_status(&self) -> QueryResult {
        let rates = self.scatter.query_rates();
        let txns = self.scatter.txn_counters().snapshot();
        let mut rows: Vec<(String, String)> = vec![
            ("sessions".into(), self.sessions.count().to_string()),
            ("client_transactions".into(), self.txns_open().to_string()),
            ("read_only".into(), self.policy.read_only().to_string()),
            ("load_balance".into(), self.policy.load_balance().to_string()),
            ("disk_used_percent".into(), format!("{:.2}", self.disk.used())),
            ("disk_highwater".into(), self.disk.is_highwater().to_string()),
            ("queries_total".into(), rates.total().to_string()),
            ("queries_per_second".into(), rates.per_second().to_string()),
            ("queries_per_minute".into(), rates.per_minute().to_string()),
            ("txn_created".into(), txns.created.to_string()),
            ("txn_committed".into(), txns.committed.to_string()),
            ("txn_rolled_back".into(), txns.rolled_back.to_string()),
            ("txn_aborted".into(), txns.aborted.to_string()),
            ("txn_active".into(), txns.active.to_string()),
            ("txn_timeouts".into(), txns.timeouts.to_string()),
            ("xa_committed".into(), txns.xa_committed.to_string()),
            ("xa_rolled_back".into(), txns.xa_rolled_back.to_string()),
            ("xa_commit_errors".into(), txns.xa_commit_errors.to_string()),
        ];
        for (backend, pool) in self.scatter.pool_clone() {
            rows.push((
                format!("pool.{backend}"),
                format!(
                    "active={} idle={} max={} borrows={} releases={} waits={} timeouts={} discarded={}",
                    pool.active,
                    pool.idle,
                    pool.max_connections,
                    pool.borrows,
                    pool.releases,
                    pool.waits,
                    pool.timeouts,
                    pool.discarded
                ),
            ));
        }
        result_of(
            &[("Variable_name", FieldType::VarString), ("Value", FieldType::VarString)],
            rows.into_iter().map(|(k, v)| vec![text(k), text(v)]).collect(),
        )
    }

    /// Statements running right now, longest first.
    fn show_queryz(&self) -> QueryResult {
        let mut running: Vec<_> = self.sessions.snapshot().into_iter().filter(|s| s.node.is_some()).collect();
        running.sort_by(|a, b| b.idle.cmp(&a.idle));
        let rows = running
            .into_iter()
            .map(|s| {
                vec![
                    Datum::UInt64(u64::from(s.id)),
                    text(s.host),
                    Datum::UInt64(s.idle.as_millis() as u64),
                    text(s.node.map_or("", |n| n.name())),
                    text(s.info),
                ]
            })
            .collect();
        result_of(
            &[
                ("ConnID", FieldType::LongLong),
                ("Host", FieldType::VarString),
                ("Duration_ms", FieldType::LongLong),
                ("Kind", FieldType::VarString),
                ("Query", FieldType::VarString),
            ],
            rows,
        )
    }

    /// Sessions holding a transaction.
    fn show_txnz(&self) -> QueryResult {
        let rows = self
            .sessions
            .snapshot()
            .into_iter()
            .filter_map(|s| {
                let txn_id = s.txn_id?;
                Some(vec![
                    Datum::UInt64(txn_id),
                    Datum::UInt64(u64::from(s.id)),
                    text(if s.multi_stmt { "multi" } else { "single" }),
                    text(s.node.map_or("idle", |n| n.name())),
                    Datum::UInt64(s.idle.as_millis() as u64),
                ])
            })
            .collect();
        result_of(
            &[
                ("TxnID", FieldType::LongLong),
                ("ConnID", FieldType::LongLong),
                ("Type", FieldType::VarString),
                ("State", FieldType::VarString),
                ("Idle_ms", FieldType::LongLong),
            ],
            rows,
        )
    }

    fn show_versions(&self) -> QueryResult {
        result_of(
            &[("Versions", FieldType::VarString)],
            vec![vec![text(format!("radon {}", env!("CARGO_PKG_VERSION")))]],
        )
    }
}

/// `FROM db` / `IN db` of a SHOW.
fn from_db(sql: &str) -> Option<String> {
    let re = static_regex!(concat!(r"(?is)\s(?:from|in)\s+(", name_re!(), r")"))?;
    re.captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| split_name(m.as_str()).1)
}

fn like_pattern(sql: &str) -> Option<String> {
    let re = static_regex!(r"(?is)\slike\s+'((?:[^'\\]|\\.)*)'")?;
    re.captures(sql).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
}
