//! DDL front desk: the router is updated first, then the statement is
//! fanned out to the physical tables; a failed fan-out rolls the router
//! back where that is possible.

use std::sync::Arc;

use radon_common::config::BackendRole;
use radon_common::error::codes;
use radon_common::{QueryResult, RadonError, RadonResult};
use radon_executor::tree::execute_plan;
use radon_executor::ExecContext;
use radon_planner::{parse_one, Plan};
use radon_router::{ShardType, TableExtra};
use sqlparser::ast::{ColumnOption, Statement, TableConstraint};

use crate::classify::StmtKind;
use crate::session::Session;
use crate::spanner::{split_top_level, Spanner};
use crate::split_name;

/// How a new table is laid out, from the tail of its `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distribution {
    Hash { key: String },
    List { key: String, partitions: Vec<(String, Vec<String>)> },
    Global,
    /// `None` places the table on the first backend.
    Single { backend: Option<String> },
}

/// A `CREATE TABLE` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    pub db: Option<String>,
    pub table: String,
    pub if_not_exists: bool,
    pub distribution: Distribution,
    /// The statement without the distribution suffix, as sent to backends.
    pub body: String,
}

fn syntax_error(sql: &str) -> RadonError {
    RadonError::Parse(format!("You have an error in your SQL syntax near '{sql}'"))
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches(|c| c == '`' || c == '\'' || c == '"').to_string()
}

/// Byte offset just past the parenthesis that closes the one at `open`.
fn closing_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s[open..].char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(open + i + 1);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

fn parse_list_partitions(defs: &str) -> RadonResult<Vec<(String, Vec<String>)>> {
    let re = static_regex!(r"(?is)^\s*partition\s+(`[^`]+`|[\w$-]+)\s+values\s+in\s*\((.*)\)\s*$")
        .ok_or_else(|| RadonError::Internal("list partition pattern".into()))?;
    split_top_level(defs, ',')
        .into_iter()
        .map(|def| {
            let caps = re.captures(&def).ok_or_else(|| syntax_error(&def))?;
            let backend = unquote(caps.get(1).map_or("", |m| m.as_str()));
            let values: Vec<String> = split_top_level(caps.get(2).map_or("", |m| m.as_str()), ',')
                .iter()
                .map(|v| unquote(v))
                .collect();
            if values.is_empty() {
                return Err(RadonError::Unsupported(format!(
                    "unsupported: list partition on backend {backend} has no values"
                )));
            }
            Ok((backend, values))
        })
        .collect()
}

/// Split a `CREATE TABLE` into name, options and distribution.
pub fn parse_create_table(sql: &str) -> RadonResult<CreateTable> {
    let head = static_regex!(concat!(
        r"(?is)^\s*create\s+(temporary\s+)?table\s+(if\s+not\s+exists\s+)?(",
        name_re!(),
        r")"
    ))
    .ok_or_else(|| RadonError::Internal("create table pattern".into()))?;
    let caps = head.captures(sql).ok_or_else(|| syntax_error(sql))?;
    if caps.get(1).is_some() {
        return Err(RadonError::Unsupported("unsupported: temporary tables".into()));
    }
    let if_not_exists = caps.get(2).is_some();
    let name = caps.get(3).ok_or_else(|| syntax_error(sql))?;
    let (db, table) = split_name(name.as_str());

    let body_end = match sql[name.end()..].find(|c: char| !c.is_whitespace()) {
        Some(off) if sql[name.end() + off..].starts_with('(') => {
            closing_paren(sql, name.end() + off).ok_or_else(|| syntax_error(sql))?
        }
        _ => name.end(),
    };
    let (columns, tail) = sql.split_at(body_end);

    let hash = static_regex!(r"(?is)\s*partition\s+by\s+hash\s*\(\s*(`[^`]+`|[\w$]+)\s*\)(?:\s+partitions\s+\d+)?\s*$");
    let list = static_regex!(r"(?is)\s*partition\s+by\s+list\s*\(\s*(`[^`]+`|[\w$]+)\s*\)\s*\((.*)\)\s*$");
    let distributed = static_regex!(r"(?is)\s*distributed\s+by\s*\(\s*(`[^`]+`|[\w$-]+)\s*\)\s*$");
    let global = static_regex!(r"(?is)\s*\bglobal\s*$");
    let single = static_regex!(r"(?is)\s*\bsingle\s*$");
    let (Some(hash), Some(list), Some(distributed), Some(global), Some(single)) = (hash, list, distributed, global, single)
    else {
        return Err(RadonError::Internal("distribution pattern".into()));
    };

    let (distribution, options) = if let Some(c) = hash.captures(tail) {
        let key = unquote(c.get(1).map_or("", |m| m.as_str()));
        (Distribution::Hash { key }, &tail[..c.get(0).map_or(tail.len(), |m| m.start())])
    } else if let Some(c) = list.captures(tail) {
        let key = unquote(c.get(1).map_or("", |m| m.as_str()));
        let partitions = parse_list_partitions(c.get(2).map_or("", |m| m.as_str()))?;
        (Distribution::List { key, partitions }, &tail[..c.get(0).map_or(tail.len(), |m| m.start())])
    } else if let Some(c) = distributed.captures(tail) {
        let backend = unquote(c.get(1).map_or("", |m| m.as_str()));
        (
            Distribution::Single { backend: Some(backend) },
            &tail[..c.get(0).map_or(tail.len(), |m| m.start())],
        )
    } else if let Some(m) = global.find(tail) {
        (Distribution::Global, &tail[..m.start()])
    } else if let Some(m) = single.find(tail) {
        (Distribution::Single { backend: None }, &tail[..m.start()])
    } else {
        (Distribution::Single { backend: None }, tail)
    };

    Ok(CreateTable {
        db,
        table,
        if_not_exists,
        distribution,
        body: format!("{columns}{}", options.trim_end()),
    })
}

/// Every primary or unique key of a hash table must contain the shard key.
pub fn check_unique_keys(body: &str, key: &str) -> RadonResult<()> {
    let stmt = parse_one(body)?;
    let Statement::CreateTable(ct) = stmt else {
        return Err(RadonError::Internal("expected a CREATE TABLE".into()));
    };
    if !ct.columns.iter().any(|c| c.name.value.eq_ignore_ascii_case(key)) {
        return Err(RadonError::Unsupported(format!(
            "unsupported: sharding key column[{key}] does not exist"
        )));
    }
    let violation = |cols: &str| {
        RadonError::Unsupported(format!(
            "unsupported: the unique/primary constraint on ({cols}) should include the sharding key column[{key}]"
        ))
    };
    for col in &ct.columns {
        let unique = col
            .options
            .iter()
            .any(|o| matches!(o.option, ColumnOption::Unique { .. }));
        if unique && !col.name.value.eq_ignore_ascii_case(key) {
            return Err(violation(&col.name.value));
        }
    }
    for constraint in &ct.constraints {
        let columns = match constraint {
            TableConstraint::Unique { columns, .. } | TableConstraint::PrimaryKey { columns, .. } => columns,
            _ => continue,
        };
        if !columns.iter().any(|c| c.value.eq_ignore_ascii_case(key)) {
            let names: Vec<&str> = columns.iter().map(|c| c.value.as_str()).collect();
            return Err(violation(&names.join(", ")));
        }
    }
    Ok(())
}

impl Spanner {
    pub(crate) fn handle_ddl(&self, session: &dyn Session, kind: StmtKind, sql: &str) -> RadonResult<QueryResult> {
        if self.multi_stmt_txn(session.id()).is_some() {
            return Err(RadonError::Unsupported(
                "unsupported: DDL inside a transaction".into(),
            ));
        }
        match kind {
            StmtKind::CreateDatabase => self.create_database(session, sql),
            StmtKind::DropDatabase => self.drop_database(session, sql),
            StmtKind::CreateTable => self.create_table(session, sql),
            StmtKind::DropTable => self.drop_tables(session, sql),
            StmtKind::Alter => self.alter_table(session, sql),
            StmtKind::CreateIndex | StmtKind::DropIndex | StmtKind::Truncate => self.index_or_truncate(session, kind, sql),
            other => Err(RadonError::Internal(format!("{other} is not DDL"))),
        }
    }

    /// Run one DDL plan under the DDL timeout, bound to the session.
    fn run_ddl(&self, session: &dyn Session, kind: StmtKind, sql: &str, plan: Plan) -> RadonResult<QueryResult> {
        let txn = self.new_txn(self.conf.ddl_timeout_ms)?;
        self.sessions.txn_binding(session.id(), &txn, kind, sql);
        let ctx = ExecContext::new(Arc::clone(&txn)).with_join_workers(self.conf.join_workers);
        let outcome = execute_plan(&ctx, &plan);
        txn.finish();
        self.sessions.txn_unbinding(session.id());
        outcome
    }

    /// Database and table a possibly qualified name refers to.
    fn resolve(&self, session: &dyn Session, raw: &str) -> RadonResult<(String, String)> {
        let (qualifier, table) = split_name(raw);
        let db = qualifier.unwrap_or_else(|| session.schema());
        self.router.database_acl(&db)?;
        self.router.check_database(&db)?;
        Ok((db, table))
    }

    fn normal_backends(&self) -> Vec<String> {
        self.scatter
            .backend_configs_clone()
            .into_iter()
            .filter(|c| c.role == BackendRole::Normal)
            .map(|c| c.name)
            .collect()
    }

    // ── Databases ──

    fn create_database(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(
            r"(?is)^\s*create\s+(?:database|schema)\s+(if\s+not\s+exists\s+)?(",
            name_re!(),
            r")"
        ))
        .ok_or_else(|| RadonError::Internal("create database pattern".into()))?;
        let caps = re.captures(sql).ok_or_else(|| syntax_error(sql))?;
        let if_not_exists = caps.get(1).is_some();
        let (_, db) = split_name(caps.get(2).map_or("", |m| m.as_str()));
        self.router.database_acl(&db)?;

        let created = match self.router.create_database(&db) {
            Ok(()) => true,
            Err(e) if if_not_exists && e.is_backend_code(codes::ER_DB_CREATE_EXISTS) => false,
            Err(e) => return Err(e),
        };
        let plan = self.planner.build_database_ddl(sql);
        match self.run_ddl(session, StmtKind::CreateDatabase, sql, plan) {
            Ok(r) => {
                tracing::info!(db = %db, "database created");
                Ok(r)
            }
            Err(e) => {
                if created {
                    if let Err(re) = self.router.drop_database(&db) {
                        tracing::error!(db = %db, error = %re, "router rollback of failed CREATE DATABASE failed");
                    }
                }
                Err(e)
            }
        }
    }

    fn drop_database(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(
            r"(?is)^\s*drop\s+(?:database|schema)\s+(if\s+exists\s+)?(",
            name_re!(),
            r")"
        ))
        .ok_or_else(|| RadonError::Internal("drop database pattern".into()))?;
        let caps = re.captures(sql).ok_or_else(|| syntax_error(sql))?;
        let if_exists = caps.get(1).is_some();
        let (_, db) = split_name(caps.get(2).map_or("", |m| m.as_str()));
        self.router.database_acl(&db)?;

        match self.router.drop_database(&db) {
            Ok(()) => {}
            Err(e) if if_exists && e.is_backend_code(codes::ER_DB_DROP_EXISTS) => {}
            Err(e) => return Err(e),
        }
        let plan = self.planner.build_database_ddl(sql);
        let out = self.run_ddl(session, StmtKind::DropDatabase, sql, plan)?;
        tracing::info!(db = %db, "database dropped");
        Ok(out)
    }

    // ── Tables ──

    fn create_table(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let ct = parse_create_table(sql)?;
        let db = ct.db.clone().unwrap_or_else(|| session.schema());
        self.router.database_acl(&db)?;
        self.router.check_database(&db)?;
        let backends = self.normal_backends();

        let registered = match &ct.distribution {
            Distribution::Hash { key } => {
                check_unique_keys(&ct.body, key)?;
                self.router
                    .create_table(&db, &ct.table, key, ShardType::Hash, &backends, &TableExtra::default())
            }
            Distribution::List { key, partitions } => {
                let extra = TableExtra {
                    list_partitions: partitions.clone(),
                };
                self.router.create_table(&db, &ct.table, key, ShardType::List, &backends, &extra)
            }
            Distribution::Global => {
                self.router
                    .create_non_part_table(&db, &ct.table, ShardType::Global, &backends, &TableExtra::default())
            }
            Distribution::Single { backend: Some(b) } => {
                if !backends.contains(b) {
                    return Err(RadonError::Unsupported(format!(
                        "unsupported: backend[{b}] does not exist"
                    )));
                }
                self.router.create_non_part_table(
                    &db,
                    &ct.table,
                    ShardType::Single,
                    std::slice::from_ref(b),
                    &TableExtra::default(),
                )
            }
            Distribution::Single { backend: None } => {
                self.router
                    .create_non_part_table(&db, &ct.table, ShardType::Single, &backends, &TableExtra::default())
            }
        };
        let registered = match registered {
            Ok(()) => true,
            Err(e) if ct.if_not_exists && e.is_backend_code(codes::ER_TABLE_EXISTS_ERROR) => false,
            Err(e) => return Err(e),
        };

        let outcome = self
            .planner
            .build_table_ddl(&db, &ct.table, &ct.body)
            .and_then(|plan| self.run_ddl(session, StmtKind::CreateTable, sql, plan));
        match outcome {
            Ok(r) => {
                tracing::info!(db = %db, table = %ct.table, distribution = ?ct.distribution, "table created");
                Ok(r)
            }
            Err(e) => {
                if registered {
                    tracing::warn!(db = %db, table = %ct.table, error = %e, "CREATE TABLE failed on a backend, dropping router entry");
                    if let Err(re) = self.router.drop_table(&db, &ct.table) {
                        tracing::error!(db = %db, table = %ct.table, error = %re, "router rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// `DROP TABLE a, b`: each table on its own; the first error is reported
    /// after all were tried.
    fn drop_tables(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(
            r"(?is)^\s*drop\s+(temporary\s+)?tables?\s+(if\s+exists\s+)?(.+?)(\s+(?:restrict|cascade))?\s*$"
        )
        .ok_or_else(|| RadonError::Internal("drop table pattern".into()))?;
        let caps = re.captures(sql).ok_or_else(|| syntax_error(sql))?;
        if caps.get(1).is_some() {
            return Err(RadonError::Unsupported("unsupported: temporary tables".into()));
        }
        let if_exists = caps.get(2).is_some();
        let mut first_err: Option<RadonError> = None;
        for raw in split_top_level(caps.get(3).map_or("", |m| m.as_str()), ',') {
            let outcome = self.resolve(session, &raw).and_then(|(db, table)| {
                if let Err(e) = self.router.check_table(&db, &table) {
                    return if if_exists { Ok(()) } else { Err(e) };
                }
                let stmt = format!("DROP TABLE IF EXISTS {raw}");
                let plan = self.planner.build_table_ddl(&db, &table, &stmt)?;
                self.run_ddl(session, StmtKind::DropTable, &stmt, plan)?;
                self.router.drop_table(&db, &table)?;
                tracing::info!(db = %db, table = %table, "table dropped");
                Ok(())
            });
            if let Err(e) = outcome {
                tracing::warn!(table = %raw, error = %e, "DROP TABLE failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(QueryResult::default()),
        }
    }

    fn alter_table(&self, session: &dyn Session, sql: &str) -> RadonResult<QueryResult> {
        let re = static_regex!(concat!(
            r"(?is)^\s*alter\s+(?:(?:online|ignore)\s+)*table\s+(",
            name_re!(),
            r")\s*(.*)$"
        ))
        .ok_or_else(|| RadonError::Internal("alter pattern".into()))?;
        let caps = re.captures(sql).ok_or_else(|| syntax_error(sql))?;
        let (db, table) = self.resolve(session, caps.get(1).map_or("", |m| m.as_str()))?;
        let key = self.router.shard_key(&db, &table)?;

        if !key.is_empty() {
            let action = static_regex!(r"(?is)^\s*(?:drop|modify|change)\s+(?:column\s+)?(`[^`]+`|[\w$]+)")
                .ok_or_else(|| RadonError::Internal("alter action pattern".into()))?;
            for spec in split_top_level(caps.get(2).map_or("", |m| m.as_str()), ',') {
                let touches_key = action
                    .captures(&spec)
                    .and_then(|c| c.get(1))
                    .is_some_and(|col| unquote(col.as_str()).eq_ignore_ascii_case(&key));
                if touches_key {
                    return Err(RadonError::Unsupported(format!(
                        "unsupported: cannot drop or modify the sharding key column[{key}]"
                    )));
                }
            }
        }
        let plan = self.planner.build_table_ddl(&db, &table, sql)?;
        self.run_ddl(session, StmtKind::Alter, sql, plan)
    }

    fn index_or_truncate(&self, session: &dyn Session, kind: StmtKind, sql: &str) -> RadonResult<QueryResult> {
        let re = match kind {
            StmtKind::Truncate => static_regex!(concat!(r"(?is)^\s*truncate\s+(?:table\s+)?(", name_re!(), r")")),
            _ => static_regex!(concat!(r"(?is)\bon\s+(", name_re!(), r")")),
        }
        .ok_or_else(|| RadonError::Internal("table name pattern".into()))?;
        let raw = re
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| syntax_error(sql))?;
        let (db, table) = self.resolve(session, raw)?;
        let plan = self.planner.build_table_ddl(&db, &table, sql)?;
        self.run_ddl(session, kind, sql, plan)
    }
}
