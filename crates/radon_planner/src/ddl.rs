//! DDL and maintenance statements fanned out per physical table.
//!
//! The MySQL DDL surface is wider than what the parser accepts, so table
//! statements are rewritten textually: the first table reference after
//! `TABLE [IF [NOT] EXISTS]` (or after `ON` for index statements) becomes
//! `` `db`.`physical` ``.

use regex::Regex;

use radon_common::{QueryTuple, RadonError, RadonResult};

use crate::plan::{Plan, ShardPlan};
use crate::Planner;

const NAME: &str = r"(?:`[^`]+`|[\w$]+)(?:\s*\.\s*(?:`[^`]+`|[\w$]+))?";

fn anchor_pattern(sql: &str) -> String {
    let index_stmt = Regex::new(r"(?is)^\s*(?:create\s+(?:unique\s+|fulltext\s+|spatial\s+)?|drop\s+)index\b")
        .map(|re| re.is_match(sql))
        .unwrap_or(false);
    if index_stmt {
        format!(r"(?is)^(.*?\bon\s+)({NAME})")
    } else {
        format!(
            r"(?is)^(\s*(?:/\*.*?\*/\s*)*\w+(?:\s+(?:temporary|no_write_to_binlog|local))?\s+(?:tables?\s+)?(?:if\s+(?:not\s+)?exists\s+)?)({NAME})"
        )
    }
}

/// Replace the table named in `sql` with `` `db`.`physical` ``.
pub fn rewrite_table_name(sql: &str, db: &str, physical: &str) -> RadonResult<String> {
    let re = Regex::new(&anchor_pattern(sql)).map_err(|e| RadonError::Internal(format!("ddl pattern: {e}")))?;
    let caps = re
        .captures(sql)
        .ok_or_else(|| RadonError::Unsupported(format!("unsupported: cannot locate table name in {sql}")))?;
    let (Some(head), Some(name)) = (caps.get(1), caps.get(2)) else {
        return Err(RadonError::Unsupported(format!("unsupported: cannot locate table name in {sql}")));
    };
    Ok(format!(
        "{}`{db}`.`{physical}`{}",
        head.as_str(),
        &sql[name.end()..]
    ))
}

impl Planner {
    fn fan_out(&self, db: &str, table: &str, sql: &str) -> RadonResult<Vec<QueryTuple>> {
        self.router.database_acl(db)?;
        let cfg = self.router.table_config(db, table)?;
        cfg.segments()
            .into_iter()
            .map(|seg| {
                Ok(QueryTuple {
                    query: rewrite_table_name(sql, db, &seg.table)?,
                    backend: seg.backend,
                    range: seg.range,
                })
            })
            .collect()
    }

    /// `ALTER`, `TRUNCATE`, `CREATE/DROP INDEX` and the per-table half of
    /// `CREATE/DROP TABLE`: one fragment per physical table.
    pub fn build_table_ddl(&self, db: &str, table: &str, sql: &str) -> RadonResult<Plan> {
        let querys = self.fan_out(db, table, sql)?;
        tracing::debug!(db, table, fragments = querys.len(), "planner: ddl fan-out");
        Ok(Plan::Ddl(ShardPlan::normal(sql, querys)))
    }

    /// `CREATE/DROP DATABASE`: the statement as written, on every backend.
    pub fn build_database_ddl(&self, sql: &str) -> Plan {
        Plan::Ddl(ShardPlan::scatter(sql))
    }

    /// `OPTIMIZE`, `CHECK` and `CHECKSUM TABLE`.
    pub fn build_others(&self, db: &str, table: &str, sql: &str) -> RadonResult<Plan> {
        let querys = self.fan_out(db, table, sql)?;
        Ok(Plan::Others(ShardPlan::normal(sql, querys)))
    }
}
