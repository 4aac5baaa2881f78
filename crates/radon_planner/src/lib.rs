//! Turns one client statement into a shard-aware [`Plan`].
//!
//! The planner parses with `sqlparser`'s MySQL dialect, resolves every table
//! through the [`Router`], rewrites logical names to physical ones and
//! decides how the coordinator must finish the job (merge, join, union,
//! aggregate, sort, limit). It never talks to a backend.

pub mod ddl;
pub mod dml;
pub mod expr;
pub mod join;
pub mod plan;
pub mod route;
pub mod select;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use radon_common::{RadonError, RadonResult};
use radon_router::Router;
use sqlparser::ast::Statement;

pub use expr::parse_one;
pub use plan::*;

/// Hash join is chosen when one side has at most this many rows.
pub const DEFAULT_ROW_NUM_LIMIT: usize = 1024;

pub struct Planner {
    router: Arc<dyn Router>,
    row_num_limit: usize,
}

impl Planner {
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self {
            router,
            row_num_limit: DEFAULT_ROW_NUM_LIMIT,
        }
    }

    pub fn with_row_num_limit(mut self, limit: usize) -> Self {
        self.row_num_limit = limit;
        self
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Parse and plan `sql` against the session database `db`.
    pub fn build(&self, db: &str, sql: &str) -> RadonResult<Plan> {
        let stmt = parse_one(sql)?;
        self.build_statement(db, sql, &stmt)
    }

    pub fn build_statement(&self, db: &str, sql: &str, stmt: &Statement) -> RadonResult<Plan> {
        let plan = match stmt {
            Statement::Query(q) => {
                let root = self.plan_query(db, q)?;
                let is_union = matches!(root, PlanNode::Union(_));
                let plan = SelectPlan {
                    raw_query: sql.to_string(),
                    root,
                };
                if is_union {
                    Plan::Union(plan)
                } else {
                    Plan::Select(plan)
                }
            }
            Statement::Insert(ins) => self.build_insert(db, sql, ins)?,
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => self.build_update(db, sql, stmt, table, assignments, from.is_some(), selection.as_ref())?,
            Statement::Delete(del) => self.build_delete(db, sql, del)?,
            other => {
                return Err(RadonError::Unsupported(format!(
                    "unsupported: statement {}",
                    statement_head(other)
                )))
            }
        };
        tracing::debug!(db, kind = plan.kind(), fragments = plan.querys().len(), "planner: statement planned");
        Ok(plan)
    }

    /// `EXPLAIN` output: the plan as pretty JSON.
    pub fn explain(&self, db: &str, sql: &str, stmt: &Statement) -> RadonResult<String> {
        let plan = self.build_statement(db, sql, stmt)?;
        Ok(serde_json::to_string_pretty(&plan)?)
    }
}

/// First words of a statement, for error messages.
fn statement_head(stmt: &Statement) -> String {
    stmt.to_string().split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}
