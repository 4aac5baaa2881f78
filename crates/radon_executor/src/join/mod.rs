//! Cross-shard joins.
//!
//! Every strategy funnels its pairs through [`emit_left`], which owns the
//! LEFT JOIN rules: a left row without a passing partner is padded with
//! NULLs unless a null-rejecting filter sits on the right side.

pub mod bn_join;
pub mod cartesian;
pub mod filter;
pub mod merge_join;
pub mod nested_loop;

use radon_common::{Datum, Field, QueryResult, RadonError, RadonResult, Row};
use radon_planner::{JoinNode, JoinStrategy};

use crate::engine::execute_pair;
use crate::ExecContext;

/// Output rows of one join level, capped at the session's join limit.
pub(crate) struct Output {
    pub rows: Vec<Row>,
    limit: usize,
}

impl Output {
    pub fn new(limit: usize) -> Self {
        Self {
            rows: Vec::new(),
            limit,
        }
    }

    fn check(&self) -> RadonResult<()> {
        if self.rows.len() > self.limit {
            return Err(RadonError::Unsupported(format!(
                "unsupported: join.row.count.exceeded.allowed.limit.of.'{}'",
                self.limit
            )));
        }
        Ok(())
    }

    pub fn push(&mut self, row: Row) -> RadonResult<()> {
        self.rows.push(row);
        self.check()
    }

    pub fn extend(&mut self, rows: Vec<Row>) -> RadonResult<()> {
        self.rows.extend(rows);
        self.check()
    }
}

/// Signed-index projection of a joined pair; a missing right row reads as NULLs.
pub fn join_rows(left: &Row, right: Option<&Row>, cols: &[isize]) -> Row {
    cols.iter()
        .map(|&c| {
            if c < 0 {
                left.get((-c - 1) as usize).cloned()
            } else {
                right.and_then(|r| r.get((c - 1) as usize)).cloned()
            }
            .unwrap_or(Datum::Null)
        })
        .collect()
}

fn join_fields(left: &[Field], right: &[Field], cols: &[isize]) -> Vec<Field> {
    cols.iter()
        .map(|&c| {
            if c < 0 {
                left.get((-c - 1) as usize)
            } else {
                right.get((c - 1) as usize)
            }
            .cloned()
            .unwrap_or_default()
        })
        .collect()
}

/// Emit `left` paired with every passing candidate, or its padded form.
pub(crate) fn emit_left<'r>(
    node: &JoinNode,
    left: &Row,
    candidates: impl IntoIterator<Item = &'r Row>,
    out: &mut Vec<Row>,
) {
    let mut matched = false;
    if filter::left_joinable(node, left) {
        for right in candidates {
            if filter::pair_matches(node, left, right) {
                out.push(join_rows(left, Some(right), &node.cols));
                matched = true;
            }
        }
    }
    if !matched {
        emit_unmatched(node, left, out);
    }
}

pub(crate) fn emit_unmatched(node: &JoinNode, left: &Row, out: &mut Vec<Row>) {
    if node.is_left_join && !node.has_right_filter {
        out.push(join_rows(left, None, &node.cols));
    }
}

pub fn execute(ctx: &ExecContext, node: &JoinNode) -> RadonResult<QueryResult> {
    let mut out = Output::new(ctx.max_join_rows());
    let (left_fields, right_fields, method) = match node.strategy {
        JoinStrategy::NestedLoop => {
            let (l, r) = nested_loop::execute(ctx, node, &mut out)?;
            (l, r, "nested_loop")
        }
        JoinStrategy::Cartesian => {
            let (l, r) = execute_pair(ctx, &node.left, &node.right)?;
            cartesian::join(node, &l.rows, &r.rows, &mut out)?;
            (l.fields, r.fields, "cartesian")
        }
        JoinStrategy::SortMerge => {
            let (l, r) = execute_pair(ctx, &node.left, &node.right)?;
            let method = if l.rows.len() <= node.row_num_limit || r.rows.len() <= node.row_num_limit {
                bn_join::join(node, &l.rows, &r.rows, &mut out)?;
                "bn_join"
            } else {
                merge_join::join(node, l.rows, r.rows, ctx.join_workers, &mut out)?;
                "merge_join"
            };
            (l.fields, r.fields, method)
        }
    };
    metrics::counter!("radon_executor_join_total", "method" => method).increment(1);
    tracing::debug!(
        txn_id = ctx.txn.id(),
        method,
        rows = out.rows.len(),
        left_join = node.is_left_join,
        "executor: join"
    );
    Ok(QueryResult::new(join_fields(&left_fields, &right_fields, &node.cols), out.rows))
}

#[cfg(test)]
pub(crate) mod testutil {
    use radon_common::Datum;
    use radon_planner::{JoinNode, JoinStrategy, MergeNode, PlanNode};

    pub fn node(left_keys: Vec<usize>, right_keys: Vec<usize>, cols: Vec<isize>) -> JoinNode {
        JoinNode {
            left: PlanNode::Merge(MergeNode::new(Vec::new())),
            right: PlanNode::Merge(MergeNode::new(Vec::new())),
            left_keys,
            right_keys,
            cols,
            left_tmp_cols: Vec::new(),
            right_tmp_cols: Vec::new(),
            cmp_filters: Vec::new(),
            is_left_join: false,
            has_right_filter: false,
            strategy: JoinStrategy::SortMerge,
            row_num_limit: 0,
            nested_loop: None,
            children: Vec::new(),
        }
    }

    pub fn rows(vals: &[&[Option<i64>]]) -> Vec<Vec<Datum>> {
        vals.iter()
            .map(|r| r.iter().map(|v| v.map_or(Datum::Null, Datum::Int64)).collect())
            .collect()
    }

    /// Rows as sorted strings, for order-insensitive comparison.
    pub fn sorted(rows: &[Vec<Datum>]) -> Vec<String> {
        let mut v: Vec<String> = rows
            .iter()
            .map(|r| r.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(","))
            .collect();
        v.sort();
        v
    }
}
