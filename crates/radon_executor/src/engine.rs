//! Walks a [`PlanNode`] tree.

use radon_common::{QueryResult, RadonResult};
use radon_planner::PlanNode;

use crate::{join, merge, operator, union, ExecContext};

/// Execute `node` and its sub-plans.
pub fn execute(ctx: &ExecContext, node: &PlanNode) -> RadonResult<QueryResult> {
    let result = match node {
        PlanNode::Merge(m) => merge::execute(ctx, m)?,
        PlanNode::Join(j) => join::execute(ctx, j)?,
        PlanNode::Union(u) => union::execute(ctx, u)?,
    };
    operator::apply(result, node.children())
}

/// Execute two subtrees in parallel; the first error wins.
pub(crate) fn execute_pair(
    ctx: &ExecContext,
    left: &PlanNode,
    right: &PlanNode,
) -> RadonResult<(QueryResult, QueryResult)> {
    let (l, r) = std::thread::scope(|s| {
        let right = s.spawn(|| execute(ctx, right));
        let left = execute(ctx, left);
        let right = right
            .join()
            .unwrap_or_else(|_| Err(radon_common::RadonError::Internal("join side panicked".into())));
        (left, right)
    });
    Ok((l?, r?))
}
