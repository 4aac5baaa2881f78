use radon_common::{QueryResult, RadonResult, RequestContext, TxnMode};
use radon_planner::MergeNode;

use crate::ExecContext;

/// Dispatch a merge leaf; rows come back in fragment order.
pub fn execute(ctx: &ExecContext, node: &MergeNode) -> RadonResult<QueryResult> {
    let req = RequestContext {
        mode: node.mode,
        txn_mode: TxnMode::Read,
        querys: node.querys.clone(),
        raw_query: node.raw_query.clone(),
    };
    ctx.txn.execute(&req)
}
