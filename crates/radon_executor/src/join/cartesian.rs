use radon_common::{RadonResult, Row};
use radon_planner::JoinNode;

use super::{emit_left, Output};

/// Every left row against every right row; only the comparison filters prune.
pub(crate) fn join(node: &JoinNode, left: &[Row], right: &[Row], out: &mut Output) -> RadonResult<()> {
    for l in left {
        let mut rows = Vec::new();
        emit_left(node, l, right, &mut rows);
        out.extend(rows)?;
    }
    Ok(())
}
