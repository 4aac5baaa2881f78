//! Post-processing over a merged result.

pub mod aggregate;
pub mod limit;
pub mod orderby;

use radon_common::{QueryResult, RadonResult};
use radon_planner::SubPlan;

/// Run `plans` in order; each consumes the previous result.
pub fn apply(mut result: QueryResult, plans: &[SubPlan]) -> RadonResult<QueryResult> {
    for plan in plans {
        result = match plan {
            SubPlan::Aggregate(p) => aggregate::execute(result, p)?,
            SubPlan::OrderBy(p) => orderby::execute(result, p)?,
            SubPlan::Limit(p) => limit::execute(result, p),
        };
    }
    Ok(result)
}
