use radon_common::result::SortKey;
use radon_common::{QueryResult, RadonError, RadonResult};
use radon_planner::OrderByPlan;

/// Resolve every key against the result's fields, then sort once.
pub fn execute(mut result: QueryResult, plan: &OrderByPlan) -> RadonResult<QueryResult> {
    let keys = plan
        .keys
        .iter()
        .map(|k| {
            let index = result.field_index(&k.table, &k.field).ok_or_else(|| {
                let name = if k.table.is_empty() {
                    k.field.clone()
                } else {
                    format!("{}.{}", k.table, k.field)
                };
                RadonError::Unsupported(format!("unsupported: can.not.find.the.orderby.field[{name}]"))
            })?;
            Ok(SortKey {
                index,
                direction: k.direction,
            })
        })
        .collect::<RadonResult<Vec<_>>>()?;
    result.sort(&keys);
    Ok(result)
}
