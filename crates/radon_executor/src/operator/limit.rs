use radon_common::QueryResult;
use radon_planner::LimitPlan;

pub fn execute(mut result: QueryResult, plan: &LimitPlan) -> QueryResult {
    result.limit(plan.offset, plan.count);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use radon_common::{Datum, Field, FieldType};

    fn rows(n: i64) -> QueryResult {
        QueryResult::new(
            vec![Field::new("a", FieldType::LongLong)],
            (0..n).map(|i| vec![Datum::Int64(i)]).collect(),
        )
    }

    #[test]
    fn test_limit_clamps() {
        for (offset, count, n, want) in [(0, 3, 5, 3), (4, 3, 5, 1), (9, 3, 5, 0), (0, usize::MAX, 5, 5), (2, 0, 5, 0)] {
            let r = execute(rows(n), &LimitPlan { offset, count });
            assert_eq!(r.rows.len(), want, "limit {offset},{count} over {n}");
        }
        let r = execute(rows(5), &LimitPlan { offset: 3, count: 10 });
        assert_eq!(r.rows, vec![vec![Datum::Int64(3)], vec![Datum::Int64(4)]]);
    }
}
