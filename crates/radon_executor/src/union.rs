use std::collections::HashSet;

use radon_common::{QueryResult, RadonError, RadonResult, Row};
use radon_planner::UnionNode;

use crate::engine::execute_pair;
use crate::ExecContext;

/// Byte key of a whole row; NULL differs from the empty string.
fn row_key(row: &Row) -> Vec<u8> {
    let mut key = Vec::new();
    for d in row {
        if d.is_null() {
            key.push(0);
            continue;
        }
        let raw = d.raw_bytes();
        key.push(1);
        key.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        key.extend_from_slice(&raw);
    }
    key
}

/// Keep the first occurrence of every row, in order.
pub fn distinct(rows: Vec<Row>) -> Vec<Row> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter().filter(|r| seen.insert(row_key(r))).collect()
}

/// Concatenate both sides; the left side names the columns.
pub fn execute(ctx: &ExecContext, node: &UnionNode) -> RadonResult<QueryResult> {
    let (mut left, right) = execute_pair(ctx, &node.left, &node.right)?;
    if left.fields.len() != right.fields.len() {
        return Err(RadonError::Unsupported(
            "unsupported: the used 'select' statements have a different number of columns".into(),
        ));
    }
    left.rows.extend(right.rows);
    if node.distinct {
        left.rows = distinct(std::mem::take(&mut left.rows));
    }
    Ok(left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use radon_common::Datum;

    #[test]
    fn test_distinct_keeps_first_seen_order() {
        let rows = vec![
            vec![Datum::Int64(2), "b".into()],
            vec![Datum::Int64(1), "a".into()],
            vec![Datum::Int64(2), "b".into()],
            vec![Datum::Int64(1), Datum::Null],
            vec![Datum::Int64(1), "".into()],
            vec![Datum::Int64(1), Datum::Null],
        ];
        let out = distinct(rows);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0][1], Datum::from("b"));
        assert!(out[2][1].is_null());
        assert_eq!(out[3][1], Datum::from(""));
    }

    #[test]
    fn test_row_key_boundaries() {
        let a = vec![Datum::from("ab"), Datum::from("c")];
        let b = vec![Datum::from("a"), Datum::from("bc")];
        assert_ne!(row_key(&a), row_key(&b));
    }
}
