//! Row-level predicates evaluated after the shards have answered.

use std::cmp::Ordering;

use radon_common::datum::cmp_datum;
use radon_common::{Datum, Row};
use radon_planner::{CmpFilter, CmpOp, JoinNode};

static NULL: Datum = Datum::Null;

pub(crate) fn cell(row: &Row, index: usize) -> &Datum {
    row.get(index).unwrap_or(&NULL)
}

/// SQL three-valued comparison collapsed to pass/fail; only `<=>` passes on NULL.
pub fn compare(op: CmpOp, a: &Datum, b: &Datum) -> bool {
    if op == CmpOp::NullSafeEq {
        return match (a.is_null(), b.is_null()) {
            (true, true) => true,
            (false, false) => cmp_datum(a, b) == Ordering::Equal,
            _ => false,
        };
    }
    if a.is_null() || b.is_null() {
        return false;
    }
    let ord = cmp_datum(a, b);
    match op {
        CmpOp::Eq | CmpOp::NullSafeEq => ord.is_eq(),
        CmpOp::Ne => ord.is_ne(),
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
    }
}

pub fn filter_passes(f: &CmpFilter, left: &Row, right: &Row) -> bool {
    let (l, r) = (cell(left, f.left), cell(right, f.right));
    if f.exchange {
        compare(f.op, r, l)
    } else {
        compare(f.op, l, r)
    }
}

/// A left row whose tmp columns are not all true failed its ON predicates.
pub fn left_joinable(node: &JoinNode, left: &Row) -> bool {
    node.left_tmp_cols.iter().all(|&i| cell(left, i).is_true())
}

/// Rows carrying a value in a right tmp column only describe the schema.
pub fn right_sentinel(node: &JoinNode, right: &Row) -> bool {
    node.right_tmp_cols.iter().any(|&i| !cell(right, i).is_null())
}

pub fn has_null_key(row: &Row, keys: &[usize]) -> bool {
    keys.iter().any(|&k| cell(row, k).is_null())
}

/// Compare a left key tuple with a right key tuple.
pub fn cmp_keys(left: &Row, left_keys: &[usize], right: &Row, right_keys: &[usize]) -> Ordering {
    for (&l, &r) in left_keys.iter().zip(right_keys) {
        let ord = cmp_datum(cell(left, l), cell(right, r));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Whether `right` may be paired with `left` once their keys matched.
pub fn pair_matches(node: &JoinNode, left: &Row, right: &Row) -> bool {
    !right_sentinel(node, right) && node.cmp_filters.iter().all(|f| filter_passes(f, left, right))
}

/// Byte key for hashing a key tuple; `None` when any part is NULL.
///
/// Each datum is tagged and length-prefixed so that adjacent values cannot
/// run together. Numbers use one canonical spelling across representations.
pub fn hash_key(row: &Row, keys: &[usize]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(keys.len() * 10);
    for &k in keys {
        let d = cell(row, k);
        let (tag, body) = match d {
            Datum::Null => return None,
            Datum::Int64(v) => (b'n', v.to_string().into_bytes()),
            Datum::UInt64(v) => (b'n', v.to_string().into_bytes()),
            Datum::Decimal(m, s) => (b'n', canonical_decimal(*m, *s).into_bytes()),
            Datum::Float64(f) => (b'n', canonical_float(*f).into_bytes()),
            other => (b's', other.raw_bytes()),
        };
        out.push(tag);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }
    Some(out)
}

fn canonical_decimal(mut m: i128, mut s: u8) -> String {
    while s > 0 && m % 10 == 0 {
        m /= 10;
        s -= 1;
    }
    if s == 0 {
        m.to_string()
    } else {
        radon_common::datum::decimal_to_string(m, s)
    }
}

fn canonical_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e18 {
        (f as i128).to_string()
    } else {
        format!("{f}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_three_valued() {
        let one = Datum::Int64(1);
        let two = Datum::Int64(2);
        assert!(compare(CmpOp::Lt, &one, &two));
        assert!(!compare(CmpOp::Ge, &one, &two));
        assert!(compare(CmpOp::Ne, &one, &two));
        assert!(!compare(CmpOp::Eq, &Datum::Null, &Datum::Null));
        assert!(!compare(CmpOp::Ne, &one, &Datum::Null));
        assert!(compare(CmpOp::NullSafeEq, &Datum::Null, &Datum::Null));
        assert!(!compare(CmpOp::NullSafeEq, &one, &Datum::Null));
        assert!(compare(CmpOp::NullSafeEq, &one, &Datum::Decimal(100, 2)));
    }

    #[test]
    fn test_filter_exchange() {
        let left = vec![Datum::Int64(5)];
        let right = vec![Datum::Int64(9)];
        let f = CmpFilter {
            left: 0,
            right: 0,
            op: CmpOp::Gt,
            exchange: false,
        };
        assert!(!filter_passes(&f, &left, &right));
        assert!(filter_passes(&CmpFilter { exchange: true, ..f }, &left, &right));
    }

    #[test]
    fn test_hash_key() {
        let a = vec![Datum::Int64(12), Datum::Text("3".into())];
        let b = vec![Datum::Decimal(1200, 2), Datum::Text("3".into())];
        let c = vec![Datum::Int64(1), Datum::Text("23".into())];
        assert_eq!(hash_key(&a, &[0, 1]), hash_key(&b, &[0, 1]));
        assert_ne!(hash_key(&a, &[0, 1]), hash_key(&c, &[0, 1]));
        assert_eq!(hash_key(&vec![Datum::Float64(12.0)], &[0]), hash_key(&a, &[0]));
        assert!(hash_key(&vec![Datum::Null, Datum::Int64(1)], &[0, 1]).is_none());
    }
}
