//! Sort-merge join over two fully materialized sides.

use std::cmp::Ordering;

use radon_common::datum::cmp_row_keys;
use radon_common::{RadonError, RadonResult, Row};
use radon_planner::JoinNode;

use super::filter::{cmp_keys, has_null_key};
use super::{emit_left, emit_unmatched, Output};

/// Pairs in one equal-key group above which the product is split across workers.
const PARALLEL_PAIRS: usize = 8192;

/// End (exclusive) of the run of rows sharing `rows[start]`'s key.
fn group_end(rows: &[Row], start: usize, keys: &[usize]) -> usize {
    let mut end = start + 1;
    while end < rows.len() && cmp_row_keys(&rows[start], &rows[end], keys) == Ordering::Equal {
        end += 1;
    }
    end
}

fn emit_all_unmatched(node: &JoinNode, lrows: &[Row], out: &mut Output) -> RadonResult<()> {
    let mut rows = Vec::new();
    for l in lrows {
        emit_unmatched(node, l, &mut rows);
    }
    out.extend(rows)
}

/// Product of one equal-key group, split into at most `workers` chunks of the
/// left rows; chunk outputs are concatenated in order.
fn product(node: &JoinNode, lrows: &[Row], rrows: &[Row], workers: usize) -> RadonResult<Vec<Row>> {
    if workers <= 1 || lrows.len() < 2 || lrows.len() * rrows.len() < PARALLEL_PAIRS {
        let mut rows = Vec::new();
        for l in lrows {
            emit_left(node, l, rrows, &mut rows);
        }
        return Ok(rows);
    }
    let chunk = lrows.len().div_ceil(workers);
    std::thread::scope(|s| {
        let handles: Vec<_> = lrows
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || {
                    let mut rows = Vec::new();
                    for l in part {
                        emit_left(node, l, rrows, &mut rows);
                    }
                    rows
                })
            })
            .collect();
        let mut rows = Vec::new();
        for h in handles {
            let part = h
                .join()
                .map_err(|_| RadonError::Internal("merge join worker panicked".into()))?;
            rows.extend(part);
        }
        Ok(rows)
    })
}

pub(crate) fn join(
    node: &JoinNode,
    mut left: Vec<Row>,
    mut right: Vec<Row>,
    workers: usize,
    out: &mut Output,
) -> RadonResult<()> {
    left.sort_by(|a, b| cmp_row_keys(a, b, &node.left_keys));
    right.sort_by(|a, b| cmp_row_keys(a, b, &node.right_keys));

    let (mut i, mut j) = (0, 0);
    while i < left.len() {
        let li = group_end(&left, i, &node.left_keys);
        let lrows = &left[i..li];
        if has_null_key(&lrows[0], &node.left_keys) {
            emit_all_unmatched(node, lrows, out)?;
            i = li;
            continue;
        }
        while j < right.len() && has_null_key(&right[j], &node.right_keys) {
            j += 1;
        }
        if j >= right.len() {
            emit_all_unmatched(node, &left[i..], out)?;
            break;
        }
        let rj = group_end(&right, j, &node.right_keys);
        match cmp_keys(&lrows[0], &node.left_keys, &right[j], &node.right_keys) {
            Ordering::Equal => {
                out.extend(product(node, lrows, &right[j..rj], workers)?)?;
                i = li;
                j = rj;
            }
            Ordering::Less => {
                emit_all_unmatched(node, lrows, out)?;
                i = li;
            }
            Ordering::Greater => j = rj,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::testutil::{node, rows, sorted};

    #[test]
    fn test_inner_merge() {
        let n = node(vec![0], vec![0], vec![-1, -2, 2]);
        let left = rows(&[&[Some(3), Some(30)], &[Some(1), Some(10)], &[None, Some(0)], &[Some(3), Some(31)]]);
        let right = rows(&[&[Some(3), Some(300)], &[Some(2), Some(200)], &[None, Some(0)], &[Some(1), Some(100)]]);
        let mut out = Output::new(usize::MAX);
        join(&n, left, right, 4, &mut out).unwrap();
        assert_eq!(sorted(&out.rows), vec!["1,10,100", "3,30,300", "3,31,300"]);
    }

    #[test]
    fn test_left_merge_pads_unmatched_and_null_keys() {
        let mut n = node(vec![0], vec![0], vec![-1, 2]);
        n.is_left_join = true;
        let left = rows(&[&[Some(1)], &[None], &[Some(4)], &[Some(9)]]);
        let right = rows(&[&[Some(1), Some(100)], &[Some(4), Some(400)], &[Some(5), Some(500)]]);
        let mut out = Output::new(usize::MAX);
        join(&n, left, right, 1, &mut out).unwrap();
        assert_eq!(sorted(&out.rows), vec!["1,100", "4,400", "9,NULL", "NULL,NULL"]);

        n.has_right_filter = true;
        let mut out = Output::new(usize::MAX);
        join(&n, rows(&[&[Some(1)], &[Some(9)]]), rows(&[&[Some(1), Some(100)]]), 1, &mut out).unwrap();
        assert_eq!(sorted(&out.rows), vec!["1,100"]);
    }

    #[test]
    fn test_left_tmp_column_blocks_join() {
        let mut n = node(vec![0], vec![0], vec![-1, 2]);
        n.is_left_join = true;
        n.left_tmp_cols = vec![1];
        let left = rows(&[&[Some(1), Some(1)], &[Some(1), Some(0)]]);
        let right = rows(&[&[Some(1), Some(100)]]);
        let mut out = Output::new(usize::MAX);
        join(&n, left, right, 1, &mut out).unwrap();
        assert_eq!(sorted(&out.rows), vec!["1,100", "1,NULL"]);
    }

    #[test]
    fn test_right_sentinel_skipped() {
        let mut n = node(vec![0], vec![0], vec![-1, 2]);
        n.right_tmp_cols = vec![2];
        let left = rows(&[&[Some(1)]]);
        let right = rows(&[&[Some(1), Some(100), None], &[Some(1), Some(101), Some(1)]]);
        let mut out = Output::new(usize::MAX);
        join(&n, left, right, 1, &mut out).unwrap();
        assert_eq!(sorted(&out.rows), vec!["1,100"]);
    }

    #[test]
    fn test_parallel_product_matches_serial() {
        let n = node(vec![0], vec![0], vec![-2, 2]);
        let left: Vec<Row> = (0..400).flat_map(|i| rows(&[&[Some(i % 2), Some(i)]])).collect();
        let right: Vec<Row> = (0..200).flat_map(|i| rows(&[&[Some(i % 2), Some(1000 + i)]])).collect();
        let mut serial = Output::new(usize::MAX);
        join(&n, left.clone(), right.clone(), 1, &mut serial).unwrap();
        let mut parallel = Output::new(usize::MAX);
        join(&n, left, right, 4, &mut parallel).unwrap();
        assert_eq!(serial.rows.len(), 2 * 200 * 100);
        assert_eq!(serial.rows, parallel.rows);
    }
}
