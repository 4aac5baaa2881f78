//! Hash join used when one side of a sort-merge join is small.
//!
//! The smaller side is hashed on its key tuple and the other side streams
//! through the table. Output columns stay in left/right order whichever
//! side was hashed.

use std::collections::HashMap;

use radon_common::{RadonResult, Row};
use radon_planner::JoinNode;

use super::filter::{hash_key, left_joinable, pair_matches};
use super::{emit_left, emit_unmatched, join_rows, Output};

fn build<'a>(rows: &'a [Row], keys: &[usize]) -> HashMap<Vec<u8>, Vec<&'a Row>> {
    let mut table: HashMap<Vec<u8>, Vec<&'a Row>> = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(k) = hash_key(row, keys) {
            table.entry(k).or_default().push(row);
        }
    }
    table
}

pub(crate) fn join(node: &JoinNode, left: &[Row], right: &[Row], out: &mut Output) -> RadonResult<()> {
    if right.len() <= left.len() {
        let table = build(right, &node.right_keys);
        for l in left {
            let candidates = hash_key(l, &node.left_keys)
                .and_then(|k| table.get(&k))
                .map(|v| v.as_slice())
                .unwrap_or_default();
            let mut rows = Vec::new();
            emit_left(node, l, candidates.iter().copied(), &mut rows);
            out.extend(rows)?;
        }
        return Ok(());
    }

    // Left is hashed: stream right and remember which left rows found a partner.
    let mut table: HashMap<Vec<u8>, Vec<usize>> = HashMap::with_capacity(left.len());
    for (i, l) in left.iter().enumerate() {
        if !left_joinable(node, l) {
            continue;
        }
        if let Some(k) = hash_key(l, &node.left_keys) {
            table.entry(k).or_default().push(i);
        }
    }
    let mut matched = vec![false; left.len()];
    for r in right {
        let Some(ids) = hash_key(r, &node.right_keys).and_then(|k| table.get(&k)) else {
            continue;
        };
        for &i in ids {
            if pair_matches(node, &left[i], r) {
                out.push(join_rows(&left[i], Some(r), &node.cols))?;
                matched[i] = true;
            }
        }
    }
    let mut rows = Vec::new();
    for (l, _) in left.iter().zip(&matched).filter(|(_, m)| !**m) {
        emit_unmatched(node, l, &mut rows);
    }
    out.extend(rows)
}
