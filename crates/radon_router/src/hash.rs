//! Hash slot placement for `HASH` tables.

use radon_common::Datum;
use xxhash_rust::xxh3::xxh3_64;

use crate::table::Partition;

/// Slot of a shard-key value. Numbers and strings that render the same
/// text land in the same slot.
pub fn slot_of(key: &Datum, slots: usize) -> usize {
    let bytes = key.raw_bytes();
    (xxh3_64(&bytes) % slots.max(1) as u64) as usize
}

/// Physical name of partition `idx`.
pub fn physical_name(table: &str, idx: usize) -> String {
    format!("{table}_{idx:04}")
}

/// Split `slots` into `slots / blocks` partitions, assigned round-robin
/// over `backends`.
pub fn distribute(table: &str, slots: usize, blocks: usize, backends: &[String]) -> Vec<Partition> {
    let blocks = blocks.max(1);
    let count = (slots / blocks).max(1);
    (0..count)
        .map(|i| {
            let slot_end = if i + 1 == count { slots } else { (i + 1) * blocks };
            Partition {
                table: physical_name(table, i),
                backend: backends[i % backends.len()].clone(),
                slot_start: i * blocks,
                slot_end,
                list_values: Vec::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_deterministic_and_type_blind() {
        let a = slot_of(&Datum::Int64(42), 4096);
        assert_eq!(a, slot_of(&Datum::Int64(42), 4096));
        assert_eq!(a, slot_of(&Datum::Text("42".into()), 4096));
        assert!(a < 4096);
    }

    #[test]
    fn test_distribute_covers_all_slots() {
        let backends = vec!["b0".to_string(), "b1".to_string(), "b2".to_string()];
        let parts = distribute("t", 4096, 128, &backends);
        assert_eq!(parts.len(), 32);
        assert_eq!(parts[0].table, "t_0000");
        assert_eq!(parts[31].table, "t_0031");
        assert_eq!(parts[0].slot_start, 0);
        assert_eq!(parts[31].slot_end, 4096);
        for w in parts.windows(2) {
            assert_eq!(w[0].slot_end, w[1].slot_start);
        }
        assert_eq!(parts[3].backend, "b0");
        assert_eq!(parts[4].backend, "b1");
    }

    #[test]
    fn test_distribution_is_roughly_uniform() {
        let mut counts = vec![0usize; 8];
        for i in 0..8000i64 {
            counts[slot_of(&Datum::Int64(i), 4096) / 512] += 1;
        }
        for c in counts {
            assert!(c > 700 && c < 1300, "skewed bucket: {c}");
        }
    }
}
