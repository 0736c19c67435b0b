//! Hash-based partition selection shared by every producer and consumer of a
//! stream family.
//!
//! The checksum is CRC-32 over the reflected polynomial `0xD5828281`, the same
//! parameters the matchmaking producers use, so a match id lands on the same
//! partition no matter which service computes it.

use crc::{Algorithm, Crc};

/// Reflected polynomial of the partition checksum
pub const PARTITION_POLYNOMIAL: u32 = 0xD582_8281;

/// Reference slot count for match keys and `games` streams
pub const DEFAULT_SLOTS: u32 = 3;

/// CRC-32 over `PARTITION_POLYNOMIAL` (normal form `0x814141AB`), reflected
/// in and out, init and xorout all ones
pub const PARTITION_CRC: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x8141_41AB,
    init: 0xFFFF_FFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF_FFFF,
    check: 0xA9CC_8179,
    residue: 0x4AC2_A509,
};

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&PARTITION_CRC);

/// CRC-32 checksum of `data`
pub fn checksum(data: &[u8]) -> u32 {
    CHECKSUM.checksum(data)
}

/// Append the partition tag: `name-{partition}`.
///
/// The braces double as a hash tag so a cluster-capable store colocates
/// everything carrying the same partition.
pub fn with_partition(base: &str, partition: u32) -> String {
    format!("{}-{{{}}}", base, partition)
}

/// Partition selector for one stream family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    slots: u32,
}

impl Partitioner {
    /// Create a selector over `slots` partitions. Zero slots is clamped to one.
    pub fn new(slots: u32) -> Self {
        Self {
            slots: slots.max(1),
        }
    }

    /// Partition of `key`
    pub fn partition_of(&self, key: &str) -> u32 {
        checksum(key.as_bytes()) % self.slots
    }

    /// Physical name for `base` on `key`'s partition
    pub fn name_for(&self, base: &str, key: &str) -> String {
        with_partition(base, self.partition_of(key))
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"m1"), 0x5e80_a83e);
        assert_eq!(checksum(b"abc"), 0x5d8f_8b4d);
        assert_eq!(checksum(b"123456789"), 0xa9cc_8179);
        assert_eq!(checksum(b"match-42"), 0xfcad_21fa);
    }

    #[test]
    fn test_normal_form_matches_reflected_polynomial() {
        assert_eq!(PARTITION_CRC.poly.reverse_bits(), PARTITION_POLYNOMIAL);
        assert_eq!(checksum(b"123456789"), PARTITION_CRC.check);
    }

    #[test]
    fn test_partition_of_known_ids() {
        let partitioner = Partitioner::default();
        assert_eq!(partitioner.partition_of("m1"), 2);
        assert_eq!(partitioner.partition_of("match-42"), 0);
    }

    #[test]
    fn test_name_format() {
        assert_eq!(with_partition("sudoku-engine:games", 1), "sudoku-engine:games-{1}");

        let partitioner = Partitioner::default();
        assert_eq!(
            partitioner.name_for("sudoku-engine:m1", "m1"),
            "sudoku-engine:m1-{2}"
        );
    }

    #[test]
    fn test_zero_slots_clamped() {
        let partitioner = Partitioner::new(0);
        assert_eq!(partitioner.partition_of("anything"), 0);
    }

    proptest! {
        #[test]
        fn prop_partition_is_deterministic(key in ".*", slots in 1u32..64) {
            let a = Partitioner::new(slots);
            let b = Partitioner::new(slots);
            prop_assert_eq!(a.partition_of(&key), b.partition_of(&key));
            prop_assert!(a.partition_of(&key) < slots);
        }
    }
}
