//! Deterministic shard assignment for object paths.
//!
//! Every path is assigned to exactly one of N shards via
//! `crc32(path) % N`. The inventory table is physically partitioned by the
//! same expression, and every shard-scoped query filters on it, so the Rust
//! value must agree bit-for-bit with ClickHouse's `CRC32()` server function.
//! That function is the standard reflected CRC-32 (IEEE 802.3 / zlib
//! polynomial), which is what this module implements.
//!
//! The shard count is fixed for the lifetime of one inventory table
//! generation: changing it without recreating the table would break the
//! partitioning invariant (see `config::GcConfig::validate`).

/// Reflected polynomial for CRC-32 (IEEE 802.3).
const CRC32_POLY: u32 = 0xEDB8_8320;

/// Byte-at-a-time lookup table, built at compile time.
const CRC32_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-32 (IEEE) checksum of `data`.
///
/// Matches ClickHouse's `CRC32()` for the same byte sequence.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let idx = (crc ^ u32::from(byte)) & 0xFF;
        crc = (crc >> 8) ^ CRC32_TABLE[idx as usize];
    }
    !crc
}

/// Assigns `path` to a shard in `[0, samples)`.
///
/// Total and deterministic: every path maps to exactly one shard, and the
/// union of all shards covers the whole path space. `samples` must be
/// non-zero (enforced by configuration validation before any shard-scoped
/// work starts); a zero value is clamped to one shard here rather than
/// dividing by zero.
#[must_use]
pub fn shard(path: &str, samples: u32) -> u32 {
    crc32(path.as_bytes()) % samples.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crc32_known_vectors() {
        // Standard check values for CRC-32/ISO-HDLC, the variant ClickHouse
        // exposes as CRC32().
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
    }

    #[test]
    fn test_shard_deterministic() {
        let path = "data/xyz/part-0001.bin";
        assert_eq!(shard(path, 4), shard(path, 4));
    }

    #[test]
    fn test_shard_zero_samples_clamps() {
        assert_eq!(shard("data/a", 0), 0);
    }

    #[test]
    fn test_single_shard_collapses() {
        for path in ["a", "b", "data/long/path", ""] {
            assert_eq!(shard(path, 1), 0);
        }
    }

    proptest! {
        #[test]
        fn prop_shard_in_range(path in ".*", samples in 1u32..64) {
            prop_assert!(shard(&path, samples) < samples);
        }

        #[test]
        fn prop_shard_total_and_disjoint(path in ".*", samples in 1u32..64) {
            // Exactly one shard claims each path.
            let claimed: Vec<u32> = (0..samples)
                .filter(|&s| shard(&path, samples) == s)
                .collect();
            prop_assert_eq!(claimed.len(), 1);
        }

        #[test]
        fn prop_crc32_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(crc32(&data), crc32(&data));
        }
    }
}
