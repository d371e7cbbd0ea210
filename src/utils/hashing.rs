//! Deterministic string hashing.
//!
//! Every process that routes a message type must land on the same partition,
//! so the hash cannot depend on `std`'s randomly seeded hashers. A SHA-256
//! digest is folded into an `i64` instead.

use sha2::{Digest, Sha256};

/// Stable 64-bit hash of `input`.
pub fn stable_hash(input: &str) -> i64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&digest[..8]);
    low.copy_from_slice(&digest[8..16]);
    i64::from_be_bytes(high) ^ i64::from_be_bytes(low)
}

/// Index of the partition owning `key` among `partition_count` partitions.
///
/// Returns 0 when `partition_count` is 0 so callers can surface their own
/// "no partitions" error before indexing.
pub fn partition_index(key: &str, partition_count: usize) -> usize {
    if partition_count == 0 {
        return 0;
    }
    stable_hash(key).rem_euclid(partition_count as i64) as usize
}
