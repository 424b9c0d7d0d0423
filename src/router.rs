//! Deterministic shard router.
//!
//! Maps a conversation id to one of N partitions with 64-bit FNV-1a followed
//! by the murmur3 `fmix64` finalizer. Both are seedless, so placement is
//! reproducible across restarts and hosts; do not swap in `std`'s randomized
//! `DefaultHasher`.

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::Serialize;

/// Resolve the partition for `conversation_id` out of `partition_count`.
///
/// `partition_count` of zero is treated as one; callers validate the count
/// at startup.
pub fn shard_of(conversation_id: &str, partition_count: u32) -> u32 {
    let n = u64::from(partition_count.max(1));
    let mut hasher = FnvHasher::default();
    hasher.write(conversation_id.as_bytes());
    (fmix64(hasher.finish()) % n) as u32
}

/// FNV's low bits only depend on the low bits of each input byte, so ids
/// like `chat-1`, `chat-2` would cluster under a small modulus without this.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Per-partition placement counts for a sample of conversation ids.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub partition_count: u32,
    pub sample_size: usize,
    pub counts: Vec<usize>,
    /// Ideal count per partition (`sample_size / partition_count`).
    pub expected: f64,
    /// Largest absolute deviation from `expected`, divided by `expected`.
    /// 0.0 is perfectly even; 1.0 means some partition is empty or doubled.
    pub max_deviation: f64,
    /// Coefficient of variation of the counts.
    pub coefficient_of_variation: f64,
}

impl DistributionReport {
    /// True when no partition strays further than `tolerance` (a fraction of
    /// `expected`) from the ideal count.
    pub fn is_fair(&self, tolerance: f64) -> bool {
        self.max_deviation <= tolerance
    }

    pub fn empty_partitions(&self) -> usize {
        self.counts.iter().filter(|c| **c == 0).count()
    }
}

/// Place every id in `sample` and report how evenly they landed.
pub fn distribution<'a, I>(sample: I, partition_count: u32) -> DistributionReport
where
    I: IntoIterator<Item = &'a str>,
{
    let n = partition_count.max(1);
    let mut counts = vec![0usize; n as usize];
    let mut sample_size = 0usize;
    for id in sample {
        counts[shard_of(id, n) as usize] += 1;
        sample_size += 1;
    }

    let expected = sample_size as f64 / f64::from(n);
    let (max_deviation, coefficient_of_variation) = if sample_size == 0 {
        (0.0, 0.0)
    } else {
        let max_abs = counts
            .iter()
            .map(|c| (*c as f64 - expected).abs())
            .fold(0.0_f64, f64::max);
        let variance = counts
            .iter()
            .map(|c| (*c as f64 - expected).powi(2))
            .sum::<f64>()
            / f64::from(n);
        (max_abs / expected, variance.sqrt() / expected)
    };

    DistributionReport {
        partition_count: n,
        sample_size,
        counts,
        expected,
        max_deviation,
        coefficient_of_variation,
    }
}
