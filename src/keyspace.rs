//! Arithmetic over the 128-bit chunk ID keyspace.
//!
//! Chunk IDs are 32 lowercase hex characters read as unsigned 128-bit
//! integers. All fraction and estimate math happens on arbitrary-precision
//! integers so nothing overflows near the top of the keyspace.
//!
//! ```text
//!   ""  (-1)                                                   END_OF_TABLE
//!    |------- shard 0 -------|------- shard 1 -------|------- shard 2 -------|
//!    (start                  end](start              end](start              end]
//! ```

use crate::error::{Error, Result};
use num_bigint::BigInt;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

/// Sentinel that sorts after every chunk ID.
pub const END_OF_TABLE: &str = "ffffffffffffffffffffffffffffffff";

/// Chunk ID width in hex characters.
pub const CHUNK_ID_HEX_LEN: usize = 32;

/// Upper bound returned by chunk estimation.
pub const MAX_CHUNK_ESTIMATE: i64 = 1_000_000_000;

/// Rows used to estimate table size.
pub const ESTIMATE_SAMPLE_ROWS: usize = 100;

/// Progress value of a fully drained shard.
pub const PROGRESS_COMPLETE: i64 = 1000;

/// A shard's range of chunk IDs, exclusive of `start`, inclusive of `end`.
/// An empty `start` means the beginning of the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: String,
    pub end: String,
}

impl ChunkRange {
    pub fn full() -> Self {
        Self {
            start: String::new(),
            end: END_OF_TABLE.to_string(),
        }
    }

    /// True if `chunk_id` lies in `(start, end]`.
    pub fn contains(&self, chunk_id: &str) -> bool {
        chunk_id > self.start.as_str() && chunk_id <= self.end.as_str()
    }
}

fn keyspace_size() -> BigInt {
    BigInt::one() << 128
}

/// Parses a chunk ID; `""` is the position before the first chunk, -1.
pub fn chunk_id_to_int(chunk_id: &str) -> Result<BigInt> {
    if chunk_id.is_empty() {
        return Ok(-BigInt::one());
    }
    if chunk_id.len() != CHUNK_ID_HEX_LEN
        || !chunk_id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(Error::validation(format!(
            "chunk ID {chunk_id:?} is not valid"
        )));
    }
    BigInt::parse_bytes(chunk_id.as_bytes(), 16)
        .ok_or_else(|| Error::validation(format!("chunk ID {chunk_id:?} is not valid")))
}

/// Formats a value in `[0, 2^128)` as a zero-padded chunk ID.
pub fn int_to_chunk_id(value: &BigInt) -> Result<String> {
    if value.sign() == num_bigint::Sign::Minus || *value >= keyspace_size() {
        return Err(Error::InvalidRange(format!(
            "{value} is outside the chunk ID keyspace"
        )));
    }
    Ok(format!("{:0>width$}", value.to_str_radix(16), width = CHUNK_ID_HEX_LEN))
}

/// Boundaries splitting the keyspace into `count` equal shards. The result
/// has `count + 1` elements: `""`, then the inclusive end of each shard, the
/// last being [`END_OF_TABLE`].
pub fn worker_splits(count: usize) -> Result<Vec<String>> {
    if count == 0 {
        return Err(Error::validation("shard count must be positive"));
    }
    let size = keyspace_size();
    let count_big = BigInt::from(count);
    let mut splits = Vec::with_capacity(count + 1);
    splits.push(String::new());
    for i in 0..count {
        let boundary = &size * BigInt::from(i + 1) / &count_big - BigInt::one();
        splits.push(int_to_chunk_id(&boundary)?);
    }
    Ok(splits)
}

/// Contiguous, non-overlapping ranges covering the whole keyspace.
pub fn shard_ranges(count: usize) -> Result<Vec<ChunkRange>> {
    let splits = worker_splits(count)?;
    Ok(splits
        .windows(2)
        .map(|pair| ChunkRange {
            start: pair[0].clone(),
            end: pair[1].clone(),
        })
        .collect())
}

/// Estimates table size from the ID of the 100th row in key order, given IDs
/// are uniformly distributed: `100 * 2^128 / (id + 1)`.
pub fn estimate_chunks_from_id(id: &str) -> Result<i64> {
    let value = chunk_id_to_int(id)?;
    if value.sign() == num_bigint::Sign::Minus {
        return Err(Error::validation("estimate requires a concrete chunk ID"));
    }
    let estimate = BigInt::from(ESTIMATE_SAMPLE_ROWS) * keyspace_size() / (value + BigInt::one());
    if estimate > BigInt::from(MAX_CHUNK_ESTIMATE) {
        return Ok(MAX_CHUNK_ESTIMATE);
    }
    estimate
        .to_i64()
        .ok_or_else(|| Error::InvalidRange("chunk estimate does not fit".to_string()))
}

/// Per-mille progress through `(start, end]` when `next` is the next chunk
/// still to be processed: `floor(1000 * (next - 1 - start) / (end - start))`.
/// Always below 1000; completion is reported separately once the shard is
/// drained.
pub fn calculate_progress(start: &str, end: &str, next: &str) -> Result<i64> {
    let start_value = chunk_id_to_int(start)?;
    let end_value = chunk_id_to_int(end)?;
    let next_value = chunk_id_to_int(next)?;
    if start_value >= end_value {
        return Err(Error::InvalidRange(format!(
            "start chunk ID {start:?} must be before end chunk ID {end:?}"
        )));
    }
    if next_value <= start_value || next_value > end_value {
        return Err(Error::InvalidRange(format!(
            "next chunk ID {next:?} must be in ({start:?}, {end:?}]"
        )));
    }
    let done = next_value - BigInt::one() - &start_value;
    let total = end_value - start_value;
    let progress = BigInt::from(PROGRESS_COMPLETE) * done / total;
    if progress < BigInt::zero() || progress >= BigInt::from(PROGRESS_COMPLETE) {
        return Err(Error::InvalidRange(format!(
            "progress {progress} out of bounds"
        )));
    }
    progress
        .to_i64()
        .ok_or_else(|| Error::InvalidRange("progress does not fit".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repeat(pair: &str, n: usize) -> String {
        pair.repeat(n)
    }

    #[test]
    fn worker_splits_three_shards() {
        let splits = worker_splits(3).unwrap();
        assert_eq!(
            splits,
            vec![
                String::new(),
                format!("{}54", repeat("55", 15)),
                format!("{}a9", repeat("aa", 15)),
                END_OF_TABLE.to_string(),
            ]
        );
    }

    #[test]
    fn single_shard_covers_everything() {
        assert_eq!(shard_ranges(1).unwrap(), vec![ChunkRange::full()]);
        assert!(worker_splits(0).is_err());
    }

    #[test]
    fn shard_ranges_are_contiguous_for_many_counts() {
        for count in [1usize, 2, 3, 7, 10, 64, 255, 1000] {
            let ranges = shard_ranges(count).unwrap();
            assert_eq!(ranges.len(), count);
            assert_eq!(ranges[0].start, "");
            assert_eq!(ranges[count - 1].end, END_OF_TABLE);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start, "gap or overlap at {count}");
            }
            for range in &ranges {
                assert!(range.start < range.end);
            }
        }
    }

    #[test]
    fn range_contains_is_exclusive_inclusive() {
        let range = ChunkRange {
            start: format!("{}54", repeat("55", 15)),
            end: format!("{}a9", repeat("aa", 15)),
        };
        assert!(!range.contains(&range.start));
        assert!(range.contains(&range.end));
        assert!(range.contains(&repeat("77", 16)));
        assert!(ChunkRange::full().contains(&repeat("00", 16)));
    }

    #[test]
    fn estimate_from_id() {
        assert_eq!(
            estimate_chunks_from_id(&format!("{}63", repeat("00", 15))).unwrap(),
            MAX_CHUNK_ESTIMATE
        );
        assert_eq!(
            estimate_chunks_from_id(&format!("7f{}", repeat("ff", 15))).unwrap(),
            200
        );
        assert_eq!(estimate_chunks_from_id(END_OF_TABLE).unwrap(), 100);
        assert!(estimate_chunks_from_id("xyz").is_err());
    }

    #[test]
    fn progress_full_keyspace() {
        let end = END_OF_TABLE;
        assert_eq!(calculate_progress("", end, &repeat("00", 16)).unwrap(), 0);
        assert_eq!(
            calculate_progress("", end, &format!("80{}", repeat("00", 15))).unwrap(),
            500
        );
        assert_eq!(calculate_progress("", end, end).unwrap(), 999);
    }

    #[test]
    fn progress_partial_range() {
        let start = format!("{}54", repeat("55", 15));
        let end = format!("{}a9", repeat("aa", 15));
        assert_eq!(calculate_progress(&start, &end, &repeat("55", 16)).unwrap(), 0);
        assert_eq!(calculate_progress(&start, &end, &repeat("77", 16)).unwrap(), 400);
        assert_eq!(calculate_progress(&start, &end, &end).unwrap(), 999);
    }

    #[test]
    fn progress_is_monotonic_and_never_complete() {
        let ranges = shard_ranges(4).unwrap();
        let range = &ranges[2];
        let start = chunk_id_to_int(&range.start).unwrap();
        let end = chunk_id_to_int(&range.end).unwrap();
        let step = (&end - &start) / BigInt::from(37);
        let mut last = -1;
        let mut next = &start + BigInt::one();
        while next <= end {
            let id = int_to_chunk_id(&next).unwrap();
            let progress = calculate_progress(&range.start, &range.end, &id).unwrap();
            assert!(progress >= last);
            assert!(progress < PROGRESS_COMPLETE);
            last = progress;
            next += &step;
        }
    }

    #[test]
    fn malformed_ranges_fail() {
        let mid = repeat("77", 16);
        assert!(matches!(
            calculate_progress(&mid, &mid, &mid),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            calculate_progress(&mid, END_OF_TABLE, &mid),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            calculate_progress("", &mid, END_OF_TABLE),
            Err(Error::InvalidRange(_))
        ));
    }
}
