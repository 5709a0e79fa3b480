//! Chunk arithmetic and the completed-chunk set.
//!
//! Chunks are addressed by zero-based index. All chunks are `chunk_size`
//! bytes except the last, which may be short. A zero-byte file has zero
//! chunks.

use std::collections::BTreeSet;

use serde::de::{Deserializer, Error as DeError};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Number of chunks for a file: `ceil(file_size / chunk_size)`.
pub fn total_chunks(file_size: u64, chunk_size: u32) -> u32 {
    if file_size == 0 || chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64) as u32
}

/// Byte offset of a chunk within the file.
pub fn chunk_offset(index: u32, chunk_size: u32) -> u64 {
    index as u64 * chunk_size as u64
}

/// Expected payload length of a chunk. The last chunk carries the remainder.
pub fn chunk_len(index: u32, file_size: u64, chunk_size: u32) -> u32 {
    let start = chunk_offset(index, chunk_size);
    let end = (start + chunk_size as u64).min(file_size);
    end.saturating_sub(start) as u32
}

/// Set of completed chunk indices.
///
/// Persisted and sent over the wire as sorted `(start, len)` runs so a dense
/// set stays small. In memory it is an ordered index set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSet {
    indices: BTreeSet<u32>,
}

impl ChunkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an index. Returns true if it was not already present.
    pub fn insert(&mut self, index: u32) -> bool {
        self.indices.insert(index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.indices.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Whether every index in `[0, total)` is present.
    pub fn is_complete(&self, total: u32) -> bool {
        self.indices.len() == total as usize
    }

    /// Indices in `[0, total)` not yet present, ascending.
    pub fn missing(&self, total: u32) -> Vec<u32> {
        (0..total).filter(|i| !self.indices.contains(i)).collect()
    }

    /// Collapse the set into sorted `(start, len)` runs.
    pub fn to_runs(&self) -> Vec<(u32, u32)> {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for &i in &self.indices {
            match runs.last_mut() {
                Some((start, len)) if *start + *len == i => *len += 1,
                _ => runs.push((i, 1)),
            }
        }
        runs
    }

    /// Rebuild a set from `(start, len)` runs.
    pub fn from_runs(runs: &[(u32, u32)]) -> Self {
        let mut indices = BTreeSet::new();
        for &(start, len) in runs {
            for i in start..start.saturating_add(len) {
                indices.insert(i);
            }
        }
        Self { indices }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.indices.iter().copied()
    }
}

impl Serialize for ChunkSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_runs().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChunkSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let runs: Vec<(u32, u32)> = Deserialize::deserialize(deserializer)?;
        for w in runs.windows(2) {
            if w[0].0 + w[0].1 > w[1].0 {
                return Err(D::Error::custom("overlapping or unsorted chunk runs"));
            }
        }
        Ok(ChunkSet::from_runs(&runs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_edges() {
        assert_eq!(total_chunks(0, 1024), 0);
        assert_eq!(total_chunks(1, 1024), 1);
        assert_eq!(total_chunks(1023, 1024), 1);
        assert_eq!(total_chunks(1024, 1024), 1);
        assert_eq!(total_chunks(1025, 1024), 2);
        assert_eq!(total_chunks(10 * 1024, 1024), 10);
    }

    #[test]
    fn last_chunk_is_short() {
        assert_eq!(chunk_len(0, 100, 30), 30);
        assert_eq!(chunk_len(3, 100, 30), 10);
        // Exact multiple: the last chunk is full-size.
        assert_eq!(chunk_len(3, 120, 30), 30);
        // One byte under the chunk size.
        assert_eq!(chunk_len(0, 29, 30), 29);
    }

    #[test]
    fn offsets() {
        assert_eq!(chunk_offset(0, 65536), 0);
        assert_eq!(chunk_offset(3, 65536), 3 * 65536);
        // Largest index must not overflow u32 math.
        assert_eq!(chunk_offset(u32::MAX, 65536), u32::MAX as u64 * 65536);
    }

    #[test]
    fn runs_roundtrip() {
        let mut set = ChunkSet::new();
        for i in [0u32, 1, 2, 3, 9, 11, 12] {
            assert!(set.insert(i));
        }
        assert!(!set.insert(9));
        let runs = set.to_runs();
        assert_eq!(runs, vec![(0, 4), (9, 1), (11, 2)]);
        assert_eq!(ChunkSet::from_runs(&runs), set);
    }

    #[test]
    fn empty_and_complete() {
        let mut set = ChunkSet::new();
        assert!(set.is_empty());
        assert!(set.is_complete(0));
        for i in 0..4 {
            set.insert(i);
        }
        assert!(set.is_complete(4));
        assert!(!set.is_complete(5));
        assert_eq!(set.missing(6), vec![4, 5]);
    }

    #[test]
    fn serde_as_runs() {
        let set = ChunkSet::from_runs(&[(0, 4), (9, 1)]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[[0,4],[9,1]]");
        let back: ChunkSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn serde_rejects_overlapping_runs() {
        let r: Result<ChunkSet, _> = serde_json::from_str("[[0,4],[2,3]]");
        assert!(r.is_err());
    }
}
