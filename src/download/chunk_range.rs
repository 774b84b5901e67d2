use std::collections::Bound;
use std::num::NonZeroU64;
use std::ops::RangeBounds;
use serde::{Deserialize, Serialize};

/// Inclusive byte range `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start) + 1
    }

    pub fn from_len(start: u64, len: u64) -> Self {
        Self { start, end: start + len - 1 }
    }

    /// The tail still missing once `skip` bytes are on disk
    pub fn remaining(&self, skip: u64) -> Option<ChunkRange> {
        (skip < self.len()).then(|| ChunkRange::new(self.start + skip, self.end))
    }

    pub fn to_range_header(&self) -> Option<headers::Range> {
        headers::Range::bytes(self).ok()
    }
}

impl<'a> RangeBounds<u64> for &'a ChunkRange {
    fn start_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.start)
    }

    fn end_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.end)
    }
}

/// Splits `[0, content_length)` into fixed-size ranges, the last one takes the remainder
#[derive(Debug, Clone)]
pub struct RemainingChunks {
    chunk_size: u64,
    ranges: Vec<ChunkRange>,
}

impl RemainingChunks {
    pub fn new(chunk_size: NonZeroU64, content_length: u64) -> Self {
        let ranges = if content_length == 0 {
            Vec::new()
        } else {
            vec![ChunkRange::from_len(0, content_length)]
        };

        Self {
            chunk_size: chunk_size.get(),
            ranges,
        }
    }

    /// 获取剩余的字节
    pub fn remaining_len(&self) -> u64 {
        self.ranges.iter().map(ChunkRange::len).sum()
    }
}

impl Iterator for RemainingChunks {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        let range = *self.ranges.first()?;
        let len = if range.len() <= self.chunk_size {
            self.ranges.remove(0);
            range.len()
        } else {
            self.ranges[0] = ChunkRange::new(range.start + self.chunk_size, range.end);
            self.chunk_size
        };

        Some(ChunkRange::from_len(range.start, len))
    }
}

/// Chunk plan for a resource of known size
pub fn plan_chunks(content_length: u64, chunk_size: NonZeroU64) -> Vec<ChunkRange> {
    RemainingChunks::new(chunk_size, content_length).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn chunk_size(size: u64) -> NonZeroU64 {
        NonZeroU64::new(size).unwrap()
    }

    #[test]
    fn should_be_next() {
        let mut iter = RemainingChunks::new(chunk_size(100), 300);

        assert_eq!(iter.next(), Some(ChunkRange::from_len(0, 100)));
        assert_eq!(iter.remaining_len(), 200);
        assert_eq!(iter.next(), Some(ChunkRange::from_len(100, 100)));
        assert_eq!(iter.next(), Some(ChunkRange::from_len(200, 100)));
        assert!(iter.next().is_none());
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let plan = plan_chunks(10 * MB, chunk_size(4 * MB));
        let lens: Vec<u64> = plan.iter().map(ChunkRange::len).collect();

        assert_eq!(lens, vec![4 * MB, 4 * MB, 2 * MB]);
        assert_eq!(plan[2].end, 10 * MB - 1);
    }

    #[test]
    fn plan_partitions_without_gaps() {
        let plan = plan_chunks(1001, chunk_size(64));
        let mut expected_start = 0;
        for range in &plan {
            assert_eq!(range.start, expected_start);
            expected_start = range.end + 1;
        }

        assert_eq!(expected_start, 1001);
    }

    #[test]
    fn empty_resource_has_no_chunks() {
        assert!(plan_chunks(0, chunk_size(64)).is_empty());
    }

    #[test]
    fn small_resource_is_one_chunk() {
        assert_eq!(plan_chunks(10, chunk_size(64)), vec![ChunkRange::new(0, 9)]);
    }

    #[test]
    fn range_header_skips_downloaded_bytes() {
        let range = ChunkRange::new(100, 199);
        assert!(range.remaining(100).is_none());

        let header = range.remaining(40).unwrap().to_range_header().unwrap();
        let bounds: Vec<_> = header.satisfiable_ranges(1000).collect();

        assert_eq!(bounds, vec![(Bound::Included(140), Bound::Included(199))]);
    }
}
