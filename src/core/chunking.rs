//! Row partitioning of a raster across ranks and subchunk passes

use crate::types::{GridError, GridResult};
use std::ops::Range;

/// Split `[0, len)` into `pieces` contiguous ranges in order. Sizes differ by
/// at most one; the first `len % pieces` ranges carry the extra element.
pub fn split_ranges(len: usize, pieces: usize) -> Vec<Range<usize>> {
    if pieces == 0 {
        return Vec::new();
    }
    let base = len / pieces;
    let extra = len % pieces;

    let mut ranges = Vec::with_capacity(pieces);
    let mut start = 0;
    for i in 0..pieces {
        let size = base + usize::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Row ownership table for `processes` x `subchunks` passes over an image.
///
/// The table depends only on `(height, processes, subchunks)`, so every rank
/// builds the same one locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlanner {
    height: usize,
    processes: usize,
    subchunks: usize,
    ranges: Vec<Range<usize>>,
}

impl ChunkPlanner {
    pub fn new(height: usize, processes: usize, subchunks: usize) -> GridResult<Self> {
        if processes == 0 {
            return Err(GridError::InvalidConfig("chunk planner needs at least one process".to_string()));
        }
        if subchunks == 0 {
            return Err(GridError::InvalidConfig("chunk planner needs at least one subchunk".to_string()));
        }

        let ranges = split_ranges(height, processes * subchunks);
        log::debug!(
            "Planned {} row pieces over {} rows ({} processes x {} subchunks)",
            ranges.len(),
            height,
            processes,
            subchunks
        );

        Ok(Self {
            height,
            processes,
            subchunks,
            ranges,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    pub fn subchunks(&self) -> usize {
        self.subchunks
    }

    pub fn pieces(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub fn piece_index(&self, rank: usize, subchunk_index: usize) -> usize {
        self.processes * subchunk_index + rank
    }

    /// Rows owned by `rank` during pass `subchunk_index`
    pub fn range(&self, rank: usize, subchunk_index: usize) -> GridResult<Range<usize>> {
        if rank >= self.processes || subchunk_index >= self.subchunks {
            return Err(GridError::InvalidConfig(format!(
                "no piece for rank {} / subchunk {} in a {}x{} plan",
                rank, subchunk_index, self.processes, self.subchunks
            )));
        }
        Ok(self.ranges[self.piece_index(rank, subchunk_index)].clone())
    }

    /// First row of every piece, in piece order
    pub fn starts(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.start).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(ranges: &[Range<usize>]) -> Vec<usize> {
        ranges.iter().map(|r| r.len()).collect()
    }

    #[test]
    fn test_two_processes_seven_rows() {
        let single = ChunkPlanner::new(7, 2, 1).unwrap();
        assert_eq!(single.pieces(), &[0..4, 4..7]);
        assert_eq!(single.range(1, 0).unwrap(), 4..7);

        let double = ChunkPlanner::new(7, 2, 2).unwrap();
        assert_eq!(sizes(double.pieces()), vec![2, 2, 2, 1]);
        assert_eq!(double.range(0, 1).unwrap(), 4..6);
        assert_eq!(double.range(1, 1).unwrap(), 6..7);
    }

    #[test]
    fn test_partition_covers_rows_exactly() {
        for height in 1..40 {
            for processes in 1..6 {
                for subchunks in 1..5 {
                    let plan = ChunkPlanner::new(height, processes, subchunks).unwrap();
                    let pieces = plan.pieces();
                    assert_eq!(pieces.len(), processes * subchunks);
                    assert_eq!(pieces[0].start, 0);
                    assert_eq!(pieces.last().unwrap().end, height);
                    for pair in pieces.windows(2) {
                        assert_eq!(pair[0].end, pair[1].start);
                    }
                    let lens = sizes(pieces);
                    let max = *lens.iter().max().unwrap();
                    let min = *lens.iter().min().unwrap();
                    assert!(max - min <= 1);
                }
            }
        }
    }

    #[test]
    fn test_rejects_empty_group() {
        assert!(ChunkPlanner::new(10, 0, 1).is_err());
        assert!(ChunkPlanner::new(10, 1, 0).is_err());
        assert!(ChunkPlanner::new(10, 2, 1).unwrap().range(2, 0).is_err());
    }
}
