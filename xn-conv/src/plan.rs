use crate::nd_iter::NdIndex;
use crate::partition::{WorkPartition, balanced_range};
use std::ops::Range;

/// Extents of the iteration space walked by the forward and backward-data orchestrators,
/// from the outermost to the innermost axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAxes {
    pub ngroups: usize,
    pub nb_mb: usize,
    /// Output (or diff-source) rows, depth folded in.
    pub rows: usize,
    /// Channel iterations, each covering `step` channel blocks.
    pub c_iters: usize,
    pub mb_block: usize,
}

impl ChunkAxes {
    pub fn dims(&self) -> [usize; 5] {
        [self.ngroups, self.nb_mb, self.rows, self.c_iters, self.mb_block]
    }

    pub fn work_amount(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn partition(&self, nthr: usize) -> WorkPartition {
        WorkPartition::new(self.work_amount(), nthr)
    }
}

/// A run of consecutive images within one minibatch block sharing all the other coordinates,
/// handed to a single kernel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub g: usize,
    pub mbb: usize,
    pub row: usize,
    pub c_iter: usize,
    /// Offsets within the minibatch block.
    pub mb: Range<usize>,
}

impl Chunk {
    /// Absolute image indices.
    pub fn images(&self, mb_block: usize) -> Range<usize> {
        let base = self.mbb * mb_block;
        base + self.mb.start..base + self.mb.end
    }
}

/// Chunks of worker `ithr`, in increasing flat index order.
///
/// Each step records the current coordinates, extends the chunk over the images left in the
/// current minibatch block (bounded by the end of the thread's range) and jumps past them.
pub fn plan_chunks(axes: &ChunkAxes, nthr: usize, ithr: usize) -> Vec<Chunk> {
    let mut range = balanced_range(axes.work_amount(), nthr, ithr);
    let mut chunks = vec![];
    if range.is_empty() {
        return chunks;
    }
    let mut idx = NdIndex::init(range.start, axes.dims());
    while !range.is_empty() {
        let [g, mbb, row, c_iter, mb_s] = idx.coords();
        let mb_e = mb_s + idx.run_len(&range);
        chunks.push(Chunk { g, mbb, row, c_iter, mb: mb_s..mb_e });
        (range, idx) = idx.advance(range);
    }
    chunks
}
