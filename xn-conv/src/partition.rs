use std::ops::Range;

/// Range of work items assigned to thread `ithr` out of `nthr`.
///
/// The ranges of all threads are contiguous, disjoint, cover `0..work_amount`, and their lengths
/// differ by at most one, the first `work_amount % nthr` threads getting the longer ones.
#[inline]
pub fn balanced_range(work_amount: usize, nthr: usize, ithr: usize) -> Range<usize> {
    if nthr <= 1 {
        return 0..work_amount;
    }
    let base = work_amount / nthr;
    let rem = work_amount % nthr;
    let start = ithr * base + ithr.min(rem);
    let len = base + usize::from(ithr < rem);
    start..start + len
}

/// The per-thread ranges of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPartition {
    work_amount: usize,
    ranges: Vec<Range<usize>>,
}

impl WorkPartition {
    pub fn new(work_amount: usize, nthr: usize) -> Self {
        let nthr = nthr.max(1);
        let ranges = (0..nthr).map(|ithr| balanced_range(work_amount, nthr, ithr)).collect();
        Self { work_amount, ranges }
    }

    pub fn work_amount(&self) -> usize {
        self.work_amount
    }

    pub fn nthr(&self) -> usize {
        self.ranges.len()
    }

    pub fn range(&self, ithr: usize) -> Range<usize> {
        self.ranges[ithr].clone()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }
}
