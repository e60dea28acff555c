use crate::buffer::{AlignedBuffer, CACHE_LINE, SharedMut};
use crate::error::{Result, check_len};
use crate::partition::balanced_range;
use crate::runtime::BarrierSet;
use crate::WithDType;
use std::ops::Range;

/// Upper bound on the elements of reduction workspace, 8MB of f32.
pub const MAX_BUFFER_SIZE: usize = 1 << 21;

/// Element-wise `dst += src`, the accumulation routine used by every reduction of the crate.
#[inline]
pub fn accumulate<T: WithDType>(dst: &mut [T], src: &[T]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s
    }
}

/// Split of the threads in groups for a one-dimensional reduction.
///
/// `njobs` jobs of `job_size` elements are summed over `reduction_size`. Each group owns a
/// contiguous range of jobs, its members accumulate their part of the reduction in local
/// buffers that the group then sums into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceBalancer {
    pub nthr: usize,
    pub job_size: usize,
    pub njobs: usize,
    pub reduction_size: usize,
    pub max_buffer_size: usize,
    pub ngroups: usize,
    pub nthr_per_group: usize,
    pub njobs_per_group_ub: usize,
}

impl ReduceBalancer {
    /// Brute forces the number of jobs per group, minimizing the elements each thread has to
    /// touch (accumulation plus its share of the final sum).
    pub fn new(
        nthr: usize,
        job_size: usize,
        njobs: usize,
        reduction_size: usize,
        max_buffer_size: usize,
    ) -> Self {
        let nthr = nthr.max(1);
        let njobs = njobs.max(1);
        let reduction_size = reduction_size.max(1);
        let job_size = job_size.max(1);

        let min_njobs_per_group = (njobs / nthr).max(1);
        let max_njobs_per_group = (max_buffer_size / (nthr * job_size)).max(1);

        let mut ngroups = (njobs / min_njobs_per_group).min(nthr);
        let mut nthr_per_group = (nthr / ngroups).min(reduction_size);
        let mut njobs_per_group_ub = njobs.div_ceil(ngroups);
        let mut best = njobs * job_size * reduction_size;

        for c_njobs_per_group in min_njobs_per_group..njobs {
            let c_ngroups = (njobs / c_njobs_per_group).min(nthr);
            let c_nthr_per_group = (nthr / c_ngroups).min(reduction_size);
            let c_njobs_per_group_ub = njobs.div_ceil(c_ngroups);
            if c_nthr_per_group > 1 && c_njobs_per_group_ub > max_njobs_per_group {
                continue;
            }
            let c_thread_reduction_ub = reduction_size.div_ceil(c_nthr_per_group);
            let c_group_size_ub = job_size * c_njobs_per_group_ub;
            let c_complexity =
                c_group_size_ub * (c_thread_reduction_ub + usize::from(c_nthr_per_group != 1));
            if c_complexity < best {
                ngroups = c_ngroups;
                nthr_per_group = c_nthr_per_group;
                njobs_per_group_ub = c_njobs_per_group_ub;
                best = c_complexity;
            }
        }
        if nthr_per_group > 1 && njobs_per_group_ub > max_njobs_per_group {
            nthr_per_group = 1;
        }
        Self {
            nthr,
            job_size,
            njobs,
            reduction_size,
            max_buffer_size,
            ngroups,
            nthr_per_group,
            njobs_per_group_ub,
        }
    }

    /// Threads taking part in the reduction, the others stay idle.
    pub fn nthr_used(&self) -> usize {
        self.ngroups * self.nthr_per_group
    }

    pub fn group_id(&self, ithr: usize) -> Option<usize> {
        (ithr < self.nthr_used()).then(|| ithr / self.nthr_per_group)
    }

    pub fn id_in_group(&self, ithr: usize) -> usize {
        ithr % self.nthr_per_group
    }

    pub fn group_jobs(&self, group: usize) -> Range<usize> {
        balanced_range(self.njobs, self.ngroups, group)
    }

    /// Part of the reduction dimension handled by a group member.
    pub fn member_reduction(&self, id_in_group: usize) -> Range<usize> {
        balanced_range(self.reduction_size, self.nthr_per_group, id_in_group)
    }

    /// Elements of workspace, members other than the first of each group need a local buffer.
    pub fn workspace_size(&self) -> usize {
        self.ngroups * (self.nthr_per_group - 1) * self.njobs_per_group_ub * self.job_size
    }
}

/// What a reducer worker is asked to fill.
#[derive(Debug)]
pub struct ReduceTask<'a, T> {
    /// Jobs of the worker's group.
    pub jobs: Range<usize>,
    /// Part of the reduction dimension owned by this worker.
    pub reduction: Range<usize>,
    /// `jobs.len() * job_size` elements, uninitialized from the worker's point of view.
    pub local: &'a mut [T],
}

/// A reducer with its workspace, the workspace lives as long as the reducer.
#[derive(Debug)]
pub struct Reducer<T: WithDType> {
    balancer: ReduceBalancer,
    workspace: AlignedBuffer<T>,
    barriers: BarrierSet,
}

impl<T: WithDType> Reducer<T> {
    pub fn new(balancer: ReduceBalancer) -> Self {
        let workspace = AlignedBuffer::zeros(balancer.workspace_size());
        let barriers = BarrierSet::new(balancer.ngroups, balancer.nthr_per_group);
        Self { balancer, workspace, barriers }
    }

    pub fn balancer(&self) -> &ReduceBalancer {
        &self.balancer
    }

    /// Binds the reducer to a destination of `njobs * job_size` elements for one execution.
    pub fn bind<'a>(&'a mut self, dst: &'a mut [T]) -> Result<BoundReducer<'a, T>> {
        check_len(dst, self.balancer.njobs * self.balancer.job_size, "reduction dst")?;
        Ok(BoundReducer {
            balancer: &self.balancer,
            workspace: SharedMut::new(&mut self.workspace),
            dst: SharedMut::new(dst),
            barriers: &self.barriers,
        })
    }
}

/// A reducer bound to its destination, shared by the workers of a parallel region.
pub struct BoundReducer<'a, T> {
    balancer: &'a ReduceBalancer,
    workspace: SharedMut<'a, T>,
    dst: SharedMut<'a, T>,
    barriers: &'a BarrierSet,
}

impl<'a, T: WithDType> BoundReducer<'a, T> {
    fn local_range(&self, group: usize, id: usize) -> Range<usize> {
        let b = self.balancer;
        let len = b.group_jobs(group).len() * b.job_size;
        let start = ((group * (b.nthr_per_group - 1)) + id - 1) * b.njobs_per_group_ub * b.job_size;
        start..start + len
    }

    /// Lets worker `ithr` fill its local buffer through `f`, then sums the local buffers of the
    /// worker's group into the destination. Idle workers return without calling `f`.
    ///
    /// # Safety
    /// Must be called at most once per worker index and execution, by all the workers of a
    /// parallel region of `balancer.nthr` threads (a group member missing deadlocks the others).
    pub unsafe fn run<F>(&self, ithr: usize, f: F)
    where
        F: FnOnce(ReduceTask<'_, T>),
    {
        let b = self.balancer;
        let Some(group) = b.group_id(ithr) else { return };
        let id = b.id_in_group(ithr);
        let jobs = b.group_jobs(group);
        {
            let local = if id == 0 {
                let r = jobs.start * b.job_size..jobs.end * b.job_size;
                // SAFETY: group job ranges are disjoint, only member 0 writes them before the
                // barrier.
                unsafe { self.dst.slice_mut(r) }
            } else {
                // SAFETY: each member other than 0 has its own workspace slot.
                unsafe { self.workspace.slice_mut(self.local_range(group, id)) }
            };
            f(ReduceTask { jobs: jobs.clone(), reduction: b.member_reduction(id), local });
        }
        if b.nthr_per_group == 1 {
            return;
        }
        self.barriers.wait(group);

        let elems_per_line = (CACHE_LINE / std::mem::size_of::<T>()).max(1);
        let len = jobs.len() * b.job_size;
        let lines = balanced_range(len.div_ceil(elems_per_line), b.nthr_per_group, id);
        let part = (lines.start * elems_per_line).min(len)..(lines.end * elems_per_line).min(len);
        if part.is_empty() {
            return;
        }
        let dst_off = jobs.start * b.job_size;
        // SAFETY: the parts of the group members are disjoint, local buffers are only read
        // after the barrier.
        let dst = unsafe { self.dst.slice_mut(dst_off + part.start..dst_off + part.end) };
        for member in 1..b.nthr_per_group {
            let r = self.local_range(group, member);
            // SAFETY: as above.
            let src = unsafe { self.workspace.slice(r.start + part.start..r.start + part.end) };
            accumulate(dst, src);
        }
    }
}
