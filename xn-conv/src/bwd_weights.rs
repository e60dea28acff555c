//! Gradient of a convolution with respect to its weights and bias.
use crate::buffer::{AlignedBuffer, SharedMut};
use crate::error::{check_dtype, check_len};
use crate::kernel::{BwdWeightsKernel, TransposeKernel};
use crate::layout::{BlockedData, BlockedWeights};
use crate::nd_iter::NdIndex;
use crate::padded_bias::PaddedBias;
use crate::partition::balanced_range;
use crate::reducer::{
    BoundReducer, MAX_BUFFER_SIZE, ReduceBalancer, ReduceTask, Reducer, accumulate,
};
use crate::ref_kernels::RefTranspose;
use crate::runtime::{BarrierSet, ThreadPool};
use crate::{ConvKind, Context, Error, JobConfig, Result, SIMD_W, WithDType, bail};
use std::ops::Range;

/// Split of the threads of a backward-weights job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReductionGrid {
    pub nthr_mb: usize,
    pub nthr_g: usize,
    pub nthr_oc_b: usize,
    pub nthr_ic_b: usize,
}

impl ReductionGrid {
    pub const SERIAL: Self = Self { nthr_mb: 1, nthr_g: 1, nthr_oc_b: 1, nthr_ic_b: 1 };

    pub fn new(nthr_mb: usize, nthr_g: usize, nthr_oc_b: usize, nthr_ic_b: usize) -> Self {
        Self { nthr_mb, nthr_g, nthr_oc_b, nthr_ic_b }
    }

    /// Threads used by the job.
    pub fn nthr(&self) -> usize {
        self.nthr_mb * self.nthr_g * self.nthr_oc_b * self.nthr_ic_b
    }

    pub fn validate(&self, max_nthr: usize) -> Result<()> {
        let err = |msg| Err(Error::InvalidGrid { grid: *self, nthr: max_nthr, msg }.bt());
        if [self.nthr_mb, self.nthr_g, self.nthr_oc_b, self.nthr_ic_b].contains(&0) {
            return err("all factors must be positive");
        }
        if self.nthr() > max_nthr.max(1) {
            return err("more threads than available");
        }
        Ok(())
    }

    /// Position of worker `ithr` in the grid and the slices it owns, `ic_b` varies fastest.
    pub fn thread(&self, conf: &JobConfig, ithr: usize) -> ThreadInfo {
        let ithr_ic_b = ithr % self.nthr_ic_b;
        let ithr_oc_b = ithr / self.nthr_ic_b % self.nthr_oc_b;
        let ithr_g = ithr / self.nthr_ic_b / self.nthr_oc_b % self.nthr_g;
        let ithr_mb = ithr / (self.nthr_ic_b * self.nthr_oc_b * self.nthr_g);
        let ithr_but_oc = (ithr_mb * self.nthr_g + ithr_g) * self.nthr_ic_b + ithr_ic_b;
        let ithr_but_ic = (ithr_mb * self.nthr_g + ithr_g) * self.nthr_oc_b + ithr_oc_b;
        ThreadInfo {
            ithr_mb,
            ithr_g,
            ithr_oc_b,
            ithr_ic_b,
            ithr_but_oc,
            ithr_but_ic,
            img: balanced_range(conf.mb, self.nthr_mb, ithr_mb),
            g: balanced_range(conf.ngroups, self.nthr_g, ithr_g),
            oc_b: balanced_range(conf.nb_oc, self.nthr_oc_b, ithr_oc_b),
            ic_b: balanced_range(conf.nb_ic, self.nthr_ic_b, ithr_ic_b),
        }
    }
}

impl std::fmt::Display for ReductionGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { nthr_mb, nthr_g, nthr_oc_b, nthr_ic_b } = self;
        write!(f, "mb:{nthr_mb} g:{nthr_g} oc_b:{nthr_oc_b} ic_b:{nthr_ic_b}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub ithr_mb: usize,
    pub ithr_g: usize,
    pub ithr_oc_b: usize,
    pub ithr_ic_b: usize,
    /// Index among the threads sharing the same transposed source, every coordinate but oc_b.
    pub ithr_but_oc: usize,
    /// Index among the threads sharing the same transposed diff_dst.
    pub ithr_but_ic: usize,
    pub img: Range<usize>,
    pub g: Range<usize>,
    pub oc_b: Range<usize>,
    pub ic_b: Range<usize>,
}

/// Picks the thread grid of a backward-weights job.
///
/// Any split is correct as long as each factor is positive and the product does not exceed
/// `max_nthr`, strategies only trade speed for memory.
pub trait GridStrategy: std::fmt::Debug {
    fn grid(&self, conf: &JobConfig, max_nthr: usize) -> ReductionGrid;
}

/// Minimizes the per-thread memory traffic: source and diff_dst reads plus weights writes,
/// the latter weighted by the reduction round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCostStrategy;

impl MemoryCostStrategy {
    const SRC_COEF: usize = 4;
    const DST_COEF: usize = 1;
    const WEI_COEF: usize = 8;

    pub fn mem_cost(conf: &JobConfig, grid: &ReductionGrid) -> usize {
        let mb = conf.mb.div_ceil(grid.nthr_mb);
        let g = conf.ngroups.div_ceil(grid.nthr_g);
        let nb_oc = conf.nb_oc.div_ceil(grid.nthr_oc_b);
        let nb_ic = conf.nb_ic.div_ceil(grid.nthr_ic_b);
        let src = Self::SRC_COEF * mb * g * nb_ic * conf.ic_block * conf.id * conf.ih * conf.iw
            / conf.stride_d
            / conf.stride_h
            / conf.stride_w;
        let dst = Self::DST_COEF * mb * g * nb_oc * conf.oc_block * conf.od * conf.oh * conf.ow;
        let wei = Self::WEI_COEF
            * g
            * nb_oc
            * nb_ic
            * conf.kd
            * conf.kh
            * conf.kw
            * conf.ic_block
            * conf.oc_block;
        src + dst + wei
    }
}

impl GridStrategy for MemoryCostStrategy {
    fn grid(&self, conf: &JobConfig, max_nthr: usize) -> ReductionGrid {
        let max_nthr = max_nthr.max(1);
        let mut grid = ReductionGrid::SERIAL;
        // Fewer threads than groups, not worth splitting anything.
        if max_nthr < conf.ngroups {
            return grid;
        }
        grid.nthr_g = conf.ngroups;
        let nthr = max_nthr / grid.nthr_g;
        let mut best = Self::mem_cost(conf, &grid);
        for nthr_mb in 1..=nthr.min(conf.mb) {
            let nthr_par = nthr / nthr_mb;
            for nthr_oc_b in 1..=nthr_par.min(conf.nb_oc) {
                let nthr_ic_b = (nthr_par / nthr_oc_b).min(conf.nb_ic);
                let candidate = ReductionGrid { nthr_mb, nthr_g: grid.nthr_g, nthr_oc_b, nthr_ic_b };
                let cost = Self::mem_cost(conf, &candidate);
                if cost <= best {
                    best = cost;
                    grid = candidate;
                }
            }
        }
        if grid.nthr_mb > max_nthr / 2 && grid.nthr_mb < max_nthr {
            grid.nthr_mb = conf.mb.min(max_nthr);
        }
        grid
    }
}

/// A fixed split, validated against the available threads at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedGrid(pub ReductionGrid);

impl GridStrategy for FixedGrid {
    fn grid(&self, _conf: &JobConfig, _max_nthr: usize) -> ReductionGrid {
        self.0
    }
}

/// Geometry of a transposition scratch buffer: one slot per sharing set of threads, each slot
/// holding `[g][c_b][row][16][width]` for the largest group and channel slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrLayout {
    slots: usize,
    g_ub: usize,
    c_b_ub: usize,
    rows: usize,
    row_len: usize,
}

impl TrLayout {
    fn block_len(&self) -> usize {
        self.rows * self.row_len
    }

    fn slot_len(&self) -> usize {
        self.g_ub * self.c_b_ub * self.block_len()
    }

    fn len(&self) -> usize {
        self.slots * self.slot_len()
    }

    fn offset(&self, slot: usize, gl: usize, cl: usize, row: usize) -> usize {
        slot * self.slot_len() + ((gl * self.c_b_ub + cl) * self.rows + row) * self.row_len
    }
}

struct Barriers {
    tr_src: BarrierSet,
    tr_diff_dst: BarrierSet,
    reduction: BarrierSet,
}

/// Weights gradient over a `mb x g x oc_b x ic_b` thread grid.
///
/// Threads of the same minibatch slice own disjoint `(g, ocb, icb)` blocks of one weights
/// buffer. Slice 0 accumulates in the caller's buffer, the others in workspace copies summed
/// into it at the end. Source rows are transposed into slots shared by the threads that only
/// differ by their `oc_b` position (diff_dst rows by their `ic_b` position), with a barrier
/// around every transposition.
pub struct ConvolutionBwdWeights<S, D, W, K, T = RefTranspose>
where
    S: WithDType,
    D: WithDType,
    W: WithDType,
    K: BwdWeightsKernel<S, D, W>,
    T: TransposeKernel<S> + TransposeKernel<D>,
{
    conf: JobConfig,
    kernel: K,
    transpose: T,
    pool: ThreadPool,
    grid: ReductionGrid,
    tr_src_l: TrLayout,
    tr_diff_dst_l: TrLayout,
    tr_src: AlignedBuffer<S>,
    tr_diff_dst: AlignedBuffer<D>,
    ws_reduction: AlignedBuffer<W>,
    barriers: Barriers,
    padded_bias: Option<PaddedBias<W>>,
    bias_reducer: Option<Reducer<W>>,
}

impl<S, D, W, K, T> ConvolutionBwdWeights<S, D, W, K, T>
where
    S: WithDType,
    D: WithDType,
    W: WithDType,
    K: BwdWeightsKernel<S, D, W>,
    T: TransposeKernel<S> + TransposeKernel<D>,
{
    pub fn new(
        conf: JobConfig,
        kernel: K,
        transpose: T,
        nthr: usize,
        strategy: &dyn GridStrategy,
    ) -> Result<Self> {
        if conf.kind != ConvKind::BackwardWeights {
            Err(Error::UnsupportedKind { expected: "backward weights", got: conf.kind }.bt())?
        }
        conf.validate()?;
        check_dtype(conf.src_dt, S::DTYPE, "src")?;
        check_dtype(conf.dst_dt, D::DTYPE, "diff_dst")?;
        check_dtype(conf.wei_dt, W::DTYPE, "diff_weights")?;

        let grid = strategy.grid(&conf, nthr);
        grid.validate(nthr)?;
        let tr_src_l = TrLayout {
            slots: grid.nthr_mb * grid.nthr_g * grid.nthr_ic_b,
            g_ub: conf.ngroups.div_ceil(grid.nthr_g),
            c_b_ub: conf.nb_ic.div_ceil(grid.nthr_ic_b),
            rows: conf.in_rows(),
            row_len: SIMD_W * conf.iw,
        };
        let tr_diff_dst_l = TrLayout {
            slots: grid.nthr_mb * grid.nthr_g * grid.nthr_oc_b,
            g_ub: conf.ngroups.div_ceil(grid.nthr_g),
            c_b_ub: conf.nb_oc.div_ceil(grid.nthr_oc_b),
            rows: conf.out_rows(),
            row_len: SIMD_W * conf.ow,
        };
        let wei_size = BlockedWeights::new(&conf).elem_count();
        let barriers = Barriers {
            tr_src: BarrierSet::new(tr_src_l.slots, grid.nthr_oc_b),
            tr_diff_dst: BarrierSet::new(tr_diff_dst_l.slots, grid.nthr_ic_b),
            reduction: BarrierSet::new(1, grid.nthr()),
        };
        let padded_bias =
            conf.want_padded_bias().then(|| PaddedBias::new(conf.oc, conf.oc_without_padding));
        let bias_reducer = conf.with_bias.then(|| {
            let njobs = conf.ngroups * conf.nb_oc;
            Reducer::new(ReduceBalancer::new(grid.nthr(), SIMD_W, njobs, conf.mb, MAX_BUFFER_SIZE))
        });
        let pool = ThreadPool::new(grid.nthr())?;
        tracing::debug!(
            kernel = %kernel.name(),
            %grid,
            tr_src = tr_src_l.len(),
            tr_diff_dst = tr_diff_dst_l.len(),
            ws_reduction = (grid.nthr_mb - 1) * wei_size,
            padded_bias = padded_bias.is_some(),
            "backward weights convolution"
        );
        Ok(Self {
            tr_src: AlignedBuffer::zeros(tr_src_l.len()),
            tr_diff_dst: AlignedBuffer::zeros(tr_diff_dst_l.len()),
            ws_reduction: AlignedBuffer::zeros((grid.nthr_mb - 1) * wei_size),
            conf,
            kernel,
            transpose,
            pool,
            grid,
            tr_src_l,
            tr_diff_dst_l,
            barriers,
            padded_bias,
            bias_reducer,
        })
    }

    pub fn conf(&self) -> &JobConfig {
        &self.conf
    }

    pub fn grid(&self) -> ReductionGrid {
        self.grid
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn nthr(&self) -> usize {
        self.pool.nthr()
    }

    /// Elements of the transposed source scratch buffer.
    pub fn tr_src_len(&self) -> usize {
        self.tr_src.len()
    }

    pub fn tr_diff_dst_len(&self) -> usize {
        self.tr_diff_dst.len()
    }

    /// Elements of the partial weights gradients, `nthr_mb - 1` full copies.
    pub fn ws_reduction_len(&self) -> usize {
        self.ws_reduction.len()
    }

    pub fn bias_balancer(&self) -> Option<&ReduceBalancer> {
        self.bias_reducer.as_ref().map(|r| r.balancer())
    }

    pub fn padded_bias(&self) -> Option<&PaddedBias<W>> {
        self.padded_bias.as_ref()
    }

    /// Overwrites `diff_weights` (and `diff_bias` when configured with bias).
    #[tracing::instrument(skip_all)]
    pub fn execute(
        &mut self,
        src: &[S],
        diff_dst: &[D],
        diff_weights: &mut [W],
        mut diff_bias: Option<&mut [W]>,
    ) -> Result<()> {
        let Self {
            conf,
            kernel,
            transpose,
            pool,
            grid,
            tr_src_l,
            tr_diff_dst_l,
            tr_src,
            tr_diff_dst,
            ws_reduction,
            barriers,
            padded_bias,
            bias_reducer,
        } = self;
        let wei_l = BlockedWeights::new(conf);
        check_len(src, BlockedData::src(conf).elem_count(), "src")?;
        check_len(diff_dst, BlockedData::dst(conf).elem_count(), "diff_dst")?;
        check_len(diff_weights, wei_l.elem_count(), "diff_weights")?;
        match (conf.with_bias, diff_bias.as_deref()) {
            (false, None) => {}
            (false, Some(_)) => bail!("diff_bias given to a convolution configured without bias"),
            (true, None) => bail!("missing diff_bias"),
            (true, Some(b)) => {
                let expected = if padded_bias.is_some() {
                    conf.oc_without_padding
                } else {
                    conf.bias_elem_count()
                };
                check_len(b, expected, "diff_bias")?
            }
        }

        {
            let bias_dst = match padded_bias.as_mut() {
                Some(padded) => Some(padded.as_mut_slice()),
                None => diff_bias.as_deref_mut(),
            };
            let bias = match (bias_reducer.as_mut(), bias_dst) {
                (Some(reducer), Some(dst)) => {
                    Some(reducer.bind(dst).context("diff_bias reducer")?)
                }
                _ => None,
            };
            let ctx = ExecCtx {
                conf,
                grid: *grid,
                kernel: &*kernel,
                transpose: &*transpose,
                src,
                diff_dst,
                wei_l,
                wei_size: wei_l.elem_count(),
                diff_weights: SharedMut::new(diff_weights),
                tr_src_l: *tr_src_l,
                tr_diff_dst_l: *tr_diff_dst_l,
                tr_src: SharedMut::new(tr_src),
                tr_diff_dst: SharedMut::new(tr_diff_dst),
                ws_reduction: SharedMut::new(ws_reduction),
                barriers,
                bias,
            };
            pool.parallel(|ithr, _| ctx.run(ithr));
        }

        if let Some(padded) = padded_bias.as_mut() {
            padded.zero_tail();
            if let Some(diff_bias) = diff_bias {
                padded.store(diff_bias).context("storing padded diff_bias")?;
            }
        }
        Ok(())
    }
}

impl<S, D, W, K, T> std::fmt::Debug for ConvolutionBwdWeights<S, D, W, K, T>
where
    S: WithDType,
    D: WithDType,
    W: WithDType,
    K: BwdWeightsKernel<S, D, W>,
    T: TransposeKernel<S> + TransposeKernel<D>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionBwdWeights")
            .field("kernel", &self.kernel.name())
            .field("grid", &self.grid)
            .field("tr_src", &self.tr_src)
            .field("tr_diff_dst", &self.tr_diff_dst)
            .field("ws_reduction", &self.ws_reduction)
            .finish()
    }
}

// Everything a worker needs for one execution.
struct ExecCtx<'a, S, D, W, K, T> {
    conf: &'a JobConfig,
    grid: ReductionGrid,
    kernel: &'a K,
    transpose: &'a T,
    src: &'a [S],
    diff_dst: &'a [D],
    wei_l: BlockedWeights,
    wei_size: usize,
    diff_weights: SharedMut<'a, W>,
    tr_src_l: TrLayout,
    tr_diff_dst_l: TrLayout,
    tr_src: SharedMut<'a, S>,
    tr_diff_dst: SharedMut<'a, D>,
    ws_reduction: SharedMut<'a, W>,
    barriers: &'a Barriers,
    bias: Option<BoundReducer<'a, W>>,
}

/// Transposes the `share` part of the `[g][c_b][row]` rows of image `img` into `slot`.
#[allow(clippy::too_many_arguments)]
fn transpose_share<X: WithDType, T: TransposeKernel<X>>(
    transpose: &T,
    data: &BlockedData,
    from: &[X],
    to: SharedMut<'_, X>,
    l: &TrLayout,
    slot: usize,
    img: usize,
    g: &Range<usize>,
    nb_c: usize,
    c_b: &Range<usize>,
    mut share: Range<usize>,
) {
    if share.is_empty() {
        return;
    }
    let mut idx = NdIndex::init(share.start, [g.len(), c_b.len(), l.rows]);
    while !share.is_empty() {
        let [gl, cl, row] = idx.coords();
        let n = idx.run_len(&share);
        let cb = (g.start + gl) * nb_c + c_b.start + cl;
        let s = data.block_offset(img, cb) + row * l.row_len;
        let d = l.offset(slot, gl, cl, row);
        // SAFETY: the shares of the threads of a slot are disjoint and nobody reads the slot
        // between the two barriers surrounding the transposition.
        let dst = unsafe { to.slice_mut(d..d + n * l.row_len) };
        transpose.transpose(&from[s..s + n * l.row_len], dst, n, l.row_len / SIMD_W);
        (share, idx) = idx.advance(share);
    }
}

impl<S, D, W, K, T> ExecCtx<'_, S, D, W, K, T>
where
    S: WithDType,
    D: WithDType,
    W: WithDType,
    K: BwdWeightsKernel<S, D, W>,
    T: TransposeKernel<S> + TransposeKernel<D>,
{
    fn run(&self, ithr: usize) {
        let ti = self.grid.thread(self.conf, ithr);
        self.compute_diff_weights(&ti);
        if self.grid.nthr_mb > 1 {
            self.barriers.reduction.wait(0);
            self.reduce_diff_weights(&ti);
        }
        if let Some(bias) = self.bias.as_ref() {
            // SAFETY: every worker of the region runs this exactly once.
            unsafe { bias.run(ithr, |task| self.compute_diff_bias(task)) }
        }
    }

    // Partial weights of minibatch slice `ithr_mb`, its offset in the matching buffer.
    fn target(&self, ithr_mb: usize) -> (SharedMut<'_, W>, usize) {
        match ithr_mb {
            0 => (self.diff_weights, 0),
            _ => (self.ws_reduction, (ithr_mb - 1) * self.wei_size),
        }
    }

    fn compute_diff_weights(&self, ti: &ThreadInfo) {
        let conf = self.conf;
        let (target, base) = self.target(ti.ithr_mb);
        let block_len = self.wei_l.block_len();
        let blocks = || {
            ti.g.clone().flat_map(move |g| {
                ti.oc_b.clone().flat_map(move |ocb| ti.ic_b.clone().map(move |icb| (g, ocb, icb)))
            })
        };
        for (g, ocb, icb) in blocks() {
            let off = base + self.wei_l.block_offset(g, ocb, icb);
            // SAFETY: the threads of a minibatch slice own disjoint blocks.
            unsafe { target.slice_mut(off..off + block_len) }.fill(W::zero());
        }

        let src_l = BlockedData::src(conf);
        let dst_l = BlockedData::dst(conf);
        for img in ti.img.clone() {
            let l = &self.tr_src_l;
            let work = ti.g.len() * ti.ic_b.len() * l.rows;
            let share = balanced_range(work, self.grid.nthr_oc_b, ti.ithr_oc_b);
            self.barriers.tr_src.wait(ti.ithr_but_oc);
            transpose_share::<S, T>(
                self.transpose,
                &src_l,
                self.src,
                self.tr_src,
                l,
                ti.ithr_but_oc,
                img,
                &ti.g,
                conf.nb_ic,
                &ti.ic_b,
                share,
            );
            self.barriers.tr_src.wait(ti.ithr_but_oc);

            let l = &self.tr_diff_dst_l;
            let work = ti.g.len() * ti.oc_b.len() * l.rows;
            let share = balanced_range(work, self.grid.nthr_ic_b, ti.ithr_ic_b);
            self.barriers.tr_diff_dst.wait(ti.ithr_but_ic);
            transpose_share::<D, T>(
                self.transpose,
                &dst_l,
                self.diff_dst,
                self.tr_diff_dst,
                l,
                ti.ithr_but_ic,
                img,
                &ti.g,
                conf.nb_oc,
                &ti.oc_b,
                share,
            );
            self.barriers.tr_diff_dst.wait(ti.ithr_but_ic);

            for (g, ocb, icb) in blocks() {
                let gl = g - ti.g.start;
                let s = self.tr_src_l.offset(ti.ithr_but_oc, gl, icb - ti.ic_b.start, 0);
                let d = self.tr_diff_dst_l.offset(ti.ithr_but_ic, gl, ocb - ti.oc_b.start, 0);
                let w = base + self.wei_l.block_offset(g, ocb, icb);
                // SAFETY: transposed slots are only read until the next barrier, weights blocks
                // are owned by this thread.
                let (tr_src, tr_diff_dst, diff_weights) = unsafe {
                    (
                        self.tr_src.slice(s..s + self.tr_src_l.block_len()),
                        self.tr_diff_dst.slice(d..d + self.tr_diff_dst_l.block_len()),
                        target.slice_mut(w..w + block_len),
                    )
                };
                self.kernel.backward_weights(conf, tr_src, tr_diff_dst, diff_weights)
            }
        }
    }

    /// Sums the partial buffers into the caller's one, the `(g, oc_b, ic_b)` slice of this
    /// thread being split between the threads of all the minibatch slices.
    fn reduce_diff_weights(&self, ti: &ThreadInfo) {
        let conf = self.conf;
        let kdh = conf.kd * conf.kh;
        let unit = conf.kw * SIMD_W * SIMD_W;
        let ic_b_kdh_work = ti.ic_b.len() * kdh;
        let work = ti.g.len() * ti.oc_b.len() * ic_b_kdh_work;
        let range = balanced_range(work, self.grid.nthr_mb, ti.ithr_mb);
        if range.is_empty() {
            return;
        }
        for thr_mb in 1..self.grid.nthr_mb {
            let ws_base = (thr_mb - 1) * self.wei_size;
            let mut r = range.clone();
            let mut idx = NdIndex::init(r.start, [ti.g.len(), ti.oc_b.len(), ic_b_kdh_work]);
            while !r.is_empty() {
                let [gl, ocl, ic_kdh] = idx.coords();
                let n = idx.run_len(&r);
                let off = self.wei_l.block_offset(
                    ti.g.start + gl,
                    ti.oc_b.start + ocl,
                    ti.ic_b.start + ic_kdh / kdh,
                ) + (ic_kdh % kdh) * unit;
                let len = n * unit;
                // SAFETY: the reduction ranges are disjoint and the partial buffers are no
                // longer written after the reduction barrier.
                let (dst, src) = unsafe {
                    (
                        self.diff_weights.slice_mut(off..off + len),
                        self.ws_reduction.slice(ws_base + off..ws_base + off + len),
                    )
                };
                accumulate(dst, src);
                (r, idx) = idx.advance(r);
            }
        }
    }

    /// Per channel sums of diff_dst over the images of the task, one job per `(g, ocb)`.
    fn compute_diff_bias(&self, task: ReduceTask<'_, W>) {
        let conf = self.conf;
        let dst_l = BlockedData::dst(conf);
        let spatial = conf.od * conf.oh * conf.ow * SIMD_W;
        task.local.fill(W::zero());
        for img in task.reduction.clone() {
            for (j, job) in task.jobs.clone().enumerate() {
                let off = dst_l.block_offset(img, job);
                let local = &mut task.local[j * SIMD_W..(j + 1) * SIMD_W];
                let mut acc = [0f64; SIMD_W];
                for px in self.diff_dst[off..off + spatial].chunks_exact(SIMD_W) {
                    for (a, v) in acc.iter_mut().zip(px.iter()) {
                        *a += v.to_f64()
                    }
                }
                for (l, a) in local.iter_mut().zip(acc.iter()) {
                    *l = W::from_f64(l.to_f64() + a)
                }
            }
        }
    }
}
