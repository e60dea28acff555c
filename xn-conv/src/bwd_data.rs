use crate::buffer::SharedMut;
use crate::error::{check_dtype, check_len};
use crate::kernel::{BwdDataArgs, BwdDataCall, BwdDataKernel};
use crate::layout::{BlockedData, BlockedWeights, WeightsFormat, weights_format};
use crate::partition::WorkPartition;
use crate::plan::{Chunk, ChunkAxes, plan_chunks};
use crate::runtime::ThreadPool;
use crate::{ConvKind, Error, JobConfig, Result, WithDType};
use std::marker::PhantomData;

/// Gradient of a convolution with respect to its input.
///
/// Walks `(g, mb block, input row, ic iteration, image in block)`, each kernel call produces
/// `ic_buffs` input channel blocks of one diff-source row.
pub struct ConvolutionBwdData<D, W, S, K>
where
    D: WithDType,
    W: WithDType,
    S: WithDType,
    K: BwdDataKernel<D, W, S>,
{
    conf: JobConfig,
    kernel: K,
    pool: ThreadPool,
    axes: ChunkAxes,
    plan: Vec<Vec<Chunk>>,
    _marker: PhantomData<fn(D, W) -> S>,
}

impl<D, W, S, K> ConvolutionBwdData<D, W, S, K>
where
    D: WithDType,
    W: WithDType,
    S: WithDType,
    K: BwdDataKernel<D, W, S>,
{
    pub fn new(conf: JobConfig, kernel: K, nthr: usize) -> Result<Self> {
        if conf.kind != ConvKind::BackwardData {
            Err(Error::UnsupportedKind { expected: "backward data", got: conf.kind }.bt())?
        }
        conf.validate()?;
        check_dtype(conf.dst_dt, D::DTYPE, "diff_dst")?;
        check_dtype(conf.wei_dt, W::DTYPE, "weights")?;
        check_dtype(conf.src_dt, S::DTYPE, "diff_src")?;

        let axes = ChunkAxes {
            ngroups: conf.ngroups,
            nb_mb: conf.nb_mb,
            rows: conf.in_rows(),
            c_iters: conf.nb_ic / conf.ic_buffs,
            mb_block: conf.mb_block,
        };
        let pool = ThreadPool::new(nthr)?;
        let plan = pool.parallel_collect(|ithr, nthr| plan_chunks(&axes, nthr, ithr));
        tracing::debug!(
            kernel = %kernel.name(),
            weights = %weights_format(&conf),
            nthr = pool.nthr(),
            work_amount = axes.work_amount(),
            ic_buffs = conf.ic_buffs,
            "backward data convolution"
        );
        Ok(Self { conf, kernel, pool, axes, plan, _marker: PhantomData })
    }

    pub fn conf(&self) -> &JobConfig {
        &self.conf
    }

    pub fn nthr(&self) -> usize {
        self.pool.nthr()
    }

    pub fn plan(&self) -> &[Vec<Chunk>] {
        &self.plan
    }

    pub fn work_partition(&self) -> WorkPartition {
        self.axes.partition(self.pool.nthr())
    }

    /// Layout the weights are expected in.
    pub fn weights_format(&self) -> WeightsFormat {
        weights_format(&self.conf)
    }

    fn call(&self, chunk: &Chunk, (id, ih): (usize, usize)) -> BwdDataCall {
        let step = self.conf.ic_buffs;
        let icb = chunk.c_iter * step;
        let mb = chunk.images(self.conf.mb_block);
        BwdDataCall { g: chunk.g, mb, id, ih, icb: icb..icb + step }
    }

    pub fn execute(&mut self, diff_dst: &[D], weights: &[W], diff_src: &mut [S]) -> Result<()> {
        let conf = &self.conf;
        check_len(diff_dst, BlockedData::dst(conf).elem_count(), "diff_dst")?;
        check_len(weights, BlockedWeights::new(conf).elem_count(), "weights")?;
        check_len(diff_src, BlockedData::src(conf).elem_count(), "diff_src")?;
        let args = BwdDataArgs { diff_dst, weights, diff_src: SharedMut::new(diff_src) };
        if conf.is_3d() {
            self.execute_backward_data_3d(&args)
        } else {
            self.execute_backward_data(&args)
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    fn execute_backward_data(&self, args: &BwdDataArgs<'_, D, W, S>) {
        self.pool.parallel(|ithr, _| {
            for chunk in self.plan[ithr].iter() {
                let call = self.call(chunk, (0, chunk.row));
                self.kernel.backward_data(&self.conf, args, &call)
            }
        })
    }

    #[tracing::instrument(skip_all)]
    fn execute_backward_data_3d(&self, args: &BwdDataArgs<'_, D, W, S>) {
        let ih = self.conf.ih;
        self.pool.parallel(|ithr, _| {
            for chunk in self.plan[ithr].iter() {
                let call = self.call(chunk, (chunk.row / ih, chunk.row % ih));
                self.kernel.backward_data(&self.conf, args, &call)
            }
        })
    }
}

impl<D, W, S, K> std::fmt::Debug for ConvolutionBwdData<D, W, S, K>
where
    D: WithDType,
    W: WithDType,
    S: WithDType,
    K: BwdDataKernel<D, W, S>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionBwdData")
            .field("kernel", &self.kernel.name())
            .field("nthr", &self.pool.nthr())
            .field("axes", &self.axes)
            .finish()
    }
}
