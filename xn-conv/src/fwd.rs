use crate::buffer::SharedMut;
use crate::error::{check_dtype, check_len};
use crate::kernel::{FwdArgs, FwdCall, FwdKernel};
use crate::layout::{BlockedData, BlockedWeights};
use crate::padded_bias::PaddedBias;
use crate::partition::WorkPartition;
use crate::plan::{Chunk, ChunkAxes, plan_chunks};
use crate::runtime::ThreadPool;
use crate::{Context, Error, JobConfig, Result, WithDType, bail};
use std::marker::PhantomData;

/// Forward convolution, `dst = relu?(conv(src, weights) + bias)`.
///
/// The iteration space `(g, mb block, output row, oc iteration, image in block)` is split
/// between the workers once, at construction. Every `execute` replays the same plan.
pub struct ConvolutionFwd<S, W, D, K>
where
    S: WithDType,
    W: WithDType,
    D: WithDType,
    K: FwdKernel<S, W, D>,
{
    conf: JobConfig,
    kernel: K,
    pool: ThreadPool,
    axes: ChunkAxes,
    // Output channel blocks per kernel call.
    step: usize,
    plan: Vec<Vec<Chunk>>,
    padded_bias: Option<PaddedBias<D>>,
    _marker: PhantomData<fn(S, W) -> D>,
}

impl<S, W, D, K> ConvolutionFwd<S, W, D, K>
where
    S: WithDType,
    W: WithDType,
    D: WithDType,
    K: FwdKernel<S, W, D>,
{
    pub fn new(conf: JobConfig, kernel: K, nthr: usize) -> Result<Self> {
        if !conf.kind.is_forward() {
            Err(Error::UnsupportedKind { expected: "forward", got: conf.kind }.bt())?
        }
        conf.validate()?;
        check_dtype(conf.src_dt, S::DTYPE, "src")?;
        check_dtype(conf.wei_dt, W::DTYPE, "weights")?;
        check_dtype(conf.dst_dt, D::DTYPE, "dst")?;

        // The buffered kernels load `oc_buffs` consecutive blocks, width dilation rules that out.
        let step = if conf.dilate_w != 0 { 1 } else { conf.oc_buffs };
        let axes = ChunkAxes {
            ngroups: conf.ngroups,
            nb_mb: conf.nb_mb,
            rows: conf.out_rows(),
            c_iters: conf.nb_oc / step,
            mb_block: conf.mb_block,
        };
        let pool = ThreadPool::new(nthr)?;
        let plan = pool.parallel_collect(|ithr, nthr| plan_chunks(&axes, nthr, ithr));
        let padded_bias =
            conf.want_padded_bias().then(|| PaddedBias::new(conf.oc, conf.oc_without_padding));
        tracing::debug!(
            kernel = %kernel.name(),
            kind = conf.kind.as_str(),
            nthr = pool.nthr(),
            work_amount = axes.work_amount(),
            step,
            padded_bias = padded_bias.is_some(),
            "forward convolution"
        );
        Ok(Self { conf, kernel, pool, axes, step, plan, padded_bias, _marker: PhantomData })
    }

    pub fn conf(&self) -> &JobConfig {
        &self.conf
    }

    pub fn nthr(&self) -> usize {
        self.pool.nthr()
    }

    /// Chunks handed to each worker, indexed by worker.
    pub fn plan(&self) -> &[Vec<Chunk>] {
        &self.plan
    }

    pub fn work_partition(&self) -> WorkPartition {
        self.axes.partition(self.pool.nthr())
    }

    pub fn padded_bias(&self) -> Option<&PaddedBias<D>> {
        self.padded_bias.as_ref()
    }

    fn call(&self, chunk: &Chunk, (od, oh): (usize, usize)) -> FwdCall {
        let ocb = chunk.c_iter * self.step;
        let mb = chunk.images(self.conf.mb_block);
        FwdCall { g: chunk.g, mb, od, oh, ocb: ocb..ocb + self.step }
    }

    pub fn execute(
        &mut self,
        src: &[S],
        weights: &[W],
        bias: Option<&[D]>,
        dst: &mut [D],
    ) -> Result<()> {
        let conf = &self.conf;
        check_len(src, BlockedData::src(conf).elem_count(), "src")?;
        check_len(weights, BlockedWeights::new(conf).elem_count(), "weights")?;
        check_len(dst, BlockedData::dst(conf).elem_count(), "dst")?;
        match (conf.with_bias, bias) {
            (false, Some(_)) => bail!("bias given to a convolution configured without bias"),
            (true, None) => bail!("missing bias"),
            _ => {}
        }
        if let (Some(padded), Some(bias)) = (self.padded_bias.as_mut(), bias) {
            padded.load(bias).context("loading padded bias")?;
        }
        let bias = match (bias, self.padded_bias.as_ref()) {
            (None, _) => None,
            (Some(_), Some(padded)) => Some(padded.as_slice()),
            (Some(bias), None) => {
                check_len(bias, self.conf.bias_elem_count(), "bias")?;
                Some(bias)
            }
        };
        let args = FwdArgs { src, weights, bias, dst: SharedMut::new(dst) };
        if self.conf.is_3d() { self.execute_forward_3d(&args) } else { self.execute_forward(&args) }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    fn execute_forward(&self, args: &FwdArgs<'_, S, W, D>) {
        self.pool.parallel(|ithr, _| {
            for chunk in self.plan[ithr].iter() {
                let call = self.call(chunk, (0, chunk.row));
                self.kernel.forward(&self.conf, args, &call)
            }
        })
    }

    #[tracing::instrument(skip_all)]
    fn execute_forward_3d(&self, args: &FwdArgs<'_, S, W, D>) {
        let oh = self.conf.oh;
        self.pool.parallel(|ithr, _| {
            for chunk in self.plan[ithr].iter() {
                let call = self.call(chunk, (chunk.row / oh, chunk.row % oh));
                self.kernel.forward(&self.conf, args, &call)
            }
        })
    }
}

impl<S, W, D, K> std::fmt::Debug for ConvolutionFwd<S, W, D, K>
where
    S: WithDType,
    W: WithDType,
    D: WithDType,
    K: FwdKernel<S, W, D>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionFwd")
            .field("kernel", &self.kernel.name())
            .field("nthr", &self.pool.nthr())
            .field("axes", &self.axes)
            .field("step", &self.step)
            .finish()
    }
}
