//! Interface to the generated convolution kernels.
use crate::buffer::SharedMut;
use crate::{JobConfig, WithDType};
use std::ops::Range;

/// One forward work unit: output row `(od, oh)` of images `mb` for output channel blocks
/// `ocb` of group `g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwdCall {
    pub g: usize,
    pub mb: Range<usize>,
    pub od: usize,
    pub oh: usize,
    pub ocb: Range<usize>,
}

/// One backward-data work unit: diff-source row `(id, ih)` of images `mb` for input channel
/// blocks `icb` of group `g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BwdDataCall {
    pub g: usize,
    pub mb: Range<usize>,
    pub id: usize,
    pub ih: usize,
    pub icb: Range<usize>,
}

pub struct FwdArgs<'a, S, W, D> {
    pub src: &'a [S],
    pub weights: &'a [W],
    /// Bias padded to `ngroups * oc` elements.
    pub bias: Option<&'a [D]>,
    pub dst: SharedMut<'a, D>,
}

pub struct BwdDataArgs<'a, D, W, S> {
    pub diff_dst: &'a [D],
    pub weights: &'a [W],
    pub diff_src: SharedMut<'a, S>,
}

/// Forward kernel. Results are written in place, a panicking kernel aborts the process.
pub trait FwdKernel<S: WithDType, W: WithDType, D: WithDType>: Send + Sync {
    fn name(&self) -> String;

    /// Computes the destination elements covered by `call`.
    ///
    /// Implementations must not access any other element of `args.dst`: the orchestrator hands
    /// out calls with disjoint destinations to concurrent workers.
    fn forward(&self, conf: &JobConfig, args: &FwdArgs<'_, S, W, D>, call: &FwdCall);
}

pub trait BwdDataKernel<D: WithDType, W: WithDType, S: WithDType>: Send + Sync {
    fn name(&self) -> String;

    /// Computes the diff-source elements covered by `call`, with the same exclusivity rule as
    /// `FwdKernel::forward`.
    fn backward_data(&self, conf: &JobConfig, args: &BwdDataArgs<'_, D, W, S>, call: &BwdDataCall);
}

/// Weight-gradient kernel working on transposed activations.
pub trait BwdWeightsKernel<S: WithDType, D: WithDType, W: WithDType>: Send + Sync {
    fn name(&self) -> String;

    /// Accumulates the contribution of one image to the weights of one `(g, ocb, icb)` triple.
    ///
    /// `tr_src` holds the `in_rows` transposed source rows of the input channel block, each row
    /// being `16 x iw`. `tr_diff_dst` holds the `out_rows` transposed rows of the output channel
    /// block, `16 x ow` each. `diff_weights` is the `kd x kh x kw x 16o x 16i` weights block.
    fn backward_weights(
        &self,
        conf: &JobConfig,
        tr_src: &[S],
        tr_diff_dst: &[D],
        diff_weights: &mut [W],
    );
}

/// Reorders `rows` rows of `width x 16` (channel innermost) into `16 x width` (spatial
/// innermost).
pub trait TransposeKernel<T: WithDType>: Send + Sync {
    fn transpose(&self, src: &[T], dst: &mut [T], rows: usize, width: usize);
}
