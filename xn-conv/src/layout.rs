//! Blocked memory formats used by the convolution kernels.
use crate::{ConvKind, DType, JobConfig, SIMD_W};

/// Activation format: channels split in blocks of 16, the index within a block innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    NChw16c,
    NCdhw16c,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::NChw16c => "nChw16c",
            DataFormat::NCdhw16c => "nCdhw16c",
        }
    }
}

/// Arrangement of the innermost 16x16 (output, input) channel block of the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightsBlock {
    /// `16o16i`, input channel innermost.
    O16I16,
    /// `8o16i2o`, pairs of output channels interleaved, used by the s16 backward-data kernels.
    O8I16O2,
    /// `8i16o2i`, pairs of input channels interleaved, used by the s16 forward kernels.
    I8O16I2,
}

impl WeightsBlock {
    /// Offset of `(o, i)` within one 16x16 block.
    #[inline(always)]
    pub fn offset(&self, o: usize, i: usize) -> usize {
        match self {
            WeightsBlock::O16I16 => o * SIMD_W + i,
            WeightsBlock::O8I16O2 => (o / 2) * 2 * SIMD_W + i * 2 + o % 2,
            WeightsBlock::I8O16I2 => (i / 2) * 2 * SIMD_W + o * 2 + i % 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightsBlock::O16I16 => "16o16i",
            WeightsBlock::O8I16O2 => "8o16i2o",
            WeightsBlock::I8O16I2 => "8i16o2i",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightsFormat {
    pub groups: bool,
    pub depth: bool,
    pub block: WeightsBlock,
}

impl std::fmt::Display for WeightsFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = if self.groups { "g" } else { "" };
        let spatial = if self.depth { "dhw" } else { "hw" };
        write!(f, "{g}OI{spatial}{}", self.block.as_str())
    }
}

pub fn data_format(ndims: usize) -> DataFormat {
    if ndims == 5 { DataFormat::NCdhw16c } else { DataFormat::NChw16c }
}

fn is_mixed_s16(narrow_a: DType, narrow_b: DType, wide: DType) -> bool {
    narrow_a == DType::S16 && narrow_b == DType::S16 && wide == DType::S32
}

/// Weights format for a job, `(g)OI(d)hw` with a 16x16 inner block picked from the pass kind,
/// data types and dimensionality. Buffers are sized from it so it has to be picked first.
pub fn weights_format(conf: &JobConfig) -> WeightsFormat {
    let block = match conf.kind {
        ConvKind::ForwardPlain | ConvKind::ForwardWithActivation { .. } => {
            if is_mixed_s16(conf.src_dt, conf.wei_dt, conf.dst_dt) {
                WeightsBlock::I8O16I2
            } else {
                WeightsBlock::O16I16
            }
        }
        // diff_dst and weights are narrow, diff_src accumulates in the wide type.
        ConvKind::BackwardData => {
            if is_mixed_s16(conf.dst_dt, conf.wei_dt, conf.src_dt) {
                WeightsBlock::O8I16O2
            } else {
                WeightsBlock::O16I16
            }
        }
        ConvKind::BackwardWeights => WeightsBlock::O16I16,
    };
    WeightsFormat { groups: conf.with_groups(), depth: conf.is_3d(), block }
}

/// Geometry of a blocked activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedData {
    pub format: DataFormat,
    pub mb: usize,
    /// Channel blocks over all groups.
    pub nb_c: usize,
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

impl BlockedData {
    /// Source (or diff-source) tensor of a job.
    pub fn src(conf: &JobConfig) -> Self {
        Self {
            format: data_format(conf.ndims),
            mb: conf.mb,
            nb_c: conf.ngroups * conf.nb_ic,
            d: conf.id,
            h: conf.ih,
            w: conf.iw,
        }
    }

    /// Destination (or diff-destination) tensor of a job.
    pub fn dst(conf: &JobConfig) -> Self {
        Self {
            format: data_format(conf.ndims),
            mb: conf.mb,
            nb_c: conf.ngroups * conf.nb_oc,
            d: conf.od,
            h: conf.oh,
            w: conf.ow,
        }
    }

    pub fn elem_count(&self) -> usize {
        self.mb * self.nb_c * self.d * self.h * self.w * SIMD_W
    }

    /// Offset of the first element of the `(d, h)` row of channel block `cb` in image `n`, a
    /// row holds `w * 16` contiguous elements.
    #[inline(always)]
    pub fn row_offset(&self, n: usize, cb: usize, d: usize, h: usize) -> usize {
        (((n * self.nb_c + cb) * self.d + d) * self.h + h) * self.w * SIMD_W
    }

    #[inline(always)]
    pub fn offset(&self, n: usize, cb: usize, d: usize, h: usize, w: usize, c: usize) -> usize {
        self.row_offset(n, cb, d, h) + w * SIMD_W + c
    }

    /// Offset of the spatial block of channel block `cb` in image `n`, `d * h * w * 16`
    /// contiguous elements.
    pub fn block_offset(&self, n: usize, cb: usize) -> usize {
        self.row_offset(n, cb, 0, 0)
    }
}

/// Geometry of a blocked weights tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedWeights {
    pub format: WeightsFormat,
    pub ngroups: usize,
    pub nb_oc: usize,
    pub nb_ic: usize,
    pub kd: usize,
    pub kh: usize,
    pub kw: usize,
}

impl BlockedWeights {
    pub fn new(conf: &JobConfig) -> Self {
        Self {
            format: weights_format(conf),
            ngroups: conf.ngroups,
            nb_oc: conf.nb_oc,
            nb_ic: conf.nb_ic,
            kd: conf.kd,
            kh: conf.kh,
            kw: conf.kw,
        }
    }

    pub fn elem_count(&self) -> usize {
        self.ngroups * self.nb_oc * self.nb_ic * self.block_len()
    }

    /// Elements of the weights of one `(g, ocb, icb)` triple, `kd * kh * kw` 16x16 blocks.
    pub fn block_len(&self) -> usize {
        self.kd * self.kh * self.kw * SIMD_W * SIMD_W
    }

    #[inline(always)]
    pub fn block_offset(&self, g: usize, ocb: usize, icb: usize) -> usize {
        ((g * self.nb_oc + ocb) * self.nb_ic + icb) * self.block_len()
    }

    /// Offset of the weight linking output channel `oc` to input channel `ic`, both relative to
    /// group `g`.
    #[inline(always)]
    pub fn offset(&self, g: usize, oc: usize, ic: usize, kd: usize, kh: usize, kw: usize) -> usize {
        let spatial = ((kd * self.kh + kh) * self.kw + kw) * SIMD_W * SIMD_W;
        self.block_offset(g, oc / SIMD_W, ic / SIMD_W)
            + spatial
            + self.format.block.offset(oc % SIMD_W, ic % SIMD_W)
    }
}
