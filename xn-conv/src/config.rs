use crate::{DType, Error, Result};

/// Channel block width, the number of f32 lanes in a 512-bit vector register.
pub const SIMD_W: usize = 16;

/// The pass a job computes, selected once when the job is configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvKind {
    ForwardPlain,
    /// Forward pass with a fused leaky ReLU, a slope of 0 is a plain ReLU.
    ForwardWithActivation {
        negative_slope: f32,
    },
    BackwardData,
    BackwardWeights,
}

impl ConvKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvKind::ForwardPlain => "fwd",
            ConvKind::ForwardWithActivation { .. } => "fwd_relu",
            ConvKind::BackwardData => "bwd_data",
            ConvKind::BackwardWeights => "bwd_weights",
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, ConvKind::ForwardPlain | ConvKind::ForwardWithActivation { .. })
    }

    pub fn relu_slope(&self) -> Option<f32> {
        match self {
            ConvKind::ForwardWithActivation { negative_slope } => Some(*negative_slope),
            _ => None,
        }
    }
}

/// User facing description of a convolution.
///
/// Channel counts are per group. Dilations use the "extra gap" convention: 0 is a dense
/// kernel, 1 skips every other input element. Axis arrays are ordered depth, height, width.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvDesc {
    pub groups: usize,
    pub mb: usize,
    pub ic: usize,
    pub oc: usize,
    /// Input depth, `None` for 2d convolutions.
    pub id: Option<usize>,
    pub ih: usize,
    pub iw: usize,
    pub kd: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    /// Source (or diff-source) element type.
    pub src_dtype: DType,
    /// Weights (or diff-weights) element type.
    pub wei_dtype: DType,
    /// Destination (or diff-destination) element type.
    pub dst_dtype: DType,
    pub with_bias: bool,
}

impl Default for ConvDesc {
    fn default() -> Self {
        Self {
            groups: 1,
            mb: 1,
            ic: SIMD_W,
            oc: SIMD_W,
            id: None,
            ih: 1,
            iw: 1,
            kd: 1,
            kh: 1,
            kw: 1,
            stride: [1; 3],
            padding: [0; 3],
            dilation: [0; 3],
            src_dtype: DType::F32,
            wei_dtype: DType::F32,
            dst_dtype: DType::F32,
            with_bias: false,
        }
    }
}

/// Blocking knobs normally picked by the kernel generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTuning {
    pub mb_block: usize,
    pub ic_buffs: usize,
    pub oc_buffs: usize,
}

impl Default for ConvTuning {
    fn default() -> Self {
        Self { mb_block: 1, ic_buffs: 1, oc_buffs: 1 }
    }
}

/// Resolved configuration of one convolution job, read-only once built.
///
/// `ic` and `oc` are per group and padded to a multiple of the channel block.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub kind: ConvKind,
    pub ndims: usize,
    pub ngroups: usize,
    pub mb: usize,
    pub mb_block: usize,
    pub nb_mb: usize,
    pub ic: usize,
    pub oc: usize,
    pub ic_without_padding: usize,
    pub oc_without_padding: usize,
    pub ic_block: usize,
    pub oc_block: usize,
    pub nb_ic: usize,
    pub nb_oc: usize,
    pub ic_buffs: usize,
    pub oc_buffs: usize,
    pub id: usize,
    pub ih: usize,
    pub iw: usize,
    pub od: usize,
    pub oh: usize,
    pub ow: usize,
    pub kd: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_d: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub f_pad: usize,
    pub t_pad: usize,
    pub l_pad: usize,
    pub dilate_d: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
    pub src_dt: DType,
    pub wei_dt: DType,
    pub dst_dt: DType,
    pub with_bias: bool,
}

// Largest divisor of `n` that is not above `hint`.
fn divisor_at_most(n: usize, hint: usize) -> usize {
    (1..=hint.clamp(1, n.max(1))).rev().find(|d| n.is_multiple_of(*d)).unwrap_or(1)
}

fn out_size(i: usize, k: usize, stride: usize, pad: usize, dilate: usize) -> Result<usize> {
    let ext = (k - 1) * (dilate + 1) + 1;
    if i + 2 * pad < ext {
        return Err(Error::invalid_config(format!(
            "kernel extent {ext} is larger than the padded input {}",
            i + 2 * pad
        )));
    }
    Ok((i + 2 * pad - ext) / stride + 1)
}

impl JobConfig {
    pub fn new(kind: ConvKind, desc: &ConvDesc, tuning: ConvTuning) -> Result<Self> {
        let ConvDesc { groups, mb, ic, oc, id, ih, iw, kd, kh, kw, .. } = *desc;
        if [groups, mb, ic, oc, ih, iw, kd, kh, kw].contains(&0) || id == Some(0) {
            return Err(Error::invalid_config(format!("zero sized dimension in {desc:?}")));
        }
        if desc.stride.contains(&0) {
            return Err(Error::invalid_config(format!("zero stride {:?}", desc.stride)));
        }
        let ndims = if id.is_some() { 5 } else { 4 };
        let (id, kd) = match id {
            Some(id) => (id, kd),
            None => (1, 1),
        };
        let [stride_d, stride_h, stride_w] = desc.stride;
        let [f_pad, t_pad, l_pad] = desc.padding;
        let [dilate_d, dilate_h, dilate_w] = desc.dilation;
        let (stride_d, f_pad, dilate_d) =
            if ndims == 5 { (stride_d, f_pad, dilate_d) } else { (1, 0, 0) };
        let od = out_size(id, kd, stride_d, f_pad, dilate_d)?;
        let oh = out_size(ih, kh, stride_h, t_pad, dilate_h)?;
        let ow = out_size(iw, kw, stride_w, l_pad, dilate_w)?;

        let nb_ic = ic.div_ceil(SIMD_W);
        let nb_oc = oc.div_ceil(SIMD_W);
        let mb_block = divisor_at_most(mb, tuning.mb_block);
        let conf = Self {
            kind,
            ndims,
            ngroups: groups,
            mb,
            mb_block,
            nb_mb: mb / mb_block,
            ic: nb_ic * SIMD_W,
            oc: nb_oc * SIMD_W,
            ic_without_padding: ic,
            oc_without_padding: oc,
            ic_block: SIMD_W,
            oc_block: SIMD_W,
            nb_ic,
            nb_oc,
            ic_buffs: divisor_at_most(nb_ic, tuning.ic_buffs),
            oc_buffs: divisor_at_most(nb_oc, tuning.oc_buffs),
            id,
            ih,
            iw,
            od,
            oh,
            ow,
            kd,
            kh,
            kw,
            stride_d,
            stride_h,
            stride_w,
            f_pad,
            t_pad,
            l_pad,
            dilate_d,
            dilate_h,
            dilate_w,
            src_dt: desc.src_dtype,
            wei_dt: desc.wei_dtype,
            dst_dt: desc.dst_dtype,
            with_bias: desc.with_bias,
        };
        conf.validate()?;
        Ok(conf)
    }

    /// Checks the invariants the orchestrators rely on when splitting work between threads.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ngroups", self.ngroups),
            ("mb", self.mb),
            ("mb_block", self.mb_block),
            ("nb_mb", self.nb_mb),
            ("nb_ic", self.nb_ic),
            ("nb_oc", self.nb_oc),
            ("ic_buffs", self.ic_buffs),
            ("oc_buffs", self.oc_buffs),
            ("id", self.id),
            ("ih", self.ih),
            ("iw", self.iw),
            ("od", self.od),
            ("oh", self.oh),
            ("ow", self.ow),
            ("kd", self.kd),
            ("kh", self.kh),
            ("kw", self.kw),
            ("stride_d", self.stride_d),
            ("stride_h", self.stride_h),
            ("stride_w", self.stride_w),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::invalid_config(format!("{name} must be positive")));
        }
        if self.ndims != 4 && self.ndims != 5 {
            return Err(Error::invalid_config(format!("unsupported ndims {}", self.ndims)));
        }
        if self.ndims == 4 && (self.id != 1 || self.od != 1 || self.kd != 1) {
            return Err(Error::invalid_config("2d convolution with a depth dimension"));
        }
        if self.ic_block != SIMD_W || self.oc_block != SIMD_W {
            return Err(Error::invalid_config(format!(
                "channel blocks must be {SIMD_W}, got ic_block {} oc_block {}",
                self.ic_block, self.oc_block
            )));
        }
        if self.ic != self.nb_ic * self.ic_block || self.oc != self.nb_oc * self.oc_block {
            return Err(Error::invalid_config("channel counts do not match their block counts"));
        }
        if self.oc_without_padding > self.oc || self.ic_without_padding > self.ic {
            return Err(Error::invalid_config(format!(
                "unpadded channels larger than padded ones, oc {}/{} ic {}/{}",
                self.oc_without_padding, self.oc, self.ic_without_padding, self.ic
            )));
        }
        if self.mb != self.nb_mb * self.mb_block {
            return Err(Error::invalid_config(format!(
                "mb {} is not nb_mb {} x mb_block {}",
                self.mb, self.nb_mb, self.mb_block
            )));
        }
        if !self.nb_oc.is_multiple_of(self.oc_buffs) || !self.nb_ic.is_multiple_of(self.ic_buffs)
        {
            return Err(Error::invalid_config(format!(
                "buffering does not divide the block counts, nb_oc {} oc_buffs {} nb_ic {} ic_buffs {}",
                self.nb_oc, self.oc_buffs, self.nb_ic, self.ic_buffs
            )));
        }
        if self.want_padded_bias() && self.ngroups != 1 {
            return Err(Error::invalid_config("padded bias is only supported without groups"));
        }
        Ok(())
    }

    pub fn is_3d(&self) -> bool {
        self.ndims == 5
    }

    pub fn with_groups(&self) -> bool {
        self.ngroups > 1
    }

    pub fn with_dilation(&self) -> bool {
        self.dilate_d != 0 || self.dilate_h != 0 || self.dilate_w != 0
    }

    /// Bias with a channel count that is not a multiple of the block width has to go through
    /// a zero padded copy.
    pub fn want_padded_bias(&self) -> bool {
        self.with_bias && self.oc != self.oc_without_padding
    }

    /// Number of (depth, height) input rows, depth is folded into the row axis.
    pub fn in_rows(&self) -> usize {
        self.id * self.ih
    }

    pub fn out_rows(&self) -> usize {
        self.od * self.oh
    }

    /// Elements of the bias (or diff-bias) tensor, groups times padded channels.
    pub fn bias_elem_count(&self) -> usize {
        self.ngroups * self.oc
    }
}
