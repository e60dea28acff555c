pub mod buffer;
pub mod bwd_data;
pub mod bwd_weights;
pub mod config;
pub mod dtype;
pub mod error;
pub mod fwd;
pub mod kernel;
pub mod layout;
pub mod nd_iter;
pub mod padded_bias;
pub mod partition;
pub mod plan;
pub mod reducer;
pub mod ref_kernels;
pub mod runtime;

pub use bwd_data::ConvolutionBwdData;
pub use bwd_weights::{
    ConvolutionBwdWeights, FixedGrid, GridStrategy, MemoryCostStrategy, ReductionGrid,
};
pub use config::{ConvDesc, ConvKind, ConvTuning, JobConfig, SIMD_W};
pub use dtype::{DType, WithDType};
pub use error::{Context, Error, Result};
pub use fwd::ConvolutionFwd;
pub use kernel::{BwdDataKernel, BwdWeightsKernel, FwdKernel, TransposeKernel};
pub use ref_kernels::{RefBwdDataKernel, RefBwdWeightsKernel, RefFwdKernel, RefTranspose};
pub use runtime::{default_parallelism, get_num_threads};

pub fn with_avx512() -> bool {
    cfg!(target_feature = "avx512f")
}
