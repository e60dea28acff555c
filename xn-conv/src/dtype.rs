use half::bf16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    BF16,
    S32,
    S16,
    S8,
    U8,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::BF16 => "bf16",
            DType::S32 => "s32",
            DType::S16 => "s16",
            DType::S8 => "s8",
            DType::U8 => "u8",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element types that can flow through the convolution buffers.
///
/// Kernels accumulate in `f64` and convert back through `from_f64`, integer types round to the
/// nearest value and saturate at their bounds.
pub trait WithDType:
    Sized
    + Copy
    + num_traits::NumAssign
    + PartialOrd
    + 'static
    + Clone
    + Send
    + Sync
    + std::fmt::Debug
    + std::fmt::Display
{
    const DTYPE: DType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    fn from_f64(v: f64) -> Self {
        bf16::from_f64(v)
    }
}

macro_rules! with_dtype_int {
    ($ty:ty, $dtype:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                self as f64
            }

            // `as` saturates on overflow and maps NaN to zero.
            fn from_f64(v: f64) -> Self {
                v.round() as $ty
            }
        }
    };
}

with_dtype_int!(i32, S32);
with_dtype_int!(i16, S16);
with_dtype_int!(i8, S8);
with_dtype_int!(u8, U8);
