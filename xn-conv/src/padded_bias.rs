use crate::WithDType;
use crate::buffer::AlignedBuffer;
use crate::error::{Result, check_len};

/// Bias storage padded to a whole number of channel blocks.
///
/// Kernels always read (or write) full 16 channel blocks of bias, when the real channel count
/// is not a multiple of the block width the caller's buffer is too short. This owns a zero
/// padded copy: elements `oc_without_padding..oc` stay zero, the prefix mirrors the caller's
/// bias.
#[derive(Debug)]
pub struct PaddedBias<T: WithDType> {
    buf: AlignedBuffer<T>,
    oc_without_padding: usize,
}

impl<T: WithDType> PaddedBias<T> {
    pub fn new(oc: usize, oc_without_padding: usize) -> Self {
        debug_assert!(oc_without_padding <= oc);
        Self { buf: AlignedBuffer::zeros(oc), oc_without_padding }
    }

    pub fn oc(&self) -> usize {
        self.buf.len()
    }

    pub fn oc_without_padding(&self) -> usize {
        self.oc_without_padding
    }

    /// Copies the caller's bias in the prefix, the tail is left zeroed.
    pub fn load(&mut self, bias: &[T]) -> Result<()> {
        check_len(bias, self.oc_without_padding, "bias")?;
        let n = self.oc_without_padding;
        self.buf[..n].copy_from_slice(&bias[..n]);
        Ok(())
    }

    /// Copies the real channels back into the caller's buffer.
    pub fn store(&self, dst: &mut [T]) -> Result<()> {
        check_len(dst, self.oc_without_padding, "diff_bias")?;
        let n = self.oc_without_padding;
        dst[..n].copy_from_slice(&self.buf[..n]);
        Ok(())
    }

    /// Resets the padding tail, used after kernels wrote to the whole buffer.
    pub fn zero_tail(&mut self) {
        let n = self.oc_without_padding;
        self.buf[n..].fill(T::zero());
    }

    pub fn as_slice(&self) -> &[T] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.buf
    }
}
