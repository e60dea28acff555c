use crate::WithDType;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::ops::Range;
use std::ptr::NonNull;

pub const CACHE_LINE: usize = 64;

/// Heap buffer aligned on a cache line, zero initialized.
///
/// Allocation failures abort the process through `handle_alloc_error`, scratch space that
/// cannot be allocated leaves no way to run the job.
pub struct AlignedBuffer<T: WithDType> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: the buffer owns its elements, the usual `Vec<T>` rules apply.
unsafe impl<T: WithDType> Send for AlignedBuffer<T> {}
unsafe impl<T: WithDType> Sync for AlignedBuffer<T> {}

impl<T: WithDType> AlignedBuffer<T> {
    fn layout(len: usize) -> Layout {
        let align = CACHE_LINE.max(std::mem::align_of::<T>());
        match Layout::array::<T>(len).and_then(|l| l.align_to(align)) {
            Ok(layout) => layout,
            Err(_) => panic!("buffer of {len} elements overflows the address space"),
        }
    }

    pub fn zeros(len: usize) -> Self {
        if len == 0 {
            return Self { ptr: NonNull::dangling(), len };
        }
        let layout = Self::layout(len);
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) } as *mut T;
        let Some(ptr) = NonNull::new(ptr) else { std::alloc::handle_alloc_error(layout) };
        for i in 0..len {
            // SAFETY: `i < len` and the allocation holds `len` elements.
            unsafe { ptr.as_ptr().add(i).write(T::zero()) }
        }
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fill(&mut self, v: T) {
        self.as_mut_slice().fill(v)
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `ptr` is valid for `len` initialized elements, or dangling with `len == 0`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: WithDType> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        if self.len != 0 {
            // SAFETY: allocated in `zeros` with the same layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr() as *mut u8, Self::layout(self.len)) }
        }
    }
}

impl<T: WithDType> std::ops::Deref for AlignedBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: WithDType> std::ops::DerefMut for AlignedBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: WithDType> std::fmt::Debug for AlignedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("dtype", &T::DTYPE).field("len", &self.len).finish()
    }
}

/// A mutable slice shared between the workers of a parallel region.
///
/// Each worker writes to a part of the slice that no other worker touches during the same
/// phase, phases being separated by barriers. The view cannot check this, hence the unsafe
/// accessors.
#[derive(Debug)]
pub struct SharedMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T> Clone for SharedMut<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedMut<'_, T> {}

// SAFETY: access to the underlying elements goes through the unsafe accessors whose contract
// rules out data races.
unsafe impl<T: Send> Send for SharedMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedMut<'_, T> {}

impl<'a, T> SharedMut<'a, T> {
    pub fn new(s: &'a mut [T]) -> Self {
        Self { ptr: s.as_mut_ptr(), len: s.len(), _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, r: &Range<usize>) {
        assert!(r.start <= r.end && r.end <= self.len, "range {r:?} out of bounds {}", self.len)
    }

    /// # Safety
    /// No other thread may read or write any element of `r` while the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, r: Range<usize>) -> &'a mut [T] {
        self.check(&r);
        // SAFETY: in bounds, exclusivity is guaranteed by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(r.start), r.len()) }
    }

    /// # Safety
    /// No other thread may write any element of `r` while the returned slice is alive.
    pub unsafe fn slice(&self, r: Range<usize>) -> &'a [T] {
        self.check(&r);
        // SAFETY: in bounds, the absence of writers is guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr.add(r.start), r.len()) }
    }
}
