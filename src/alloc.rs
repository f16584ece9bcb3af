/*!
Page-aligned host memory.

Host arrays handed to a device are best allocated on page boundaries, which lets
vendor runtimes map them for DMA without a bounce copy. [`AlignedVec`] is a fixed
length, zero-initialized block aligned to [`HOST_ALIGN`].

```
# use cuplex::alloc::{AlignedVec, HOST_ALIGN};
# fn main() -> Result<(), cuplex::alloc::AllocError> {
let mut x = AlignedVec::<i32>::zeroed(4096)?;
x[7] = 1;
assert_eq!(x.as_ptr() as usize % HOST_ALIGN, 0);
# Ok(())
# }
```
*/

use bytemuck::Pod;
use std::{
    alloc::Layout,
    fmt::{self, Debug},
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

/// Alignment of host blocks in bytes.
pub const HOST_ALIGN: usize = 4096;

/// The host block could not be allocated.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("Failed to allocate {len} elements of {elem_size}B aligned to {align}B!")]
pub struct AllocError {
    len: usize,
    elem_size: usize,
    align: usize,
}

/// A fixed length block of `T` aligned to [`HOST_ALIGN`].
pub struct AlignedVec<T: Pod> {
    ptr: NonNull<T>,
    len: usize,
}

// Safety: AlignedVec owns its allocation like Vec<T>.
unsafe impl<T: Pod + Send> Send for AlignedVec<T> {}
unsafe impl<T: Pod + Sync> Sync for AlignedVec<T> {}

impl<T: Pod> AlignedVec<T> {
    fn layout(len: usize) -> Result<Layout, AllocError> {
        let align = HOST_ALIGN.max(align_of::<T>());
        let err = AllocError {
            len,
            elem_size: size_of::<T>(),
            align,
        };
        let bytes = len.checked_mul(size_of::<T>()).ok_or(err)?;
        Layout::from_size_align(bytes, align).map_err(|_| err)
    }
    /// Allocates `len` zeroed elements.
    ///
    /// **errors**
    /// - The size overflows or the allocator returned null.
    pub fn zeroed(len: usize) -> Result<Self, AllocError> {
        let layout = Self::layout(len)?;
        if layout.size() == 0 {
            // Safety: the alignment is non zero, the pointer is never dereferenced.
            let ptr = unsafe { NonNull::new_unchecked(layout.align() as *mut T) };
            return Ok(Self { ptr, len });
        }
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr as *mut T).ok_or(AllocError {
            len,
            elem_size: size_of::<T>(),
            align: layout.align(),
        })?;
        Ok(Self { ptr, len })
    }
    /// Allocates `len` copies of `elem`.
    pub fn from_elem(elem: T, len: usize) -> Result<Self, AllocError> {
        let mut output = Self::zeroed(len)?;
        output.fill(elem);
        Ok(output)
    }
    /// Allocates a copy of `slice`.
    pub fn from_slice(slice: &[T]) -> Result<Self, AllocError> {
        let mut output = Self::zeroed(slice.len())?;
        output.copy_from_slice(slice);
        Ok(output)
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// A slice of the elements.
    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
    /// A mutable slice of the elements.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
    /// The elements as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }
    /// The elements as mutable bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.as_mut_slice())
    }
}

impl<T: Pod> Deref for AlignedVec<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod> DerefMut for AlignedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Pod> Drop for AlignedVec<T> {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            if layout.size() != 0 {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout);
                }
            }
        }
    }
}

impl<T: Pod + Debug> Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_vec_alignment() {
        for len in [1, 3, 4096, 10_000] {
            let x = AlignedVec::<u8>::zeroed(len).unwrap();
            assert_eq!(x.as_ptr() as usize % HOST_ALIGN, 0);
            assert!(x.iter().all(|x| *x == 0));
        }
    }

    #[test]
    fn aligned_vec_empty() {
        let x = AlignedVec::<f64>::zeroed(0).unwrap();
        assert!(x.is_empty());
        assert_eq!(x.as_bytes().len(), 0);
        assert_eq!(x.as_ptr() as usize % HOST_ALIGN, 0);
    }

    #[test]
    fn aligned_vec_from_slice() {
        let x = AlignedVec::from_slice(&[1u32, 2, 3]).unwrap();
        assert_eq!(x.as_slice(), &[1, 2, 3]);
        assert_eq!(x.as_bytes().len(), 12);
        let y = AlignedVec::from_elem(7i16, 5).unwrap();
        assert_eq!(y.as_slice(), &[7; 5]);
    }

    #[test]
    fn aligned_vec_overflow() {
        assert!(AlignedVec::<u64>::zeroed(usize::MAX).is_err());
    }
}
