/*!
Kernel arguments.

An [`Arg`] is a scalar value or a borrowed host array, along with the direction it
moves in. Arrays are borrowed for the lifetime of the
[`Context`](crate::context::Context) they are bound to, so they can not be
modified or freed while a device may still access them.

```
# use cuplex::arg::{Access, Arg, Role};
let x = vec![1f32; 64];
let mut y = vec![0f32; 64];
assert_eq!(Arg::read(&x).role(), Role::Read);
assert_eq!(Arg::write(&mut y).access(), Some(Access::Write));
assert_eq!(Arg::scalar(64u32).role(), Role::Scalar);
```
*/

use crate::{
    alloc::AlignedVec,
    device::{Device, DeviceBuffer, HostPtr, LaunchArg},
    error::Error,
    scalar::{Scalar, ScalarElem, ScalarType},
};
use std::{marker::PhantomData, ops::Range, ptr::NonNull};

/// The direction a buffer moves in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum Access {
    /// Host to device before the launch.
    Read,
    /// Device to host after the launch.
    Write,
    /// Both.
    ReadWrite,
}

impl Access {
    /// Whether the buffer is copied to the device by [`run`](crate::context::Context::run).
    pub fn uploads(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }
    /// Whether the buffer is copied to the host by [`wait`](crate::context::Context::wait).
    pub fn downloads(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// The role of a bound slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum Role {
    /// A value, passed directly to the launch.
    Scalar,
    /// See [`Access::Read`].
    Read,
    /// See [`Access::Write`].
    Write,
    /// See [`Access::ReadWrite`].
    ReadWrite,
}

impl From<Access> for Role {
    fn from(access: Access) -> Self {
        match access {
            Access::Read => Self::Read,
            Access::Write => Self::Write,
            Access::ReadWrite => Self::ReadWrite,
        }
    }
}

/// Selects one instance or every instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Select {
    /// The instance with this index.
    One(usize),
    /// Every instance.
    All,
}

impl From<usize> for Select {
    fn from(index: usize) -> Self {
        Self::One(index)
    }
}

/// A borrowed host array of scalars.
#[derive(Debug)]
pub(crate) struct HostRegion<'a> {
    ptr: NonNull<u8>,
    len: usize,
    scalar_type: ScalarType,
    _marker: PhantomData<&'a mut [u8]>,
}

// Safety: a region borrows a slice of Scalar, which are Send and Sync.
unsafe impl Send for HostRegion<'_> {}
unsafe impl Sync for HostRegion<'_> {}

impl<'a> HostRegion<'a> {
    fn new<T: Scalar>(ptr: NonNull<[T]>, len: usize) -> Self {
        Self {
            ptr: ptr.cast(),
            len,
            scalar_type: T::SCALAR_TYPE,
            _marker: PhantomData,
        }
    }
    /// The number of elements.
    pub(crate) fn len(&self) -> usize {
        self.len
    }
    pub(crate) fn bytes(&self) -> usize {
        self.len * self.scalar_type.size()
    }
    /// Elements `range` of the region.
    ///
    /// Panics if `range` is out of bounds. Only non-overlapping sub regions of a
    /// writable region may be used at the same time.
    pub(crate) fn sub_region(&self, range: Range<usize>) -> Self {
        assert!(range.start <= range.end && range.end <= self.len);
        let offset = range.start * self.scalar_type.size();
        // Safety: offset is at most one past the end of the region.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Self {
            ptr,
            len: range.len(),
            scalar_type: self.scalar_type,
            _marker: PhantomData,
        }
    }
    fn alias(&self) -> Self {
        self.sub_region(0..self.len)
    }
}

#[derive(Debug)]
enum ArgKind<'a> {
    Scalar(ScalarElem),
    Buffer {
        access: Access,
        region: HostRegion<'a>,
    },
}

/** An argument to bind to a slot.

See [`Context::arg()`](crate::context::Context::arg) and
[`Context::split()`](crate::context::Context::split). */
#[derive(Debug)]
pub struct Arg<'a> {
    kind: ArgKind<'a>,
}

impl<'a> Arg<'a> {
    /// A value passed directly to the kernel.
    pub fn scalar<T: Scalar>(value: T) -> Self {
        Self {
            kind: ArgKind::Scalar(value.into()),
        }
    }
    /// An input array, copied to the device before each launch.
    pub fn read<T: Scalar>(host: &'a [T]) -> Self {
        Self::buffer(Access::Read, HostRegion::new(NonNull::from(host), host.len()))
    }
    /// An output array, copied back to the host after each launch.
    pub fn write<T: Scalar>(host: &'a mut [T]) -> Self {
        let len = host.len();
        Self::buffer(Access::Write, HostRegion::new(NonNull::from(host), len))
    }
    /// An array copied to the device before and back to the host after each launch.
    pub fn read_write<T: Scalar>(host: &'a mut [T]) -> Self {
        let len = host.len();
        Self::buffer(Access::ReadWrite, HostRegion::new(NonNull::from(host), len))
    }
    fn buffer(access: Access, region: HostRegion<'a>) -> Self {
        Self {
            kind: ArgKind::Buffer { access, region },
        }
    }
    /// The role of the argument.
    pub fn role(&self) -> Role {
        match &self.kind {
            ArgKind::Scalar(_) => Role::Scalar,
            ArgKind::Buffer { access, .. } => (*access).into(),
        }
    }
    /// The access of a buffer, None for scalars.
    pub fn access(&self) -> Option<Access> {
        match &self.kind {
            ArgKind::Scalar(_) => None,
            ArgKind::Buffer { access, .. } => Some(*access),
        }
    }
    /// The element type.
    pub fn scalar_type(&self) -> ScalarType {
        match &self.kind {
            ArgKind::Scalar(x) => x.scalar_type(),
            ArgKind::Buffer { region, .. } => region.scalar_type,
        }
    }
    /// Prepares a slot for one instance, aliasing the whole array.
    pub(crate) fn bind(&self, device: &Device) -> Result<ArgSlot<'a>, Error> {
        match &self.kind {
            ArgKind::Scalar(x) => Ok(ArgSlot::Scalar(*x)),
            ArgKind::Buffer { access, region } => Ok(ArgSlot::Buffer(BufferSlot::new(
                device,
                *access,
                HostMemory::Borrowed(region.alias()),
                0,
            )?)),
        }
    }
    /// Prepares one slot per range of the array. Scalars are repeated.
    pub(crate) fn bind_split(
        &self,
        device: &Device,
        ranges: &[Range<usize>],
    ) -> Result<Vec<ArgSlot<'a>>, Error> {
        match &self.kind {
            ArgKind::Scalar(x) => Ok(ranges.iter().map(|_| ArgSlot::Scalar(*x)).collect()),
            ArgKind::Buffer { access, region } => ranges
                .iter()
                .map(|range| {
                    let host = HostMemory::Borrowed(region.sub_region(range.clone()));
                    Ok(ArgSlot::Buffer(BufferSlot::new(
                        device,
                        *access,
                        host,
                        range.start,
                    )?))
                })
                .collect(),
        }
    }
    /// The number of elements, 1 for scalars.
    pub(crate) fn len(&self) -> usize {
        match &self.kind {
            ArgKind::Scalar(_) => 1,
            ArgKind::Buffer { region, .. } => region.len(),
        }
    }
}

/// Host memory backing a buffer slot.
#[derive(Debug)]
pub(crate) enum HostMemory<'a> {
    /// Part of an array owned by the caller.
    Borrowed(HostRegion<'a>),
    /// A block owned by the slot, see [`Context::map()`](crate::context::Context::map).
    Mapped {
        block: AlignedVec<u8>,
        scalar_type: ScalarType,
    },
}

impl HostMemory<'_> {
    pub(crate) fn mapped<T: Scalar>(len: usize) -> Result<Self, Error> {
        let bytes = len.checked_mul(T::SCALAR_TYPE.size()).ok_or_else(|| {
            Error::InvalidArgument(format!("{len} elements of {} overflow", T::SCALAR_TYPE))
        })?;
        Ok(Self::Mapped {
            block: AlignedVec::zeroed(bytes)?,
            scalar_type: T::SCALAR_TYPE,
        })
    }
    fn bytes(&self) -> usize {
        match self {
            Self::Borrowed(region) => region.bytes(),
            Self::Mapped { block, .. } => block.len(),
        }
    }
    fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Borrowed(region) => region.scalar_type,
            Self::Mapped { scalar_type, .. } => *scalar_type,
        }
    }
    /** The memory as a copy source or destination.

    The pointer is valid while `self` is, and for writes only if the memory is
    writable. */
    pub(crate) fn host_ptr(&mut self) -> HostPtr {
        match self {
            // Safety: the region is borrowed for 'a.
            Self::Borrowed(region) => unsafe { HostPtr::new(region.ptr, region.bytes()) },
            Self::Mapped { block, .. } => {
                let bytes = block.as_bytes_mut();
                let len = bytes.len();
                // Safety: block is owned by the slot.
                unsafe { HostPtr::new(NonNull::from(bytes).cast(), len) }
            }
        }
    }
}

/// A bound buffer.
#[derive(Debug)]
pub(crate) struct BufferSlot<'a> {
    pub(crate) access: Access,
    pub(crate) buffer: DeviceBuffer,
    pub(crate) host: HostMemory<'a>,
    /// Element offset of `host` in the array it was split from.
    pub(crate) offset: usize,
}

impl<'a> BufferSlot<'a> {
    pub(crate) fn new(
        device: &Device,
        access: Access,
        host: HostMemory<'a>,
        offset: usize,
    ) -> Result<Self, Error> {
        let buffer = DeviceBuffer::new(device, host.bytes()).map_err(Error::AllocationFailure)?;
        Ok(Self {
            access,
            buffer,
            host,
            offset,
        })
    }
    pub(crate) fn scalar_type(&self) -> ScalarType {
        self.host.scalar_type()
    }
    /// The number of elements.
    pub(crate) fn len(&self) -> usize {
        self.buffer.len() / self.scalar_type().size()
    }
}

/// A bound slot.
#[derive(Debug)]
pub(crate) enum ArgSlot<'a> {
    Scalar(ScalarElem),
    Buffer(BufferSlot<'a>),
}

impl ArgSlot<'_> {
    pub(crate) fn launch_arg(&self) -> LaunchArg {
        match self {
            Self::Scalar(x) => LaunchArg::Scalar(*x),
            Self::Buffer(slot) => slot.buffer.launch_arg(),
        }
    }
    pub(crate) fn binding(&self) -> Binding {
        match self {
            Self::Scalar(x) => Binding {
                role: Role::Scalar,
                scalar_type: x.scalar_type(),
                offset: 0,
                len: 1,
            },
            Self::Buffer(slot) => Binding {
                role: slot.access.into(),
                scalar_type: slot.scalar_type(),
                offset: slot.offset,
                len: slot.len(),
            },
        }
    }
}

/** How a slot of an instance is bound.

For split arrays, `offset` and `len` locate the part of the array the instance
receives. */
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Binding {
    role: Role,
    scalar_type: ScalarType,
    offset: usize,
    len: usize,
}

impl Binding {
    /// The role of the slot.
    pub fn role(&self) -> Role {
        self.role
    }
    /// The element type.
    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }
    /// The offset in elements into the host array, 0 for whole arrays and scalars.
    pub fn offset(&self) -> usize {
        self.offset
    }
    /// The number of elements, 1 for scalars.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether a buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_directions() {
        assert!(Access::Read.uploads() && !Access::Read.downloads());
        assert!(!Access::Write.uploads() && Access::Write.downloads());
        assert!(Access::ReadWrite.uploads() && Access::ReadWrite.downloads());
        assert_eq!(Role::from(Access::ReadWrite), Role::ReadWrite);
        assert_eq!(Select::from(3), Select::One(3));
    }

    #[test]
    fn sub_regions_are_disjoint() {
        let mut x = [0u16, 1, 2, 3, 4];
        let base = x.as_ptr() as usize;
        let arg = Arg::read_write(&mut x);
        let ArgKind::Buffer { region, .. } = &arg.kind else {
            unreachable!()
        };
        assert_eq!(region.bytes(), 10);
        let a = region.sub_region(0..3);
        let b = region.sub_region(3..5);
        let c = region.sub_region(5..5);
        assert_eq!(a.ptr.as_ptr() as usize, base);
        assert_eq!(b.ptr.as_ptr() as usize, base + 6);
        assert_eq!((a.len(), b.len(), c.len()), (3, 2, 0));
        assert_eq!(c.ptr.as_ptr() as usize, base + 10);
    }

    #[test]
    fn mapped_memory_is_zeroed() {
        let mut host = HostMemory::mapped::<f64>(3).unwrap();
        assert_eq!(host.bytes(), 24);
        assert_eq!(host.scalar_type(), ScalarType::F64);
        let ptr = host.host_ptr();
        assert_eq!(ptr.len(), 24);
        assert!(unsafe { ptr.as_slice() }.iter().all(|x| *x == 0));
    }

    #[test]
    fn scalar_binding() {
        let device = Device::builder().build().unwrap();
        let slot = Arg::scalar(7i64).bind(&device).unwrap();
        assert!(matches!(slot.launch_arg(), LaunchArg::Scalar(ScalarElem::I64(7))));
        let binding = slot.binding();
        assert_eq!(binding.role(), Role::Scalar);
        assert_eq!(binding.len(), 1);
    }

    #[test]
    fn split_binding_offsets() {
        let device = Device::builder().build().unwrap();
        let x = [1u32; 5];
        let slots = Arg::read(&x)
            .bind_split(&device, &crate::split::partition(5, 2))
            .unwrap();
        let bindings: Vec<_> = slots.iter().map(|x| (x.binding().offset(), x.binding().len())).collect();
        assert_eq!(bindings, [(0, 3), (3, 2)]);
    }
}
