use bytemuck::Pod;
use dry::macro_for;
use paste::paste;
use std::fmt::{self, Debug, Display};

mod sealed {
    #[doc(hidden)]
    pub trait Sealed {}

    macro_rules! impl_sealed {
        ($($t:ty),+) => {
            $(
                impl Sealed for $t {}
            )+
        };
    }

    impl_sealed!(u8, i8, u16, i16, u32, i32, f32, u64, i64, f64);
}
use sealed::Sealed;

/// Element types that can be moved between host and device.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum ScalarType {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    F32 = 7,
    U64 = 8,
    I64 = 9,
    F64 = 10,
}

impl ScalarType {
    /// Size of the type in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        use ScalarType::*;
        match self {
            U8 | I8 => 1,
            U16 | I16 => 2,
            U32 | I32 | F32 => 4,
            U64 | I64 | F64 => 8,
        }
    }
    /// Name of the type.
    ///
    /// Lowercase, ie "u8", "i32", etc.
    #[inline]
    pub fn name(&self) -> &'static str {
        use ScalarType::*;
        match self {
            U8 => "u8",
            I8 => "i8",
            U16 => "u16",
            I16 => "i16",
            U32 => "u32",
            I32 => "i32",
            F32 => "f32",
            U64 => "u64",
            I64 => "i64",
            F64 => "f64",
        }
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar value of any [`ScalarType`].
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ScalarElem {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl ScalarElem {
    /// The type of the value.
    pub fn scalar_type(&self) -> ScalarType {
        use ScalarElem::*;
        use ScalarType as T;
        match self {
            U8(_) => T::U8,
            I8(_) => T::I8,
            U16(_) => T::U16,
            I16(_) => T::I16,
            U32(_) => T::U32,
            I32(_) => T::I32,
            F32(_) => T::F32,
            U64(_) => T::U64,
            I64(_) => T::I64,
            F64(_) => T::F64,
        }
    }
    /// The native-endian bytes of the value, as passed to a kernel.
    pub fn as_bytes(&self) -> &[u8] {
        use ScalarElem::*;
        match self {
            U8(x) => bytemuck::bytes_of(x),
            I8(x) => bytemuck::bytes_of(x),
            U16(x) => bytemuck::bytes_of(x),
            I16(x) => bytemuck::bytes_of(x),
            U32(x) => bytemuck::bytes_of(x),
            I32(x) => bytemuck::bytes_of(x),
            F32(x) => bytemuck::bytes_of(x),
            U64(x) => bytemuck::bytes_of(x),
            I64(x) => bytemuck::bytes_of(x),
            F64(x) => bytemuck::bytes_of(x),
        }
    }
    /// Returns the value as `T`, or None if the types differ.
    pub fn to_scalar<T: Scalar>(&self) -> Option<T> {
        if self.scalar_type() == T::SCALAR_TYPE {
            Some(bytemuck::pod_read_unaligned(self.as_bytes()))
        } else {
            None
        }
    }
}

impl<T: Scalar> From<T> for ScalarElem {
    fn from(x: T) -> Self {
        x.scalar_elem()
    }
}

/// Base trait for element types.
pub trait Scalar:
    Default + Copy + 'static + Send + Sync + PartialEq + Pod + Debug + Display + Sealed
{
    /// The [`ScalarType`] of the scalar.
    const SCALAR_TYPE: ScalarType;
    /// Converts to [`ScalarElem`].
    fn scalar_elem(self) -> ScalarElem;
}

macro_for!($X in [u8, i8, u16, i16, u32, i32, f32, u64, i64, f64] {
    paste! {
        impl Scalar for $X {
            const SCALAR_TYPE: ScalarType = ScalarType::[<$X:upper>];
            #[inline(always)]
            fn scalar_elem(self) -> ScalarElem {
                ScalarElem::[<$X:upper>](self)
            }
        }
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_elem_bytes() {
        let x = ScalarElem::from(4096i32);
        assert_eq!(x.scalar_type(), ScalarType::I32);
        assert_eq!(x.as_bytes(), 4096i32.to_ne_bytes());
        assert_eq!(x.to_scalar::<i32>(), Some(4096));
        assert_eq!(x.to_scalar::<u32>(), None);
    }

    #[test]
    fn scalar_type_size() {
        assert_eq!(u8::SCALAR_TYPE.size(), 1);
        assert_eq!(i16::SCALAR_TYPE.size(), 2);
        assert_eq!(f32::SCALAR_TYPE.size(), 4);
        assert_eq!(f64::SCALAR_TYPE.size(), 8);
        assert_eq!(f64::SCALAR_TYPE.name(), "f64");
        assert_eq!(i32::SCALAR_TYPE.to_string(), "i32");
    }
}
