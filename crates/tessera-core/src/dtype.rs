use std::fmt;

use bytemuck::NoUninit;

use crate::scalar::Scalar;

/// Element types an accelerator buffer can hold.
///
/// The set is closed: dispatch over it is a plain `match` (see
/// [`dispatch_dtype!`](crate::dispatch_dtype)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 1-byte boolean
    Bool,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 8-bit unsigned integer
    U8,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
}

impl DType {
    /// All supported dtypes, in declaration order.
    pub const ALL: [DType; 8] = [
        DType::Bool,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::F32,
        DType::F64,
    ];

    /// Size in bytes of a single element.
    pub const fn element_size(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub const fn storage_bytes(self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this dtype is a floating-point type.
    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integer type.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 | DType::U8
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Rust type that can live in a tensor buffer.
///
/// Arithmetic goes through the `*_elem` methods rather than `std::ops` so that
/// `bool` can take part in the unrestricted dispatch: integers wrap, integer
/// division by zero yields zero, and booleans follow the int-then-nonzero
/// rule (`add` = or, `sub` = xor, `mul` = and, `div` = and).
pub trait Element:
    Copy + Send + Sync + PartialEq + PartialOrd + fmt::Debug + NoUninit + 'static
{
    const DTYPE: DType;

    fn zero() -> Self;

    /// Most negative finite value, or negative infinity where representable.
    fn lowest() -> Self;

    /// Static conversion with the target type's native `as` semantics.
    fn from_scalar(value: Scalar) -> Self;

    /// Lossless widening into a scalar.
    fn to_scalar(self) -> Scalar;

    /// Decode one element from exactly `size_of::<Self>()` native-endian bytes.
    fn from_ne_slice(bytes: &[u8]) -> Self;

    fn add_elem(self, rhs: Self) -> Self;
    fn sub_elem(self, rhs: Self) -> Self;
    fn mul_elem(self, rhs: Self) -> Self;
    fn div_elem(self, rhs: Self) -> Self;

    /// Static conversion between element types (`Astype`).
    #[inline]
    fn cast<U: Element>(self) -> U {
        U::from_scalar(self.to_scalar())
    }
}

/// Floating-point elements: the only types transcendental operators and the
/// GEMM primitive accept.
pub trait FloatElement: Element + num_traits::Float {}

impl FloatElement for f32 {}
impl FloatElement for f64 {}

macro_rules! impl_int_element {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            #[inline]
            fn zero() -> Self {
                0
            }

            #[inline]
            fn lowest() -> Self {
                <$t>::MIN
            }

            #[inline]
            fn from_scalar(value: Scalar) -> Self {
                match value {
                    Scalar::Bool(v) => v as $t,
                    Scalar::Int(v) => v as $t,
                    Scalar::Float(v) => v as $t,
                }
            }

            #[inline]
            fn to_scalar(self) -> Scalar {
                Scalar::Int(self as i64)
            }

            #[inline]
            fn from_ne_slice(bytes: &[u8]) -> Self {
                bytemuck::pod_read_unaligned(bytes)
            }

            #[inline]
            fn add_elem(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }

            #[inline]
            fn sub_elem(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }

            #[inline]
            fn mul_elem(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }

            #[inline]
            fn div_elem(self, rhs: Self) -> Self {
                if rhs == 0 {
                    0
                } else {
                    self.wrapping_div(rhs)
                }
            }
        }
    };
}

macro_rules! impl_float_element {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            #[inline]
            fn zero() -> Self {
                0.0
            }

            #[inline]
            fn lowest() -> Self {
                <$t>::NEG_INFINITY
            }

            #[inline]
            fn from_scalar(value: Scalar) -> Self {
                match value {
                    Scalar::Bool(v) => u8::from(v) as $t,
                    Scalar::Int(v) => v as $t,
                    Scalar::Float(v) => v as $t,
                }
            }

            #[inline]
            fn to_scalar(self) -> Scalar {
                Scalar::Float(self as f64)
            }

            #[inline]
            fn from_ne_slice(bytes: &[u8]) -> Self {
                bytemuck::pod_read_unaligned(bytes)
            }

            #[inline]
            fn add_elem(self, rhs: Self) -> Self {
                self + rhs
            }

            #[inline]
            fn sub_elem(self, rhs: Self) -> Self {
                self - rhs
            }

            #[inline]
            fn mul_elem(self, rhs: Self) -> Self {
                self * rhs
            }

            #[inline]
            fn div_elem(self, rhs: Self) -> Self {
                self / rhs
            }
        }
    };
}

impl_int_element!(i8, DType::I8);
impl_int_element!(i16, DType::I16);
impl_int_element!(i32, DType::I32);
impl_int_element!(i64, DType::I64);
impl_int_element!(u8, DType::U8);
impl_float_element!(f32, DType::F32);
impl_float_element!(f64, DType::F64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    #[inline]
    fn zero() -> Self {
        false
    }

    #[inline]
    fn lowest() -> Self {
        false
    }

    #[inline]
    fn from_scalar(value: Scalar) -> Self {
        match value {
            Scalar::Bool(v) => v,
            Scalar::Int(v) => v != 0,
            Scalar::Float(v) => v != 0.0,
        }
    }

    #[inline]
    fn to_scalar(self) -> Scalar {
        Scalar::Bool(self)
    }

    #[inline]
    fn from_ne_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    #[inline]
    fn add_elem(self, rhs: Self) -> Self {
        self | rhs
    }

    #[inline]
    fn sub_elem(self, rhs: Self) -> Self {
        self ^ rhs
    }

    #[inline]
    fn mul_elem(self, rhs: Self) -> Self {
        self & rhs
    }

    #[inline]
    fn div_elem(self, rhs: Self) -> Self {
        self & rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::Bool.element_size(), 1);
        assert_eq!(DType::I16.element_size(), 2);
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::I64.element_size(), 8);
        assert_eq!(DType::F64.storage_bytes(3), 24);
        for dtype in DType::ALL {
            let size = crate::dispatch_dtype!(dtype, T, { std::mem::size_of::<T>() });
            assert_eq!(size, dtype.element_size(), "{dtype}");
        }
    }

    #[test]
    fn test_dtype_categories() {
        assert!(DType::F32.is_float());
        assert!(!DType::F32.is_integer());
        assert!(DType::U8.is_integer());
        assert!(!DType::Bool.is_integer());
        assert!(!DType::Bool.is_float());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::F64), "f64");
        assert_eq!(format!("{}", DType::Bool), "bool");
    }

    #[test]
    fn test_native_casts() {
        assert_eq!(2.9f64.cast::<i32>(), 2);
        assert_eq!((-2.9f32).cast::<i8>(), -2);
        assert_eq!(300i32.cast::<u8>(), 44);
        assert_eq!((-1i8).cast::<u8>(), 255);
        assert!(0.5f32.cast::<bool>());
        assert!(!0i64.cast::<bool>());
        assert_eq!(true.cast::<f64>(), 1.0);
        assert_eq!(i64::MAX.cast::<i64>(), i64::MAX);
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(127i8.add_elem(1), -128);
        assert_eq!(0u8.sub_elem(1), 255);
        assert_eq!(7i32.div_elem(0), 0);
        assert_eq!(i64::MIN.div_elem(-1), i64::MIN);
    }

    #[test]
    fn test_bool_arithmetic() {
        assert!(true.add_elem(false));
        assert!(!true.sub_elem(true));
        assert!(!true.mul_elem(false));
        assert!(true.div_elem(true));
    }

    #[test]
    fn test_lowest() {
        assert_eq!(<f32 as Element>::lowest(), f32::NEG_INFINITY);
        assert_eq!(<i16 as Element>::lowest(), i16::MIN);
        assert!(!<bool as Element>::lowest());
    }

    #[test]
    fn test_from_ne_slice() {
        let v = 1.5f64;
        assert_eq!(f64::from_ne_slice(&v.to_ne_bytes()), 1.5);
        assert_eq!(i16::from_ne_slice(&(-3i16).to_ne_bytes()), -3);
        assert!(bool::from_ne_slice(&[1]));
    }
}
