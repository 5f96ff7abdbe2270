//! Element types carried by tensors

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Wire tag for this type
    pub fn tag(self) -> u8 {
        match self {
            DType::U8 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DType::U8),
            2 => Some(DType::I32),
            3 => Some(DType::I64),
            4 => Some(DType::F32),
            5 => Some(DType::F64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A Rust scalar that can live inside a [`Tensor`](super::Tensor)
///
/// Elements are stored little-endian regardless of host byte order.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn put(self, buf: &mut BytesMut);

    fn get(buf: &mut &[u8]) -> Self;

    fn to_f64(self) -> f64;

    /// Convert back from a working value, rounding and saturating integers
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $put:ident, $get:ident, int) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn get(buf: &mut &[u8]) -> Self {
                buf.$get()
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value.round() as $ty
            }
        }
    };
    ($ty:ty, $dtype:expr, $put:ident, $get:ident, float) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn get(buf: &mut &[u8]) -> Self {
                buf.$get()
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }
        }
    };
}

impl_element!(u8, DType::U8, put_u8, get_u8, int);
impl_element!(i32, DType::I32, put_i32_le, get_i32_le, int);
impl_element!(i64, DType::I64, put_i64_le, get_i64_le, int);
impl_element!(f32, DType::F32, put_f32_le, get_f32_le, float);
impl_element!(f64, DType::F64, put_f64_le, get_f64_le, float);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for dtype in [DType::U8, DType::I32, DType::I64, DType::F32, DType::F64] {
            assert_eq!(DType::from_tag(dtype.tag()), Some(dtype));
        }
        assert_eq!(DType::from_tag(0), None);
        assert_eq!(DType::from_tag(42), None);
    }

    #[test]
    fn test_integer_conversion_saturates() {
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-4.0), 0);
        assert_eq!(u8::from_f64(1.6), 2);
        assert_eq!(i32::from_f64(-2.4), -2);
    }
}
