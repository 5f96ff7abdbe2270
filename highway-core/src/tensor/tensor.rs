//! Dense n-dimensional tensor over raw little-endian bytes
//!
//! Tensors are cheap to clone and slice: element data lives in a shared
//! [`Bytes`] buffer, so selecting one sample along the leading axis never
//! copies.

use bytes::{Bytes, BytesMut};

use super::dtype::{DType, Element};
use crate::error::{HighwayError, Result};

/// Dense tensor with an explicit shape and element type
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Bytes,
}

/// Element count of a shape that is already known to fit
fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Element count of an untrusted shape; `None` if it overflows `usize`
fn checked_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

fn overflow(shape: &[usize], dtype: DType) -> HighwayError {
    HighwayError::shape(format!("shape {:?} of {} overflows usize", shape, dtype))
}

/// Byte length of an untrusted shape
fn checked_len(shape: &[usize], dtype: DType) -> Result<usize> {
    checked_count(shape)
        .and_then(|count| count.checked_mul(dtype.size()))
        .ok_or_else(|| overflow(shape, dtype))
}

fn decode_all<T: Element>(mut data: &[u8]) -> Vec<T> {
    let mut out = Vec::with_capacity(data.len() / T::DTYPE.size());
    while !data.is_empty() {
        out.push(T::get(&mut data));
    }
    out
}

fn encode_all<T: Element>(values: impl ExactSizeIterator<Item = T>) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * T::DTYPE.size());
    for value in values {
        value.put(&mut buf);
    }
    buf.freeze()
}

impl Tensor {
    /// Wrap raw element bytes, checking they match the shape
    pub fn from_bytes(shape: Vec<usize>, dtype: DType, data: Bytes) -> Result<Self> {
        let expected = checked_len(&shape, dtype)?;
        if data.len() != expected {
            return Err(HighwayError::shape(format!(
                "shape {:?} of {} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Build a tensor from typed values in row-major order
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        let count = checked_len(&shape, T::DTYPE)? / T::DTYPE.size();
        if values.len() != count {
            return Err(HighwayError::shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                count,
                values.len()
            )));
        }
        Ok(Self {
            shape,
            dtype: T::DTYPE,
            data: encode_all(values.into_iter()),
        })
    }

    /// Tensor with every element set to `value`
    ///
    /// Panics if the shape's element count overflows `usize`, like `vec!`.
    pub fn full<T: Element>(shape: Vec<usize>, value: T) -> Self {
        let count = element_count(&shape);
        Self {
            data: encode_all((0..count).map(|_| value)),
            dtype: T::DTYPE,
            shape,
        }
    }

    /// All-zero tensor; the zero bit pattern is zero for every dtype
    ///
    /// Panics if the shape's byte length overflows `usize`.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = element_count(&shape) * dtype.size();
        Self {
            shape,
            dtype,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    /// Build from `f64` working values, converting to `dtype`
    pub fn from_f64(shape: Vec<usize>, dtype: DType, values: &[f64]) -> Result<Self> {
        let count = checked_len(&shape, dtype)? / dtype.size();
        if values.len() != count {
            return Err(HighwayError::shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                count,
                values.len()
            )));
        }
        let data = match dtype {
            DType::U8 => encode_all(values.iter().map(|v| u8::from_f64(*v))),
            DType::I32 => encode_all(values.iter().map(|v| i32::from_f64(*v))),
            DType::I64 => encode_all(values.iter().map(|v| i64::from_f64(*v))),
            DType::F32 => encode_all(values.iter().map(|v| f32::from_f64(*v))),
            DType::F64 => encode_all(values.iter().copied()),
        };
        Ok(Self { shape, dtype, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Raw little-endian element bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        element_count(&self.shape)
    }

    /// Size of the leading (batch) axis, `None` for scalars
    pub fn leading_dim(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    /// Read back typed values; the type must match exactly
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(HighwayError::DtypeMismatch {
                expected: T::DTYPE.to_string(),
                actual: self.dtype.to_string(),
            });
        }
        Ok(decode_all(&self.data))
    }

    /// Values widened to `f64`, whatever the stored type
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.dtype {
            DType::U8 => decode_all::<u8>(&self.data).into_iter().map(Element::to_f64).collect(),
            DType::I32 => decode_all::<i32>(&self.data).into_iter().map(Element::to_f64).collect(),
            DType::I64 => decode_all::<i64>(&self.data).into_iter().map(Element::to_f64).collect(),
            DType::F32 => decode_all::<f32>(&self.data).into_iter().map(Element::to_f64).collect(),
            DType::F64 => decode_all::<f64>(&self.data),
        }
    }

    /// Select one entry along the leading axis (zero-copy)
    pub fn sample(&self, index: usize) -> Result<Tensor> {
        let leading = self
            .leading_dim()
            .ok_or_else(|| HighwayError::shape("cannot index a scalar tensor"))?;
        if index >= leading {
            return Err(HighwayError::shape(format!(
                "sample index {} out of range for leading dimension {}",
                index, leading
            )));
        }
        let sample_shape = self.shape[1..].to_vec();
        let stride = element_count(&sample_shape) * self.dtype.size();
        let start = index * stride;
        Ok(Tensor {
            shape: sample_shape,
            dtype: self.dtype,
            data: self.data.slice(start..start + stride),
        })
    }

    /// Stack equally-shaped tensors along a new leading axis
    pub fn stack(samples: &[Tensor]) -> Result<Tensor> {
        let first = samples
            .first()
            .ok_or_else(|| HighwayError::shape("cannot stack zero tensors"))?;

        let mut buf = BytesMut::with_capacity(first.data.len() * samples.len());
        for (idx, sample) in samples.iter().enumerate() {
            if sample.shape != first.shape || sample.dtype != first.dtype {
                return Err(HighwayError::shape(format!(
                    "stack element {} is {:?} {}, expected {:?} {}",
                    idx, sample.shape, sample.dtype, first.shape, first.dtype
                )));
            }
            buf.extend_from_slice(&sample.data);
        }

        let mut shape = Vec::with_capacity(first.rank() + 1);
        shape.push(samples.len());
        shape.extend_from_slice(&first.shape);

        Ok(Tensor {
            shape,
            dtype: first.dtype,
            data: buf.freeze(),
        })
    }
}
