//! Numeric arrays as seen by the transport.
//!
//! The transport never does math on arrays. It only needs the shape, the
//! element type, the element ordering and the raw element bytes, so that
//! is all this type carries. Element bytes are always little-endian.

use std::fmt;

use crate::codec::CodecError;

/// Element type tag. The discriminant is the on-wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    F32 = 0x01,
    F64 = 0x02,
    I32 = 0x03,
    I64 = 0x04,
    U8 = 0x05,
}

impl DType {
    /// Size of a single element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

impl TryFrom<u8> for DType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DType::F32),
            0x02 => Ok(DType::F64),
            0x03 => Ok(DType::I32),
            0x04 => Ok(DType::I64),
            0x05 => Ok(DType::U8),
            other => Err(CodecError::UnknownElementType(other)),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        };
        f.write_str(s)
    }
}

/// Element ordering of the flat buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Order {
    /// Row-major.
    #[default]
    C = 0x00,
    /// Column-major.
    F = 0x01,
}

impl TryFrom<u8> for Order {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Order::C),
            0x01 => Ok(Order::F),
            other => Err(CodecError::UnknownOrdering(other)),
        }
    }
}

/// Rust scalar types that can live in a [`NumericArray`].
pub trait Element: Copy {
    const DTYPE: DType;

    fn put_le(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `Self::DTYPE.size()` long.
    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                fn put_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(f32 => F32, f64 => F64, i32 => I32, i64 => I64, u8 => U8);

/// A shaped, typed, contiguous element buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    shape: Vec<usize>,
    dtype: DType,
    order: Order,
    data: Vec<u8>,
}

impl NumericArray {
    /// Build from raw little-endian element bytes.
    ///
    /// Fails if `data` does not hold exactly `product(shape)` elements.
    pub fn from_raw(
        shape: Vec<usize>,
        dtype: DType,
        order: Order,
        data: Vec<u8>,
    ) -> Result<Self, CodecError> {
        let expected = element_count(&shape)
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or(CodecError::ShapeOverflow)?;
        if data.len() != expected {
            return Err(CodecError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            order,
            data,
        })
    }

    /// Build a row-major array from typed elements.
    pub fn from_elements<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, CodecError> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for v in values {
            v.put_le(&mut data);
        }
        Self::from_raw(shape, T::DTYPE, Order::C, data)
    }

    /// A 1×1 array holding `value`.
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: vec![1, 1],
            dtype: DType::F64,
            order: Order::C,
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// `n` evenly spaced f32 values from `start` to `end` inclusive, shaped `[n]`.
    pub fn linspace(start: f32, end: f32, n: usize) -> Self {
        let step = if n > 1 {
            (end - start) / (n - 1) as f32
        } else {
            0.0
        };
        let values: Vec<f32> = (0..n).map(|i| start + step * i as f32).collect();
        let mut data = Vec::with_capacity(n * 4);
        for v in values {
            v.put_le(&mut data);
        }
        Self {
            shape: vec![n],
            dtype: DType::F32,
            order: Order::C,
            data,
        }
    }

    /// Same elements, new shape. The element count must not change.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, CodecError> {
        Self::from_raw(shape, self.dtype, self.order, self.data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian element bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy the elements out as `T`. Returns `None` if `T` is not the array's dtype.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if T::DTYPE != self.dtype {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.dtype.size())
                .map(T::from_le)
                .collect(),
        )
    }
}

/// Number of elements described by `shape`, or `None` if it overflows.
/// A rank-0 shape holds one element.
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}
