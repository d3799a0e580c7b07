//! N-dimensional typed arrays.
//!
//! An [`NDArray`] is a shape plus a contiguous little-endian buffer of fixed
//! size elements. The buffer is a [`Bytes`] handle so arrays move through the
//! pipeline and the codecs without copying the payload.

use bytes::{BufMut, Bytes, BytesMut};
use num_complex::{Complex32, Complex64};

use crate::error::{CoreError, CoreResult};
use crate::types::ValueType;

/// Scalar types that can be stored in an [`NDArray`].
pub trait ArrayElement: Copy + Sized {
    /// Tag written into the array header.
    const VALUE_TYPE: ValueType;

    /// Append the little-endian representation.
    fn put(self, buf: &mut BytesMut);

    /// Read one element from exactly `size_of::<Self>()` bytes.
    fn take(bytes: &[u8]) -> Self;
}

macro_rules! impl_array_element {
    ($ty:ty, $vt:expr, $put:ident) => {
        impl ArrayElement for $ty {
            const VALUE_TYPE: ValueType = $vt;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn take(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_array_element!(i8, ValueType::Int8, put_i8);
impl_array_element!(u8, ValueType::UInt8, put_u8);
impl_array_element!(i16, ValueType::Int16, put_i16_le);
impl_array_element!(u16, ValueType::UInt16, put_u16_le);
impl_array_element!(i32, ValueType::Int32, put_i32_le);
impl_array_element!(u32, ValueType::UInt32, put_u32_le);
impl_array_element!(i64, ValueType::Int64, put_i64_le);
impl_array_element!(u64, ValueType::UInt64, put_u64_le);
impl_array_element!(f32, ValueType::Float, put_f32_le);
impl_array_element!(f64, ValueType::Double, put_f64_le);

impl ArrayElement for bool {
    const VALUE_TYPE: ValueType = ValueType::Bool;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self));
    }

    fn take(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl ArrayElement for Complex32 {
    const VALUE_TYPE: ValueType = ValueType::ComplexFloat;

    fn put(self, buf: &mut BytesMut) {
        buf.put_f32_le(self.re);
        buf.put_f32_le(self.im);
    }

    fn take(bytes: &[u8]) -> Self {
        Complex32::new(f32::take(&bytes[..4]), f32::take(&bytes[4..8]))
    }
}

impl ArrayElement for Complex64 {
    const VALUE_TYPE: ValueType = ValueType::ComplexDouble;

    fn put(self, buf: &mut BytesMut) {
        buf.put_f64_le(self.re);
        buf.put_f64_le(self.im);
    }

    fn take(bytes: &[u8]) -> Self {
        Complex64::new(f64::take(&bytes[..8]), f64::take(&bytes[8..16]))
    }
}

/// Shape + element type + contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NDArray {
    shape: Vec<u64>,
    element_type: ValueType,
    data: Bytes,
}

impl NDArray {
    /// Build an array by copying typed elements.
    ///
    /// Fails if the product of `shape` does not match `values.len()`.
    pub fn new<T: ArrayElement>(values: &[T], shape: Vec<u64>) -> CoreResult<Self> {
        let expected: u64 = shape.iter().product();
        if expected != values.len() as u64 {
            return Err(CoreError::Schema(format!(
                "shape {:?} holds {} elements but {} were given",
                shape,
                expected,
                values.len()
            )));
        }
        let size = T::VALUE_TYPE.fixed_size().unwrap_or(1);
        let mut buf = BytesMut::with_capacity(values.len() * size);
        for v in values {
            v.put(&mut buf);
        }
        Ok(Self {
            shape,
            element_type: T::VALUE_TYPE,
            data: buf.freeze(),
        })
    }

    /// One-dimensional array.
    pub fn from_slice<T: ArrayElement>(values: &[T]) -> Self {
        let size = T::VALUE_TYPE.fixed_size().unwrap_or(1);
        let mut buf = BytesMut::with_capacity(values.len() * size);
        for v in values {
            v.put(&mut buf);
        }
        Self {
            shape: vec![values.len() as u64],
            element_type: T::VALUE_TYPE,
            data: buf.freeze(),
        }
    }

    /// Wrap an existing buffer without copying.
    pub fn from_raw(shape: Vec<u64>, element_type: ValueType, data: Bytes) -> CoreResult<Self> {
        let size = element_type.fixed_size().ok_or_else(|| {
            CoreError::Schema(format!("{} cannot be an ndarray element", element_type))
        })?;
        let count: u64 = shape.iter().product();
        if count.saturating_mul(size as u64) != data.len() as u64 {
            return Err(CoreError::Schema(format!(
                "buffer of {} bytes does not match shape {:?} of {}",
                data.len(),
                shape,
                element_type
            )));
        }
        Ok(Self {
            shape,
            element_type,
            data,
        })
    }

    /// Dimensions, slowest varying first.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Type of every element.
    pub fn element_type(&self) -> ValueType {
        self.element_type
    }

    /// Raw little-endian buffer.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    /// True when the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the buffer into typed elements.
    pub fn to_vec<T: ArrayElement>(&self) -> CoreResult<Vec<T>> {
        if T::VALUE_TYPE != self.element_type {
            return Err(CoreError::TypeMismatch {
                path: String::new(),
                expected: T::VALUE_TYPE.name().to_string(),
                actual: self.element_type.name().to_string(),
            });
        }
        let size = self.element_type.fixed_size().unwrap_or(1);
        Ok(self.data.chunks_exact(size).map(T::take).collect())
    }
}
