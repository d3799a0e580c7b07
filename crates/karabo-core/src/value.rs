//! The tagged union stored in every Hash node and attribute.
//!
//! [`Value`] covers the closed type set of [`ValueType`]. Typed access goes
//! through [`FromValue`] (exact type) or [`Value::cast`] (converting). The
//! conversion table in `cast` is the single source of truth for `get_as` and
//! for the validator's type coercion:
//!
//! | from \ to        | bool | integer | float | complex | string | vector |
//! |------------------|------|---------|-------|---------|--------|--------|
//! | bool             |  =   |   0/1   |  0/1  |    -    |  yes   |   -    |
//! | integer          | != 0 | ranged  |  yes  |  re=x   |  yes   |   -    |
//! | float            | != 0 | integral, ranged | yes | re=x | yes |   -    |
//! | string           | text | parsed  | parsed| parsed  |   =    | split on `,` |
//! | vector           |  -   |    -    |   -   |    -    | joined | elementwise |

use std::fmt;

use bytes::Bytes;
use num_complex::{Complex32, Complex64};

use crate::error::{CoreError, CoreResult};
use crate::hash::Hash;
use crate::ndarray::NDArray;
use crate::types::ValueType;

/// A typed value.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    ComplexFloat(Complex32),
    ComplexDouble(Complex64),
    String(String),
    ByteArray(Bytes),
    Hash(Hash),
    VectorBool(Vec<bool>),
    VectorInt8(Vec<i8>),
    VectorUInt8(Vec<u8>),
    VectorInt16(Vec<i16>),
    VectorUInt16(Vec<u16>),
    VectorInt32(Vec<i32>),
    VectorUInt32(Vec<u32>),
    VectorInt64(Vec<i64>),
    VectorUInt64(Vec<u64>),
    VectorFloat(Vec<f32>),
    VectorDouble(Vec<f64>),
    VectorComplexFloat(Vec<Complex32>),
    VectorComplexDouble(Vec<Complex64>),
    VectorString(Vec<String>),
    VectorHash(Vec<Hash>),
    NDArray(NDArray),
}

/// Intermediate form for scalar numeric conversions.
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

impl Value {
    /// Type tag of the stored value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::None => ValueType::None,
            Value::Bool(_) => ValueType::Bool,
            Value::Int8(_) => ValueType::Int8,
            Value::UInt8(_) => ValueType::UInt8,
            Value::Int16(_) => ValueType::Int16,
            Value::UInt16(_) => ValueType::UInt16,
            Value::Int32(_) => ValueType::Int32,
            Value::UInt32(_) => ValueType::UInt32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::ComplexFloat(_) => ValueType::ComplexFloat,
            Value::ComplexDouble(_) => ValueType::ComplexDouble,
            Value::String(_) => ValueType::String,
            Value::ByteArray(_) => ValueType::ByteArray,
            Value::Hash(_) => ValueType::Hash,
            Value::VectorBool(_) => ValueType::VectorBool,
            Value::VectorInt8(_) => ValueType::VectorInt8,
            Value::VectorUInt8(_) => ValueType::VectorUInt8,
            Value::VectorInt16(_) => ValueType::VectorInt16,
            Value::VectorUInt16(_) => ValueType::VectorUInt16,
            Value::VectorInt32(_) => ValueType::VectorInt32,
            Value::VectorUInt32(_) => ValueType::VectorUInt32,
            Value::VectorInt64(_) => ValueType::VectorInt64,
            Value::VectorUInt64(_) => ValueType::VectorUInt64,
            Value::VectorFloat(_) => ValueType::VectorFloat,
            Value::VectorDouble(_) => ValueType::VectorDouble,
            Value::VectorComplexFloat(_) => ValueType::VectorComplexFloat,
            Value::VectorComplexDouble(_) => ValueType::VectorComplexDouble,
            Value::VectorString(_) => ValueType::VectorString,
            Value::VectorHash(_) => ValueType::VectorHash,
            Value::NDArray(_) => ValueType::NDArray,
        }
    }

    /// True for [`Value::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Nested hash, if this is one.
    pub fn as_hash(&self) -> Option<&Hash> {
        match self {
            Value::Hash(h) => Some(h),
            _ => None,
        }
    }

    /// Mutable nested hash, if this is one.
    pub fn as_hash_mut(&mut self) -> Option<&mut Hash> {
        match self {
            Value::Hash(h) => Some(h),
            _ => None,
        }
    }

    /// Vector of hashes, if this is one.
    pub fn as_vector_hash(&self) -> Option<&Vec<Hash>> {
        match self {
            Value::VectorHash(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable vector of hashes, if this is one.
    pub fn as_vector_hash_mut(&mut self) -> Option<&mut Vec<Hash>> {
        match self {
            Value::VectorHash(v) => Some(v),
            _ => None,
        }
    }

    /// String slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric scalar widened to `f64`; used for bound and alarm checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self.number_exact()? {
            Number::Int(i) => Some(i as f64),
            Number::Float(f) => Some(f),
        }
    }

    /// Number of elements for vector-like values, `None` for scalars.
    pub fn element_count(&self) -> Option<usize> {
        let n = match self {
            Value::VectorBool(v) => v.len(),
            Value::VectorInt8(v) => v.len(),
            Value::VectorUInt8(v) => v.len(),
            Value::VectorInt16(v) => v.len(),
            Value::VectorUInt16(v) => v.len(),
            Value::VectorInt32(v) => v.len(),
            Value::VectorUInt32(v) => v.len(),
            Value::VectorInt64(v) => v.len(),
            Value::VectorUInt64(v) => v.len(),
            Value::VectorFloat(v) => v.len(),
            Value::VectorDouble(v) => v.len(),
            Value::VectorComplexFloat(v) => v.len(),
            Value::VectorComplexDouble(v) => v.len(),
            Value::VectorString(v) => v.len(),
            Value::VectorHash(v) => v.len(),
            Value::ByteArray(b) => b.len(),
            Value::NDArray(a) => a.len(),
            _ => return None,
        };
        Some(n)
    }

    /// Split a vector into scalar values.
    pub fn elements(&self) -> Option<Vec<Value>> {
        fn wrap<T: Clone + Into<Value>>(v: &[T]) -> Vec<Value> {
            v.iter().cloned().map(Into::into).collect()
        }
        let out = match self {
            Value::VectorBool(v) => wrap(v),
            Value::VectorInt8(v) => wrap(v),
            Value::VectorUInt8(v) => wrap(v),
            Value::VectorInt16(v) => wrap(v),
            Value::VectorUInt16(v) => wrap(v),
            Value::VectorInt32(v) => wrap(v),
            Value::VectorUInt32(v) => wrap(v),
            Value::VectorInt64(v) => wrap(v),
            Value::VectorUInt64(v) => wrap(v),
            Value::VectorFloat(v) => wrap(v),
            Value::VectorDouble(v) => wrap(v),
            Value::VectorComplexFloat(v) => wrap(v),
            Value::VectorComplexDouble(v) => wrap(v),
            Value::VectorString(v) => wrap(v),
            Value::VectorHash(v) => wrap(v),
            Value::ByteArray(b) => b.iter().copied().map(Value::UInt8).collect(),
            _ => return None,
        };
        Some(out)
    }

    /// Rebuild a vector of type `vector_type` from scalars of its element type.
    pub fn from_elements(vector_type: ValueType, elements: Vec<Value>) -> Option<Value> {
        fn collect<T: FromValue>(elements: Vec<Value>) -> Option<Vec<T>> {
            elements.iter().map(T::from_value).collect()
        }
        let out = match vector_type {
            ValueType::VectorBool => Value::VectorBool(collect(elements)?),
            ValueType::VectorInt8 => Value::VectorInt8(collect(elements)?),
            ValueType::VectorUInt8 => Value::VectorUInt8(collect(elements)?),
            ValueType::VectorInt16 => Value::VectorInt16(collect(elements)?),
            ValueType::VectorUInt16 => Value::VectorUInt16(collect(elements)?),
            ValueType::VectorInt32 => Value::VectorInt32(collect(elements)?),
            ValueType::VectorUInt32 => Value::VectorUInt32(collect(elements)?),
            ValueType::VectorInt64 => Value::VectorInt64(collect(elements)?),
            ValueType::VectorUInt64 => Value::VectorUInt64(collect(elements)?),
            ValueType::VectorFloat => Value::VectorFloat(collect(elements)?),
            ValueType::VectorDouble => Value::VectorDouble(collect(elements)?),
            ValueType::VectorComplexFloat => Value::VectorComplexFloat(collect(elements)?),
            ValueType::VectorComplexDouble => Value::VectorComplexDouble(collect(elements)?),
            ValueType::VectorString => Value::VectorString(collect(elements)?),
            ValueType::VectorHash => Value::VectorHash(collect(elements)?),
            _ => return None,
        };
        Some(out)
    }

    fn number_exact(&self) -> Option<Number> {
        let n = match *self {
            Value::Bool(b) => Number::Int(i128::from(b)),
            Value::Int8(v) => Number::Int(v.into()),
            Value::UInt8(v) => Number::Int(v.into()),
            Value::Int16(v) => Number::Int(v.into()),
            Value::UInt16(v) => Number::Int(v.into()),
            Value::Int32(v) => Number::Int(v.into()),
            Value::UInt32(v) => Number::Int(v.into()),
            Value::Int64(v) => Number::Int(v.into()),
            Value::UInt64(v) => Number::Int(v.into()),
            Value::Float(v) => Number::Float(v.into()),
            Value::Double(v) => Number::Float(v),
            _ => return None,
        };
        Some(n)
    }

    fn number(&self) -> Option<Number> {
        if let Value::String(s) = self {
            let t = s.trim();
            if let Ok(i) = t.parse::<i128>() {
                return Some(Number::Int(i));
            }
            return t.parse::<f64>().ok().map(Number::Float);
        }
        self.number_exact()
    }

    /// Convert into `target`, following the table in the module docs.
    pub fn cast(&self, target: ValueType) -> CoreResult<Value> {
        let source = self.value_type();
        if source == target {
            return Ok(self.clone());
        }
        let fail = || CoreError::Cast {
            from: source.name().to_string(),
            to: target.name().to_string(),
            value: self.to_string(),
        };
        let converted = match target {
            ValueType::String => match self {
                Value::Hash(_) | Value::VectorHash(_) | Value::NDArray(_) | Value::None => None,
                _ => Some(Value::String(self.to_string())),
            },
            ValueType::Bool => match self {
                Value::String(s) => parse_bool(s).map(Value::Bool),
                _ => match self.number_exact() {
                    Some(Number::Int(i)) => Some(Value::Bool(i != 0)),
                    Some(Number::Float(f)) => Some(Value::Bool(f != 0.0)),
                    None => None,
                },
            },
            t if t.is_integer() => match self.number() {
                Some(Number::Int(i)) => integer_value(i, t),
                Some(Number::Float(f)) if f.is_finite() && f.fract() == 0.0 => {
                    integer_value(f as i128, t)
                }
                _ => None,
            },
            ValueType::Float => self.real().and_then(|f| {
                if f.is_finite() && f.abs() > f64::from(f32::MAX) {
                    None
                } else {
                    Some(Value::Float(f as f32))
                }
            }),
            ValueType::Double => self.real().map(Value::Double),
            ValueType::ComplexFloat => self
                .complex()
                .map(|c| Value::ComplexFloat(Complex32::new(c.re as f32, c.im as f32))),
            ValueType::ComplexDouble => self.complex().map(Value::ComplexDouble),
            ValueType::ByteArray => match self {
                Value::VectorUInt8(v) => Some(Value::ByteArray(Bytes::from(v.clone()))),
                Value::String(s) => Some(Value::ByteArray(Bytes::from(s.clone().into_bytes()))),
                _ => None,
            },
            t if t.is_vector() => self.cast_vector(t),
            _ => None,
        };
        converted.ok_or_else(fail)
    }

    fn real(&self) -> Option<f64> {
        match self.number()? {
            Number::Int(i) => Some(i as f64),
            Number::Float(f) => Some(f),
        }
    }

    fn complex(&self) -> Option<Complex64> {
        match self {
            Value::ComplexFloat(c) => Some(Complex64::new(c.re.into(), c.im.into())),
            Value::ComplexDouble(c) => Some(*c),
            Value::String(s) => parse_complex(s),
            _ => self.real().map(|re| Complex64::new(re, 0.0)),
        }
    }

    fn cast_vector(&self, target: ValueType) -> Option<Value> {
        let element_type = target.element_type()?;
        let elements = match self {
            Value::String(s) => {
                if s.trim().is_empty() {
                    Vec::new()
                } else {
                    s.split(',')
                        .map(|part| Value::String(part.trim().to_string()))
                        .collect()
                }
            }
            other => other.elements()?,
        };
        let mut cast = Vec::with_capacity(elements.len());
        for e in elements {
            cast.push(e.cast(element_type).ok()?);
        }
        Value::from_elements(target, cast)
    }
}

fn integer_value(n: i128, target: ValueType) -> Option<Value> {
    let v = match target {
        ValueType::Int8 => Value::Int8(i8::try_from(n).ok()?),
        ValueType::UInt8 => Value::UInt8(u8::try_from(n).ok()?),
        ValueType::Int16 => Value::Int16(i16::try_from(n).ok()?),
        ValueType::UInt16 => Value::UInt16(u16::try_from(n).ok()?),
        ValueType::Int32 => Value::Int32(i32::try_from(n).ok()?),
        ValueType::UInt32 => Value::UInt32(u32::try_from(n).ok()?),
        ValueType::Int64 => Value::Int64(i64::try_from(n).ok()?),
        ValueType::UInt64 => Value::UInt64(u64::try_from(n).ok()?),
        _ => return None,
    };
    Some(v)
}

/// Parse `true/false/1/0` (case-insensitive).
pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parse `(re,im)` or a bare real number.
pub(crate) fn parse_complex(s: &str) -> Option<Complex64> {
    let t = s.trim();
    if let Some(inner) = t.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        let (re, im) = inner.split_once(',')?;
        return Some(Complex64::new(re.trim().parse().ok()?, im.trim().parse().ok()?));
    }
    t.parse::<f64>().ok().map(|re| Complex64::new(re, 0.0))
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn join_complex<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: &[num_complex::Complex<T>],
) -> fmt::Result {
    for (i, c) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "({},{})", c.re, c.im)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::ComplexFloat(c) => write!(f, "({},{})", c.re, c.im),
            Value::ComplexDouble(c) => write!(f, "({},{})", c.re, c.im),
            Value::String(s) => f.write_str(s),
            Value::ByteArray(b) => {
                use base64::Engine as _;
                f.write_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Hash(h) => write!(f, "{}", h),
            Value::VectorBool(v) => join(f, v),
            Value::VectorInt8(v) => join(f, v),
            Value::VectorUInt8(v) => join(f, v),
            Value::VectorInt16(v) => join(f, v),
            Value::VectorUInt16(v) => join(f, v),
            Value::VectorInt32(v) => join(f, v),
            Value::VectorUInt32(v) => join(f, v),
            Value::VectorInt64(v) => join(f, v),
            Value::VectorUInt64(v) => join(f, v),
            Value::VectorFloat(v) => join(f, v),
            Value::VectorDouble(v) => join(f, v),
            Value::VectorComplexFloat(v) => join_complex(f, v),
            Value::VectorComplexDouble(v) => join_complex(f, v),
            Value::VectorString(v) => join(f, v),
            Value::VectorHash(v) => write!(f, "[{} hashes]", v.len()),
            Value::NDArray(a) => write!(f, "NDArray<{}>{:?}", a.element_type(), a.shape()),
        }
    }
}

// =============================================================================
// Typed access
// =============================================================================

/// Types that can be extracted from a [`Value`] without conversion.
pub trait FromValue: Sized {
    /// Tag of the matching [`Value`] variant.
    const VALUE_TYPE: ValueType;

    /// Extract a copy when the variant matches exactly.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl FromValue for $ty {
                const VALUE_TYPE: ValueType = ValueType::$variant;

                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => Some(v.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

value_conversions! {
    bool => Bool,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    Complex32 => ComplexFloat,
    Complex64 => ComplexDouble,
    String => String,
    Bytes => ByteArray,
    Hash => Hash,
    Vec<bool> => VectorBool,
    Vec<i8> => VectorInt8,
    Vec<u8> => VectorUInt8,
    Vec<i16> => VectorInt16,
    Vec<u16> => VectorUInt16,
    Vec<i32> => VectorInt32,
    Vec<u32> => VectorUInt32,
    Vec<i64> => VectorInt64,
    Vec<u64> => VectorUInt64,
    Vec<f32> => VectorFloat,
    Vec<f64> => VectorDouble,
    Vec<Complex32> => VectorComplexFloat,
    Vec<Complex64> => VectorComplexDouble,
    Vec<String> => VectorString,
    Vec<Hash> => VectorHash,
    NDArray => NDArray,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Value::VectorString(v.into_iter().map(str::to_string).collect())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_casts_are_range_checked() {
        assert_eq!(Value::Int32(10).cast(ValueType::UInt8).unwrap(), Value::UInt8(10));
        assert!(Value::Int32(300).cast(ValueType::UInt8).is_err());
        assert!(Value::Int64(-1).cast(ValueType::UInt64).is_err());
        assert_eq!(Value::Double(4.0).cast(ValueType::Int16).unwrap(), Value::Int16(4));
        assert!(Value::Double(4.5).cast(ValueType::Int16).is_err());
        assert_eq!(Value::UInt16(3).cast(ValueType::Double).unwrap(), Value::Double(3.0));
    }

    #[test]
    fn string_casts() {
        assert_eq!(Value::from("42").cast(ValueType::Int32).unwrap(), Value::Int32(42));
        assert_eq!(Value::from(" 2.5 ").cast(ValueType::Float).unwrap(), Value::Float(2.5));
        let err = Value::from("abc").cast(ValueType::Int32).unwrap_err();
        assert!(matches!(err, CoreError::Cast { .. }));
        assert_eq!(Value::Int32(-7).cast(ValueType::String).unwrap(), Value::from("-7"));
        assert_eq!(Value::from("TRUE").cast(ValueType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(
            Value::from("(1,-2)").cast(ValueType::ComplexDouble).unwrap(),
            Value::ComplexDouble(Complex64::new(1.0, -2.0))
        );
    }

    #[test]
    fn vector_casts() {
        assert_eq!(
            Value::from("1, 2,3").cast(ValueType::VectorInt32).unwrap(),
            Value::VectorInt32(vec![1, 2, 3])
        );
        assert_eq!(
            Value::VectorInt32(vec![1, 2]).cast(ValueType::VectorDouble).unwrap(),
            Value::VectorDouble(vec![1.0, 2.0])
        );
        assert_eq!(
            Value::VectorDouble(vec![1.5, 2.0]).cast(ValueType::String).unwrap(),
            Value::from("1.5,2")
        );
        assert_eq!(
            Value::from("").cast(ValueType::VectorString).unwrap(),
            Value::VectorString(vec![])
        );
        assert!(Value::VectorDouble(vec![1.5]).cast(ValueType::VectorInt8).is_err());
    }

    #[test]
    fn hash_never_casts() {
        assert!(Value::Hash(Hash::new()).cast(ValueType::String).is_err());
        assert!(Value::Int32(1).cast(ValueType::Hash).is_err());
    }

    #[test]
    fn typed_extraction() {
        let v: Value = 5u32.into();
        assert_eq!(u32::from_value(&v), Some(5));
        assert_eq!(i32::from_value(&v), None);
        assert_eq!(v.as_f64(), Some(5.0));
        assert_eq!(Value::from(vec!["a", "b"]).element_count(), Some(2));
    }
}
