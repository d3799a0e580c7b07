//! Binary Hash codec.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! hash      := u32 count, entry*
//! entry     := key, u32 type-tag, u32 attr-count, attribute*, value
//! attribute := key, u32 type-tag, value
//! key       := u8 length, utf-8 bytes
//! value     := scalar (little-endian) | u32 len, bytes (string, byte array)
//!            | u32 count, element* (vectors) | hash
//!            | u32 rank, u64 dim*, u32 element-tag, u64 byte-len, bytes (ndarray)
//! ```
//!
//! Decoding failures report the byte offset where the input stopped making
//! sense. Decoding from [`Bytes`] slices byte arrays and ndarray payloads out of
//! the input without copying.

use bytes::{BufMut, Bytes, BytesMut};
use num_complex::{Complex32, Complex64};

use crate::error::{CoreError, CoreResult};
use crate::hash::{Attributes, Hash, Node};
use crate::ndarray::NDArray;
use crate::types::ValueType;
use crate::value::Value;

/// Deepest hash nesting the decoder accepts.
pub const MAX_NESTING: usize = 256;

// =============================================================================
// Encoding
// =============================================================================

/// Encode a hash into a fresh buffer.
pub fn to_binary(hash: &Hash) -> CoreResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    write_hash(&mut buf, hash)?;
    Ok(buf.freeze())
}

/// Append the encoding of `hash` to `buf`.
pub fn write_hash(buf: &mut BytesMut, hash: &Hash) -> CoreResult<()> {
    buf.put_u32_le(hash.len() as u32);
    for node in hash {
        write_node(buf, node)?;
    }
    Ok(())
}

fn write_key(buf: &mut BytesMut, key: &str) -> CoreResult<()> {
    let len = u8::try_from(key.len())
        .map_err(|_| CoreError::Encode(format!("key of {} bytes exceeds 255", key.len())))?;
    buf.put_u8(len);
    buf.put_slice(key.as_bytes());
    Ok(())
}

fn write_node(buf: &mut BytesMut, node: &Node) -> CoreResult<()> {
    write_key(buf, node.key())?;
    buf.put_u32_le(node.value().value_type().tag());
    write_attributes(buf, node.attributes())?;
    write_value(buf, node.value())
}

fn write_attributes(buf: &mut BytesMut, attributes: &Attributes) -> CoreResult<()> {
    buf.put_u32_le(attributes.len() as u32);
    for (name, value) in attributes.iter() {
        write_key(buf, name)?;
        buf.put_u32_le(value.value_type().tag());
        write_value(buf, value)?;
    }
    Ok(())
}

fn write_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

macro_rules! put_vec {
    ($buf:expr, $v:expr, $put:ident) => {{
        $buf.put_u32_le($v.len() as u32);
        for x in $v {
            $buf.$put(*x);
        }
    }};
}

fn write_value(buf: &mut BytesMut, value: &Value) -> CoreResult<()> {
    match value {
        Value::None => buf.put_u32_le(0),
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::Int8(v) => buf.put_i8(*v),
        Value::UInt8(v) => buf.put_u8(*v),
        Value::Int16(v) => buf.put_i16_le(*v),
        Value::UInt16(v) => buf.put_u16_le(*v),
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::UInt32(v) => buf.put_u32_le(*v),
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::UInt64(v) => buf.put_u64_le(*v),
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::ComplexFloat(c) => {
            buf.put_f32_le(c.re);
            buf.put_f32_le(c.im);
        }
        Value::ComplexDouble(c) => {
            buf.put_f64_le(c.re);
            buf.put_f64_le(c.im);
        }
        Value::String(s) => write_str(buf, s),
        Value::ByteArray(b) => {
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Hash(h) => write_hash(buf, h)?,
        Value::VectorBool(v) => {
            buf.put_u32_le(v.len() as u32);
            for x in v {
                buf.put_u8(u8::from(*x));
            }
        }
        Value::VectorInt8(v) => put_vec!(buf, v, put_i8),
        Value::VectorUInt8(v) => {
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v);
        }
        Value::VectorInt16(v) => put_vec!(buf, v, put_i16_le),
        Value::VectorUInt16(v) => put_vec!(buf, v, put_u16_le),
        Value::VectorInt32(v) => put_vec!(buf, v, put_i32_le),
        Value::VectorUInt32(v) => put_vec!(buf, v, put_u32_le),
        Value::VectorInt64(v) => put_vec!(buf, v, put_i64_le),
        Value::VectorUInt64(v) => put_vec!(buf, v, put_u64_le),
        Value::VectorFloat(v) => put_vec!(buf, v, put_f32_le),
        Value::VectorDouble(v) => put_vec!(buf, v, put_f64_le),
        Value::VectorComplexFloat(v) => {
            buf.put_u32_le(v.len() as u32);
            for c in v {
                buf.put_f32_le(c.re);
                buf.put_f32_le(c.im);
            }
        }
        Value::VectorComplexDouble(v) => {
            buf.put_u32_le(v.len() as u32);
            for c in v {
                buf.put_f64_le(c.re);
                buf.put_f64_le(c.im);
            }
        }
        Value::VectorString(v) => {
            buf.put_u32_le(v.len() as u32);
            for s in v {
                write_str(buf, s);
            }
        }
        Value::VectorHash(v) => {
            buf.put_u32_le(v.len() as u32);
            for h in v {
                write_hash(buf, h)?;
            }
        }
        Value::NDArray(a) => {
            buf.put_u32_le(a.shape().len() as u32);
            for dim in a.shape() {
                buf.put_u64_le(*dim);
            }
            buf.put_u32_le(a.element_type().tag());
            buf.put_u64_le(a.data().len() as u64);
            buf.put_slice(a.data());
        }
    }
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode exactly one hash occupying all of `data`.
pub fn from_binary(data: &[u8]) -> CoreResult<Hash> {
    let mut reader = Reader::new(data, None);
    let hash = reader.hash()?;
    reader.finish()?;
    Ok(hash)
}

/// Decode exactly one hash, sharing byte-array and ndarray payloads with `data`.
pub fn from_bytes(data: &Bytes) -> CoreResult<Hash> {
    let mut reader = Reader::new(data, Some(data));
    let hash = reader.hash()?;
    reader.finish()?;
    Ok(hash)
}

/// Decode one hash from the front of `data`; returns it with the bytes consumed.
///
/// Used where hashes are concatenated, e.g. message header followed by body.
pub fn read_hash_prefix(data: &Bytes) -> CoreResult<(Hash, usize)> {
    let mut reader = Reader::new(data, Some(data));
    let hash = reader.hash()?;
    Ok((hash, reader.pos))
}

struct Reader<'a> {
    data: &'a [u8],
    shared: Option<&'a Bytes>,
    pos: usize,
    depth: usize,
}

macro_rules! read_scalar {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self) -> CoreResult<$ty> {
            let raw = self.take(std::mem::size_of::<$ty>())?;
            let mut arr = [0u8; std::mem::size_of::<$ty>()];
            arr.copy_from_slice(raw);
            Ok(<$ty>::from_le_bytes(arr))
        }
    };
}

macro_rules! read_vec {
    ($self:ident, $read:ident) => {{
        let count = $self.count()?;
        let mut out = Vec::with_capacity(count.min($self.remaining()));
        for _ in 0..count {
            out.push($self.$read()?);
        }
        out
    }};
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], shared: Option<&'a Bytes>) -> Self {
        Self {
            data,
            shared,
            pos: 0,
            depth: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn finish(&self) -> CoreResult<()> {
        if self.remaining() != 0 {
            return Err(CoreError::malformed(
                self.pos,
                format!("{} trailing bytes", self.remaining()),
            ));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(CoreError::malformed(
                self.pos,
                format!("need {} bytes, {} left", n, self.remaining()),
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_bytes(&mut self, n: usize) -> CoreResult<Bytes> {
        let start = self.pos;
        let slice = self.take(n)?;
        Ok(match self.shared {
            Some(shared) => shared.slice(start..start + n),
            None => Bytes::copy_from_slice(slice),
        })
    }

    read_scalar!(u8, u8);
    read_scalar!(i8, i8);
    read_scalar!(i16, i16);
    read_scalar!(u16, u16);
    read_scalar!(i32, i32);
    read_scalar!(u32, u32);
    read_scalar!(i64, i64);
    read_scalar!(u64, u64);
    read_scalar!(f32, f32);
    read_scalar!(f64, f64);

    fn bool(&mut self) -> CoreResult<bool> {
        Ok(self.u8()? != 0)
    }

    fn count(&mut self) -> CoreResult<usize> {
        Ok(self.u32()? as usize)
    }

    fn c32(&mut self) -> CoreResult<Complex32> {
        Ok(Complex32::new(self.f32()?, self.f32()?))
    }

    fn c64(&mut self) -> CoreResult<Complex64> {
        Ok(Complex64::new(self.f64()?, self.f64()?))
    }

    fn key(&mut self) -> CoreResult<String> {
        let at = self.pos;
        let len = self.u8()? as usize;
        if len > self.remaining() {
            return Err(CoreError::malformed(
                at,
                format!("key length {} overflows remaining {} bytes", len, self.remaining()),
            ));
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CoreError::malformed(at, "key is not UTF-8"))
    }

    fn string(&mut self) -> CoreResult<String> {
        let at = self.pos;
        let len = self.count()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CoreError::malformed(at, "string is not UTF-8"))
    }

    fn tag(&mut self) -> CoreResult<ValueType> {
        let at = self.pos;
        let tag = self.u32()?;
        ValueType::from_tag(tag)
            .ok_or_else(|| CoreError::malformed(at, format!("unknown type tag {}", tag)))
    }

    fn hash(&mut self) -> CoreResult<Hash> {
        if self.depth >= MAX_NESTING {
            return Err(CoreError::malformed(
                self.pos,
                format!("hash nested deeper than {} levels", MAX_NESTING),
            ));
        }
        self.depth += 1;
        let hash = self.entries();
        self.depth -= 1;
        hash
    }

    fn entries(&mut self) -> CoreResult<Hash> {
        let count = self.count()?;
        let mut nodes = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let key = self.key()?;
            let value_type = self.tag()?;
            let attr_count = self.count()?;
            let mut attributes = Attributes::new();
            for _ in 0..attr_count {
                let name = self.key()?;
                let attr_type = self.tag()?;
                attributes.set(name, self.value(attr_type)?);
            }
            let mut node = Node::new(key, self.value(value_type)?);
            *node.attributes_mut() = attributes;
            nodes.push(node);
        }
        Ok(nodes.into_iter().collect())
    }

    fn value(&mut self, value_type: ValueType) -> CoreResult<Value> {
        let value = match value_type {
            ValueType::None => {
                self.u32()?;
                Value::None
            }
            ValueType::Bool => Value::Bool(self.bool()?),
            ValueType::Int8 => Value::Int8(self.i8()?),
            ValueType::UInt8 => Value::UInt8(self.u8()?),
            ValueType::Int16 => Value::Int16(self.i16()?),
            ValueType::UInt16 => Value::UInt16(self.u16()?),
            ValueType::Int32 => Value::Int32(self.i32()?),
            ValueType::UInt32 => Value::UInt32(self.u32()?),
            ValueType::Int64 => Value::Int64(self.i64()?),
            ValueType::UInt64 => Value::UInt64(self.u64()?),
            ValueType::Float => Value::Float(self.f32()?),
            ValueType::Double => Value::Double(self.f64()?),
            ValueType::ComplexFloat => Value::ComplexFloat(self.c32()?),
            ValueType::ComplexDouble => Value::ComplexDouble(self.c64()?),
            ValueType::String => Value::String(self.string()?),
            ValueType::ByteArray => {
                let len = self.count()?;
                Value::ByteArray(self.take_bytes(len)?)
            }
            ValueType::Hash => Value::Hash(self.hash()?),
            ValueType::VectorBool => Value::VectorBool(read_vec!(self, bool)),
            ValueType::VectorInt8 => Value::VectorInt8(read_vec!(self, i8)),
            ValueType::VectorUInt8 => {
                let len = self.count()?;
                Value::VectorUInt8(self.take(len)?.to_vec())
            }
            ValueType::VectorInt16 => Value::VectorInt16(read_vec!(self, i16)),
            ValueType::VectorUInt16 => Value::VectorUInt16(read_vec!(self, u16)),
            ValueType::VectorInt32 => Value::VectorInt32(read_vec!(self, i32)),
            ValueType::VectorUInt32 => Value::VectorUInt32(read_vec!(self, u32)),
            ValueType::VectorInt64 => Value::VectorInt64(read_vec!(self, i64)),
            ValueType::VectorUInt64 => Value::VectorUInt64(read_vec!(self, u64)),
            ValueType::VectorFloat => Value::VectorFloat(read_vec!(self, f32)),
            ValueType::VectorDouble => Value::VectorDouble(read_vec!(self, f64)),
            ValueType::VectorComplexFloat => Value::VectorComplexFloat(read_vec!(self, c32)),
            ValueType::VectorComplexDouble => Value::VectorComplexDouble(read_vec!(self, c64)),
            ValueType::VectorString => Value::VectorString(read_vec!(self, string)),
            ValueType::VectorHash => Value::VectorHash(read_vec!(self, hash)),
            ValueType::NDArray => {
                let at = self.pos;
                let rank = self.count()?;
                let shape = read_n(self, rank)?;
                let element_type = self.tag()?;
                let len = self.u64()?;
                let len = usize::try_from(len)
                    .map_err(|_| CoreError::malformed(at, "ndarray length overflows"))?;
                let data = self.take_bytes(len)?;
                let array = NDArray::from_raw(shape, element_type, data)
                    .map_err(|e| CoreError::malformed(at, e.to_string()))?;
                Value::NDArray(array)
            }
        };
        Ok(value)
    }
}

fn read_n(reader: &mut Reader<'_>, n: usize) -> CoreResult<Vec<u64>> {
    let mut out = Vec::with_capacity(n.min(reader.remaining()));
    for _ in 0..n {
        out.push(reader.u64()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    #[test]
    fn layout_of_a_single_int() {
        let h = hash! { "a" => 7i32 };
        let bytes = to_binary(&h).unwrap();
        let expected: Vec<u8> = [
            &1u32.to_le_bytes()[..],
            &[1u8, b'a'],
            &12u32.to_le_bytes(),
            &0u32.to_le_bytes(),
            &7i32.to_le_bytes(),
        ]
        .concat();
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn round_trip_nested_and_attributes() {
        let mut h = hash! {
            "s" => "text",
            "n.v" => vec![1.0f64, 2.0],
            "n.flag" => true,
            "none" => Value::None,
        };
        h.set("rows[1].x", 3u64);
        h.set_attribute("s", "unit", "mm").unwrap();
        h.set_attribute("s", "tid", 5u64).unwrap();
        let decoded = from_binary(&to_binary(&h).unwrap()).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.keys(), h.keys());
    }

    #[test]
    fn ndarray_payload_is_shared() {
        let arr = NDArray::new(&[1u16, 2, 3, 4], vec![2, 2]).unwrap();
        let h = hash! { "img" => arr.clone() };
        let bytes = to_binary(&h).unwrap();
        let decoded = from_bytes(&bytes).unwrap();
        assert_eq!(decoded.get::<NDArray>("img").unwrap(), arr);
    }

    #[test]
    fn truncation_reports_offset() {
        let h = hash! { "abc" => "hello" };
        let bytes = to_binary(&h).unwrap();
        let err = from_binary(&bytes[..bytes.len() - 2]).unwrap_err();
        match err {
            CoreError::MalformedHash { offset, .. } => assert_eq!(offset, 20),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_and_key_overflow() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&1u32.to_le_bytes());
        bad.extend_from_slice(&[1, b'k']);
        bad.extend_from_slice(&99u32.to_le_bytes());
        bad.extend_from_slice(&0u32.to_le_bytes());
        let err = from_binary(&bad).unwrap_err();
        assert!(matches!(err, CoreError::MalformedHash { offset: 6, .. }));

        let mut overflow = Vec::new();
        overflow.extend_from_slice(&1u32.to_le_bytes());
        overflow.extend_from_slice(&[200, b'k']);
        let err = from_binary(&overflow).unwrap_err();
        assert!(matches!(err, CoreError::MalformedHash { offset: 4, .. }));
    }

    #[test]
    fn long_keys_do_not_encode() {
        let mut h = Hash::new();
        h.set(&"k".repeat(300), 1i32);
        assert!(matches!(to_binary(&h), Err(CoreError::Encode(_))));
    }

    #[test]
    fn prefix_decoding_reports_consumed() {
        let a = to_binary(&hash! { "x" => 1i32 }).unwrap();
        let b = to_binary(&hash! { "y" => 2i32 }).unwrap();
        let joined = Bytes::from([&a[..], &b[..]].concat());
        let (first, used) = read_hash_prefix(&joined).unwrap();
        assert_eq!(used, a.len());
        assert_eq!(first.get::<i32>("x").unwrap(), 1);
        assert_eq!(from_bytes(&joined.slice(used..)).unwrap().get::<i32>("y").unwrap(), 2);
    }
}
