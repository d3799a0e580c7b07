//! Value type tags.
//!
//! Every value stored in a [`Hash`](crate::Hash) carries one of these tags.
//! The numeric discriminants are the tags written by the binary codec and
//! must never change; the upper-case names are the ones used in XML output
//! and in serialized schemas.

use std::fmt;

/// Closed set of value types a Hash can hold.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ValueType {
    Bool = 0,
    VectorBool = 1,
    Int8 = 4,
    VectorInt8 = 5,
    UInt8 = 6,
    VectorUInt8 = 7,
    Int16 = 8,
    VectorInt16 = 9,
    UInt16 = 10,
    VectorUInt16 = 11,
    Int32 = 12,
    VectorInt32 = 13,
    UInt32 = 14,
    VectorUInt32 = 15,
    Int64 = 16,
    VectorInt64 = 17,
    UInt64 = 18,
    VectorUInt64 = 19,
    Float = 20,
    VectorFloat = 21,
    Double = 22,
    VectorDouble = 23,
    ComplexFloat = 24,
    VectorComplexFloat = 25,
    ComplexDouble = 26,
    VectorComplexDouble = 27,
    String = 28,
    VectorString = 29,
    Hash = 30,
    VectorHash = 31,
    None = 35,
    ByteArray = 37,
    NDArray = 50,
}

/// All tags, in discriminant order.
pub const ALL_VALUE_TYPES: [ValueType; 33] = [
    ValueType::Bool,
    ValueType::VectorBool,
    ValueType::Int8,
    ValueType::VectorInt8,
    ValueType::UInt8,
    ValueType::VectorUInt8,
    ValueType::Int16,
    ValueType::VectorInt16,
    ValueType::UInt16,
    ValueType::VectorUInt16,
    ValueType::Int32,
    ValueType::VectorInt32,
    ValueType::UInt32,
    ValueType::VectorUInt32,
    ValueType::Int64,
    ValueType::VectorInt64,
    ValueType::UInt64,
    ValueType::VectorUInt64,
    ValueType::Float,
    ValueType::VectorFloat,
    ValueType::Double,
    ValueType::VectorDouble,
    ValueType::ComplexFloat,
    ValueType::VectorComplexFloat,
    ValueType::ComplexDouble,
    ValueType::VectorComplexDouble,
    ValueType::String,
    ValueType::VectorString,
    ValueType::Hash,
    ValueType::VectorHash,
    ValueType::None,
    ValueType::ByteArray,
    ValueType::NDArray,
];

impl ValueType {
    /// Wire tag of this type.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Look up a type by its wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        ALL_VALUE_TYPES.iter().copied().find(|t| t.tag() == tag)
    }

    /// Upper-case name used by XML and schema serialization.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "BOOL",
            ValueType::VectorBool => "VECTOR_BOOL",
            ValueType::Int8 => "INT8",
            ValueType::VectorInt8 => "VECTOR_INT8",
            ValueType::UInt8 => "UINT8",
            ValueType::VectorUInt8 => "VECTOR_UINT8",
            ValueType::Int16 => "INT16",
            ValueType::VectorInt16 => "VECTOR_INT16",
            ValueType::UInt16 => "UINT16",
            ValueType::VectorUInt16 => "VECTOR_UINT16",
            ValueType::Int32 => "INT32",
            ValueType::VectorInt32 => "VECTOR_INT32",
            ValueType::UInt32 => "UINT32",
            ValueType::VectorUInt32 => "VECTOR_UINT32",
            ValueType::Int64 => "INT64",
            ValueType::VectorInt64 => "VECTOR_INT64",
            ValueType::UInt64 => "UINT64",
            ValueType::VectorUInt64 => "VECTOR_UINT64",
            ValueType::Float => "FLOAT",
            ValueType::VectorFloat => "VECTOR_FLOAT",
            ValueType::Double => "DOUBLE",
            ValueType::VectorDouble => "VECTOR_DOUBLE",
            ValueType::ComplexFloat => "COMPLEX_FLOAT",
            ValueType::VectorComplexFloat => "VECTOR_COMPLEX_FLOAT",
            ValueType::ComplexDouble => "COMPLEX_DOUBLE",
            ValueType::VectorComplexDouble => "VECTOR_COMPLEX_DOUBLE",
            ValueType::String => "STRING",
            ValueType::VectorString => "VECTOR_STRING",
            ValueType::Hash => "HASH",
            ValueType::VectorHash => "VECTOR_HASH",
            ValueType::None => "NONE",
            ValueType::ByteArray => "BYTE_ARRAY",
            ValueType::NDArray => "NDARRAY",
        }
    }

    /// Look up a type by its upper-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_VALUE_TYPES.iter().copied().find(|t| t.name() == name)
    }

    /// True for the `Vector*` family (not for byte arrays or ndarrays).
    pub fn is_vector(self) -> bool {
        self.element_type().is_some()
    }

    /// Element type of a vector type.
    pub fn element_type(self) -> Option<ValueType> {
        let element = match self {
            ValueType::VectorBool => ValueType::Bool,
            ValueType::VectorInt8 => ValueType::Int8,
            ValueType::VectorUInt8 => ValueType::UInt8,
            ValueType::VectorInt16 => ValueType::Int16,
            ValueType::VectorUInt16 => ValueType::UInt16,
            ValueType::VectorInt32 => ValueType::Int32,
            ValueType::VectorUInt32 => ValueType::UInt32,
            ValueType::VectorInt64 => ValueType::Int64,
            ValueType::VectorUInt64 => ValueType::UInt64,
            ValueType::VectorFloat => ValueType::Float,
            ValueType::VectorDouble => ValueType::Double,
            ValueType::VectorComplexFloat => ValueType::ComplexFloat,
            ValueType::VectorComplexDouble => ValueType::ComplexDouble,
            ValueType::VectorString => ValueType::String,
            ValueType::VectorHash => ValueType::Hash,
            _ => return None,
        };
        Some(element)
    }

    /// Vector type whose elements are `self`.
    pub fn vector_of(self) -> Option<ValueType> {
        ALL_VALUE_TYPES
            .iter()
            .copied()
            .find(|t| t.element_type() == Some(self))
    }

    /// Signed or unsigned integer scalar.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueType::Int8
                | ValueType::UInt8
                | ValueType::Int16
                | ValueType::UInt16
                | ValueType::Int32
                | ValueType::UInt32
                | ValueType::Int64
                | ValueType::UInt64
        )
    }

    /// Real floating point scalar.
    pub fn is_floating_point(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Double)
    }

    /// Complex scalar.
    pub fn is_complex(self) -> bool {
        matches!(self, ValueType::ComplexFloat | ValueType::ComplexDouble)
    }

    /// Integer or real scalar (bounds checks apply to these).
    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_floating_point()
    }

    /// Byte width of a fixed-size scalar, as laid out in ndarray buffers.
    pub fn fixed_size(self) -> Option<usize> {
        let size = match self {
            ValueType::Bool | ValueType::Int8 | ValueType::UInt8 => 1,
            ValueType::Int16 | ValueType::UInt16 => 2,
            ValueType::Int32 | ValueType::UInt32 | ValueType::Float => 4,
            ValueType::Int64 | ValueType::UInt64 | ValueType::Double => 8,
            ValueType::ComplexFloat => 8,
            ValueType::ComplexDouble => 16,
            _ => return None,
        };
        Some(size)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_and_names_are_unique() {
        for (i, a) in ALL_VALUE_TYPES.iter().enumerate() {
            for b in &ALL_VALUE_TYPES[i + 1..] {
                assert_ne!(a.tag(), b.tag());
                assert_ne!(a.name(), b.name());
            }
        }
    }

    #[test]
    fn lookup_by_tag_and_name() {
        assert_eq!(ValueType::from_tag(12), Some(ValueType::Int32));
        assert_eq!(ValueType::from_tag(2), None);
        assert_eq!(ValueType::from_name("VECTOR_HASH"), Some(ValueType::VectorHash));
        assert_eq!(ValueType::from_name("int32"), None);
    }

    #[test]
    fn vector_element_relation() {
        assert_eq!(ValueType::VectorDouble.element_type(), Some(ValueType::Double));
        assert_eq!(ValueType::Double.vector_of(), Some(ValueType::VectorDouble));
        assert!(!ValueType::ByteArray.is_vector());
        assert!(ValueType::VectorString.is_vector());
        assert_eq!(ValueType::NDArray.vector_of(), None);
    }
}
