//! XML Hash codec.
//!
//! Each node becomes an element named after its key. The value type is kept in
//! a `KRB:type` attribute; node attributes are written as XML attributes whose
//! text carries the type as a prefix (`unit="KRB_STRING:mm"`). Nested hashes
//! become child elements, vectors of hashes, strings and complex numbers
//! become `<KRB_Item>` children, other vectors are comma-joined text, byte
//! arrays and ndarray buffers are base64.
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <root KRB_Artificial="">
//!   <speed KRB:type="DOUBLE" unit="KRB_STRING:mm/s">2.5</speed>
//!   <motor KRB:type="HASH">
//!     <name KRB:type="STRING">m1</name>
//!   </motor>
//! </root>
//! ```

use base64::Engine as _;
use bytes::Bytes;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{CoreError, CoreResult};
use crate::hash::{Attributes, Hash, Node};
use crate::ndarray::NDArray;
use crate::types::ValueType;
use crate::value::Value;

const TYPE_ATTRIBUTE: &str = "KRB:type";
const ARTIFICIAL_ROOT: &str = "KRB_Artificial";
const ITEM: &str = "KRB_Item";
const SHAPE_ATTRIBUTE: &str = "KRB:shape";
const ELEMENT_ATTRIBUTE: &str = "KRB:elementType";
const ROOT_NAME: &str = "root";

/// Output options for [`to_xml`].
#[derive(Debug, Clone)]
pub struct XmlOptions {
    /// Spaces per nesting level; `None` writes everything on one line.
    pub indentation: Option<usize>,
    /// Emit the `<?xml ...?>` declaration.
    pub write_declaration: bool,
}

impl Default for XmlOptions {
    fn default() -> Self {
        Self {
            indentation: Some(2),
            write_declaration: true,
        }
    }
}

impl XmlOptions {
    /// Compact single-line output.
    pub fn compact() -> Self {
        Self {
            indentation: None,
            write_declaration: true,
        }
    }
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

// =============================================================================
// Writing
// =============================================================================

/// Serialize a hash to XML text.
pub fn to_xml(hash: &Hash, options: &XmlOptions) -> CoreResult<String> {
    let mut writer = match options.indentation {
        Some(n) => Writer::new_with_indent(Vec::new(), b' ', n),
        None => Writer::new(Vec::new()),
    };
    if options.write_declaration {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    }
    let mut root = BytesStart::new(ROOT_NAME);
    root.push_attribute((ARTIFICIAL_ROOT, ""));
    if hash.is_empty() {
        writer.write_event(Event::Empty(root))?;
    } else {
        writer.write_event(Event::Start(root))?;
        write_nodes(&mut writer, hash)?;
        writer.write_event(Event::End(BytesEnd::new(ROOT_NAME)))?;
    }
    String::from_utf8(writer.into_inner()).map_err(|e| CoreError::Xml(e.to_string()))
}

fn write_nodes(writer: &mut Writer<Vec<u8>>, hash: &Hash) -> CoreResult<()> {
    for node in hash {
        write_node(writer, node)?;
    }
    Ok(())
}

fn attribute_text(value: &Value) -> CoreResult<String> {
    match value {
        Value::Hash(_) | Value::VectorHash(_) | Value::NDArray(_) => Err(CoreError::Xml(format!(
            "attributes of type {} cannot be written as XML",
            value.value_type()
        ))),
        other => Ok(format!("KRB_{}:{}", other.value_type().name(), other)),
    }
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> CoreResult<()> {
    let value = node.value();
    let mut start = BytesStart::new(node.key());
    start.push_attribute((TYPE_ATTRIBUTE, value.value_type().name()));
    if let Value::NDArray(a) = value {
        let shape: Vec<String> = a.shape().iter().map(u64::to_string).collect();
        start.push_attribute((SHAPE_ATTRIBUTE, shape.join(",").as_str()));
        start.push_attribute((ELEMENT_ATTRIBUTE, a.element_type().name()));
    }
    for (name, attr) in node.attributes().iter() {
        start.push_attribute((name, attribute_text(attr)?.as_str()));
    }

    let end = BytesEnd::new(node.key());
    match value {
        Value::Hash(h) if h.is_empty() => writer.write_event(Event::Empty(start))?,
        Value::Hash(h) => {
            writer.write_event(Event::Start(start))?;
            write_nodes(writer, h)?;
            writer.write_event(Event::End(end))?;
        }
        Value::VectorHash(v) => {
            writer.write_event(Event::Start(start))?;
            for element in v {
                if element.is_empty() {
                    writer.write_event(Event::Empty(BytesStart::new(ITEM)))?;
                } else {
                    writer.write_event(Event::Start(BytesStart::new(ITEM)))?;
                    write_nodes(writer, element)?;
                    writer.write_event(Event::End(BytesEnd::new(ITEM)))?;
                }
            }
            writer.write_event(Event::End(end))?;
        }
        Value::VectorString(_) | Value::VectorComplexFloat(_) | Value::VectorComplexDouble(_) => {
            writer.write_event(Event::Start(start))?;
            for element in value.elements().unwrap_or_default() {
                writer.write_event(Event::Start(BytesStart::new(ITEM)))?;
                writer.write_event(Event::Text(BytesText::new(&element.to_string())))?;
                writer.write_event(Event::End(BytesEnd::new(ITEM)))?;
            }
            writer.write_event(Event::End(end))?;
        }
        Value::NDArray(a) => {
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Text(BytesText::new(&b64().encode(a.data()))))?;
            writer.write_event(Event::End(end))?;
        }
        other => {
            let text = other.to_string();
            if text.is_empty() {
                writer.write_event(Event::Empty(start))?;
            } else {
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(&text)))?;
                writer.write_event(Event::End(end))?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Reading
// =============================================================================

/// Parse XML text produced by [`to_xml`] (or a single-rooted equivalent).
pub fn from_xml(text: &str) -> CoreResult<Hash> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if has_attribute(&e, ARTIFICIAL_ROOT)? {
                    let name = element_name(&e)?;
                    return read_children(&mut reader, &name);
                }
                let node = read_node(&mut reader, &e, false)?;
                return Ok(std::iter::once(node).collect());
            }
            Event::Empty(e) => {
                if has_attribute(&e, ARTIFICIAL_ROOT)? {
                    return Ok(Hash::new());
                }
                let node = read_node(&mut reader, &e, true)?;
                return Ok(std::iter::once(node).collect());
            }
            Event::Eof => return Err(CoreError::Xml("document has no root element".into())),
            _ => {}
        }
    }
}

fn element_name(e: &BytesStart<'_>) -> CoreResult<String> {
    std::str::from_utf8(e.name().as_ref())
        .map(str::to_string)
        .map_err(|err| CoreError::Xml(err.to_string()))
}

fn has_attribute(e: &BytesStart<'_>, name: &str) -> CoreResult<bool> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| CoreError::Xml(err.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            return Ok(true);
        }
    }
    Ok(false)
}

struct ElementHeader {
    value_type: ValueType,
    shape: Vec<u64>,
    element_type: Option<ValueType>,
    attributes: Attributes,
}

fn parse_type_name(name: &str) -> CoreResult<ValueType> {
    ValueType::from_name(name).ok_or_else(|| CoreError::Xml(format!("unknown type '{}'", name)))
}

fn read_header(e: &BytesStart<'_>) -> CoreResult<ElementHeader> {
    let mut header = ElementHeader {
        value_type: ValueType::String,
        shape: Vec::new(),
        element_type: None,
        attributes: Attributes::new(),
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|err| CoreError::Xml(err.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| CoreError::Xml(err.to_string()))?
            .to_string();
        let raw = attr.unescape_value()?.into_owned();
        match key.as_str() {
            TYPE_ATTRIBUTE => header.value_type = parse_type_name(&raw)?,
            SHAPE_ATTRIBUTE => {
                header.shape = raw
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.trim()
                            .parse::<u64>()
                            .map_err(|err| CoreError::Xml(err.to_string()))
                    })
                    .collect::<CoreResult<_>>()?;
            }
            ELEMENT_ATTRIBUTE => header.element_type = Some(parse_type_name(&raw)?),
            _ => {
                let value = parse_attribute(&raw)?;
                header.attributes.set(key, value);
            }
        }
    }
    Ok(header)
}

fn parse_attribute(raw: &str) -> CoreResult<Value> {
    if let Some(rest) = raw.strip_prefix("KRB_") {
        if let Some((type_name, text)) = rest.split_once(':') {
            if let Some(value_type) = ValueType::from_name(type_name) {
                return text_to_value(text, value_type);
            }
        }
    }
    Ok(Value::String(raw.to_string()))
}

fn text_to_value(text: &str, value_type: ValueType) -> CoreResult<Value> {
    match value_type {
        ValueType::None => Ok(Value::None),
        ValueType::String => Ok(Value::String(text.to_string())),
        ValueType::ByteArray => b64()
            .decode(text.trim())
            .map(|raw| Value::ByteArray(Bytes::from(raw)))
            .map_err(|err| CoreError::Xml(err.to_string())),
        other => Value::String(text.to_string())
            .cast(other)
            .map_err(|err| CoreError::Xml(err.to_string())),
    }
}

fn read_text(reader: &mut Reader<&[u8]>, end: &str) -> CoreResult<String> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(e) if e.name().as_ref() == end.as_bytes() => return Ok(text),
            Event::Eof => return Err(CoreError::Xml(format!("unterminated element <{}>", end))),
            _ => {}
        }
    }
}

fn read_children(reader: &mut Reader<&[u8]>, end: &str) -> CoreResult<Hash> {
    let mut nodes = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => nodes.push(read_node(reader, &e, false)?),
            Event::Empty(e) => nodes.push(read_node(reader, &e, true)?),
            Event::End(e) if e.name().as_ref() == end.as_bytes() => {
                return Ok(nodes.into_iter().collect())
            }
            Event::Eof => return Err(CoreError::Xml(format!("unterminated element <{}>", end))),
            _ => {}
        }
    }
}

fn read_items(reader: &mut Reader<&[u8]>, end: &str, hashes: bool) -> CoreResult<Vec<Value>> {
    let mut items = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == ITEM.as_bytes() => {
                if hashes {
                    items.push(Value::Hash(read_children(reader, ITEM)?));
                } else {
                    items.push(Value::String(read_text(reader, ITEM)?));
                }
            }
            Event::Empty(e) if e.name().as_ref() == ITEM.as_bytes() => {
                if hashes {
                    items.push(Value::Hash(Hash::new()));
                } else {
                    items.push(Value::String(String::new()));
                }
            }
            Event::End(e) if e.name().as_ref() == end.as_bytes() => return Ok(items),
            Event::Eof => return Err(CoreError::Xml(format!("unterminated element <{}>", end))),
            _ => {}
        }
    }
}

fn read_node(reader: &mut Reader<&[u8]>, e: &BytesStart<'_>, empty: bool) -> CoreResult<Node> {
    let key = element_name(e)?;
    let header = read_header(e)?;
    let value = match header.value_type {
        ValueType::Hash if empty => Value::Hash(Hash::new()),
        ValueType::Hash => Value::Hash(read_children(reader, &key)?),
        ValueType::VectorHash | ValueType::VectorString | ValueType::VectorComplexFloat
        | ValueType::VectorComplexDouble => {
            let items = if empty {
                Vec::new()
            } else {
                read_items(reader, &key, header.value_type == ValueType::VectorHash)?
            };
            let element_type = header
                .value_type
                .element_type()
                .unwrap_or(ValueType::String);
            let mut cast = Vec::with_capacity(items.len());
            for item in items {
                cast.push(item.cast(element_type).map_err(|err| CoreError::Xml(err.to_string()))?);
            }
            Value::from_elements(header.value_type, cast)
                .ok_or_else(|| CoreError::Xml(format!("bad items in <{}>", key)))?
        }
        ValueType::NDArray => {
            let text = if empty { String::new() } else { read_text(reader, &key)? };
            let raw = b64()
                .decode(text.trim())
                .map_err(|err| CoreError::Xml(err.to_string()))?;
            let element_type = header
                .element_type
                .ok_or_else(|| CoreError::Xml(format!("<{}> lacks an element type", key)))?;
            Value::NDArray(
                NDArray::from_raw(header.shape, element_type, Bytes::from(raw))
                    .map_err(|err| CoreError::Xml(err.to_string()))?,
            )
        }
        other => {
            let text = if empty { String::new() } else { read_text(reader, &key)? };
            text_to_value(&text, other)?
        }
    };
    let mut node = Node::new(key, value);
    *node.attributes_mut() = header.attributes;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use num_complex::Complex64;

    fn sample() -> Hash {
        let mut h = hash! {
            "int32Property" => 10i32,
            "doubleProperty" => 2.5f64,
            "name" => "a <quoted> & \"escaped\" text",
            "empty" => "",
            "flag" => true,
            "node.inner" => vec![1u16, 2, 3],
            "node.strings" => vec!["a,b", "c"],
            "complex" => vec![Complex64::new(1.0, 2.0)],
            "bytes" => Bytes::from_static(b"\x00\x01binary"),
            "array" => NDArray::new(&[1i32, 2, 3, 4], vec![2, 2]).unwrap(),
            "nothing" => Value::None,
        };
        h.set("table[0].x", 1i32);
        h.set("table[1]", Hash::new());
        h.set_attribute("doubleProperty", "unit", "mm").unwrap();
        h.set_attribute("doubleProperty", "tid", 42u64).unwrap();
        h
    }

    #[test]
    fn round_trip_preserves_types_and_order() {
        let h = sample();
        for options in [XmlOptions::default(), XmlOptions::compact()] {
            let text = to_xml(&h, &options).unwrap();
            let back = from_xml(&text).unwrap();
            assert_eq!(back, h, "{}", text);
            assert_eq!(back.keys(), h.keys());
        }
    }

    #[test]
    fn leaves_carry_type_attribute() {
        let text = to_xml(&hash! { "a" => 1i32 }, &XmlOptions::compact()).unwrap();
        assert!(text.contains(r#"<a KRB:type="INT32">1</a>"#), "{}", text);
    }

    #[test]
    fn indentation_is_configurable() {
        let h = hash! { "a.b" => 1i32 };
        let pretty = to_xml(&h, &XmlOptions::default()).unwrap();
        let compact = to_xml(&h, &XmlOptions::compact()).unwrap();
        assert!(pretty.contains("\n  <a"));
        assert!(!compact.contains("\n  <a"));
    }

    #[test]
    fn single_rooted_document() {
        let h = from_xml(r#"<device KRB:type="HASH"><x KRB:type="UINT8">7</x></device>"#).unwrap();
        assert_eq!(h.get::<u8>("device.x").unwrap(), 7);
    }

    #[test]
    fn bad_documents_fail() {
        assert!(from_xml("").is_err());
        assert!(from_xml(r#"<root KRB_Artificial=""><a KRB:type="INT32">x</a></root>"#).is_err());
        assert!(from_xml(r#"<root KRB_Artificial=""><a KRB:type="NOPE">1</a></root>"#).is_err());
    }
}
