//! JSON bridge for hashes.
//!
//! Used for configuration given on command lines and in files (the server's
//! `init` argument). The mapping is lossy: JSON integers become `INT32` when
//! they fit and `INT64`/`UINT64` otherwise, floats become `DOUBLE`, arrays of
//! objects become `VECTOR_HASH`, other arrays take the type of their first
//! element. Attributes are not represented.

use serde_json::{Map, Number, Value as Json};

use crate::error::{CoreError, CoreResult};
use crate::hash::Hash;
use crate::value::Value;

/// Build a hash from a JSON object.
pub fn from_json(json: &Json) -> CoreResult<Hash> {
    match json {
        Json::Object(map) => object_to_hash(map),
        other => Err(CoreError::Schema(format!(
            "expected a JSON object, got {}",
            kind(other)
        ))),
    }
}

/// Parse JSON text into a hash.
pub fn from_json_str(text: &str) -> CoreResult<Hash> {
    let json: Json = serde_json::from_str(text).map_err(|e| CoreError::Schema(format!("invalid JSON: {e}")))?;
    from_json(&json)
}

/// Render a hash as a JSON object.
pub fn to_json(hash: &Hash) -> Json {
    let mut map = Map::new();
    for node in hash.iter() {
        map.insert(node.key().to_string(), value_to_json(node.value()));
    }
    Json::Object(map)
}

fn kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

fn object_to_hash(map: &Map<String, Json>) -> CoreResult<Hash> {
    let mut h = Hash::new();
    for (key, json) in map {
        h.set(key, json_to_value(json)?);
    }
    Ok(h)
}

fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        return i32::try_from(i).map_or(Value::Int64(i), Value::Int32);
    }
    if let Some(u) = n.as_u64() {
        return Value::UInt64(u);
    }
    Value::Double(n.as_f64().unwrap_or(f64::NAN))
}

fn json_to_value(json: &Json) -> CoreResult<Value> {
    Ok(match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => number_to_value(n),
        Json::String(s) => Value::String(s.clone()),
        Json::Object(map) => Value::Hash(object_to_hash(map)?),
        Json::Array(items) => array_to_value(items)?,
    })
}

fn array_to_value(items: &[Json]) -> CoreResult<Value> {
    let Some(first) = items.first() else {
        return Ok(Value::VectorString(Vec::new()));
    };
    if first.is_object() {
        let rows = items
            .iter()
            .map(from_json)
            .collect::<CoreResult<Vec<Hash>>>()?;
        return Ok(Value::VectorHash(rows));
    }
    let elements = items.iter().map(json_to_value).collect::<CoreResult<Vec<_>>>()?;
    // mixed ints and floats widen to double
    let any_float = elements.iter().any(|v| matches!(v, Value::Double(_)));
    let element_type = if any_float {
        crate::types::ValueType::Double
    } else {
        elements[0].value_type()
    };
    let vector_type = element_type
        .vector_of()
        .ok_or_else(|| CoreError::Schema(format!("arrays of {element_type} are not supported")))?;
    let cast = elements
        .iter()
        .map(|v| v.cast(element_type))
        .collect::<CoreResult<Vec<_>>>()?;
    Value::from_elements(vector_type, cast)
        .ok_or_else(|| CoreError::Schema("array elements have mixed types".to_string()))
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Hash(h) => to_json(h),
        Value::VectorHash(rows) => Json::Array(rows.iter().map(to_json).collect()),
        Value::String(s) => Json::String(s.clone()),
        other => {
            if let Some(items) = other.elements() {
                return Json::Array(items.iter().map(value_to_json).collect());
            }
            match other.as_f64() {
                Some(x) if other.value_type().is_integer() => match other {
                    Value::UInt64(u) => Json::from(*u),
                    _ => Json::from(x as i64),
                },
                Some(x) => Number::from_f64(x).map_or(Json::Null, Json::Number),
                None => Json::String(other.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_argument_shape() {
        let h = from_json_str(
            r#"{"d1": {"classId": "PropertyTest", "int32Property": 10, "gains": [1, 2.5], "tags": ["a"]}}"#,
        )
        .unwrap();
        assert_eq!(h.get::<String>("d1.classId").unwrap(), "PropertyTest");
        assert_eq!(h.get::<i32>("d1.int32Property").unwrap(), 10);
        assert_eq!(h.get::<Vec<f64>>("d1.gains").unwrap(), vec![1.0, 2.5]);
        assert_eq!(h.get::<Vec<String>>("d1.tags").unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(from_json_str("[1, 2]").is_err());
        assert!(from_json_str("{").is_err());
    }

    #[test]
    fn renders_back() {
        let h = from_json_str(r#"{"a": {"b": 1, "c": [true, false]}, "rows": [{"x": "y"}]}"#).unwrap();
        let json = to_json(&h);
        assert_eq!(json["a"]["b"], Json::from(1));
        assert_eq!(json["a"]["c"], serde_json::json!([true, false]));
        assert_eq!(json["rows"][0]["x"], Json::from("y"));
    }
}
