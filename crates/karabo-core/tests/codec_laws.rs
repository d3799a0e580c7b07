//! Round-trip laws of the binary and XML codecs and of flatten/unflatten.

use bytes::Bytes;
use karabo_core::binary::{from_binary, from_bytes, read_hash_prefix, to_binary, MAX_NESTING};
use karabo_core::xml::{from_xml, to_xml, XmlOptions};
use karabo_core::{hash, CoreError, Hash, NDArray, Value};
use num_complex::Complex64;

fn sample() -> Hash {
    let mut h = hash! {
        "flag" => true,
        "i8" => -3i8,
        "u16" => 65_000u16,
        "i32" => -123_456i32,
        "u64" => u64::MAX,
        "f" => 1.25f32,
        "d" => -2.5e-9f64,
        "c" => Complex64::new(1.0, -1.0),
        "s" => "hello <world> & \"friends\"",
        "bytes" => Bytes::from_static(b"\x00\x01\xffraw"),
        "node.inner.deep" => 7i64,
        "node.empty" => Hash::new(),
        "vectors.ints" => vec![1i32, -2, 3],
        "vectors.doubles" => vec![0.5f64, 1.5],
        "vectors.strings" => vec!["a", "b,c", ""],
        "vectors.bools" => vec![true, false],
        "vectors.empty" => Vec::<u32>::new(),
        "array" => NDArray::new(&[1u16, 2, 3, 4, 5, 6], vec![2, 3]).unwrap(),
        "nothing" => (),
    };
    h.set("rows", vec![hash! { "x" => 1 }, hash! { "y.z" => "q" }]);
    h.set_attribute("d", "unit", "meter").unwrap();
    h.set_attribute("d", "sec", 1_700_000_000u64).unwrap();
    h.set_attribute("vectors.ints", "tags", vec!["a", "b"]).unwrap();
    h
}

#[test]
fn binary_round_trip() {
    let h = sample();
    let bytes = to_binary(&h).unwrap();
    let back = from_binary(&bytes).unwrap();
    assert_eq!(back, h);
    assert_eq!(back.keys(), h.keys(), "insertion order survives");
    assert_eq!(from_bytes(&bytes).unwrap(), h);
}

#[test]
fn binary_is_deterministic() {
    let h = sample();
    assert_eq!(to_binary(&h).unwrap(), to_binary(&h.clone()).unwrap());
}

#[test]
fn prefix_reads_consume_exactly_one_hash() {
    let first = hash! { "a" => 1 };
    let second = hash! { "b" => "two" };
    let mut joined = to_binary(&first).unwrap().to_vec();
    joined.extend_from_slice(&to_binary(&second).unwrap());
    let joined = Bytes::from(joined);
    let (h1, used) = read_hash_prefix(&joined).unwrap();
    assert_eq!(h1, first);
    let (h2, _) = read_hash_prefix(&joined.slice(used..)).unwrap();
    assert_eq!(h2, second);
}

#[test]
fn truncated_input_reports_offset() {
    let bytes = to_binary(&sample()).unwrap();
    for cut in [0usize, 3, 10, bytes.len() / 2, bytes.len() - 1] {
        match from_binary(&bytes[..cut]) {
            Err(CoreError::MalformedHash { offset, .. }) => assert!(offset <= cut),
            other => panic!("cut at {cut}: expected MalformedHash, got {other:?}"),
        }
    }
}

#[test]
fn nesting_beyond_the_limit_is_rejected() {
    let mut h = hash! { "leaf" => 1 };
    for _ in 0..100 {
        h = hash! { "a" => h };
    }
    assert_eq!(from_binary(&to_binary(&h).unwrap()).unwrap(), h);

    // {"a": {}} minus the inner count, repeated, closes with a single empty hash
    let level = to_binary(&hash! { "a" => Hash::new() }).unwrap();
    let opener = &level[..level.len() - 4];
    let mut frame = Vec::with_capacity(opener.len() * 200_000 + 4);
    for _ in 0..200_000 {
        frame.extend_from_slice(opener);
    }
    frame.extend_from_slice(&0u32.to_le_bytes());
    match from_binary(&frame) {
        Err(CoreError::MalformedHash { offset, reason }) => {
            assert_eq!(offset, opener.len() * MAX_NESTING);
            assert!(reason.contains("nested"), "{reason}");
        }
        other => panic!("expected MalformedHash, got {other:?}"),
    }
    assert!(from_bytes(&Bytes::from(frame)).is_err());
}

// Value equality is IEEE equality, so NaN payloads are compared by bits.
#[test]
fn nan_survives_binary_round_trip_bitwise() {
    let quiet = f64::from_bits(0x7ff8_0000_0000_0abc);
    let h = hash! { "d" => quiet, "f" => f32::NAN };
    let back = from_binary(&to_binary(&h).unwrap()).unwrap();
    assert_ne!(back, h);
    assert_eq!(back.get::<f64>("d").unwrap().to_bits(), quiet.to_bits());
    assert_eq!(back.get::<f32>("f").unwrap().to_bits(), f32::NAN.to_bits());
}

#[test]
fn xml_round_trip() {
    let h = sample();
    for options in [XmlOptions::default(), XmlOptions::compact()] {
        let text = to_xml(&h, &options).unwrap();
        let back = from_xml(&text).unwrap();
        assert_eq!(back, h, "xml:\n{text}");
    }
}

#[test]
fn xml_marks_leaf_types() {
    let text = to_xml(&hash! { "a.b" => 3i32 }, &XmlOptions::default()).unwrap();
    assert!(text.contains("KRB:type=\"INT32\""), "{text}");
}

#[test]
fn flatten_unflatten() {
    let h = sample();
    let flat = h.flatten();
    let non_empty_nodes = flat
        .iter()
        .filter(|n| n.value().as_hash().is_some_and(|sub| !sub.is_empty()))
        .count();
    assert_eq!(non_empty_nodes, 0);
    let deep = flat.iter().find(|n| n.key() == "node.inner.deep").unwrap();
    assert_eq!(deep.value(), &Value::Int64(7));
    assert_eq!(flat.unflatten(), h);
    assert!(h.paths().contains(&"node.inner.deep".to_string()));
}

#[test]
fn flatten_keeps_attributes_of_inner_nodes() {
    let mut small = Hash::new();
    small.set("a.b", 1);
    small.set_attribute("a", "unit", "m").unwrap();
    assert_eq!(small.flatten().unflatten(), small);

    let mut h = sample();
    h.set_attribute("node", "unit", "m").unwrap();
    h.set_attribute("node.inner", "alias", 3i32).unwrap();
    h.set_attribute("rows", "rowSchema", "xy").unwrap();
    let back = h.flatten().unflatten();
    assert_eq!(back, h);
    assert_eq!(back.get_attribute::<String>("node", "unit").unwrap(), "m");
    assert_eq!(back.get_attribute::<i32>("node.inner", "alias").unwrap(), 3);
    assert_eq!(back.keys(), h.keys());

    let paths = h.paths();
    assert!(paths.contains(&"node.inner.deep".to_string()));
    assert!(!paths.contains(&"node".to_string()));
    assert!(!paths.contains(&"rows".to_string()));
}

#[test]
fn get_as_conversions() {
    let h = hash! { "n" => "42", "x" => 3.0f64, "t" => "text" };
    assert_eq!(h.get_as::<i32>("n").unwrap(), 42);
    assert_eq!(h.get_as::<u8>("x").unwrap(), 3);
    assert!(matches!(h.get_as::<i32>("t"), Err(CoreError::TypeMismatch { .. })));
    assert!(matches!(h.get::<i32>("missing"), Err(CoreError::PathNotFound { .. })));
    assert!(matches!(h.get::<i32>("x"), Err(CoreError::TypeMismatch { .. })));
}
