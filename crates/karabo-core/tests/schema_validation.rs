//! Validator laws and schema transport.

use karabo_core::binary::{from_binary, to_binary};
use karabo_core::schema::NodeRole;
use karabo_core::{hash, AccessMode, Element, Hash, Schema, State, ValidationRules, Validator};

fn camera_schema() -> Schema {
    let mut s = Schema::new("Camera");
    s.add(Element::state("state").default_value(State::UNKNOWN)).unwrap();
    s.add(Element::string("address").assignment_mandatory().init_only()).unwrap();
    s.add(
        Element::double("exposure")
            .reconfigurable()
            .default_value(0.1)
            .min_exc(0.0)
            .max_inc(10.0)
            .allowed_states(&[State::ON]),
    )
    .unwrap();
    s.add(Element::uint32("roi.x").default_value(0u32)).unwrap_err();
    s.add(Element::node("roi")).unwrap();
    s.add(Element::uint32("roi.x").default_value(0u32)).unwrap();
    s.add(Element::uint32("roi.width").default_value(1024u32).min_inc(1u32)).unwrap();
    s.add(Element::slot("acquire").allowed_states(&[State::ON])).unwrap();
    s.add(Element::channel_node("output", NodeRole::OutputChannel)).unwrap();
    s.add(Element::channel_node("output.schema", NodeRole::OutputSchema)).unwrap();
    s.add(Element::ndarray("output.schema.image").read_only()).unwrap();
    s.add(Element::string("output.hostname").default_value("default")).unwrap();
    s
}

#[test]
fn validated_output_validates_again() {
    let schema = camera_schema();
    let inputs = [
        hash! { "address" => "10.0.0.1" },
        hash! { "roi.width" => "512", "address" => "cam", "exposure" => 2 },
        hash! { "address" => "cam", "output.hostname" => "h" },
    ];
    for input in inputs {
        let first = Validator::default().validate(&schema, &input, None);
        assert!(first.ok, "{}", first.message);
        assert!(first.validated.has("address"), "mandatory leaf present");
        let second = Validator::default().validate(&schema, &first.validated, None);
        assert!(second.ok, "{}", second.message);
        assert_eq!(second.validated, first.validated);
    }
}

#[test]
fn output_schema_is_not_configurable() {
    let schema = camera_schema();
    let out = Validator::default().validate(&schema, &hash! { "address" => "x" }, None);
    assert_eq!(out.validated.get::<Hash>("output.schema").unwrap(), Hash::new());

    let bad = hash! { "address" => "x", "output.schema.image" => 1 };
    let out = Validator::default().validate(&schema, &bad, None);
    assert_eq!(out.message, "Configuring output channel schema is not allowed: 'output.schema'");
}

#[test]
fn several_problems_are_reported_line_by_line() {
    let schema = camera_schema();
    let input = hash! { "address" => "x", "exposure" => 0.0, "roi.width" => 0u32, "zoom" => 2 };
    let out = Validator::default().validate(&schema, &input, None);
    assert!(!out.ok);
    let lines: Vec<&str> = out.message.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Value 0 for parameter \"exposure\" is out of lower bound 0",
            "Value 0 for parameter \"roi.width\" is out of lower bound 1",
            "Encountered unexpected configuration parameter: \"zoom\"",
        ]
    );
}

#[test]
fn reconfiguration_only_touches_given_keys() {
    let schema = camera_schema();
    let mut v = Validator::new(ValidationRules::reconfiguration());
    let out = v.validate(&schema, &hash! { "roi.width" => 64u32 }, None);
    assert!(out.ok, "{}", out.message);
    assert_eq!(out.validated.paths(), vec!["roi.width".to_string()]);
}

#[test]
fn schema_travels_as_hash() {
    let schema = camera_schema();
    let bytes = to_binary(&schema.to_hash()).unwrap();
    let rebuilt = Schema::from_hash("Camera", &from_binary(&bytes).unwrap()).unwrap();
    assert_eq!(rebuilt, schema);
    assert_eq!(rebuilt.access_mode("address"), Some(AccessMode::InitOnly));
    assert_eq!(rebuilt.channels(NodeRole::OutputChannel), vec!["output".to_string()]);
    assert!(rebuilt.element("acquire").unwrap().is_slot());
}
