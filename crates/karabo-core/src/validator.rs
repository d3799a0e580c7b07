//! Validation of configuration hashes against a [`Schema`].
//!
//! The validator walks the schema (not the input), so the validated hash
//! always follows schema declaration order. Unknown input keys are reported
//! after the walk of each level.
//!
//! Every problem is reported as one line; the final message joins them with
//! newlines. Checks performed per leaf:
//!
//! - type coercion with [`Value::cast`]
//! - `State` / `AlarmCondition` string validity
//! - option membership and numeric bounds for scalars
//! - element count bounds for vectors
//! - row count and per-row validation for tables

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::alarm::AlarmCondition;
use crate::hash::{Hash, Node};
use crate::schema::{AccessMode, Assignment, Bound, Element, ElementKind, NodeRole, Schema};
use crate::state::State;
use crate::timestamp::Timestamp;
use crate::types::ValueType;
use crate::value::Value;

/// Switches controlling the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    /// Insert defaults of absent optional/internal leaves.
    pub inject_defaults: bool,
    /// Accept keys the schema does not know.
    pub allow_additional_keys: bool,
    /// Accept absent mandatory leaves.
    pub allow_missing_keys: bool,
    /// Attach the given timestamp to leaves that have none.
    pub inject_timestamps: bool,
}

impl Default for ValidationRules {
    /// Rules for instantiation: defaults injected, nothing missing or extra.
    fn default() -> Self {
        Self {
            inject_defaults: true,
            allow_additional_keys: false,
            allow_missing_keys: false,
            inject_timestamps: false,
        }
    }
}

impl ValidationRules {
    /// Rules for a runtime delta: only the provided keys are checked.
    pub fn reconfiguration() -> Self {
        Self {
            inject_defaults: false,
            allow_additional_keys: false,
            allow_missing_keys: true,
            inject_timestamps: true,
        }
    }

    /// Rules for rows of a table element.
    pub fn table_row() -> Self {
        Self::default()
    }
}

/// Result of [`Validator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// True if no problem was found.
    pub ok: bool,
    /// Newline separated problem report; empty when `ok`.
    pub message: String,
    /// Coerced copy of the input, in schema order, with defaults.
    pub validated: Hash,
}

impl ValidationOutcome {
    /// Convert into a `Result`, dropping the validated hash on failure.
    pub fn into_result(self) -> Result<Hash, String> {
        if self.ok {
            Ok(self.validated)
        } else {
            Err(self.message)
        }
    }
}

/// Schema validator.
#[derive(Debug, Clone)]
pub struct Validator {
    rules: ValidationRules,
    timestamp: Option<Timestamp>,
    has_reconfigurable: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationRules::default())
    }
}

impl Validator {
    /// Validator with the given rules.
    pub fn new(rules: ValidationRules) -> Self {
        Self {
            rules,
            timestamp: None,
            has_reconfigurable: false,
        }
    }

    /// Active rules.
    pub fn rules(&self) -> ValidationRules {
        self.rules
    }

    /// True if the last validation touched a reconfigurable leaf.
    pub fn has_reconfigurable_parameter(&self) -> bool {
        self.has_reconfigurable
    }

    /// Validate `input` against `schema`.
    ///
    /// `timestamp` is attached to leaves when `inject_timestamps` is set.
    pub fn validate(
        &mut self,
        schema: &Schema,
        input: &Hash,
        timestamp: Option<Timestamp>,
    ) -> ValidationOutcome {
        self.has_reconfigurable = false;
        self.timestamp = if self.rules.inject_timestamps {
            timestamp
        } else {
            None
        };
        let mut report = String::new();
        let mut validated = Hash::new();
        self.validate_level(schema.elements(), input, &mut validated, &mut report, "");
        let message = report.trim_end().to_string();
        ValidationOutcome {
            ok: message.is_empty(),
            message,
            validated,
        }
    }

    fn validate_level(
        &mut self,
        elements: &[Element],
        user: &Hash,
        working: &mut Hash,
        report: &mut String,
        scope: &str,
    ) {
        let mut seen: HashSet<&str> = HashSet::new();
        for element in elements {
            let key = element.key();
            let path = join(scope, key);
            let provided = user.get_node(key);
            if provided.is_some() {
                seen.insert(key);
            }
            match element.kind() {
                ElementKind::Leaf(_) | ElementKind::Table(_) => {
                    let Some(node) = provided else {
                        match element.assignment() {
                            Assignment::Mandatory if !self.rules.allow_missing_keys => {
                                let _ = writeln!(report, "Missing mandatory parameter: \"{path}\"");
                                return;
                            }
                            Assignment::Mandatory => {}
                            Assignment::Optional | Assignment::Internal => {
                                if let (true, Some(default)) =
                                    (self.rules.inject_defaults, element.get_default_value())
                                {
                                    let node = working.set(key, default.clone());
                                    self.validate_leaf(element, node, report, &path);
                                }
                            }
                        }
                        continue;
                    };
                    let node = working.set_node(key, node.clone());
                    self.validate_leaf(element, node, report, &path);
                }
                ElementKind::Slot => {
                    if let Some(node) = provided {
                        let empty = node.value().as_hash().is_some_and(Hash::is_empty);
                        if !empty {
                            let _ = writeln!(report, "There is configuration provided for Slot '{path}'");
                        }
                    }
                }
                ElementKind::Node { children, role } => {
                    if *role == NodeRole::OutputSchema {
                        working.set(key, Hash::new());
                        if provided.is_some_and(|n| !only_empty_hash_leaves(n.value())) {
                            let _ = writeln!(
                                report,
                                "Configuring output channel schema is not allowed: '{path}'"
                            );
                        }
                        continue;
                    }
                    match provided {
                        None => {
                            if self.rules.inject_defaults {
                                let node = working.set(key, Hash::new());
                                if let Value::Hash(h) = node.value_mut() {
                                    self.validate_level(children, &Hash::new(), h, report, &path);
                                }
                            } else {
                                let mut scratch = Hash::new();
                                self.validate_level(children, &Hash::new(), &mut scratch, report, &path);
                            }
                        }
                        Some(node) => match node.value() {
                            Value::Hash(sub) => {
                                let target = working.set(key, Hash::new());
                                if let Value::Hash(h) = target.value_mut() {
                                    self.validate_level(children, sub, h, report, &path);
                                }
                            }
                            other => {
                                if element.get_class_id().is_some() {
                                    working.set_node(key, node.clone());
                                } else {
                                    let _ = writeln!(
                                        report,
                                        "Parameter \"{path}\" has incorrect node type, expecting HASH not {}",
                                        other.value_type().name()
                                    );
                                    return;
                                }
                            }
                        },
                    }
                }
            }
        }

        if !self.rules.allow_additional_keys {
            for node in user.iter() {
                if !seen.contains(node.key()) {
                    let _ = writeln!(
                        report,
                        "Encountered unexpected configuration parameter: \"{}\"",
                        join(scope, node.key())
                    );
                }
            }
        } else {
            for node in user.iter() {
                if !seen.contains(node.key()) {
                    working.set_node(node.key(), node.clone());
                }
            }
        }
    }

    fn validate_leaf(&mut self, element: &Element, node: &mut Node, report: &mut String, path: &str) {
        if let Some(ts) = self.timestamp {
            if !Timestamp::present_in(node.attributes()) {
                ts.to_attributes(node.attributes_mut());
            }
        }

        let Some(reference) = element.value_type() else {
            return;
        };
        let given = node.value().value_type();
        if given != reference {
            let empty_strings = matches!(node.value(), Value::VectorString(v) if v.is_empty());
            if reference == ValueType::VectorHash && empty_strings {
                node.set_value(Vec::<Hash>::new());
            } else {
                match node.value().cast(reference) {
                    Ok(v) => {
                        node.set_value(v);
                    }
                    Err(_) => {
                        let _ = writeln!(
                            report,
                            "Failed to cast the value of parameter \"{path}\" from {} to {}",
                            given.name(),
                            reference.name()
                        );
                        return;
                    }
                }
            }
        }

        match element.get_class_id() {
            Some("State") => {
                let text = node.value().as_str().unwrap_or_default();
                if State::from_name(text).is_none() {
                    let _ = writeln!(
                        report,
                        "Value '{text}' for parameter \"{path}\" is not a valid state string"
                    );
                }
            }
            Some("AlarmCondition") => {
                let text = node.value().as_str().unwrap_or_default();
                if text.parse::<AlarmCondition>().is_err() {
                    let _ = writeln!(
                        report,
                        "Value '{text}' for parameter \"{path}\" is not a valid alarm string"
                    );
                }
            }
            _ => {}
        }

        if element.access_mode() == AccessMode::Reconfigurable {
            self.has_reconfigurable = true;
        }

        if let Some(row_schema) = element.row_schema() {
            self.validate_table(element, row_schema, node, report);
        } else if reference.is_vector() || reference == ValueType::ByteArray {
            check_size(element, node.value(), report, path);
        } else if reference != ValueType::NDArray && reference != ValueType::Hash {
            check_scalar(element, node.value(), report, path);
        }
    }

    fn validate_table(&mut self, element: &Element, row_schema: &Schema, node: &mut Node, report: &mut String) {
        let name = element.key();
        let Some(rows) = node.value_mut().as_vector_hash_mut() else {
            return;
        };
        let plural = |n: u32| if n == 1 { "row" } else { "rows" };
        if let Some(min) = element.get_min_size() {
            if rows.len() < min as usize {
                let _ = writeln!(
                    report,
                    "Table at '{name}' must have at least {min} {}; it has {}.",
                    plural(min),
                    rows.len()
                );
                return;
            }
        }
        if let Some(max) = element.get_max_size() {
            if rows.len() > max as usize {
                let _ = writeln!(
                    report,
                    "Table at '{name}' must have no more than {max} {}; it has {}.",
                    plural(max),
                    rows.len()
                );
                return;
            }
        }
        let mut row_validator = Validator::new(ValidationRules::table_row());
        for row in rows.iter_mut() {
            let outcome = row_validator.validate(row_schema, row, None);
            if !outcome.ok {
                let _ = writeln!(report, "{}", outcome.message);
                break;
            }
            *row = outcome.validated;
        }
    }
}

fn join(scope: &str, key: &str) -> String {
    if scope.is_empty() {
        key.to_string()
    } else {
        format!("{scope}.{key}")
    }
}

fn only_empty_hash_leaves(value: &Value) -> bool {
    match value {
        Value::Hash(h) => h.iter().all(|n| only_empty_hash_leaves(n.value())),
        _ => false,
    }
}

fn check_scalar(element: &Element, value: &Value, report: &mut String, path: &str) {
    if let Some(options) = element.get_options() {
        let matches = options
            .iter()
            .any(|o| o == value || o.cast(value.value_type()).is_ok_and(|o| &o == value));
        if !matches {
            let listed: Vec<String> = options.iter().map(ToString::to_string).collect();
            let _ = writeln!(
                report,
                "Value '{value}' for parameter \"{path}\" is not one of the valid options: {}",
                listed.join(",")
            );
        }
    }

    let Some(x) = value.as_f64() else {
        return;
    };
    match element.min() {
        Some(Bound::Exclusive(b)) => {
            if let Some(b) = b.as_f64().filter(|b| x <= *b) {
                let _ = writeln!(report, "Value {value} for parameter \"{path}\" is out of lower bound {b}");
            }
        }
        Some(Bound::Inclusive(b)) => {
            if let Some(b) = b.as_f64().filter(|b| x < *b) {
                let _ = writeln!(report, "Value {value} for parameter \"{path}\" is out of lower bound {b}");
            }
        }
        None => {}
    }
    match element.max() {
        Some(Bound::Exclusive(b)) => {
            if let Some(b) = b.as_f64().filter(|b| x >= *b) {
                let _ = writeln!(report, "Value {value} for parameter \"{path}\" is out of upper bound {b}");
            }
        }
        Some(Bound::Inclusive(b)) => {
            if let Some(b) = b.as_f64().filter(|b| x > *b) {
                let _ = writeln!(report, "Value {value} for parameter \"{path}\" is out of upper bound {b}");
            }
        }
        None => {}
    }
}

fn check_size(element: &Element, value: &Value, report: &mut String, path: &str) {
    let n = value.element_count().unwrap_or(0);
    if let Some(min) = element.get_min_size() {
        if n < min as usize {
            let _ = writeln!(
                report,
                "Number of elements ({n}) for (vector-)parameter \"{path}\" is smaller than lower bound ({min})"
            );
        }
    }
    if let Some(max) = element.get_max_size() {
        if n > max as usize {
            let _ = writeln!(
                report,
                "Number of elements ({n}) for (vector-)parameter \"{path}\" is greater than upper bound ({max})"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::timestamp::{Epochstamp, Trainstamp};

    fn schema() -> Schema {
        let mut s = Schema::new("PropertyTest");
        s.add(Element::state("state").default_value(State::INIT)).unwrap();
        s.add(Element::int32("int32Property").default_value(32_000_000).min_inc(-10).max_exc(1_000_000_000))
            .unwrap();
        s.add(Element::string("mode").options(["fast", "slow"]).default_value("fast"))
            .unwrap();
        s.add(Element::string("label").assignment_mandatory()).unwrap();
        s.add(Element::vector_double("shape").min_size(1).max_size(3).default_value(vec![1.0]))
            .unwrap();
        s.add(Element::node("node")).unwrap();
        s.add(Element::double("node.gain").default_value(1.5)).unwrap();
        s.add(Element::slot("reset")).unwrap();
        let mut row = Schema::new("row");
        row.add(Element::string("name").assignment_mandatory()).unwrap();
        row.add(Element::int32("count").default_value(0)).unwrap();
        s.add(Element::table("table", row).max_size(2).default_value(Vec::<Hash>::new()))
            .unwrap();
        s
    }

    fn validate(input: &Hash) -> ValidationOutcome {
        Validator::default().validate(&schema(), input, None)
    }

    #[test]
    fn defaults_in_schema_order() {
        let out = validate(&hash! { "label" => "x", "int32Property" => 10 });
        assert!(out.ok, "{}", out.message);
        let keys = out.validated.keys();
        assert_eq!(keys, vec!["state", "int32Property", "mode", "label", "shape", "node", "table"]);
        assert_eq!(out.validated.get::<i32>("int32Property").unwrap(), 10);
        assert_eq!(out.validated.get::<f64>("node.gain").unwrap(), 1.5);
        assert_eq!(out.validated.get::<String>("state").unwrap(), "INIT");
    }

    #[test]
    fn idempotent() {
        let first = validate(&hash! { "label" => "x" });
        let second = validate(&first.validated);
        assert!(second.ok);
        assert_eq!(first.validated, second.validated);
    }

    #[test]
    fn unexpected_and_missing() {
        let out = validate(&hash! { "label" => "x", "int32Property_y" => 42 });
        assert!(!out.ok);
        assert_eq!(out.message, "Encountered unexpected configuration parameter: \"int32Property_y\"");

        let out = validate(&Hash::new());
        assert_eq!(out.message, "Missing mandatory parameter: \"label\"");

        let out = validate(&hash! { "label" => "x", "node.bogus" => 1 });
        assert_eq!(out.message, "Encountered unexpected configuration parameter: \"node.bogus\"");
    }

    #[test]
    fn casts() {
        let out = validate(&hash! { "label" => "x", "int32Property" => "12" });
        assert!(out.ok);
        assert_eq!(out.validated.get::<i32>("int32Property").unwrap(), 12);

        let out = validate(&hash! { "label" => "x", "int32Property" => "abc" });
        assert_eq!(
            out.message,
            "Failed to cast the value of parameter \"int32Property\" from STRING to INT32"
        );
    }

    #[test]
    fn bounds_options_sizes() {
        let out = validate(&hash! { "label" => "x", "int32Property" => -11 });
        assert_eq!(out.message, "Value -11 for parameter \"int32Property\" is out of lower bound -10");

        let out = validate(&hash! { "label" => "x", "mode" => "medium" });
        assert_eq!(
            out.message,
            "Value 'medium' for parameter \"mode\" is not one of the valid options: fast,slow"
        );

        let out = validate(&hash! { "label" => "x", "shape" => vec![1.0, 2.0, 3.0, 4.0] });
        assert_eq!(
            out.message,
            "Number of elements (4) for (vector-)parameter \"shape\" is greater than upper bound (3)"
        );
    }

    #[test]
    fn state_strings() {
        let out = validate(&hash! { "label" => "x", "state" => "SLEEPING" });
        assert_eq!(out.message, "Value 'SLEEPING' for parameter \"state\" is not a valid state string");
    }

    #[test]
    fn node_type_and_slot() {
        let out = validate(&hash! { "label" => "x", "node" => 5 });
        assert_eq!(
            out.message,
            "Parameter \"node\" has incorrect node type, expecting HASH not INT32"
        );
        let out = validate(&hash! { "label" => "x", "reset" => 1 });
        assert_eq!(out.message, "There is configuration provided for Slot 'reset'");
        let out = validate(&hash! { "label" => "x", "reset" => Hash::new() });
        assert!(out.ok);
        assert!(!out.validated.has("reset"));
    }

    #[test]
    fn table_rows() {
        let rows = vec![hash! { "name" => "a" }, hash! { "name" => "b", "count" => "3" }];
        let out = validate(&hash! { "label" => "x", "table" => rows });
        assert!(out.ok, "{}", out.message);
        let table: Vec<Hash> = out.validated.get("table").unwrap();
        assert_eq!(table[0].get::<i32>("count").unwrap(), 0);
        assert_eq!(table[1].get::<i32>("count").unwrap(), 3);

        let rows = vec![Hash::new(), Hash::new(), Hash::new()];
        let out = validate(&hash! { "label" => "x", "table" => rows });
        assert_eq!(out.message, "Table at 'table' must have no more than 2 rows; it has 3.");
    }

    #[test]
    fn reconfiguration_rules() {
        let mut v = Validator::new(ValidationRules::reconfiguration());
        let ts = Timestamp::new(Epochstamp::new(10, 0), Trainstamp(5));
        let out = v.validate(&schema(), &hash! { "int32Property" => 5 }, Some(ts));
        assert!(out.ok);
        assert_eq!(out.validated.keys(), vec!["int32Property"]);
        assert!(v.has_reconfigurable_parameter());
        let attrs = out.validated.attributes("int32Property").unwrap();
        assert_eq!(Timestamp::from_attributes(attrs).unwrap(), ts);
    }
}
