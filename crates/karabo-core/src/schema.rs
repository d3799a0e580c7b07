//! Schema: typed descriptors for the paths of a configuration hash.
//!
//! A [`Schema`] is an ordered tree of [`Element`]s mirroring the layout of the
//! hashes it describes. Leaves carry a value type plus metadata (access mode,
//! assignment, default, bounds, options, unit, allowed states, alarm
//! thresholds). Nodes carry child elements; slots carry only metadata; tables
//! are `VECTOR_HASH` leaves with a row schema.
//!
//! # Construction
//!
//! Elements are built by value and added with a dotted path; the parent node
//! must already exist:
//!
//! ```
//! use karabo_core::schema::{Element, Schema};
//!
//! let mut schema = Schema::new("Motor");
//! schema.add(Element::node("limits").displayed_name("Limits")).unwrap();
//! schema
//!     .add(Element::double("limits.high").reconfigurable().default_value(10.0).max_inc(100.0))
//!     .unwrap();
//! assert!(schema.has("limits.high"));
//! ```
//!
//! # Wire form
//!
//! [`Schema::to_hash`] renders the tree as a hash whose node attributes use the
//! conventional names (`nodeType`, `valueType`, `accessMode`, `assignment`,
//! `defaultValue`, `minInc`, ...). [`Schema::from_hash`] is the inverse and is
//! how proxies rebuild a remote schema.

use std::fmt;

use crate::alarm::AlarmBounds;
use crate::error::{CoreError, CoreResult};
use crate::hash::{Hash, Node, PATH_SEPARATOR};
use crate::state::State;
use crate::types::ValueType;
use crate::value::Value;

// =============================================================================
// Enumerations
// =============================================================================

/// Who may write a leaf, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Set once at instantiation.
    InitOnly,
    /// Published by the device, never written from outside.
    ReadOnly,
    /// Writable at runtime through `slotReconfigure`.
    Reconfigurable,
}

impl AccessMode {
    /// Wire code (1, 2, 4).
    pub fn code(self) -> i32 {
        match self {
            AccessMode::InitOnly => 1,
            AccessMode::ReadOnly => 2,
            AccessMode::Reconfigurable => 4,
        }
    }

    /// Inverse of [`AccessMode::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(AccessMode::InitOnly),
            2 => Some(AccessMode::ReadOnly),
            4 => Some(AccessMode::Reconfigurable),
            _ => None,
        }
    }
}

/// Whether a leaf must be provided in a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assignment {
    /// May be omitted; the default is injected if there is one.
    Optional,
    /// Must be provided.
    Mandatory,
    /// Set by the framework (injected defaults), not by users.
    Internal,
}

impl Assignment {
    /// Wire code (0, 1, 2).
    pub fn code(self) -> i32 {
        match self {
            Assignment::Optional => 0,
            Assignment::Mandatory => 1,
            Assignment::Internal => 2,
        }
    }

    /// Inverse of [`Assignment::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Assignment::Optional),
            1 => Some(Assignment::Mandatory),
            2 => Some(Assignment::Internal),
            _ => None,
        }
    }
}

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => ($text:expr, $symbol:expr)),+ $(,)? }) => {
        $(#[$meta])*
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Lower case name used on the wire.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Short symbol for display.
            pub fn symbol(self) -> &'static str {
                match self {
                    $($name::$variant => $symbol),+
                }
            }

            /// Lookup by wire name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

named_enum! {
    /// Physical unit of a numeric leaf.
    Unit {
        Number => ("number", ""),
        Count => ("count", "#"),
        Meter => ("meter", "m"),
        Gram => ("gram", "g"),
        Second => ("second", "s"),
        Ampere => ("ampere", "A"),
        Kelvin => ("kelvin", "K"),
        Mole => ("mole", "mol"),
        Candela => ("candela", "cd"),
        Hertz => ("hertz", "Hz"),
        Radian => ("radian", "rad"),
        Degree => ("degree", "deg"),
        Newton => ("newton", "N"),
        Pascal => ("pascal", "Pa"),
        Joule => ("joule", "J"),
        ElectronVolt => ("electronvolt", "eV"),
        Watt => ("watt", "W"),
        Coulomb => ("coulomb", "C"),
        Volt => ("volt", "V"),
        Farad => ("farad", "F"),
        Ohm => ("ohm", "Ohm"),
        Tesla => ("tesla", "T"),
        DegreeCelsius => ("degree_celsius", "degC"),
        Bar => ("bar", "bar"),
        Minute => ("minute", "min"),
        Hour => ("hour", "h"),
        Pixel => ("pixel", "px"),
        Byte => ("byte", "B"),
        Bit => ("bit", "bit"),
        MeterPerSecond => ("meter_per_second", "m/s"),
        Percent => ("percent", "%"),
    }
}

named_enum! {
    /// SI prefix applied to a [`Unit`].
    MetricPrefix {
        Yotta => ("yotta", "Y"),
        Zetta => ("zetta", "Z"),
        Exa => ("exa", "E"),
        Peta => ("peta", "P"),
        Tera => ("tera", "T"),
        Giga => ("giga", "G"),
        Mega => ("mega", "M"),
        Kilo => ("kilo", "k"),
        Hecto => ("hecto", "h"),
        Deca => ("deca", "da"),
        None => ("none", ""),
        Deci => ("deci", "d"),
        Centi => ("centi", "c"),
        Milli => ("milli", "m"),
        Micro => ("micro", "u"),
        Nano => ("nano", "n"),
        Pico => ("pico", "p"),
        Femto => ("femto", "f"),
        Atto => ("atto", "a"),
        Zepto => ("zepto", "z"),
        Yocto => ("yocto", "y"),
    }
}

/// Special meaning of a node element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeRole {
    /// Plain grouping node.
    #[default]
    Plain,
    /// Pipeline output channel configuration.
    OutputChannel,
    /// Description of the data an output channel writes; not configurable.
    OutputSchema,
    /// Pipeline input channel configuration.
    InputChannel,
}

impl NodeRole {
    fn display_type(self) -> Option<&'static str> {
        match self {
            NodeRole::Plain => None,
            NodeRole::OutputChannel => Some("OutputChannel"),
            NodeRole::OutputSchema => Some("OutputSchema"),
            NodeRole::InputChannel => Some("InputChannel"),
        }
    }

    fn from_display_type(display_type: &str) -> Self {
        match display_type {
            "OutputChannel" => NodeRole::OutputChannel,
            "OutputSchema" => NodeRole::OutputSchema,
            "InputChannel" => NodeRole::InputChannel,
            _ => NodeRole::Plain,
        }
    }
}

/// What an element describes.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    /// A typed value.
    Leaf(ValueType),
    /// A nested group of elements.
    Node {
        /// Child elements in declaration order.
        children: Vec<Element>,
        /// Channel marker.
        role: NodeRole,
    },
    /// A remotely callable slot.
    Slot,
    /// A `VECTOR_HASH` whose rows follow `row_schema`.
    Table(Box<Schema>),
}

/// Inclusive or exclusive numeric bound.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    /// Value may equal the bound.
    Inclusive(Value),
    /// Value must differ from the bound.
    Exclusive(Value),
}

impl Bound {
    /// The bound value.
    pub fn value(&self) -> &Value {
        match self {
            Bound::Inclusive(v) | Bound::Exclusive(v) => v,
        }
    }
}

// =============================================================================
// Element
// =============================================================================

/// Descriptor of one schema path.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    key: String,
    kind: ElementKind,
    displayed_name: Option<String>,
    description: Option<String>,
    access_mode: AccessMode,
    assignment: Assignment,
    default_value: Option<Value>,
    min: Option<Bound>,
    max: Option<Bound>,
    options: Option<Vec<Value>>,
    unit: Option<Unit>,
    metric_prefix: Option<MetricPrefix>,
    allowed_states: Vec<State>,
    tags: Vec<String>,
    alias: Option<Value>,
    min_size: Option<u32>,
    max_size: Option<u32>,
    alarm: AlarmBounds,
    class_id: Option<String>,
    archive: bool,
}

macro_rules! leaf_constructors {
    ($($fn_name:ident => $vt:ident),+ $(,)?) => {
        $(
            #[doc = concat!("`", stringify!($vt), "` leaf.")]
            pub fn $fn_name(key: impl Into<String>) -> Self {
                Self::leaf(key, ValueType::$vt)
            }
        )+
    };
}

impl Element {
    fn with_kind(key: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            key: key.into(),
            kind,
            displayed_name: None,
            description: None,
            access_mode: AccessMode::Reconfigurable,
            assignment: Assignment::Optional,
            default_value: None,
            min: None,
            max: None,
            options: None,
            unit: None,
            metric_prefix: None,
            allowed_states: Vec::new(),
            tags: Vec::new(),
            alias: None,
            min_size: None,
            max_size: None,
            alarm: AlarmBounds::default(),
            class_id: None,
            archive: true,
        }
    }

    /// Leaf of arbitrary value type.
    pub fn leaf(key: impl Into<String>, value_type: ValueType) -> Self {
        Self::with_kind(key, ElementKind::Leaf(value_type))
    }

    leaf_constructors! {
        bool => Bool,
        int8 => Int8,
        uint8 => UInt8,
        int16 => Int16,
        uint16 => UInt16,
        int32 => Int32,
        uint32 => UInt32,
        int64 => Int64,
        uint64 => UInt64,
        float => Float,
        double => Double,
        string => String,
        byte_array => ByteArray,
        vector_bool => VectorBool,
        vector_int32 => VectorInt32,
        vector_uint32 => VectorUInt32,
        vector_int64 => VectorInt64,
        vector_double => VectorDouble,
        vector_float => VectorFloat,
        vector_string => VectorString,
        ndarray => NDArray,
    }

    /// Grouping node.
    pub fn node(key: impl Into<String>) -> Self {
        Self::with_kind(
            key,
            ElementKind::Node {
                children: Vec::new(),
                role: NodeRole::Plain,
            },
        )
    }

    /// Node with a channel role.
    pub fn channel_node(key: impl Into<String>, role: NodeRole) -> Self {
        let mut e = Self::with_kind(
            key,
            ElementKind::Node {
                children: Vec::new(),
                role,
            },
        );
        e.class_id = match role {
            NodeRole::OutputChannel => Some("OutputChannel".to_string()),
            NodeRole::InputChannel => Some("InputChannel".to_string()),
            _ => None,
        };
        e
    }

    /// Slot.
    pub fn slot(key: impl Into<String>) -> Self {
        let mut e = Self::with_kind(key, ElementKind::Slot);
        e.class_id = Some("Slot".to_string());
        e
    }

    /// Table of rows following `row_schema`.
    pub fn table(key: impl Into<String>, mut row_schema: Schema) -> Self {
        let key = key.into();
        let last = key.rsplit(PATH_SEPARATOR).next().unwrap_or_default().to_string();
        row_schema.set_root_name(last);
        Self::with_kind(key, ElementKind::Table(Box::new(row_schema)))
    }

    /// String leaf holding a [`State`] name.
    pub fn state(key: impl Into<String>) -> Self {
        let mut e = Self::string(key).read_only();
        e.class_id = Some("State".to_string());
        e
    }

    /// String leaf holding an alarm condition name.
    pub fn alarm_condition(key: impl Into<String>) -> Self {
        let mut e = Self::string(key).read_only();
        e.class_id = Some("AlarmCondition".to_string());
        e
    }

    // -- builder ------------------------------------------------------------

    /// Human readable label.
    pub fn displayed_name(mut self, name: impl Into<String>) -> Self {
        self.displayed_name = Some(name.into());
        self
    }

    /// Free text description.
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Writable at runtime.
    pub fn reconfigurable(mut self) -> Self {
        self.access_mode = AccessMode::Reconfigurable;
        self
    }

    /// Published only.
    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }

    /// Set at instantiation only.
    pub fn init_only(mut self) -> Self {
        self.access_mode = AccessMode::InitOnly;
        self
    }

    /// Optional assignment.
    pub fn assignment_optional(mut self) -> Self {
        self.assignment = Assignment::Optional;
        self
    }

    /// Mandatory assignment.
    pub fn assignment_mandatory(mut self) -> Self {
        self.assignment = Assignment::Mandatory;
        self
    }

    /// Internal assignment.
    pub fn assignment_internal(mut self) -> Self {
        self.assignment = Assignment::Internal;
        self
    }

    /// Default value, injected by the validator when the leaf is absent.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Clear a default inherited from a base class.
    pub fn no_default_value(mut self) -> Self {
        self.default_value = None;
        self
    }

    /// Inclusive lower bound.
    pub fn min_inc(mut self, v: impl Into<Value>) -> Self {
        self.min = Some(Bound::Inclusive(v.into()));
        self
    }

    /// Exclusive lower bound.
    pub fn min_exc(mut self, v: impl Into<Value>) -> Self {
        self.min = Some(Bound::Exclusive(v.into()));
        self
    }

    /// Inclusive upper bound.
    pub fn max_inc(mut self, v: impl Into<Value>) -> Self {
        self.max = Some(Bound::Inclusive(v.into()));
        self
    }

    /// Exclusive upper bound.
    pub fn max_exc(mut self, v: impl Into<Value>) -> Self {
        self.max = Some(Bound::Exclusive(v.into()));
        self
    }

    /// Allowed values.
    pub fn options<V: Into<Value>>(mut self, options: impl IntoIterator<Item = V>) -> Self {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    /// Allowed states for a [`Element::state`] leaf.
    pub fn state_options(self, states: &[State]) -> Self {
        self.options(states.iter().copied())
    }

    /// Unit of the value.
    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Metric prefix of the unit.
    pub fn metric_prefix(mut self, prefix: MetricPrefix) -> Self {
        self.metric_prefix = Some(prefix);
        self
    }

    /// States in which the slot may be called or the leaf reconfigured.
    pub fn allowed_states(mut self, states: &[State]) -> Self {
        self.allowed_states = states.to_vec();
        self
    }

    /// Free form tags.
    pub fn tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Hardware alias.
    pub fn alias(mut self, alias: impl Into<Value>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Minimum number of elements of a vector or table.
    pub fn min_size(mut self, n: u32) -> Self {
        self.min_size = Some(n);
        self
    }

    /// Maximum number of elements of a vector or table.
    pub fn max_size(mut self, n: u32) -> Self {
        self.max_size = Some(n);
        self
    }

    /// Lower warning threshold.
    pub fn warn_low(mut self, v: f64) -> Self {
        self.alarm.warn_low = Some(v);
        self
    }

    /// Upper warning threshold.
    pub fn warn_high(mut self, v: f64) -> Self {
        self.alarm.warn_high = Some(v);
        self
    }

    /// Lower alarm threshold.
    pub fn alarm_low(mut self, v: f64) -> Self {
        self.alarm.alarm_low = Some(v);
        self
    }

    /// Upper alarm threshold.
    pub fn alarm_high(mut self, v: f64) -> Self {
        self.alarm.alarm_high = Some(v);
        self
    }

    /// Class marker (`State`, `AlarmCondition`, ...).
    pub fn class_id(mut self, class_id: impl Into<String>) -> Self {
        self.class_id = Some(class_id.into());
        self
    }

    /// Exclude the leaf from archiving.
    pub fn no_archive(mut self) -> Self {
        self.archive = false;
        self
    }

    /// Add a child to a node element; no-op on other kinds.
    pub fn child(mut self, element: Element) -> Self {
        if let ElementKind::Node { children, .. } = &mut self.kind {
            children.push(element);
        }
        self
    }

    // -- accessors ------------------------------------------------------------

    /// Key relative to the parent.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Kind and payload.
    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    /// Value type of leaves and tables.
    pub fn value_type(&self) -> Option<ValueType> {
        match &self.kind {
            ElementKind::Leaf(vt) => Some(*vt),
            ElementKind::Table(_) => Some(ValueType::VectorHash),
            _ => None,
        }
    }

    /// True for leaves and tables.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ElementKind::Leaf(_) | ElementKind::Table(_))
    }

    /// True for nodes (including channel nodes).
    pub fn is_node(&self) -> bool {
        matches!(self.kind, ElementKind::Node { .. })
    }

    /// True for slots.
    pub fn is_slot(&self) -> bool {
        matches!(self.kind, ElementKind::Slot)
    }

    /// Channel role of a node, `None` otherwise.
    pub fn node_role(&self) -> Option<NodeRole> {
        match &self.kind {
            ElementKind::Node { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// Children of a node.
    pub fn children(&self) -> &[Element] {
        match &self.kind {
            ElementKind::Node { children, .. } => children,
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Element>> {
        match &mut self.kind {
            ElementKind::Node { children, .. } => Some(children),
            _ => None,
        }
    }

    /// Row schema of a table.
    pub fn row_schema(&self) -> Option<&Schema> {
        match &self.kind {
            ElementKind::Table(s) => Some(s),
            _ => None,
        }
    }

    /// Label.
    pub fn get_displayed_name(&self) -> Option<&str> {
        self.displayed_name.as_deref()
    }

    /// Description.
    pub fn get_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Access mode.
    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    /// Assignment.
    pub fn assignment(&self) -> Assignment {
        self.assignment
    }

    /// Default value.
    pub fn get_default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// Lower bound.
    pub fn min(&self) -> Option<&Bound> {
        self.min.as_ref()
    }

    /// Upper bound.
    pub fn max(&self) -> Option<&Bound> {
        self.max.as_ref()
    }

    /// Allowed values.
    pub fn get_options(&self) -> Option<&[Value]> {
        self.options.as_deref()
    }

    /// Unit.
    pub fn get_unit(&self) -> Option<Unit> {
        self.unit
    }

    /// Metric prefix.
    pub fn get_metric_prefix(&self) -> Option<MetricPrefix> {
        self.metric_prefix
    }

    /// Allowed states; empty means any state.
    pub fn get_allowed_states(&self) -> &[State] {
        &self.allowed_states
    }

    /// True if `state` is allowed (or no restriction is declared).
    pub fn is_allowed_in(&self, state: State) -> bool {
        self.allowed_states.is_empty() || self.allowed_states.contains(&state)
    }

    /// Tags.
    pub fn get_tags(&self) -> &[String] {
        &self.tags
    }

    /// Alias.
    pub fn get_alias(&self) -> Option<&Value> {
        self.alias.as_ref()
    }

    /// Minimum size.
    pub fn get_min_size(&self) -> Option<u32> {
        self.min_size
    }

    /// Maximum size.
    pub fn get_max_size(&self) -> Option<u32> {
        self.max_size
    }

    /// Warn and alarm thresholds.
    pub fn alarm_bounds(&self) -> &AlarmBounds {
        &self.alarm
    }

    /// Class marker.
    pub fn get_class_id(&self) -> Option<&str> {
        self.class_id.as_deref()
    }

    /// Whether the leaf is archived.
    pub fn is_archived(&self) -> bool {
        self.archive
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Ordered descriptor tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    root_name: String,
    elements: Vec<Element>,
}

impl Schema {
    /// Empty schema for class `root_name`.
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            root_name: root_name.into(),
            elements: Vec::new(),
        }
    }

    /// Class the schema describes.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Rename the described class.
    pub fn set_root_name(&mut self, name: impl Into<String>) {
        self.root_name = name.into();
    }

    /// Top level elements.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// True if no element was added.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Insert `element` at its dotted key. Re-adding a key replaces the
    /// element in place.
    pub fn add(&mut self, mut element: Element) -> CoreResult<&mut Self> {
        let path = element.key.clone();
        let (parent, key) = match path.rsplit_once(PATH_SEPARATOR) {
            Some((parent, key)) => (Some(parent), key),
            None => (None, path.as_str()),
        };
        if key.is_empty() {
            return Err(CoreError::invalid_path(&path, "empty element key"));
        }
        element.key = key.to_string();
        let siblings = match parent {
            None => &mut self.elements,
            Some(parent) => {
                let node = self
                    .element_mut(parent)
                    .ok_or_else(|| CoreError::Schema(format!("parent node '{parent}' of '{path}' does not exist")))?;
                node.children_mut()
                    .ok_or_else(|| CoreError::Schema(format!("'{parent}' is not a node, cannot add '{path}'")))?
            }
        };
        match siblings.iter_mut().find(|e| e.key == element.key) {
            Some(existing) => *existing = element,
            None => siblings.push(element),
        }
        Ok(self)
    }

    /// Append all elements of `other` not yet present here.
    pub fn merge(&mut self, other: &Schema) {
        for e in &other.elements {
            if !self.elements.iter().any(|x| x.key == e.key) {
                self.elements.push(e.clone());
            }
        }
    }

    /// Modify an existing element, typically one inherited from a base class.
    pub fn overwrite(&mut self, path: &str, f: impl FnOnce(Element) -> Element) -> CoreResult<()> {
        let slot = self
            .element_mut(path)
            .ok_or_else(|| CoreError::path_not_found(path))?;
        let key = slot.key.clone();
        let mut updated = f(slot.clone());
        updated.key = key;
        *slot = updated;
        Ok(())
    }

    /// Remove an element; returns true if it existed.
    pub fn remove(&mut self, path: &str) -> bool {
        let (siblings, key) = match path.rsplit_once(PATH_SEPARATOR) {
            Some((parent, key)) => match self.element_mut(parent).and_then(Element::children_mut) {
                Some(children) => (children, key),
                None => return false,
            },
            None => (&mut self.elements, path),
        };
        let before = siblings.len();
        siblings.retain(|e| e.key != key);
        before != siblings.len()
    }

    /// True if `path` names an element.
    pub fn has(&self, path: &str) -> bool {
        self.element(path).is_some()
    }

    /// Element at a dotted path.
    pub fn element(&self, path: &str) -> Option<&Element> {
        let mut level: &[Element] = &self.elements;
        let mut found = None;
        for key in path.split(PATH_SEPARATOR) {
            let e = level.iter().find(|e| e.key == key)?;
            level = e.children();
            found = Some(e);
        }
        found
    }

    /// Mutable element at a dotted path.
    pub fn element_mut(&mut self, path: &str) -> Option<&mut Element> {
        let mut keys = path.split(PATH_SEPARATOR);
        let first = keys.next()?;
        let mut current = self.elements.iter_mut().find(|e| e.key == first)?;
        for key in keys {
            current = current.children_mut()?.iter_mut().find(|e| e.key == key)?;
        }
        Some(current)
    }

    /// Value type of a leaf.
    pub fn value_type(&self, path: &str) -> Option<ValueType> {
        self.element(path).and_then(Element::value_type)
    }

    /// Access mode of an element.
    pub fn access_mode(&self, path: &str) -> Option<AccessMode> {
        self.element(path).map(Element::access_mode)
    }

    /// Default value of a leaf.
    pub fn default_value(&self, path: &str) -> Option<&Value> {
        self.element(path).and_then(Element::get_default_value)
    }

    /// Dotted paths of all leaves in declaration order.
    pub fn leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.elements, "", &mut out, &|e: &Element| e.is_leaf());
        out
    }

    /// Dotted paths of all slots.
    pub fn slots(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.elements, "", &mut out, &|e: &Element| e.is_slot());
        out
    }

    /// Paths of nodes with the given channel role.
    pub fn channels(&self, role: NodeRole) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.elements, "", &mut out, &|e: &Element| e.node_role() == Some(role));
        out
    }

    /// Leaf paths with alarm thresholds, paired with the thresholds.
    pub fn alarm_leaves(&self) -> Vec<(String, AlarmBounds)> {
        self.leaves()
            .into_iter()
            .filter_map(|p| {
                let bounds = *self.element(&p)?.alarm_bounds();
                (!bounds.is_empty()).then_some((p, bounds))
            })
            .collect()
    }

    /// Copy without reconfigurable leaves and slots that are not allowed in
    /// `state`.
    pub fn for_state(&self, state: State) -> Schema {
        fn filter(elements: &[Element], state: State) -> Vec<Element> {
            elements
                .iter()
                .filter(|e| {
                    let restricted = e.is_slot() || e.access_mode == AccessMode::Reconfigurable;
                    !restricted || e.is_allowed_in(state)
                })
                .map(|e| {
                    let mut e = e.clone();
                    if let ElementKind::Node { children, .. } = &mut e.kind {
                        *children = filter(children, state);
                    }
                    e
                })
                .collect()
        }
        Schema {
            root_name: self.root_name.clone(),
            elements: filter(&self.elements, state),
        }
    }

    /// Render as a hash with descriptor attributes.
    pub fn to_hash(&self) -> Hash {
        let mut h = Hash::new();
        for e in &self.elements {
            h.set_node(&e.key, element_to_node(e));
        }
        h
    }

    /// Rebuild from the output of [`Schema::to_hash`].
    pub fn from_hash(root_name: impl Into<String>, hash: &Hash) -> CoreResult<Schema> {
        Ok(Schema {
            root_name: root_name.into(),
            elements: hash.iter().map(node_to_element).collect::<CoreResult<_>>()?,
        })
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(f: &mut fmt::Formatter<'_>, elements: &[Element], depth: usize) -> fmt::Result {
            for e in elements {
                let kind = match &e.kind {
                    ElementKind::Leaf(vt) => vt.name().to_string(),
                    ElementKind::Node { .. } => "NODE".to_string(),
                    ElementKind::Slot => "SLOT".to_string(),
                    ElementKind::Table(_) => "TABLE".to_string(),
                };
                writeln!(f, "{:indent$}{} [{}]", "", e.key, kind, indent = depth * 2)?;
                walk(f, e.children(), depth + 1)?;
            }
            Ok(())
        }
        writeln!(f, "Schema for {}:", self.root_name)?;
        walk(f, &self.elements, 1)
    }
}

fn collect_paths(elements: &[Element], prefix: &str, out: &mut Vec<String>, pred: &dyn Fn(&Element) -> bool) {
    for e in elements {
        let path = if prefix.is_empty() {
            e.key.clone()
        } else {
            format!("{prefix}{PATH_SEPARATOR}{}", e.key)
        };
        if pred(e) {
            out.push(path.clone());
        }
        collect_paths(e.children(), &path, out, pred);
    }
}

// =============================================================================
// Hash rendering
// =============================================================================

/// Attribute names of the hash form.
pub mod attr {
    #![allow(missing_docs)]
    pub const NODE_TYPE: &str = "nodeType";
    pub const VALUE_TYPE: &str = "valueType";
    pub const ACCESS_MODE: &str = "accessMode";
    pub const ASSIGNMENT: &str = "assignment";
    pub const DISPLAYED_NAME: &str = "displayedName";
    pub const DESCRIPTION: &str = "description";
    pub const DEFAULT_VALUE: &str = "defaultValue";
    pub const MIN_INC: &str = "minInc";
    pub const MIN_EXC: &str = "minExc";
    pub const MAX_INC: &str = "maxInc";
    pub const MAX_EXC: &str = "maxExc";
    pub const OPTIONS: &str = "options";
    pub const UNIT_NAME: &str = "unitName";
    pub const UNIT_SYMBOL: &str = "unitSymbol";
    pub const METRIC_PREFIX_NAME: &str = "metricPrefixName";
    pub const METRIC_PREFIX_SYMBOL: &str = "metricPrefixSymbol";
    pub const ALLOWED_STATES: &str = "allowedStates";
    pub const TAGS: &str = "tags";
    pub const ALIAS: &str = "alias";
    pub const MIN_SIZE: &str = "minSize";
    pub const MAX_SIZE: &str = "maxSize";
    pub const WARN_LOW: &str = "warnLow";
    pub const WARN_HIGH: &str = "warnHigh";
    pub const ALARM_LOW: &str = "alarmLow";
    pub const ALARM_HIGH: &str = "alarmHigh";
    pub const CLASS_ID: &str = "classId";
    pub const DISPLAY_TYPE: &str = "displayType";
    pub const ROW_SCHEMA: &str = "rowSchema";
    pub const ARCHIVE_POLICY: &str = "archivePolicy";

    pub const LEAF: i32 = 0;
    pub const NODE: i32 = 1;
}

fn element_to_node(e: &Element) -> Node {
    let value = match &e.kind {
        ElementKind::Node { children, .. } => {
            let mut h = Hash::new();
            for c in children {
                h.set_node(&c.key, element_to_node(c));
            }
            Value::Hash(h)
        }
        ElementKind::Slot => Value::Hash(Hash::new()),
        _ => Value::None,
    };
    let mut node = Node::new(e.key.clone(), value);
    let a = node.attributes_mut();
    let node_type = if e.is_leaf() { attr::LEAF } else { attr::NODE };
    a.set(attr::NODE_TYPE, node_type);
    if let Some(vt) = e.value_type() {
        a.set(attr::VALUE_TYPE, vt.name());
    }
    a.set(attr::ACCESS_MODE, e.access_mode.code());
    a.set(attr::ASSIGNMENT, e.assignment.code());
    if let Some(v) = &e.displayed_name {
        a.set(attr::DISPLAYED_NAME, v);
    }
    if let Some(v) = &e.description {
        a.set(attr::DESCRIPTION, v);
    }
    if let Some(v) = &e.default_value {
        a.set(attr::DEFAULT_VALUE, v.clone());
    }
    match &e.min {
        Some(Bound::Inclusive(v)) => a.set(attr::MIN_INC, v.clone()),
        Some(Bound::Exclusive(v)) => a.set(attr::MIN_EXC, v.clone()),
        None => {}
    }
    match &e.max {
        Some(Bound::Inclusive(v)) => a.set(attr::MAX_INC, v.clone()),
        Some(Bound::Exclusive(v)) => a.set(attr::MAX_EXC, v.clone()),
        None => {}
    }
    if let Some(options) = &e.options {
        let vector_type = options
            .first()
            .and_then(|o| o.value_type().vector_of())
            .unwrap_or(ValueType::VectorString);
        let rendered = Value::from_elements(vector_type, options.clone())
            .unwrap_or_else(|| Value::VectorString(options.iter().map(|o| o.to_string()).collect()));
        a.set(attr::OPTIONS, rendered);
    }
    if let Some(u) = e.unit {
        a.set(attr::UNIT_NAME, u.name());
        a.set(attr::UNIT_SYMBOL, u.symbol());
    }
    if let Some(p) = e.metric_prefix {
        a.set(attr::METRIC_PREFIX_NAME, p.name());
        a.set(attr::METRIC_PREFIX_SYMBOL, p.symbol());
    }
    if !e.allowed_states.is_empty() {
        let names: Vec<String> = e.allowed_states.iter().map(|s| s.name().to_string()).collect();
        a.set(attr::ALLOWED_STATES, names);
    }
    if !e.tags.is_empty() {
        a.set(attr::TAGS, e.tags.clone());
    }
    if let Some(v) = &e.alias {
        a.set(attr::ALIAS, v.clone());
    }
    if let Some(n) = e.min_size {
        a.set(attr::MIN_SIZE, n);
    }
    if let Some(n) = e.max_size {
        a.set(attr::MAX_SIZE, n);
    }
    let bounds = [
        (attr::WARN_LOW, e.alarm.warn_low),
        (attr::WARN_HIGH, e.alarm.warn_high),
        (attr::ALARM_LOW, e.alarm.alarm_low),
        (attr::ALARM_HIGH, e.alarm.alarm_high),
    ];
    for (name, bound) in bounds {
        if let Some(v) = bound {
            a.set(name, v);
        }
    }
    if let Some(c) = &e.class_id {
        a.set(attr::CLASS_ID, c);
    }
    match &e.kind {
        ElementKind::Slot => a.set(attr::DISPLAY_TYPE, "Slot"),
        ElementKind::Node { role, .. } => {
            if let Some(d) = role.display_type() {
                a.set(attr::DISPLAY_TYPE, d);
            }
        }
        ElementKind::Table(row) => {
            a.set(attr::DISPLAY_TYPE, "Table");
            a.set(attr::ROW_SCHEMA, row.to_hash());
        }
        ElementKind::Leaf(_) => {}
    }
    if !e.archive {
        a.set(attr::ARCHIVE_POLICY, "NO_ARCHIVING");
    }
    node
}

fn node_to_element(node: &Node) -> CoreResult<Element> {
    let a = node.attributes();
    let opt_str = |name: &str| a.get::<String>(name).ok();
    let node_type: i32 = a.get_as(attr::NODE_TYPE)?;
    let display_type = opt_str(attr::DISPLAY_TYPE);
    let class_id = opt_str(attr::CLASS_ID);

    let kind = if node_type == attr::LEAF {
        let name: String = a.get(attr::VALUE_TYPE)?;
        let vt = ValueType::from_name(&name)
            .ok_or_else(|| CoreError::Schema(format!("unknown value type '{name}' at '{}'", node.key())))?;
        match a.get::<Hash>(attr::ROW_SCHEMA) {
            Ok(row) if vt == ValueType::VectorHash => {
                ElementKind::Table(Box::new(Schema::from_hash(node.key(), &row)?))
            }
            _ => ElementKind::Leaf(vt),
        }
    } else if class_id.as_deref() == Some("Slot") {
        ElementKind::Slot
    } else {
        let children = match node.value() {
            Value::Hash(h) => h.iter().map(node_to_element).collect::<CoreResult<_>>()?,
            _ => Vec::new(),
        };
        ElementKind::Node {
            children,
            role: display_type
                .as_deref()
                .map(NodeRole::from_display_type)
                .unwrap_or_default(),
        }
    };

    let mut e = Element::with_kind(node.key(), kind);
    e.class_id = class_id;
    e.displayed_name = opt_str(attr::DISPLAYED_NAME);
    e.description = opt_str(attr::DESCRIPTION);
    if let Ok(code) = a.get_as::<i32>(attr::ACCESS_MODE) {
        e.access_mode = AccessMode::from_code(code).unwrap_or(AccessMode::Reconfigurable);
    }
    if let Ok(code) = a.get_as::<i32>(attr::ASSIGNMENT) {
        e.assignment = Assignment::from_code(code).unwrap_or(Assignment::Optional);
    }
    e.default_value = a.get_value(attr::DEFAULT_VALUE).cloned();
    e.min = a
        .get_value(attr::MIN_INC)
        .map(|v| Bound::Inclusive(v.clone()))
        .or_else(|| a.get_value(attr::MIN_EXC).map(|v| Bound::Exclusive(v.clone())));
    e.max = a
        .get_value(attr::MAX_INC)
        .map(|v| Bound::Inclusive(v.clone()))
        .or_else(|| a.get_value(attr::MAX_EXC).map(|v| Bound::Exclusive(v.clone())));
    e.options = a.get_value(attr::OPTIONS).and_then(Value::elements);
    e.unit = opt_str(attr::UNIT_NAME).and_then(|n| Unit::from_name(&n));
    e.metric_prefix = opt_str(attr::METRIC_PREFIX_NAME).and_then(|n| MetricPrefix::from_name(&n));
    if let Ok(states) = a.get::<Vec<String>>(attr::ALLOWED_STATES) {
        e.allowed_states = states.iter().filter_map(|s| State::from_name(s)).collect();
    }
    if let Ok(tags) = a.get::<Vec<String>>(attr::TAGS) {
        e.tags = tags;
    }
    e.alias = a.get_value(attr::ALIAS).cloned();
    e.min_size = a.get_as(attr::MIN_SIZE).ok();
    e.max_size = a.get_as(attr::MAX_SIZE).ok();
    e.alarm = AlarmBounds {
        warn_low: a.get_as(attr::WARN_LOW).ok(),
        warn_high: a.get_as(attr::WARN_HIGH).ok(),
        alarm_low: a.get_as(attr::ALARM_LOW).ok(),
        alarm_high: a.get_as(attr::ALARM_HIGH).ok(),
    };
    e.archive = opt_str(attr::ARCHIVE_POLICY).as_deref() != Some("NO_ARCHIVING");
    Ok(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor() -> Schema {
        let mut s = Schema::new("Motor");
        s.add(Element::state("state").state_options(&[State::INIT, State::ON]).default_value(State::INIT))
            .unwrap();
        s.add(Element::node("limits").displayed_name("Limits")).unwrap();
        s.add(
            Element::double("limits.high")
                .default_value(10.0)
                .max_inc(100.0)
                .unit(Unit::Meter)
                .metric_prefix(MetricPrefix::Milli)
                .warn_high(50.0)
                .alarm_high(80.0),
        )
        .unwrap();
        s.add(Element::int32("velocity").assignment_mandatory().min_exc(0).allowed_states(&[State::ON]))
            .unwrap();
        s.add(Element::slot("move").allowed_states(&[State::ON])).unwrap();
        let mut row = Schema::new("row");
        row.add(Element::string("name").default_value("x")).unwrap();
        s.add(Element::table("table", row).min_size(1)).unwrap();
        s
    }

    #[test]
    fn add_and_lookup() {
        let s = motor();
        assert!(s.has("limits.high"));
        assert_eq!(s.value_type("limits.high"), Some(ValueType::Double));
        assert_eq!(s.value_type("table"), Some(ValueType::VectorHash));
        assert_eq!(s.leaves(), vec!["state", "limits.high", "velocity", "table"]);
        assert_eq!(s.slots(), vec!["move"]);
        assert!(s.element("limits").unwrap().is_node());
        assert_eq!(s.alarm_leaves().len(), 1);
    }

    #[test]
    fn add_requires_parent_node() {
        let mut s = Schema::new("X");
        assert!(s.add(Element::int32("missing.leaf")).is_err());
        s.add(Element::int32("leaf")).unwrap();
        assert!(s.add(Element::int32("leaf.sub")).is_err());
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut s = motor();
        s.overwrite("limits.high", |e| e.default_value(20.0).read_only()).unwrap();
        let e = s.element("limits.high").unwrap();
        assert_eq!(e.get_default_value(), Some(&Value::Double(20.0)));
        assert_eq!(e.access_mode(), AccessMode::ReadOnly);
        assert!(s.overwrite("nope", |e| e).is_err());
        assert!(s.remove("limits.high"));
        assert!(!s.has("limits.high"));
    }

    #[test]
    fn state_filtering() {
        let s = motor();
        let init = s.for_state(State::INIT);
        assert!(!init.has("velocity"));
        assert!(!init.has("move"));
        assert!(init.has("limits.high"));
        assert!(s.for_state(State::ON).has("move"));
    }

    #[test]
    fn hash_round_trip() {
        let s = motor();
        let h = s.to_hash();
        assert_eq!(h.get_attribute::<String>("limits.high", attr::VALUE_TYPE).unwrap(), "DOUBLE");
        assert_eq!(h.get_attribute::<i32>("velocity", attr::ASSIGNMENT).unwrap(), 1);
        assert_eq!(h.get_attribute::<String>("move", attr::DISPLAY_TYPE).unwrap(), "Slot");
        let back = Schema::from_hash("Motor", &h).unwrap();
        assert_eq!(back, s);
    }
}
