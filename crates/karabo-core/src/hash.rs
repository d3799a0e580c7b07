//! Ordered, attributed key/value tree.
//!
//! A [`Hash`] maps string keys to [`Value`]s and keeps insertion order. Every
//! node also carries an [`Attributes`] map (same value set, no nesting).
//!
//! # Paths
//!
//! Composite keys address nested hashes with `.` (`a.b.c`) and elements of a
//! vector-of-hash with `[i]` (`a[2].b`). `set` creates missing intermediate
//! nodes and grows vectors-of-hash as needed; read access never creates
//! anything and fails with [`CoreError::PathNotFound`].
//!
//! # Equality
//!
//! Two hashes are equal when the same keys map to equal values with equal
//! attributes; key order does not matter. Order matters for the encoded form
//! only. Tolerant float comparison lives in [`crate::compare`].
//!
//! # Example
//!
//! ```
//! use karabo_core::{Hash, Value};
//!
//! let mut h = Hash::new();
//! h.set("motor.position", 1.5f64);
//! h.set_attribute("motor.position", "unit", "mm").unwrap();
//! h.set("rows[1].name", "second");
//!
//! assert_eq!(h.get::<f64>("motor.position").unwrap(), 1.5);
//! assert_eq!(h.get_as::<String>("motor.position").unwrap(), "1.5");
//! assert_eq!(h.get::<Vec<Hash>>("rows").unwrap().len(), 2);
//! ```

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::value::{FromValue, Value};

/// Separator between path components.
pub const PATH_SEPARATOR: char = '.';

// =============================================================================
// Attributes
// =============================================================================

/// Ordered attribute map of a single node.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    entries: Vec<(String, Value)>,
}

impl Attributes {
    /// Empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attribute, keeping the position of an existing key.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Attribute value, if present.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Typed attribute value.
    pub fn get<T: FromValue>(&self, name: &str) -> CoreResult<T> {
        let value = self
            .get_value(name)
            .ok_or_else(|| CoreError::path_not_found(format!("@{}", name)))?;
        T::from_value(value).ok_or_else(|| CoreError::TypeMismatch {
            path: format!("@{}", name),
            expected: T::VALUE_TYPE.name().to_string(),
            actual: value.value_type().name().to_string(),
        })
    }

    /// Converting attribute access.
    pub fn get_as<T: FromValue>(&self, name: &str) -> CoreResult<T> {
        let value = self
            .get_value(name)
            .ok_or_else(|| CoreError::path_not_found(format!("@{}", name)))?;
        let cast = value.cast(T::VALUE_TYPE)?;
        T::from_value(&cast).ok_or_else(|| CoreError::TypeMismatch {
            path: format!("@{}", name),
            expected: T::VALUE_TYPE.name().to_string(),
            actual: value.value_type().name().to_string(),
        })
    }

    /// True when `name` is present.
    pub fn has(&self, name: &str) -> bool {
        self.get_value(name).is_some()
    }

    /// Remove an attribute, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Copy every attribute of `other` into `self`, overriding duplicates.
    pub fn merge(&mut self, other: &Attributes) {
        for (k, v) in &other.entries {
            self.set(k.clone(), v.clone());
        }
    }

    /// Attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get_value(k) == Some(v))
    }
}

// =============================================================================
// Node
// =============================================================================

/// A key, its value and its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    key: String,
    value: Value,
    attributes: Attributes,
}

impl Node {
    /// New node without attributes.
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            attributes: Attributes::new(),
        }
    }

    /// Key of this node (one path component).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Mutable stored value.
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Replace the value, keeping attributes.
    pub fn set_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.value = value.into();
        self
    }

    /// Attributes of this node.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Mutable attributes of this node.
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Builder-style attribute setter.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.attributes.set(name, value);
        self
    }

    /// Split into parts.
    pub fn into_parts(self) -> (String, Value, Attributes) {
        (self.key, self.value, self.attributes)
    }
}

// =============================================================================
// Path parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Segment<'a> {
    Key(&'a str),
    Indexed(&'a str, usize),
}

impl Segment<'_> {
    fn key(&self) -> &str {
        match self {
            Segment::Key(k) | Segment::Indexed(k, _) => k,
        }
    }
}

fn parse_segment(component: &str) -> Segment<'_> {
    if let Some(open) = component.rfind('[') {
        if let Some(inner) = component[open + 1..].strip_suffix(']') {
            if let Ok(index) = inner.parse::<usize>() {
                return Segment::Indexed(&component[..open], index);
            }
        }
    }
    Segment::Key(component)
}

fn parse_path(path: &str) -> Vec<Segment<'_>> {
    path.split(PATH_SEPARATOR).map(parse_segment).collect()
}

impl Value {
    fn ensure_hash(&mut self) -> &mut Hash {
        if !matches!(self, Value::Hash(_)) {
            *self = Value::Hash(Hash::new());
        }
        match self {
            Value::Hash(h) => h,
            _ => unreachable!("value was just replaced by a hash"),
        }
    }

    fn ensure_vector_hash(&mut self) -> &mut Vec<Hash> {
        if !matches!(self, Value::VectorHash(_)) {
            *self = Value::VectorHash(Vec::new());
        }
        match self {
            Value::VectorHash(v) => v,
            _ => unreachable!("value was just replaced by a vector of hashes"),
        }
    }
}

// =============================================================================
// Hash
// =============================================================================

/// Merge behavior for [`Hash::merge`].
///
/// All policies recurse into nested hashes present on both sides; they differ
/// in how existing entries and attributes are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Values from the other hash win; attributes are replaced wholesale.
    #[default]
    Replace,
    /// Values from the other hash win; attributes are merged key by key.
    Merge,
    /// Only keys missing in `self` are inserted.
    NoOverwrite,
}

/// Ordered key/value tree.
#[derive(Debug, Clone, Default)]
pub struct Hash {
    nodes: Vec<Node>,
}

impl Hash {
    /// Empty hash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when there are no top-level entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Top-level nodes in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    /// Mutable top-level nodes in insertion order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Node> {
        self.nodes.iter_mut()
    }

    /// Top-level keys in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.key.as_str()).collect()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.key == key)
    }

    fn direct(&self, key: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.key == key)
    }

    fn direct_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.key == key)
    }

    fn ensure_position(&mut self, key: &str) -> usize {
        match self.position(key) {
            Some(pos) => pos,
            None => {
                self.nodes.push(Node::new(key, Value::None));
                self.nodes.len() - 1
            }
        }
    }

    fn child(&self, segment: &Segment<'_>) -> Option<&Hash> {
        match *segment {
            Segment::Key(k) => self.direct(k)?.value.as_hash(),
            Segment::Indexed(k, i) => self.direct(k)?.value.as_vector_hash()?.get(i),
        }
    }

    fn child_mut(&mut self, segment: &Segment<'_>) -> Option<&mut Hash> {
        match *segment {
            Segment::Key(k) => self.direct_mut(k)?.value.as_hash_mut(),
            Segment::Indexed(k, i) => self.direct_mut(k)?.value.as_vector_hash_mut()?.get_mut(i),
        }
    }

    fn walk(&self, segments: &[Segment<'_>]) -> Option<&Hash> {
        let mut current = self;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    fn walk_mut(&mut self, segments: &[Segment<'_>]) -> Option<&mut Hash> {
        let mut current = self;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Store `value` at `path`, creating intermediate nodes.
    ///
    /// An existing node keeps its position and attributes. Intermediate nodes
    /// that hold a non-hash value are replaced by hashes. For a path ending in
    /// an index (`a[3]`) only hash values are meaningful; other values store an
    /// empty hash at that element. Returns the node that was written (for
    /// indexed paths, the vector node).
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> &mut Node {
        let segments = parse_path(path);
        self.set_segments(&segments, value.into())
    }

    fn set_segments(&mut self, segments: &[Segment<'_>], value: Value) -> &mut Node {
        let head = segments[0];
        let rest = &segments[1..];
        let pos = self.ensure_position(head.key());
        match head {
            Segment::Key(_) if rest.is_empty() => {
                let node = &mut self.nodes[pos];
                node.value = value;
                node
            }
            Segment::Key(_) => self.nodes[pos].value.ensure_hash().set_segments(rest, value),
            Segment::Indexed(_, index) => {
                if rest.is_empty() {
                    let element = match value {
                        Value::Hash(h) => h,
                        other => {
                            tracing::warn!(
                                value_type = %other.value_type(),
                                "non-hash value stored at vector-of-hash element"
                            );
                            Hash::new()
                        }
                    };
                    let vector = self.nodes[pos].value.ensure_vector_hash();
                    if vector.len() <= index {
                        vector.resize_with(index + 1, Hash::new);
                    }
                    vector[index] = element;
                    &mut self.nodes[pos]
                } else {
                    let vector = self.nodes[pos].value.ensure_vector_hash();
                    if vector.len() <= index {
                        vector.resize_with(index + 1, Hash::new);
                    }
                    vector[index].set_segments(rest, value)
                }
            }
        }
    }

    /// Store a complete node (value and attributes) at `path`.
    pub fn set_node(&mut self, path: &str, node: Node) -> &mut Node {
        let (_, value, attributes) = node.into_parts();
        let target = self.set(path, value);
        target.attributes = attributes;
        target
    }

    /// Remove the entry at `path`. Returns `true` if something was removed.
    ///
    /// For an indexed path (`a[1]`) the element is removed from the vector.
    pub fn erase(&mut self, path: &str) -> bool {
        let segments = parse_path(path);
        let Some((last, parents)) = segments.split_last() else {
            return false;
        };
        let Some(parent) = self.walk_mut(parents) else {
            return false;
        };
        match *last {
            Segment::Key(k) => match parent.position(k) {
                Some(pos) => {
                    parent.nodes.remove(pos);
                    true
                }
                None => false,
            },
            Segment::Indexed(k, i) => match parent
                .direct_mut(k)
                .and_then(|n| n.value.as_vector_hash_mut())
            {
                Some(v) if i < v.len() => {
                    v.remove(i);
                    true
                }
                _ => false,
            },
        }
    }

    fn take_node(&mut self, path: &str) -> Option<Node> {
        let segments = parse_path(path);
        let (last, parents) = segments.split_last()?;
        let parent = self.walk_mut(parents)?;
        match *last {
            Segment::Key(k) => {
                let pos = parent.position(k)?;
                Some(parent.nodes.remove(pos))
            }
            Segment::Indexed(..) => None,
        }
    }

    /// Move the entry at `old` to `new`, keeping value and attributes.
    ///
    /// When both paths share the same parent the entry keeps its position.
    pub fn rename(&mut self, old: &str, new: &str) -> CoreResult<()> {
        if old == new {
            return if self.has(old) {
                Ok(())
            } else {
                Err(CoreError::path_not_found(old))
            };
        }
        let old_segments = parse_path(old);
        let new_segments = parse_path(new);
        let same_parent = old_segments.len() == new_segments.len()
            && old_segments[..old_segments.len() - 1] == new_segments[..new_segments.len() - 1];
        if let (true, Some(Segment::Key(old_key)), Some(Segment::Key(new_key))) =
            (same_parent, old_segments.last(), new_segments.last())
        {
            let parent = self
                .walk_mut(&old_segments[..old_segments.len() - 1])
                .ok_or_else(|| CoreError::path_not_found(old))?;
            if parent.position(old_key).is_none() {
                return Err(CoreError::path_not_found(old));
            }
            if let Some(existing) = parent.position(new_key) {
                parent.nodes.remove(existing);
            }
            let pos = parent
                .position(old_key)
                .ok_or_else(|| CoreError::path_not_found(old))?;
            parent.nodes[pos].key = (*new_key).to_string();
            return Ok(());
        }
        let node = self
            .take_node(old)
            .ok_or_else(|| CoreError::path_not_found(old))?;
        self.set_node(new, node);
        Ok(())
    }

    /// Merge `other` into `self` according to `policy`.
    pub fn merge(&mut self, other: &Hash, policy: MergePolicy) {
        for incoming in &other.nodes {
            match self.position(&incoming.key) {
                None => self.nodes.push(incoming.clone()),
                Some(pos) => {
                    let existing = &mut self.nodes[pos];
                    let both_hashes = matches!(
                        (&existing.value, &incoming.value),
                        (Value::Hash(_), Value::Hash(_))
                    );
                    if both_hashes {
                        if let (Value::Hash(mine), Value::Hash(theirs)) =
                            (&mut existing.value, &incoming.value)
                        {
                            mine.merge(theirs, policy);
                        }
                        merge_attributes(&mut existing.attributes, &incoming.attributes, policy);
                    } else if policy != MergePolicy::NoOverwrite {
                        existing.value = incoming.value.clone();
                        merge_attributes(&mut existing.attributes, &incoming.attributes, policy);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    /// True when `path` resolves to a node or to a vector-of-hash element.
    pub fn has(&self, path: &str) -> bool {
        let segments = parse_path(path);
        match segments.split_last() {
            Some((last, parents)) => match self.walk(parents) {
                Some(parent) => match *last {
                    Segment::Key(k) => parent.direct(k).is_some(),
                    Segment::Indexed(..) => parent.child(last).is_some(),
                },
                None => false,
            },
            None => false,
        }
    }

    /// Node at `path` (indexed paths do not address nodes).
    pub fn get_node(&self, path: &str) -> Option<&Node> {
        let segments = parse_path(path);
        let (last, parents) = segments.split_last()?;
        match *last {
            Segment::Key(k) => self.walk(parents)?.direct(k),
            Segment::Indexed(..) => None,
        }
    }

    /// Mutable node at `path`.
    pub fn get_node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let segments = parse_path(path);
        let (last, parents) = segments.split_last()?;
        match *last {
            Segment::Key(k) => self.walk_mut(parents)?.direct_mut(k),
            Segment::Indexed(..) => None,
        }
    }

    /// Raw value at `path`.
    pub fn get_value(&self, path: &str) -> CoreResult<&Value> {
        self.get_node(path)
            .map(Node::value)
            .ok_or_else(|| CoreError::path_not_found(path))
    }

    /// Mutable raw value at `path`.
    pub fn get_value_mut(&mut self, path: &str) -> CoreResult<&mut Value> {
        self.get_node_mut(path)
            .map(Node::value_mut)
            .ok_or_else(|| CoreError::path_not_found(path))
    }

    /// Typed copy of the value at `path`; the stored type must match exactly.
    pub fn get<T: FromValue>(&self, path: &str) -> CoreResult<T> {
        if let Some(node) = self.get_node(path) {
            return T::from_value(&node.value).ok_or_else(|| CoreError::TypeMismatch {
                path: path.to_string(),
                expected: T::VALUE_TYPE.name().to_string(),
                actual: node.value.value_type().name().to_string(),
            });
        }
        let element = self.get_hash(path)?;
        T::from_value(&Value::Hash(element.clone())).ok_or_else(|| CoreError::TypeMismatch {
            path: path.to_string(),
            expected: T::VALUE_TYPE.name().to_string(),
            actual: "HASH".to_string(),
        })
    }

    /// Typed copy of the value at `path`, converting when needed.
    ///
    /// Conversion failures surface as [`CoreError::TypeMismatch`].
    pub fn get_as<T: FromValue>(&self, path: &str) -> CoreResult<T> {
        let value = self.get_value(path)?;
        let mismatch = || CoreError::TypeMismatch {
            path: path.to_string(),
            expected: T::VALUE_TYPE.name().to_string(),
            actual: value.value_type().name().to_string(),
        };
        let cast = value.cast(T::VALUE_TYPE).map_err(|_| mismatch())?;
        T::from_value(&cast).ok_or_else(mismatch)
    }

    /// Borrow the nested hash at `path` (node or vector element).
    pub fn get_hash(&self, path: &str) -> CoreResult<&Hash> {
        let segments = parse_path(path);
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| CoreError::path_not_found(path))?;
        let parent = self
            .walk(parents)
            .ok_or_else(|| CoreError::path_not_found(path))?;
        if parent.direct(last.key()).is_none() {
            return Err(CoreError::path_not_found(path));
        }
        parent.child(last).ok_or_else(|| CoreError::TypeMismatch {
            path: path.to_string(),
            expected: "HASH".to_string(),
            actual: parent
                .direct(last.key())
                .map(|n| n.value.value_type().name().to_string())
                .unwrap_or_default(),
        })
    }

    /// Mutable nested hash at `path`.
    pub fn get_hash_mut(&mut self, path: &str) -> CoreResult<&mut Hash> {
        let segments = parse_path(path);
        self.walk_mut(&segments)
            .ok_or_else(|| CoreError::path_not_found(path))
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    /// Attributes of the node at `path`.
    pub fn attributes(&self, path: &str) -> CoreResult<&Attributes> {
        self.get_node(path)
            .map(Node::attributes)
            .ok_or_else(|| CoreError::path_not_found(path))
    }

    /// Mutable attributes of the node at `path`.
    pub fn attributes_mut(&mut self, path: &str) -> CoreResult<&mut Attributes> {
        self.get_node_mut(path)
            .map(Node::attributes_mut)
            .ok_or_else(|| CoreError::path_not_found(path))
    }

    /// Set one attribute of an existing node.
    pub fn set_attribute(
        &mut self,
        path: &str,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        self.attributes_mut(path)?.set(name, value);
        Ok(())
    }

    /// Typed attribute of the node at `path`.
    pub fn get_attribute<T: FromValue>(&self, path: &str, name: &str) -> CoreResult<T> {
        self.attributes(path)?.get(name).map_err(|e| match e {
            CoreError::PathNotFound { .. } => CoreError::path_not_found(format!("{}@{}", path, name)),
            other => other,
        })
    }

    /// True when the node at `path` carries attribute `name`.
    pub fn has_attribute(&self, path: &str, name: &str) -> bool {
        self.attributes(path).map(|a| a.has(name)).unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Path views
    // -------------------------------------------------------------------------

    /// Leaves-only copy keyed by composite paths.
    ///
    /// Nested hashes and vectors of hashes are descended; empty ones are kept
    /// as leaves so that [`Hash::unflatten`] restores them. Attributes travel
    /// with their node: an attributed intermediate node is written as a
    /// `None` entry carrying the attributes, ahead of the entries below it.
    pub fn flatten(&self) -> Hash {
        let mut out = Hash::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut Hash) {
        for node in &self.nodes {
            let path = if prefix.is_empty() {
                node.key.clone()
            } else {
                format!("{}{}{}", prefix, PATH_SEPARATOR, node.key)
            };
            let descends = match &node.value {
                Value::Hash(h) => !h.is_empty(),
                Value::VectorHash(v) => !v.is_empty(),
                _ => false,
            };
            if descends && !node.attributes.is_empty() {
                out.nodes.push(Node {
                    key: path.clone(),
                    value: Value::None,
                    attributes: node.attributes.clone(),
                });
            }
            match &node.value {
                Value::Hash(h) if !h.is_empty() => h.flatten_into(&path, out),
                Value::VectorHash(v) if !v.is_empty() => {
                    for (i, element) in v.iter().enumerate() {
                        let element_path = format!("{}[{}]", path, i);
                        if element.is_empty() {
                            out.nodes
                                .push(Node::new(element_path, Value::Hash(Hash::new())));
                        } else {
                            element.flatten_into(&element_path, out);
                        }
                    }
                }
                _ => out.nodes.push(Node {
                    key: path,
                    value: node.value.clone(),
                    attributes: node.attributes.clone(),
                }),
            }
        }
    }

    /// Inverse of [`Hash::flatten`]: every key is interpreted as a path.
    ///
    /// A `None` entry followed by entries below its path becomes the
    /// intermediate node; its attributes survive because [`Hash::set`] keeps
    /// the attributes of nodes it turns into hashes.
    pub fn unflatten(&self) -> Hash {
        let mut out = Hash::new();
        for node in &self.nodes {
            let target = out.set(&node.key, node.value.clone());
            if !node.attributes.is_empty() {
                target.attributes = node.attributes.clone();
            }
        }
        out
    }

    /// Every leaf path, in order (same traversal as [`Hash::flatten`]).
    pub fn paths(&self) -> Vec<String> {
        let flat = self.flatten();
        let is_parent = |key: &str, next: Option<&Node>| {
            next.and_then(|n| n.key.strip_prefix(key))
                .is_some_and(|rest| rest.starts_with(PATH_SEPARATOR) || rest.starts_with('['))
        };
        flat.nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| !is_parent(&n.key, flat.nodes.get(i + 1)))
            .map(|(_, n)| n.key.clone())
            .collect()
    }
}

fn merge_attributes(mine: &mut Attributes, theirs: &Attributes, policy: MergePolicy) {
    match policy {
        MergePolicy::Replace => {
            if !theirs.is_empty() {
                *mine = theirs.clone();
            }
        }
        MergePolicy::Merge => mine.merge(theirs),
        MergePolicy::NoOverwrite => {
            for (k, v) in theirs.iter() {
                if !mine.has(k) {
                    mine.set(k, v.clone());
                }
            }
        }
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|n| {
                other
                    .direct(&n.key)
                    .is_some_and(|o| o.value == n.value && o.attributes == n.attributes)
            })
    }
}

impl<'a> IntoIterator for &'a Hash {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl FromIterator<Node> for Hash {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        let mut h = Hash::new();
        for node in iter {
            match h.position(&node.key) {
                Some(pos) => h.nodes[pos] = node,
                None => h.nodes.push(node),
            }
        }
        h
    }
}

impl Hash {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{:width$}'{}'", "", node.key, width = depth * 2)?;
            for (k, v) in node.attributes.iter() {
                write!(f, " {}=\"{}\"", k, v)?;
            }
            match &node.value {
                Value::Hash(h) => {
                    writeln!(f, " +")?;
                    h.fmt_indented(f, depth + 1)?;
                }
                Value::VectorHash(v) => {
                    writeln!(f, " @")?;
                    for (i, element) in v.iter().enumerate() {
                        writeln!(f, "{:width$}[{}]", "", i, width = (depth + 1) * 2)?;
                        element.fmt_indented(f, depth + 2)?;
                    }
                }
                other => writeln!(f, " => {} {}", other, other.value_type())?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Build a [`Hash`] from `path => value` pairs.
///
/// ```
/// let h = karabo_core::hash! { "a.b" => 1i32, "c" => "text" };
/// assert_eq!(h.get::<i32>("a.b").unwrap(), 1);
/// ```
#[macro_export]
macro_rules! hash {
    () => { $crate::Hash::new() };
    ($($path:expr => $value:expr),+ $(,)?) => {{
        let mut h = $crate::Hash::new();
        $( h.set($path, $value); )+
        h
    }};
}
