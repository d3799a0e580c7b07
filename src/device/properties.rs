//! Current configuration of a device and its alarm aggregate.

use karabo_core::{AlarmBounds, AlarmCondition, Hash, MergePolicy, Schema, Timestamp, Value};

/// Property values of one device together with the schema describing them.
///
/// Every leaf carries its timestamp as `sec`/`frac`/`tid` attributes.
#[derive(Debug, Clone)]
pub(crate) struct PropertyStore {
    schema: Schema,
    values: Hash,
    alarm_leaves: Vec<(String, AlarmBounds)>,
    global_alarm: AlarmCondition,
}

impl PropertyStore {
    pub fn new(schema: Schema, mut values: Hash, timestamp: Timestamp) -> Self {
        stamp(&mut values, timestamp);
        let alarm_leaves = schema.alarm_leaves();
        let mut store = Self {
            schema,
            values,
            alarm_leaves,
            global_alarm: AlarmCondition::None,
        };
        let condition = store.alarm_condition();
        let node = store.values.set("alarmCondition", condition);
        timestamp.to_attributes(node.attributes_mut());
        store
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn replace_schema(&mut self, schema: Schema) {
        self.alarm_leaves = schema.alarm_leaves();
        self.schema = schema;
    }

    pub fn values(&self) -> &Hash {
        &self.values
    }

    /// Merge `delta` into the values. Leaves without a timestamp get
    /// `timestamp`. Returns what subscribers must be told, which includes
    /// `alarmCondition` when the aggregate changed.
    pub fn apply(&mut self, delta: &Hash, timestamp: Timestamp) -> Hash {
        let before = self.current_alarm();
        let mut delta = delta.clone();
        stamp(&mut delta, timestamp);
        self.values.merge(&delta, MergePolicy::Merge);

        let after = self.alarm_condition();
        if after != before && !delta.has("alarmCondition") {
            let node = delta.set("alarmCondition", after);
            timestamp.to_attributes(node.attributes_mut());
            let node = self.values.set("alarmCondition", after);
            timestamp.to_attributes(node.attributes_mut());
        }
        delta
    }

    /// Condition raised by the device itself, independent of thresholds.
    pub fn set_global_alarm(&mut self, condition: AlarmCondition) {
        self.global_alarm = condition;
    }

    /// Maximum severity over all threshold leaves and the global condition.
    pub fn alarm_condition(&self) -> AlarmCondition {
        self.alarm_leaves
            .iter()
            .filter_map(|(path, bounds)| {
                let value = self.values.get_value(path).ok()?.as_f64()?;
                Some(bounds.evaluate(value))
            })
            .fold(self.global_alarm, AlarmCondition::max)
    }

    fn current_alarm(&self) -> AlarmCondition {
        self.values
            .get::<String>("alarmCondition")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// Attach `timestamp` to every leaf of `hash` that has none.
pub(crate) fn stamp(hash: &mut Hash, timestamp: Timestamp) {
    for node in hash.iter_mut() {
        let is_node = matches!(node.value(), Value::Hash(child) if !child.is_empty());
        if is_node {
            if let Value::Hash(child) = node.value_mut() {
                stamp(child, timestamp);
            }
        } else if !Timestamp::present_in(node.attributes()) {
            timestamp.to_attributes(node.attributes_mut());
        }
    }
}
