//! Device classes and the per-namespace registry servers load them from.
//!
//! A device class is a [`DeviceFactory`]: it names the class, contributes its
//! expected parameters on top of the common device schema, and builds the
//! [`DeviceHooks`] of each new instance. Servers pick the classes of one
//! plugin namespace with [`DeviceClasses::for_namespace`].

use std::collections::BTreeMap;
use std::sync::Arc;

use karabo_core::{CoreResult, Element, Schema, State};

use super::{Device, DeviceHooks};
use crate::error::{KaraboError, KaraboResult};

// =============================================================================
// Device Factory Trait
// =============================================================================

/// A device class.
///
/// Factories are registered once at startup and live for the lifetime of the
/// server. `build` is called once per instance, after the configuration was
/// validated and before the device goes online; it is the place to register
/// slots and input handlers on the device.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Class id used in `slotStartDevice`.
    fn class_id(&self) -> &'static str;

    /// One-line description shown with the class schema.
    fn description(&self) -> &'static str {
        ""
    }

    /// Add the class specific elements to `schema`, which already holds the
    /// common device elements.
    fn expected_parameters(&self, schema: &mut Schema) -> CoreResult<()>;

    /// Create the behaviour of a new instance.
    fn build(&self, device: &Device) -> KaraboResult<Arc<dyn DeviceHooks>>;
}

/// Elements every device has.
pub fn base_schema(class_id: &str) -> CoreResult<Schema> {
    let mut s = Schema::new(class_id);
    s.add(
        Element::string("_deviceId_")
            .displayed_name("_DeviceID_")
            .description("Set by the device server")
            .init_only()
            .assignment_internal(),
    )?;
    s.add(
        Element::string("deviceId")
            .displayed_name("DeviceID")
            .description("The device instance id uniquely identifies a device instance")
            .read_only(),
    )?;
    s.add(
        Element::string("_serverId_")
            .displayed_name("_ServerID_")
            .description("Set by the device server")
            .init_only()
            .assignment_internal()
            .default_value("__none__"),
    )?;
    s.add(
        Element::string("serverId")
            .displayed_name("ServerID")
            .description("The device-server which this device is running on")
            .read_only(),
    )?;
    s.add(
        Element::string("classId")
            .displayed_name("ClassID")
            .description("The (factory)-name of the class of this device")
            .read_only()
            .default_value(class_id),
    )?;
    s.add(
        Element::string("hostName")
            .displayed_name("Host")
            .description("Set by the device server")
            .init_only()
            .assignment_internal(),
    )?;
    s.add(
        Element::int32("visibility")
            .displayed_name("Visibility")
            .description("Configures who is allowed to see this device at all")
            .init_only()
            .default_value(4i32)
            .options([0i32, 1, 2, 3, 4]),
    )?;
    s.add(
        Element::int32("heartbeatInterval")
            .displayed_name("Heartbeat interval")
            .description("The heartbeat interval in seconds")
            .init_only()
            .default_value(20i32)
            .min_inc(1i32),
    )?;
    s.add(
        Element::bool("archive")
            .displayed_name("Archive")
            .description("Persist the configuration across restarts")
            .reconfigurable()
            .default_value(true),
    )?;
    s.add(
        Element::state("state")
            .displayed_name("State")
            .description("The current state the device is in")
            .default_value(State::UNKNOWN.name()),
    )?;
    s.add(
        Element::string("status")
            .displayed_name("Status")
            .description("A more detailed status description")
            .read_only()
            .default_value(""),
    )?;
    s.add(
        Element::alarm_condition("alarmCondition")
            .displayed_name("Alarm condition")
            .description("The most severe alarm condition of the device")
            .default_value("none"),
    )?;
    s.add(
        Element::string("lockedBy")
            .displayed_name("Locked By")
            .description("The instance holding a lock on this device (empty if not locked)")
            .reconfigurable()
            .default_value(""),
    )?;
    s.add(
        Element::slot("slotClearLock")
            .displayed_name("Clear Lock")
            .description("Clear the lock on this device"),
    )?;
    Ok(s)
}

/// Full schema of `factory`'s class.
pub fn class_schema(factory: &dyn DeviceFactory) -> KaraboResult<Schema> {
    let mut schema = base_schema(factory.class_id())?;
    factory.expected_parameters(&mut schema)?;
    Ok(schema)
}

// =============================================================================
// Registry
// =============================================================================

/// Namespaces known to this build and the function filling each one.
const NAMESPACES: &[(&str, fn(&mut DeviceClasses) -> KaraboResult<()>)] =
    &[("karabo.devices", crate::devices::register)];

/// Device classes available to one server.
#[derive(Clone, Default)]
pub struct DeviceClasses {
    namespace: String,
    factories: BTreeMap<String, Arc<dyn DeviceFactory>>,
}

impl std::fmt::Debug for DeviceClasses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClasses")
            .field("namespace", &self.namespace)
            .field("classes", &self.class_ids())
            .finish()
    }
}

impl DeviceClasses {
    /// Empty registry for `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding every class of a known `namespace`.
    pub fn for_namespace(namespace: &str) -> KaraboResult<Self> {
        let (_, fill) = NAMESPACES
            .iter()
            .find(|(name, _)| *name == namespace)
            .ok_or_else(|| KaraboError::Config(format!("unknown plugin namespace '{namespace}'")))?;
        let mut classes = Self::new(namespace);
        fill(&mut classes)?;
        tracing::info!(namespace, classes = ?classes.class_ids(), "device classes loaded");
        Ok(classes)
    }

    /// Namespace the classes were loaded from.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Add a class. The class schema must build.
    pub fn register(&mut self, factory: Arc<dyn DeviceFactory>) -> KaraboResult<()> {
        let class_id = factory.class_id();
        if self.factories.contains_key(class_id) {
            return Err(KaraboError::Config(format!("device class '{class_id}' registered twice")));
        }
        class_schema(factory.as_ref())?;
        self.factories.insert(class_id.to_string(), factory);
        Ok(())
    }

    /// Factory of `class_id`.
    pub fn get(&self, class_id: &str) -> Option<Arc<dyn DeviceFactory>> {
        self.factories.get(class_id).cloned()
    }

    /// Class ids in alphabetical order.
    pub fn class_ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Schema of `class_id`.
    pub fn schema(&self, class_id: &str) -> KaraboResult<Schema> {
        let factory = self
            .get(class_id)
            .ok_or_else(|| KaraboError::Config(format!("Unknown class \"{class_id}\"")))?;
        class_schema(factory.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NoHooks;
    use karabo_core::{Hash, ValidationRules, Validator};

    struct Motor;

    impl DeviceFactory for Motor {
        fn class_id(&self) -> &'static str {
            "Motor"
        }

        fn expected_parameters(&self, schema: &mut Schema) -> CoreResult<()> {
            schema.add(Element::double("position").read_only().default_value(0.0))?;
            Ok(())
        }

        fn build(&self, _device: &Device) -> KaraboResult<Arc<dyn DeviceHooks>> {
            Ok(Arc::new(NoHooks))
        }
    }

    #[test]
    fn base_schema_validates_empty_configuration() {
        let schema = base_schema("Motor").unwrap();
        let outcome = Validator::new(ValidationRules::default()).validate(&schema, &Hash::new(), None);
        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.validated.get::<String>("state").unwrap(), "UNKNOWN");
        assert_eq!(outcome.validated.get::<String>("lockedBy").unwrap(), "");
        assert_eq!(outcome.validated.get::<String>("classId").unwrap(), "Motor");
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut classes = DeviceClasses::new("test");
        classes.register(Arc::new(Motor)).unwrap();
        assert!(classes.register(Arc::new(Motor)).is_err());
        assert_eq!(classes.class_ids(), vec!["Motor"]);
        assert!(classes.schema("Motor").unwrap().has("position"));
        assert!(classes.schema("Pump").is_err());
    }

    #[test]
    fn default_namespace_ships_property_test() {
        let classes = DeviceClasses::for_namespace("karabo.devices").unwrap();
        assert!(classes.get("PropertyTest").is_some());
        assert!(DeviceClasses::for_namespace("nowhere").is_err());
    }
}
