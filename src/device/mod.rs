//! Devices: schema-described, stateful instances on the bus.
//!
//! A [`Device`] wraps a [`SignalSlotable`] with
//!
//! - a schema (common elements from [`base_schema`] plus the class elements),
//! - the current configuration, every leaf stamped with its [`Timestamp`],
//! - a state, a status text and an alarm condition aggregated over all leaves
//!   with warn/alarm thresholds,
//! - the pipeline channels its schema declares,
//! - the behaviour of its class ([`DeviceHooks`]) and the slots the class
//!   registers.
//!
//! ## Lifecycle
//!
//! ```text
//! create()   validate configuration, build hooks, register slots
//! start()    open outputs, go online, connect inputs, hooks.initialize()
//! ...        slots, reconfiguration, property updates
//! kill()     hooks.pre_destruction(), persist, close channels, go offline
//! ```
//!
//! If `initialize` fails the device takes itself offline again and `start`
//! returns [`KaraboError::DeviceInit`].
//!
//! ## Updates
//!
//! [`Device::set`] and friends validate the delta, apply it and emit it on
//! `signalChanged(delta, deviceId)`; state changes go out on
//! `signalStateChanged`. Deltas of one device are emitted in the order they
//! were applied. If the alarm aggregate changes, `alarmCondition` is part of
//! the same delta.
//!
//! ## Reconfiguration
//!
//! `slotReconfigure(delta)` is all or nothing: the delta is rejected as a
//! whole if any key is unknown, not reconfigurable, not allowed in the
//! current state or fails validation, or if the `pre_reconfigure` hook
//! vetoes it.
//!
//! ## Locking
//!
//! Writing `lockedBy` takes an advisory lock. While it is held, reconfiguration
//! and class slots called by any other instance fail with
//! [`KaraboError::Locked`]; the holder may write `lockedBy` again. The lock is
//! released by writing an empty `lockedBy` or by `slotClearLock`.

mod channels;
mod factory;
mod persist;
mod properties;

pub use channels::{add_input_channel, add_output_channel};
pub use factory::{base_schema, class_schema, DeviceClasses, DeviceFactory};

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use karabo_core::{
    AccessMode, AlarmCondition, FromValue, Hash, NodeRole, Schema, State, Timestamp,
    ValidationRules, Validator, Value,
};
use parking_lot::{Mutex, RwLock};

use crate::broker::{Broker, BrokerStatus};
use crate::error::{KaraboError, KaraboResult};
use crate::event_loop::scoped;
use crate::pipeline::{InputChannel, InputConfig, InputHandlers, OutputChannel, OutputConfig};
use crate::signal_slot::{base_info, handler, Args, SignalSlotable, SlotMode, DEFAULT_TIMEOUT};

use properties::PropertyStore;

/// Signal carrying property deltas.
pub const SIGNAL_CHANGED: &str = "signalChanged";
/// Signal carrying state (and status) deltas.
pub const SIGNAL_STATE_CHANGED: &str = "signalStateChanged";
/// Signal carrying the full schema after it changed at runtime.
pub const SIGNAL_SCHEMA_UPDATED: &str = "signalSchemaUpdated";

/// Grace of a kill when nothing else is configured.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

const NO_SERVER: &str = "__none__";

// =============================================================================
// Hooks
// =============================================================================

/// Class behaviour invoked by the runtime.
///
/// Every method has a no-op default. Hooks receive the device on each call
/// and should not keep a strong handle to it; use [`Device::downgrade`] for
/// background tasks.
#[async_trait]
pub trait DeviceHooks: Send + Sync + 'static {
    /// Runs after the device went online. Failing aborts the start.
    async fn initialize(&self, device: &Device) -> KaraboResult<()> {
        let _ = device;
        Ok(())
    }

    /// Inspect or modify a validated reconfiguration; an error rejects it.
    async fn pre_reconfigure(&self, device: &Device, incoming: &mut Hash) -> KaraboResult<()> {
        let _ = (device, incoming);
        Ok(())
    }

    /// Runs after a reconfiguration was applied and published.
    async fn post_reconfigure(&self, device: &Device) -> KaraboResult<()> {
        let _ = device;
        Ok(())
    }

    /// Runs before the device goes offline.
    async fn pre_destruction(&self, device: &Device) {
        let _ = device;
    }
}

/// Hooks of a class without behaviour of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl DeviceHooks for NoHooks {}

// =============================================================================
// Device
// =============================================================================

/// Settings a server passes to the devices it creates.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Hosting server.
    pub server_id: String,
    /// Host name announced in the instance info.
    pub host: String,
    /// Directory for configuration persistence; `None` disables it.
    pub persist_dir: Option<PathBuf>,
    /// Default timeout of requests issued by the device.
    pub request_timeout: Duration,
    /// Time `pre_destruction` gets before the device is aborted.
    pub kill_grace: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            server_id: NO_SERVER.to_string(),
            host: "localhost".to_string(),
            persist_dir: None,
            request_timeout: DEFAULT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

struct DeviceInner {
    device_id: String,
    class_id: String,
    server_id: String,
    endpoint: SignalSlotable,
    store: RwLock<PropertyStore>,
    emit_lock: tokio::sync::Mutex<()>,
    hooks: RwLock<Arc<dyn DeviceHooks>>,
    outputs: RwLock<HashMap<String, OutputChannel>>,
    inputs: RwLock<HashMap<String, InputChannel>>,
    input_handlers: Mutex<HashMap<String, InputHandlers>>,
    persist_dir: Option<PathBuf>,
    kill_grace: Duration,
    request_timeout: Duration,
    disabled_from: Mutex<Option<State>>,
    killed: AtomicBool,
}

/// A device instance. Cheap to clone.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

/// Weak handle of a [`Device`].
#[derive(Clone)]
pub struct WeakDevice {
    inner: Weak<DeviceInner>,
}

impl WeakDevice {
    /// Strong handle if the device still exists.
    pub fn upgrade(&self) -> Option<Device> {
        self.inner.upgrade().map(|inner| Device { inner })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.inner.device_id)
            .field("class_id", &self.inner.class_id)
            .finish()
    }
}

impl Device {
    /// Validate `configuration` against the class schema and build the
    /// instance. Nothing is sent before [`start`](Self::start).
    ///
    /// The device id is taken from `_deviceId_` (set by servers) or
    /// `deviceId`.
    pub fn create(
        factory: &dyn DeviceFactory,
        configuration: &Hash,
        broker: Arc<dyn Broker>,
        options: &DeviceOptions,
    ) -> KaraboResult<Device> {
        let class_id = factory.class_id().to_string();
        let schema = class_schema(factory)?;
        let device_id = configuration
            .get::<String>("_deviceId_")
            .or_else(|_| configuration.get::<String>("deviceId"))
            .map_err(|_| KaraboError::Config("configuration names no deviceId".into()))?;

        let mut input = Hash::new();
        let archive = configuration.get::<bool>("archive").unwrap_or(true);
        if let (true, Some(dir)) = (archive, &options.persist_dir) {
            if let Some(stored) = persist::load(dir, &device_id, &schema)? {
                tracing::info!(device_id = %device_id, "restoring persisted configuration");
                input = stored;
            }
        }
        input.merge(configuration, karabo_core::MergePolicy::Merge);
        input.erase("deviceId");

        let mut values = Validator::new(ValidationRules::default())
            .validate(&schema, &input, None)
            .into_result()
            .map_err(KaraboError::Validation)?;

        let server_id = values
            .get::<String>("_serverId_")
            .ok()
            .filter(|s| s != NO_SERVER)
            .unwrap_or_else(|| options.server_id.clone());
        let host = values
            .get::<String>("hostName")
            .unwrap_or_else(|_| options.host.clone());
        values.set("_deviceId_", device_id.as_str());
        values.set("deviceId", device_id.as_str());
        values.set("_serverId_", server_id.as_str());
        values.set("serverId", server_id.as_str());
        values.set("classId", class_id.as_str());
        values.set("hostName", host.as_str());
        let heartbeat = values.get_as::<u64>("heartbeatInterval").unwrap_or(20);

        let mut info = base_info("device", &host);
        info.set("classId", class_id.as_str());
        info.set("serverId", server_id.as_str());
        info.set("visibility", values.get_as::<i32>("visibility").unwrap_or(4));
        info.set("status", status_info(State::UNKNOWN));
        let endpoint = SignalSlotable::new(device_id.clone(), info, broker);
        endpoint.set_heartbeat_interval(heartbeat);
        endpoint.set_default_timeout(options.request_timeout);
        for signal in [SIGNAL_CHANGED, SIGNAL_STATE_CHANGED, SIGNAL_SCHEMA_UPDATED] {
            endpoint.register_signal(signal);
        }

        let device = Device {
            inner: Arc::new(DeviceInner {
                device_id,
                class_id,
                server_id,
                endpoint,
                store: RwLock::new(PropertyStore::new(schema, values, Timestamp::now())),
                emit_lock: tokio::sync::Mutex::new(()),
                hooks: RwLock::new(Arc::new(NoHooks)),
                outputs: RwLock::new(HashMap::new()),
                inputs: RwLock::new(HashMap::new()),
                input_handlers: Mutex::new(HashMap::new()),
                persist_dir: options.persist_dir.clone(),
                kill_grace: options.kill_grace,
                request_timeout: options.request_timeout,
                disabled_from: Mutex::new(None),
                killed: AtomicBool::new(false),
            }),
        };
        device.register_base_slots();
        let hooks = factory.build(&device)?;
        *device.inner.hooks.write() = hooks;
        Ok(device)
    }

    /// Open the channels, go online and run `initialize`.
    pub async fn start(&self) -> KaraboResult<()> {
        let id = self.device_id().to_string();
        let init_failed = |reason: String| KaraboError::DeviceInit {
            device_id: id.clone(),
            reason,
        };

        if let Err(e) = self.open_outputs().await {
            self.close_channels().await;
            return Err(init_failed(e.to_string()));
        }
        if let Err(e) = self.inner.endpoint.start().await {
            self.close_channels().await;
            return Err(init_failed(e.to_string()));
        }
        if let Err(e) = scoped(id.clone(), async { self.open_inputs() }).await {
            self.offline().await;
            return Err(init_failed(e.to_string()));
        }
        self.watch_broker();

        let hooks = self.hooks();
        let initialized = scoped(id.clone(), hooks.initialize(self)).await;
        if let Err(e) = initialized {
            tracing::error!(device_id = %id, error = %e, "initialization failed");
            self.offline().await;
            return Err(init_failed(e.to_string()));
        }
        tracing::info!(device_id = %id, class_id = %self.class_id(), "device started");
        Ok(())
    }

    /// Run `pre_destruction`, persist, close the channels and go offline.
    /// Later calls return immediately.
    pub async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = self.hooks();
        hooks.pre_destruction(self).await;
        self.persist();
        self.offline().await;
        tracing::info!(device_id = %self.device_id(), "device killed");
    }

    /// [`kill`](Self::kill), aborting the device if it overruns `grace`.
    pub async fn kill_with_grace(&self, grace: Duration) -> KaraboResult<()> {
        if tokio::time::timeout(grace, self.kill()).await.is_ok() {
            return Ok(());
        }
        self.abort().await;
        let err = KaraboError::UncancelledShutdown {
            device_id: self.device_id().to_string(),
            grace_secs: grace.as_secs(),
        };
        tracing::error!(device_id = %self.device_id(), server_id = %self.server_id(), error = %err, "device aborted");
        Err(err)
    }

    /// Kill through the hosting server, which enforces the grace. Devices
    /// without a reachable server enforce it themselves.
    async fn kill_hosted(&self) -> KaraboResult<()> {
        let server_id = self.server_id();
        if server_id == NO_SERVER {
            return self.kill_with_grace(self.inner.kill_grace).await;
        }
        let forwarded = self
            .inner
            .endpoint
            .request(server_id, "slotKillDevice", crate::args![self.device_id()])
            .timeout(self.inner.kill_grace + self.inner.request_timeout)
            .wait_for_reply()
            .await;
        match forwarded {
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => {
                tracing::warn!(device_id = %self.device_id(), %server_id, "server does not answer, killing locally");
                self.kill_with_grace(self.inner.kill_grace).await
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down without running any hook; used when a device ignored a kill.
    pub async fn abort(&self) {
        self.inner.killed.store(true, Ordering::Release);
        for (_, input) in self.inner.inputs.write().drain() {
            input.close();
        }
        self.inner.outputs.write().clear();
        *self.inner.hooks.write() = Arc::new(NoHooks);
        self.inner.input_handlers.lock().clear();
        self.inner.endpoint.terminate().await;
    }

    async fn offline(&self) {
        self.close_channels().await;
        self.inner.endpoint.stop().await;
        *self.inner.hooks.write() = Arc::new(NoHooks);
        self.inner.input_handlers.lock().clear();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Instance id.
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Class id.
    pub fn class_id(&self) -> &str {
        &self.inner.class_id
    }

    /// Hosting server.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Messaging endpoint of the device.
    pub fn endpoint(&self) -> &SignalSlotable {
        &self.inner.endpoint
    }

    /// Weak handle.
    pub fn downgrade(&self) -> WeakDevice {
        WeakDevice {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True after [`kill`](Self::kill) or [`abort`](Self::abort).
    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::Acquire)
    }

    /// Current configuration with timestamps.
    pub fn configuration(&self) -> Hash {
        self.inner.store.read().values().clone()
    }

    /// Current schema.
    pub fn schema(&self) -> Schema {
        self.inner.store.read().schema().clone()
    }

    /// Typed property value.
    pub fn get<T: FromValue>(&self, path: &str) -> KaraboResult<T> {
        Ok(self.inner.store.read().values().get::<T>(path)?)
    }

    /// Property value converted to `T`.
    pub fn get_as<T: FromValue>(&self, path: &str) -> KaraboResult<T> {
        Ok(self.inner.store.read().values().get_as::<T>(path)?)
    }

    /// Current state.
    pub fn state(&self) -> State {
        state_of(self.inner.store.read().values())
    }

    /// Current alarm aggregate.
    pub fn alarm_condition(&self) -> AlarmCondition {
        self.inner.store.read().alarm_condition()
    }

    /// Holder of the advisory lock, empty if unlocked.
    pub fn locked_by(&self) -> String {
        self.get::<String>("lockedBy").unwrap_or_default()
    }

    fn hooks(&self) -> Arc<dyn DeviceHooks> {
        self.inner.hooks.read().clone()
    }

    // =========================================================================
    // Property updates
    // =========================================================================

    /// Set one property and publish it.
    pub async fn set(&self, path: &str, value: impl Into<Value>) -> KaraboResult<()> {
        let mut delta = Hash::new();
        delta.set(path, value);
        self.set_hash(delta).await
    }

    /// Set several properties at once, stamped now.
    pub async fn set_hash(&self, delta: Hash) -> KaraboResult<()> {
        self.set_hash_with_timestamp(delta, Timestamp::now()).await
    }

    /// Set several properties at once with an explicit timestamp. Values are
    /// coerced to their schema types; unknown keys are rejected.
    pub async fn set_hash_with_timestamp(&self, delta: Hash, timestamp: Timestamp) -> KaraboResult<()> {
        let validated = {
            let store = self.inner.store.read();
            Validator::new(ValidationRules::reconfiguration())
                .validate(store.schema(), &delta, Some(timestamp))
                .into_result()
                .map_err(KaraboError::Validation)?
        };
        let signal = if validated.has("state") {
            SIGNAL_STATE_CHANGED
        } else {
            SIGNAL_CHANGED
        };
        self.publish(&validated, signal, timestamp).await
    }

    /// Change the state.
    pub async fn update_state(&self, state: State) -> KaraboResult<()> {
        self.update_state_with_status(state, None).await
    }

    /// Change the state and the status text together.
    pub async fn update_state_with_status(&self, state: State, status: Option<&str>) -> KaraboResult<()> {
        let mut delta = Hash::new();
        delta.set("state", state.name());
        if let Some(status) = status {
            delta.set("status", status);
        }
        self.publish(&delta, SIGNAL_STATE_CHANGED, Timestamp::now()).await?;

        let announced = self.inner.endpoint.info().get::<String>("status").unwrap_or_default();
        if announced != status_info(state) {
            let mut update = Hash::new();
            update.set("status", status_info(state));
            self.inner.endpoint.update_info(&update).await?;
        }
        Ok(())
    }

    /// Raise (or clear, with [`AlarmCondition::None`]) a condition that is
    /// independent of property thresholds.
    pub async fn set_alarm_condition(&self, condition: AlarmCondition) -> KaraboResult<()> {
        self.inner.store.write().set_global_alarm(condition);
        self.publish(&Hash::new(), SIGNAL_CHANGED, Timestamp::now()).await
    }

    async fn publish(&self, delta: &Hash, signal: &str, timestamp: Timestamp) -> KaraboResult<()> {
        let _order = self.inner.emit_lock.lock().await;
        let applied = self.inner.store.write().apply(delta, timestamp);
        if applied.is_empty() || !self.inner.endpoint.is_running() {
            return Ok(());
        }
        self.inner
            .endpoint
            .emit(signal, crate::args![applied, self.device_id()])
            .await
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// Register a class slot. Calls are rejected when the device is locked
    /// by someone else or when the schema restricts the slot to states other
    /// than the current one.
    pub fn register_slot<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Device, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KaraboResult<Args>> + Send + 'static,
    {
        let weak = self.downgrade();
        let f = Arc::new(f);
        self.inner.endpoint.register_slot_with(
            name,
            SlotMode::Ordered,
            handler(move |args, ctx| {
                let weak = weak.clone();
                let f = f.clone();
                async move {
                    let device = weak
                        .upgrade()
                        .ok_or_else(|| KaraboError::Cancelled("device is gone".into()))?;
                    device.check_lock(&ctx.sender)?;
                    device.check_slot_allowed(&ctx.slot)?;
                    f(device, args).await
                }
            }),
        );
    }

    fn check_lock(&self, sender: &str) -> KaraboResult<()> {
        let holder = self.locked_by();
        if holder.is_empty() || holder == sender {
            Ok(())
        } else {
            Err(KaraboError::Locked {
                device_id: self.device_id().to_string(),
                holder,
            })
        }
    }

    fn check_slot_allowed(&self, slot: &str) -> KaraboResult<()> {
        let store = self.inner.store.read();
        let state = state_of(store.values());
        match store.schema().element(slot) {
            Some(element) if !element.is_allowed_in(state) => Err(KaraboError::AllowedStateViolation {
                action: slot.to_string(),
                state,
            }),
            _ => Ok(()),
        }
    }

    fn register_base_slots(&self) {
        let ep = &self.inner.endpoint;

        let weak = self.downgrade();
        ep.register_slot_with(
            "slotGetConfiguration",
            SlotMode::Concurrent,
            handler(move |_args, _ctx| {
                let device = weak.upgrade();
                async move {
                    let device = device.ok_or_else(|| KaraboError::Cancelled("device is gone".into()))?;
                    Ok(crate::args![device.configuration(), device.device_id()])
                }
            }),
        );

        let weak = self.downgrade();
        ep.register_slot_with(
            "slotGetSchema",
            SlotMode::Concurrent,
            handler(move |args, _ctx| {
                let device = weak.upgrade();
                async move {
                    let device = device.ok_or_else(|| KaraboError::Cancelled("device is gone".into()))?;
                    let only_current_state = args.get_or::<bool>(0, false);
                    let schema = if only_current_state {
                        device.schema().for_state(device.state())
                    } else {
                        device.schema()
                    };
                    Ok(crate::args![schema.to_hash(), device.device_id()])
                }
            }),
        );

        let weak = self.downgrade();
        ep.register_slot_with(
            "slotReconfigure",
            SlotMode::Ordered,
            handler(move |args, ctx| {
                let device = weak.upgrade();
                async move {
                    let device = device.ok_or_else(|| KaraboError::Cancelled("device is gone".into()))?;
                    device.reconfigure(args.get::<Hash>(0)?, &ctx.sender).await?;
                    Ok(Args::new())
                }
            }),
        );

        let weak = self.downgrade();
        ep.register_slot_with(
            "slotKillDevice",
            SlotMode::Concurrent,
            handler(move |_args, ctx| {
                let device = weak.upgrade();
                async move {
                    if let Some(device) = device {
                        tracing::info!(device_id = %device.device_id(), sender = %ctx.sender, "kill requested");
                        device.kill_hosted().await?;
                    }
                    Ok(Args::new())
                }
            }),
        );

        let weak = self.downgrade();
        ep.register_slot_with(
            "slotClearLock",
            SlotMode::Ordered,
            handler(move |_args, _ctx| {
                let device = weak.upgrade();
                async move {
                    let device = device.ok_or_else(|| KaraboError::Cancelled("device is gone".into()))?;
                    device.set("lockedBy", "").await?;
                    Ok(Args::new())
                }
            }),
        );

        let weak = self.downgrade();
        ep.register_slot_with(
            "slotGetOutputChannelInformation",
            SlotMode::Concurrent,
            handler(move |args, _ctx| {
                let device = weak.upgrade();
                async move {
                    let device = device.ok_or_else(|| KaraboError::Cancelled("device is gone".into()))?;
                    let channel = args.get::<String>(0)?;
                    let info = device.inner.outputs.read().get(&channel).map(OutputChannel::information);
                    Ok(match info {
                        Some(info) => crate::args![true, info],
                        None => crate::args![false, Hash::new()],
                    })
                }
            }),
        );
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Apply `delta` as if `sender` had called `slotReconfigure`.
    pub async fn reconfigure(&self, delta: Hash, sender: &str) -> KaraboResult<()> {
        self.check_lock(sender)?;
        let mut validated = {
            let store = self.inner.store.read();
            let state = state_of(store.values());
            check_writable(store.schema(), &delta, "", state)?;
            Validator::new(ValidationRules::reconfiguration())
                .validate(store.schema(), &delta, Some(Timestamp::now()))
                .into_result()
                .map_err(KaraboError::Validation)?
        };
        if validated.is_empty() {
            return Ok(());
        }

        let hooks = self.hooks();
        hooks.pre_reconfigure(self, &mut validated).await?;
        self.publish(&validated, SIGNAL_CHANGED, Timestamp::now()).await?;
        self.rewire_inputs(&validated);
        hooks.post_reconfigure(self).await?;
        self.persist();
        tracing::debug!(device_id = %self.device_id(), %sender, keys = ?validated.keys(), "reconfigured");
        Ok(())
    }

    fn persist(&self) {
        let Some(dir) = &self.inner.persist_dir else {
            return;
        };
        let store = self.inner.store.read();
        if !store.values().get::<bool>("archive").unwrap_or(false) {
            return;
        }
        if let Err(e) = persist::save(dir, self.device_id(), store.schema(), store.values()) {
            tracing::warn!(device_id = %self.device_id(), error = %e, "could not persist configuration");
        }
    }

    // =========================================================================
    // Pipeline channels
    // =========================================================================

    async fn open_outputs(&self) -> KaraboResult<()> {
        let (paths, values, schema_hash) = {
            let store = self.inner.store.read();
            (
                store.schema().channels(NodeRole::OutputChannel),
                store.values().clone(),
                store.schema().to_hash(),
            )
        };
        for path in paths {
            let config = values.get_hash(&path).map(OutputConfig::from_hash).unwrap_or_default();
            let output = OutputChannel::bind(format!("{}:{path}", self.device_id()), &config).await?;
            if let Ok(data) = schema_hash.get_hash(&format!("{path}.schema")) {
                output.set_schema(data.clone()).await;
            }
            self.inner.outputs.write().insert(path, output);
        }
        Ok(())
    }

    fn open_inputs(&self) -> KaraboResult<()> {
        let (paths, values) = {
            let store = self.inner.store.read();
            (store.schema().channels(NodeRole::InputChannel), store.values().clone())
        };
        for path in paths {
            let config = values.get_hash(&path).map(InputConfig::from_hash).unwrap_or_default();
            let input = InputChannel::new(
                format!("{}:{path}", self.device_id()),
                &config,
                Arc::new(self.inner.endpoint.downgrade()),
            )?;
            if let Some(handlers) = self.inner.input_handlers.lock().get(&path) {
                input.set_handlers(handlers.clone());
            }
            input.connect();
            self.inner.inputs.write().insert(path, input);
        }
        Ok(())
    }

    fn rewire_inputs(&self, applied: &Hash) {
        let inputs = self.inner.inputs.read();
        for (path, input) in inputs.iter() {
            let Ok(wanted) = applied.get::<Vec<String>>(&format!("{path}.connectedOutputChannels")) else {
                continue;
            };
            for current in input.connected_outputs().into_iter().chain(input.missing_connections()) {
                if !wanted.contains(&current) {
                    input.disconnect_output(&current);
                }
            }
            for output in &wanted {
                input.connect_output(output);
            }
        }
    }

    async fn close_channels(&self) {
        for (_, input) in self.inner.inputs.write().drain() {
            input.close();
        }
        let outputs: Vec<OutputChannel> = self.inner.outputs.write().drain().map(|(_, o)| o).collect();
        for output in outputs {
            output.close().await;
        }
    }

    /// Output channel declared at `path`.
    pub fn output(&self, path: &str) -> KaraboResult<OutputChannel> {
        self.inner
            .outputs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| KaraboError::Config(format!("'{}' has no output channel '{path}'", self.device_id())))
    }

    /// Input channel declared at `path`.
    pub fn input(&self, path: &str) -> KaraboResult<InputChannel> {
        self.inner
            .inputs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| KaraboError::Config(format!("'{}' has no input channel '{path}'", self.device_id())))
    }

    /// Install the callbacks of input `path`; may be called before `start`.
    pub fn set_input_handlers(&self, path: &str, handlers: InputHandlers) {
        if let Some(input) = self.inner.inputs.read().get(path) {
            input.set_handlers(handlers.clone());
        }
        self.inner.input_handlers.lock().insert(path.to_string(), handlers);
    }

    /// Write one hash to output `path`, stamped now.
    pub async fn write_output(&self, path: &str, data: &Hash) -> KaraboResult<()> {
        self.output(path)?.write(data, Timestamp::now()).await
    }

    /// Write one hash to output `path` with an explicit timestamp.
    pub async fn write_output_with_timestamp(
        &self,
        path: &str,
        data: &Hash,
        timestamp: Timestamp,
    ) -> KaraboResult<()> {
        self.output(path)?.write(data, timestamp).await
    }

    /// Send end-of-stream on output `path`.
    pub async fn signal_end_of_stream(&self, path: &str) -> KaraboResult<()> {
        self.output(path)?.signal_end_of_stream().await
    }

    /// Replace the data description of output `path`. Connected inputs get
    /// the new schema after the chunks already queued for them; subscribers
    /// get the full device schema on `signalSchemaUpdated`.
    pub async fn set_output_schema(&self, path: &str, data: &Schema) -> KaraboResult<()> {
        let output = self.output(path)?;
        let full = {
            let mut store = self.inner.store.write();
            let mut schema = store.schema().clone();
            channels::add_output_schema(&mut schema, path, data)?;
            store.replace_schema(schema.clone());
            schema
        };
        output.set_schema(data.to_hash()).await;
        if self.inner.endpoint.is_running() {
            self.inner
                .endpoint
                .emit(SIGNAL_SCHEMA_UPDATED, crate::args![full.to_hash(), self.device_id()])
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Broker supervision
    // =========================================================================

    fn watch_broker(&self) {
        let mut status = self.inner.endpoint.broker().status();
        let weak = self.downgrade();
        let task = tokio::spawn(scoped(self.device_id().to_string(), async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                let Some(device) = weak.upgrade() else {
                    return;
                };
                device.on_broker_status(current).await;
            }
        }));
        self.inner.endpoint.adopt_task(task);
    }

    async fn on_broker_status(&self, status: BrokerStatus) {
        match status {
            BrokerStatus::Reconnecting => {
                let previous = {
                    let mut disabled = self.inner.disabled_from.lock();
                    if disabled.is_some() {
                        return;
                    }
                    let previous = self.state();
                    *disabled = Some(previous);
                    previous
                };
                tracing::warn!(device_id = %self.device_id(), state = %previous, "broker lost, device disabled");
                // Emitting fails while the broker is away; the local state still changes.
                let _ = self.update_state(State::DISABLED).await;
            }
            BrokerStatus::Connected => {
                let previous = self.inner.disabled_from.lock().take();
                if let Some(previous) = previous {
                    tracing::info!(device_id = %self.device_id(), state = %previous, "broker back, state restored");
                    if let Err(e) = self.update_state(previous).await {
                        tracing::warn!(device_id = %self.device_id(), error = %e, "could not restore state");
                    }
                }
            }
            BrokerStatus::Failed => {
                tracing::error!(device_id = %self.device_id(), "broker connection given up");
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn state_of(values: &Hash) -> State {
    values
        .get::<String>("state")
        .ok()
        .and_then(|s| State::from_name(&s))
        .unwrap_or(State::UNKNOWN)
}

/// Coarse status announced in the instance info.
fn status_info(state: State) -> &'static str {
    match state {
        State::UNKNOWN => "unknown",
        s if s.is_derived_from(State::ERROR) => "error",
        _ => "ok",
    }
}

/// Reject leaves that may not be written from outside in `state`.
fn check_writable(schema: &Schema, delta: &Hash, prefix: &str, state: State) -> KaraboResult<()> {
    for node in delta.iter() {
        let path = if prefix.is_empty() {
            node.key().to_string()
        } else {
            format!("{prefix}.{}", node.key())
        };
        let Some(element) = schema.element(&path) else {
            continue;
        };
        if element.is_node() {
            if let Value::Hash(sub) = node.value() {
                check_writable(schema, sub, &path, state)?;
            }
            continue;
        }
        if element.is_slot() {
            continue;
        }
        if element.access_mode() != AccessMode::Reconfigurable {
            return Err(KaraboError::Validation(format!(
                "Parameter \"{path}\" is not reconfigurable"
            )));
        }
        if !element.is_allowed_in(state) {
            return Err(KaraboError::AllowedStateViolation { action: path, state });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InprocBroker;
    use karabo_core::{hash, CoreResult, Element};
    use tracing_test::traced_test;

    struct Heater;

    struct HeaterHooks;

    #[async_trait]
    impl DeviceHooks for HeaterHooks {
        async fn initialize(&self, device: &Device) -> KaraboResult<()> {
            device.update_state(State::OFF).await
        }

        async fn pre_reconfigure(&self, _device: &Device, incoming: &mut Hash) -> KaraboResult<()> {
            if incoming.get::<f64>("target").is_ok_and(|t| t == 13.0) {
                return Err(KaraboError::Validation("unlucky target".into()));
            }
            Ok(())
        }
    }

    impl DeviceFactory for Heater {
        fn class_id(&self) -> &'static str {
            "Heater"
        }

        fn expected_parameters(&self, schema: &mut Schema) -> CoreResult<()> {
            schema.add(
                Element::double("target")
                    .reconfigurable()
                    .default_value(20.0)
                    .max_inc(100.0)
                    .allowed_states(&[State::OFF, State::ON]),
            )?;
            schema.add(Element::double("speed").reconfigurable().default_value(1.0))?;
            schema.add(
                Element::double("temperature")
                    .read_only()
                    .default_value(20.0)
                    .warn_high(50.0)
                    .alarm_high(80.0),
            )?;
            schema.add(Element::string("mode").init_only().default_value("auto"))?;
            schema.add(Element::slot("switchOn").allowed_states(&[State::OFF]))?;
            Ok(())
        }

        fn build(&self, device: &Device) -> KaraboResult<Arc<dyn DeviceHooks>> {
            device.register_slot("switchOn", |device, _args| async move {
                device.update_state(State::ON).await?;
                Ok(Args::new())
            });
            Ok(Arc::new(HeaterHooks))
        }
    }

    async fn started(url: &str, id: &str) -> (Device, SignalSlotable) {
        let broker: Arc<dyn Broker> = Arc::new(InprocBroker::new(url, "test"));
        let mut config = Hash::new();
        config.set("_deviceId_", id);
        let device = Device::create(&Heater, &config, broker.clone(), &DeviceOptions::default()).unwrap();
        device.start().await.unwrap();
        let client = SignalSlotable::new("client", base_info("client", "h"), broker);
        client.start().await.unwrap();
        (device, client)
    }

    #[tokio::test]
    async fn reconfigure_is_all_or_nothing() {
        let (device, client) = started("inproc://device-atomic", "heater").await;
        assert_eq!(device.state(), State::OFF);

        let err = client
            .request("heater", "slotReconfigure", crate::args![hash! { "speed" => 2.0f64, "target" => 500.0f64 }])
            .wait_for_reply()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::Remote { .. }));
        assert_eq!(device.get::<f64>("speed").unwrap(), 1.0);

        let err = device.reconfigure(hash! { "speed" => 3.0f64, "mode" => "manual" }, "client").await;
        assert!(err.unwrap_err().to_string().contains("mode"));
        assert_eq!(device.get::<f64>("speed").unwrap(), 1.0);

        assert!(device.reconfigure(hash! { "target" => 13.0f64 }, "client").await.is_err());
        assert_eq!(device.get::<f64>("target").unwrap(), 20.0);

        device.reconfigure(hash! { "speed" => 3i32, "target" => 30.0f64 }, "client").await.unwrap();
        assert_eq!(device.get::<f64>("speed").unwrap(), 3.0);
        assert_eq!(device.get::<f64>("target").unwrap(), 30.0);
        device.kill().await;
    }

    #[tokio::test]
    async fn slots_respect_allowed_states() {
        let (device, client) = started("inproc://device-states", "heater").await;
        client.request("heater", "switchOn", Args::new()).wait_for_reply().await.unwrap();
        assert_eq!(device.state(), State::ON);

        let err = client
            .request("heater", "switchOn", Args::new())
            .wait_for_reply()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ON"), "{err}");
        device.kill().await;
    }

    #[tokio::test]
    async fn lock_blocks_other_writers() {
        let (device, client) = started("inproc://device-lock", "heater").await;
        device.reconfigure(hash! { "lockedBy" => "alice" }, "alice").await.unwrap();
        assert_eq!(device.locked_by(), "alice");

        let err = device.reconfigure(hash! { "speed" => 5.0f64 }, "bob").await.unwrap_err();
        assert!(matches!(err, KaraboError::Locked { .. }));
        device.reconfigure(hash! { "lockedBy" => "alice", "speed" => 5.0f64 }, "alice").await.unwrap();

        let err = client.request("heater", "switchOn", Args::new()).wait_for_reply().await.unwrap_err();
        assert!(err.to_string().contains("locked"), "{err}");

        client.request("heater", "slotClearLock", Args::new()).wait_for_reply().await.unwrap();
        assert_eq!(device.locked_by(), "");
        device.reconfigure(hash! { "speed" => 6.0f64 }, "bob").await.unwrap();
        device.kill().await;
    }

    #[tokio::test]
    async fn alarm_follows_thresholds() {
        let (device, _client) = started("inproc://device-alarm", "heater").await;
        assert_eq!(device.alarm_condition(), AlarmCondition::None);
        device.set("temperature", 60.0f64).await.unwrap();
        assert_eq!(device.get::<String>("alarmCondition").unwrap(), "warn");
        device.set("temperature", 90.0f64).await.unwrap();
        assert_eq!(device.alarm_condition(), AlarmCondition::Alarm);
        device.set("temperature", 20.0f64).await.unwrap();
        assert_eq!(device.get::<String>("alarmCondition").unwrap(), "none");
        assert!(device.set("nonsense", 1i32).await.is_err());
        device.kill().await;
    }

    #[tokio::test]
    async fn configuration_and_schema_slots() {
        let (device, client) = started("inproc://device-getters", "heater").await;
        let reply = client
            .request("heater", "slotGetConfiguration", Args::new())
            .wait_for_reply()
            .await
            .unwrap();
        let config = reply.get::<Hash>(0).unwrap();
        assert_eq!(reply.get::<String>(1).unwrap(), "heater");
        assert_eq!(config.get::<String>("classId").unwrap(), "Heater");
        assert_eq!(config.get::<String>("state").unwrap(), "OFF");
        assert!(Timestamp::present_in(config.attributes("target").unwrap()));

        let reply = client
            .request("heater", "slotGetSchema", crate::args![false])
            .wait_for_reply()
            .await
            .unwrap();
        let schema = Schema::from_hash("Heater", &reply.get::<Hash>(0).unwrap()).unwrap();
        assert!(schema.has("temperature"));
        device.kill().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_initialize_takes_device_offline() {
        struct Broken;
        struct BrokenHooks;

        #[async_trait]
        impl DeviceHooks for BrokenHooks {
            async fn initialize(&self, _device: &Device) -> KaraboResult<()> {
                Err(KaraboError::Config("no hardware".into()))
            }
        }

        impl DeviceFactory for Broken {
            fn class_id(&self) -> &'static str {
                "Broken"
            }
            fn expected_parameters(&self, _schema: &mut Schema) -> CoreResult<()> {
                Ok(())
            }
            fn build(&self, _device: &Device) -> KaraboResult<Arc<dyn DeviceHooks>> {
                Ok(Arc::new(BrokenHooks))
            }
        }

        let broker: Arc<dyn Broker> = Arc::new(InprocBroker::new("inproc://device-broken", "test"));
        let device = Device::create(&Broken, &hash! { "_deviceId_" => "b1" }, broker, &DeviceOptions::default())
            .unwrap();
        let err = device.start().await.unwrap_err();
        assert!(matches!(err, KaraboError::DeviceInit { .. }));
        assert!(!device.endpoint().is_running());
        assert!(logs_contain("initialization failed"));
    }

    #[tokio::test]
    async fn persisted_configuration_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let options = DeviceOptions {
            persist_dir: Some(dir.path().to_path_buf()),
            ..DeviceOptions::default()
        };
        let broker: Arc<dyn Broker> = Arc::new(InprocBroker::new("inproc://device-persist", "test"));
        let config = hash! { "_deviceId_" => "p1" };

        let device = Device::create(&Heater, &config, broker.clone(), &options).unwrap();
        device.start().await.unwrap();
        device
            .reconfigure(hash! { "speed" => 4.5f64, "lockedBy" => "alice" }, "alice")
            .await
            .unwrap();
        device.kill().await;

        let device = Device::create(&Heater, &config, broker, &options).unwrap();
        assert_eq!(device.get::<f64>("speed").unwrap(), 4.5);
        assert_eq!(device.locked_by(), "");
    }
}
