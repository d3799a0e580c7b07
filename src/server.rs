//! Device server: hosts device instances of one plugin namespace.
//!
//! A server is itself an instance on the bus (`info.type = "server"`) and
//! offers
//!
//! | slot | arguments | reply |
//! |---|---|---|
//! | `slotStartDevice` | `{classId, deviceId?, configuration}` | `(ok, deviceId \| reason)` |
//! | `slotKillDevice` | `deviceId` | `()` |
//! | `slotKillServer` | | `()` |
//! | `slotGetClassSchema` | `classId` | `(schema, classId, serverId)` |
//! | `slotTimeTick` | `tid, sec, frac, period_us` | |
//! | `slotGetTime` | | `Hash` |
//! | `slotLoggerPriority` | `level` | |
//!
//! Devices are killed in reverse start order when the server shuts down.
//! A device that does not finish `kill` within the grace is aborted and the
//! failure logged as an uncancelled shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use karabo_core::{json, Hash, TimeMixin, Timestamp};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::broker::{Broker, BrokerStatus};
use crate::config::ServerConfig;
use crate::device::{Device, DeviceClasses, DeviceOptions};
use crate::error::{KaraboError, KaraboResult};
use crate::event_loop::scoped;
use crate::logging;
use crate::signal_slot::{base_info, handler, Args, InstanceEvent, SignalSlotable, SlotMode};

/// Why a server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `slotKillServer` or a local request.
    Requested,
    /// The broker connection could not be re-established.
    BrokerLost,
}

struct ServerInner {
    server_id: String,
    host: String,
    config: ServerConfig,
    classes: DeviceClasses,
    endpoint: SignalSlotable,
    devices: Mutex<Vec<Device>>,
    starting: Mutex<HashSet<String>>,
    id_counters: Mutex<HashMap<String, u32>>,
    stopped: watch::Sender<Option<ShutdownReason>>,
}

/// A running device server. Cheap to clone.
#[derive(Clone)]
pub struct DeviceServer {
    inner: Arc<ServerInner>,
}

/// Releases a device id reserved for instantiation.
struct Reservation<'a> {
    starting: &'a Mutex<HashSet<String>>,
    device_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting.lock().remove(&self.device_id);
    }
}

impl DeviceServer {
    /// Server for `config` offering `classes` on `broker`. Nothing is sent
    /// before [`start`](Self::start).
    pub fn new(config: &ServerConfig, classes: DeviceClasses, broker: Arc<dyn Broker>) -> Self {
        let server_id = config.resolved_server_id();
        let host = config.host_name();

        let mut info = base_info("server", &host);
        info.set("serverId", server_id.as_str());
        info.set("deviceClasses", classes.class_ids());
        info.set("pluginNamespace", classes.namespace());
        info.set("killGraceSecs", config.kill_grace_secs);
        let endpoint = SignalSlotable::new(server_id.clone(), info, broker);
        endpoint.set_heartbeat_interval(config.heartbeat_interval_secs);
        endpoint.set_default_timeout(Duration::from_millis(config.request_timeout_ms));

        let (stopped, _) = watch::channel(None);
        Self {
            inner: Arc::new(ServerInner {
                server_id,
                host,
                config: config.clone(),
                classes,
                endpoint,
                devices: Mutex::new(Vec::new()),
                starting: Mutex::new(HashSet::new()),
                id_counters: Mutex::new(HashMap::new()),
                stopped,
            }),
        }
    }

    /// Server instance id.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Messaging endpoint of the server.
    pub fn endpoint(&self) -> &SignalSlotable {
        &self.inner.endpoint
    }

    /// Classes this server can instantiate.
    pub fn classes(&self) -> &DeviceClasses {
        &self.inner.classes
    }

    /// Ids of the hosted devices in start order.
    pub fn devices(&self) -> Vec<String> {
        self.inner
            .devices
            .lock()
            .iter()
            .filter(|d| !d.is_killed())
            .map(|d| d.device_id().to_string())
            .collect()
    }

    /// Hosted device `device_id`.
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.inner
            .devices
            .lock()
            .iter()
            .find(|d| d.device_id() == device_id && !d.is_killed())
            .cloned()
    }

    /// Resolves once the server stopped, with the reason.
    pub async fn stopped(&self) -> ShutdownReason {
        let mut rx = self.inner.stopped.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::Requested;
            }
        }
    }

    /// Go online and instantiate the devices of the `init` configuration.
    pub async fn start(&self) -> KaraboResult<()> {
        self.register_slots();
        self.inner.endpoint.start().await?;
        self.watch_topology();
        self.watch_broker();
        tracing::info!(
            server_id = %self.server_id(),
            namespace = %self.inner.classes.namespace(),
            classes = ?self.inner.classes.class_ids(),
            "device server started"
        );

        if let Some(init) = self.inner.config.init.clone() {
            self.autostart(&init).await?;
        }
        Ok(())
    }

    async fn autostart(&self, init: &str) -> KaraboResult<()> {
        let devices = json::from_json_str(init)?;
        for node in devices.iter() {
            let Some(config) = node.value().as_hash() else {
                tracing::warn!(device_id = %node.key(), "init entry is not an object, skipped");
                continue;
            };
            let mut request = Hash::new();
            let mut configuration = config.clone();
            if let Ok(class_id) = config.get::<String>("classId") {
                request.set("classId", class_id);
            }
            configuration.erase("classId");
            request.set("deviceId", node.key());
            request.set("configuration", configuration);
            match self.start_device(&request).await {
                Ok(id) => tracing::info!(device_id = %id, "started from init"),
                Err(e) => tracing::error!(device_id = %node.key(), error = %e, "could not start from init"),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Instantiate a device from `{classId, deviceId?, configuration}`.
    ///
    /// Without `configuration` the remaining keys of `request` are used.
    /// Returns the device id.
    pub async fn start_device(&self, request: &Hash) -> KaraboResult<String> {
        let class_id = request
            .get::<String>("classId")
            .map_err(|_| KaraboError::Config("No classId given".into()))?;
        let factory = self
            .inner
            .classes
            .get(&class_id)
            .ok_or_else(|| KaraboError::Config(format!("Unknown class \"{class_id}\"")))?;

        let mut configuration = match request.get_hash("configuration") {
            Ok(c) => c.clone(),
            Err(_) => {
                let mut rest = request.clone();
                rest.erase("classId");
                rest.erase("deviceId");
                rest
            }
        };
        let device_id = match request.get::<String>("deviceId") {
            Ok(id) if !id.is_empty() => id,
            _ => self.generate_id(&class_id),
        };

        let _reservation = self.reserve(&device_id)?;
        self.inner
            .endpoint
            .ensure_absent(&device_id, Duration::from_millis(self.inner.config.instance_check_timeout_ms))
            .await?;

        configuration.set("_deviceId_", device_id.as_str());
        configuration.set("_serverId_", self.server_id());
        if !configuration.has("hostName") {
            configuration.set("hostName", self.inner.host.as_str());
        }

        let options = DeviceOptions {
            server_id: self.server_id().to_string(),
            host: self.inner.host.clone(),
            persist_dir: self.inner.config.persist_dir.clone(),
            request_timeout: Duration::from_millis(self.inner.config.request_timeout_ms),
            kill_grace: self.kill_grace(),
        };
        let device = Device::create(
            factory.as_ref(),
            &configuration,
            self.inner.endpoint.broker().clone(),
            &options,
        )?;
        device.start().await?;
        self.inner.devices.lock().push(device);
        tracing::info!(server_id = %self.server_id(), %device_id, %class_id, "device instantiated");
        Ok(device_id)
    }

    fn reserve(&self, device_id: &str) -> KaraboResult<Reservation<'_>> {
        let hosted = self.device(device_id).is_some();
        let mut starting = self.inner.starting.lock();
        if hosted || !starting.insert(device_id.to_string()) {
            return Err(KaraboError::InstanceExists(device_id.to_string()));
        }
        Ok(Reservation {
            starting: &self.inner.starting,
            device_id: device_id.to_string(),
        })
    }

    fn generate_id(&self, class_id: &str) -> String {
        let mut counters = self.inner.id_counters.lock();
        loop {
            let n = counters.entry(class_id.to_string()).or_insert(0);
            *n += 1;
            let candidate = format!("{}_{class_id}_{n}", self.server_id());
            if self.device(&candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Kill a hosted device, aborting it if it overruns the grace.
    pub async fn kill_device(&self, device_id: &str) -> KaraboResult<()> {
        let device = {
            let mut devices = self.inner.devices.lock();
            let index = devices
                .iter()
                .position(|d| d.device_id() == device_id)
                .ok_or_else(|| KaraboError::Config(format!("Device \"{device_id}\" is not hosted by this server")))?;
            devices.remove(index)
        };
        device.kill_with_grace(self.kill_grace()).await
    }

    fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.inner.config.kill_grace_secs)
    }

    /// Kill every device, newest first, and go offline.
    pub async fn shutdown(&self) {
        self.stop_with(ShutdownReason::Requested).await;
    }

    async fn stop_with(&self, reason: ShutdownReason) {
        if self.inner.stopped.borrow().is_some() {
            return;
        }
        tracing::info!(server_id = %self.server_id(), ?reason, "device server shutting down");
        loop {
            let next = self.inner.devices.lock().pop();
            let Some(device) = next else {
                break;
            };
            // Overruns are logged inside.
            let _ = device.kill_with_grace(self.kill_grace()).await;
        }
        self.inner.endpoint.stop().await;
        self.inner.stopped.send_replace(Some(reason));
    }

    // =========================================================================
    // Slots
    // =========================================================================

    fn register_slots(&self) {
        let ep = &self.inner.endpoint;

        let server = self.clone();
        ep.register_slot_with(
            "slotStartDevice",
            SlotMode::Concurrent,
            handler(move |args, _ctx| {
                let server = server.clone();
                async move {
                    let request = args.get::<Hash>(0)?;
                    Ok(match server.start_device(&request).await {
                        Ok(id) => crate::args![true, id],
                        Err(e) => {
                            tracing::warn!(server_id = %server.server_id(), error = %e, "slotStartDevice failed");
                            crate::args![false, e.to_string()]
                        }
                    })
                }
            }),
        );

        let server = self.clone();
        ep.register_slot_with(
            "slotKillDevice",
            SlotMode::Concurrent,
            handler(move |args, _ctx| {
                let server = server.clone();
                async move {
                    server.kill_device(&args.get::<String>(0)?).await?;
                    Ok(Args::new())
                }
            }),
        );

        let server = self.clone();
        ep.register_slot_with(
            "slotKillServer",
            SlotMode::Concurrent,
            handler(move |_args, ctx| {
                let server = server.clone();
                async move {
                    tracing::info!(server_id = %server.server_id(), sender = %ctx.sender, "kill requested");
                    // The reply goes out before the endpoint is stopped.
                    tokio::spawn(async move { server.shutdown().await });
                    Ok(Args::new())
                }
            }),
        );

        let server = self.clone();
        ep.register_slot_with(
            "slotGetClassSchema",
            SlotMode::Concurrent,
            handler(move |args, _ctx| {
                let server = server.clone();
                async move {
                    let class_id = args.get::<String>(0)?;
                    let schema = server.inner.classes.schema(&class_id)?;
                    Ok(crate::args![schema.to_hash(), class_id, server.server_id()])
                }
            }),
        );

        ep.register_slot_with(
            "slotTimeTick",
            SlotMode::Inline,
            handler(|args, _ctx| async move {
                let tid = args.get::<u64>(0)?;
                let sec = args.get::<u64>(1)?;
                let frac = args.get::<u64>(2)?;
                let period = args.get::<u64>(3)?;
                TimeMixin::set_reference(tid, sec, frac, period);
                Ok(Args::new())
            }),
        );

        ep.register_slot_with(
            "slotGetTime",
            SlotMode::Concurrent,
            handler(|_args, _ctx| async move { Ok(crate::args![time_info()]) }),
        );

        let server_id = self.server_id().to_string();
        ep.register_slot_with(
            "slotLoggerPriority",
            SlotMode::Ordered,
            handler(move |args, _ctx| {
                let server_id = server_id.clone();
                async move {
                    let level = args.get::<String>(0)?;
                    logging::set_level(&level)?;
                    tracing::info!(%server_id, %level, "log level changed");
                    Ok(Args::new())
                }
            }),
        );
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// Forget devices that went away on their own.
    fn watch_topology(&self) {
        let mut events = self.inner.endpoint.instance_events();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(scoped(self.server_id().to_string(), async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                };
                let InstanceEvent::Gone { instance_id, .. } = event else {
                    continue;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut devices = inner.devices.lock();
                let before = devices.len();
                devices.retain(|d| d.device_id() != instance_id);
                if devices.len() != before {
                    tracing::info!(server_id = %inner.server_id, device_id = %instance_id, "device gone");
                }
            }
        }));
        self.inner.endpoint.adopt_task(task);
    }

    /// Stop everything if the broker is lost for good.
    fn watch_broker(&self) {
        let mut status = self.inner.endpoint.broker().status();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if *status.borrow_and_update() != BrokerStatus::Failed {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tracing::error!(server_id = %inner.server_id, "broker lost, shutting down");
                let server = DeviceServer { inner };
                tokio::spawn(async move { server.stop_with(ShutdownReason::BrokerLost).await });
                return;
            }
        });
        self.inner.endpoint.adopt_task(task);
    }
}

/// Current time with train id and the last timing reference.
fn time_info() -> Hash {
    let mut info = Hash::new();
    let node = info.set("time", true);
    Timestamp::now().to_attributes(node.attributes_mut());

    let reference = TimeMixin::reference();
    let node = info.set("reference", true);
    node.set_attribute("sec", reference.epoch.sec());
    node.set_attribute("frac", reference.epoch.frac());
    node.set_attribute("tid", reference.tid);
    info.set("periodUs", reference.period_us);
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InprocBroker;
    use crate::device::{DeviceFactory, DeviceHooks};
    use async_trait::async_trait;
    use karabo_core::{hash, CoreResult, Schema};
    use tracing_test::traced_test;

    struct Stubborn;
    struct StubbornHooks;

    #[async_trait]
    impl DeviceHooks for StubbornHooks {
        async fn pre_destruction(&self, _device: &Device) {
            std::future::pending::<()>().await;
        }
    }

    impl DeviceFactory for Stubborn {
        fn class_id(&self) -> &'static str {
            "Stubborn"
        }
        fn expected_parameters(&self, _schema: &mut Schema) -> CoreResult<()> {
            Ok(())
        }
        fn build(&self, _device: &Device) -> KaraboResult<Arc<dyn DeviceHooks>> {
            Ok(Arc::new(StubbornHooks))
        }
    }

    async fn stubborn_server(url: &str) -> (DeviceServer, SignalSlotable) {
        let broker: Arc<dyn Broker> = Arc::new(InprocBroker::new(url, "test"));
        let mut classes = DeviceClasses::new("test");
        classes.register(Arc::new(Stubborn)).unwrap();
        let config = ServerConfig {
            kill_grace_secs: 1,
            ..config("S6")
        };
        let server = DeviceServer::new(&config, classes, broker.clone());
        server.start().await.unwrap();
        server
            .start_device(&hash! { "classId" => "Stubborn", "deviceId" => "h1" })
            .await
            .unwrap();
        let caller = SignalSlotable::new("caller", base_info("client", "h"), broker);
        caller.start().await.unwrap();
        (server, caller)
    }

    fn config(server_id: &str) -> ServerConfig {
        ServerConfig {
            server_id: Some(server_id.to_string()),
            instance_check_timeout_ms: 100,
            ..ServerConfig::default()
        }
    }

    async fn server(url: &str, server_id: &str) -> DeviceServer {
        let broker: Arc<dyn Broker> = Arc::new(InprocBroker::new(url, "test"));
        let classes = DeviceClasses::for_namespace("karabo.devices").unwrap();
        let server = DeviceServer::new(&config(server_id), classes, broker);
        server.start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn generated_ids_follow_server_and_class() {
        let server = server("inproc://server-ids", "S9").await;
        let id = server
            .start_device(&hash! { "classId" => "PropertyTest", "configuration" => Hash::new() })
            .await
            .unwrap();
        assert_eq!(id, "S9_PropertyTest_1");
        let id = server.start_device(&hash! { "classId" => "PropertyTest" }).await.unwrap();
        assert_eq!(id, "S9_PropertyTest_2");
        assert_eq!(server.devices(), vec!["S9_PropertyTest_1", "S9_PropertyTest_2"]);
        server.shutdown().await;
        assert!(server.devices().is_empty());
        assert_eq!(server.stopped().await, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn unknown_class_is_rejected() {
        let server = server("inproc://server-unknown", "S8").await;
        let err = server.start_device(&hash! { "classId" => "Nope" }).await.unwrap_err();
        assert!(err.to_string().contains("Unknown class"));
        assert!(server.devices().is_empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn killed_device_leaves_the_list() {
        let server = server("inproc://server-kill", "S7").await;
        server
            .start_device(&hash! { "classId" => "PropertyTest", "deviceId" => "pt" })
            .await
            .unwrap();
        server.kill_device("pt").await.unwrap();
        assert!(server.devices().is_empty());
        assert!(server.kill_device("pt").await.is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn device_overrunning_the_grace_is_aborted() {
        let (server, caller) = stubborn_server("inproc://server-grace").await;
        let device = server.device("h1").unwrap();

        let started = std::time::Instant::now();
        let err = caller
            .request("S6", "slotKillDevice", crate::args!["h1"])
            .timeout(Duration::from_secs(5))
            .wait_for_reply()
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        match err {
            KaraboError::Remote { message, .. } => {
                assert_eq!(message, "Device 'h1' did not shut down within 1 s")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(server.devices().is_empty());
        assert!(device.is_killed());
        assert!(!device.endpoint().is_running());
        assert!(caller.ping("h1", Duration::from_millis(200)).await.unwrap().is_none());
        assert!(logs_contain("device aborted"));
        server.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn kill_sent_to_the_device_is_enforced_by_its_server() {
        let (server, caller) = stubborn_server("inproc://server-grace-forward").await;

        let err = caller
            .request("h1", "slotKillDevice", Args::new())
            .timeout(Duration::from_secs(8))
            .wait_for_reply()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::Remote { .. }), "{err}");
        assert!(server.devices().is_empty());
        assert!(caller.ping("h1", Duration::from_millis(200)).await.unwrap().is_none());
        assert!(logs_contain("device aborted"));
        server.shutdown().await;
    }

    #[test]
    fn time_info_carries_a_timestamp() {
        let info = time_info();
        assert!(Timestamp::present_in(info.attributes("time").unwrap()));
        assert!(info.has("reference"));
    }
}
