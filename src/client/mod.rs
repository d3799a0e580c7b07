//! Client side of the device runtime.
//!
//! [`DeviceClient`] is an endpoint of its own that talks to servers and
//! devices through their slots and keeps a view of the topology from
//! presence messages. [`Proxy`] mirrors one device: its schema and
//! configuration are fetched once and then kept current from
//! `signalChanged`/`signalStateChanged`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use karabo::broker::InprocBroker;
//! use karabo::client::DeviceClient;
//! use karabo_core::{Hash, Value};
//!
//! # tokio_test::block_on(async {
//! let client = DeviceClient::connect(Arc::new(InprocBroker::new("inproc://demo", "karabo"))).await?;
//! let id = client.instantiate("S1", "PropertyTest", "d1", Hash::new()).await?;
//! let proxy = client.proxy(&id).await?;
//! proxy.set("int32Property", 5i32).await?;
//! proxy.wait_until("int32Property", |v| v == &Value::Int32(5), Duration::from_secs(1)).await?;
//! # Ok::<(), karabo::KaraboError>(())
//! # });
//! ```

mod proxy;

pub use proxy::Proxy;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use karabo_core::{FromValue, Hash, Schema, Value};
use parking_lot::Mutex;

use crate::broker::Broker;
use crate::device::DEFAULT_KILL_GRACE;
use crate::error::{KaraboError, KaraboResult};
use crate::signal_slot::{base_info, handler, Args, SignalSlotable, SlotMode};

use proxy::ProxyState;

const SLOT_CHANGED: &str = "slotChanged";
const SLOT_SCHEMA_UPDATED: &str = "slotSchemaUpdated";

/// How often [`DeviceClient::wait_for_device`] pings.
const WAIT_POLL: Duration = Duration::from_millis(100);

pub(crate) struct ClientInner {
    endpoint: SignalSlotable,
    proxies: Mutex<HashMap<String, Weak<ProxyState>>>,
}

/// Remote control of servers and devices. Cheap to clone.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<ClientInner>,
}

impl DeviceClient {
    /// Create a client with a generated instance id and go online.
    pub async fn connect(broker: Arc<dyn Broker>) -> KaraboResult<Self> {
        let host = host_name();
        let short = host.split('.').next().unwrap_or(&host).to_string();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{short}_DeviceClient_{}_{}", std::process::id(), &suffix[..8]);
        Self::with_id(&id, broker).await
    }

    /// Create a client named `instance_id` and go online.
    pub async fn with_id(instance_id: &str, broker: Arc<dyn Broker>) -> KaraboResult<Self> {
        let endpoint = SignalSlotable::new(instance_id, base_info("client", &host_name()), broker);
        let client = Self {
            inner: Arc::new(ClientInner {
                endpoint,
                proxies: Mutex::new(HashMap::new()),
            }),
        };
        client.register_slots();
        client.inner.endpoint.start().await?;
        client.inner.endpoint.discover().await?;
        Ok(client)
    }

    /// Messaging endpoint of the client.
    pub fn endpoint(&self) -> &SignalSlotable {
        &self.inner.endpoint
    }

    /// Go offline. Proxies stop receiving updates.
    pub async fn close(&self) {
        self.inner.proxies.lock().clear();
        self.inner.endpoint.stop().await;
    }

    fn register_slots(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.endpoint.register_slot_with(
            SLOT_CHANGED,
            SlotMode::Ordered,
            handler(move |args, _ctx| {
                let weak = weak.clone();
                async move {
                    let delta = args.get::<Hash>(0)?;
                    let device_id = args.get::<String>(1)?;
                    if let Some(state) = weak.upgrade().and_then(|c| proxy_state(&c, &device_id)) {
                        state.apply(&delta);
                    }
                    Ok(Args::new())
                }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner.endpoint.register_slot_with(
            SLOT_SCHEMA_UPDATED,
            SlotMode::Ordered,
            handler(move |args, _ctx| {
                let weak = weak.clone();
                async move {
                    let schema = args.get::<Hash>(0)?;
                    let device_id = args.get::<String>(1)?;
                    if let Some(state) = weak.upgrade().and_then(|c| proxy_state(&c, &device_id)) {
                        state.replace_schema(Schema::from_hash(device_id.as_str(), &schema)?);
                    }
                    Ok(Args::new())
                }
            }),
        );
    }

    // =========================================================================
    // Topology
    // =========================================================================

    fn instances_of(&self, instance_type: &str) -> Vec<(String, Hash)> {
        let mut found: Vec<(String, Hash)> = self
            .inner
            .endpoint
            .known_instances()
            .into_iter()
            .filter(|(_, info)| info.get::<String>("type").is_ok_and(|t| t == instance_type))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Ids of the known servers.
    pub fn servers(&self) -> Vec<String> {
        self.instances_of("server").into_iter().map(|(id, _)| id).collect()
    }

    /// Ids of the known devices.
    pub fn devices(&self) -> Vec<String> {
        self.instances_of("device").into_iter().map(|(id, _)| id).collect()
    }

    /// Ids of the known devices hosted by `server_id`.
    pub fn devices_of(&self, server_id: &str) -> Vec<String> {
        self.instances_of("device")
            .into_iter()
            .filter(|(_, info)| info.get::<String>("serverId").is_ok_and(|s| s == server_id))
            .map(|(id, _)| id)
            .collect()
    }

    /// Classes announced by `server_id`.
    pub fn classes(&self, server_id: &str) -> Vec<String> {
        self.inner
            .endpoint
            .instance_info(server_id)
            .and_then(|info| info.get::<Vec<String>>("deviceClasses").ok())
            .unwrap_or_default()
    }

    /// Wait until `device_id` answers a ping.
    pub async fn wait_for_device(&self, device_id: &str, timeout: Duration) -> KaraboResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KaraboError::RequestTimeout {
                    target: device_id.to_string(),
                    slot: "slotPing".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            if self
                .inner
                .endpoint
                .ping(device_id, remaining.min(WAIT_POLL))
                .await?
                .is_some()
            {
                return Ok(());
            }
        }
    }

    // =========================================================================
    // Servers
    // =========================================================================

    /// Start `class_id` as `device_id` on `server_id`; returns the id the
    /// server assigned. An empty `device_id` lets the server pick one.
    pub async fn instantiate(
        &self,
        server_id: &str,
        class_id: &str,
        device_id: &str,
        configuration: Hash,
    ) -> KaraboResult<String> {
        let mut request = Hash::new();
        request.set("classId", class_id);
        if !device_id.is_empty() {
            request.set("deviceId", device_id);
        }
        request.set("configuration", configuration);
        let reply = self
            .inner
            .endpoint
            .request(server_id, "slotStartDevice", crate::args![request])
            .wait_for_reply()
            .await?;
        let text = reply.get::<String>(1)?;
        if reply.get::<bool>(0)? {
            Ok(text)
        } else {
            Err(KaraboError::remote(text, ""))
        }
    }

    /// Shut `device_id` down through its server, which aborts the device if
    /// it overruns the kill grace. Devices without a known server are asked
    /// directly.
    pub async fn kill_device(&self, device_id: &str) -> KaraboResult<()> {
        let endpoint = &self.inner.endpoint;
        let server_id = endpoint
            .instance_info(device_id)
            .and_then(|info| info.get::<String>("serverId").ok())
            .filter(|id| endpoint.instance_info(id).is_some());
        let Some(server_id) = server_id else {
            endpoint
                .request(device_id, "slotKillDevice", Args::new())
                .timeout(endpoint.default_timeout() + DEFAULT_KILL_GRACE)
                .wait_for_reply()
                .await?;
            return Ok(());
        };
        let grace = endpoint
            .instance_info(&server_id)
            .and_then(|info| info.get_as::<u64>("killGraceSecs").ok())
            .map_or(DEFAULT_KILL_GRACE, Duration::from_secs);
        endpoint
            .request(&server_id, "slotKillDevice", crate::args![device_id])
            .timeout(endpoint.default_timeout() + grace)
            .wait_for_reply()
            .await?;
        Ok(())
    }

    /// Ask `server_id` to kill its devices and exit.
    pub async fn kill_server(&self, server_id: &str) -> KaraboResult<()> {
        self.inner
            .endpoint
            .request(server_id, "slotKillServer", Args::new())
            .wait_for_reply()
            .await?;
        Ok(())
    }

    /// Schema of `class_id` as offered by `server_id`.
    pub async fn get_class_schema(&self, server_id: &str, class_id: &str) -> KaraboResult<Schema> {
        let reply = self
            .inner
            .endpoint
            .request(server_id, "slotGetClassSchema", crate::args![class_id])
            .wait_for_reply()
            .await?;
        Ok(Schema::from_hash(class_id, &reply.get::<Hash>(0)?)?)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Full configuration of `device_id`.
    pub async fn get_configuration(&self, device_id: &str) -> KaraboResult<Hash> {
        self.inner
            .endpoint
            .request(device_id, "slotGetConfiguration", Args::new())
            .wait_for_reply()
            .await?
            .get::<Hash>(0)
    }

    /// Full schema of `device_id`.
    pub async fn get_schema(&self, device_id: &str) -> KaraboResult<Schema> {
        let reply = self
            .inner
            .endpoint
            .request(device_id, "slotGetSchema", crate::args![false])
            .wait_for_reply()
            .await?;
        Ok(Schema::from_hash(device_id, &reply.get::<Hash>(0)?)?)
    }

    /// One property of `device_id`, read from a fresh configuration.
    pub async fn get<T: FromValue>(&self, device_id: &str, path: &str) -> KaraboResult<T> {
        Ok(self.get_configuration(device_id).await?.get_as::<T>(path)?)
    }

    /// Reconfigure one property of `device_id`.
    pub async fn set(&self, device_id: &str, path: &str, value: impl Into<Value>) -> KaraboResult<()> {
        let mut delta = Hash::new();
        delta.set(path, value);
        self.set_hash(device_id, delta).await
    }

    /// Reconfigure several properties of `device_id` at once.
    pub async fn set_hash(&self, device_id: &str, delta: Hash) -> KaraboResult<()> {
        self.inner
            .endpoint
            .request(device_id, "slotReconfigure", crate::args![delta])
            .wait_for_reply()
            .await?;
        Ok(())
    }

    /// Call `slot` of `device_id` and wait for it to finish.
    pub async fn execute(&self, device_id: &str, slot: &str, args: Args) -> KaraboResult<Args> {
        self.inner.endpoint.request(device_id, slot, args).wait_for_reply().await
    }

    /// Proxy of `device_id`, shared with other callers while any is alive.
    pub async fn proxy(&self, device_id: &str) -> KaraboResult<Proxy> {
        if let Some(state) = proxy_state(&self.inner, device_id) {
            return Ok(Proxy::new(state, Arc::downgrade(&self.inner)));
        }

        let ep = &self.inner.endpoint;
        let me = ep.instance_id().to_string();
        ep.connect(device_id, crate::device::SIGNAL_CHANGED, &me, SLOT_CHANGED).await?;
        ep.connect(device_id, crate::device::SIGNAL_STATE_CHANGED, &me, SLOT_CHANGED).await?;
        ep.connect(device_id, crate::device::SIGNAL_SCHEMA_UPDATED, &me, SLOT_SCHEMA_UPDATED)
            .await?;

        let schema = self.get_schema(device_id).await?;
        let configuration = self.get_configuration(device_id).await?;
        let state = {
            let mut proxies = self.inner.proxies.lock();
            match proxies.get(device_id).and_then(Weak::upgrade) {
                Some(state) => state,
                None => {
                    let state = Arc::new(ProxyState::new(device_id, schema, configuration));
                    proxies.insert(device_id.to_string(), Arc::downgrade(&state));
                    state
                }
            }
        };
        Ok(Proxy::new(state, Arc::downgrade(&self.inner)))
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn proxy_state(inner: &ClientInner, device_id: &str) -> Option<Arc<ProxyState>> {
    let mut proxies = inner.proxies.lock();
    match proxies.get(device_id).map(Weak::upgrade) {
        Some(Some(state)) => Some(state),
        Some(None) => {
            proxies.remove(device_id);
            None
        }
        None => None,
    }
}

/// Undo the signal connections of a proxy that is no longer used.
async fn release(inner: Arc<ClientInner>, device_id: String) {
    let ep = &inner.endpoint;
    let me = ep.instance_id().to_string();
    for (signal, slot) in [
        (crate::device::SIGNAL_CHANGED, SLOT_CHANGED),
        (crate::device::SIGNAL_STATE_CHANGED, SLOT_CHANGED),
        (crate::device::SIGNAL_SCHEMA_UPDATED, SLOT_SCHEMA_UPDATED),
    ] {
        if let Err(e) = ep.disconnect(&device_id, signal, &me, slot).await {
            tracing::debug!(%device_id, signal, error = %e, "could not disconnect proxy");
        }
    }
}
