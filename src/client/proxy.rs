//! Cached view of one remote device.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use karabo_core::{FromValue, Hash, MergePolicy, Schema, State, Value};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use super::{release, ClientInner};
use crate::error::{KaraboError, KaraboResult};
use crate::signal_slot::Args;

/// Shared between all [`Proxy`] clones of one device.
pub(crate) struct ProxyState {
    device_id: String,
    schema: RwLock<Schema>,
    configuration: RwLock<Hash>,
    watchers: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
    client: Mutex<Weak<ClientInner>>,
}

impl ProxyState {
    pub(crate) fn new(device_id: &str, schema: Schema, configuration: Hash) -> Self {
        Self {
            device_id: device_id.to_string(),
            schema: RwLock::new(schema),
            configuration: RwLock::new(configuration),
            watchers: Mutex::new(HashMap::new()),
            client: Mutex::new(Weak::new()),
        }
    }

    /// Merge a change set pushed by the device.
    pub(crate) fn apply(&self, delta: &Hash) {
        let snapshot = {
            let mut config = self.configuration.write();
            config.merge(delta, MergePolicy::Merge);
            config.clone()
        };
        let mut watchers = self.watchers.lock();
        watchers.retain(|_, tx| !tx.is_closed());
        for (path, tx) in watchers.iter() {
            let current = snapshot.get_value(path).ok().cloned();
            tx.send_if_modified(|seen| {
                if *seen == current {
                    false
                } else {
                    *seen = current;
                    true
                }
            });
        }
    }

    pub(crate) fn replace_schema(&self, schema: Schema) {
        tracing::debug!(device_id = %self.device_id, "proxy schema replaced");
        *self.schema.write() = schema;
    }
}

impl Drop for ProxyState {
    fn drop(&mut self) {
        let Some(client) = self.client.get_mut().upgrade() else {
            return;
        };
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(release(client, std::mem::take(&mut self.device_id)));
        }
    }
}

/// Local stand-in for a device.
///
/// Reads are served from the cache, writes and slot calls go to the device.
/// The proxy only holds a weak link to its client; once the client is gone
/// the cache freezes and remote operations fail with `Cancelled`.
#[derive(Clone)]
pub struct Proxy {
    state: Arc<ProxyState>,
    client: Weak<ClientInner>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("device_id", &self.state.device_id)
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(state: Arc<ProxyState>, client: Weak<ClientInner>) -> Self {
        *state.client.lock() = client.clone();
        Self { state, client }
    }

    fn client(&self) -> KaraboResult<Arc<ClientInner>> {
        self.client
            .upgrade()
            .ok_or_else(|| KaraboError::Cancelled(format!("client of {} is gone", self.state.device_id)))
    }

    /// Id of the mirrored device.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.state.device_id
    }

    /// Cached schema.
    #[must_use]
    pub fn schema(&self) -> Schema {
        self.state.schema.read().clone()
    }

    /// Cached configuration.
    #[must_use]
    pub fn configuration(&self) -> Hash {
        self.state.configuration.read().clone()
    }

    /// Cached value at `path`.
    pub fn get<T: FromValue>(&self, path: &str) -> KaraboResult<T> {
        Ok(self.state.configuration.read().get_as::<T>(path)?)
    }

    /// Cached device state.
    #[must_use]
    pub fn state(&self) -> State {
        self.get::<String>("state")
            .ok()
            .and_then(|name| State::from_name(&name))
            .unwrap_or(State::UNKNOWN)
    }

    /// Reconfigure one property on the device.
    pub async fn set(&self, path: &str, value: impl Into<Value>) -> KaraboResult<()> {
        let mut delta = Hash::new();
        delta.set(path, value);
        self.set_hash(delta).await
    }

    /// Reconfigure several properties on the device at once.
    pub async fn set_hash(&self, delta: Hash) -> KaraboResult<()> {
        let client = self.client()?;
        client
            .endpoint
            .request(&self.state.device_id, "slotReconfigure", crate::args![delta])
            .wait_for_reply()
            .await?;
        Ok(())
    }

    /// Call `slot` on the device and wait for it to finish.
    pub async fn execute(&self, slot: &str, args: Args) -> KaraboResult<Args> {
        let client = self.client()?;
        client
            .endpoint
            .request(&self.state.device_id, slot, args)
            .wait_for_reply()
            .await
    }

    /// Receiver that sees every change of the value at `path`.
    ///
    /// `None` while the path is absent from the configuration.
    pub fn watch(&self, path: &str) -> watch::Receiver<Option<Value>> {
        let mut watchers = self.state.watchers.lock();
        if let Some(tx) = watchers.get(path) {
            return tx.subscribe();
        }
        let current = self.state.configuration.read().get_value(path).ok().cloned();
        let (tx, rx) = watch::channel(current);
        watchers.insert(path.to_string(), tx);
        rx
    }

    /// Wait until the value at `path` satisfies `pred`.
    pub async fn wait_until<F>(&self, path: &str, pred: F, timeout: Duration) -> KaraboResult<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let mut rx = self.watch(path);
        let wait = async {
            loop {
                if let Some(value) = rx.borrow_and_update().as_ref().filter(|&v| pred(v)) {
                    return Ok(value.clone());
                }
                if rx.changed().await.is_err() {
                    return Err(KaraboError::Cancelled("proxy dropped".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| KaraboError::RequestTimeout {
                target: self.state.device_id.clone(),
                slot: path.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Refetch schema and configuration from the device.
    pub async fn refresh(&self) -> KaraboResult<()> {
        let client = self.client()?;
        let reply = client
            .endpoint
            .request(&self.state.device_id, "slotGetSchema", crate::args![false])
            .wait_for_reply()
            .await?;
        let schema = Schema::from_hash(self.state.device_id.as_str(), &reply.get::<Hash>(0)?)?;
        self.state.replace_schema(schema);
        let configuration = client
            .endpoint
            .request(&self.state.device_id, "slotGetConfiguration", Args::new())
            .wait_for_reply()
            .await?
            .get::<Hash>(0)?;
        self.state.apply(&configuration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_core::Schema;

    fn state() -> Arc<ProxyState> {
        let mut config = Hash::new();
        config.set("a", 1i32);
        Arc::new(ProxyState::new("dev", Schema::new("dev"), config))
    }

    #[tokio::test]
    async fn watchers_see_only_changes_of_their_path() {
        let proxy = Proxy::new(state(), Weak::new());
        let mut rx = proxy.watch("a");
        assert_eq!(*rx.borrow_and_update(), Some(Value::Int32(1)));

        let mut other = Hash::new();
        other.set("b", 2i32);
        proxy.state.apply(&other);
        assert!(!rx.has_changed().unwrap());

        let mut delta = Hash::new();
        delta.set("a", 3i32);
        proxy.state.apply(&delta);
        assert!(rx.has_changed().unwrap());
        assert_eq!(proxy.get::<i32>("a").unwrap(), 3);
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let proxy = Proxy::new(state(), Weak::new());
        let err = proxy
            .wait_until("a", |v| v == &Value::Int32(9), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::RequestTimeout { .. }));
    }

    #[tokio::test]
    async fn remote_calls_fail_without_client() {
        let proxy = Proxy::new(state(), Weak::new());
        assert!(matches!(proxy.set("a", 2i32).await, Err(KaraboError::Cancelled(_))));
    }
}
