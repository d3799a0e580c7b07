//! Input side of a pipeline.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use karabo_core::Hash;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::wire::{self, Incoming};
use super::{
    split_channel_id, ChannelResolver, DataDistribution, MetaData, OnSlowness,
    DEFAULT_MAX_QUEUE_LENGTH,
};
use crate::error::{KaraboError, KaraboResult};
use crate::event_loop::{current_instance, scoped};
use crate::frame;

const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(2);

/// Called once per received item.
pub type DataHandler = Arc<dyn Fn(Hash, MetaData) -> BoxFuture<'static, ()> + Send + Sync>;
/// Called once per received chunk.
pub type BatchHandler = Arc<dyn Fn(InputBatch) -> BoxFuture<'static, ()> + Send + Sync>;
/// Called with an output id (end of stream, connect, close).
pub type EventHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callbacks of an input channel. Handlers of one input never overlap.
#[derive(Clone, Default)]
pub struct InputHandlers {
    /// Per item; ignored when `on_input` is set.
    pub on_data: Option<DataHandler>,
    /// Per chunk.
    pub on_input: Option<BatchHandler>,
    /// After every connected output signalled end of stream.
    pub on_eos: Option<EventHandler>,
    /// After a connection to an output was established.
    pub on_connect: Option<EventHandler>,
    /// After a connection to an output was lost.
    pub on_close: Option<EventHandler>,
}

impl InputHandlers {
    /// Per-item handler from an async closure.
    pub fn on_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Hash, MetaData) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_data = Some(Arc::new(move |h, m| Box::pin(f(h, m))));
        self
    }

    /// Per-chunk handler from an async closure.
    pub fn on_input<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InputBatch) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_input = Some(Arc::new(move |b| Box::pin(f(b))));
        self
    }

    /// End-of-stream handler from an async closure.
    pub fn on_eos<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_eos = Some(Arc::new(move |s| Box::pin(f(s))));
        self
    }
}

/// Items of one received chunk.
#[derive(Debug, Clone, Default)]
pub struct InputBatch {
    items: Vec<(Hash, MetaData)>,
}

impl InputBatch {
    /// Number of items.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Item `index`.
    pub fn read(&self, index: usize) -> Option<&Hash> {
        self.items.get(index).map(|(h, _)| h)
    }

    /// Metadata of item `index`.
    pub fn meta(&self, index: usize) -> Option<&MetaData> {
        self.items.get(index).map(|(_, m)| m)
    }

    /// All items with their metadata.
    pub fn iter(&self) -> impl Iterator<Item = &(Hash, MetaData)> {
        self.items.iter()
    }

    /// Consume into the items.
    pub fn into_items(self) -> Vec<(Hash, MetaData)> {
        self.items
    }
}

fn default_distribution() -> String {
    "copy".into()
}

fn default_slowness() -> String {
    "drop".into()
}

fn default_max_queue_length() -> u32 {
    DEFAULT_MAX_QUEUE_LENGTH
}

/// Input channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    /// Outputs as `deviceId:channelName`.
    #[serde(default)]
    pub connected_output_channels: Vec<String>,
    /// `copy` or `shared`.
    #[serde(default = "default_distribution")]
    pub data_distribution: String,
    /// `wait`, `drop`, `queue` or `queueDrop`.
    #[serde(default = "default_slowness")]
    pub on_slowness: String,
    /// Chunks an output may buffer for this input.
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: u32,
    /// Pause before asking for the next chunk.
    #[serde(default)]
    pub delay_on_input_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            connected_output_channels: Vec::new(),
            data_distribution: default_distribution(),
            on_slowness: default_slowness(),
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            delay_on_input_ms: 0,
        }
    }
}

impl InputConfig {
    /// Read from the channel node of a device configuration.
    pub fn from_hash(h: &Hash) -> Self {
        let d = Self::default();
        Self {
            connected_output_channels: h
                .get::<Vec<String>>("connectedOutputChannels")
                .unwrap_or(d.connected_output_channels),
            data_distribution: h.get::<String>("dataDistribution").unwrap_or(d.data_distribution),
            on_slowness: h.get::<String>("onSlowness").unwrap_or(d.on_slowness),
            max_queue_length: h.get_as::<u32>("maxQueueLength").unwrap_or(d.max_queue_length),
            delay_on_input_ms: h.get_as::<u64>("delayOnInput").unwrap_or(d.delay_on_input_ms),
        }
    }
}

struct InputInner {
    channel_id: String,
    distribution: DataDistribution,
    slowness: OnSlowness,
    max_queue_length: u32,
    delay: Duration,
    configured: Vec<String>,
    resolver: Arc<dyn ChannelResolver>,
    handlers: RwLock<InputHandlers>,
    handler_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    missing: Mutex<BTreeSet<String>>,
    connected: Mutex<HashSet<String>>,
    ended: Mutex<HashSet<String>>,
    schemas: Mutex<HashMap<String, (u32, Hash)>>,
}

/// A pipeline input. Cheap to clone.
#[derive(Clone)]
pub struct InputChannel {
    inner: Arc<InputInner>,
}

impl InputChannel {
    /// Input `channel_id` (`deviceId:channelName`) reading from the outputs of
    /// `config`, located through `resolver`.
    pub fn new(
        channel_id: impl Into<String>,
        config: &InputConfig,
        resolver: Arc<dyn ChannelResolver>,
    ) -> KaraboResult<Self> {
        for output in &config.connected_output_channels {
            split_channel_id(output)?;
        }
        Ok(Self {
            inner: Arc::new(InputInner {
                channel_id: channel_id.into(),
                distribution: config.data_distribution.parse()?,
                slowness: config.on_slowness.parse()?,
                max_queue_length: config.max_queue_length.max(1),
                delay: Duration::from_millis(config.delay_on_input_ms),
                configured: config.connected_output_channels.clone(),
                resolver,
                handlers: RwLock::new(InputHandlers::default()),
                handler_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(HashMap::new()),
                missing: Mutex::new(config.connected_output_channels.iter().cloned().collect()),
                connected: Mutex::new(HashSet::new()),
                ended: Mutex::new(HashSet::new()),
                schemas: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// `deviceId:channelName`.
    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// Install the callbacks; takes effect for the next message.
    pub fn set_handlers(&self, handlers: InputHandlers) {
        *self.inner.handlers.write() = handlers;
    }

    /// Start connecting to every configured output.
    pub fn connect(&self) {
        for output in self.inner.configured.clone() {
            self.connect_output(&output);
        }
    }

    /// Start (or keep) a connection to `output_id`.
    pub fn connect_output(&self, output_id: &str) {
        let mut tasks = self.inner.tasks.lock();
        if tasks.get(output_id).is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.missing.lock().insert(output_id.to_string());
        let instance = current_instance().unwrap_or_else(|| self.inner.channel_id.clone());
        let task = tokio::spawn(scoped(
            instance,
            run_connection(Arc::downgrade(&self.inner), output_id.to_string()),
        ));
        tasks.insert(output_id.to_string(), task);
    }

    /// Drop the connection to `output_id`.
    pub fn disconnect_output(&self, output_id: &str) {
        if let Some(task) = self.inner.tasks.lock().remove(output_id) {
            task.abort();
        }
        self.inner.missing.lock().remove(output_id);
        self.inner.connected.lock().remove(output_id);
        self.inner.ended.lock().remove(output_id);
    }

    /// Configured outputs that are not connected.
    pub fn missing_connections(&self) -> Vec<String> {
        self.inner.missing.lock().iter().cloned().collect()
    }

    /// Outputs currently connected.
    pub fn connected_outputs(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.connected.lock().iter().cloned().collect();
        out.sort();
        out
    }

    /// Latest schema announced by `output_id`.
    pub fn schema(&self, output_id: &str) -> Option<(u32, Hash)> {
        self.inner.schemas.lock().get(output_id).cloned()
    }

    /// Disconnect from all outputs.
    pub fn close(&self) {
        for (_, task) in self.inner.tasks.lock().drain() {
            task.abort();
        }
        self.inner.connected.lock().clear();
    }
}

impl Drop for InputInner {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

async fn run_connection(weak: Weak<InputInner>, output_id: String) {
    let mut backoff = RECONNECT_INITIAL;
    let mut reported = false;
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut established = false;
        match session(&inner, &output_id, &mut established).await {
            Ok(()) => tracing::info!(channel = %inner.channel_id, output = %output_id, "stream finished"),
            Err(e) if established || !reported => {
                tracing::info!(channel = %inner.channel_id, output = %output_id, error = %e, "pipeline connection failed, retrying");
                reported = true;
            }
            Err(e) => tracing::debug!(channel = %inner.channel_id, output = %output_id, error = %e, "pipeline connection still failing"),
        }
        if established {
            inner.connected.lock().remove(&output_id);
            inner.missing.lock().insert(output_id.clone());
            let on_close = inner.handlers.read().on_close.clone();
            if let Some(f) = on_close {
                call_guarded(&inner, f(output_id.clone())).await;
            }
            backoff = RECONNECT_INITIAL;
            reported = false;
        }
        drop(inner);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

async fn session(inner: &Arc<InputInner>, output_id: &str, established: &mut bool) -> KaraboResult<()> {
    let (instance, name) = split_channel_id(output_id)?;
    let info = inner.resolver.resolve(instance, name).await?;
    let host = info.get::<String>("hostname")?;
    let port = info.get_as::<u16>("port")?;
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);

    let hello = wire::hello(
        &inner.channel_id,
        inner.distribution.as_str(),
        inner.slowness.as_str(),
        inner.max_queue_length,
    );
    frame::write_hash(&mut writer, &hello).await?;
    writer.flush().await?;
    let handshake = frame::read_hash(&mut reader)
        .await?
        .ok_or_else(|| KaraboError::MalformedMessage("output closed during handshake".into()))?;
    let version = handshake.get_as::<u32>("schemaVersion").unwrap_or(0);
    let schema = handshake.get::<Hash>("schema").unwrap_or_default();
    inner.schemas.lock().insert(output_id.to_string(), (version, schema));

    *established = true;
    inner.missing.lock().remove(output_id);
    inner.connected.lock().insert(output_id.to_string());
    inner.ended.lock().remove(output_id);
    tracing::info!(channel = %inner.channel_id, output = %output_id, "connected to output");
    let on_connect = inner.handlers.read().on_connect.clone();
    if let Some(f) = on_connect {
        call_guarded(inner, f(output_id.to_string())).await;
    }

    let credit = wire::update(&inner.channel_id);
    frame::write_hash(&mut writer, &credit).await?;
    writer.flush().await?;

    let mut mid_stream = false;
    let outcome = loop {
        let message = match wire::read_message(&mut reader).await {
            Ok(Some(m)) => m,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        match message {
            Incoming::Data { items, .. } => {
                mid_stream = true;
                deliver(inner, items).await;
                if !inner.delay.is_zero() {
                    tokio::time::sleep(inner.delay).await;
                }
            }
            Incoming::EndOfStream => {
                mid_stream = false;
                end_of_stream(inner, output_id).await;
            }
            Incoming::Schema { version, schema } => {
                tracing::debug!(channel = %inner.channel_id, output = %output_id, version, "output schema updated");
                inner.schemas.lock().insert(output_id.to_string(), (version, schema));
            }
        }
        if let Err(e) = async {
            frame::write_hash(&mut writer, &credit).await?;
            writer.flush().await?;
            Ok::<(), KaraboError>(())
        }
        .await
        {
            break Err(e);
        }
    };

    // A vanished output ends its stream.
    if mid_stream {
        end_of_stream(inner, output_id).await;
    }
    outcome
}

async fn deliver(inner: &Arc<InputInner>, items: Vec<(Hash, MetaData)>) {
    let handlers = inner.handlers.read().clone();
    let _lock = inner.handler_lock.lock().await;
    if let Some(on_input) = handlers.on_input {
        run_handler(inner, on_input(InputBatch { items })).await;
    } else if let Some(on_data) = handlers.on_data {
        for (data, meta) in items {
            run_handler(inner, on_data(data, meta)).await;
        }
    }
}

async fn end_of_stream(inner: &Arc<InputInner>, output_id: &str) {
    let complete = {
        let mut ended = inner.ended.lock();
        ended.insert(output_id.to_string());
        let connected = inner.connected.lock();
        if connected.iter().all(|c| ended.contains(c)) {
            ended.clear();
            true
        } else {
            false
        }
    };
    if !complete {
        return;
    }
    tracing::debug!(channel = %inner.channel_id, output = %output_id, "end of stream");
    let on_eos = inner.handlers.read().on_eos.clone();
    if let Some(f) = on_eos {
        call_guarded(inner, f(output_id.to_string())).await;
    }
}

async fn call_guarded(inner: &Arc<InputInner>, fut: BoxFuture<'static, ()>) {
    let _lock = inner.handler_lock.lock().await;
    run_handler(inner, fut).await;
}

async fn run_handler(inner: &Arc<InputInner>, fut: BoxFuture<'static, ()>) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        tracing::error!(channel = %inner.channel_id, "input handler panicked");
    }
}
