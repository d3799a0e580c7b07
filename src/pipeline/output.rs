//! Output side of a pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use karabo_core::{binary, Hash, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use super::queue::{Offer, PeerQueue};
use super::wire::{self, Item, Outgoing};
use super::{DataDistribution, MetaData, OnSlowness, DEFAULT_MAX_QUEUE_LENGTH, MAX_QUEUE_LENGTH};
use crate::error::{KaraboError, KaraboResult};
use crate::frame;

/// How long a closing channel keeps writing queued messages to an input.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_max_queue_length() -> u32 {
    DEFAULT_MAX_QUEUE_LENGTH
}

/// Output channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    /// Address to listen on and advertise.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Port; 0 picks a free one.
    #[serde(default)]
    pub port: u16,
    /// Policy when the next shared input is busy.
    #[serde(default = "default_no_input_shared")]
    pub no_input_shared: String,
    /// Upper bound on the queue length requested by inputs.
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: u32,
}

fn default_no_input_shared() -> String {
    "drop".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: 0,
            no_input_shared: default_no_input_shared(),
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

impl OutputConfig {
    /// Read from the channel node of a device configuration.
    pub fn from_hash(h: &Hash) -> Self {
        let d = Self::default();
        Self {
            hostname: h.get::<String>("hostname").ok().filter(|s| s != "default").unwrap_or(d.hostname),
            port: h.get_as::<u16>("port").unwrap_or(d.port),
            no_input_shared: h.get::<String>("noInputShared").unwrap_or(d.no_input_shared),
            max_queue_length: h.get_as::<u32>("maxQueueLength").unwrap_or(d.max_queue_length),
        }
    }
}

/// One connected input.
struct Peer {
    remote_id: String,
    distribution: DataDistribution,
    slowness: OnSlowness,
    max_queue_length: usize,
    remote: SocketAddr,
    queue: PeerQueue,
}

#[derive(Default)]
struct Peers {
    copy: Vec<Arc<Peer>>,
    shared: Vec<Arc<Peer>>,
    next_shared: usize,
}

struct OutputInner {
    channel_id: String,
    hostname: String,
    port: u16,
    no_input_shared: OnSlowness,
    max_queue_length: u32,
    peers: Mutex<Peers>,
    space: Arc<Notify>,
    schema: RwLock<(u32, Hash)>,
    closing: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    write_lock: tokio::sync::Mutex<()>,
}

/// A TCP pipeline output. Cheap to clone.
#[derive(Clone)]
pub struct OutputChannel {
    inner: Arc<OutputInner>,
}

impl OutputChannel {
    /// Listen for inputs of `channel_id` (`deviceId:channelName`).
    pub async fn bind(channel_id: impl Into<String>, config: &OutputConfig) -> KaraboResult<Self> {
        let channel_id = channel_id.into();
        let no_input_shared: OnSlowness = config.no_input_shared.parse()?;
        let listener = TcpListener::bind((config.hostname.as_str(), config.port)).await?;
        let local = listener.local_addr()?;
        let (closing, _) = watch::channel(false);
        let inner = Arc::new(OutputInner {
            channel_id: channel_id.clone(),
            hostname: config.hostname.clone(),
            port: local.port(),
            no_input_shared,
            max_queue_length: config.max_queue_length.clamp(1, MAX_QUEUE_LENGTH),
            peers: Mutex::new(Peers::default()),
            space: Arc::new(Notify::new()),
            schema: RwLock::new((0, Hash::new())),
            closing,
            accept_task: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        });
        let task = tokio::spawn(accept_loop(Arc::downgrade(&inner), listener));
        *inner.accept_task.lock() = Some(task);
        tracing::debug!(channel = %channel_id, port = local.port(), "output channel listening");
        Ok(Self { inner })
    }

    /// `deviceId:channelName`.
    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// `{connectionType, hostname, port}` for inputs.
    pub fn information(&self) -> Hash {
        let mut h = Hash::new();
        h.set("connectionType", "tcp");
        h.set("hostname", self.inner.hostname.as_str());
        h.set("port", self.inner.port as u32);
        h
    }

    /// Table of connected inputs.
    pub fn connections(&self) -> Vec<Hash> {
        let peers = self.inner.peers.lock();
        peers
            .copy
            .iter()
            .chain(peers.shared.iter())
            .map(|p| {
                let mut row = Hash::new();
                row.set("remoteId", p.remote_id.as_str());
                row.set("dataDistribution", p.distribution.as_str());
                row.set("onSlowness", p.slowness.as_str());
                row.set("memoryLocation", "remote");
                row.set("remoteAddress", p.remote.ip().to_string());
                row.set("remotePort", p.remote.port());
                row
            })
            .collect()
    }

    /// Number of connected inputs.
    pub fn connection_count(&self) -> usize {
        let peers = self.inner.peers.lock();
        peers.copy.len() + peers.shared.len()
    }

    /// Send `data` stamped with `timestamp`.
    pub async fn write(&self, data: &Hash, timestamp: Timestamp) -> KaraboResult<()> {
        let meta = MetaData::new(self.inner.channel_id.as_str(), timestamp);
        self.write_items(vec![(data, meta)]).await
    }

    /// Send several items as one chunk.
    pub async fn write_items(&self, items: Vec<(&Hash, MetaData)>) -> KaraboResult<()> {
        let items = items
            .into_iter()
            .map(|(data, meta)| Ok(Item { bytes: binary::to_binary(data)?, meta }))
            .collect::<KaraboResult<Vec<_>>>()?;
        let schema_version = self.inner.schema.read().0;
        self.distribute(Outgoing::Data { items, schema_version }).await
    }

    /// Tell every input that the stream ended.
    pub async fn signal_end_of_stream(&self) -> KaraboResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        for peer in self.all_peers() {
            peer.queue.push_control(Outgoing::EndOfStream);
        }
        Ok(())
    }

    /// Replace the schema of the data; inputs receive it after the chunks
    /// already queued for them.
    pub async fn set_schema(&self, schema: Hash) {
        let _guard = self.inner.write_lock.lock().await;
        let version = {
            let mut current = self.inner.schema.write();
            current.0 += 1;
            current.1 = schema.clone();
            current.0
        };
        for peer in self.all_peers() {
            peer.queue.push_control(Outgoing::Schema {
                version,
                schema: schema.clone(),
            });
        }
    }

    /// Current schema version and schema.
    pub fn schema(&self) -> (u32, Hash) {
        self.inner.schema.read().clone()
    }

    /// Stop listening; inputs are disconnected once what is queued for them
    /// has been written.
    pub async fn close(&self) {
        self.inner.closing.send_replace(true);
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        for peer in self.all_peers() {
            peer.queue.close();
        }
    }

    fn all_peers(&self) -> Vec<Arc<Peer>> {
        let peers = self.inner.peers.lock();
        peers.copy.iter().chain(peers.shared.iter()).cloned().collect()
    }

    async fn distribute(&self, message: Outgoing) -> KaraboResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        let copies: Vec<Arc<Peer>> = self.inner.peers.lock().copy.clone();
        for peer in copies {
            let outcome = match peer.slowness {
                OnSlowness::Drop => peer.queue.offer_if_ready(&message),
                OnSlowness::QueueDrop => peer.queue.offer_evicting(&message, peer.max_queue_length),
                OnSlowness::Wait => peer.queue.push_waiting(&message, 1).await,
                OnSlowness::Queue => peer.queue.push_waiting(&message, peer.max_queue_length).await,
            };
            self.report(&peer, outcome);
        }
        self.distribute_shared(&message).await;
        Ok(())
    }

    async fn distribute_shared(&self, message: &Outgoing) {
        let policy = self.inner.no_input_shared;
        let capacity = self.inner.max_queue_length as usize;
        loop {
            let notified = self.inner.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let target = {
                let mut peers = self.inner.peers.lock();
                let n = peers.shared.len();
                if n == 0 {
                    return;
                }
                let start = peers.next_shared % n;
                let pick = (0..n).map(|i| (start + i) % n).find(|&i| {
                    let q = &peers.shared[i].queue;
                    match policy {
                        OnSlowness::Drop => q.is_ready(),
                        OnSlowness::Wait => q.len() == 0,
                        OnSlowness::Queue => q.len() < capacity,
                        OnSlowness::QueueDrop => true,
                    }
                });
                match pick {
                    Some(i) => {
                        peers.next_shared = i + 1;
                        Some(peers.shared[i].clone())
                    }
                    None if matches!(policy, OnSlowness::Drop) => {
                        let first = peers.shared[start].clone();
                        drop(peers);
                        self.report(&first, Offer::Dropped);
                        return;
                    }
                    None => None,
                }
            };
            match target {
                Some(peer) => {
                    let outcome = match policy {
                        OnSlowness::Drop => peer.queue.offer_if_ready(message),
                        OnSlowness::QueueDrop => peer.queue.offer_evicting(message, capacity),
                        OnSlowness::Wait => peer.queue.offer_bounded(message, 1),
                        OnSlowness::Queue => peer.queue.offer_bounded(message, capacity),
                    };
                    match outcome {
                        Offer::Busy | Offer::Closed => continue,
                        other => {
                            self.report(&peer, other);
                            return;
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    fn report(&self, peer: &Peer, outcome: Offer) {
        let dropping = matches!(outcome, Offer::Dropped | Offer::Evicted);
        if peer.queue.mark_dropping(dropping) {
            let err = KaraboError::PipelineOverflow {
                channel: self.inner.channel_id.clone(),
                reason: format!("input '{}' is too slow ({})", peer.remote_id, peer.slowness.as_str()),
            };
            tracing::warn!(channel = %self.inner.channel_id, input = %peer.remote_id, "{err}");
        }
    }
}

impl Drop for OutputInner {
    fn drop(&mut self) {
        self.closing.send_replace(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

async fn accept_loop(weak: std::sync::Weak<OutputInner>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "pipeline accept failed");
                continue;
            }
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let _ = stream.set_nodelay(true);
        tokio::spawn(async move {
            let channel = inner.channel_id.clone();
            if let Err(e) = serve(inner, stream, remote).await {
                tracing::info!(%channel, %remote, error = %e, "pipeline connection ended");
            }
        });
    }
}

async fn serve(inner: Arc<OutputInner>, stream: TcpStream, remote: SocketAddr) -> KaraboResult<()> {
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);
    let hello = frame::read_hash(&mut reader)
        .await?
        .ok_or_else(|| KaraboError::MalformedMessage("input closed before hello".into()))?;
    if hello.get::<String>("reason").ok().as_deref() != Some("hello") {
        return Err(KaraboError::MalformedMessage("expected hello".into()));
    }
    let distribution: DataDistribution = hello
        .get::<String>("dataDistribution")
        .unwrap_or_else(|_| "copy".into())
        .parse()?;
    let slowness: OnSlowness = hello
        .get::<String>("onSlowness")
        .unwrap_or_else(|_| "drop".into())
        .parse()?;
    let requested = hello.get_as::<u32>("maxQueueLength").unwrap_or(DEFAULT_MAX_QUEUE_LENGTH);
    let peer = Arc::new(Peer {
        remote_id: hello.get::<String>("instanceId").unwrap_or_default(),
        distribution,
        slowness,
        max_queue_length: requested.clamp(1, inner.max_queue_length) as usize,
        remote,
        queue: PeerQueue::new(inner.space.clone()),
    });

    // Registered under the write lock, a peer sees every schema change after
    // the snapshot as a queued control message.
    let (version, schema) = {
        let _guard = inner.write_lock.lock().await;
        let snapshot = inner.schema.read().clone();
        let mut peers = inner.peers.lock();
        match distribution {
            DataDistribution::Copy => peers.copy.push(peer.clone()),
            DataDistribution::Shared => peers.shared.push(peer.clone()),
        }
        snapshot
    };
    let handshake = async {
        frame::write_hash(&mut writer, &wire::handshake(version, &schema)).await?;
        tokio::io::AsyncWriteExt::flush(&mut writer).await?;
        Ok::<(), KaraboError>(())
    }
    .await;
    if let Err(e) = handshake {
        unregister(&inner, &peer);
        return Err(e);
    }
    tracing::info!(
        channel = %inner.channel_id,
        input = %peer.remote_id,
        distribution = distribution.as_str(),
        on_slowness = slowness.as_str(),
        "input connected"
    );

    // Reading in its own task keeps the select below cancel safe.
    let (credit_tx, mut credits_rx) = mpsc::unbounded_channel::<()>();
    let read_task = tokio::spawn(async move {
        while let Ok(Some(msg)) = frame::read_hash(&mut reader).await {
            if msg.get::<String>("reason").ok().as_deref() == Some("update") && credit_tx.send(()).is_err() {
                break;
            }
        }
    });

    let mut closing = inner.closing.subscribe();
    let channel_id = inner.channel_id.clone();
    let weak = Arc::downgrade(&inner);
    drop(inner);

    let mut credits = 0usize;
    let result = loop {
        peer.queue.set_ready(credits > 0);
        if credits == 0 {
            tokio::select! {
                c = credits_rx.recv() => match c {
                    Some(()) => credits += 1,
                    None => break Ok(false),
                },
                _ = async { closing.wait_for(|c| *c).await.map(|_| ()) } => break Ok(true),
            }
            continue;
        }
        tokio::select! {
            message = peer.queue.next() => {
                let Some(message) = message else { break Ok(false) };
                if let Err(e) = wire::write_message(&mut writer, &message).await {
                    break Err(e);
                }
                credits -= 1;
            }
            c = credits_rx.recv() => match c {
                Some(()) => credits += 1,
                None => break Ok(false),
            },
            _ = async { closing.wait_for(|c| *c).await.map(|_| ()) } => break Ok(true),
        }
    };
    let result = match result {
        Ok(true) => drain(&peer, &mut writer).await,
        other => other.map(|_| ()),
    };

    read_task.abort();
    peer.queue.close();
    if let Some(inner) = weak.upgrade() {
        unregister(&inner, &peer);
    }
    tracing::info!(channel = %channel_id, input = %peer.remote_id, "input disconnected");
    result
}

/// Write out what was queued before the channel closed.
async fn drain(peer: &Peer, writer: &mut BufWriter<OwnedWriteHalf>) -> KaraboResult<()> {
    peer.queue.close();
    let flush = async {
        while let Some(message) = peer.queue.next().await {
            wire::write_message(writer, &message).await?;
        }
        Ok::<(), KaraboError>(())
    };
    tokio::time::timeout(DRAIN_TIMEOUT, flush)
        .await
        .map_err(|_| KaraboError::Cancelled(format!("input '{}' stopped reading while closing", peer.remote_id)))?
}

fn unregister(inner: &OutputInner, peer: &Arc<Peer>) {
    let mut peers = inner.peers.lock();
    peers.copy.retain(|p| !Arc::ptr_eq(p, peer));
    peers.shared.retain(|p| !Arc::ptr_eq(p, peer));
    drop(peers);
    inner.space.notify_waiters();
}
