//! TCP broker: a hub process plus the client used by servers and clients.
//!
//! Frames on the wire are length-prefixed hashes with an `op` field:
//!
//! | op | direction | fields |
//! |---|---|---|
//! | `hello` | client → hub | `topic` |
//! | `subscribe` / `unsubscribe` | client → hub | `id` |
//! | `publish` | client → hub | `message` |
//! | `deliver` | hub → client | `id` (`*` for broadcast), `message` |
//!
//! The hub processes each connection's frames in order and queues deliveries
//! per connection, so per (sender, recipient) order survives. A connection
//! whose queue is full loses deliveries until it catches up. The client
//! reconnects with capped exponential backoff, re-announces all local
//! subscriptions, resends the frame that was being written when the
//! connection failed, and reports [`BrokerStatus::Failed`] after the
//! configured ceiling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use karabo_core::{binary, Hash};
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Broker, BrokerStatus, Inbox, Message, Recipients, BROADCAST};
use crate::config::BrokerConfig;
use crate::error::{KaraboError, KaraboResult};
use crate::frame;

// =============================================================================
// Hub
// =============================================================================

/// Deliveries queued per client connection before the hub drops them.
pub const HUB_QUEUE_CAPACITY: usize = 4096;

type ConnId = u64;

struct ConnQueue {
    tx: mpsc::Sender<Bytes>,
    dropping: bool,
}

impl ConnQueue {
    /// Queue `bytes`, counting it in `dropped` if the queue is full; false
    /// once the connection is gone.
    fn push(&mut self, conn: ConnId, bytes: Bytes, dropped: &AtomicU64) -> bool {
        match self.tx.try_send(bytes) {
            Ok(()) => {
                self.dropping = false;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                if !self.dropping {
                    self.dropping = true;
                    tracing::warn!(conn, "broker client is not reading, dropping deliveries");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct TopicRoutes {
    /// instance id -> connection
    routes: HashMap<String, ConnId>,
    conns: HashMap<ConnId, ConnQueue>,
}

struct HubState {
    topics: Mutex<HashMap<String, TopicRoutes>>,
    next_conn: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

/// Standalone broker hub accepting [`TcpBroker`] clients.
pub struct TcpHub {
    local_addr: SocketAddr,
    state: Arc<HubState>,
    task: JoinHandle<()>,
    closing: watch::Sender<bool>,
}

impl TcpHub {
    /// Bind `addr` (`host:port`, port 0 for any) and start serving.
    pub async fn bind(addr: &str) -> KaraboResult<Self> {
        Self::bind_with_capacity(addr, HUB_QUEUE_CAPACITY).await
    }

    /// [`bind`](Self::bind) with `capacity` deliveries queued per connection.
    pub async fn bind_with_capacity(addr: &str, capacity: usize) -> KaraboResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(HubState {
            topics: Mutex::default(),
            next_conn: AtomicU64::new(0),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        let (closing, closing_rx) = watch::channel(false);
        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            let state = accept_state;
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let state = state.clone();
                        let closing = closing_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(state, stream, closing).await {
                                tracing::debug!(%peer, error = %e, "broker connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "broker accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });
        tracing::info!(%local_addr, capacity, "broker hub listening");
        Ok(Self {
            local_addr,
            state,
            task,
            closing,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `tcp://` URL clients should use.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Deliveries dropped so far because a client fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every client connection.
    pub fn shutdown(&self) {
        self.closing.send_replace(true);
        self.task.abort();
    }

    /// Serve until the accept loop ends.
    pub async fn join(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for TcpHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_connection(
    state: Arc<HubState>,
    stream: TcpStream,
    mut closing: watch::Receiver<bool>,
) -> KaraboResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    let hello = frame::read_hash(&mut reader)
        .await?
        .ok_or_else(|| KaraboError::MalformedMessage("connection closed before hello".into()))?;
    if hello.get::<String>("op").ok().as_deref() != Some("hello") {
        return Err(KaraboError::MalformedMessage("first frame must be hello".into()));
    }
    let topic = hello.get::<String>("topic").unwrap_or_default();
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<Bytes>(state.capacity);
    state
        .topics
        .lock()
        .entry(topic.clone())
        .or_default()
        .conns
        .insert(conn, ConnQueue { tx, dropping: false });
    tracing::debug!(conn, %topic, "broker client joined");

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if frame::write_frame(&mut writer, &bytes).await.is_err() {
                break;
            }
        }
    });

    let result = tokio::select! {
        r = hub_read_loop(&state, &topic, conn, &mut reader) => r,
        _ = closing.wait_for(|closed| *closed) => Ok(()),
    };

    {
        let mut topics = state.topics.lock();
        if let Some(t) = topics.get_mut(&topic) {
            t.conns.remove(&conn);
            t.routes.retain(|_, c| *c != conn);
        }
    }
    writer_task.abort();
    tracing::debug!(conn, %topic, "broker client left");
    result
}

async fn hub_read_loop<R>(state: &HubState, topic: &str, conn: ConnId, reader: &mut R) -> KaraboResult<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frame::read_hash(reader).await? {
        let op = frame.get::<String>("op").unwrap_or_default();
        let mut topics = state.topics.lock();
        let routes = topics.entry(topic.to_string()).or_default();
        match op.as_str() {
            "subscribe" => {
                let id = frame.get::<String>("id").unwrap_or_default();
                routes.routes.insert(id, conn);
            }
            "unsubscribe" => {
                let id = frame.get::<String>("id").unwrap_or_default();
                if routes.routes.get(&id) == Some(&conn) {
                    routes.routes.remove(&id);
                }
            }
            "publish" => {
                let message = frame.get::<Hash>("message")?;
                deliver(routes, message, &state.dropped)?;
            }
            other => tracing::warn!(op = other, "unknown broker op ignored"),
        }
    }
    Ok(())
}

fn deliver(routes: &mut TopicRoutes, message: Hash, dropped: &AtomicU64) -> KaraboResult<()> {
    let parsed = Message::from_hash(message.clone())?;
    match parsed.recipients() {
        Recipients::Broadcast => {
            let bytes = deliver_frame(BROADCAST, &message)?;
            routes.conns.retain(|conn, queue| queue.push(*conn, bytes.clone(), dropped));
        }
        Recipients::Instances(ids) => {
            for id in ids {
                let Some(conn) = routes.routes.get(&id).copied() else {
                    tracing::trace!(recipient = %id, "no route, message dropped");
                    continue;
                };
                if let Some(queue) = routes.conns.get_mut(&conn) {
                    queue.push(conn, deliver_frame(&id, &message)?, dropped);
                }
            }
        }
    }
    Ok(())
}

fn deliver_frame(id: &str, message: &Hash) -> KaraboResult<Bytes> {
    let mut h = Hash::new();
    h.set("op", "deliver");
    h.set("id", id);
    h.set("message", message.clone());
    Ok(binary::to_binary(&h)?)
}

// =============================================================================
// Client
// =============================================================================

type Subscribers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Arc<Message>>>>>;

/// Broker client connected to a [`TcpHub`].
pub struct TcpBroker {
    url: String,
    topic: String,
    outgoing: mpsc::UnboundedSender<Hash>,
    subscribers: Subscribers,
    status: watch::Receiver<BrokerStatus>,
    task: JoinHandle<()>,
}

impl TcpBroker {
    /// Connect to the hub named by `config.url`.
    ///
    /// The first connection attempt must succeed; later failures are retried.
    pub async fn connect(config: &BrokerConfig) -> KaraboResult<Self> {
        let addr = config
            .url
            .strip_prefix("tcp://")
            .ok_or_else(|| KaraboError::Config(format!("not a tcp url: {}", config.url)))?
            .to_string();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| KaraboError::BrokerUnavailable(format!("{}: {e}", config.url)))?;
        let _ = stream.set_nodelay(true);

        let (outgoing, out_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(BrokerStatus::Connected);
        let subscribers: Subscribers = Arc::default();

        let manager = ConnectionManager {
            addr,
            topic: config.topic.clone(),
            initial: Duration::from_millis(config.reconnect_initial_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
            ceiling: Duration::from_secs(config.reconnect_ceiling_secs),
            subscribers: subscribers.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(manager.run(stream, out_rx));

        Ok(Self {
            url: config.url.clone(),
            topic: config.topic.clone(),
            outgoing,
            subscribers,
            status,
            task,
        })
    }

    fn send(&self, frame: Hash) -> KaraboResult<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| KaraboError::BrokerUnavailable(format!("{}: connection closed", self.url)))
    }
}

impl Drop for TcpBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Broker for TcpBroker {
    fn url(&self) -> &str {
        &self.url
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe(&self, instance_id: &str) -> KaraboResult<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut subs = self.subscribers.lock();
            if subs.get(instance_id).is_some_and(|tx| !tx.is_closed()) {
                return Err(KaraboError::InstanceExists(instance_id.to_string()));
            }
            subs.insert(instance_id.to_string(), tx);
        }
        self.send(op_frame("subscribe", instance_id))?;
        Ok(rx)
    }

    async fn unsubscribe(&self, instance_id: &str) -> KaraboResult<()> {
        self.subscribers.lock().remove(instance_id);
        self.send(op_frame("unsubscribe", instance_id))
    }

    async fn publish(&self, message: Message) -> KaraboResult<()> {
        if *self.status.borrow() == BrokerStatus::Failed {
            return Err(KaraboError::BrokerUnavailable(self.url.clone()));
        }
        let mut frame = Hash::new();
        frame.set("op", "publish");
        frame.set("message", message.to_hash());
        self.send(frame)
    }

    fn status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.clone()
    }
}

fn op_frame(op: &str, id: &str) -> Hash {
    let mut h = Hash::new();
    h.set("op", op);
    h.set("id", id);
    h
}

struct ConnectionManager {
    addr: String,
    topic: String,
    initial: Duration,
    max: Duration,
    ceiling: Duration,
    subscribers: Subscribers,
    status: watch::Sender<BrokerStatus>,
}

impl ConnectionManager {
    async fn run(self, first: TcpStream, mut out_rx: mpsc::UnboundedReceiver<Hash>) {
        let mut stream = first;
        let mut unsent = None;
        loop {
            let err = self.session(stream, &mut out_rx, &mut unsent).await;
            if out_rx.is_closed() {
                return;
            }
            tracing::warn!(addr = %self.addr, error = ?err, "broker connection lost, reconnecting");
            self.status.send_replace(BrokerStatus::Reconnecting);
            match self.reconnect().await {
                Some(s) => {
                    stream = s;
                    self.status.send_replace(BrokerStatus::Connected);
                    tracing::info!(addr = %self.addr, "broker connection re-established");
                }
                None => {
                    tracing::error!(addr = %self.addr, ceiling = ?self.ceiling, "broker unreachable, giving up");
                    self.status.send_replace(BrokerStatus::Failed);
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<TcpStream> {
        let started = Instant::now();
        let mut delay = self.initial;
        while started.elapsed() < self.ceiling {
            tokio::time::sleep(delay + jitter(delay)).await;
            match TcpStream::connect(&self.addr).await {
                Ok(s) => {
                    let _ = s.set_nodelay(true);
                    return Some(s);
                }
                Err(e) => tracing::debug!(addr = %self.addr, ?delay, error = %e, "reconnect attempt failed"),
            }
            delay = (delay * 2).min(self.max);
        }
        None
    }

    /// Run one connection until it fails; returns the failure. A frame whose
    /// write failed is left in `unsent` for the next connection.
    async fn session(
        &self,
        stream: TcpStream,
        out_rx: &mut mpsc::UnboundedReceiver<Hash>,
        unsent: &mut Option<Hash>,
    ) -> Option<KaraboError> {
        let (mut reader, mut writer) = stream.into_split();
        if let Err(e) = self.announce(&mut writer).await {
            return Some(e);
        }
        if let Err(e) = send_unsent(&mut writer, unsent).await {
            return Some(e);
        }
        // Reads are not cancel safe, so they get their own task.
        let subscribers = self.subscribers.clone();
        let mut read_task = tokio::spawn(async move {
            loop {
                match frame::read_hash(&mut reader).await {
                    Ok(Some(frame)) => dispatch(&subscribers, frame),
                    Ok(None) => return KaraboError::BrokerUnavailable("hub closed the connection".into()),
                    Err(e) => return e,
                }
            }
        });
        let failure = loop {
            tokio::select! {
                outgoing = out_rx.recv() => match outgoing {
                    Some(frame) => {
                        *unsent = Some(frame);
                        if let Err(e) = send_unsent(&mut writer, unsent).await {
                            break Some(e);
                        }
                    }
                    None => break None,
                },
                ended = &mut read_task => {
                    break Some(ended.unwrap_or_else(|e| KaraboError::Cancelled(e.to_string())));
                }
            }
        };
        read_task.abort();
        failure
    }

    async fn announce<W>(&self, writer: &mut W) -> KaraboResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut hello = Hash::new();
        hello.set("op", "hello");
        hello.set("topic", self.topic.as_str());
        frame::write_hash(writer, &hello).await?;
        let ids: Vec<String> = self.subscribers.lock().keys().cloned().collect();
        for id in ids {
            frame::write_hash(writer, &op_frame("subscribe", &id)).await?;
        }
        Ok(())
    }
}

async fn send_unsent<W>(writer: &mut W, unsent: &mut Option<Hash>) -> KaraboResult<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(frame) = unsent.as_ref() {
        frame::write_hash(writer, frame).await?;
        *unsent = None;
    }
    Ok(())
}

fn dispatch(subscribers: &Subscribers, frame: Hash) {
    let id = frame.get::<String>("id").unwrap_or_default();
    let message = match frame.get::<Hash>("message").map_err(KaraboError::from).and_then(Message::from_hash) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed delivery");
            return;
        }
    };
    let mut subs = subscribers.lock();
    if id == BROADCAST {
        subs.retain(|_, tx| tx.send(message.clone()).is_ok());
    } else if let Some(tx) = subs.get(&id) {
        if tx.send(message).is_err() {
            subs.remove(&id);
        }
    }
}

/// Up to a quarter of `delay`, so that clients of a restarted hub spread out.
fn jitter(delay: Duration) -> Duration {
    let quarter = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{encode_instance_ids, header};
    use karabo_core::hash;

    fn config(url: String) -> BrokerConfig {
        BrokerConfig {
            url,
            topic: "test".into(),
            reconnect_initial_ms: 20,
            reconnect_max_ms: 100,
            reconnect_ceiling_secs: 2,
        }
    }

    fn addressed(to: &str, n: i32) -> Message {
        Message::new(
            hash! { header::SLOT_INSTANCE_IDS => encode_instance_ids(&[to]) },
            hash! { "a1" => n },
        )
    }

    #[tokio::test]
    async fn hub_routes_between_clients() {
        let hub = TcpHub::bind("127.0.0.1:0").await.unwrap();
        let a = TcpBroker::connect(&config(hub.url())).await.unwrap();
        let b = TcpBroker::connect(&config(hub.url())).await.unwrap();
        let mut rx_a = a.subscribe("a").await.unwrap();
        let mut rx_b = b.subscribe("b").await.unwrap();
        // Subscriptions are frames too; wait until both reached the hub.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..100 {
            a.publish(addressed("b", i)).await.unwrap();
        }
        b.publish(addressed("*", -1)).await.unwrap();

        for i in 0..100 {
            let m = tokio::time::timeout(Duration::from_secs(2), rx_b.recv()).await.unwrap().unwrap();
            assert_eq!(m.body.get::<i32>("a1").unwrap(), i);
        }
        let m = tokio::time::timeout(Duration::from_secs(2), rx_a.recv()).await.unwrap().unwrap();
        assert_eq!(m.body.get::<i32>("a1").unwrap(), -1);
    }

    #[tokio::test]
    async fn failed_write_keeps_the_frame_for_the_next_connection() {
        let frame = op_frame("subscribe", "a");
        let mut unsent = Some(frame.clone());

        let (mut dead, peer) = tokio::io::duplex(4096);
        drop(peer);
        assert!(send_unsent(&mut dead, &mut unsent).await.is_err());
        assert_eq!(unsent.as_ref(), Some(&frame));

        let (mut live, mut peer) = tokio::io::duplex(4096);
        send_unsent(&mut live, &mut unsent).await.unwrap();
        assert!(unsent.is_none());
        assert_eq!(frame::read_hash(&mut peer).await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn stalled_client_loses_deliveries_without_blocking_others() {
        let hub = TcpHub::bind_with_capacity("127.0.0.1:0", 4).await.unwrap();
        let addr = hub.local_addr();

        // subscribes, then never reads
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        let mut hello = Hash::new();
        hello.set("op", "hello");
        hello.set("topic", "test");
        frame::write_hash(&mut stalled, &hello).await.unwrap();
        frame::write_hash(&mut stalled, &op_frame("subscribe", "slow")).await.unwrap();

        let sender = TcpBroker::connect(&config(hub.url())).await.unwrap();
        let receiver = TcpBroker::connect(&config(hub.url())).await.unwrap();
        let mut rx = receiver.subscribe("fast").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let blob = Bytes::from(vec![7u8; 256 * 1024]);
        for _ in 0..128 {
            let message = Message::new(
                hash! { header::SLOT_INSTANCE_IDS => encode_instance_ids(&["slow"]) },
                hash! { "blob" => blob.clone() },
            );
            sender.publish(message).await.unwrap();
        }
        sender.publish(addressed("fast", 1)).await.unwrap();

        let m = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(m.body.get::<i32>("a1").unwrap(), 1);
        assert!(hub.dropped_frames() > 0);
        drop(stalled);
    }

    #[tokio::test]
    async fn unreachable_hub_fails_fast() {
        let result = TcpBroker::connect(&config("tcp://127.0.0.1:1".into())).await;
        assert!(matches!(result, Err(KaraboError::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn lost_hub_ends_in_failed_status() {
        let hub = TcpHub::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config(hub.url());
        cfg.reconnect_ceiling_secs = 1;
        let client = TcpBroker::connect(&cfg).await.unwrap();
        let mut status = client.status();
        drop(hub);
        let failed = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == BrokerStatus::Failed)).await;
        assert!(failed.is_ok());
    }
}
