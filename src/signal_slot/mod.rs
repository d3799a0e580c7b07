//! Signal/slot messaging endpoint.
//!
//! A [`SignalSlotable`] is a named instance on the broker. It
//!
//! - registers **slots** (named async handlers) that other instances call or
//!   request,
//! - declares **signals** and emits them to every connected slot,
//! - issues **requests** and correlates replies,
//! - announces itself (`slotInstanceNew`/`slotInstanceGone`), sends
//!   heartbeats and tracks the presence of its peers.
//!
//! ## Ordering
//!
//! All messages of one instance are dispatched by a single task in broker
//! delivery order. Replies resolve their waiter immediately. Slot calls run
//! according to their [`SlotMode`]:
//!
//! - [`SlotMode::Ordered`] (the default) runs handlers one at a time on the
//!   instance's strand, so a subscriber sees signals in emission order;
//! - [`SlotMode::Concurrent`] spawns each call as its own task, for handlers
//!   that wait on other instances (starting or killing devices);
//! - [`SlotMode::Inline`] runs short bookkeeping handlers inside the
//!   dispatcher itself (presence and connection management).
//!
//! A handler calling a slot of its own instance through the broker from an
//! ordered slot waits for itself and times out; call the code directly instead.
//!
//! ## Failures
//!
//! A failing or panicking handler produces an error reply `(message, details)`;
//! the requester sees [`KaraboError::Remote`]. Nothing a handler does takes
//! the process down.

mod args;
mod presence;

pub use args::Args;
pub use presence::{InstanceEvent, InstanceTracker, MISSED_BEATS};

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use karabo_core::{Hash, MergePolicy};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::broker::{
    self, encode_instance_ids, encode_slot_functions, header, slots_for, Broker, Inbox, Message,
    BROADCAST,
};
use crate::error::{KaraboError, KaraboResult};
use crate::event_loop::{scoped, EventLoop, Strand};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by slot handlers.
pub type SlotFuture = BoxFuture<'static, KaraboResult<Args>>;

/// Type-erased slot handler.
pub type SlotHandler = Arc<dyn Fn(Args, CallContext) -> SlotFuture + Send + Sync>;

/// How incoming calls of a slot are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    /// One at a time, in delivery order, on the instance strand.
    Ordered,
    /// Each call in its own task.
    Concurrent,
    /// Inside the dispatcher; for handlers that never wait.
    Inline,
}

/// Information about the caller of a slot.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Instance id of the caller.
    pub sender: String,
    /// Slot being executed.
    pub slot: String,
    /// Correlation id when the caller waits for a reply.
    pub reply_to: Option<String>,
    /// User tag of the caller, if any.
    pub user: String,
}

impl CallContext {
    /// True if the caller expects a reply.
    pub fn is_request(&self) -> bool {
        self.reply_to.is_some()
    }
}

/// A signal connection as seen from the emitting side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Subscriber {
    instance_id: String,
    slot: String,
}

/// A connection this instance asked for, kept for presence-driven re-subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Connection {
    signal_instance: String,
    signal: String,
    slot_instance: String,
    slot: String,
}

type Reply = KaraboResult<Args>;

struct Inner {
    instance_id: String,
    info: RwLock<Hash>,
    broker: Arc<dyn Broker>,
    event_loop: EventLoop,
    host: String,
    slots: RwLock<HashMap<String, (SlotHandler, SlotMode)>>,
    signals: RwLock<HashMap<String, Vec<Subscriber>>>,
    connections: Mutex<Vec<Connection>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    tracker: Mutex<InstanceTracker>,
    events: broadcast::Sender<InstanceEvent>,
    heartbeat_secs: AtomicU64,
    timeout_ms: AtomicU64,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    strand: Mutex<Option<Strand>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Named messaging endpoint. Cheap to clone; clones share the endpoint.
#[derive(Clone)]
pub struct SignalSlotable {
    inner: Arc<Inner>,
}

/// Weak handle that does not keep an endpoint alive.
#[derive(Clone)]
pub struct WeakSignalSlotable {
    inner: Weak<Inner>,
}

impl WeakSignalSlotable {
    /// Strong handle if the endpoint still exists.
    pub fn upgrade(&self) -> Option<SignalSlotable> {
        self.inner.upgrade().map(|inner| SignalSlotable { inner })
    }
}

/// Build a slot handler from an async closure.
pub fn handler<F, Fut>(f: F) -> SlotHandler
where
    F: Fn(Args, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = KaraboResult<Args>> + Send + 'static,
{
    Arc::new(move |args, ctx| Box::pin(f(args, ctx)))
}

impl SignalSlotable {
    /// Endpoint `instance_id` on `broker`, described by `info`.
    ///
    /// Nothing is sent before [`start`](Self::start).
    pub fn new(instance_id: impl Into<String>, info: Hash, broker: Arc<dyn Broker>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);
        let host = info
            .get::<String>("host")
            .unwrap_or_else(|_| "localhost".to_string());
        let this = Self {
            inner: Arc::new(Inner {
                instance_id: instance_id.into(),
                info: RwLock::new(info),
                broker,
                event_loop: EventLoop::global(),
                host,
                slots: RwLock::new(HashMap::new()),
                signals: RwLock::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                tracker: Mutex::new(InstanceTracker::default()),
                events,
                heartbeat_secs: AtomicU64::new(20),
                timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT.as_millis() as u64),
                running: AtomicBool::new(false),
                shutdown,
                strand: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        this.register_reserved_slots();
        this
    }

    /// Instance id.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Shared broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    /// Event loop used for concurrent slots.
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Weak handle.
    pub fn downgrade(&self) -> WeakSignalSlotable {
        WeakSignalSlotable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Snapshot of the instance info.
    pub fn info(&self) -> Hash {
        self.inner.info.read().clone()
    }

    /// Merge `update` into the info and broadcast `slotInstanceUpdated`.
    pub async fn update_info(&self, update: &Hash) -> KaraboResult<()> {
        let info = {
            let mut info = self.inner.info.write();
            info.merge(update, MergePolicy::Merge);
            info.clone()
        };
        if self.is_running() {
            self.call(BROADCAST, "slotInstanceUpdated", crate::args![self.instance_id(), info])
                .await?;
        }
        Ok(())
    }

    /// Heartbeat period; takes effect at the next beat.
    pub fn set_heartbeat_interval(&self, secs: u64) {
        self.inner.heartbeat_secs.store(secs.max(1), Ordering::Relaxed);
        self.inner.info.write().set("heartbeatInterval", secs.max(1) as i32);
    }

    /// Default timeout of [`request`](Self::request).
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Timeout used by [`request`](Self::request) unless overridden.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.timeout_ms.load(Ordering::Relaxed))
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Info of `instance_id` if it answers a ping within `timeout`.
    pub async fn ping(&self, instance_id: &str, timeout: Duration) -> KaraboResult<Option<Hash>> {
        match self
            .request(instance_id, "slotPing", crate::args![instance_id, 1i32, false])
            .timeout(timeout)
            .wait_for_reply()
            .await
        {
            Ok(reply) => Ok(Some(reply.get_or::<Hash>(1, Hash::new()))),
            Err(e) if e.is_timeout() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fail with [`KaraboError::InstanceExists`] if `instance_id` is alive.
    pub async fn ensure_absent(&self, instance_id: &str, timeout: Duration) -> KaraboResult<()> {
        match self.ping(instance_id, timeout).await? {
            Some(_) => Err(KaraboError::InstanceExists(instance_id.to_string())),
            None => Ok(()),
        }
    }

    /// Subscribe on the broker, announce the instance and start heartbeats.
    pub async fn start(&self) -> KaraboResult<()> {
        let inbox = self.inner.broker.subscribe(self.instance_id()).await?;
        let id = self.instance_id().to_string();

        let (strand, strand_task) = Strand::new(id.clone());
        *self.inner.strand.lock() = Some(strand);
        self.inner.running.store(true, Ordering::Release);
        self.inner.shutdown.send_replace(false);

        let dispatcher = tokio::spawn(scoped(id.clone(), dispatch_loop(self.inner.clone(), inbox)));
        let beats = tokio::spawn(scoped(id.clone(), heartbeat_loop(Arc::downgrade(&self.inner))));
        let expiry = tokio::spawn(scoped(id.clone(), expiry_loop(Arc::downgrade(&self.inner))));
        self.inner
            .tasks
            .lock()
            .extend([dispatcher, beats, expiry, strand_task]);

        self.call(BROADCAST, "slotInstanceNew", crate::args![id.as_str(), self.info()])
            .await?;
        tracing::debug!(instance_id = %id, "instance started");
        Ok(())
    }

    /// Announce departure and stop processing messages.
    ///
    /// The handler calling this (if any) runs to completion; queued calls are
    /// skipped. Slot handlers are released to break reference cycles.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let id = self.instance_id().to_string();
        if let Err(e) = self
            .call(BROADCAST, "slotInstanceGone", crate::args![id.as_str(), self.info()])
            .await
        {
            tracing::warn!(instance_id = %id, error = %e, "could not announce departure");
        }
        let _ = self.inner.broker.unsubscribe(&id).await;
        self.inner.shutdown.send_replace(true);
        self.inner.pending.lock().clear();
        self.inner.slots.write().clear();
        self.inner.strand.lock().take();
        tracing::debug!(instance_id = %id, "instance stopped");
    }

    /// Abort every task of this endpoint, including a running handler.
    pub fn abort(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown.send_replace(true);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.slots.write().clear();
        self.inner.strand.lock().take();
    }

    /// [`abort`](Self::abort), then announce departure and leave the broker.
    pub async fn terminate(&self) {
        let was_running = self.inner.running.load(Ordering::Acquire);
        self.abort();
        if !was_running {
            return;
        }
        let id = self.instance_id().to_string();
        if let Err(e) = self
            .call(BROADCAST, "slotInstanceGone", crate::args![id.as_str(), self.info()])
            .await
        {
            tracing::warn!(instance_id = %id, error = %e, "could not announce departure");
        }
        let _ = self.inner.broker.unsubscribe(&id).await;
        self.inner.pending.lock().clear();
    }

    /// Keep `task` and abort it together with the endpoint.
    pub fn adopt_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // =========================================================================
    // Slots and signals
    // =========================================================================

    /// Register an ordered slot.
    pub fn register_slot<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Args, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KaraboResult<Args>> + Send + 'static,
    {
        self.register_slot_with(name, SlotMode::Ordered, handler(f));
    }

    /// Register a slot with an explicit scheduling mode.
    pub fn register_slot_with(&self, name: &str, mode: SlotMode, handler: SlotHandler) {
        self.inner
            .slots
            .write()
            .insert(name.to_string(), (handler, mode));
    }

    /// True if `name` is a registered slot.
    pub fn has_slot(&self, name: &str) -> bool {
        self.inner.slots.read().contains_key(name)
    }

    /// Declare a signal so that slots can be connected to it.
    pub fn register_signal(&self, name: &str) {
        self.inner
            .signals
            .write()
            .entry(name.to_string())
            .or_default();
    }

    /// Emit `signal` to every connected slot.
    pub async fn emit(&self, signal: &str, args: Args) -> KaraboResult<()> {
        let subscribers = match self.inner.signals.read().get(signal) {
            Some(subs) => subs.clone(),
            None => {
                return Err(KaraboError::SlotNotFound {
                    instance_id: self.instance_id().to_string(),
                    slot: signal.to_string(),
                })
            }
        };
        if subscribers.is_empty() {
            return Ok(());
        }
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for sub in subscribers {
            match grouped.iter_mut().find(|(id, _)| *id == sub.instance_id) {
                Some((_, slots)) => slots.push(sub.slot),
                None => grouped.push((sub.instance_id, vec![sub.slot])),
            }
        }
        let ids: Vec<&str> = grouped.iter().map(|(id, _)| id.as_str()).collect();
        let header = self.make_header(signal, &encode_instance_ids(&ids), &encode_slot_functions(&grouped));
        self.inner
            .broker
            .publish(Message::new(header, args.to_body()))
            .await
    }

    /// Connect `signal` of `signal_instance` to `slot` of `slot_instance`.
    pub async fn connect(
        &self,
        signal_instance: &str,
        signal: &str,
        slot_instance: &str,
        slot: &str,
    ) -> KaraboResult<()> {
        let connected = if signal_instance == self.instance_id() {
            self.add_subscriber(signal, slot_instance, slot)
        } else {
            self.request(
                signal_instance,
                "slotConnectToSignal",
                crate::args![signal, slot_instance, slot],
            )
            .wait_for_reply()
            .await?
            .get::<bool>(0)?
        };
        if !connected {
            return Err(KaraboError::SlotNotFound {
                instance_id: signal_instance.to_string(),
                slot: signal.to_string(),
            });
        }
        if slot_instance == self.instance_id() && signal_instance != self.instance_id() {
            let conn = Connection {
                signal_instance: signal_instance.to_string(),
                signal: signal.to_string(),
                slot_instance: slot_instance.to_string(),
                slot: slot.to_string(),
            };
            let mut conns = self.inner.connections.lock();
            if !conns.contains(&conn) {
                conns.push(conn);
            }
        }
        Ok(())
    }

    /// Undo [`connect`](Self::connect).
    pub async fn disconnect(
        &self,
        signal_instance: &str,
        signal: &str,
        slot_instance: &str,
        slot: &str,
    ) -> KaraboResult<bool> {
        self.inner.connections.lock().retain(|c| {
            !(c.signal_instance == signal_instance
                && c.signal == signal
                && c.slot_instance == slot_instance
                && c.slot == slot)
        });
        if signal_instance == self.instance_id() {
            return Ok(self.remove_subscriber(signal, slot_instance, slot));
        }
        self.request(
            signal_instance,
            "slotDisconnectFromSignal",
            crate::args![signal, slot_instance, slot],
        )
        .wait_for_reply()
        .await?
        .get::<bool>(0)
    }

    fn add_subscriber(&self, signal: &str, instance_id: &str, slot: &str) -> bool {
        let mut signals = self.inner.signals.write();
        let Some(subs) = signals.get_mut(signal) else {
            return false;
        };
        let sub = Subscriber {
            instance_id: instance_id.to_string(),
            slot: slot.to_string(),
        };
        if !subs.contains(&sub) {
            subs.push(sub);
        }
        true
    }

    fn remove_subscriber(&self, signal: &str, instance_id: &str, slot: &str) -> bool {
        let mut signals = self.inner.signals.write();
        match signals.get_mut(signal) {
            Some(subs) => {
                let before = subs.len();
                subs.retain(|s| !(s.instance_id == instance_id && s.slot == slot));
                subs.len() != before
            }
            None => false,
        }
    }

    // =========================================================================
    // Calls and requests
    // =========================================================================

    fn make_header(&self, function: &str, ids: &str, slots: &str) -> Hash {
        let mut h = Hash::new();
        h.set(header::SIGNAL_INSTANCE_ID, self.instance_id());
        h.set(header::SIGNAL_FUNCTION, function);
        h.set(header::SLOT_INSTANCE_IDS, ids);
        h.set(header::SLOT_FUNCTIONS, slots);
        h.set(header::HOST_NAME, self.inner.host.as_str());
        h.set(header::TIMESTAMP, chrono::Utc::now().timestamp_millis());
        h
    }

    /// One-way call of `slot` on `target` (`*` for every instance).
    pub async fn call(&self, target: &str, slot: &str, args: Args) -> KaraboResult<()> {
        let header = self.make_header(
            header::CALL,
            &encode_instance_ids(&[target]),
            &encode_slot_functions(&[(target.to_string(), vec![slot.to_string()])]),
        );
        self.inner
            .broker
            .publish(Message::new(header, args.to_body()))
            .await
    }

    /// Prepare a request of `slot` on `target`.
    pub fn request(&self, target: &str, slot: &str, args: Args) -> Requestor {
        Requestor {
            ssb: self.clone(),
            target: target.to_string(),
            slot: slot.to_string(),
            args,
            timeout: self.default_timeout(),
        }
    }

    async fn send_reply(&self, to: &str, reply_to: &str, result: Reply) -> KaraboResult<()> {
        let mut header = self.make_header(
            header::REPLY,
            &encode_instance_ids(&[to]),
            &encode_slot_functions(&[(to.to_string(), vec![header::REPLY.to_string()])]),
        );
        header.set(header::REPLY_FROM, reply_to);
        let body = match result {
            Ok(args) => {
                header.set(header::ERROR, false);
                args.to_body()
            }
            Err(e) => {
                header.set(header::ERROR, true);
                let (message, details) = e.to_reply();
                crate::args![message, details].to_body()
            }
        };
        self.inner.broker.publish(Message::new(header, body)).await
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Subscribe to topology changes.
    pub fn instance_events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.events.subscribe()
    }

    /// Peers currently known from presence messages.
    pub fn known_instances(&self) -> Vec<(String, Hash)> {
        self.inner.tracker.lock().snapshot()
    }

    /// Info of a known peer.
    pub fn instance_info(&self, id: &str) -> Option<Hash> {
        self.inner.tracker.lock().info(id).cloned()
    }

    /// Ask every instance to announce itself through `slotPingAnswer`.
    pub async fn discover(&self) -> KaraboResult<()> {
        self.call(BROADCAST, "slotPing", crate::args![self.instance_id(), 0i32, false])
            .await
    }

    fn register_reserved_slots(&self) {
        let weak = Arc::downgrade(&self.inner);

        let w = weak.clone();
        self.register_slot_with(
            "slotPing",
            SlotMode::Inline,
            handler(move |_args, ctx| {
                let w = w.clone();
                async move {
                    let inner = w.upgrade().ok_or_else(stopped)?;
                    let me = SignalSlotable { inner };
                    let answer = crate::args![me.instance_id(), me.info()];
                    if !ctx.is_request() && ctx.sender != me.instance_id() {
                        me.call(&ctx.sender, "slotPingAnswer", answer).await?;
                        return Ok(Args::new());
                    }
                    Ok(answer)
                }
            }),
        );

        for (slot, kind) in [
            ("slotInstanceNew", PresenceKind::New),
            ("slotPingAnswer", PresenceKind::New),
            ("slotInstanceUpdated", PresenceKind::Updated),
            ("slotInstanceGone", PresenceKind::Gone),
            ("slotHeartbeat", PresenceKind::Beat),
        ] {
            let w = weak.clone();
            self.register_slot_with(
                slot,
                SlotMode::Inline,
                handler(move |args, _ctx| {
                    let w = w.clone();
                    async move {
                        let inner = w.upgrade().ok_or_else(stopped)?;
                        SignalSlotable { inner }.on_presence(kind, &args).await;
                        Ok(Args::new())
                    }
                }),
            );
        }

        let w = weak.clone();
        self.register_slot_with(
            "slotConnectToSignal",
            SlotMode::Inline,
            handler(move |args, _ctx| {
                let w = w.clone();
                async move {
                    let inner = w.upgrade().ok_or_else(stopped)?;
                    let me = SignalSlotable { inner };
                    let ok = me.add_subscriber(
                        &args.get::<String>(0)?,
                        &args.get::<String>(1)?,
                        &args.get::<String>(2)?,
                    );
                    Ok(crate::args![ok])
                }
            }),
        );

        let w = weak;
        self.register_slot_with(
            "slotDisconnectFromSignal",
            SlotMode::Inline,
            handler(move |args, _ctx| {
                let w = w.clone();
                async move {
                    let inner = w.upgrade().ok_or_else(stopped)?;
                    let me = SignalSlotable { inner };
                    let ok = me.remove_subscriber(
                        &args.get::<String>(0)?,
                        &args.get::<String>(1)?,
                        &args.get::<String>(2)?,
                    );
                    Ok(crate::args![ok])
                }
            }),
        );
    }

    async fn on_presence(&self, kind: PresenceKind, args: &Args) {
        let Ok(id) = args.get::<String>(0) else {
            return;
        };
        if id == self.instance_id() {
            return;
        }
        let (info, interval) = match kind {
            PresenceKind::Beat => (args.get::<Hash>(2).unwrap_or_default(), args.get::<u64>(1).ok()),
            _ => (args.get::<Hash>(1).unwrap_or_default(), None),
        };
        let event = match kind {
            PresenceKind::Gone => {
                let last = self.inner.tracker.lock().remove(&id);
                self.forget_subscriber(&id);
                Some(InstanceEvent::Gone {
                    instance_id: id.clone(),
                    info: last.unwrap_or(info),
                })
            }
            PresenceKind::Updated => {
                self.inner.tracker.lock().seen(&id, &info, interval);
                Some(InstanceEvent::Updated {
                    instance_id: id.clone(),
                    info,
                })
            }
            PresenceKind::New | PresenceKind::Beat => {
                let fresh = self.inner.tracker.lock().seen(&id, &info, interval);
                if matches!(kind, PresenceKind::New) {
                    self.resubscribe(&id).await;
                }
                fresh.then(|| InstanceEvent::New {
                    instance_id: id.clone(),
                    info,
                })
            }
        };
        if let Some(event) = event {
            let _ = self.inner.events.send(event);
        }
    }

    fn forget_subscriber(&self, id: &str) {
        for subs in self.inner.signals.write().values_mut() {
            subs.retain(|s| s.instance_id != id);
        }
    }

    /// Re-establish connections to signals of `id` after it (re)appeared.
    async fn resubscribe(&self, id: &str) {
        let wanted: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.signal_instance == id)
            .cloned()
            .collect();
        for c in wanted {
            let this = self.clone();
            // The reply arrives through the dispatcher that runs this handler.
            tokio::spawn(async move {
                let result = this
                    .request(&c.signal_instance, "slotConnectToSignal", crate::args![c.signal.as_str(), c.slot_instance.as_str(), c.slot.as_str()])
                    .wait_for_reply()
                    .await;
                match result {
                    Ok(_) => tracing::debug!(signal_instance = %c.signal_instance, signal = %c.signal, "re-subscribed"),
                    Err(e) => tracing::warn!(signal_instance = %c.signal_instance, signal = %c.signal, error = %e, "re-subscribe failed"),
                }
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PresenceKind {
    New,
    Updated,
    Gone,
    Beat,
}

fn stopped() -> KaraboError {
    KaraboError::Cancelled("instance stopped".into())
}

// =============================================================================
// Requests
// =============================================================================

/// Pending request built by [`SignalSlotable::request`].
#[must_use = "a request is only sent when awaited"]
pub struct Requestor {
    ssb: SignalSlotable,
    target: String,
    slot: String,
    args: Args,
    timeout: Duration,
}

/// Removes the waiter of a request when the wait ends or is cancelled.
struct PendingGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

impl Requestor {
    /// Override the timeout of this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send the request and wait for its reply.
    ///
    /// Fails with [`KaraboError::RequestTimeout`] when no reply arrives in
    /// time; a late reply is then dropped. Dropping the returned future
    /// cancels the wait the same way.
    pub async fn wait_for_reply(self) -> KaraboResult<Args> {
        let inner = self.ssb.inner.clone();
        let reply_id = format!("{}-{}", inner.instance_id, uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(reply_id.clone(), tx);
        let _guard = PendingGuard {
            inner: inner.clone(),
            id: reply_id.clone(),
        };

        let mut header = self.ssb.make_header(
            header::REQUEST,
            &encode_instance_ids(&[self.target.as_str()]),
            &encode_slot_functions(&[(self.target.clone(), vec![self.slot.clone()])]),
        );
        header.set(header::REPLY_TO, reply_id.as_str());
        inner
            .broker
            .publish(Message::new(header, self.args.to_body()))
            .await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(KaraboError::Cancelled(format!(
                "request of '{}' on '{}' abandoned",
                self.slot, self.target
            ))),
            Err(_) => Err(KaraboError::RequestTimeout {
                target: self.target,
                slot: self.slot,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Send the request and hand the outcome to `on_reply` in a new task.
    pub fn receive_async<F>(self, on_reply: F) -> JoinHandle<()>
    where
        F: FnOnce(KaraboResult<Args>) + Send + 'static,
    {
        let instance = self.ssb.instance_id().to_string();
        let event_loop = self.ssb.event_loop().clone();
        event_loop.create_task(instance, async move { on_reply(self.wait_for_reply().await) })
    }
}

// =============================================================================
// Background tasks
// =============================================================================

async fn dispatch_loop(inner: Arc<Inner>, mut inbox: Inbox) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let message = tokio::select! {
            m = inbox.recv() => match m {
                Some(m) => m,
                None => break,
            },
            _ = shutdown.wait_for(|s| *s) => break,
        };
        dispatch(&inner, &message).await;
    }
}

async fn dispatch(inner: &Arc<Inner>, message: &Message) {
    let function = message.header_str(header::SIGNAL_FUNCTION);
    if function == header::REPLY {
        let reply_from = message.header_str(header::REPLY_FROM);
        let waiter = inner.pending.lock().remove(&reply_from);
        match waiter {
            Some(tx) => {
                let args = Args::from_body(&message.body);
                let reply = if message.header.get::<bool>(header::ERROR).unwrap_or(false) {
                    Err(KaraboError::remote(
                        args.get_or::<String>(0, String::new()),
                        args.get_or::<String>(1, String::new()),
                    ))
                } else {
                    Ok(args)
                };
                let _ = tx.send(reply);
            }
            None => tracing::debug!(%reply_from, "late or unknown reply dropped"),
        }
        return;
    }

    let reply_to = (function == header::REQUEST)
        .then(|| message.header_str(header::REPLY_TO))
        .filter(|id| !id.is_empty());
    let sender = message.sender();
    let slot_functions = message.header_str(header::SLOT_FUNCTIONS);
    for slot in slots_for(&slot_functions, &inner.instance_id) {
        let ctx = CallContext {
            sender: sender.clone(),
            slot: slot.clone(),
            reply_to: reply_to.clone(),
            user: message.header_str(header::USER_NAME),
        };
        let entry = inner.slots.read().get(&slot).cloned();
        let Some((handler, mode)) = entry else {
            let err = KaraboError::SlotNotFound {
                instance_id: inner.instance_id.clone(),
                slot: slot.clone(),
            };
            tracing::debug!(instance_id = %inner.instance_id, %sender, %slot, "call of unknown slot dropped");
            if let Some(reply_to) = &reply_to {
                let me = SignalSlotable { inner: inner.clone() };
                let _ = me.send_reply(&sender, reply_to, Err(err)).await;
            }
            continue;
        };

        let me = SignalSlotable { inner: inner.clone() };
        let args = Args::from_body(&message.body);
        let job = run_slot(me, handler, args, ctx);
        match mode {
            SlotMode::Inline => job.await,
            SlotMode::Concurrent => {
                let task = inner.event_loop.create_task(inner.instance_id.clone(), job);
                drop(task);
            }
            SlotMode::Ordered => {
                let posted = inner
                    .strand
                    .lock()
                    .as_ref()
                    .is_some_and(|strand| strand.post(job));
                if !posted {
                    tracing::debug!(instance_id = %inner.instance_id, %slot, "instance stopping, call dropped");
                }
            }
        }
    }
}

async fn run_slot(me: SignalSlotable, handler: SlotHandler, args: Args, ctx: CallContext) {
    if !me.is_running() && ctx.slot != "slotPing" {
        return;
    }
    let slot = ctx.slot.clone();
    let sender = ctx.sender.clone();
    let reply_to = ctx.reply_to.clone();
    let result = match AssertUnwindSafe(handler(args, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(KaraboError::remote(
            format!("slot '{slot}' panicked"),
            String::new(),
        )),
    };
    if let Err(e) = &result {
        tracing::warn!(instance_id = %me.instance_id(), %slot, %sender, error = %e, "slot failed");
    }
    if let Some(reply_to) = reply_to {
        if let Err(e) = me.send_reply(&sender, &reply_to, result).await {
            tracing::warn!(instance_id = %me.instance_id(), %slot, error = %e, "could not send reply");
        }
    }
}

async fn heartbeat_loop(weak: Weak<Inner>) {
    let Some(first) = weak.upgrade().map(|i| i.heartbeat_secs.load(Ordering::Relaxed)) else {
        return;
    };
    let mut shutdown = match weak.upgrade() {
        Some(inner) => inner.shutdown.subscribe(),
        None => return,
    };
    let mut delay = Duration::from_millis(first * 500);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|s| *s) => return,
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let secs = inner.heartbeat_secs.load(Ordering::Relaxed);
        let me = SignalSlotable { inner };
        let args = crate::args![me.instance_id(), secs as i32, me.info()];
        if let Err(e) = me.call(BROADCAST, "slotHeartbeat", args).await {
            tracing::warn!(instance_id = %me.instance_id(), error = %e, "heartbeat failed");
        }
        delay = Duration::from_secs(secs);
    }
}

async fn expiry_loop(weak: Weak<Inner>) {
    let mut shutdown = match weak.upgrade() {
        Some(inner) => inner.shutdown.subscribe(),
        None => return,
    };
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.wait_for(|s| *s) => return,
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let gone = inner.tracker.lock().expire(Instant::now());
        let me = SignalSlotable { inner };
        for (id, info) in gone {
            tracing::info!(instance_id = %me.instance_id(), peer = %id, "peer missed heartbeats, declared gone");
            me.forget_subscriber(&id);
            let _ = me.inner.events.send(InstanceEvent::Gone { instance_id: id, info });
        }
    }
}

/// Instance info skeleton for `type` on `host`.
pub fn base_info(instance_type: &str, host: &str) -> Hash {
    let mut info = Hash::new();
    info.set("type", instance_type);
    info.set("host", host);
    info.set("lang", "rust");
    info.set("heartbeatInterval", 20i32);
    info
}

/// Convenience: connect to `config.url` and create an endpoint.
pub async fn endpoint(
    instance_id: &str,
    info: Hash,
    config: &crate::config::BrokerConfig,
) -> KaraboResult<SignalSlotable> {
    let broker = broker::connect(config).await?;
    Ok(SignalSlotable::new(instance_id, info, broker))
}
