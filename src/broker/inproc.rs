//! Process-local broker.
//!
//! Hubs are shared by `(url, topic)`: two endpoints created with the same
//! `inproc://` URL and topic see each other, other combinations are isolated.
//! Routing happens synchronously inside `publish`, which keeps per-sender
//! order intact.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Broker, BrokerStatus, Inbox, Message, Recipients};
use crate::error::{KaraboError, KaraboResult};

static HUBS: Lazy<Mutex<HashMap<String, Weak<InprocHub>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default)]
struct InprocHub {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Arc<Message>>>>,
}

impl InprocHub {
    fn shared(key: &str) -> Arc<InprocHub> {
        let mut hubs = HUBS.lock();
        if let Some(hub) = hubs.get(key).and_then(Weak::upgrade) {
            return hub;
        }
        let hub = Arc::new(InprocHub::default());
        hubs.retain(|_, weak| weak.strong_count() > 0);
        hubs.insert(key.to_string(), Arc::downgrade(&hub));
        hub
    }

    fn route(&self, message: Message) {
        let message = Arc::new(message);
        let mut routes = self.routes.lock();
        match message.recipients() {
            Recipients::Broadcast => {
                routes.retain(|_, tx| tx.send(message.clone()).is_ok());
            }
            Recipients::Instances(ids) => {
                for id in ids {
                    match routes.get(&id) {
                        Some(tx) if tx.send(message.clone()).is_ok() => {}
                        Some(_) => {
                            routes.remove(&id);
                        }
                        None => tracing::trace!(recipient = %id, "no route, message dropped"),
                    }
                }
            }
        }
    }
}

/// Broker for endpoints living in the same process.
pub struct InprocBroker {
    url: String,
    topic: String,
    hub: Arc<InprocHub>,
    status: watch::Sender<BrokerStatus>,
}

impl InprocBroker {
    /// Join (or create) the hub for `url` and `topic`.
    pub fn new(url: &str, topic: &str) -> Self {
        let (status, _) = watch::channel(BrokerStatus::Connected);
        Self {
            url: url.to_string(),
            topic: topic.to_string(),
            hub: InprocHub::shared(&format!("{url}#{topic}")),
            status,
        }
    }
}

#[async_trait]
impl Broker for InprocBroker {
    fn url(&self) -> &str {
        &self.url
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe(&self, instance_id: &str) -> KaraboResult<Inbox> {
        let mut routes = self.hub.routes.lock();
        if routes.get(instance_id).is_some_and(|tx| !tx.is_closed()) {
            return Err(KaraboError::InstanceExists(instance_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(instance_id.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, instance_id: &str) -> KaraboResult<()> {
        self.hub.routes.lock().remove(instance_id);
        Ok(())
    }

    async fn publish(&self, message: Message) -> KaraboResult<()> {
        self.hub.route(message);
        Ok(())
    }

    fn status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{encode_instance_ids, header};
    use karabo_core::hash;

    fn addressed(to: &str, n: i32) -> Message {
        Message::new(
            hash! { header::SLOT_INSTANCE_IDS => encode_instance_ids(&[to]) },
            hash! { "a1" => n },
        )
    }

    #[tokio::test]
    async fn routes_by_id_and_broadcast() {
        let broker = InprocBroker::new("inproc://routes", "t");
        let mut a = broker.subscribe("a").await.unwrap();
        let mut b = broker.subscribe("b").await.unwrap();

        broker.publish(addressed("a", 1)).await.unwrap();
        broker.publish(addressed("*", 2)).await.unwrap();

        assert_eq!(a.recv().await.unwrap().body.get::<i32>("a1").unwrap(), 1);
        assert_eq!(a.recv().await.unwrap().body.get::<i32>("a1").unwrap(), 2);
        assert_eq!(b.recv().await.unwrap().body.get::<i32>("a1").unwrap(), 2);
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn topics_are_isolated_and_ids_unique() {
        let one = InprocBroker::new("inproc://iso", "one");
        let two = InprocBroker::new("inproc://iso", "two");
        let mut x1 = one.subscribe("x").await.unwrap();
        let _x2 = two.subscribe("x").await.unwrap();
        assert!(matches!(one.subscribe("x").await, Err(KaraboError::InstanceExists(_))));

        two.publish(addressed("x", 7)).await.unwrap();
        assert!(x1.try_recv().is_err());

        one.unsubscribe("x").await.unwrap();
        assert!(one.subscribe("x").await.is_ok());
    }

    #[tokio::test]
    async fn order_is_preserved() {
        let broker = InprocBroker::new("inproc://order", "t");
        let mut rx = broker.subscribe("r").await.unwrap();
        for i in 0..1000 {
            broker.publish(addressed("r", i)).await.unwrap();
        }
        for i in 0..1000 {
            assert_eq!(rx.recv().await.unwrap().body.get::<i32>("a1").unwrap(), i);
        }
    }
}
