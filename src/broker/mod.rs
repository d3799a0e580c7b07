//! Message bus abstraction.
//!
//! Every signal/slot endpoint talks to exactly one [`Broker`] shared by all
//! endpoints of the process. The bus delivers [`Message`]s addressed to
//! instance ids, or to every instance of the topic (broadcast), in order per
//! (sender, recipient) pair.
//!
//! Two implementations are selected by URL:
//!
//! | URL | Implementation |
//! |---|---|
//! | `inproc://<name>` | [`InprocBroker`]: process-local hub shared by name |
//! | `tcp://host:port` | [`TcpBroker`]: client of a [`TcpHub`] (the `karabo-broker` binary) |

mod inproc;
mod tcp;

pub use inproc::InprocBroker;
pub use tcp::{TcpBroker, TcpHub, HUB_QUEUE_CAPACITY};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use karabo_core::{binary, Hash};
use tokio::sync::{mpsc, watch};

use crate::config::BrokerConfig;
use crate::error::{KaraboError, KaraboResult};

/// Header keys of a message.
pub mod header {
    /// Sending instance.
    pub const SIGNAL_INSTANCE_ID: &str = "signalInstanceId";
    /// Signal name, or one of the call kinds below.
    pub const SIGNAL_FUNCTION: &str = "signalFunction";
    /// Recipients as `|id1||id2|`, or `|*|` for broadcast.
    pub const SLOT_INSTANCE_IDS: &str = "slotInstanceIds";
    /// Slots per recipient as `|id1:slotA,slotB||id2:slotC|`.
    pub const SLOT_FUNCTIONS: &str = "slotFunctions";
    /// Correlation id of a request.
    pub const REPLY_TO: &str = "replyTo";
    /// Correlation id answered by a reply.
    pub const REPLY_FROM: &str = "replyFrom";
    /// Set on replies that carry a failure.
    pub const ERROR: &str = "error";
    /// Send time in milliseconds since the epoch.
    pub const TIMESTAMP: &str = "MQTimestamp";
    /// Host of the sender.
    pub const HOST_NAME: &str = "hostName";
    /// Authenticated user tag of the sender.
    pub const USER_NAME: &str = "userName";

    /// `signalFunction` of a one-way slot call.
    pub const CALL: &str = "__call__";
    /// `signalFunction` of a request expecting a reply.
    pub const REQUEST: &str = "__request__";
    /// `signalFunction` of a reply.
    pub const REPLY: &str = "__reply__";
}

/// Recipient marker of broadcast messages.
pub const BROADCAST: &str = "*";

/// One bus message: `{header, body}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Routing and correlation data.
    pub header: Hash,
    /// Arguments, as `a1`, `a2`, ...
    pub body: Hash,
}

/// Who a message is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every instance of the topic.
    Broadcast,
    /// The listed instances.
    Instances(Vec<String>),
}

impl Message {
    /// Message from its parts.
    pub fn new(header: Hash, body: Hash) -> Self {
        Self { header, body }
    }

    /// `{header, body}` hash.
    pub fn to_hash(&self) -> Hash {
        let mut h = Hash::new();
        h.set("header", self.header.clone());
        h.set("body", self.body.clone());
        h
    }

    /// Split a `{header, body}` hash.
    pub fn from_hash(mut h: Hash) -> KaraboResult<Self> {
        let header = take_hash(&mut h, "header")?;
        let body = take_hash(&mut h, "body").unwrap_or_default();
        Ok(Self { header, body })
    }

    /// Binary encoding of the message hash.
    pub fn encode(&self) -> KaraboResult<Bytes> {
        Ok(binary::to_binary(&self.to_hash())?)
    }

    /// Decode bytes produced by [`encode`](Self::encode).
    pub fn decode(bytes: &Bytes) -> KaraboResult<Self> {
        let h = binary::from_bytes(bytes).map_err(|e| KaraboError::MalformedMessage(e.to_string()))?;
        Self::from_hash(h)
    }

    /// Header string field, empty when absent.
    pub fn header_str(&self, key: &str) -> String {
        self.header.get::<String>(key).unwrap_or_default()
    }

    /// Sender id.
    pub fn sender(&self) -> String {
        self.header_str(header::SIGNAL_INSTANCE_ID)
    }

    /// Recipients named in the header.
    pub fn recipients(&self) -> Recipients {
        let ids = decode_instance_ids(&self.header_str(header::SLOT_INSTANCE_IDS));
        if ids.iter().any(|id| id == BROADCAST) {
            Recipients::Broadcast
        } else {
            Recipients::Instances(ids)
        }
    }
}

fn take_hash(h: &mut Hash, key: &str) -> KaraboResult<Hash> {
    match h.get_value_mut(key) {
        Ok(karabo_core::Value::Hash(inner)) => Ok(std::mem::take(inner)),
        _ => Err(KaraboError::MalformedMessage(format!("message without '{key}'"))),
    }
}

/// Encode ids as `|id1||id2|`.
pub fn encode_instance_ids<S: AsRef<str>>(ids: &[S]) -> String {
    ids.iter().map(|id| format!("|{}|", id.as_ref())).collect()
}

/// Decode `|id1||id2|`.
pub fn decode_instance_ids(text: &str) -> Vec<String> {
    text.split('|')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Encode `(id, slots)` pairs as `|id1:a,b||id2:c|`.
pub fn encode_slot_functions(entries: &[(String, Vec<String>)]) -> String {
    entries
        .iter()
        .map(|(id, slots)| format!("|{id}:{}|", slots.join(",")))
        .collect()
}

/// Slots addressed to `instance_id` in a `slotFunctions` header.
pub fn slots_for(slot_functions: &str, instance_id: &str) -> Vec<String> {
    slot_functions
        .split('|')
        .filter_map(|entry| entry.split_once(':'))
        .filter(|(id, _)| *id == instance_id || *id == BROADCAST)
        .flat_map(|(_, slots)| slots.split(',').filter(|s| !s.is_empty()).map(str::to_string))
        .collect()
}

/// Connection state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    /// Messages flow.
    Connected,
    /// Connection lost; retrying with backoff.
    Reconnecting,
    /// Reconnect ceiling exceeded; the process should exit.
    Failed,
}

/// Receiving end of a subscription.
pub type Inbox = mpsc::UnboundedReceiver<Arc<Message>>;

/// Minimal bus contract: publish, subscribe by instance id, broadcast.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// URL this broker was created from.
    fn url(&self) -> &str;

    /// Topic isolating this group of instances.
    fn topic(&self) -> &str;

    /// Start receiving messages addressed to `instance_id` and broadcasts.
    async fn subscribe(&self, instance_id: &str) -> KaraboResult<Inbox>;

    /// Stop receiving for `instance_id`.
    async fn unsubscribe(&self, instance_id: &str) -> KaraboResult<()>;

    /// Route `message` according to its `slotInstanceIds` header.
    async fn publish(&self, message: Message) -> KaraboResult<()>;

    /// Connection state updates.
    fn status(&self) -> watch::Receiver<BrokerStatus>;
}

/// Create the broker named by `config.url`.
pub async fn connect(config: &BrokerConfig) -> KaraboResult<Arc<dyn Broker>> {
    if config.url.starts_with("inproc://") {
        Ok(Arc::new(InprocBroker::new(&config.url, &config.topic)))
    } else if config.url.starts_with("tcp://") {
        Ok(Arc::new(TcpBroker::connect(config).await?))
    } else {
        Err(KaraboError::Config(format!("unsupported broker url '{}'", config.url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_core::hash;

    #[test]
    fn instance_id_lists() {
        let text = encode_instance_ids(&["a", "b"]);
        assert_eq!(text, "|a||b|");
        assert_eq!(decode_instance_ids(&text), vec!["a", "b"]);
        assert!(decode_instance_ids("").is_empty());
    }

    #[test]
    fn slot_function_lists() {
        let text = encode_slot_functions(&[
            ("a".into(), vec!["s1".into(), "s2".into()]),
            ("b".into(), vec!["s3".into()]),
        ]);
        assert_eq!(text, "|a:s1,s2||b:s3|");
        assert_eq!(slots_for(&text, "a"), vec!["s1", "s2"]);
        assert_eq!(slots_for(&text, "b"), vec!["s3"]);
        assert!(slots_for(&text, "c").is_empty());
        assert_eq!(slots_for("|*:slotHeartbeat|", "anyone"), vec!["slotHeartbeat"]);
    }

    #[test]
    fn message_codec() {
        let m = Message::new(
            hash! { header::SIGNAL_INSTANCE_ID => "x", header::SLOT_INSTANCE_IDS => "|*|" },
            hash! { "a1" => 5 },
        );
        let back = Message::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.recipients(), Recipients::Broadcast);
        assert_eq!(back.sender(), "x");
        assert!(Message::from_hash(hash! { "body" => Hash::new() }).is_err());
    }
}
