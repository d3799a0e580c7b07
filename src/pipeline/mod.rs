//! Point-to-point data pipelines.
//!
//! Bulk data bypasses the broker: an [`OutputChannel`] listens on a TCP port,
//! and every [`InputChannel`] configured with `deviceId:channelName` opens a
//! connection to it. The broker is only used to look up where an output
//! listens ([`ChannelResolver`]).
//!
//! ## Protocol
//!
//! Every message is two length-prefixed frames (see [`crate::frame`]): a
//! header hash and a body.
//!
//! 1. input → output: hello `{reason: "hello", instanceId, dataDistribution,
//!    onSlowness, maxQueueLength}`
//! 2. output → input: handshake `{reason: "hello", schemaVersion, schema}`
//! 3. input → output: one `{reason: "update"}` per message it is ready to take
//! 4. output → input, per credit, one of
//!    - data: `{nData, byteSizes, sourceInfo, schemaVersion}` + concatenated
//!      encoded item hashes
//!    - end of stream: `{endOfStream: true}` + empty body
//!    - schema update: `{reason: "schema", schemaVersion, schema}` + empty body
//!
//! ## Policies
//!
//! | Input `onSlowness` | Output behaviour when the input is busy |
//! |---|---|
//! | `wait` | writer blocks until the input took the previous chunk |
//! | `drop` | chunk is discarded for this input |
//! | `queue` | up to `maxQueueLength` chunks are buffered, then the writer blocks |
//! | `queueDrop` | up to `maxQueueLength` chunks are buffered, then the oldest is discarded |
//!
//! Inputs with `dataDistribution = shared` get the chunks round-robin instead
//! of a copy each; the output's `noInputShared` policy applies when the next
//! shared input is busy. End-of-stream and schema updates reach every input
//! regardless of policy.

mod input;
mod output;
mod queue;
mod wire;

pub use input::{
    BatchHandler, DataHandler, EventHandler, InputBatch, InputChannel, InputConfig, InputHandlers,
};
pub use output::{OutputChannel, OutputConfig};

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use karabo_core::{Hash, Timestamp};
use parking_lot::RwLock;

use crate::error::{KaraboError, KaraboResult};
use crate::signal_slot::WeakSignalSlotable;

/// Default `maxQueueLength` of inputs.
pub const DEFAULT_MAX_QUEUE_LENGTH: u32 = 2;

/// Outputs never buffer more than this many chunks per input.
pub const MAX_QUEUE_LENGTH: u32 = 10;

/// How chunks are spread over several inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDistribution {
    /// Every input receives every chunk.
    #[default]
    Copy,
    /// Inputs sharing an output take turns.
    Shared,
}

impl DataDistribution {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            DataDistribution::Copy => "copy",
            DataDistribution::Shared => "shared",
        }
    }
}

impl FromStr for DataDistribution {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(DataDistribution::Copy),
            "shared" => Ok(DataDistribution::Shared),
            other => Err(KaraboError::Config(format!("unknown data distribution '{other}'"))),
        }
    }
}

/// What an output does when an input cannot keep up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnSlowness {
    /// Block the writer.
    Wait,
    /// Discard the chunk.
    #[default]
    Drop,
    /// Buffer, then block the writer.
    Queue,
    /// Buffer, then discard the oldest chunk.
    QueueDrop,
}

impl OnSlowness {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OnSlowness::Wait => "wait",
            OnSlowness::Drop => "drop",
            OnSlowness::Queue => "queue",
            OnSlowness::QueueDrop => "queueDrop",
        }
    }
}

impl FromStr for OnSlowness {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(OnSlowness::Wait),
            "drop" => Ok(OnSlowness::Drop),
            "queue" => Ok(OnSlowness::Queue),
            "queueDrop" => Ok(OnSlowness::QueueDrop),
            other => Err(KaraboError::Config(format!("unknown slowness policy '{other}'"))),
        }
    }
}

/// Per-item metadata travelling with pipeline data.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaData {
    /// `deviceId:channelName` of the writing output.
    pub source: String,
    /// Time (and train id) the item belongs to.
    pub timestamp: Timestamp,
}

impl MetaData {
    /// Metadata for `source` at `timestamp`.
    pub fn new(source: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            source: source.into(),
            timestamp,
        }
    }

    fn to_hash(&self) -> Hash {
        let mut h = Hash::new();
        h.set("source", self.source.as_str());
        let node = h.set("timestamp", true);
        self.timestamp.to_attributes(node.attributes_mut());
        h
    }

    fn from_hash(h: &Hash) -> Self {
        let timestamp = h
            .attributes("timestamp")
            .ok()
            .and_then(|attrs| Timestamp::from_attributes(attrs).ok())
            .unwrap_or_else(Timestamp::now);
        Self {
            source: h.get::<String>("source").unwrap_or_default(),
            timestamp,
        }
    }
}

/// Split `deviceId:channelName`.
pub fn split_channel_id(id: &str) -> KaraboResult<(&str, &str)> {
    match id.split_once(':') {
        Some((instance, channel)) if !instance.is_empty() && !channel.is_empty() => {
            Ok((instance, channel))
        }
        _ => Err(KaraboError::Config(format!(
            "'{id}' is not of the form <instanceId>:<channelName>"
        ))),
    }
}

/// Finds the address an output channel listens on.
#[async_trait]
pub trait ChannelResolver: Send + Sync + 'static {
    /// `{connectionType, hostname, port}` of `channel` on `instance_id`.
    async fn resolve(&self, instance_id: &str, channel: &str) -> KaraboResult<Hash>;
}

#[async_trait]
impl ChannelResolver for WeakSignalSlotable {
    async fn resolve(&self, instance_id: &str, channel: &str) -> KaraboResult<Hash> {
        let endpoint = self
            .upgrade()
            .ok_or_else(|| KaraboError::Cancelled("instance stopped".into()))?;
        let reply = endpoint
            .request(
                instance_id,
                "slotGetOutputChannelInformation",
                crate::args![channel, std::process::id() as i32],
            )
            .timeout(std::time::Duration::from_secs(2))
            .wait_for_reply()
            .await?;
        if !reply.get_or::<bool>(0, false) {
            return Err(KaraboError::Config(format!(
                "'{instance_id}' has no output channel '{channel}'"
            )));
        }
        reply.get::<Hash>(1)
    }
}

/// Resolver backed by a fixed table, for tests and static setups.
#[derive(Default)]
pub struct StaticResolver {
    table: RwLock<HashMap<String, Hash>>,
}

impl StaticResolver {
    /// Empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `output` under `deviceId:channelName`.
    pub fn insert(&self, id: &str, output: &OutputChannel) {
        self.table.write().insert(id.to_string(), output.information());
    }
}

#[async_trait]
impl ChannelResolver for StaticResolver {
    async fn resolve(&self, instance_id: &str, channel: &str) -> KaraboResult<Hash> {
        let id = format!("{instance_id}:{channel}");
        self.table
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KaraboError::Config(format!("unknown output channel '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names() {
        for p in [OnSlowness::Wait, OnSlowness::Drop, OnSlowness::Queue, OnSlowness::QueueDrop] {
            assert_eq!(p.as_str().parse::<OnSlowness>().unwrap(), p);
        }
        assert!("sometimes".parse::<OnSlowness>().is_err());
        assert_eq!("shared".parse::<DataDistribution>().unwrap(), DataDistribution::Shared);
    }

    #[test]
    fn channel_ids() {
        assert_eq!(split_channel_id("dev:output").unwrap(), ("dev", "output"));
        assert!(split_channel_id("dev").is_err());
        assert!(split_channel_id(":output").is_err());
    }

    #[test]
    fn metadata_hash() {
        let ts = Timestamp::now();
        let meta = MetaData::new("a:b", ts);
        assert_eq!(MetaData::from_hash(&meta.to_hash()), meta);
    }
}
