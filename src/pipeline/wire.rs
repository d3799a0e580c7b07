//! Pipeline message encoding.

use bytes::Bytes;
use karabo_core::{binary, Hash};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::MetaData;
use crate::error::{KaraboError, KaraboResult};
use crate::frame;

/// One item queued on an output, already encoded.
#[derive(Debug, Clone)]
pub(crate) struct Item {
    pub bytes: Bytes,
    pub meta: MetaData,
}

/// What an output sends to one input.
#[derive(Debug, Clone)]
pub(crate) enum Outgoing {
    Data { items: Vec<Item>, schema_version: u32 },
    EndOfStream,
    Schema { version: u32, schema: Hash },
}

impl Outgoing {
    /// Data may be dropped by slowness policies, control messages never are.
    pub fn is_data(&self) -> bool {
        matches!(self, Outgoing::Data { .. })
    }
}

/// What an input receives.
#[derive(Debug)]
pub(crate) enum Incoming {
    Data { items: Vec<(Hash, MetaData)>, schema_version: u32 },
    EndOfStream,
    Schema { version: u32, schema: Hash },
}

pub(crate) async fn write_message<W>(writer: &mut W, message: &Outgoing) -> KaraboResult<()>
where
    W: AsyncWrite + Unpin,
{
    match message {
        Outgoing::Data { items, schema_version } => {
            let sizes: Vec<u32> = items.iter().map(|i| i.bytes.len() as u32).collect();
            let mut header = Hash::new();
            header.set("nData", items.len() as u32);
            header.set("byteSizes", sizes);
            header.set(
                "sourceInfo",
                items.iter().map(|i| i.meta.to_hash()).collect::<Vec<Hash>>(),
            );
            header.set("schemaVersion", *schema_version);
            frame::write_hash(writer, &header).await?;

            let total: usize = items.iter().map(|i| i.bytes.len()).sum();
            let len = u32::try_from(total)
                .ok()
                .filter(|len| (*len as usize) <= frame::MAX_FRAME_LEN)
                .ok_or_else(|| KaraboError::MalformedMessage(format!("chunk of {total} bytes too large")))?;
            writer.write_all(&len.to_be_bytes()).await?;
            for item in items {
                writer.write_all(&item.bytes).await?;
            }
        }
        Outgoing::EndOfStream => {
            let mut header = Hash::new();
            header.set("endOfStream", true);
            header.set("byteSizes", Vec::<u32>::new());
            frame::write_hash(writer, &header).await?;
            frame::write_frame(writer, &[]).await?;
        }
        Outgoing::Schema { version, schema } => {
            let mut header = Hash::new();
            header.set("reason", "schema");
            header.set("schemaVersion", *version);
            header.set("schema", schema.clone());
            frame::write_hash(writer, &header).await?;
            frame::write_frame(writer, &[]).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Read one message; `Ok(None)` when the output closed between messages.
pub(crate) async fn read_message<R>(reader: &mut R) -> KaraboResult<Option<Incoming>>
where
    R: AsyncRead + Unpin,
{
    let Some(header) = frame::read_hash(reader).await? else {
        return Ok(None);
    };
    let body = frame::read_frame(reader)
        .await?
        .ok_or_else(|| KaraboError::MalformedMessage("chunk header without body".into()))?;

    if header.get::<bool>("endOfStream").unwrap_or(false) {
        return Ok(Some(Incoming::EndOfStream));
    }
    if header.get::<String>("reason").is_ok_and(|r| r == "schema") {
        return Ok(Some(Incoming::Schema {
            version: header.get_as::<u32>("schemaVersion")?,
            schema: header.get::<Hash>("schema")?,
        }));
    }

    let sizes: Vec<u32> = header.get_as("byteSizes")?;
    let infos: Vec<Hash> = header.get("sourceInfo").unwrap_or_default();
    let schema_version = header.get_as::<u32>("schemaVersion").unwrap_or(0);
    let mut items = Vec::with_capacity(sizes.len());
    let mut pos = 0usize;
    for (i, size) in sizes.iter().enumerate() {
        let end = pos + *size as usize;
        if end > body.len() {
            return Err(KaraboError::MalformedMessage(format!(
                "chunk item {i} ends at {end}, body has {} bytes",
                body.len()
            )));
        }
        let data = binary::from_bytes(&body.slice(pos..end))
            .map_err(|e| KaraboError::MalformedMessage(e.to_string()))?;
        let meta = infos.get(i).map(MetaData::from_hash).unwrap_or_else(|| MetaData {
            source: String::new(),
            timestamp: karabo_core::Timestamp::now(),
        });
        items.push((data, meta));
        pos = end;
    }
    Ok(Some(Incoming::Data { items, schema_version }))
}

/// Input hello.
pub(crate) fn hello(instance_id: &str, distribution: &str, slowness: &str, max_queue_length: u32) -> Hash {
    let mut h = Hash::new();
    h.set("reason", "hello");
    h.set("instanceId", instance_id);
    h.set("memoryLocation", "remote");
    h.set("dataDistribution", distribution);
    h.set("onSlowness", slowness);
    h.set("maxQueueLength", max_queue_length);
    h
}

/// Credit for one message.
pub(crate) fn update(instance_id: &str) -> Hash {
    let mut h = Hash::new();
    h.set("reason", "update");
    h.set("instanceId", instance_id);
    h
}

/// Output handshake answering the hello.
pub(crate) fn handshake(schema_version: u32, schema: &Hash) -> Hash {
    let mut h = Hash::new();
    h.set("reason", "hello");
    h.set("schemaVersion", schema_version);
    h.set("schema", schema.clone());
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_core::{hash, Timestamp};

    #[tokio::test]
    async fn data_eos_and_schema_messages() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let items: Vec<Item> = (0..3)
            .map(|i| Item {
                bytes: binary::to_binary(&hash! { "n" => i }).unwrap(),
                meta: MetaData::new("dev:out", Timestamp::now()),
            })
            .collect();
        write_message(&mut a, &Outgoing::Data { items, schema_version: 4 }).await.unwrap();
        write_message(&mut a, &Outgoing::Schema { version: 5, schema: hash! { "x" => 1 } })
            .await
            .unwrap();
        write_message(&mut a, &Outgoing::EndOfStream).await.unwrap();
        drop(a);

        match read_message(&mut b).await.unwrap() {
            Some(Incoming::Data { items, schema_version }) => {
                assert_eq!(schema_version, 4);
                let ns: Vec<i32> = items.iter().map(|(h, _)| h.get::<i32>("n").unwrap()).collect();
                assert_eq!(ns, vec![0, 1, 2]);
                assert_eq!(items[0].1.source, "dev:out");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(read_message(&mut b).await.unwrap(), Some(Incoming::Schema { version: 5, .. })));
        assert!(matches!(read_message(&mut b).await.unwrap(), Some(Incoming::EndOfStream)));
        assert!(read_message(&mut b).await.unwrap().is_none());
    }
}
