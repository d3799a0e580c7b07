//! Length-prefixed framing shared by the TCP broker and pipeline channels.
//!
//! Every frame is `[u32 big-endian length][payload]`. Hash frames carry one
//! binary encoded [`Hash`].

use bytes::{Bytes, BytesMut};
use karabo_core::{binary, Hash};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KaraboError, KaraboResult};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> KaraboResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            KaraboError::MalformedMessage(format!("frame of {} bytes too large", payload.len()))
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream before the length.
pub async fn read_frame<R>(reader: &mut R) -> KaraboResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(KaraboError::MalformedMessage(format!(
            "announced frame of {len} bytes too large"
        )));
    }
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// Encode `hash` and write it as one frame.
pub async fn write_hash<W>(writer: &mut W, hash: &Hash) -> KaraboResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = binary::to_binary(hash)?;
    write_frame(writer, &bytes).await
}

/// Read one frame and decode it as a hash.
pub async fn read_hash<R>(reader: &mut R) -> KaraboResult<Option<Hash>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(bytes) => binary::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| KaraboError::MalformedMessage(e.to_string())),
        None => Ok(None),
    }
}
