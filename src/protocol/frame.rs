//! Length-prefixed value framing.
//!
//! Every value written by the binary codec is one frame:
//! ```text
//! ┌──────────┬─────────────────────────┐
//! │ Length   │ Encoded value           │
//! │ 4 bytes  │ `Length` bytes          │
//! │ uint32 BE│                         │
//! └──────────┴─────────────────────────┘
//! ```
//!
//! A Header+Body pair is two consecutive frames.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RpcError, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum size of one encoded value (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Append one length-prefixed frame to `buf`.
///
/// # Errors
///
/// Returns a protocol error if `payload` is larger than `max_frame_size`.
pub fn encode_frame_into(buf: &mut BytesMut, payload: &[u8], max_frame_size: u32) -> Result<()> {
    let len = check_frame_len(payload.len() as u64, max_frame_size)?;
    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(())
}

/// Read the length prefix of the next frame.
///
/// End-of-stream before the first prefix byte is reported as
/// [`RpcError::ConnectionClosed`].
async fn read_frame_len<R>(reader: &mut R, max_frame_size: u32) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let first = reader.read(&mut prefix[..1]).await?;
    if first == 0 {
        return Err(RpcError::ConnectionClosed);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let len = u32::from_be_bytes(prefix);
    check_frame_len(len as u64, max_frame_size)
}

/// Read one complete frame payload.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = read_frame_len(reader, max_frame_size).await?;
    let mut payload = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut payload).await?;
    Ok(payload.freeze())
}

/// Consume one frame without keeping its payload.
pub async fn skip_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let len = read_frame_len(reader, max_frame_size).await? as u64;
    let skipped = tokio::io::copy(&mut reader.take(len), &mut tokio::io::sink()).await?;
    if skipped < len {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream ended inside a frame",
        )));
    }
    Ok(())
}

fn check_frame_len(len: u64, max_frame_size: u32) -> Result<u32> {
    if len > max_frame_size as u64 {
        return Err(RpcError::Protocol(format!(
            "Frame size {} exceeds maximum {}",
            len, max_frame_size
        )));
    }
    Ok(len as u32)
}
