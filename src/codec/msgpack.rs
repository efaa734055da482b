//! MsgPack codec using `rmp-serde`.
//!
//! Every header and every body is a separate length-prefixed frame holding
//! one MessagePack document (see [`crate::protocol::frame`]). Bodies arrive
//! already encoded ([`BodyFormat::MsgPack`]) and are framed as they are.
//!
//! **Always** encode with `to_vec_named`: structs are written as maps with
//! field names, so headers stay readable by any MessagePack decoder and
//! field order never matters.
//!
//! # Example
//!
//! ```
//! use poseidon::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use super::{Body, BodyFormat, BoxFuture, CodecPair, CodecReader, CodecWriter, Header};
use crate::error::Result;
use crate::protocol::{encode_frame_into, read_frame, skip_frame, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::BoxTransport;

/// Read buffer size for the receive half.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Build both codec halves over `transport`.
    ///
    /// Registered under [`MSGPACK_CODEC`](super::MSGPACK_CODEC).
    pub fn new_codec(transport: BoxTransport) -> CodecPair {
        Self::with_max_frame_size(transport, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Build both codec halves with a custom frame size limit.
    pub fn with_max_frame_size(transport: BoxTransport, max_frame_size: u32) -> CodecPair {
        let (read_half, write_half) = tokio::io::split(transport);
        CodecPair {
            reader: Box::new(MsgPackReader {
                reader: BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
                max_frame_size,
            }),
            writer: Box::new(MsgPackWriter {
                writer: write_half,
                buf: BytesMut::with_capacity(4 * 1024),
                max_frame_size,
            }),
            format: BodyFormat::MsgPack,
        }
    }
}

/// Receive half of [`MsgPackCodec`].
struct MsgPackReader {
    reader: BufReader<ReadHalf<BoxTransport>>,
    max_frame_size: u32,
}

impl CodecReader for MsgPackReader {
    fn read_header(&mut self) -> BoxFuture<'_, Result<Header>> {
        Box::pin(async move {
            let frame = read_frame(&mut self.reader, self.max_frame_size).await?;
            MsgPackCodec::decode(&frame)
        })
    }

    fn read_body(&mut self) -> BoxFuture<'_, Result<Body>> {
        Box::pin(read_frame(&mut self.reader, self.max_frame_size))
    }

    fn discard_body(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(skip_frame(&mut self.reader, self.max_frame_size))
    }
}

/// Send half of [`MsgPackCodec`].
struct MsgPackWriter {
    writer: WriteHalf<BoxTransport>,
    /// Reused frame assembly buffer.
    buf: BytesMut,
    max_frame_size: u32,
}

impl MsgPackWriter {
    /// Frame header and body into `buf`; nothing touches the stream yet.
    fn encode_frame(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        self.buf.clear();
        let header_bytes = MsgPackCodec::encode(header).map_err(|e| {
            tracing::warn!("rpc codec: msgpack error encoding header: {}", e);
            e
        })?;
        encode_frame_into(&mut self.buf, &header_bytes, self.max_frame_size)?;
        encode_frame_into(&mut self.buf, body, self.max_frame_size)?;
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<()> {
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl CodecWriter for MsgPackWriter {
    fn write<'a>(&'a mut self, header: &'a Header, body: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.encode_frame(header, body)?;

            if let Err(e) = self.flush_frame().await {
                // A partially written frame cannot be resynchronized.
                let _ = self.writer.shutdown().await;
                return Err(e);
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.writer.shutdown().await?;
            Ok(())
        })
    }
}
