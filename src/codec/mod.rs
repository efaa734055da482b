//! Codec module - encoding of Header/Body frames on a connection.
//!
//! A codec is built from one bidirectional transport and split into two
//! independent halves so the receive side and the send side of a connection
//! can run concurrently:
//!
//! - [`CodecReader`] - `read_header`, `read_body`, `discard_body`
//! - [`CodecWriter`] - `write` (header + body as one unit), `close`
//!
//! Bodies travel as bytes already encoded in the codec's [`BodyFormat`].
//! Typed arguments and replies are encoded and decoded straight through that
//! format at the edges, so a value never passes through an intermediate
//! model that could lose floats, byte strings or non-string map keys.
//!
//! Codecs are looked up by name in a [`CodecRegistry`]. The default registry
//! contains only [`MSGPACK_CODEC`]; [`JSON_CODEC`] ships with the crate and can
//! be registered explicitly.
//!
//! # Example
//!
//! ```
//! use poseidon::codec::{CodecRegistry, JsonCodec, JSON_CODEC, MSGPACK_CODEC};
//!
//! let mut codecs = CodecRegistry::default();
//! assert!(codecs.lookup(MSGPACK_CODEC).is_some());
//! assert!(codecs.lookup(JSON_CODEC).is_none());
//!
//! codecs.register(JSON_CODEC, JsonCodec::new_codec);
//! assert!(codecs.lookup(JSON_CODEC).is_some());
//! ```

mod json;
mod msgpack;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::transport::BoxTransport;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Name of the bundled binary codec.
pub const MSGPACK_CODEC: &str = "application/msgpack";

/// Name of the bundled newline-delimited JSON codec.
pub const JSON_CODEC: &str = "application/json";

/// Codec selected when the client does not choose one.
pub const DEFAULT_CODEC: &str = MSGPACK_CODEC;

/// Boxed future returned by codec halves.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Frame body: one value encoded in the connection's [`BodyFormat`].
pub type Body = Bytes;

/// Serialization used for bodies on a connection.
///
/// Every codec names the format its bodies use; the client and the server
/// encode typed values with it before handing bytes to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    /// MessagePack, structs as maps (`to_vec_named`).
    MsgPack,
    /// Compact JSON, never containing a raw newline.
    Json,
}

impl BodyFormat {
    /// Encode `value` as a body.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error if `value` cannot be represented.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Body> {
        let bytes = match self {
            BodyFormat::MsgPack => MsgPackCodec::encode(value)?,
            BodyFormat::Json => serde_json::to_vec(value)?,
        };
        Ok(Bytes::from(bytes))
    }

    /// Decode a body into `T`.
    ///
    /// A body that does not fit `T` is [`RpcError::Decode`]: the frame was
    /// read intact, only this value is unusable.
    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T> {
        let decoded = match self {
            BodyFormat::MsgPack => rmp_serde::from_slice(body).map_err(|e| e.to_string()),
            BodyFormat::Json => serde_json::from_slice(body).map_err(|e| e.to_string()),
        };
        decoded.map_err(RpcError::Decode)
    }

    /// The encoded unit value, sent as the body of error responses.
    pub fn unit(self) -> Body {
        match self {
            BodyFormat::MsgPack => Bytes::from_static(&[0xc0]),
            BodyFormat::Json => Bytes::from_static(b"null"),
        }
    }
}

/// Header preceding every body on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Target in the form `"Service.Method"`.
    pub service_method: String,
    /// Sequence number chosen by the client.
    pub seq: u64,
    /// Empty on success, otherwise the error text of a failed request.
    pub error: String,
}

impl Header {
    /// Create a request header.
    pub fn new(service_method: &str, seq: u64) -> Self {
        Self {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        }
    }
}

/// Receive half of a codec.
pub trait CodecReader: Send + 'static {
    /// Read the next header.
    fn read_header(&mut self) -> BoxFuture<'_, Result<Header>>;

    /// Read the encoded body that follows the last header.
    fn read_body(&mut self) -> BoxFuture<'_, Result<Body>>;

    /// Consume the body that follows the last header without keeping it.
    fn discard_body(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.read_body().await.map(drop) })
    }
}

/// Send half of a codec.
pub trait CodecWriter: Send + 'static {
    /// Write a header and its body as one unit and flush.
    ///
    /// A frame that cannot be encoded (or is too large) is rejected before
    /// any byte reaches the stream, so the stream stays usable. If the stream
    /// fails after bytes of the frame reached it, the writer shuts the stream
    /// down before returning the error.
    fn write<'a>(&'a mut self, header: &'a Header, body: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Shut the write side of the stream down.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Both halves of a codec built over one transport.
pub struct CodecPair {
    /// Receive half.
    pub reader: Box<dyn CodecReader>,
    /// Send half.
    pub writer: Box<dyn CodecWriter>,
    /// Format of the bodies both halves carry.
    pub format: BodyFormat,
}

/// Constructor registered for a codec name.
pub type NewCodecFn = fn(BoxTransport) -> CodecPair;

/// Registry mapping codec names to constructors.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, NewCodecFn>,
}

impl CodecRegistry {
    /// Create a registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register(&mut self, name: &str, constructor: NewCodecFn) {
        self.codecs.insert(name.to_string(), constructor);
    }

    /// Look up the constructor for `name`.
    pub fn lookup(&self, name: &str) -> Option<NewCodecFn> {
        self.codecs.get(name).copied()
    }

    /// Registered codec names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MSGPACK_CODEC, MsgPackCodec::new_codec);
        registry
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::io::duplex;

    #[test]
    fn test_default_registry_has_only_msgpack() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.names(), vec![MSGPACK_CODEC]);
        assert!(registry.lookup(JSON_CODEC).is_none());
        assert!(CodecRegistry::empty().lookup(MSGPACK_CODEC).is_none());
    }

    #[test]
    fn test_header_wire_names() {
        let header = Header::new("Foo.Sum", 3);
        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value, json!({"ServiceMethod": "Foo.Sum", "Seq": 3, "Error": ""}));
    }

    #[test]
    fn test_unit_body_decodes_as_unit() {
        for format in [BodyFormat::MsgPack, BodyFormat::Json] {
            assert_eq!(format.encode(&()).unwrap(), format.unit());
            let decoded: Option<i64> = format.decode(&format.unit()).unwrap();
            assert_eq!(decoded, None);
        }
    }

    #[test]
    fn test_decode_mismatch_is_decode_error() {
        for format in [BodyFormat::MsgPack, BodyFormat::Json] {
            let body = format.encode("not a number").unwrap();
            let err = format.decode::<i64>(&body).unwrap_err();
            assert!(matches!(err, RpcError::Decode(_)), "{:?}: {}", format, err);
        }
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        ratio: f64,
        #[serde(with = "serde_bytes")]
        blob: Vec<u8>,
        by_id: HashMap<u32, String>,
    }

    /// Values outside the JSON data model come back exactly over msgpack.
    #[tokio::test]
    async fn test_msgpack_keeps_nan_bytes_and_integer_keys() {
        let (left, right) = duplex(64 * 1024);
        let mut sender = MsgPackCodec::new_codec(Box::new(left));
        let mut receiver = MsgPackCodec::new_codec(Box::new(right));

        let sample = Sample {
            ratio: f64::NAN,
            blob: vec![0, 1, 2, 0xff],
            by_id: HashMap::from([(7, "seven".to_string())]),
        };
        let body = sender.format.encode(&sample).unwrap();
        sender.writer.write(&Header::new("Blob.Put", 1), &body).await.unwrap();

        receiver.reader.read_header().await.unwrap();
        let got: Sample = receiver.format.decode(&receiver.reader.read_body().await.unwrap()).unwrap();
        assert!(got.ratio.is_nan());
        assert_eq!(got.blob, sample.blob);
        assert_eq!(got.by_id, sample.by_id);

        // A byte buffer is a msgpack bin, not an array of integers.
        let raw: serde_bytes::ByteBuf = BodyFormat::MsgPack
            .decode(&BodyFormat::MsgPack.encode(&serde_bytes::Bytes::new(&sample.blob)).unwrap())
            .unwrap();
        assert_eq!(raw.into_vec(), sample.blob);
    }

    /// Header+Body pairs survive every registered codec unchanged.
    #[tokio::test]
    async fn test_round_trip_every_codec() {
        let mut registry = CodecRegistry::default();
        registry.register(JSON_CODEC, JsonCodec::new_codec);

        let error_header = Header {
            service_method: "Arith.Div".to_string(),
            seq: u64::MAX,
            error: "division by zero".to_string(),
        };
        let nested = json!({"key": "a", "values": [1, -2, 3.5], "nested": {"ok": true}});

        for name in registry.names() {
            let constructor = registry.lookup(name).unwrap();
            let (left, right) = duplex(64 * 1024);
            let mut sender = constructor(Box::new(left));
            let mut receiver = constructor(Box::new(right));
            let format = sender.format;
            assert_eq!(receiver.format, format);

            let frames = vec![
                (Header::new("Foo.Sum", 1), format.encode("rpc 0").unwrap()),
                (error_header.clone(), format.unit()),
                (Header::new("Kv.Put", 42), format.encode(&nested).unwrap()),
            ];

            for (header, body) in &frames {
                sender.writer.write(header, body).await.unwrap();
            }
            for (header, body) in &frames {
                assert_eq!(&receiver.reader.read_header().await.unwrap(), header, "{}", name);
                assert_eq!(&receiver.reader.read_body().await.unwrap(), body, "{}", name);
            }
            let value: serde_json::Value = format.decode(&frames[2].1).unwrap();
            assert_eq!(value, nested);

            // Discarding a body keeps the next frame aligned.
            sender.writer.write(&frames[2].0, &frames[2].1).await.unwrap();
            sender.writer.write(&frames[0].0, &frames[0].1).await.unwrap();
            receiver.reader.read_header().await.unwrap();
            receiver.reader.discard_body().await.unwrap();
            assert_eq!(receiver.reader.read_header().await.unwrap(), frames[0].0);
            let text: String = format.decode(&receiver.reader.read_body().await.unwrap()).unwrap();
            assert_eq!(text, "rpc 0");
        }
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        for constructor in [MsgPackCodec::new_codec as NewCodecFn, JsonCodec::new_codec] {
            let (left, right) = duplex(1024);
            let mut sender = constructor(Box::new(left));
            let mut receiver = constructor(Box::new(right));

            sender.writer.close().await.unwrap();
            let err = receiver.reader.read_header().await.unwrap_err();
            assert!(err.is_eof(), "unexpected error: {}", err);
        }
    }
}
