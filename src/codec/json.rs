//! Newline-delimited JSON codec.
//!
//! Each header and each body is one line of JSON. `serde_json` never emits a
//! raw newline inside a value, so a line is always exactly one value; a body
//! that contains one anyway is refused before anything is written.
//!
//! Not registered by default; opt in on both peers with
//! `registry.register(JSON_CODEC, JsonCodec::new_codec)`.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use bytes::Bytes;

use super::{Body, BodyFormat, BoxFuture, CodecPair, CodecReader, CodecWriter, Header};
use crate::error::{RpcError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::BoxTransport;

/// JSON-lines codec.
pub struct JsonCodec;

impl JsonCodec {
    /// Build both codec halves over `transport`.
    ///
    /// Registered under [`JSON_CODEC`](super::JSON_CODEC) when opted in.
    pub fn new_codec(transport: BoxTransport) -> CodecPair {
        let (read_half, write_half) = tokio::io::split(transport);
        CodecPair {
            reader: Box::new(JsonReader {
                reader: BufReader::new(read_half),
                line: String::new(),
            }),
            writer: Box::new(JsonWriter {
                writer: write_half,
                buf: Vec::with_capacity(1024),
            }),
            format: BodyFormat::Json,
        }
    }
}

/// Receive half of [`JsonCodec`].
struct JsonReader {
    reader: BufReader<ReadHalf<BoxTransport>>,
    /// Reused line buffer.
    line: String,
}

impl JsonReader {
    /// Read the next line into `self.line`, newline stripped.
    async fn next_line(&mut self) -> Result<()> {
        self.line.clear();
        let limit = DEFAULT_MAX_FRAME_SIZE as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_line(&mut self.line)
            .await?;

        if n == 0 {
            return Err(RpcError::ConnectionClosed);
        }
        if !self.line.ends_with('\n') {
            if n as u64 == limit {
                return Err(RpcError::Protocol(format!(
                    "JSON line exceeds maximum {}",
                    DEFAULT_MAX_FRAME_SIZE
                )));
            }
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a JSON line",
            )));
        }
        self.line.pop();
        Ok(())
    }
}

impl CodecReader for JsonReader {
    fn read_header(&mut self) -> BoxFuture<'_, Result<Header>> {
        Box::pin(async move {
            self.next_line().await?;
            Ok(serde_json::from_str(&self.line)?)
        })
    }

    fn read_body(&mut self) -> BoxFuture<'_, Result<Body>> {
        Box::pin(async move {
            self.next_line().await?;
            Ok(Bytes::copy_from_slice(self.line.as_bytes()))
        })
    }

    fn discard_body(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.next_line())
    }
}

/// Send half of [`JsonCodec`].
struct JsonWriter {
    writer: WriteHalf<BoxTransport>,
    buf: Vec<u8>,
}

impl CodecWriter for JsonWriter {
    fn write<'a>(&'a mut self, header: &'a Header, body: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if body.contains(&b'\n') {
                return Err(RpcError::Protocol(
                    "JSON body contains a raw newline".to_string(),
                ));
            }
            self.buf.clear();
            serde_json::to_writer(&mut self.buf, header)?;
            self.buf.push(b'\n');
            self.buf.extend_from_slice(body);
            self.buf.push(b'\n');

            let written = match self.writer.write_all(&self.buf).await {
                Ok(()) => self.writer.flush().await,
                Err(e) => Err(e),
            };

            if let Err(e) = written {
                tracing::warn!("rpc codec: json error writing frame: {}", e);
                let _ = self.writer.shutdown().await;
                return Err(e.into());
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_one_line_per_value() {
        let (left, mut right) = duplex(4096);
        let mut codec = JsonCodec::new_codec(Box::new(left));

        let body = codec.format.encode(&json!({"text": "a\nb"})).unwrap();
        codec.writer.write(&Header::new("Foo.Sum", 1), &body).await.unwrap();
        codec.writer.close().await.unwrap();

        let mut raw = String::new();
        right.read_to_string(&mut raw).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"ServiceMethod":"Foo.Sum","Seq":1,"Error":""}"#);
        assert_eq!(lines[1], r#"{"text":"a\nb"}"#);
    }

    #[tokio::test]
    async fn test_raw_newline_in_body_is_refused() {
        let (left, right) = duplex(4096);
        let mut sender = JsonCodec::new_codec(Box::new(left));
        let mut receiver = JsonCodec::new_codec(Box::new(right));

        let err = sender
            .writer
            .write(&Header::new("Foo.Sum", 1), b"1\n2")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));

        sender.writer.write(&Header::new("Foo.Sum", 2), b"3").await.unwrap();
        assert_eq!(receiver.reader.read_header().await.unwrap().seq, 2);
        assert_eq!(&receiver.reader.read_body().await.unwrap()[..], b"3");
    }

    #[tokio::test]
    async fn test_truncated_line_is_io_error() {
        let (mut left, right) = duplex(4096);
        let mut codec = JsonCodec::new_codec(Box::new(right));

        left.write_all(b"{\"ServiceMethod\":").await.unwrap();
        drop(left);

        let err = codec.reader.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[tokio::test]
    async fn test_malformed_header_is_json_error() {
        let (mut left, right) = duplex(4096);
        let mut codec = JsonCodec::new_codec(Box::new(right));

        left.write_all(b"[1, 2]\n").await.unwrap();

        let err = codec.reader.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Json(_)));
    }
}
