//! Connection options exchanged before any RPC frame.
//!
//! The options record is the first thing a client writes on a new
//! connection. It is encoded as a single line of JSON so the server can
//! decode it before any codec has been chosen:
//!
//! ```text
//! {"MagicNumber":3927900,"CodecType":"application/msgpack"}\n
//! ```
//!
//! # Example
//!
//! ```
//! use poseidon::protocol::{Options, MAGIC_NUMBER};
//!
//! let options = Options::default();
//! let line = options.encode_line().unwrap();
//! let decoded = Options::decode_line(&line).unwrap();
//! assert_eq!(decoded.magic_number, MAGIC_NUMBER);
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{CodecRegistry, NewCodecFn, DEFAULT_CODEC};
use crate::error::{RpcError, Result};

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Upper bound on the encoded options line, newline included.
pub const MAX_OPTIONS_LEN: u64 = 4096;

/// Negotiation record sent once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`].
    pub magic_number: u32,
    /// Name of the codec used for every frame after the options.
    pub codec_type: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: DEFAULT_CODEC.to_string(),
        }
    }
}

impl Options {
    /// Options selecting `codec_type` with the protocol magic number.
    pub fn new(codec_type: &str) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec_type.to_string(),
        }
    }

    /// Force the protocol magic number and fill in the default codec if
    /// none was chosen.
    pub fn normalized(mut self) -> Self {
        self.magic_number = MAGIC_NUMBER;
        if self.codec_type.is_empty() {
            self.codec_type = DEFAULT_CODEC.to_string();
        }
        self
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn encode_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON line; surrounding whitespace is ignored.
    pub fn decode_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Check the magic number and resolve the codec constructor.
    pub fn validate(&self, codecs: &CodecRegistry) -> Result<NewCodecFn> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(RpcError::InvalidMagicNumber(self.magic_number));
        }
        codecs
            .lookup(&self.codec_type)
            .ok_or_else(|| RpcError::InvalidCodecType(self.codec_type.clone()))
    }

    /// Write the options line and flush.
    ///
    /// Uses an explicit `\n` so the peer can read exactly one line.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut line = self.encode_line()?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one options line.
    ///
    /// Only the line itself is consumed; bytes after the newline stay in
    /// `reader`'s buffer for the codec.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        let n = reader.take(MAX_OPTIONS_LEN).read_line(&mut line).await?;
        if n == 0 {
            return Err(RpcError::ConnectionClosed);
        }
        if !line.ends_with('\n') {
            return Err(RpcError::Protocol(format!(
                "options line not terminated within {} bytes",
                MAX_OPTIONS_LEN
            )));
        }
        Self::decode_line(&line)
    }
}
