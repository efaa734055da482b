//! Error types for poseidon.
//!
//! Every failure surfaced by the runtime is an [`RpcError`]. Errors are
//! grouped into the policy kinds of [`ErrorKind`], which decide whether a
//! failure tears down a connection or stays local to one call.

use thiserror::Error;

/// Prefix the server puts in front of an unknown service name.
pub(crate) const SERVICE_NOT_FOUND_PREFIX: &str = "rpc server: can't find service ";
/// Prefix the server puts in front of an unknown method name.
pub(crate) const METHOD_NOT_FOUND_PREFIX: &str = "rpc server: can't find method ";
/// Prefix the server puts in front of a `service_method` without a separator.
pub(crate) const ILL_FORMED_PREFIX: &str = "rpc server: service/method request ill-formed: ";

/// Main error type for all poseidon operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol violation (oversized frame, malformed options, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer sent options carrying the wrong magic number.
    #[error("invalid magic number {0:#x}")]
    InvalidMagicNumber(u32),

    /// The requested codec type is not registered.
    #[error("invalid codec type {0}")]
    InvalidCodecType(String),

    /// Fatal stream failure shared with every call pending on the connection.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived before the caller's deadline.
    #[error("call timed out")]
    Timeout,

    /// The client was closed or its connection shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// The remote method returned an error.
    #[error("{0}")]
    Remote(String),

    /// A reply or argument body does not fit the expected type.
    #[error("reading body {0}")]
    Decode(String),

    /// The server has no service with this name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// The service has no method with this name.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// `service_method` is not of the form `Service.Method`.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedMethod(String),

    /// A service name is empty or does not start with an uppercase letter.
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    /// A service with this name is already registered.
    #[error("rpc: service already defined: {0}")]
    ServiceAlreadyDefined(String),
}

/// Coarse classification used by callers to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handshake or wire-format violation. Connection-fatal.
    Protocol,
    /// Transport failure or end-of-stream. Connection-fatal.
    Stream,
    /// The remote method failed. The connection survives.
    Application,
    /// Unknown service or method. The connection survives.
    Dispatch,
    /// The client is closed. No I/O was performed.
    Shutdown,
}

impl RpcError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Io(_)
            | RpcError::Stream(_)
            | RpcError::ConnectionClosed
            | RpcError::Timeout => ErrorKind::Stream,
            RpcError::Json(_)
            | RpcError::MsgPackEncode(_)
            | RpcError::MsgPackDecode(_)
            | RpcError::Protocol(_)
            | RpcError::InvalidMagicNumber(_)
            | RpcError::InvalidCodecType(_) => ErrorKind::Protocol,
            RpcError::Remote(_) | RpcError::Decode(_) => ErrorKind::Application,
            RpcError::ServiceNotFound(_)
            | RpcError::MethodNotFound(_)
            | RpcError::IllFormedMethod(_)
            | RpcError::InvalidServiceName(_)
            | RpcError::ServiceAlreadyDefined(_) => ErrorKind::Dispatch,
            RpcError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Rebuild an error from the text carried in a response header.
    ///
    /// Dispatch failures are recognized by the fixed prefixes the server
    /// renders them with; everything else is an application error.
    ///
    /// The header carries text only, so the `"rpc server: "` prefixes are
    /// reserved: an application error whose text starts with one of them is
    /// classified as the matching dispatch error. Its text is unchanged
    /// either way.
    pub fn from_remote(text: String) -> Self {
        if let Some(name) = text.strip_prefix(SERVICE_NOT_FOUND_PREFIX) {
            return RpcError::ServiceNotFound(name.to_string());
        }
        if let Some(name) = text.strip_prefix(METHOD_NOT_FOUND_PREFIX) {
            return RpcError::MethodNotFound(name.to_string());
        }
        if let Some(name) = text.strip_prefix(ILL_FORMED_PREFIX) {
            return RpcError::IllFormedMethod(name.to_string());
        }
        RpcError::Remote(text)
    }

    /// Produce the copy of a terminal error handed to each pending call.
    pub(crate) fn to_terminal(&self) -> RpcError {
        match self {
            RpcError::ConnectionClosed => RpcError::ConnectionClosed,
            RpcError::Shutdown => RpcError::Shutdown,
            other => RpcError::Stream(other.to_string()),
        }
    }

    /// Whether this error is a clean end-of-stream rather than a failure.
    ///
    /// Only a hang-up between frames counts; a stream that ends inside a
    /// frame is a truncated message.
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_errors_round_trip_through_text() {
        let errors = [
            RpcError::ServiceNotFound("Foo".to_string()),
            RpcError::MethodNotFound("Foo.Bar".to_string()),
            RpcError::IllFormedMethod("FooBar".to_string()),
        ];

        for err in errors {
            let parsed = RpcError::from_remote(err.to_string());
            assert_eq!(parsed.kind(), ErrorKind::Dispatch);
            assert_eq!(parsed.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_remote_text_is_application_error() {
        let err = RpcError::from_remote("division by zero".to_string());
        assert!(matches!(&err, RpcError::Remote(text) if text == "division by zero"));
        assert_eq!(err.kind(), ErrorKind::Application);
    }

    #[test]
    fn test_reserved_prefix_in_application_text() {
        let text = format!("{}Cache", SERVICE_NOT_FOUND_PREFIX);
        let err = RpcError::from_remote(text.clone());
        assert_eq!(err.kind(), ErrorKind::Dispatch);
        assert_eq!(err.to_string(), text);

        let text = "rpc server: cache is cold".to_string();
        let err = RpcError::from_remote(text.clone());
        assert_eq!(err.kind(), ErrorKind::Application);
        assert_eq!(err.to_string(), text);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(RpcError::Shutdown.kind(), ErrorKind::Shutdown);
        assert_eq!(RpcError::ConnectionClosed.kind(), ErrorKind::Stream);
        assert_eq!(RpcError::InvalidMagicNumber(1).kind(), ErrorKind::Protocol);
        assert_eq!(
            RpcError::InvalidCodecType("x".into()).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_terminal_copy() {
        assert!(RpcError::ConnectionClosed.is_eof());
        assert!(matches!(
            RpcError::ConnectionClosed.to_terminal(),
            RpcError::ConnectionClosed
        ));

        // Ending inside a frame is a failure, not a clean hang-up.
        let truncated = RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "early eof",
        ));
        assert!(!truncated.is_eof());
        let copy = truncated.to_terminal();
        assert!(matches!(&copy, RpcError::Stream(text) if text.contains("early eof")));

        let reset = RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(!reset.is_eof());
        let copy = reset.to_terminal();
        assert_eq!(copy.kind(), ErrorKind::Stream);
        assert!(copy.to_string().contains("reset"));
    }
}
