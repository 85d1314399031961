//! Error types for the proxy core

use std::io;
use thiserror::Error;

/// Netbot error type
///
/// Protocol handlers translate lower-level failures into the nearest
/// protocol-meaningful variant at their boundary; unknowns surface as
/// `InvalidFraming`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Recoverable: more bytes are required before the message can be
    /// decoded. Nothing has been consumed.
    #[error("need more data")]
    NeedMore,

    #[error("invalid framing: {0}")]
    InvalidFraming(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Upstream proxy refused the tunnel (HTTP CONNECT non-2xx status,
    /// SOCKS5 non-zero reply).
    #[error("upstream rejected with code {0}")]
    UpstreamRejected(u16),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Chunk length over the protocol cap, or a nonce counter that would
    /// wrap.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl Error {
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFraming(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::AuthenticationFailed(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn exhausted<S: Into<String>>(msg: S) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Error::Cancelled(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Error::Crypto(msg.into())
    }

    /// Whether this error means "wait for more bytes and retry".
    pub fn is_need_more(&self) -> bool {
        matches!(self, Error::NeedMore)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::AuthenticationFailed(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            Error::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::framing("bad header");
        assert_eq!(e.to_string(), "invalid framing: bad header");

        let e = Error::UpstreamRejected(502);
        assert_eq!(e.to_string(), "upstream rejected with code 502");
    }

    #[test]
    fn test_need_more() {
        assert!(Error::NeedMore.is_need_more());
        assert!(!Error::framing("x").is_need_more());
    }
}
