//! Domain-specific error types for the package transport.
//!
//! All fallible operations return `Result<T, IoError>`. Per-package
//! outcomes are not errors: they travel as [`JobResult`] values through
//! the job wake path, and [`IoError::job_result`] maps a fatal connection
//! error onto the result every outstanding job receives.

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::WaitError;
use crate::job::JobResult;

/// The canonical error type for the transport.
#[derive(Debug, Error)]
pub enum IoError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The handshake record does not start with the expected magic.
    #[error("invalid handshake magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// The package header failed CRC validation.
    #[error("header checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// The header declares more buffers than the size table holds.
    #[error("buffer count {count} exceeds table capacity {max}")]
    TooManyBuffers { count: u32, max: usize },

    /// A single buffer exceeds the configured maximum size.
    #[error("buffer too large: {size} bytes (max {max})")]
    BufferTooLarge { size: u64, max: u32 },

    /// A wire unit started with a byte that is neither a package marker
    /// nor a TLS record type.
    #[error("unknown frame marker {0:#04x}")]
    UnknownFrameMarker(u8),

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection in an orderly way.
    #[error("connection closed by peer")]
    ClosedByPeer,

    /// The local side requested the connection to stop.
    #[error("connection closed by user")]
    ClosedByUser,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A wait was aborted through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── State Errors ─────────────────────────────────────────────
    /// The operation is not valid in the current writer/sender state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A pause was requested while writing is already paused.
    #[error("writing is already paused")]
    AlreadyPaused,

    /// A job completed with a non-success result.
    #[error("job finished with {0}")]
    Job(JobResult),

    // ── TLS Errors ───────────────────────────────────────────────
    /// The TLS engine rejected a record or handshake message.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A TLS context could not be built.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    /// Certificate generation or parsing failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The authenticated peer does not carry the expected role.
    #[error("peer identity mismatch: expected {expected:?}, got {actual:?}")]
    PeerIdentity { expected: String, actual: String },

    /// A route requires the encrypted channel but none was negotiated.
    #[error("command {0:#x} requires an encrypted channel")]
    EncryptionUnavailable(u32),

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl IoError {
    /// Classify a connection-fatal error into the result that every job
    /// still outstanding on the connection receives.
    pub fn job_result(&self) -> JobResult {
        match self {
            IoError::ClosedByPeer => JobResult::ConnClosedByPeer,
            IoError::ClosedByUser | IoError::Cancelled => JobResult::ConnClosedByUser,
            IoError::Timeout(_) => JobResult::Timeout,
            IoError::Job(result) => *result,
            IoError::Connection(e) => match e.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotConnected
                | ErrorKind::WriteZero => JobResult::ConnClosedByPeer,
                ErrorKind::TimedOut => JobResult::Timeout,
                _ => JobResult::Fail,
            },
            _ => JobResult::Fail,
        }
    }

    /// Returns `true` for I/O conditions that are retried internally and
    /// never surfaced to callers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IoError::Connection(e)
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
        )
    }

    /// Returns `true` when the byte stream can no longer be trusted and
    /// the connection must be torn down.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            IoError::InvalidMagic(_)
                | IoError::UnsupportedVersion { .. }
                | IoError::ChecksumMismatch { .. }
                | IoError::TooManyBuffers { .. }
                | IoError::BufferTooLarge { .. }
                | IoError::UnknownFrameMarker(_)
                | IoError::ProtocolViolation(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for IoError {
    fn from(s: String) -> Self {
        IoError::Other(s)
    }
}

impl From<&str> for IoError {
    fn from(s: &str) -> Self {
        IoError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for IoError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        IoError::ChannelClosed
    }
}

impl From<rcgen::Error> for IoError {
    fn from(e: rcgen::Error) -> Self {
        IoError::Certificate(e.to_string())
    }
}

impl From<rustls::server::VerifierBuilderError> for IoError {
    fn from(e: rustls::server::VerifierBuilderError) -> Self {
        IoError::TlsConfig(e.to_string())
    }
}

impl From<WaitError> for IoError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Cancelled => IoError::Cancelled,
            WaitError::TimedOut(after) => IoError::Timeout(after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = IoError::ChecksumMismatch {
            expected: 0x1234,
            actual: 0xabcd,
        };
        assert!(e.to_string().contains("0x1234"));
        assert!(e.to_string().contains("0xabcd"));

        let e = IoError::TooManyBuffers { count: 40, max: 16 };
        assert!(e.to_string().contains("40"));
    }

    #[test]
    fn from_string() {
        let e: IoError = "something broke".into();
        assert!(matches!(e, IoError::Other(_)));
    }

    #[test]
    fn reset_classifies_as_closed_by_peer() {
        let io_err = std::io::Error::new(ErrorKind::ConnectionReset, "reset");
        let e: IoError = io_err.into();
        assert_eq!(e.job_result(), JobResult::ConnClosedByPeer);
    }

    #[test]
    fn user_stop_and_timeout_classification() {
        assert_eq!(IoError::ClosedByUser.job_result(), JobResult::ConnClosedByUser);
        assert_eq!(
            IoError::Timeout(Duration::from_millis(5)).job_result(),
            JobResult::Timeout
        );
        assert_eq!(IoError::ProtocolViolation("x").job_result(), JobResult::Fail);
    }

    #[test]
    fn transient_errors() {
        let e: IoError = std::io::Error::from(ErrorKind::Interrupted).into();
        assert!(e.is_transient());
        let e: IoError = std::io::Error::from(ErrorKind::BrokenPipe).into();
        assert!(!e.is_transient());
    }

    #[test]
    fn protocol_violations_are_flagged() {
        assert!(IoError::UnknownFrameMarker(0x42).is_protocol_violation());
        assert!(!IoError::ClosedByPeer.is_protocol_violation());
    }
}
