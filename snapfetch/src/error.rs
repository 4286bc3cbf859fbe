//! Error types for snapshot downloads.
//!
//! Errors are split by failure domain:
//!
//! - [`TransportError`]: a call through the authenticated agent failed
//! - [`DecryptError`]: a fetched chunk could not be turned into plaintext
//! - [`DownloadError`]: failures surfaced to the caller of a whole download
//!
//! Per-file failures never become a `DownloadError`; they end up as an
//! [`Outcome`](crate::outcome::Outcome) instead.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors returned by the transport or the agent wrapping it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server rejected the current auth token.
    #[error("unauthorized")]
    Unauthorized,

    /// Re-authentication failed; no further calls will succeed.
    #[error("authentication invalidated")]
    AuthInvalidated,

    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("request timed out")]
    Timeout,

    /// Response body shorter or longer than the chunks it should hold.
    #[error("truncated response: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    /// Response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Io(_) | Self::Timeout | Self::Truncated { .. } => true,
            Self::Unauthorized | Self::AuthInvalidated | Self::Protocol(_) => false,
        }
    }

    /// Whether the failure invalidates every other in-flight call as well.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthInvalidated)
    }
}

/// Errors produced while decrypting a chunk.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("no key available for chunk")]
    MissingKey,

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("chunk checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Errors surfaced to the caller of a snapshot or backup download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Chunk-list groups could not be obtained for the requested files.
    #[error("failed to resolve chunk lists for backup {udid}: {source}")]
    Resolution {
        udid: String,
        #[source]
        source: TransportError,
    },

    /// The backup's keybag could not be acquired.
    #[error("failed to acquire keybag for backup {udid}: {source}")]
    KeyBag {
        udid: String,
        #[source]
        source: TransportError,
    },

    /// An engine pass exceeded its wall-clock budget.
    #[error("download pass timed out after {}s", .elapsed.as_secs())]
    Timeout { elapsed: Duration },
}
