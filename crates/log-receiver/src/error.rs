//! Error taxonomy for the receiver.
//!
//! Protocol violations and authentication failures (`ConnectionError`) are
//! local to one connection: they close that socket and never touch the
//! receiver-wide frontier. Resource failures (`StartError`) are reported to
//! the caller of [`crate::reactor::run`]. Invariant breaches (queue-order
//! violations, double destruction, connection-count underflow) are bugs, not
//! recoverable errors, and are raised through `flux_utils::safe_panic!`
//! instead of a `Result` variant here.

use std::net::SocketAddr;

use thiserror::Error;

/// A connection-local failure. Carries enough context for a single
/// structured log line; the caller always closes the connection afterwards.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("header size exceeds max allowed")]
    HeaderTooLarge,

    #[error("invalid block header")]
    InvalidBlockHeader,

    #[error("block checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid block sequence")]
    InvalidBlockSequence,

    #[error("invalid log block format: no trailing /")]
    MissingTrailingSlash,

    #[error("request parse error")]
    RequestParseError,

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("authenticated name mismatch")]
    AuthNameMismatch,

    #[error("clear text communication not allowed")]
    CleartextDowngrade,

    #[error("out of order data received")]
    OutOfOrderData,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("connection timed out")]
    InactivityTimeout,

    #[error("rejected, last_write={last_write_seq}")]
    BlockRejected { last_write_seq: i64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// The string sent to the peer / written to the log line.
    #[must_use]
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}

/// Failure to start the receiver, surfaced from [`crate::reactor::run`].
#[derive(Error, Debug)]
pub enum StartError {
    #[error("invalid listen address: {0}")]
    InvalidListenAddress(String),

    #[error("server id is not set")]
    MissingServerId,

    #[error("invalid auth configuration: {0}")]
    InvalidAuthConfig(String),

    #[error("failed to start acceptor at {addr}: {source}")]
    BindFailed { addr: SocketAddr, #[source] source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StartError {
    /// Maps each failure to the `errno` a caller would expect for it.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidListenAddress(_) | Self::MissingServerId | Self::InvalidAuthConfig(_) => libc::EINVAL,
            Self::BindFailed { .. } => libc::ENOTCONN,
            Self::Io(_) => libc::EIO,
        }
    }
}
