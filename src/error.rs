//! Error types for transport operations.
//!
//! Read-side failures are collapsed into sentinel variants so callers can
//! react to them without inspecting OS errors. Spawn, write and close errors
//! are passed through unchanged.

use thiserror::Error;

/// Errors surfaced by every transport variant.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Reading from an open session failed, including end-of-stream.
    ///
    /// The session can no longer be used and must be re-established on a
    /// new transport instance.
    #[error("error reading from transport, cannot continue")]
    TransportFailure,

    /// A transport operation did not complete within its timeout.
    ///
    /// The underlying resource may still be alive but is presumed
    /// unresponsive. Nothing is retried here.
    #[error("transport operation timed out")]
    TransportTimeout,

    /// The requested transport name is not implemented.
    #[error("unknown transport provided: {0}")]
    UnknownTransport(String),

    /// The remote host key was rejected.
    #[error("ssh key verification failed")]
    KeyVerificationFailed,

    /// The session handle is empty.
    #[error("transport is not open")]
    NotOpen,

    /// `open` was called while a session is already live.
    #[error("transport is already open")]
    AlreadyOpen,

    /// The instance has been closed and cannot be reopened.
    #[error("transport has been closed")]
    Closed,

    /// The native transport has neither a password nor a private key.
    #[error("no password or private key provided")]
    MissingCredentials,

    /// I/O error from the session stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Pseudo-terminal allocation or process spawn failure.
    #[error(transparent)]
    Pty(anyhow::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),
}
