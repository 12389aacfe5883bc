//! Error types for socket setup, framing and message delivery.
//!
//! Handlers themselves return [`anyhow::Result`]; everything the library does
//! on its own reports one of the variants below.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by servers, clients and connections.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket path does not fit in `sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {}", .path.display())]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
        /// Its length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// A stale socket file could not be removed before binding.
    #[error("failed to remove existing socket {}: {source}", .path.display())]
    RemoveSocket {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind socket {}: {source}", .path.display())]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },

    /// The permission mode could not be applied to the socket file.
    #[error("failed to set socket permissions on {}: {source}", .path.display())]
    Permissions {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },

    /// Dialing the server failed.
    #[error("failed to connect to server at {}: {source}", .path.display())]
    Connect {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },

    /// `start()` was called on a server that is already listening.
    #[error("server already started")]
    AlreadyStarted,

    /// `start()` was called on a server that has been stopped.
    #[error("server has been stopped")]
    ServerStopped,

    /// The client has no live connection right now.
    #[error("client not connected to server")]
    NotConnected,

    /// The client was closed and cannot be used again.
    #[error("client is closed")]
    ClientClosed,

    /// The connection was closed before or during the write.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// The payload could not be serialized.
    #[error("failed to marshal payload: {0}")]
    Marshal(#[source] serde_json::Error),

    /// The payload could not be decoded into the requested shape.
    #[error("failed to unmarshal payload: {0}")]
    Unmarshal(#[source] serde_json::Error),

    /// The connection delivered more bytes than the configured limit.
    #[error("message size exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Configured limit.
        limit: u64,
    },

    /// The peer sent something that is not a message envelope.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The stream ended in the middle of a message.
    #[error("stream ended with {0} bytes of an incomplete message")]
    Truncated(usize),

    /// A read or write deadline expired.
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// `"read"` or `"write"`.
        op: &'static str,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Any other transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the failure means "currently disconnected" rather than a
    /// broken write.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// True when the client or connection was closed on purpose.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClientClosed | Self::ConnectionClosed(_))
    }
}
