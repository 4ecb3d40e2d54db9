//! Error taxonomy for the codec and protocol layers.
//!
//! The buffer's own read/write methods follow the source behavior of
//! returning sentinel values (`-1`, type defaults) rather than `Result` —
//! see [`crate::buffer`] — but anything that wants to propagate a typed
//! error (in particular [`crate::serializable::Serializable`] impls using
//! `?`) can reach for [`CodecError`].

use thiserror::Error;

/// Typed codec errors, for callers that prefer `Result` over sentinel
/// return values.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// A write was attempted on a buffer in `Read` mode, or a read on a
    /// buffer in `Write` mode.
    #[error("wrong buffer mode for this operation")]
    WrongMode,
    /// A write would have pushed `length + n >= capacity`.
    #[error("write of {attempted} byte(s) would overflow buffer (capacity {capacity}, used {used})")]
    BufferOverflow { attempted: usize, capacity: usize, used: usize },
    /// A read would have pushed `position + n > length`.
    #[error("read of {attempted} byte(s) would underflow buffer (length {length}, position {position})")]
    BufferUnderflow { attempted: usize, length: usize, position: usize },
}

/// Errors surfaced by the client/server protocol layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying socket was closed or the listen loop was cancelled.
    /// Expected during shutdown.
    #[error("socket disposed or listen loop cancelled")]
    SocketDisposed,
    /// A transient I/O error on the listen loop; the loop keeps running.
    #[error("transient listen error: {0}")]
    TransientListenError(#[source] std::io::Error),
    /// The server replied `UnknownClient` — our id is not in its roster.
    #[error("server has no record of this client; re-register")]
    UnknownClient,
    /// Raised by the server when it cannot find a socket to bind.
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),
}
