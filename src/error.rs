//! Error types for the seekable socket protocol.
//!
//! Callers branch on "peer closed" vs everything else, so closure gets
//! its own variant rather than hiding inside an io::Error kind check at
//! every call site.

use std::io;

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Protocol-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Peer shut the connection down (ECONNRESET/EPIPE, or a clean
    /// zero-byte read where a packet header was expected). Normal
    /// termination for most callers, not a loud error.
    #[error("connection closed by peer")]
    Closed,

    /// Unexpected I/O failure on the socket. The session is unusable;
    /// the caller should close it and release the track.
    #[error("protocol i/o error: {0}")]
    Io(#[from] io::Error),

    /// Malformed packet where a strict decode was required.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Operation called in the wrong session state.
    #[error("invalid session state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Bad argument from the caller (non-positive stream length,
    /// oversized payload, descriptor that is not a socket).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ProtoError {
    /// Maps an I/O error from a socket syscall, folding the
    /// peer-is-gone conditions into [`ProtoError::Closed`].
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => ProtoError::Closed,
            _ => ProtoError::Io(err),
        }
    }

    /// True for the variants that mean "the peer is gone".
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtoError::Closed)
    }
}
