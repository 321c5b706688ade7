//! Seekable socket protocol for serving audio track bytes.
//!
//! A data-producing process (the sender) delivers a large, logically
//! seekable byte stream to a consumer over a single duplex Unix-domain
//! socket. The consumer drives playback timing and may block the sender
//! indefinitely (e.g. while paused); seek requests are multiplexed over
//! the same socket used for bulk data.
//!
//! # Architecture
//!
//! ```text
//! +-------------+     +-----------+      DATA ->       +----------+
//! | ByteSource  | --> |  Session  | ==================  | consumer |
//! | (file/http) |     | (sender)  |  <- SEEK           | (player) |
//! +-------------+     +-----------+  SEEK_RESULT ->    +----------+
//! ```
//!
//! One session per track open, one worker task per session. All socket
//! I/O is blocking (awaited) with no timeouts - the consumer may hold
//! the connection open for an arbitrarily long pause - except the
//! opportunistic seek poll between outgoing data packets.
//!
//! The transport is assumed local, reliable, and ordered. Payload bytes
//! are opaque; this crate does not interpret audio formats.

pub mod error;
pub mod protocol;
pub mod serve;
pub mod session;
pub mod source;

pub use error::{ProtoError, Result};
pub use protocol::{
    PacketHeader, PacketType, SeekRequest, SeekResult, StreamHeader, HEADER_LEN, MAX_DATA_SIZE,
    PACKET_TAG,
};
pub use serve::serve_track;
pub use session::{SeekPoll, Session, SessionState};
pub use source::{resolve_seek_offset, ByteSource, FileSource};
