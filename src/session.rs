//! Sender-side session state machine.
//!
//! A [`Session`] owns exactly one connected Unix-domain socket and
//! pushes one track's bytes to the consumer:
//!
//! ```text
//! Initial --send_header()--> Data --close()--> Closed
//! ```
//!
//! All I/O is blocking (awaited) with no timeout - the consumer may
//! legitimately hold the connection open for hours while paused - with
//! one exception: after each outgoing DATA packet the session takes a
//! strictly non-blocking look at the socket for an inbound SEEK, so a
//! seek request can interrupt a large in-flight buffer within one
//! packet's latency.
//!
//! Sessions are single-owner: one worker task per session, never shared
//! across tasks or threads.

use crate::error::{ProtoError, Result};
use crate::protocol::{
    PacketHeader, PacketType, SeekRequest, SeekResult, StreamHeader, HEADER_LEN, MAX_DATA_SIZE,
    SEEK_PAYLOAD_MIN_LEN,
};
use bytes::{Bytes, BytesMut};
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Largest SEEK payload the read path will accept: offset(8) + ms(4),
/// with a little slack for forward-compatible trailing fields.
const SEEK_PAYLOAD_MAX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, stream header not yet sent.
    Initial,
    /// Header sent; DATA/SEEK/SEEK_RESULT may flow.
    Data,
    /// Terminal. Any further I/O is a caller bug.
    Closed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Initial => "Initial",
            SessionState::Data => "Data",
            SessionState::Closed => "Closed",
        }
    }
}

/// Outcome of one attempt to read a seek request off the socket.
///
/// Three-way by design: "a request arrived", "nothing usable arrived",
/// and "the peer is gone" are distinct conditions and callers branch on
/// all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPoll {
    /// A well-formed SEEK packet arrived.
    Request(SeekRequest),
    /// No data ready, or the inbound bytes were not a usable SEEK
    /// packet (malformed input is deliberately treated leniently).
    NoRequest,
    /// Clean EOF or connection reset: the consumer closed the socket.
    Closed,
}

/// One sender-side protocol instance bound to one socket for one track.
#[derive(Debug)]
pub struct Session {
    /// `Some` until [`close`](Self::close) takes it; `None` only in the
    /// `Closed` state.
    stream: Option<UnixStream>,
    total_length: i64,
    state: SessionState,
    /// Reused scratch for outgoing packet headers and small payloads.
    scratch: BytesMut,
}

impl Session {
    /// Creates a session over an already-connected stream.
    ///
    /// `total_length` is the full track length in bytes and must be
    /// positive; endless streams are not representable in this
    /// protocol.
    pub fn new(stream: UnixStream, total_length: i64) -> Result<Self> {
        if total_length <= 0 {
            return Err(ProtoError::InvalidArgument(format!(
                "bad total_length={}",
                total_length
            )));
        }
        Ok(Self {
            stream: Some(stream),
            total_length,
            state: SessionState::Initial,
            scratch: BytesMut::with_capacity(HEADER_LEN + SEEK_PAYLOAD_MAX_LEN),
        })
    }

    /// Creates a session from a raw descriptor handed over by the host
    /// layer (e.g. one end of a socketpair).
    ///
    /// Verifies the descriptor really is a socket before accepting it:
    /// a plain file or pipe would appear to work until the first poll
    /// or shutdown, so the wrong kind is rejected at construction.
    pub fn from_fd(fd: OwnedFd, total_length: i64) -> Result<Self> {
        if !fd_is_socket(&fd)? {
            return Err(ProtoError::InvalidArgument(format!(
                "descriptor {} is not a socket",
                fd.as_raw_fd()
            )));
        }
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;
        Self::new(stream, total_length)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn total_length(&self) -> i64 {
        self.total_length
    }

    fn require_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(ProtoError::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// The live stream. `None` is only observable after `close`, and
    /// every operation checks the state first, so this failing means a
    /// state check was bypassed.
    fn stream_mut(&mut self) -> Result<&mut UnixStream> {
        self.stream.as_mut().ok_or(ProtoError::InvalidState {
            expected: "Initial or Data",
            actual: "Closed",
        })
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Sends the stream header. Must be the first packet on the wire;
    /// transitions the session into the `Data` state.
    pub async fn send_header(&mut self) -> Result<()> {
        self.require_state(SessionState::Initial)?;
        let header = StreamHeader {
            total_length: self.total_length,
            max_chunk_size: MAX_DATA_SIZE as u32,
        };
        self.stream_mut()?
            .write_all(&header.encode())
            .await
            .map_err(ProtoError::from_io)?;
        self.state = SessionState::Data;
        tracing::debug!(total_length = self.total_length, "stream header sent");
        Ok(())
    }

    /// Sends one buffer of track bytes, fragmented into DATA packets of
    /// at most [`MAX_DATA_SIZE`] payload bytes each.
    ///
    /// Blocks for as long as the consumer refuses the bytes (paused
    /// playback can hold this for an arbitrarily long time). After each
    /// packet the socket is polled, without blocking, for an inbound
    /// SEEK; if one arrives the remaining bytes of `data` are NOT sent
    /// and the request is returned. The caller must then reposition its
    /// source, call [`send_seek_result`](Self::send_seek_result), and
    /// resume sending from the new position.
    ///
    /// `data` must be non-empty: a zero-length DATA packet is the EOF
    /// marker and may only be produced by
    /// [`send_eof_and_wait_for_seek_or_close`](Self::send_eof_and_wait_for_seek_or_close).
    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<Option<SeekRequest>> {
        self.require_state(SessionState::Data)?;
        if data.is_empty() {
            return Err(ProtoError::InvalidArgument(
                "empty chunk would be sent as the EOF marker".into(),
            ));
        }

        for packet in data.chunks(MAX_DATA_SIZE) {
            self.write_packet(PacketType::Data, packet).await?;

            // Non-blocking look for a seek request between packets.
            match self.poll_seek_request().await? {
                SeekPoll::Request(req) => {
                    tracing::debug!(offset_bytes = req.offset_bytes, "seek interrupts send");
                    return Ok(Some(req));
                }
                SeekPoll::Closed => return Err(ProtoError::Closed),
                SeekPoll::NoRequest => {}
            }
        }
        Ok(None)
    }

    /// Signals end-of-stream, then blocks until the consumer either
    /// requests a seek or closes the socket.
    ///
    /// The socket is kept open past EOF on purpose: the consumer may
    /// still be playing buffered data, and the user may seek while
    /// paused near the end of the track. A late seek re-arms data
    /// sending; `None` means there is nothing more to do here, whether
    /// the peer closed cleanly or the wait failed.
    pub async fn send_eof_and_wait_for_seek_or_close(&mut self) -> Result<Option<SeekRequest>> {
        self.require_state(SessionState::Data)?;
        self.write_packet(PacketType::Data, &[]).await?;
        tracing::debug!("EOF marker sent, waiting for seek or close");

        match self.wait_seek_request().await {
            Ok(SeekPoll::Request(req)) => Ok(Some(req)),
            Ok(SeekPoll::NoRequest) | Ok(SeekPoll::Closed) => Ok(None),
            Err(err) => {
                tracing::debug!(%err, "post-EOF wait ended");
                Ok(None)
            }
        }
    }

    /// Replies to a seek request. `new_position >= 0` acknowledges the
    /// new absolute byte position; `< 0` reports a failed seek.
    ///
    /// The consumer ignores every other packet while it waits for this
    /// reply, so after returning a [`SeekRequest`] the caller must
    /// either send a result or close the session promptly - anything
    /// else leaves the peer blocked.
    pub async fn send_seek_result(&mut self, new_position: i64) -> Result<()> {
        self.require_state(SessionState::Data)?;
        let result = SeekResult { new_position };
        self.stream_mut()?
            .write_all(&result.encode())
            .await
            .map_err(ProtoError::from_io)?;
        tracing::debug!(new_position, "seek result sent");
        Ok(())
    }

    /// Shuts the socket down, drops it, and marks the session closed.
    /// Idempotent; safe to call from cleanup paths after a prior error.
    /// Shutdown failures are swallowed: the descriptor is released
    /// either way.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        // Take the stream so the descriptor is released here, not when
        // the caller finally drops the session.
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                tracing::debug!(%err, "socket shutdown failed");
            }
        }
        self.state = SessionState::Closed;
        tracing::debug!("session closed");
    }

    /// Reads at most one inbound seek request.
    ///
    /// With `non_blocking` set, "no data ready" maps to
    /// [`SeekPoll::NoRequest`] and the call returns immediately;
    /// otherwise it blocks until a packet header arrives or the peer
    /// closes. Hosts that manage their own serving loop can use this
    /// directly; [`send_chunk`](Self::send_chunk) and
    /// [`send_eof_and_wait_for_seek_or_close`](Self::send_eof_and_wait_for_seek_or_close)
    /// call it internally.
    pub async fn read_seek_request(&mut self, non_blocking: bool) -> Result<SeekPoll> {
        self.require_state(SessionState::Data)?;
        if non_blocking {
            self.poll_seek_request().await
        } else {
            self.wait_seek_request().await
        }
    }

    /// Writes one packet (header, then payload) fully.
    async fn write_packet(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let header = PacketHeader::new(packet_type, payload.len())?;
        self.scratch.clear();
        header.encode_into(&mut self.scratch);
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => {
                return Err(ProtoError::InvalidState {
                    expected: "Data",
                    actual: "Closed",
                })
            }
        };
        stream
            .write_all(&self.scratch)
            .await
            .map_err(ProtoError::from_io)?;
        if !payload.is_empty() {
            stream
                .write_all(payload)
                .await
                .map_err(ProtoError::from_io)?;
        }
        Ok(())
    }

    // =========================================================================
    // Seek read path
    // =========================================================================

    /// Non-blocking check for an inbound SEEK packet. Returns
    /// `NoRequest` immediately when the socket has nothing for us.
    async fn poll_seek_request(&mut self) -> Result<SeekPoll> {
        let mut header = [0u8; HEADER_LEN];
        let stream = self.stream_mut()?;
        match stream.try_read(&mut header) {
            Ok(0) => Ok(SeekPoll::Closed),
            Ok(n) => {
                // The peer writes packets whole; if the header arrived
                // split, the rest is already in flight. Completing it
                // with a waiting read keeps the byte stream in sync,
                // at the cost that a peer trickling a header one byte
                // at a time can stall the send loop here.
                if n < HEADER_LEN {
                    if let Err(err) = stream.read_exact(&mut header[n..]).await {
                        return closed_or_err(err);
                    }
                }
                self.read_seek_payload(&header).await
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(SeekPoll::NoRequest),
            Err(err) => closed_or_err(err),
        }
    }

    /// Blocking read of the next packet header, expected to be a SEEK.
    /// Used after the EOF marker, where the only legitimate traffic is
    /// a late seek or socket closure.
    async fn wait_seek_request(&mut self) -> Result<SeekPoll> {
        let mut header = [0u8; HEADER_LEN];
        if let Err(err) = self.stream_mut()?.read_exact(&mut header).await {
            return closed_or_err(err);
        }
        self.read_seek_payload(&header).await
    }

    /// Validates a received header and reads the SEEK payload behind
    /// it.
    ///
    /// Parsing is deliberately lenient: a bad tag, unexpected type, or
    /// undersized payload is logged and mapped to `NoRequest` - a
    /// sloppy peer should look like "no seek", not a fatal protocol
    /// violation. Connection loss, in contrast, is surfaced as `Closed`
    /// so the sender stops promptly instead of spinning.
    async fn read_seek_payload(&mut self, header_bytes: &[u8; HEADER_LEN]) -> Result<SeekPoll> {
        let header = match PacketHeader::decode(header_bytes) {
            Some(h) => h,
            None => {
                tracing::warn!("discarding malformed packet header");
                return Ok(SeekPoll::NoRequest);
            }
        };
        let size = header.data_size as usize;
        if header.packet_type != PacketType::Seek
            || !(SEEK_PAYLOAD_MIN_LEN..=SEEK_PAYLOAD_MAX_LEN).contains(&size)
        {
            tracing::warn!(
                packet_type = ?header.packet_type,
                data_size = size,
                "discarding unexpected packet while looking for SEEK"
            );
            return Ok(SeekPoll::NoRequest);
        }

        let mut payload = [0u8; SEEK_PAYLOAD_MAX_LEN];
        if let Err(err) = self.stream_mut()?.read_exact(&mut payload[..size]).await {
            return closed_or_err(err);
        }
        match SeekRequest::decode(Bytes::copy_from_slice(&payload[..size])) {
            Ok(req) => Ok(SeekPoll::Request(req)),
            Err(err) => {
                tracing::warn!(%err, "discarding undecodable SEEK payload");
                Ok(SeekPoll::NoRequest)
            }
        }
    }
}

/// Folds peer-is-gone I/O errors into the `Closed` poll outcome;
/// anything else propagates as a real failure.
fn closed_or_err(err: std::io::Error) -> Result<SeekPoll> {
    match ProtoError::from_io(err) {
        ProtoError::Closed => Ok(SeekPoll::Closed),
        other => Err(other),
    }
}

fn fd_is_socket(fd: &OwnedFd) -> Result<bool> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    if rc != 0 {
        return Err(ProtoError::Io(std::io::Error::last_os_error()));
    }
    Ok(st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
}
