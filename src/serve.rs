//! Per-track serving loop.
//!
//! Pumps one backing source through one session until the consumer
//! closes the socket. This is the worker the host spawns per track
//! open; it may legitimately block for hours while the consumer is
//! paused, so it must run on a dedicated task, never on a bounded
//! short-job pool.

use crate::protocol::{SeekRequest, MAX_DATA_SIZE};
use crate::session::Session;
use crate::source::{resolve_seek_offset, ByteSource};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Serves `source` over `session` until the consumer closes the
/// connection, the source fails, or `cancel` is raised.
///
/// Seek requests are honored by repositioning the source and
/// acknowledging with a seek result (`-1` on a failed seek). After the
/// source is exhausted the socket is kept open and late seeks are still
/// serviced: the consumer may be playing buffered data and seek near
/// the end of the track, and closing early would break that seek.
///
/// `cancel` is cooperative, checked between packets at the top of the
/// loop. A worker blocked mid-read or mid-write observes it only after
/// the syscall completes or fails from the OS side; there is no
/// timeout to cut the wait short, by design.
///
/// The session is closed on every exit path. The consumer closing the
/// socket is normal termination, not an error.
pub async fn serve_track<S: ByteSource>(
    mut session: Session,
    mut source: S,
    cancel: &AtomicBool,
) -> Result<()> {
    let res = pump(&mut session, &mut source, cancel).await;
    session.close().await;
    match res {
        Ok(()) => Ok(()),
        Err(err) if err.is_closed() => {
            tracing::debug!("consumer closed connection");
            Ok(())
        }
        Err(err) => Err(err).context("track serving failed"),
    }
}

async fn pump<S: ByteSource>(
    session: &mut Session,
    source: &mut S,
    cancel: &AtomicBool,
) -> crate::Result<()> {
    session.send_header().await?;

    let mut buf = vec![0u8; MAX_DATA_SIZE];
    let mut bytes_sent: u64 = 0;

    loop {
        loop {
            if cancel.load(Ordering::Relaxed) {
                tracing::debug!(bytes_sent, "serving cancelled");
                return Ok(());
            }
            let n = source.read_chunk(&mut buf).await?;
            if n == 0 {
                break; // source exhausted, fall through to the EOF wait
            }
            if let Some(req) = session.send_chunk(&buf[..n]).await? {
                handle_seek(session, source, req).await?;
            }
            bytes_sent += n as u64;
        }

        match session.send_eof_and_wait_for_seek_or_close().await? {
            Some(req) => {
                // Late seek past our EOF: reposition and resume the
                // data loop from the new offset.
                handle_seek(session, source, req).await?;
            }
            None => {
                tracing::debug!(bytes_sent, "track done, consumer closed");
                return Ok(());
            }
        }
    }
}

/// Repositions the source per the consumer's request and sends the
/// mandatory seek result. The consumer ignores all other packets until
/// the result arrives, so this must not be skipped on failure - a
/// failed seek is reported as a negative position instead.
async fn handle_seek<S: ByteSource>(
    session: &mut Session,
    source: &mut S,
    req: SeekRequest,
) -> crate::Result<()> {
    let new_pos = match resolve_seek_offset(req.offset_bytes, source.total_length()) {
        Some(target) => match source.seek_to(target).await {
            Ok(pos) => pos as i64,
            Err(err) => {
                tracing::warn!(target, %err, "source seek failed");
                -1
            }
        },
        None => {
            tracing::warn!(
                offset_bytes = req.offset_bytes,
                "seek request resolves before stream start"
            );
            -1
        }
    };
    session.send_seek_result(new_pos).await
}
