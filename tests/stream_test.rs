//! End-to-end tests driving a sender session against a mock consumer
//! over a Unix socketpair.

use bytes::Buf;
use proptest::prelude::*;
use std::sync::atomic::AtomicBool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use trackwire::{
    serve_track, ByteSource, FileSource, PacketType, SeekRequest, Session, SessionState,
    StreamHeader, HEADER_LEN, MAX_DATA_SIZE, PACKET_TAG,
};

/// Routes tracing output through the test harness; `RUST_LOG=debug`
/// shows the per-packet session logs when a test fails.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One decoded packet as seen by the consumer.
#[derive(Debug)]
struct Packet {
    packet_type: PacketType,
    payload: Vec<u8>,
}

/// Reads one packet off the wire, validating the fixed header.
async fn read_packet(stream: &mut UnixStream) -> Option<Packet> {
    let mut header = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return None,
        Err(err) => panic!("header read failed: {err}"),
    }
    let mut buf = &header[..];
    assert_eq!(buf.get_u32_le(), PACKET_TAG, "bad packet tag");
    let packet_type = PacketType::from_u16(buf.get_u16_le()).expect("unknown packet type");
    let size = buf.get_u16_le() as usize;
    assert!(size <= MAX_DATA_SIZE, "oversized payload declared");
    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload).await.unwrap();
    Some(Packet {
        packet_type,
        payload,
    })
}

/// Happy path: header, two chunks, EOF marker, peer close.
#[tokio::test]
async fn test_end_to_end_two_chunks_then_eof() {
    init_tracing();
    let (a, mut peer) = UnixStream::pair().unwrap();
    let mut session = Session::new(a, 2000).unwrap();

    session.send_header().await.unwrap();
    let header_packet = read_packet(&mut peer).await.unwrap();
    assert_eq!(header_packet.packet_type, PacketType::Header);
    let header = StreamHeader::decode(bytes::Bytes::from(header_packet.payload)).unwrap();
    assert_eq!(header.total_length, 2000);
    assert_eq!(header.max_chunk_size as usize, MAX_DATA_SIZE);

    // 1500 bytes <= MAX_DATA_SIZE: exactly one DATA packet, no seek.
    assert_eq!(session.send_chunk(&[1u8; 1500]).await.unwrap(), None);
    let packet = read_packet(&mut peer).await.unwrap();
    assert_eq!(packet.packet_type, PacketType::Data);
    assert_eq!(packet.payload.len(), 1500);

    assert_eq!(session.send_chunk(&[2u8; 500]).await.unwrap(), None);
    let packet = read_packet(&mut peer).await.unwrap();
    assert_eq!(packet.payload.len(), 500);

    let waiter = tokio::spawn(async move {
        let res = session.send_eof_and_wait_for_seek_or_close().await;
        (session, res)
    });
    let eof = read_packet(&mut peer).await.unwrap();
    assert_eq!(eof.packet_type, PacketType::Data);
    assert!(eof.payload.is_empty());
    drop(peer);

    let (mut session, res) = waiter.await.unwrap();
    assert_eq!(res.unwrap(), None);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

/// Full serve loop against a file, with a mid-stream seek back to the
/// start. The consumer enforces the alternation rule: once it has sent
/// SEEK, it ignores every packet until SEEK_RESULT arrives.
#[tokio::test]
async fn test_serve_file_with_mid_stream_seek() {
    init_tracing();
    let track: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("track.bin");
    std::fs::write(&path, &track).unwrap();

    let (a, mut peer) = UnixStream::pair().unwrap();
    let session = Session::new(a, track.len() as i64).unwrap();
    let source = FileSource::open(&path).await.unwrap();
    assert_eq!(source.total_length(), track.len() as i64);

    let cancel = AtomicBool::new(false);
    let server = tokio::spawn(async move { serve_track(session, source, &cancel).await });

    let header = read_packet(&mut peer).await.unwrap();
    assert_eq!(header.packet_type, PacketType::Header);

    // Consume a bit of the stream, then seek back to the start.
    let mut consumed = 0usize;
    while consumed < MAX_DATA_SIZE {
        let packet = read_packet(&mut peer).await.unwrap();
        assert_eq!(packet.packet_type, PacketType::Data);
        assert_eq!(packet.payload, track[consumed..consumed + packet.payload.len()]);
        consumed += packet.payload.len();
    }

    let seek = SeekRequest {
        offset_bytes: 0,
        hint_ms: None,
    };
    peer.write_all(&seek.encode()).await.unwrap();

    // Alternation: skip in-flight DATA until the seek result shows up.
    let new_position = loop {
        let packet = read_packet(&mut peer).await.unwrap();
        match packet.packet_type {
            PacketType::Data => continue,
            PacketType::SeekResult => {
                let res =
                    trackwire::SeekResult::decode(bytes::Bytes::from(packet.payload)).unwrap();
                break res.new_position;
            }
            other => panic!("unexpected packet while awaiting seek result: {other:?}"),
        }
    };
    assert_eq!(new_position, 0);

    // The full track replays from position 0, then the EOF marker.
    let mut replayed = Vec::new();
    loop {
        let packet = read_packet(&mut peer).await.unwrap();
        assert_eq!(packet.packet_type, PacketType::Data);
        if packet.payload.is_empty() {
            break;
        }
        replayed.extend_from_slice(&packet.payload);
    }
    assert_eq!(replayed, track);

    drop(peer);
    server.await.unwrap().unwrap();
}

/// A seek from the end of the stream resolves against the total length.
#[tokio::test]
async fn test_seek_from_end_resolves_against_length() {
    init_tracing();
    let track = vec![9u8; 1000];
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("track.bin");
    std::fs::write(&path, &track).unwrap();

    let (a, mut peer) = UnixStream::pair().unwrap();
    let session = Session::new(a, 1000).unwrap();
    let source = FileSource::open(&path).await.unwrap();
    let cancel = AtomicBool::new(false);
    let server = tokio::spawn(async move { serve_track(session, source, &cancel).await });

    let _ = read_packet(&mut peer).await.unwrap(); // stream header
    let mut received = 0usize;
    loop {
        let packet = read_packet(&mut peer).await.unwrap();
        if packet.payload.is_empty() {
            break; // EOF marker
        }
        received += packet.payload.len();
    }
    assert_eq!(received, 1000);

    // Late seek to 100 bytes before the end.
    let seek = SeekRequest {
        offset_bytes: -100,
        hint_ms: None,
    };
    peer.write_all(&seek.encode()).await.unwrap();

    let result = read_packet(&mut peer).await.unwrap();
    assert_eq!(result.packet_type, PacketType::SeekResult);
    let res = trackwire::SeekResult::decode(bytes::Bytes::from(result.payload)).unwrap();
    assert_eq!(res.new_position, 900);

    let mut tail = 0usize;
    loop {
        let packet = read_packet(&mut peer).await.unwrap();
        if packet.payload.is_empty() {
            break; // EOF marker
        }
        tail += packet.payload.len();
    }
    assert_eq!(tail, 100);

    drop(peer);
    server.await.unwrap().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Fragmentation invariant: a buffer of length L is emitted as
    /// ceil(L / MAX_DATA_SIZE) DATA packets whose payloads are each at
    /// most MAX_DATA_SIZE bytes and sum exactly to L.
    #[test]
    fn test_chunk_fragmentation_invariant(len in 1usize..20_000) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let (a, mut peer) = UnixStream::pair().unwrap();
            let mut session = Session::new(a, len as i64).unwrap();
            session.send_header().await.unwrap();

            let data: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
            let sender = tokio::spawn(async move {
                let res = session.send_chunk(&data).await.unwrap();
                assert_eq!(res, None);
                data
            });

            let _ = read_packet(&mut peer).await.unwrap(); // stream header
            let expected_packets = len.div_ceil(MAX_DATA_SIZE);
            let mut received = Vec::new();
            for _ in 0..expected_packets {
                let packet = read_packet(&mut peer).await.unwrap();
                assert_eq!(packet.packet_type, PacketType::Data);
                assert!(!packet.payload.is_empty());
                assert!(packet.payload.len() <= MAX_DATA_SIZE);
                received.extend_from_slice(&packet.payload);
            }

            let data = sender.await.unwrap();
            assert_eq!(received, data);
        });
    }
}
