// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{Error, Kind},
    testing::{self, duplex, FramedEngine, PipeReader, PipeWriter},
    TlsChannel,
};
use std::{
    io::{IoSlice, IoSliceMut, Read as _, Write as _},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

type Channel = TlsChannel<FramedEngine, PipeReader, PipeWriter>;

const UNBOUNDED: usize = usize::MAX;

fn pair(capacity: usize, blocking: bool) -> (Channel, Channel) {
    testing::init_tracing();
    let ((read_a, write_a), (read_b, write_b)) = duplex(capacity, blocking);
    let client = TlsChannel::builder(FramedEngine::client(), read_a, write_a).build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b).build();
    (client, server)
}

/// Retries `op` on a non-blocking setup, pumping `peer` whenever `op`
/// reports a retryable condition.
fn complete<T>(
    mut op: impl FnMut() -> Result<T, Error>,
    mut peer: impl FnMut(),
) -> Result<T, Error> {
    for _ in 0..64 {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() => peer(),
            Err(error) => return Err(error),
        }
    }
    panic!("operation failed to make progress");
}

fn handshake_pair(client: &Channel, server: &Channel) {
    complete(
        || client.handshake(),
        || {
            let _ = server.handshake();
        },
    )
    .unwrap();
    server.handshake().unwrap();
}

#[test]
fn plain_echo() {
    let (client, server) = pair(UNBOUNDED, true);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello");
            // the peer's close_notify reads as end-of-stream
            assert_eq!(server.read(&mut buf).unwrap(), 0);
            assert!(server.shutdown().unwrap());
        });
        assert_eq!(client.write(b"hello").unwrap(), 5);
        assert_eq!(client.write(&[]).unwrap(), 0);
        assert!(!client.shutdown().unwrap());
        assert!(client.shutdown().unwrap());
    });
    assert!(client.shutdown_sent());
    assert!(client.shutdown_received());
    assert!(server.shutdown_sent());
    assert!(server.shutdown_received());
}

#[test]
fn large_write_forces_multiple_records() {
    let (client, server) = pair(UNBOUNDED, true);
    let payload: Vec<u8> = (0..65536).map(|i| (i % 256) as u8).collect();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut received = vec![0u8; payload.len()];
            let mut filled = 0;
            while filled < received.len() {
                let n = server.read(&mut received[filled..]).unwrap();
                assert_ne!(n, 0);
                filled += n;
            }
            assert_eq!(received, payload);
        });
        assert_eq!(client.write(&payload).unwrap(), payload.len());
    });
}

#[test]
fn small_reads_drain_a_large_record() {
    let (client, server) = pair(UNBOUNDED, false);
    handshake_pair(&client, &server);

    let payload = vec![0xAB; 10_000];
    assert_eq!(client.write(&payload).unwrap(), payload.len());

    // a destination smaller than the record diverts the plaintext into the
    // session buffer and drains it across calls
    let mut received = Vec::new();
    let mut chunk = [0u8; 5];
    while received.len() < payload.len() {
        let n = server.read(&mut chunk).unwrap();
        assert!(n > 0);
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, payload);
}

#[test]
fn write_backpressure_resumes() {
    // handshake records fit through the 64-byte pipe, data records do not
    let (client, server) = pair(64, false);
    handshake_pair(&client, &server);

    let payload = [0x5A; 100];
    // the record is wrapped and partially flushed; the bytes count as taken
    assert_eq!(client.write(&payload).unwrap(), payload.len());
    // nothing more fits until the peer drains the transport
    let error = client.write(&payload).unwrap_err();
    assert!(matches!(error.kind(), Kind::WriteRequired), "{error:?}");

    let mut received = Vec::new();
    let mut chunk = [0u8; 256];
    while received.len() < payload.len() {
        match server.read(&mut chunk) {
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(error) if error.is_retryable() => {
                // resume the interrupted flush
                let _ = client.write(&[]);
            }
            Err(error) => panic!("{error}"),
        }
    }
    assert_eq!(&received[..], &payload[..]);

    // the write path is fully usable again
    let n = complete(
        || client.write(&payload),
        || {
            let _ = server.read(&mut chunk);
        },
    )
    .unwrap();
    assert_eq!(n, payload.len());
}

#[test]
fn explicit_handshake_gates_io() {
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, false);
    let client = TlsChannel::builder(FramedEngine::client(), read_a, write_a)
        .with_explicit_handshake(true)
        .build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b).build();

    let mut buf = [0u8; 8];
    let error = client.read(&mut buf).unwrap_err();
    assert!(matches!(error.kind(), Kind::HandshakeRequired), "{error:?}");
    let error = client.write(b"early").unwrap_err();
    assert!(matches!(error.kind(), Kind::HandshakeRequired), "{error:?}");

    handshake_pair(&client, &server);

    assert_eq!(client.write(b"hi").unwrap(), 2);
    let n = complete(|| server.read(&mut buf), || {}).unwrap();
    assert_eq!(&buf[..n], b"hi");
}

#[test]
fn task_offload_surfaces_and_resumes() {
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, false);
    let client = TlsChannel::builder(FramedEngine::client().with_task(), read_a, write_a)
        .with_run_tasks(false)
        .build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b).build();
    assert!(!client.run_tasks());

    let error = client.handshake().unwrap_err();
    let Kind::TaskRequired(task) = error.into_kind() else {
        panic!("expected a delegated task");
    };
    task.run();

    handshake_pair(&client, &server);
    assert_eq!(client.write(b"ok").unwrap(), 2);
}

#[test]
fn tasks_run_inline_by_default() {
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, false);
    let client =
        TlsChannel::builder(FramedEngine::client().with_task(), read_a, write_a).build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b).build();

    handshake_pair(&client, &server);
    assert_eq!(client.write(b"ok").unwrap(), 2);
}

#[test]
fn tls13_renegotiation_refused() {
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, false);
    let client = TlsChannel::builder(
        FramedEngine::client().with_protocol("TLSv1.3"),
        read_a,
        write_a,
    )
    .build();
    let server = TlsChannel::builder(
        FramedEngine::server().with_protocol("TLSv1.3"),
        read_b,
        write_b,
    )
    .build();
    handshake_pair(&client, &server);

    let error = client.renegotiate().unwrap_err();
    assert!(
        error.to_string().contains("renegotiation not supported"),
        "{error}"
    );
    // the refusal is not fatal
    assert_eq!(client.write(b"still alive").unwrap(), 11);
}

#[test]
fn renegotiation_on_tls12() {
    let (client, server) = pair(UNBOUNDED, false);
    handshake_pair(&client, &server);

    let mut scratch = [0u8; 64];
    complete(
        || client.renegotiate(),
        || {
            let _ = server.read(&mut scratch);
        },
    )
    .unwrap();

    // data still flows after the new handshake
    assert_eq!(client.write(b"fresh").unwrap(), 5);
    let n = complete(|| server.read(&mut scratch), || {}).unwrap();
    assert_eq!(&scratch[..n], b"fresh");
}

#[test]
fn engine_failure_invalidates_the_session() {
    testing::init_tracing();
    let (in_read, mut in_write) = testing::pipe(UNBOUNDED, false);
    let (mut out_read, out_write) = testing::pipe(UNBOUNDED, false);
    let client = TlsChannel::builder(FramedEngine::client(), in_read, out_write).build();

    // play the server by hand
    let error = client.handshake().unwrap_err();
    assert!(matches!(error.kind(), Kind::ReadRequired), "{error:?}");
    in_write
        .write_all(&testing::frame(testing::HANDSHAKE, b"hs"))
        .unwrap();
    client.handshake().unwrap();
    let mut scratch = [0u8; 64];
    let _ = out_read.read(&mut scratch);

    // a corrupt record kills the session
    in_write.write_all(&[0x99, 0x00, 0x00]).unwrap();
    let mut buf = [0u8; 8];
    let error = client.read(&mut buf).unwrap_err();
    assert!(matches!(error.kind(), Kind::Tls(_)), "{error:?}");

    // and it stays dead
    for _ in 0..2 {
        assert!(matches!(
            client.read(&mut buf).unwrap_err().kind(),
            Kind::Closed
        ));
        assert!(matches!(
            client.write(b"x").unwrap_err().kind(),
            Kind::Closed
        ));
        assert!(matches!(client.handshake().unwrap_err().kind(), Kind::Closed));
        assert!(matches!(client.shutdown().unwrap_err().kind(), Kind::Closed));
    }
    assert!(client.is_open());
    client.close();
    assert!(!client.is_open());
}

#[test]
fn transport_eof_before_close_notify() {
    testing::init_tracing();
    let (in_read, mut in_write) = testing::pipe(UNBOUNDED, false);
    let (_out_read, out_write) = testing::pipe(UNBOUNDED, false);
    let client = TlsChannel::builder(FramedEngine::client(), in_read, out_write).build();

    let error = client.handshake().unwrap_err();
    assert!(matches!(error.kind(), Kind::ReadRequired), "{error:?}");
    in_write
        .write_all(&testing::frame(testing::HANDSHAKE, b"hs"))
        .unwrap();
    client.handshake().unwrap();

    in_write.close();
    let mut buf = [0u8; 8];
    // EOF without close_notify is a graceful end-of-stream for reads
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    // our close_notify still goes out
    assert!(!client.shutdown().unwrap());
    // but confirmation can never arrive
    let error = client.shutdown().unwrap_err();
    assert!(matches!(error.kind(), Kind::Closed), "{error:?}");
}

#[test]
fn shutdown_resumes_after_write_backpressure() {
    testing::init_tracing();
    let (in_read, mut in_write) = testing::pipe(UNBOUNDED, false);
    // outbound pipe tight enough to hold exactly one small record
    let (mut out_read, out_write) = testing::pipe(8, false);
    let client = TlsChannel::builder(FramedEngine::client(), in_read, out_write).build();

    let error = client.handshake().unwrap_err();
    assert!(matches!(error.kind(), Kind::ReadRequired), "{error:?}");
    in_write
        .write_all(&testing::frame(testing::HANDSHAKE, b"hs"))
        .unwrap();
    client.handshake().unwrap();

    // drain the hello, then fill the outbound pipe to the brim
    let mut scratch = [0u8; 64];
    assert_eq!(out_read.read(&mut scratch).unwrap(), 5);
    assert_eq!(client.write(&[0x5A; 5]).unwrap(), 5);

    // the close_notify gets wrapped but cannot be flushed yet
    let error = client.shutdown().unwrap_err();
    assert!(matches!(error.kind(), Kind::WriteRequired), "{error:?}");
    assert!(client.shutdown_sent());

    // once the transport drains, the retried call finishes the send and
    // reports like an uninterrupted one; it must not wait for the peer
    assert_eq!(out_read.read(&mut scratch).unwrap(), 8);
    assert!(!client.shutdown().unwrap());
    assert_eq!(out_read.read(&mut scratch).unwrap(), 3);
    assert_eq!(scratch[0], testing::ALERT);

    // waiting for the peer's close_notify stays a separate, later call
    in_write
        .write_all(&testing::frame(testing::ALERT, &[]))
        .unwrap();
    assert!(client.shutdown().unwrap());
    assert!(client.shutdown_received());
}

#[test]
fn close_releases_and_latches() {
    let (mut client, server) = pair(UNBOUNDED, false);
    handshake_pair(&client, &server);

    {
        let (reader, writer) = client.transports_mut();
        assert!(reader.is_some());
        assert!(writer.is_some());
    }

    assert!(client.is_open());
    client.close();
    assert!(!client.is_open());
    assert!(client.shutdown_sent());
    {
        let (reader, writer) = client.transports_mut();
        assert!(reader.is_none());
        assert!(writer.is_none());
    }

    let mut buf = [0u8; 4];
    assert!(matches!(
        client.read(&mut buf).unwrap_err().kind(),
        Kind::Closed
    ));
    // the peer observes the close_notify
    let n = complete(|| server.read(&mut buf), || {}).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn close_waits_for_confirmation() {
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, true);
    let client = TlsChannel::builder(FramedEngine::client(), read_a, write_a)
        .with_wait_for_close_confirmation(true)
        .build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b).build();
    assert!(client.wait_for_close_confirmation());

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut buf = [0u8; 8];
            let n = server.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"bye");
            assert_eq!(server.read(&mut buf).unwrap(), 0);
            assert!(server.shutdown().unwrap());
        });
        assert_eq!(client.write(b"bye").unwrap(), 3);
        client.close();
    });
    assert!(client.shutdown_sent());
    assert!(client.shutdown_received());
    assert!(!client.is_open());
}

#[test]
fn session_initializer_failure_defers_negotiation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, false);
    let counter = calls.clone();
    let client = TlsChannel::builder(FramedEngine::client(), read_a, write_a)
        .with_session_initializer(move |_engine| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("not yet".into())
            } else {
                Ok(())
            }
        })
        .build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b).build();

    let error = complete(
        || client.handshake(),
        || {
            let _ = server.handshake();
        },
    )
    .unwrap_err();
    assert!(matches!(error.kind(), Kind::InitCallback(_)), "{error:?}");

    // negotiation was not recorded; another handshake recovers the channel
    let mut scratch = [0u8; 64];
    complete(
        || client.handshake(),
        || {
            let _ = server.read(&mut scratch);
        },
    )
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert_eq!(client.write(b"recovered").unwrap(), 9);
}

#[test]
fn vectored_round_trip() {
    let (client, server) = pair(UNBOUNDED, false);
    handshake_pair(&client, &server);

    let bufs = [
        IoSlice::new(b"alpha"),
        IoSlice::new(b""),
        IoSlice::new(b"beta"),
    ];
    assert_eq!(client.write_vectored(&bufs).unwrap(), 9);

    let mut first = [0u8; 3];
    let mut second = [0u8; 6];
    let n = {
        let mut out = [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)];
        complete(|| server.read_vectored(&mut out), || {}).unwrap()
    };
    assert_eq!(n, 9);
    assert_eq!(&first, b"alp");
    assert_eq!(&second, b"habeta");
}

#[test]
fn empty_destination_reads_zero() {
    let (client, server) = pair(UNBOUNDED, false);
    handshake_pair(&client, &server);
    assert_eq!(client.read(&mut []).unwrap(), 0);
}

#[test]
fn io_trait_interop() {
    let (mut client, server) = pair(UNBOUNDED, true);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut buf = [0u8; 4];
            let n = server.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
        });
        client.write_all(b"ping").unwrap();
        client.flush().unwrap();
    });
}

#[test]
fn single_threaded_channel() {
    let ((read_a, write_a), (read_b, write_b)) = duplex(UNBOUNDED, false);
    let client = TlsChannel::builder(FramedEngine::client(), read_a, write_a)
        .single_threaded()
        .build();
    let server = TlsChannel::builder(FramedEngine::server(), read_b, write_b)
        .single_threaded()
        .build();

    complete(
        || client.handshake(),
        || {
            let _ = server.handshake();
        },
    )
    .unwrap();
    assert_eq!(client.write(b"solo").unwrap(), 4);
    let mut buf = [0u8; 8];
    let n = complete(|| server.read(&mut buf), || {}).unwrap();
    assert_eq!(&buf[..n], b"solo");
}

#[test]
fn channel_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Channel>();
}

/// Whatever one side writes, in whatever chunking, the other side reads
/// back identically and in order.
#[test]
fn byte_stream_identity() {
    bolero::check!().with_type::<Vec<u16>>().for_each(|chunks| {
        let (client, server) = pair(UNBOUNDED, false);
        handshake_pair(&client, &server);

        let mut expected = Vec::new();
        for (i, len) in chunks.iter().take(8).enumerate() {
            let len = *len as usize % 2048;
            let data: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
            expected.extend_from_slice(&data);
            assert_eq!(client.write(&data).unwrap(), data.len());
        }

        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match server.read(&mut chunk) {
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(error) if error.is_retryable() => break,
                Err(error) => panic!("{error}"),
            }
        }
        assert_eq!(received, expected);
    });
}
