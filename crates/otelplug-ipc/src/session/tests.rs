//! Unit tests for session multiplexing.

use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::region::MIN_RING_CAPACITY;

struct Pair {
    host: Session,
    plugin: Session,
}

#[fixture]
fn pair() -> Pair {
    let (host_socket, plugin_socket) = UnixStream::pair().expect("socket pair");
    Pair {
        host: Session::new(host_socket, Role::Host).expect("host session"),
        plugin: Session::new(plugin_socket, Role::Plugin).expect("plugin session"),
    }
}

struct MappedPair {
    _dir: TempDir,
    host: Session,
    plugin: Session,
}

#[fixture]
fn mapped_pair() -> MappedPair {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("exporter-debug.shm")).expect("utf8 path");
    let host_region = SharedRegion::create(&path, MIN_RING_CAPACITY).expect("create region");
    let plugin_region = SharedRegion::open(&path).expect("open region");
    let (host_socket, plugin_socket) = UnixStream::pair().expect("socket pair");
    MappedPair {
        _dir: dir,
        host: Session::with_region(host_socket, Role::Host, host_region).expect("host session"),
        plugin: Session::with_region(plugin_socket, Role::Plugin, plugin_region)
            .expect("plugin session"),
    }
}

fn bytes_sent(session: &Session) -> u64 {
    session.region().map_or(0, SharedRegion::bytes_sent)
}

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

fn echo_once(plugin: &Session) {
    let stream = plugin.accept().expect("incoming stream");
    let request = stream.recv_blocking().expect("request");
    stream.send(request).expect("reply");
}

#[rstest]
fn host_streams_are_odd_and_distinct(pair: Pair) {
    let first = pair.host.open_stream().expect("stream");
    let second = pair.host.open_stream().expect("stream");
    assert_eq!(first.id() & 1, 1);
    assert_eq!(second.id() & 1, 1);
    assert_ne!(first.id(), second.id());
}

#[rstest]
fn exchange_reaches_the_plugin_and_back(pair: Pair) {
    let Pair { host, plugin } = pair;
    let server = thread::spawn(move || {
        echo_once(&plugin);
        plugin
    });

    let stream = host.open_stream().expect("stream");
    let reply = stream.exchange(&ctx(), b"ping".to_vec()).expect("exchange");
    assert_eq!(reply, b"ping");
    drop(server.join().expect("server thread"));
}

#[rstest]
fn stream_is_reused_for_a_second_exchange(pair: Pair) {
    let Pair { host, plugin } = pair;
    let server = thread::spawn(move || {
        let stream = plugin.accept().expect("incoming stream");
        for _ in 0..2 {
            let request = stream.recv_blocking().expect("request");
            stream.send(request).expect("reply");
        }
        drop(stream);
        plugin
    });

    let stream = host.open_stream().expect("stream");
    assert_eq!(stream.exchange(&ctx(), b"one".to_vec()).expect("first"), b"one");
    assert_eq!(stream.exchange(&ctx(), b"two".to_vec()).expect("second"), b"two");
    drop(server.join().expect("server thread"));
}

#[rstest]
fn concurrent_streams_do_not_cross(pair: Pair) {
    let Pair { host, plugin } = pair;
    let server = thread::spawn(move || {
        let mut workers = Vec::new();
        for _ in 0..4 {
            let stream = plugin.accept().expect("incoming stream");
            workers.push(thread::spawn(move || {
                let request = stream.recv_blocking().expect("request");
                stream.send(request).expect("reply");
            }));
        }
        for worker in workers {
            worker.join().expect("worker");
        }
        plugin
    });

    let host = Arc::new(host);
    let clients: Vec<_> = (0..4_u8)
        .map(|index| {
            let host = Arc::clone(&host);
            thread::spawn(move || {
                let stream = host.open_stream().expect("stream");
                let reply = stream.exchange(&ctx(), vec![index]).expect("exchange");
                assert_eq!(reply, vec![index]);
            })
        })
        .collect();
    for client in clients {
        client.join().expect("client");
    }
    drop(server.join().expect("server thread"));
}

#[rstest]
fn recv_times_out_without_a_reply(pair: Pair) {
    let stream = pair.host.open_stream().expect("stream");
    let started = Instant::now();
    let error = stream
        .exchange(&CallContext::with_timeout(Duration::from_millis(50)), b"x".to_vec())
        .expect_err("no reply");
    assert!(matches!(error, TransportError::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[rstest]
fn cancellation_interrupts_a_waiting_stream(pair: Pair) {
    let stream = pair.host.open_stream().expect("stream");
    let call = CallContext::background();
    let token = call.cancel_token().clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        token.cancel();
    });
    let error = stream.exchange(&call, b"x".to_vec()).expect_err("cancelled");
    assert!(matches!(error, TransportError::Cancelled));
    canceller.join().expect("canceller");
}

#[rstest]
fn closing_the_session_wakes_waiters(pair: Pair) {
    let Pair { host, plugin } = pair;
    let host = Arc::new(host);
    let stream = host.open_stream().expect("stream");
    let closer = {
        let host = Arc::clone(&host);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            host.close();
        })
    };
    let error = stream.exchange(&ctx(), b"x".to_vec()).expect_err("closed");
    assert!(matches!(error, TransportError::SessionClosed));
    closer.join().expect("closer");
    assert!(host.open_stream().is_err());
    drop(plugin);
}

#[rstest]
fn peer_close_ends_accept(pair: Pair) {
    let Pair { host, plugin } = pair;
    drop(host);
    assert!(plugin.accept().is_none());
    assert!(plugin.is_closed());
}

#[rstest]
fn dropping_a_stream_resets_the_peer(pair: Pair) {
    let Pair { host, plugin } = pair;
    let stream = host.open_stream().expect("stream");
    stream.send(b"hello".to_vec()).expect("send");
    let accepted = plugin.accept().expect("incoming stream");
    assert_eq!(accepted.recv_blocking().expect("payload"), b"hello");

    drop(stream);
    let error = accepted.recv_blocking().expect_err("reset");
    assert!(matches!(error, TransportError::StreamReset { .. }));
    assert!(!accepted.is_usable());
}

#[rstest]
fn host_session_never_accepts(pair: Pair) {
    assert!(pair.host.accept().is_none());
}

#[rstest]
fn mapped_exchange_moves_payloads_through_the_region(mapped_pair: MappedPair) {
    let MappedPair { _dir, host, plugin } = mapped_pair;
    let server = thread::spawn(move || {
        echo_once(&plugin);
        plugin
    });

    let stream = host.open_stream().expect("stream");
    assert_eq!(stream.exchange(&ctx(), b"ping".to_vec()).expect("exchange"), b"ping");
    let plugin = server.join().expect("server thread");
    assert_eq!(bytes_sent(&host), 4);
    assert_eq!(bytes_sent(&plugin), 4);
}

#[rstest]
fn repeated_exchanges_wrap_the_ring(mapped_pair: MappedPair) {
    let MappedPair { _dir, host, plugin } = mapped_pair;
    let server = thread::spawn(move || {
        let stream = plugin.accept().expect("incoming stream");
        while let Ok(request) = stream.recv_blocking() {
            if stream.send(request).is_err() {
                break;
            }
        }
    });

    let stream = host.open_stream().expect("stream");
    for round in 0..20_u8 {
        let payload = vec![round; 1_000];
        assert_eq!(stream.exchange(&ctx(), payload.clone()).expect("exchange"), payload);
    }
    assert_eq!(bytes_sent(&host), 20_000);
    drop(stream);
    host.close();
    server.join().expect("server thread");
}

#[rstest]
fn payloads_larger_than_the_ring_travel_inline(mapped_pair: MappedPair) {
    let MappedPair { _dir, host, plugin } = mapped_pair;
    let server = thread::spawn(move || {
        echo_once(&plugin);
        plugin
    });

    let payload = vec![9_u8; MIN_RING_CAPACITY * 2];
    let stream = host.open_stream().expect("stream");
    assert_eq!(stream.exchange(&ctx(), payload.clone()).expect("exchange"), payload);
    drop(server.join().expect("server thread"));
    assert_eq!(bytes_sent(&host), 0);
}

#[test]
fn mapped_frame_without_a_region_ends_the_session() {
    let (mut raw, plugin_socket) = UnixStream::pair().expect("socket pair");
    let plugin = Session::new(plugin_socket, Role::Plugin).expect("plugin session");
    Frame::mapped(1, 4).write_to(&mut raw).expect("write doorbell");

    assert!(plugin.accept().is_none());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !plugin.is_closed() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(plugin.is_closed());
}
