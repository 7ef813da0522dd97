//! TLS handshake timeout scenario: the outbound leg completes its TCP
//! `connect()` against a remote that accepts the connection but never
//! speaks TLS back, so the handshake never finishes and
//! `tls_connect_ticks` must expire and close the inbound leg.
//!
//! Uses a faster-than-production tick interval, same rationale as
//! `connect_timeout.rs`.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relayd::client::AddressFamily;
use relayd::reactor;
use relayd::tunnel::{Tunnel, TunnelSpec};
use relayd::worker::WorkerPool;
use relayd::Reactor;

/// Accepts one connection and holds it open without ever reading or
/// writing, so the tunnel's client-side TLS handshake never progresses.
fn spawn_silent_remote(port: u16) -> thread::JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind silent remote");
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    thread::spawn(move || {
        let (sock, _addr) = listener.accept().expect("accept from tunnel");
        while !stop_for_thread.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
        }
        drop(sock);
    })
}

#[test]
fn silent_remote_times_out_the_tls_handshake() {
    let bind_port = 19301;
    let remote_port = 19302;
    let _remote = spawn_silent_remote(remote_port);
    thread::sleep(Duration::from_millis(50));

    let reactor = Reactor::new().expect("create reactor");
    reactor.borrow_mut().set_tick_interval(Duration::from_millis(50));
    let worker_pool = WorkerPool::new(&reactor, 2).expect("create worker pool");

    let spec = TunnelSpec {
        bind_hosts: vec!["127.0.0.1".to_string()],
        bind_port,
        remote_host: "127.0.0.1".to_string(),
        remote_port,
        server_mode: false,
        no_verify: true,
        cert_file: None,
        key_file: None,
        client_proto: AddressFamily::V4Only,
        server_proto: AddressFamily::Any,
        blacklist_hits: 3,
    };
    let _tunnel = Tunnel::start(&reactor, &worker_pool, spec, true).expect("tunnel starts");

    let mut inbound = TcpStream::connect(("127.0.0.1", bind_port)).expect("connect to tunnel");
    inbound.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 16];
    let mut saw_eof = false;
    while Instant::now() < deadline {
        reactor::run_once(&reactor).expect("reactor iteration");
        match inbound.read(&mut buf) {
            Ok(0) => {
                saw_eof = true;
                break;
            }
            Ok(_) => panic!("silent remote should never produce plaintext"),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    assert!(saw_eof, "inbound connection should close once the TLS handshake times out");
}
