//! Connect-timeout and blacklist-consultation scenario: a tunnel whose
//! remote is unroutable (TEST-NET-3, RFC 5737) never completes its
//! outbound TCP connect, so the inbound leg must be closed once
//! `connectingTicks` expires, and the failed address recorded in the
//! blacklist for this tunnel's subsequent attempts.
//!
//! Uses a faster-than-production tick interval to keep the test quick;
//! `connection.rs`'s own `CONNECT_TICKS` constant (6) is unchanged, so
//! this still exercises the same countdown, just compressed in wall time.

use std::io::Read;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use relayd::client::AddressFamily;
use relayd::reactor;
use relayd::tunnel::{Tunnel, TunnelSpec};
use relayd::worker::WorkerPool;
use relayd::Reactor;

const UNROUTABLE: &str = "203.0.113.1";

fn unroutable_tunnel_spec(bind_port: u16) -> TunnelSpec {
    TunnelSpec {
        bind_hosts: vec!["127.0.0.1".to_string()],
        bind_port,
        remote_host: UNROUTABLE.to_string(),
        remote_port: 443,
        server_mode: false,
        no_verify: true,
        cert_file: None,
        key_file: None,
        client_proto: AddressFamily::V4Only,
        server_proto: AddressFamily::Any,
        blacklist_hits: 2,
    }
}

#[test]
fn unroutable_remote_closes_the_inbound_connection() {
    let bind_port = 19201;
    let reactor = Reactor::new().expect("create reactor");
    reactor.borrow_mut().set_tick_interval(Duration::from_millis(100));
    let worker_pool = WorkerPool::new(&reactor, 2).expect("create worker pool");

    let _tunnel = Tunnel::start(&reactor, &worker_pool, unroutable_tunnel_spec(bind_port), true)
        .expect("tunnel starts even though the remote is unroutable");

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
            Ok(_) => panic!("unroutable remote should never send data back"),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    assert!(saw_eof, "inbound connection should be closed once the connect countdown expires");
}
