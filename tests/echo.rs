//! End-to-end tunnel scenarios: a plain inbound leg paired with a
//! TLS-originating outbound leg talking to a self-signed TLS echo peer.
//! Mirrors the round-trip and backpressure scenarios from the crate's
//! design notes, driving the reactor from the test thread while a
//! standalone blocking TLS server plays the remote side.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relayd::client::AddressFamily;
use relayd::reactor;
use relayd::tunnel::{Tunnel, TunnelSpec};
use relayd::worker::WorkerPool;
use relayd::Reactor;

fn spawn_tls_echo_server(port: u16, byte_delay: Option<Duration>) -> thread::JoinHandle<()> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed cert");
    let cert_der = cert.serialize_der().expect("serialize cert");
    let key_der = cert.serialize_private_key_der();

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))
        .expect("build server tls config");
    let config = Arc::new(config);

    let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind echo server");
    thread::spawn(move || {
        let (sock, _addr) = listener.accept().expect("accept from tunnel");
        sock.set_nodelay(true).ok();
        let conn = rustls::ServerConnection::new(config).expect("tls server connection");
        let mut stream = rustls::StreamOwned::new(conn, sock);
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            match byte_delay {
                Some(delay) => {
                    for b in &buf[..n] {
                        if stream.write_all(std::slice::from_ref(b)).is_err() {
                            return;
                        }
                        thread::sleep(delay);
                    }
                }
                None => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn start_tunnel(bind_port: u16, remote_port: u16) -> (std::rc::Rc<std::cell::RefCell<Reactor>>, std::rc::Rc<Tunnel>) {
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
        client_proto: AddressFamily::Any,
        server_proto: AddressFamily::Any,
        blacklist_hits: 3,
    };
    let tunnel = Tunnel::start(&reactor, &worker_pool, spec, true).expect("tunnel starts");
    (reactor, tunnel)
}

fn pump_until(reactor: &std::rc::Rc<std::cell::RefCell<Reactor>>, deadline: Instant, done: &AtomicBool) {
    while !done.load(Ordering::SeqCst) && Instant::now() < deadline {
        reactor::run_once(reactor).expect("reactor iteration");
    }
}

#[test]
fn echo_round_trip() {
    let bind_port = 19101;
    let remote_port = 19102;
    let _echo = spawn_tls_echo_server(remote_port, None);
    thread::sleep(Duration::from_millis(50));

    let (reactor, _tunnel) = start_tunnel(bind_port, remote_port);

    let payload = vec![0xABu8; 65536];
    let done = Arc::new(AtomicBool::new(false));
    let received = Arc::new(Mutex::new(Vec::with_capacity(payload.len())));

    let done_writer = done.clone();
    let received_reader = received.clone();
    let expected_len = payload.len();
    let client_thread = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", bind_port)).expect("connect to tunnel");
        stream.set_nodelay(true).ok();

        let write_payload = payload;
        let mut writer = stream.try_clone().expect("clone stream for writer");
        let writer_thread = thread::spawn(move || {
            writer.write_all(&write_payload).expect("write payload");
        });

        let mut buf = [0u8; 4096];
        let mut total = 0;
        while total < expected_len {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received_reader.lock().unwrap().extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(e) => panic!("client read error: {e}"),
            }
        }
        writer_thread.join().expect("writer thread");
        done_writer.store(true, Ordering::SeqCst);
    });

    pump_until(&reactor, Instant::now() + Duration::from_secs(10), &done);
    client_thread.join().expect("client thread");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), expected_len);
    assert!(received.iter().all(|&b| b == 0xAB));
}

#[test]
fn backpressure_preserves_byte_order_under_a_slow_peer() {
    let bind_port = 19103;
    let remote_port = 19104;
    // The echo peer reads eagerly but replies one byte per 2ms, far slower
    // than the client sends, forcing the tunnel's write FIFO to back up.
    let _echo = spawn_tls_echo_server(remote_port, Some(Duration::from_millis(2)));
    thread::sleep(Duration::from_millis(50));

    let (reactor, _tunnel) = start_tunnel(bind_port, remote_port);

    // Scaled down from the design notes' 1 MiB/100ms-per-byte scenario to
    // keep the test fast while still forcing the write FIFO to back up:
    // at 2ms/byte, 6 KiB takes noticeably longer to echo than to send.
    let payload: Vec<u8> = (0..6144u32).map(|i| (i % 256) as u8).collect();
    let done = Arc::new(AtomicBool::new(false));
    let received = Arc::new(Mutex::new(Vec::with_capacity(payload.len())));

    let done_writer = done.clone();
    let received_reader = received.clone();
    let expected_len = payload.len();
    let expected_payload = payload.clone();
    let client_thread = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", bind_port)).expect("connect to tunnel");
        stream.set_nodelay(true).ok();

        let write_payload = payload;
        let mut writer = stream.try_clone().expect("clone stream for writer");
        let writer_thread = thread::spawn(move || {
            let _ = writer.write_all(&write_payload);
        });

        let mut buf = [0u8; 4096];
        let mut total = 0;
        while total < expected_len {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received_reader.lock().unwrap().extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(e) => panic!("client read error: {e}"),
            }
        }
        let _ = writer_thread.join();
        done_writer.store(true, Ordering::SeqCst);
    });

    // A slow peer means this legitimately takes a while; give it room.
    pump_until(&reactor, Instant::now() + Duration::from_secs(30), &done);
    client_thread.join().expect("client thread");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), expected_len, "no bytes should be lost under backpressure");
    assert_eq!(*received, expected_payload, "bytes must arrive in order");
}
