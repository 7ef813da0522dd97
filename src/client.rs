//! Establishes outbound TCP (optionally TLS) connections.
//!
//! Unlike the original `Connection_createTcpClient`, name resolution here
//! never runs on the reactor thread: `connect_async` submits the
//! `getaddrinfo`-equivalent lookup to the [`WorkerPool`] (the same pool
//! `Connection` uses for reverse DNS) and only touches sockets once a
//! candidate address list comes back, preserving the original's
//! try-each-address-in-order behavior and its blacklist consultation
//! without blocking the loop that every other tunnel leg depends on.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::rc::Rc;

use socket2::{Domain, Socket, Type};
use tracing::{error, info, warn};

use crate::blacklist::Blacklist;
use crate::connection::{Connection, CreateMode, TlsRole};
use crate::error::Result;
use crate::reactor::Reactor;
use crate::worker::{WorkerOutcome, WorkerPool};

/// Address family preference for an outbound connection, mirroring the
/// original's `CP_IPv4`/`CP_IPv6`/"either" proto option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    V4Only,
    V6Only,
}

/// Parameters for an outbound connection attempt.
pub struct ClientConfig {
    pub remote_host: String,
    pub port: u16,
    pub proto: AddressFamily,
    pub numeric_hosts: bool,
    pub tls: Option<TlsRole>,
}

/// Resolve `config.remote_host` off-thread, then connect to the first
/// candidate address that isn't blacklisted. `on_connected` runs once,
/// with `Some(connection)` on success or `None` if every candidate failed.
pub fn connect_async(
    reactor: &Rc<RefCell<Reactor>>,
    worker_pool: &Rc<RefCell<WorkerPool>>,
    blacklist: Rc<RefCell<Blacklist>>,
    config: ClientConfig,
    on_connected: impl FnOnce(Option<Connection>) + 'static,
) -> Result<()> {
    let host = config.remote_host.clone();
    let port = config.port;
    let lookup_host = host.clone();

    let job = WorkerPool::submit(
        worker_pool,
        move || {
            let result = (lookup_host.as_str(), port).to_socket_addrs();
            Box::new(result.map(|it| it.collect::<Vec<SocketAddr>>()).ok()) as Box<dyn std::any::Any + Send>
        },
        None,
    )?;

    let reactor = reactor.clone();
    let mut on_connected = Some(on_connected);
    job.finished.register(move |outcome| {
        let WorkerOutcome::Completed(value) = outcome else {
            warn!(%host, "client: name resolution canceled");
            if let Some(cb) = on_connected.take() {
                cb(None);
            }
            return;
        };
        let candidates = value
            .downcast_ref::<Option<Vec<SocketAddr>>>()
            .cloned()
            .flatten()
            .unwrap_or_default();
        if candidates.is_empty() {
            error!(%host, "client: cannot resolve address");
            if let Some(cb) = on_connected.take() {
                cb(None);
            }
            return;
        }

        let conn = connect_first_candidate(&reactor, &blacklist, &candidates, &config);
        if let Some(cb) = on_connected.take() {
            cb(conn);
        }
    });

    Ok(())
}

fn connect_first_candidate(
    reactor: &Rc<RefCell<Reactor>>,
    blacklist: &Rc<RefCell<Blacklist>>,
    candidates: &[SocketAddr],
    config: &ClientConfig,
) -> Option<Connection> {
    for &addr in candidates {
        if !address_matches_proto(addr, config.proto) {
            continue;
        }
        if blacklist.borrow_mut().check(addr) {
            continue;
        }
        match connect_one(addr) {
            Ok(stream) => {
                let conn = Connection::new(
                    reactor,
                    None,
                    Some(blacklist.clone()),
                    stream,
                    CreateMode::Connecting,
                    config.tls.clone(),
                )
                .ok()?;
                conn.set_remote_addr(addr, config.numeric_hosts);
                info!(%addr, "client: connecting");
                return Some(conn);
            }
            Err(e) => {
                warn!(%addr, error = %e, "client: cannot connect");
                continue;
            }
        }
    }
    error!(host = %config.remote_host, "client: cannot connect to any candidate address");
    None
}

fn address_matches_proto(addr: SocketAddr, proto: AddressFamily) -> bool {
    match proto {
        AddressFamily::Any => true,
        AddressFamily::V4Only => addr.is_ipv4(),
        AddressFamily::V6Only => addr.is_ipv6(),
    }
}

fn connect_one(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}
