//! Accepts inbound connections on one or more bound sockets and hands each
//! one to the reactor as a [`Connection`].
//!
//! A single [`Listener`] can bind several addresses (e.g. an IPv4 and an
//! IPv6 wildcard for the same port) the way `Server_createTcp` loops over
//! `getaddrinfo` results; each bound fd gets its own `readyRead`
//! registration, and the accept handler records which fd accepted so the
//! reactor knows a connection is pending there rather than on another of
//! this listener's sockets.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::client::AddressFamily;
use crate::connection::{Connection, CreateMode, TlsRole};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::reactor::Reactor;
use crate::worker::WorkerPool;
use crate::blacklist::Blacklist;

const LISTEN_BACKLOG: i32 = 8;

struct BoundSocket {
    listener: StdTcpListener,
}

/// A set of listening sockets sharing one accept policy.
pub struct Listener {
    reactor: Rc<RefCell<Reactor>>,
    worker_pool: Option<Rc<RefCell<WorkerPool>>>,
    sockets: Vec<BoundSocket>,
    numeric_hosts: bool,
    tls: Option<Arc<rustls::ServerConfig>>,
    connwait: bool,
    connections: RefCell<Vec<Connection>>,
    self_handle: RefCell<Weak<Listener>>,
    pub client_connected: Rc<Event<Connection>>,
    pub client_disconnected: Rc<Event<Connection>>,
}

impl Listener {
    /// Bind `port` on every address `bindhosts` resolves to (IPv4 and IPv6
    /// both accepted; a hostname that resolves to several addresses binds
    /// all of them), and start accepting connections through `reactor`.
    ///
    /// `connwait`, if set, accepts each connection in
    /// [`CreateMode::Wait`] instead of [`CreateMode::Normal`): no read
    /// interest is registered until the caller calls
    /// [`Connection::resume`] on it.
    pub fn bind(
        reactor: &Rc<RefCell<Reactor>>,
        worker_pool: Option<Rc<RefCell<WorkerPool>>>,
        bindhosts: &[String],
        port: u16,
        numeric_hosts: bool,
        tls: Option<Arc<rustls::ServerConfig>>,
        proto: AddressFamily,
        connwait: bool,
    ) -> Result<Rc<Self>> {
        let mut sockets = Vec::new();
        for host in bindhosts {
            match bind_host(host, port, proto) {
                Ok(mut socks) => sockets.append(&mut socks),
                Err(e) => error!(host = %host, error = %e, "listener: cannot bind"),
            }
        }
        if sockets.is_empty() {
            return Err(Error::config(format!(
                "could not bind any address for port {port}"
            )));
        }

        let listener = Rc::new(Self {
            reactor: reactor.clone(),
            worker_pool,
            sockets,
            numeric_hosts,
            tls,
            connwait,
            connections: RefCell::new(Vec::new()),
            self_handle: RefCell::new(Weak::new()),
            client_connected: Rc::new(Event::new()),
            client_disconnected: Rc::new(Event::new()),
        });
        *listener.self_handle.borrow_mut() = Rc::downgrade(&listener);

        for idx in 0..listener.sockets.len() {
            let fd = listener.sockets[idx].listener.as_raw_fd();
            let this = listener.clone();
            reactor.borrow_mut().register_read(fd, move || this.accept_on(fd))?;
        }

        Ok(listener)
    }

    fn accept_on(&self, fd: RawFd) {
        let socket = self.sockets.iter().find(|s| s.listener.as_raw_fd() == fd);
        let Some(socket) = socket else { return };

        let (stream, addr) = match socket.listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "listener: failed to accept connection");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, "listener: failed to set accepted socket nonblocking");
            return;
        }

        let tls_role = self.tls.clone().map(|config| TlsRole::Server { config });
        let blacklist: Option<Rc<RefCell<Blacklist>>> = None;
        let mode = if self.connwait { CreateMode::Wait } else { CreateMode::Normal };
        let conn = match Connection::new(
            &self.reactor,
            self.worker_pool.clone(),
            blacklist,
            stream,
            mode,
            tls_role,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "listener: failed to create connection for accepted socket");
                return;
            }
        };

        conn.set_remote_addr(addr, self.numeric_hosts);
        self.connections.borrow_mut().push(conn.clone());

        let this = self.self_handle.borrow().upgrade().expect("listener outlives its own connections");
        conn.closed().register(move |closed_with| {
            if let Some(conn) = closed_with {
                this.remove_connection(conn);
            }
        });

        debug!(addr = %conn.remote_addr(), "listener: client connected");
        self.client_connected.raise(&conn);
    }

    fn remove_connection(&self, conn: &Connection) {
        let mut conns = self.connections.borrow_mut();
        if let Some(pos) = conns.iter().position(|c| c.fd() == conn.fd()) {
            let removed = conns.remove(pos);
            drop(conns);
            debug!(addr = %removed.remote_addr(), "listener: client disconnected");
            self.client_disconnected.raise(&removed);
        } else {
            warn!("listener: tried to remove a connection it never accepted");
        }
    }

    /// Currently open connections this listener accepted.
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.borrow().clone()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for socket in &self.sockets {
            let fd = socket.listener.as_raw_fd();
            self.reactor.borrow_mut().unregister_read(fd);
        }
        for conn in self.connections.borrow().iter() {
            self.client_disconnected.raise(conn);
        }
    }
}

/// Resolve `host` and bind a socket for every matching address, mirroring
/// `Server_createTcp`'s loop over `getaddrinfo` results rather than
/// picking just the first one.
fn bind_host(host: &str, port: u16, proto: AddressFamily) -> Result<Vec<BoundSocket>> {
    let candidates: Vec<SocketAddr> = if host.is_empty() {
        vec!["[::]:0".parse::<SocketAddr>().unwrap(), "0.0.0.0:0".parse::<SocketAddr>().unwrap()]
            .into_iter()
            .map(|a| SocketAddr::new(a.ip(), port))
            .collect()
    } else {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::config(format!("cannot resolve bind host `{host}`: {e}")))?
            .collect()
    };

    let mut sockets = Vec::new();
    for addr in candidates {
        if !matches_proto(addr, proto) {
            continue;
        }
        match bind_one(addr) {
            Ok(sock) => sockets.push(sock),
            Err(e) => warn!(%addr, error = %e, "listener: cannot bind address"),
        }
    }
    if sockets.is_empty() {
        return Err(Error::config(format!("no usable address for bind host `{host}`")));
    }
    Ok(sockets)
}

fn matches_proto(addr: SocketAddr, proto: AddressFamily) -> bool {
    match proto {
        AddressFamily::Any => true,
        AddressFamily::V4Only => addr.is_ipv4(),
        AddressFamily::V6Only => addr.is_ipv6(),
    }
}

fn bind_one(addr: SocketAddr) -> Result<BoundSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::from)?;
    socket.set_reuse_address(true).map_err(Error::from)?;
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(true);
    }
    socket.set_nonblocking(true).map_err(Error::from)?;
    socket.bind(&addr.into()).map_err(Error::from)?;
    socket.listen(LISTEN_BACKLOG).map_err(Error::from)?;

    let listener = unsafe { StdTcpListener::from_raw_fd(socket.into_raw_fd()) };
    info!(%addr, "listener: listening");
    Ok(BoundSocket { listener })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn matches_proto_filters_by_family() {
        let v4: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let v6: SocketAddr = "[::1]:0".parse().unwrap();
        assert!(matches_proto(v4, AddressFamily::Any) && matches_proto(v6, AddressFamily::Any));
        assert!(matches_proto(v4, AddressFamily::V4Only) && !matches_proto(v6, AddressFamily::V4Only));
        assert!(matches_proto(v6, AddressFamily::V6Only) && !matches_proto(v4, AddressFamily::V6Only));
    }

    #[test]
    fn bind_host_v4_only_skips_unresolvable_v6_candidate() {
        // "127.0.0.1" only ever resolves to a v4 candidate, so V6Only must
        // find nothing usable for it.
        let err = bind_host("127.0.0.1", 0, AddressFamily::V6Only);
        assert!(err.is_err());
    }

    #[test]
    fn bind_host_binds_a_usable_v4_candidate() {
        let sockets = bind_host("127.0.0.1", 0, AddressFamily::V4Only).expect("127.0.0.1 binds");
        assert_eq!(sockets.len(), 1);
    }

    #[test]
    fn accepted_connection_raises_client_connected() {
        let reactor = Reactor::new().unwrap();
        let listener = Listener::bind(
            &reactor,
            None,
            &["127.0.0.1".to_string()],
            0,
            true,
            None,
            AddressFamily::Any,
            false,
        )
        .unwrap();

        let bound_addr = listener.sockets[0].listener.local_addr().unwrap();
        let connected = Rc::new(RefCell::new(false));
        let connected2 = connected.clone();
        listener.client_connected.register(move |_| *connected2.borrow_mut() = true);

        let _client = TcpStream::connect(bound_addr).expect("connect to bound listener");

        for _ in 0..50 {
            if *connected.borrow() {
                break;
            }
            crate::reactor::run_once(&reactor).unwrap();
        }
        assert!(*connected.borrow(), "client_connected should raise once the accept completes");
        assert_eq!(listener.connections().len(), 1);
    }
}
