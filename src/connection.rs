//! The per-socket state machine: plaintext or TLS, client or server side,
//! still-connecting or established.
//!
//! A [`Connection`] is a cheap handle (`Rc<RefCell<Inner>>` clone) around
//! the actual state. Every public method that raises one of the
//! connection's events first clones the event's `Rc` out of `Inner` and
//! drops its borrow before calling `raise` — a handler reacting to
//! `data_received` by immediately calling `write()` on the *other* leg of
//! a tunnel is the expected, common case, and that write may itself touch
//! this same connection's `Inner` (e.g. while tearing down both legs), so
//! no method here may hold a `RefCell` borrow while dispatching.
//!
//! Bytes handed to a `data_received` handler are a fresh copy out of the
//! read buffer, not a borrow into it: a slice borrowed from `Inner` can't
//! outlive the `Ref` guard we have to drop before raising, and the
//! alternative (raw pointers into a refcounted buffer, valid only because
//! nothing else touches it during dispatch) is exactly the class of bug
//! a `RefCell`-based design exists to rule out.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, SubscriptionId};
use crate::reactor::Reactor;
use crate::worker::{self, ThreadJob, WorkerOutcome, WorkerPool};
use crate::blacklist::Blacklist;

const CONN_BUF_SIZE: usize = 16 * 1024;
const MAX_WRITE_RECORDS: usize = 16;
const CONNECT_TICKS: u32 = 6;
const RESOLVE_TICKS: u32 = 6;

/// Opaque caller-supplied tag correlating a queued write with its
/// eventual `data_sent` notification.
pub type WriteId = u64;

/// How a [`Connection`] came into being: already connected (accepted, or
/// handed a live socket) or still waiting on a nonblocking `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Connecting,
    Normal,
    /// Accepted but idle: no read/write interest is registered until the
    /// caller explicitly calls [`Connection::resume`].
    Wait,
}

/// Outcome of one nonblocking read attempt, plaintext already decrypted for
/// TLS connections.
enum ReadOutcome {
    Closed,
    WouldBlock,
    Data(Vec<u8>),
}

/// Which side of a TLS handshake this connection performs, if any.
#[derive(Clone)]
pub enum TlsRole {
    Client { config: Arc<rustls::ClientConfig>, server_name: rustls::ServerName },
    Server { config: Arc<rustls::ServerConfig> },
}

enum TlsSession {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

impl TlsSession {
    fn new(role: &TlsRole) -> Result<Self> {
        match role {
            TlsRole::Client { config, server_name } => {
                let conn = rustls::ClientConnection::new(config.clone(), server_name.clone())
                    .map_err(Error::from)?;
                Ok(Self::Client(conn))
            }
            TlsRole::Server { config } => {
                let conn = rustls::ServerConnection::new(config.clone()).map_err(Error::from)?;
                Ok(Self::Server(conn))
            }
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_read(),
            Self::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_write(),
            Self::Server(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(c) => c.is_handshaking(),
            Self::Server(c) => c.is_handshaking(),
        }
    }

    fn read_tls(&mut self, r: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.read_tls(r),
            Self::Server(c) => c.read_tls(r),
        }
    }

    fn write_tls(&mut self, w: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.write_tls(w),
            Self::Server(c) => c.write_tls(w),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Client(c) => c.process_new_packets(),
            Self::Server(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Self::Client(c) => c.reader(),
            Self::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Self::Client(c) => c.writer(),
            Self::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(c) => c.send_close_notify(),
            Self::Server(c) => c.send_close_notify(),
        }
    }
}

struct WriteRecord {
    buf: Vec<u8>,
    pos: usize,
    id: Option<WriteId>,
}

/// Data handed to `data_received` subscribers. Call [`DataReceivedArgs::hold`]
/// to pause further reads until [`Connection::confirm_data_received`].
pub struct DataReceivedArgs {
    pub data: Vec<u8>,
    handling: Cell<bool>,
}

impl DataReceivedArgs {
    /// Request that the connection stop reading until the handler is done
    /// processing this batch (backpressure).
    pub fn hold(&self) {
        self.handling.set(true);
    }
}

struct Inner {
    reactor: Rc<RefCell<Reactor>>,
    worker_pool: Option<Rc<RefCell<WorkerPool>>>,
    blacklist: Option<Rc<RefCell<Blacklist>>>,

    socket: TcpStream,
    fd: RawFd,
    tls: RefCell<Option<TlsSession>>,
    rdbuf: Box<[u8]>,

    connecting_ticks: Cell<u32>,
    tls_connect_ticks: Cell<u32>,
    connect_tick_sub: Cell<Option<SubscriptionId>>,
    tls_tick_sub: Cell<Option<SubscriptionId>>,

    writerecs: RefCell<VecDeque<WriteRecord>>,
    handling: Cell<bool>,

    addr: RefCell<Option<String>>,
    name: RefCell<Option<String>>,
    port: Cell<u16>,
    resolve_target: Cell<Option<SocketAddr>>,
    resolve_job: RefCell<Option<Rc<ThreadJob>>>,

    data: RefCell<Option<Box<dyn Any>>>,

    delete_scheduled: Cell<u8>,
    events_done_sub: Cell<Option<SubscriptionId>>,
    shutdown_lock_held: Cell<bool>,
    waiting: Cell<bool>,

    connected: Rc<Event<()>>,
    closed: Rc<Event<Option<Connection>>>,
    data_received: Rc<Event<DataReceivedArgs>>,
    data_sent: Rc<Event<WriteId>>,
    name_resolved: Rc<Event<()>>,
}

/// A TCP (optionally TLS) connection driven by the reactor.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<Inner>>,
}

impl Connection {
    /// Wrap a socket (already nonblocking) in a connection and register it
    /// with the reactor. `mode` is [`CreateMode::Connecting`] for a
    /// socket whose `connect()` is still in flight.
    pub fn new(
        reactor: &Rc<RefCell<Reactor>>,
        worker_pool: Option<Rc<RefCell<WorkerPool>>>,
        blacklist: Option<Rc<RefCell<Blacklist>>>,
        socket: TcpStream,
        mode: CreateMode,
        tls: Option<TlsRole>,
    ) -> Result<Self> {
        let fd = socket.as_raw_fd();
        let tls_session = tls.as_ref().map(TlsSession::new).transpose()?;

        let inner = Rc::new(RefCell::new(Inner {
            reactor: reactor.clone(),
            worker_pool,
            blacklist,
            socket,
            fd,
            tls: RefCell::new(tls_session),
            rdbuf: vec![0u8; CONN_BUF_SIZE].into_boxed_slice(),
            connecting_ticks: Cell::new(0),
            tls_connect_ticks: Cell::new(0),
            connect_tick_sub: Cell::new(None),
            tls_tick_sub: Cell::new(None),
            writerecs: RefCell::new(VecDeque::new()),
            handling: Cell::new(false),
            addr: RefCell::new(None),
            name: RefCell::new(None),
            port: Cell::new(0),
            resolve_target: Cell::new(None),
            resolve_job: RefCell::new(None),
            data: RefCell::new(None),
            delete_scheduled: Cell::new(0),
            events_done_sub: Cell::new(None),
            shutdown_lock_held: Cell::new(false),
            waiting: Cell::new(mode == CreateMode::Wait),
            connected: Rc::new(Event::new()),
            closed: Rc::new(Event::new()),
            data_received: Rc::new(Event::new()),
            data_sent: Rc::new(Event::new()),
            name_resolved: Rc::new(Event::new()),
        }));

        let conn = Self { inner };
        conn.wire_reactor_handlers();

        match mode {
            CreateMode::Connecting => {
                conn.inner.borrow().connecting_ticks.set(CONNECT_TICKS);
                let c = conn.clone();
                let sub = reactor.borrow().tick.register(move |_| c.check_pending_connection());
                conn.inner.borrow().connect_tick_sub.set(Some(sub));
                reactor.borrow_mut().register_write(fd, {
                    let c = conn.clone();
                    move || c.on_writable()
                })?;
            }
            CreateMode::Normal => {
                reactor.borrow_mut().register_read(fd, {
                    let c = conn.clone();
                    move || c.on_readable()
                })?;
            }
            CreateMode::Wait => {}
        }

        Ok(conn)
    }

    fn wire_reactor_handlers(&self) {
        // readyRead/readyWrite registration is installed in `new` once we
        // know the initial mode; this hook exists so construction order
        // reads top-to-bottom the way `Connection_create` does.
    }

    pub fn connected(&self) -> Rc<Event<()>> {
        self.inner.borrow().connected.clone()
    }

    pub fn closed(&self) -> Rc<Event<Option<Connection>>> {
        self.inner.borrow().closed.clone()
    }

    pub fn data_received(&self) -> Rc<Event<DataReceivedArgs>> {
        self.inner.borrow().data_received.clone()
    }

    pub fn data_sent(&self) -> Rc<Event<WriteId>> {
        self.inner.borrow().data_sent.clone()
    }

    pub fn name_resolved(&self) -> Rc<Event<()>> {
        self.inner.borrow().name_resolved.clone()
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    /// Human-readable remote address, or `"<unknown>"` if never set.
    pub fn remote_addr(&self) -> String {
        self.inner.borrow().addr.borrow().clone().unwrap_or_else(|| "<unknown>".to_string())
    }

    /// Reverse-resolved hostname, if resolution has completed.
    pub fn remote_host(&self) -> Option<String> {
        self.inner.borrow().name.borrow().clone()
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.borrow().port.get()
    }

    /// Record the peer address and, unless `numeric_only`, kick off a
    /// background reverse-DNS lookup via the worker pool.
    pub fn set_remote_addr(&self, addr: SocketAddr, numeric_only: bool) {
        let inner = self.inner.borrow();
        *inner.addr.borrow_mut() = Some(addr.ip().to_string());
        *inner.name.borrow_mut() = None;
        inner.port.set(addr.port());
        inner.resolve_target.set(Some(addr));

        if inner.resolve_job.borrow().is_some() {
            return;
        }
        let pool = match (&inner.worker_pool, numeric_only) {
            (Some(pool), false) => pool.clone(),
            _ => {
                drop(inner);
                self.inner.borrow().name_resolved.clone().raise(&());
                return;
            }
        };
        drop(inner);

        let this = self.clone();
        let job = WorkerPool::submit(
            &pool,
            move || Box::new(reverse_dns_lookup(addr)) as Box<dyn Any + Send>,
            Some(RESOLVE_TICKS),
        );
        match job {
            Ok(job) => {
                let this2 = this.clone();
                job.finished.register(move |outcome| this2.resolve_remote_addr_finished(outcome));
                *self.inner.borrow().resolve_job.borrow_mut() = Some(job);
            }
            Err(e) => {
                warn!(error = %e, "connection: could not submit reverse DNS job");
                self.inner.borrow().name_resolved.clone().raise(&());
            }
        }
    }

    /// Set a remote address that is already known by name (no lookup).
    pub fn set_remote_addr_str(&self, addr: &str) {
        let inner = self.inner.borrow();
        *inner.addr.borrow_mut() = Some(addr.to_string());
        *inner.name.borrow_mut() = None;
    }

    fn resolve_remote_addr_finished(&self, outcome: &WorkerOutcome) {
        let job = self.inner.borrow().resolve_job.borrow_mut().take();
        let completed = job.as_ref().map(|j| j.has_completed()).unwrap_or(false);
        if completed {
            if let WorkerOutcome::Completed(value) = outcome {
                if let Some(name) = value.downcast_ref::<Option<String>>().cloned().flatten() {
                    let addr = self.remote_addr();
                    if name != addr {
                        debug!(%addr, %name, "connection: resolved remote name");
                        *self.inner.borrow().name.borrow_mut() = Some(name);
                    }
                }
            }
        } else {
            debug!(addr = %self.remote_addr(), "connection: timeout resolving remote name");
        }
        self.inner.borrow().name_resolved.clone().raise(&());
    }

    /// Queue `buf` for writing. Fails once [`MAX_WRITE_RECORDS`] writes are
    /// already queued (backpressure).
    pub fn write(&self, buf: Vec<u8>, id: Option<WriteId>) -> Result<()> {
        let inner = self.inner.borrow();
        let mut recs = inner.writerecs.borrow_mut();
        if recs.len() == MAX_WRITE_RECORDS {
            return Err(Error::resource("connection write queue full"));
        }
        recs.push_back(WriteRecord { buf, pos: 0, id });
        drop(recs);
        self.want_read_write(&inner);
        Ok(())
    }

    /// Resume reads after a `data_received` handler called
    /// [`DataReceivedArgs::hold`] and has now caught up.
    pub fn activate(&self) {
        let inner = self.inner.borrow();
        if inner.handling.get() {
            return;
        }
        self.want_read_write(&inner);
    }

    /// Acknowledge a held read batch. Returns `false` if nothing was held.
    pub fn confirm_data_received(&self) -> bool {
        let was_handling = {
            let inner = self.inner.borrow();
            let was = inner.handling.get();
            inner.handling.set(false);
            was
        };
        if !was_handling {
            return false;
        }
        self.activate();
        true
    }

    pub fn set_data(&self, data: Box<dyn Any>) {
        *self.inner.borrow().data.borrow_mut() = Some(data);
    }

    /// Inspect the caller-attached data, if any, without taking ownership.
    pub fn with_data<R>(&self, f: impl FnOnce(Option<&Box<dyn Any>>) -> R) -> R {
        let inner = self.inner.borrow();
        let data = inner.data.borrow();
        f(data.as_ref())
    }

    /// Close the connection. If `blacklist` and a remote address is known,
    /// record it so near-future reconnect attempts are throttled.
    pub fn close(&self, blacklist: bool) {
        let mut delete_scheduled = self.inner.borrow().delete_scheduled.get();
        if delete_scheduled != 0 {
            return;
        }
        let was_connecting = self.inner.borrow().connecting_ticks.get() > 0;

        {
            let inner = self.inner.borrow();
            if let Some(tls) = inner.tls.borrow_mut().as_mut() {
                if !was_connecting && !tls.is_handshaking() {
                    tls.send_close_notify();
                    // Holds the loop open long enough for the close_notify
                    // alert queued above to actually reach the wire via a
                    // later do_write, instead of the fd vanishing mid-flush.
                    inner.reactor.borrow_mut().shutdown_lock();
                    inner.shutdown_lock_held.set(true);
                }
            }
            if blacklist {
                if let (Some(bl), Some(addr)) = (&inner.blacklist, inner.resolve_target.get()) {
                    bl.borrow_mut().add(addr);
                }
            }
        }

        self.clean_for_delete();
        delete_scheduled = 1;
        self.inner.borrow().delete_scheduled.set(delete_scheduled);

        let closed_arg = if was_connecting { None } else { Some(self.clone()) };
        let closed_event = self.inner.borrow().closed.clone();
        closed_event.raise(&closed_arg);

        let this = self.clone();
        let reactor = self.inner.borrow().reactor.clone();
        let sub = reactor.borrow().events_done.register(move |_| this.finish_teardown());
        self.inner.borrow().events_done_sub.set(Some(sub));
    }

    fn finish_teardown(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.delete_scheduled.get() != 1 {
            return;
        }
        inner.delete_scheduled.set(2);
        if inner.shutdown_lock_held.replace(false) {
            inner.reactor.borrow_mut().shutdown_unlock();
        }
        if let Some(sub) = inner.events_done_sub.take() {
            let reactor = inner.reactor.clone();
            drop(inner);
            reactor.borrow().events_done.unregister(sub);
        }
    }

    fn clean_for_delete(&self) {
        let inner = self.inner.borrow();
        inner.reactor.borrow_mut().unregister_read(inner.fd);
        inner.reactor.borrow_mut().unregister_write(inner.fd);
        if let Some(tick_sub) = inner.connect_tick_sub.take() {
            inner.reactor.borrow().tick.unregister(tick_sub);
        }
        if let Some(tick_sub) = inner.tls_tick_sub.take() {
            inner.reactor.borrow().tick.unregister(tick_sub);
        }
        let resolve_job = inner.resolve_job.borrow_mut().take();
        if let Some(job) = resolve_job {
            if let Some(pool) = &inner.worker_pool {
                WorkerPool::cancel(pool, &job);
            }
        }
    }

    fn check_pending_connection(&self) {
        let expired = {
            let inner = self.inner.borrow();
            let ticks = inner.connecting_ticks.get();
            if ticks == 0 {
                return;
            }
            let next = ticks - 1;
            inner.connecting_ticks.set(next);
            next == 0
        };
        if expired {
            info!(addr = %self.remote_addr(), "connection: timeout connecting");
            self.inner.borrow().reactor.borrow_mut().unregister_write(self.fd());
            self.close(true);
        }
    }

    fn check_pending_tls_handshake(&self) {
        let expired = {
            let inner = self.inner.borrow();
            let ticks = inner.tls_connect_ticks.get();
            if ticks == 0 {
                return;
            }
            let next = ticks - 1;
            inner.tls_connect_ticks.set(next);
            next == 0
        };
        if expired {
            info!(addr = %self.remote_addr(), "connection: TLS handshake timeout");
            self.close(true);
        }
    }

    /// Resume a connection created with [`CreateMode::Wait`]: start
    /// registering read/write interest as `want_read_write` computes it.
    /// A no-op if the connection wasn't waiting.
    pub fn resume(&self) {
        let inner = self.inner.borrow();
        if !inner.waiting.replace(false) {
            return;
        }
        self.want_read_write(&inner);
    }

    fn want_read_write(&self, inner: &Inner) {
        if inner.waiting.get() {
            return;
        }
        let connecting = inner.connecting_ticks.get() > 0;
        let tls_wants_write = inner.tls.borrow().as_ref().map(TlsSession::wants_write).unwrap_or(false);
        let tls_wants_read = inner.tls.borrow().as_ref().map(TlsSession::wants_read).unwrap_or(false);
        let has_writes = !inner.writerecs.borrow().is_empty();

        let want_write = connecting || tls_wants_write || has_writes;
        let want_read = tls_wants_read || !inner.handling.get();

        let fd = inner.fd;
        let reactor = inner.reactor.clone();
        if want_write {
            let c = self.clone();
            let _ = reactor.borrow_mut().register_write(fd, move || c.on_writable());
        } else {
            reactor.borrow_mut().unregister_write(fd);
        }
        if want_read {
            let c = self.clone();
            let _ = reactor.borrow_mut().register_read(fd, move || c.on_readable());
        } else {
            reactor.borrow_mut().unregister_read(fd);
        }
    }

    fn on_writable(&self) {
        let still_connecting = {
            let inner = self.inner.borrow();
            inner.connecting_ticks.get() > 0
        };
        if still_connecting {
            self.finish_connecting();
            return;
        }
        let handshaking = {
            let inner = self.inner.borrow();
            let result = inner.tls.borrow().as_ref().map(TlsSession::is_handshaking).unwrap_or(false);
            result
        };
        if handshaking {
            self.do_handshake();
            return;
        }
        self.do_write();
    }

    fn on_readable(&self) {
        let handshaking = {
            let inner = self.inner.borrow();
            let result = inner.tls.borrow().as_ref().map(TlsSession::is_handshaking).unwrap_or(false);
            result
        };
        if handshaking {
            self.do_handshake();
            return;
        }
        if self.inner.borrow().handling.get() {
            warn!(addr = %self.remote_addr(), "connection: new data while previous batch still held");
            let inner = self.inner.borrow();
            self.want_read_write(&inner);
            return;
        }
        self.do_read();
    }

    fn finish_connecting(&self) {
        let inner_ref = self.inner.borrow();
        if let Some(sub) = inner_ref.connect_tick_sub.take() {
            inner_ref.reactor.borrow().tick.unregister(sub);
        }
        let err = inner_ref.socket.take_error().ok().flatten();
        drop(inner_ref);

        if err.is_some() {
            info!(addr = %self.remote_addr(), "connection: failed to connect");
            self.close(true);
            return;
        }

        self.inner.borrow().connecting_ticks.set(0);

        let is_tls = self.inner.borrow().tls.borrow().is_some();
        if is_tls {
            self.inner.borrow().tls_connect_ticks.set(CONNECT_TICKS);
            let c = self.clone();
            let sub = self.inner.borrow().reactor.borrow().tick.register(move |_| {
                c.check_pending_tls_handshake();
            });
            self.inner.borrow().tls_tick_sub.set(Some(sub));
            self.do_handshake();
            return;
        }

        {
            let inner = self.inner.borrow();
            self.want_read_write(&inner);
        }
        info!(addr = %self.remote_addr(), "connection: connected");
        self.inner.borrow().connected.clone().raise(&());
    }

    fn do_handshake(&self) {
        debug!(addr = %self.remote_addr(), "connection: handshake");
        let result = {
            let inner = self.inner.borrow();
            let mut tls_ref = inner.tls.borrow_mut();
            let tls = tls_ref.as_mut().expect("do_handshake called without TLS");
            pump_tls(tls, &mut inner.socket.try_clone().expect("dup socket for tls io"))
        };

        match result {
            Ok(()) => {
                let (still_handshaking, failed) = {
                    let inner = self.inner.borrow();
                    let tls_ref = inner.tls.borrow();
                    let tls = tls_ref.as_ref().unwrap();
                    (tls.is_handshaking(), false)
                };
                let _ = failed;
                if !still_handshaking {
                    let inner = self.inner.borrow();
                    if let Some(sub) = inner.tls_tick_sub.take() {
                        inner.reactor.borrow().tick.unregister(sub);
                    }
                    inner.tls_connect_ticks.set(0);
                    drop(inner);
                    info!(addr = %self.remote_addr(), "connection: TLS connected");
                    self.inner.borrow().connected.clone().raise(&());
                }
            }
            Err(e) => {
                error!(addr = %self.remote_addr(), error = %e, "connection: TLS handshake failed");
                let inner = self.inner.borrow();
                if let Some(sub) = inner.tls_tick_sub.take() {
                    inner.reactor.borrow().tick.unregister(sub);
                }
                drop(inner);
                self.close(true);
                return;
            }
        }
        let inner = self.inner.borrow();
        self.want_read_write(&inner);
    }

    fn do_read(&self) {
        debug!(addr = %self.remote_addr(), "connection: reading");
        let inner = self.inner.borrow();
        let has_tls = inner.tls.borrow().is_some();

        let read_result: io::Result<ReadOutcome> = if has_tls {
            let mut socket = inner.socket.try_clone().expect("dup socket for tls io");
            let mut tls_ref = inner.tls.borrow_mut();
            let tls = tls_ref.as_mut().unwrap();
            match tls.read_tls(&mut socket) {
                Ok(0) => Ok(ReadOutcome::Closed),
                Ok(_) => match tls.process_new_packets() {
                    Ok(_) => {
                        let mut buf = vec![0u8; CONN_BUF_SIZE];
                        match tls.reader().read(&mut buf) {
                            // No plaintext fully decoded yet (e.g. a
                            // fragmented record); not a socket-level close.
                            Ok(0) => Ok(ReadOutcome::WouldBlock),
                            Ok(n) => {
                                buf.truncate(n);
                                Ok(ReadOutcome::Data(buf))
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(io::Error::new(ErrorKind::InvalidData, e)),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                Err(e) => Err(e),
            }
        } else {
            let mut buf = inner.rdbuf.to_vec();
            match (&inner.socket).read(&mut buf) {
                Ok(0) => Ok(ReadOutcome::Closed),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(ReadOutcome::Data(buf))
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                Err(e) => Err(e),
            }
        };
        drop(inner);

        match read_result {
            Ok(ReadOutcome::Closed) => {
                debug!(addr = %self.remote_addr(), "connection: peer closed");
                self.close(false);
            }
            Ok(ReadOutcome::WouldBlock) => {
                debug!(addr = %self.remote_addr(), "connection: no data yet");
            }
            Ok(ReadOutcome::Data(data)) => {
                let args = DataReceivedArgs { data, handling: Cell::new(false) };
                let event = self.inner.borrow().data_received.clone();
                event.raise(&args);
                self.inner.borrow().handling.set(args.handling.get());
                if args.handling.get() {
                    debug!(addr = %self.remote_addr(), "connection: blocking reads (backpressure)");
                }
                let inner = self.inner.borrow();
                self.want_read_write(&inner);
            }
            Err(e) => {
                warn!(addr = %self.remote_addr(), error = %e, "connection: error reading");
                self.close(false);
            }
        }
    }

    fn do_write(&self) {
        debug!(addr = %self.remote_addr(), "connection: writing");
        let inner = self.inner.borrow();
        let has_tls = inner.tls.borrow().is_some();

        if has_tls {
            let front_data = {
                let mut recs = inner.writerecs.borrow_mut();
                recs.front().map(|r| r.buf[r.pos..].to_vec())
            };
            let Some(chunk) = front_data else {
                drop(inner);
                self.want_read_write(&self.inner.borrow());
                return;
            };
            let mut tls_ref = inner.tls.borrow_mut();
            let tls = tls_ref.as_mut().unwrap();
            let written = tls.writer().write(&chunk).and_then(|n| {
                let mut socket = inner.socket.try_clone()?;
                pump_tls(tls, &mut socket).map_err(|e| io::Error::new(ErrorKind::Other, e))?;
                Ok(n)
            });
            drop(tls_ref);
            match written {
                Ok(n) => {
                    let mut recs = inner.writerecs.borrow_mut();
                    if let Some(rec) = recs.front_mut() {
                        rec.pos += n;
                        if rec.pos >= rec.buf.len() {
                            let done = recs.pop_front().unwrap();
                            if let Some(id) = done.id {
                                drop(recs);
                                drop(inner);
                                self.inner.borrow().data_sent.clone().raise(&id);
                                let inner = self.inner.borrow();
                                self.want_read_write(&inner);
                                return;
                            }
                        }
                    }
                    drop(recs);
                    self.want_read_write(&inner);
                }
                Err(e) => {
                    warn!(addr = %self.remote_addr(), error = %e, "connection: error writing");
                    drop(inner);
                    self.close(false);
                }
            }
            return;
        }

        let chunk = {
            let recs = inner.writerecs.borrow();
            recs.front().map(|r| r.buf[r.pos..].to_vec())
        };
        let Some(chunk) = chunk else {
            drop(inner);
            self.want_read_write(&self.inner.borrow());
            return;
        };
        match (&inner.socket).write(&chunk) {
            Ok(n) => {
                let done_id = {
                    let mut recs = inner.writerecs.borrow_mut();
                    let rec = recs.front_mut().unwrap();
                    rec.pos += n;
                    if rec.pos >= rec.buf.len() {
                        recs.pop_front().unwrap().id
                    } else {
                        None
                    }
                };
                self.want_read_write(&inner);
                if let Some(id) = done_id {
                    drop(inner);
                    self.inner.borrow().data_sent.clone().raise(&id);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                info!(addr = %self.remote_addr(), "connection: not ready for writing");
            }
            Err(e) => {
                warn!(addr = %self.remote_addr(), error = %e, "connection: error writing");
                drop(inner);
                self.close(false);
            }
        }
    }
}

fn pump_tls(tls: &mut TlsSession, socket: &mut TcpStream) -> Result<()> {
    loop {
        let mut progressed = false;
        if tls.wants_write() {
            match tls.write_tls(socket) {
                Ok(0) => {}
                Ok(_) => progressed = true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
        if tls.wants_read() {
            match tls.read_tls(socket) {
                Ok(0) => {}
                Ok(_) => {
                    progressed = true;
                    tls.process_new_packets().map_err(Error::from)?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(())
}

fn reverse_dns_lookup(addr: SocketAddr) -> Option<String> {
    if worker::job_canceled() {
        return None;
    }
    let (sockaddr, len): (*const libc::sockaddr, libc::socklen_t) = match addr {
        SocketAddr::V4(v4) => {
            let raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut raw = raw;
            raw.sin_family = libc::AF_INET as libc::sa_family_t;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            let storage = raw;
            return reverse_lookup_raw(
                &storage as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
        }
        SocketAddr::V6(v6) => {
            let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            raw.sin6_port = v6.port().to_be();
            raw.sin6_addr.s6_addr = v6.ip().octets();
            return reverse_lookup_raw(
                &raw as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            );
        }
    };
    #[allow(unreachable_code)]
    {
        let _ = (sockaddr, len);
        None
    }
}

fn reverse_lookup_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<String> {
    let mut host = [0u8; libc::NI_MAXHOST as usize];
    let rc = unsafe {
        libc::getnameinfo(
            addr,
            len,
            host.as_mut_ptr() as *mut libc::c_char,
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    let end = host.iter().position(|&b| b == 0).unwrap_or(host.len());
    Some(String::from_utf8_lossy(&host[..end]).into_owned())
}
