//! The single-threaded service loop.
//!
//! [`Reactor`] wraps a level-triggered [`mio::Poll`] instance, a tick timer,
//! and the handful of named broadcast points (`startup`, `shutdown`, `tick`,
//! `eventsDone`) that the rest of the crate hangs its lifecycle management
//! off of. Readiness for a given file descriptor is dispatched directly to
//! the closure registered for it (a `HashMap<RawFd, _>`, the same style as
//! other `mio`-based event loops keyed by token) rather than through the
//! generic [`crate::event::Event`] bus used elsewhere:
//! with one subscriber per fd, a broadcast scan would just be a slower way
//! to do what a map does directly.
//!
//! The reactor lives behind `Rc<RefCell<Reactor>>`, the same interior
//! mutability pattern [`crate::connection::Connection`] uses: a readiness
//! handler is a plain `FnMut()` closure with no access to `self`, so the
//! only way it can call back into the reactor (to register a different fd,
//! say) is through its own captured `Rc<RefCell<Reactor>>` handle. Dispatch
//! therefore never holds a `borrow_mut()` across invoking a handler: the
//! handler is moved out of the map, the borrow is dropped, then the
//! handler runs and is reinserted (if it didn't unregister itself).
//!
//! Termination signals (SIGTERM, SIGINT) are handled via a `libc::signal`
//! handler that flips an atomic flag and wakes the poller through a
//! [`mio::Waker`], rather than the `pselect`-with-unblocked-signal-mask
//! trick the C original uses: mio gives us no portable way to extend its
//! edge/level-triggered poll with an atomically-unmasked signal set, and
//! the waker achieves the same observable effect (the loop wakes up
//! immediately on a termination signal, with no missed-wakeup race,
//! because the flag is stored before the wake is sent).

use crate::event::Event;
use mio::unix::SourceFd;
use mio::{Interest, Poll, Token};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static REACTOR_WAKER: OnceLock<Arc<mio::Waker>> = OnceLock::new();

extern "C" fn handle_term_signal(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    if let Some(waker) = REACTOR_WAKER.get() {
        let _ = waker.wake();
    }
}

fn install_signal_handlers(waker: Arc<mio::Waker>) {
    let _ = REACTOR_WAKER.set(waker);
    unsafe {
        libc::signal(libc::SIGTERM, handle_term_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_term_signal as libc::sighandler_t);
    }
}

/// Arguments passed to `startup` handlers; a handler may set `exit_code` to
/// a nonzero value to abort startup before the loop begins.
#[derive(Debug, Default)]
pub struct StartupArgs {
    exit_code: Cell<i32>,
}

impl StartupArgs {
    /// Request that `run()` return this exit code without entering the loop.
    pub fn fail(&self, code: i32) {
        self.exit_code.set(code);
    }

    /// The exit code requested so far (0 means "proceed").
    pub fn exit_code(&self) -> i32 {
        self.exit_code.get()
    }
}

const WAKE_TOKEN: Token = Token(usize::MAX);
const DEFAULT_TICK: Duration = Duration::from_millis(1000);
const SHUTDOWN_GRACE_TICKS: u32 = 5;

#[derive(Default)]
struct FdInterest {
    read: Option<Box<dyn FnMut()>>,
    write: Option<Box<dyn FnMut()>>,
}

impl FdInterest {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// The reactor: a level-triggered readiness selector plus tick/shutdown
/// bookkeeping. There is exactly one of these per process, shared as
/// `Rc<RefCell<Reactor>>`.
pub struct Reactor {
    poll: Poll,
    events: mio::Events,
    handlers: HashMap<RawFd, FdInterest>,
    tick_interval: Duration,
    next_tick: Instant,
    timed: bool,

    shutdown_ref: i32,
    shutdown_ticks: Option<u32>,
    running: bool,
    quit_requested: bool,

    panic_handlers: Vec<Box<dyn Fn(&str)>>,
    disable_async_log: Option<Box<dyn Fn()>>,

    pub prestartup: Event<()>,
    pub startup: Event<StartupArgs>,
    pub shutdown: Event<()>,
    pub tick: Event<()>,
    pub events_done: Event<()>,
}

impl Reactor {
    /// Create a new reactor with a 1 second default tick interval.
    pub fn new() -> Result<Rc<RefCell<Self>>> {
        let poll = Poll::new().map_err(|e| Error::reactor(format!("Poll::new: {e}")))?;
        Ok(Rc::new(RefCell::new(Self {
            poll,
            events: mio::Events::with_capacity(1024),
            handlers: HashMap::new(),
            tick_interval: DEFAULT_TICK,
            next_tick: Instant::now() + DEFAULT_TICK,
            timed: false,
            shutdown_ref: -1,
            shutdown_ticks: None,
            running: false,
            quit_requested: false,
            panic_handlers: Vec::new(),
            disable_async_log: None,
            prestartup: Event::new(),
            startup: Event::new(),
            shutdown: Event::new(),
            tick: Event::new(),
            events_done: Event::new(),
        })))
    }

    /// Register the hook `panic()` calls to stop offloading log writes to
    /// the worker pool before logging the fatal line.
    pub fn set_async_log_disabler(&mut self, f: impl Fn() + 'static) {
        self.disable_async_log = Some(Box::new(f));
    }

    /// Register a handler invoked by `panic()`, in registration order.
    pub fn register_panic_handler(&mut self, f: impl Fn(&str) + 'static) {
        self.panic_handlers.push(Box::new(f));
    }

    fn interests_for(entry: &FdInterest) -> Option<Interest> {
        match (entry.read.is_some(), entry.write.is_some()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn sync_registration(&mut self, fd: RawFd) -> Result<()> {
        let wanted = self.handlers.get(&fd).and_then(Self::interests_for);
        let already_empty = self.handlers.get(&fd).map(FdInterest::is_empty).unwrap_or(true);
        let mut source = SourceFd(&fd);
        match wanted {
            Some(interest) => {
                let res = self.poll.registry().reregister(&mut source, Token(fd as usize), interest);
                if res.is_err() {
                    self.poll
                        .registry()
                        .register(&mut source, Token(fd as usize), interest)
                        .map_err(|e| Error::reactor(format!("register fd {fd}: {e}")))?;
                }
            }
            None if !already_empty => {
                let _ = self.poll.registry().deregister(&mut source);
            }
            None => {}
        }
        if already_empty {
            self.handlers.remove(&fd);
        }
        Ok(())
    }

    /// Register interest in readability of `fd`, invoking `handler` on
    /// every readiness notification for this fd until unregistered.
    pub fn register_read(&mut self, fd: RawFd, handler: impl FnMut() + 'static) -> Result<()> {
        self.handlers.entry(fd).or_default().read = Some(Box::new(handler));
        self.sync_registration(fd)
    }

    /// Stop watching `fd` for readability.
    pub fn unregister_read(&mut self, fd: RawFd) {
        if let Some(entry) = self.handlers.get_mut(&fd) {
            entry.read = None;
        }
        let _ = self.sync_registration(fd);
    }

    /// Register interest in writability of `fd`.
    pub fn register_write(&mut self, fd: RawFd, handler: impl FnMut() + 'static) -> Result<()> {
        self.handlers.entry(fd).or_default().write = Some(Box::new(handler));
        self.sync_registration(fd)
    }

    /// Stop watching `fd` for writability.
    pub fn unregister_write(&mut self, fd: RawFd) {
        if let Some(entry) = self.handlers.get_mut(&fd) {
            entry.write = None;
        }
        let _ = self.sync_registration(fd);
    }

    /// True if `fd` currently has any registered interest.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.contains_key(&fd)
    }

    /// Change the tick period. Forced on (if not already timed) the first
    /// time a shutdown lock is taken, so the shutdown grace can expire.
    pub fn set_tick_interval(&mut self, interval: Duration) {
        self.tick_interval = interval;
        self.next_tick = Instant::now() + interval;
        self.timed = true;
    }

    /// Increment the shutdown-lock refcount. While positive, a shutdown
    /// request keeps the loop alive (to let in-flight teardown finish)
    /// instead of exiting immediately.
    pub fn shutdown_lock(&mut self) {
        if self.shutdown_ref <= 0 && !self.timed {
            self.set_tick_interval(DEFAULT_TICK);
        }
        if self.shutdown_ref >= 0 {
            self.shutdown_ref += 1;
        } else {
            self.shutdown_ref = 1;
        }
    }

    /// Decrement the shutdown-lock refcount.
    pub fn shutdown_unlock(&mut self) {
        if self.shutdown_ref > 0 {
            self.shutdown_ref -= 1;
        }
    }

    /// Request a graceful shutdown, as if a termination signal arrived.
    pub fn quit(&mut self) {
        self.quit_requested = true;
    }

    /// Invoke registered panic handlers, disable async logging, log the
    /// fatal message, and fall through to an orderly shutdown instead of
    /// aborting the process (matching the C original's longjmp-to-rescue
    /// behavior, minus the nonlocal jump: Rust code never needs one here
    /// because `panic()` is always called from within `run()`'s call
    /// stack, not from a context we need to unwind out of by force).
    pub fn panic(&mut self, msg: &str) {
        for handler in &self.panic_handlers {
            handler(msg);
        }
        if let Some(disable) = &self.disable_async_log {
            disable();
        }
        error!("FATAL: {msg}");
        if self.running {
            self.quit();
        } else {
            std::process::abort();
        }
    }

    fn take_ready(&mut self) -> (Vec<RawFd>, Vec<RawFd>) {
        let mut readable = Vec::new();
        let mut writable = Vec::new();
        for ev in self.events.iter() {
            if ev.token() == WAKE_TOKEN {
                continue;
            }
            let fd = ev.token().0 as RawFd;
            if ev.is_writable() {
                writable.push(fd);
            }
            if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
                readable.push(fd);
            }
        }
        writable.sort_unstable();
        readable.sort_unstable();
        (writable, readable)
    }
}

fn dispatch_write(reactor: &Rc<RefCell<Reactor>>, fd: RawFd) {
    let handler = reactor.borrow_mut().handlers.get_mut(&fd).and_then(|e| e.write.take());
    if let Some(mut h) = handler {
        h();
        let mut r = reactor.borrow_mut();
        if let Some(entry) = r.handlers.get_mut(&fd) {
            if entry.write.is_none() {
                entry.write = Some(h);
            }
        }
    }
}

fn dispatch_read(reactor: &Rc<RefCell<Reactor>>, fd: RawFd) {
    let handler = reactor.borrow_mut().handlers.get_mut(&fd).and_then(|e| e.read.take());
    if let Some(mut h) = handler {
        h();
        let mut r = reactor.borrow_mut();
        if let Some(entry) = r.handlers.get_mut(&fd) {
            if entry.read.is_none() {
                entry.read = Some(h);
            }
        }
    }
}

/// Run one iteration of the loop: fire `eventsDone`, wait for readiness or
/// the tick deadline (whichever comes first), then dispatch. Returns
/// `Some(exit_code)` once the loop should stop.
fn run_iteration(reactor: &Rc<RefCell<Reactor>>) -> Result<Option<i32>> {
    reactor.borrow().events_done.raise(&());

    let woke_for_shutdown = {
        let mut r = reactor.borrow_mut();
        let requested = r.quit_requested || SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst);
        r.quit_requested = false;
        requested && r.shutdown_ticks.is_none()
    };
    if woke_for_shutdown {
        let mut r = reactor.borrow_mut();
        r.shutdown_ticks = Some(SHUTDOWN_GRACE_TICKS);
        if !r.timed {
            r.set_tick_interval(DEFAULT_TICK);
        }
        drop(r);
        reactor.borrow().shutdown.raise(&());
        return Ok(None);
    }

    // Once shutdown is underway, exit the moment every in-flight teardown
    // has released its lock rather than always waiting out the grace
    // ticks below, mirroring the C original's `while (shutdownRef != 0)`
    // re-check on every loop pass.
    {
        let r = reactor.borrow();
        if r.shutdown_ticks.is_some() && r.shutdown_ref <= 0 {
            return Ok(Some(0));
        }
    }

    let timeout = {
        let r = reactor.borrow();
        if r.timed {
            Some(r.next_tick.saturating_duration_since(Instant::now()))
        } else {
            None
        }
    };

    {
        let mut r = reactor.borrow_mut();
        let Reactor { poll, events, .. } = &mut *r;
        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(Error::reactor(format!("poll: {e}"))),
        }
    }

    let now = Instant::now();
    let fired_tick = {
        let mut r = reactor.borrow_mut();
        if r.timed && now >= r.next_tick {
            r.next_tick = now + r.tick_interval;
            if let Some(ticks) = r.shutdown_ticks {
                if ticks == 0 {
                    return Ok(Some(0));
                }
                r.shutdown_ticks = Some(ticks - 1);
            }
            true
        } else {
            false
        }
    };
    if fired_tick {
        reactor.borrow().tick.raise(&());
        return Ok(None);
    }

    let (writable, readable) = reactor.borrow_mut().take_ready();
    for fd in writable {
        dispatch_write(reactor, fd);
    }
    for fd in readable {
        dispatch_read(reactor, fd);
    }
    Ok(None)
}

/// Drive a single loop iteration without installing signal handlers or
/// raising `startup`/`shutdown`. Exposed for other modules' tests that
/// need to pump the reactor (e.g. waiting on a worker-pool completion
/// pipe) without running a full service lifecycle.
#[doc(hidden)]
pub fn run_once(reactor: &Rc<RefCell<Reactor>>) -> Result<Option<i32>> {
    run_iteration(reactor)
}

/// Run the service loop until a termination signal, `quit()`, or a
/// `panic()` call ends it. Returns the process exit code.
pub fn run(reactor: &Rc<RefCell<Reactor>>) -> Result<i32> {
    let waker = {
        let r = reactor.borrow();
        Arc::new(
            mio::Waker::new(r.poll.registry(), WAKE_TOKEN)
                .map_err(|e| Error::reactor(format!("Waker::new: {e}")))?,
        )
    };
    install_signal_handlers(waker);

    let sea = StartupArgs::default();
    reactor.borrow().startup.raise(&sea);
    if sea.exit_code() != 0 {
        return Ok(sea.exit_code());
    }

    reactor.borrow_mut().running = true;
    info!("service started");

    let result = loop {
        match catch_unwind(AssertUnwindSafe(|| run_iteration(reactor))) {
            Ok(Ok(Some(code))) => break Ok(code),
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => break Err(e),
            Err(panic_payload) => {
                let msg = panic_message(&panic_payload);
                warn!("reactor iteration panicked: {msg}");
                reactor.borrow_mut().panic(&msg);
            }
        }
    };

    reactor.borrow_mut().running = false;
    info!("service shutting down");
    result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_interval_marks_timed() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.borrow().timed);
        reactor.borrow_mut().set_tick_interval(Duration::from_millis(10));
        assert!(reactor.borrow().timed);
    }

    #[test]
    fn shutdown_lock_forces_tick_interval_on() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.borrow().timed);
        reactor.borrow_mut().shutdown_lock();
        assert!(reactor.borrow().timed);
        assert_eq!(reactor.borrow().shutdown_ref, 1);
        reactor.borrow_mut().shutdown_unlock();
        assert_eq!(reactor.borrow().shutdown_ref, 0);
    }

    #[test]
    fn register_then_unregister_read_clears_interest() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let reactor = Reactor::new().unwrap();
        reactor.borrow_mut().register_read(fd, || {}).unwrap();
        assert!(reactor.borrow().is_registered(fd));
        reactor.borrow_mut().unregister_read(fd);
        assert!(!reactor.borrow().is_registered(fd));
    }

    #[test]
    fn quit_raises_shutdown_once_then_exits_after_grace_ticks() {
        let reactor = Reactor::new().unwrap();
        reactor.borrow_mut().set_tick_interval(Duration::from_millis(10));

        let shutdown_count = Rc::new(Cell::new(0u32));
        let count = shutdown_count.clone();
        reactor.borrow().shutdown.register(move |_| count.set(count.get() + 1));

        // Hold a shutdown lock for the whole run so the loop can only exit
        // via the grace-tick countdown, not the "every lock released"
        // short-circuit exercised by `quit_exits_immediately_once_the_last_shutdown_lock_releases`.
        reactor.borrow_mut().shutdown_lock();

        reactor.borrow_mut().quit();
        let first = run_once(&reactor).unwrap();
        assert_eq!(first, None, "the iteration that raises shutdown does not itself exit");
        assert_eq!(shutdown_count.get(), 1);

        let mut exit_code = None;
        let deadline = Instant::now() + Duration::from_secs(2);
        while exit_code.is_none() && Instant::now() < deadline {
            exit_code = run_once(&reactor).unwrap();
        }

        assert_eq!(exit_code, Some(0), "loop should exit once the shutdown grace ticks are exhausted");
        assert_eq!(shutdown_count.get(), 1, "shutdown must only be raised once per quit");
    }

    #[test]
    fn quit_exits_immediately_once_the_last_shutdown_lock_releases() {
        let reactor = Reactor::new().unwrap();
        reactor.borrow_mut().set_tick_interval(Duration::from_millis(10));
        reactor.borrow_mut().shutdown_lock();

        reactor.borrow_mut().quit();
        let first = run_once(&reactor).unwrap();
        assert_eq!(first, None, "the iteration that raises shutdown does not itself exit");

        // No ticks have elapsed yet, so the grace countdown alone would
        // never have gotten here: releasing the last lock must be enough.
        reactor.borrow_mut().shutdown_unlock();
        let exit_code = run_once(&reactor).unwrap();
        assert_eq!(
            exit_code,
            Some(0),
            "loop should exit the moment shutdown_ref returns to zero, without waiting on the grace ticks"
        );
    }

    #[test]
    fn handler_can_reregister_another_fd_reentrantly() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;
        let (a, _b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let fd_a = a.as_raw_fd();
        let fd_c = c.as_raw_fd();
        let reactor = Reactor::new().unwrap();
        let inner = reactor.clone();
        reactor
            .borrow_mut()
            .register_read(fd_a, move || {
                inner.borrow_mut().register_read(fd_c, || {}).unwrap();
            })
            .unwrap();
        dispatch_read(&reactor, fd_a);
        assert!(reactor.borrow().is_registered(fd_c));
    }
}
