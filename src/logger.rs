//! The `msg`/`fmt` logging facade consumed by the rest of the crate for
//! operator-facing lines (`"listening on ..."`, `"client connected from
//! ..."`), as a process-wide choice of exactly one sink, mirroring
//! `Log_setFileLogger`/`Log_setSyslogLogger`/`Log_setCustomLogger` in
//! `log.c`. This sits alongside, not instead of, the `tracing` calls
//! scattered through the reactor and worker pool: those are ambient
//! internal diagnostics; this is the fixed external contract other
//! modules are written against.
//!
//! `set_async` offloads the sink's actual write to the worker pool so a
//! blocking `syslog(3)` call or a slow file can't stall the reactor.
//! [`panic`] always forces synchronous mode first, so a fatal line is
//! guaranteed to reach the sink before the process acts on the panic.

use std::cell::RefCell;
use std::ffi::CString;
use std::io::Write;
use std::rc::Rc;
use std::sync::{Arc, Mutex, OnceLock};

use crate::reactor::Reactor;
use crate::worker::WorkerPool;

/// Severity, ordered most to least severe to match the original's enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Fatal = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Self::Fatal => "[FATAL]",
            Self::Error => "[ERROR]",
            Self::Warn => "[WARN ]",
            Self::Info => "[INFO ]",
            Self::Debug => "[DEBUG]",
        }
    }

    fn syslog_priority(self) -> libc::c_int {
        match self {
            Self::Fatal => libc::LOG_CRIT,
            Self::Error => libc::LOG_ERR,
            Self::Warn => libc::LOG_WARNING,
            Self::Info => libc::LOG_INFO,
            Self::Debug => libc::LOG_DEBUG,
        }
    }
}

type Sink = Arc<dyn Fn(Level, &str) + Send + Sync>;

struct State {
    sink: Option<Sink>,
    max_level: Level,
    silent: bool,
    async_enabled: bool,
}

fn state() -> &'static Mutex<State> {
    static STATE: OnceLock<Mutex<State>> = OnceLock::new();
    STATE.get_or_init(|| {
        Mutex::new(State { sink: None, max_level: Level::Info, silent: false, async_enabled: false })
    })
}

thread_local! {
    static WORKER_POOL: RefCell<Option<Rc<RefCell<WorkerPool>>>> = RefCell::new(None);
}

/// Write to `target` (e.g. `stderr()`), one flushed line per call.
pub fn set_file_logger<W: Write + Send + 'static>(target: W) {
    let target = Mutex::new(target);
    set_sink(Arc::new(move |level, msg| {
        let mut t = target.lock().unwrap();
        let _ = writeln!(t, "{}  {}", level.label(), msg);
        let _ = t.flush();
    }));
}

/// Route to the platform `syslog(3)`. `with_stderr` also mirrors lines to
/// stderr (`LOG_PERROR`), useful while running in the foreground.
pub fn set_syslog_logger(ident: &str, facility: libc::c_int, with_stderr: bool) {
    let c_ident = CString::new(ident).unwrap_or_else(|_| CString::new("relayd").unwrap());
    let mut logopt = libc::LOG_PID;
    if with_stderr {
        logopt |= libc::LOG_PERROR;
    }
    unsafe {
        libc::openlog(c_ident.as_ptr(), logopt, facility);
    }
    // openlog(3) may retain the ident pointer for the life of the process.
    std::mem::forget(c_ident);
    set_sink(Arc::new(|level, msg| {
        let c_msg = CString::new(msg).unwrap_or_else(|_| CString::new("<invalid log message>").unwrap());
        unsafe {
            libc::syslog(level.syslog_priority(), b"%s\0".as_ptr() as *const libc::c_char, c_msg.as_ptr());
        }
    }));
}

/// Install an arbitrary sink, for embedding or tests.
pub fn set_custom_logger(f: impl Fn(Level, &str) + Send + Sync + 'static) {
    set_sink(Arc::new(f));
}

fn set_sink(sink: Sink) {
    state().lock().unwrap().sink = Some(sink);
}

pub fn set_max_level(level: Level) {
    state().lock().unwrap().max_level = level;
}

/// Suppress everything above `Error`, e.g. while validating configuration
/// before the real sink is wired up.
pub fn set_silent(silent: bool) {
    state().lock().unwrap().silent = silent;
}

/// Offload sink writes to the worker pool so a blocking sink cannot stall
/// the reactor. Only meaningful once [`attach_worker_pool`] has been called.
pub fn set_async(async_enabled: bool) {
    state().lock().unwrap().async_enabled = async_enabled;
}

/// Give the logger a pool to enqueue async writes on.
pub fn attach_worker_pool(pool: Rc<RefCell<WorkerPool>>) {
    WORKER_POOL.with(|slot| *slot.borrow_mut() = Some(pool));
}

pub fn msg(level: Level, text: &str) {
    log_line(level, text.to_string());
}

/// Formats `args` (build with `format_args!`) before writing; see the
/// per-level macros below for the common case.
pub fn log_fmt(level: Level, args: std::fmt::Arguments<'_>) {
    log_line(level, args.to_string());
}

fn log_line(level: Level, message: String) {
    let (sink, async_enabled) = {
        let st = state().lock().unwrap();
        if st.sink.is_none() {
            return;
        }
        if st.silent && level > Level::Error {
            return;
        }
        if level > st.max_level {
            return;
        }
        (st.sink.clone().unwrap(), st.async_enabled)
    };

    let pool = WORKER_POOL.with(|slot| slot.borrow().clone());
    if async_enabled {
        if let Some(pool) = pool {
            let sink_for_job = sink.clone();
            let message_for_job = message.clone();
            let submitted = WorkerPool::submit(
                &pool,
                move || {
                    sink_for_job(level, &message_for_job);
                    Box::new(()) as Box<dyn std::any::Any + Send>
                },
                None,
            );
            if submitted.is_ok() {
                return;
            }
        }
    }
    sink(level, &message);
}

/// Disable async mode and emit `text` at [`Level::Fatal`], then ask
/// `reactor` to act on the panic. Guarantees the fatal line reaches the
/// sink before teardown begins.
pub fn panic(reactor: &Rc<RefCell<Reactor>>, text: &str) {
    set_async(false);
    msg(Level::Fatal, text);
    reactor.borrow_mut().panic(text);
}

#[macro_export]
macro_rules! log_fatal {
    ($($arg:tt)*) => { $crate::logger::log_fmt($crate::logger::Level::Fatal, format_args!($($arg)*)) };
}
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::logger::log_fmt($crate::logger::Level::Error, format_args!($($arg)*)) };
}
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::logger::log_fmt($crate::logger::Level::Warn, format_args!($($arg)*)) };
}
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::logger::log_fmt($crate::logger::Level::Info, format_args!($($arg)*)) };
}
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::logger::log_fmt($crate::logger::Level::Debug, format_args!($($arg)*)) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn silent_suppresses_above_error() {
        let lines: Arc<StdMutex<Vec<(Level, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let lines2 = lines.clone();
        set_custom_logger(move |level, msg| lines2.lock().unwrap().push((level, msg.to_string())));
        set_silent(true);
        set_max_level(Level::Debug);

        msg(Level::Info, "should be suppressed");
        msg(Level::Error, "should appear");

        let seen = lines.lock().unwrap();
        assert!(seen.iter().any(|(l, m)| *l == Level::Error && m == "should appear"));
        assert!(!seen.iter().any(|(_, m)| m == "should be suppressed"));
        set_silent(false);
    }
}
