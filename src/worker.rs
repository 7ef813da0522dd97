//! A bounded pool of OS threads for blocking work (name resolution) that
//! must not stall the reactor.
//!
//! Each worker is a long-lived thread parked on a `Condvar` between jobs,
//! matching the original's per-thread `start`/`done` condition variables.
//! Completion is reported back to the main thread through a pipe
//! (`UnixStream::pair`) registered with the [`crate::reactor::Reactor`] as
//! a readable fd — the worker writes one byte and the main thread's
//! handler picks the result up from a shared slot, exactly the "pipe as a
//! cross-thread event source" trick `threadpool.c` uses, just with a
//! `std::sync::Mutex` slot standing in for the raw pointer swap.
//!
//! Cancellation cooperates rather than preempts: `WorkerPool` sends
//! `SIGUSR1` to a worker whose job has exceeded its tick budget, a
//! thread-local flag flips inside that worker's signal handler, and the
//! job closure is expected to poll [`job_canceled`] at a reasonable
//! granularity (a `getaddrinfo` call cannot be interrupted mid-syscall in
//! safe Rust, but a resolver built around it can check between
//! candidates). A job that panics is caught with `catch_unwind` on the
//! worker thread and reported back as a [`WorkerOutcome::Panicked`]; the
//! main thread turns that into a call to [`crate::reactor::Reactor::panic`],
//! mirroring `threadJobDone`'s `longjmp`-triggering `Service_panic` call.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::reactor::Reactor;

thread_local! {
    static CANCELED: Cell<bool> = Cell::new(false);
}

extern "C" fn worker_interrupt(_signum: libc::c_int) {
    CANCELED.with(|c| c.set(true));
}

/// Called from inside a job closure running on a worker thread to check
/// whether its timeout has expired and it should abandon what it's doing.
pub fn job_canceled() -> bool {
    CANCELED.with(Cell::get)
}

fn install_worker_signal_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = worker_interrupt as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut());
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::sigaddset(&mut unblock, libc::SIGUSR1);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &unblock, std::ptr::null_mut());
    }
}

type BoxedResult = Box<dyn Any + Send>;
type JobProc = Box<dyn FnOnce() -> BoxedResult + Send>;

/// Outcome delivered to a job's `finished` event.
pub enum WorkerOutcome {
    /// The job ran to completion; downcast the payload to the expected type.
    Completed(BoxedResult),
    /// The job was canceled (timed out, or the pool shut down) before or
    /// during execution and never produced a result.
    Canceled,
}

struct PendingJob {
    id: u64,
    proc: JobProc,
}

/// A unit of blocking work submitted to the pool. Holds the `finished`
/// event a caller subscribes to for the result.
pub struct ThreadJob {
    id: u64,
    pub finished: Event<WorkerOutcome>,
    timeout_ticks: Cell<Option<u32>>,
    has_completed: Cell<bool>,
}

impl ThreadJob {
    /// Remaining timeout budget in reactor ticks, if this job is timed.
    pub fn timeout_ticks(&self) -> Option<u32> {
        self.timeout_ticks.get()
    }

    /// Whether the job ran to completion without being canceled.
    pub fn has_completed(&self) -> bool {
        self.has_completed.get()
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

enum SlotResult {
    Completed(BoxedResult),
    Panicked(String),
}

struct Shared {
    job: Mutex<Option<PendingJob>>,
    cond: Condvar,
    result: Mutex<Option<SlotResult>>,
    stop: AtomicBool,
    native_tid: Mutex<Option<libc::pthread_t>>,
}

struct Worker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    pipe_read: UnixStream,
    /// The job currently occupying this worker, if any (for timeout
    /// bookkeeping and for routing the completion event).
    current: RefCell<Option<Rc<ThreadJob>>>,
}

impl Worker {
    fn spawn() -> std::io::Result<Self> {
        let (pipe_read, worker_side) = UnixStream::pair()?;
        let shared = Arc::new(Shared {
            job: Mutex::new(None),
            cond: Condvar::new(),
            result: Mutex::new(None),
            stop: AtomicBool::new(false),
            native_tid: Mutex::new(None),
        });
        let thread_shared = shared.clone();
        let mut notify = worker_side;
        let handle = std::thread::Builder::new()
            .name("relayd-worker".into())
            .spawn(move || worker_main(thread_shared, &mut notify))?;
        Ok(Self { shared, handle: Some(handle), pipe_read, current: RefCell::new(None) })
    }

    fn is_busy(&self) -> bool {
        self.current.borrow().is_some()
    }

    fn native_tid(&self) -> Option<libc::pthread_t> {
        *self.shared.native_tid.lock().unwrap()
    }

    fn start(&self, id: u64, proc: JobProc) {
        let mut guard = self.shared.job.lock().unwrap();
        *guard = Some(PendingJob { id, proc });
        self.shared.cond.notify_one();
    }

    fn take_result(&self) -> Option<SlotResult> {
        self.shared.result.lock().unwrap().take()
    }

    fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.cond.notify_one();
        if let Some(tid) = self.native_tid() {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>, notify: &mut UnixStream) {
    install_worker_signal_handler();
    *shared.native_tid.lock().unwrap() = Some(unsafe { libc::pthread_self() });

    loop {
        let job = {
            let mut guard = shared.job.lock().unwrap();
            while guard.is_none() && !shared.stop.load(Ordering::SeqCst) {
                guard = shared.cond.wait(guard).unwrap();
            }
            if guard.is_none() {
                break;
            }
            guard.take().unwrap()
        };

        CANCELED.with(|c| c.set(false));
        let PendingJob { proc, .. } = job;
        let outcome = match catch_unwind(AssertUnwindSafe(move || proc())) {
            Ok(value) => SlotResult::Completed(value),
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "worker job panicked".to_string()
                };
                SlotResult::Panicked(msg)
            }
        };
        *shared.result.lock().unwrap() = Some(outcome);
        let _ = notify.write(&[0u8]);
    }
}

/// The worker pool: a fixed set of threads plus a bounded FIFO queue for
/// jobs submitted while every thread is busy.
pub struct WorkerPool {
    workers: Vec<Worker>,
    queue: VecDeque<(Rc<ThreadJob>, JobProc)>,
    queue_capacity: usize,
}

const DEFAULT_PER_CPU: usize = 2;
const DEFAULT_MAX_THREADS: usize = 32;
const QUEUE_PER_THREAD: usize = 8;
const MIN_QUEUE: usize = 16;

impl WorkerPool {
    /// Create a pool sized from the number of available CPUs (`nThreads =
    /// 0` in config), or an explicit thread count.
    pub fn new(reactor: &Rc<RefCell<Reactor>>, n_threads: usize) -> Result<Rc<RefCell<Self>>> {
        let nthreads = if n_threads > 0 {
            n_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| (n.get() * DEFAULT_PER_CPU).min(DEFAULT_MAX_THREADS))
                .unwrap_or(4)
        };
        let queue_capacity = (nthreads * QUEUE_PER_THREAD).max(MIN_QUEUE);

        debug!(nthreads, queue_capacity, "worker pool starting");

        let mut workers = Vec::with_capacity(nthreads);
        for _ in 0..nthreads {
            workers.push(Worker::spawn().map_err(Error::from)?);
        }

        let pool = Rc::new(RefCell::new(Self { workers, queue: VecDeque::new(), queue_capacity }));

        for idx in 0..pool.borrow().workers.len() {
            let fd = pool.borrow().workers[idx].pipe_read.as_raw_fd();
            let pool_handle = pool.clone();
            let reactor_handle = reactor.clone();
            reactor.borrow_mut().register_read(fd, move || {
                on_worker_readable(&pool_handle, &reactor_handle, idx);
            })?;
        }

        let pool_tick = pool.clone();
        reactor.borrow().tick.register(move |_| {
            pool_tick.borrow().check_timeouts();
        });

        Ok(pool)
    }

    fn available_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| !w.is_busy())
    }

    fn check_timeouts(&self) {
        for worker in &self.workers {
            let current = worker.current.borrow();
            if let Some(job) = current.as_ref() {
                let remaining = job.timeout_ticks.get();
                if let Some(ticks) = remaining {
                    if ticks == 0 {
                        continue;
                    }
                    let next = ticks - 1;
                    job.timeout_ticks.set(Some(next));
                    if next == 0 {
                        warn!(job_id = job.id, "worker job exceeded its tick budget, canceling");
                        job.has_completed.set(false);
                        worker.stop_current();
                    }
                }
            }
        }
    }

    /// Submit a unit of blocking work. `timeout_ticks`, if set, cancels
    /// the job (via `SIGUSR1`) after that many reactor ticks of runtime.
    /// Returns the job handle immediately; subscribe to `finished` for
    /// the result.
    pub fn submit(
        pool: &Rc<RefCell<Self>>,
        proc: impl FnOnce() -> BoxedResult + Send + 'static,
        timeout_ticks: Option<u32>,
    ) -> Result<Rc<ThreadJob>> {
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        let job = Rc::new(ThreadJob {
            id,
            finished: Event::new(),
            timeout_ticks: Cell::new(timeout_ticks),
            has_completed: Cell::new(true),
        });

        let mut pool_mut = pool.borrow_mut();
        if let Some(idx) = pool_mut.available_worker() {
            pool_mut.workers[idx].current.replace(Some(job.clone()));
            pool_mut.workers[idx].start(id, Box::new(proc));
        } else {
            if pool_mut.queue.len() >= pool_mut.queue_capacity {
                return Err(Error::resource("worker pool queue full"));
            }
            pool_mut.queue.push_back((job.clone(), Box::new(proc)));
        }
        Ok(job)
    }

    /// Cancel a job, whether running or still queued. A no-op if it has
    /// already finished.
    pub fn cancel(pool: &Rc<RefCell<Self>>, job: &Rc<ThreadJob>) {
        let mut pool_mut = pool.borrow_mut();
        if let Some(idx) = pool_mut.workers.iter().position(|w| {
            w.current.borrow().as_ref().map(|j| j.id) == Some(job.id)
        }) {
            job.has_completed.set(false);
            pool_mut.workers[idx].stop_current();
            return;
        }
        if let Some(pos) = pool_mut.queue.iter().position(|(j, _)| j.id == job.id) {
            let (job, _) = pool_mut.queue.remove(pos).unwrap();
            job.has_completed.set(false);
            drop(pool_mut);
            job.finished.raise(&WorkerOutcome::Canceled);
        }
    }
}

impl Worker {
    fn stop_current(&self) {
        if let Some(tid) = self.native_tid() {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
    }
}

fn on_worker_readable(pool: &Rc<RefCell<WorkerPool>>, reactor: &Rc<RefCell<Reactor>>, idx: usize) {
    let mut buf = [0u8; 64];
    let (job, result) = {
        let pool_ref = pool.borrow();
        let worker = &pool_ref.workers[idx];
        // drain the notification byte(s); a worker writes exactly one per job
        let mut w = &worker.pipe_read;
        let _ = w.read(&mut buf);
        let job = worker.current.borrow_mut().take();
        let result = worker.take_result();
        (job, result)
    };

    let Some(job) = job else { return };
    match result {
        Some(SlotResult::Panicked(msg)) => {
            reactor.borrow_mut().panic(&msg);
        }
        Some(SlotResult::Completed(value)) => {
            job.finished.raise(&WorkerOutcome::Completed(value));
        }
        None => {
            job.has_completed.set(false);
            job.finished.raise(&WorkerOutcome::Canceled);
        }
    }

    let next = pool.borrow_mut().queue.pop_front();
    if let Some((next_job, proc)) = next {
        let mut pool_mut = pool.borrow_mut();
        pool_mut.workers[idx].current.replace(Some(next_job.clone()));
        pool_mut.workers[idx].start(next_job.id, proc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn timeout_cancels_a_still_running_job() {
        let reactor = Reactor::new().unwrap();
        let pool = WorkerPool::new(&reactor, 1).unwrap();

        let canceled_seen = Arc::new(AtomicBool::new(false));
        let canceled_seen_worker = canceled_seen.clone();
        let job = WorkerPool::submit(
            &pool,
            move || {
                for _ in 0..500 {
                    if job_canceled() {
                        canceled_seen_worker.store(true, Ordering::SeqCst);
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Box::new(()) as BoxedResult
            },
            Some(6),
        )
        .unwrap();

        let finished = Rc::new(RefCell::new(false));
        let finished2 = finished.clone();
        job.finished.register(move |_| *finished2.borrow_mut() = true);

        // Seven ticks against a six-tick budget: the pool should cancel the
        // job on the sixth and the worker thread should notice and bail.
        for _ in 0..7 {
            reactor.borrow().tick.raise(&());
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while !*finished.borrow() && Instant::now() < deadline {
            let _ = crate::reactor::run_once(&reactor);
        }

        assert!(*finished.borrow(), "finished should fire once the canceled job's thread reports back");
        assert!(!job.has_completed(), "a canceled job must report has_completed() == false");
        assert!(canceled_seen.load(Ordering::SeqCst), "the job closure should observe the cancellation flag");
    }

    #[test]
    fn submits_and_completes_a_job() {
        let reactor = Reactor::new().unwrap();
        let pool = WorkerPool::new(&reactor, 1).unwrap();
        let job = WorkerPool::submit(&pool, || Box::new(40 + 2) as BoxedResult, None).unwrap();

        let seen: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        job.finished.register(move |outcome| {
            if let WorkerOutcome::Completed(v) = outcome {
                *seen2.borrow_mut() = Some(*v.downcast_ref::<i32>().unwrap());
            }
        });

        // Drive the reactor until the worker's pipe wakes us or we give up.
        for _ in 0..2000 {
            if seen.borrow().is_some() {
                break;
            }
            let _ = crate::reactor::run_once(&reactor);
        }
        assert_eq!(*seen.borrow(), Some(42));
    }
}
