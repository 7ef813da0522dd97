//! Process wiring: parse argv, stand up the reactor and worker pool, start
//! every configured tunnel, and run the service loop to completion.
//!
//! Mirrors `main.c`'s `Config_fromOpts` → `Tlsc_run` handoff, collapsed into
//! one binary since this crate never forks/daemonizes: `-f` only toggles
//! which [`logger`] sink gets installed (file-to-stderr vs syslog), not
//! whether the process detaches.

use std::rc::Rc;
use std::time::Duration;

use relayd::{config, logger, reactor, tunnel::Tunnel, Reactor};

const WORKER_THREADS: usize = 4;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    let cfg = match config::from_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    if cfg.daemonize {
        logger::set_syslog_logger("relayd", libc::LOG_DAEMON, true);
    } else {
        logger::set_file_logger(std::io::stderr());
    }
    logger::set_max_level(if cfg.verbose { logger::Level::Debug } else { logger::Level::Info });

    // Matches `Service_setTickInterval(1000)` in the original's daemonrun:
    // connect/TLS-handshake countdowns only advance once a tick period is
    // actually configured.
    let reactor = match Reactor::new() {
        Ok(r) => r,
        Err(e) => {
            logger::msg(logger::Level::Fatal, &format!("cannot create reactor: {e}"));
            return 1;
        }
    };
    let worker_pool = match relayd::worker::WorkerPool::new(&reactor, WORKER_THREADS) {
        Ok(p) => p,
        Err(e) => {
            logger::msg(logger::Level::Fatal, &format!("cannot create worker pool: {e}"));
            return 1;
        }
    };
    reactor.borrow_mut().set_tick_interval(TICK_INTERVAL);

    logger::attach_worker_pool(worker_pool.clone());
    logger::set_async(true);

    reactor.borrow_mut().set_async_log_disabler(|| logger::set_async(false));

    let pidfile_written = write_pidfile(&cfg.pidfile);

    let mut tunnels: Vec<Rc<Tunnel>> = Vec::with_capacity(cfg.tunnels.len());
    for spec in cfg.tunnels {
        match Tunnel::start(&reactor, &worker_pool, spec, cfg.numeric_hosts) {
            Ok(tunnel) => tunnels.push(tunnel),
            Err(e) => {
                logger::msg(logger::Level::Fatal, &format!("cannot start tunnel: {e}"));
                if pidfile_written {
                    let _ = std::fs::remove_file(&cfg.pidfile);
                }
                return 1;
            }
        }
    }

    logger::msg(logger::Level::Info, &format!("started {} tunnel(s)", tunnels.len()));

    let code = reactor::run(&reactor).unwrap_or_else(|e| {
        logger::msg(logger::Level::Fatal, &format!("service loop exited with error: {e}"));
        1
    });

    drop(tunnels);
    if pidfile_written {
        let _ = std::fs::remove_file(&cfg.pidfile);
    }
    logger::msg(logger::Level::Info, "shutdown complete");
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_write_and_cleanup() {
        let path = std::env::temp_dir().join(format!("relayd-test-{}.pid", std::process::id()));
        assert!(write_pidfile(&path));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        std::fs::remove_file(&path).unwrap();
    }
}

/// Best-effort pidfile write; not chowned or written atomically, since
/// daemonization (the only reason the original needed that rigor) is out of
/// scope here. Returns whether the file was actually created, so shutdown
/// only removes what startup created.
fn write_pidfile(path: &std::path::Path) -> bool {
    match std::fs::write(path, format!("{}\n", std::process::id())) {
        Ok(()) => true,
        Err(e) => {
            logger::msg(logger::Level::Warn, &format!("cannot write pidfile {}: {e}", path.display()));
            false
        }
    }
}
