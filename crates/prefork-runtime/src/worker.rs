//! Worker serve loop
//!
//! The same loop runs inside a pooled worker process and, in debug mode,
//! inside the supervisor itself. Each iteration optionally takes the
//! accept mutex, waits for the listener to become readable, accepts one
//! connection, releases the mutex and hands the connection to the
//! [`ConnectionHandler`].

use std::io;
use std::net::TcpStream;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use prefork_core::{ExitCause, ExitReport, ProcessId, ServerConfig, WorkerState};

use crate::error::WorkerError;
use crate::listener::ListenerHandle;
use crate::mutex::ProcessMutex;
use crate::report::ReportSender;
use crate::signal::Shutdown;

/// The pipeline that services an accepted connection.
///
/// `serve` owns the connection and returns when it is finished with it.
/// An error only ends that connection, never the worker.
pub trait ConnectionHandler: Send + Sync {
    fn serve(&self, conn: TcpStream, worker_pid: ProcessId) -> io::Result<()>;
}

impl<F> ConnectionHandler for F
where
    F: Fn(TcpStream, ProcessId) -> io::Result<()> + Send + Sync,
{
    fn serve(&self, conn: TcpStream, worker_pid: ProcessId) -> io::Result<()> {
        self(conn, worker_pid)
    }
}

/// Loop tunables taken from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub accept_poll_interval: Duration,
    /// 0 = unlimited
    pub max_connections: u64,
}

impl From<&ServerConfig> for WorkerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            accept_poll_interval: config.accept_poll_interval,
            max_connections: config.max_connections_per_worker,
        }
    }
}

/// Shared resources a worker runs against.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    pub listener: ListenerHandle<'a>,
    /// Accept serialization; `None` lets every worker poll concurrently
    pub mutex: Option<&'a ProcessMutex>,
    /// Exit-report channel; `None` in debug mode
    pub reporter: Option<&'a ReportSender>,
    pub settings: WorkerSettings,
}

/// One serve loop.
pub struct Worker<'a, H: ?Sized> {
    ctx: WorkerContext<'a>,
    handler: &'a H,
    shutdown: &'a Shutdown,
    pid: ProcessId,
    state: WorkerState,
    served: u64,
}

impl<'a, H: ConnectionHandler + ?Sized> Worker<'a, H> {
    pub fn new(ctx: WorkerContext<'a>, handler: &'a H, shutdown: &'a Shutdown) -> Self {
        Self {
            ctx,
            handler,
            shutdown,
            pid: std::process::id() as ProcessId,
            state: WorkerState::Spawned,
            served: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Connections handed to the handler so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    fn transition(&mut self, next: WorkerState) {
        debug_assert!(self.state.can_transition_to(next), "{} -> {}", self.state, next);
        self.state = next;
    }

    /// Serve until shutdown, recycle or failure.
    pub fn run(&mut self) -> ExitCause {
        self.transition(WorkerState::Serving);
        tracing::debug!(pid = self.pid, listen = %self.ctx.listener.local_addr(), "Worker serving");

        let cause = loop {
            if self.shutdown.is_requested() {
                break ExitCause::Shutdown;
            }
            let max = self.ctx.settings.max_connections;
            if max > 0 && self.served >= max {
                break ExitCause::Recycle;
            }

            match self.accept_one() {
                Ok(Accepted::Conn(conn)) => {
                    self.served += 1;
                    if let Err(e) = self.handler.serve(conn, self.pid) {
                        tracing::debug!(pid = self.pid, error = %e, "Connection ended with error");
                    }
                }
                Ok(Accepted::Idle) => {}
                // The listener stays readable, so retrying at once would spin.
                Ok(Accepted::Starved(e)) => {
                    tracing::warn!(pid = self.pid, error = %e, "Out of resources; pausing accept");
                    std::thread::sleep(self.ctx.settings.accept_poll_interval);
                }
                Err(e) => {
                    tracing::error!(pid = self.pid, error = %e, "Worker accept loop failed");
                    break ExitCause::Failure;
                }
            }
        };

        self.transition(match cause {
            ExitCause::Failure => WorkerState::ExitingError,
            _ => WorkerState::ExitingNormal,
        });
        tracing::debug!(pid = self.pid, served = self.served, reason = ?cause, "Worker leaving");
        cause
    }

    /// Run, report the replacement count and return the process exit code.
    pub fn run_to_exit(mut self) -> i32 {
        let cause = self.run();
        if let Some(reporter) = self.ctx.reporter {
            let report = ExitReport::new(self.pid, cause.replacements());
            if let Err(e) = reporter.send(&report) {
                tracing::error!(pid = self.pid, error = %e, "Cannot report exit");
            }
        }
        cause.exit_code()
    }

    /// Wait for readiness and accept at most one connection.
    ///
    /// The mutex guard is dropped on return, before the connection is
    /// served or the worker backs off.
    fn accept_one(&mut self) -> Result<Accepted, WorkerError> {
        let _turn = match self.ctx.mutex {
            Some(m) => Some(m.lock()?),
            None => None,
        };
        if self.shutdown.is_requested() {
            return Ok(Accepted::Idle);
        }

        let listener = self.ctx.listener;
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(self.ctx.settings.accept_poll_interval)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Accepted::Idle),
            Ok(_) => {}
            Err(e) => return Err(WorkerError::Poll(e.into())),
        }

        match listener.accept() {
            Ok((conn, peer)) => {
                tracing::trace!(pid = self.pid, %peer, "Accepted");
                conn.set_nonblocking(false).map_err(WorkerError::Accept)?;
                Ok(Accepted::Conn(conn))
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptRetry::Skip => {
                    tracing::debug!(pid = self.pid, error = %e, "Accept skipped");
                    Ok(Accepted::Idle)
                }
                AcceptRetry::Backoff => Ok(Accepted::Starved(e)),
                AcceptRetry::Fatal => Err(WorkerError::Accept(e)),
            },
        }
    }
}

/// Outcome of one accept attempt.
#[derive(Debug)]
enum Accepted {
    Conn(TcpStream),
    /// Nothing ready, lost the race, or a per-connection error
    Idle,
    /// Accept failed for lack of descriptors or memory
    Starved(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptRetry {
    /// Try again right away
    Skip,
    /// Try again after one poll interval
    Backoff,
    /// The listener itself is unusable
    Fatal,
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    PollTimeout::from(poll_millis(interval))
}

fn poll_millis(interval: Duration) -> u16 {
    u16::try_from(interval.as_millis()).unwrap_or(u16::MAX)
}

fn classify_accept_error(e: &io::Error) -> AcceptRetry {
    if e.kind() == io::ErrorKind::WouldBlock {
        // Another worker won the race.
        return AcceptRetry::Skip;
    }
    match e.raw_os_error() {
        Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => AcceptRetry::Skip,
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            AcceptRetry::Backoff
        }
        _ => AcceptRetry::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::SharedListener;
    use crate::report;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(max_connections: u64) -> WorkerSettings {
        WorkerSettings {
            accept_poll_interval: Duration::from_millis(20),
            max_connections,
        }
    }

    #[test]
    fn test_shutdown_before_start() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let shutdown = Shutdown::new();
        shutdown.request();
        let handler = |_c: TcpStream, _p: ProcessId| -> io::Result<()> { Ok(()) };
        let ctx = WorkerContext {
            listener: listener.handle(),
            mutex: None,
            reporter: None,
            settings: settings(0),
        };

        let mut worker = Worker::new(ctx, &handler, &shutdown);
        assert_eq!(worker.run(), ExitCause::Shutdown);
        assert_eq!(worker.state(), WorkerState::ExitingNormal);
        assert_eq!(worker.served(), 0);
    }

    #[test]
    fn test_recycle_reports_replacement() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let mutex = ProcessMutex::create_anonymous().unwrap();
        let (mut rx, tx) = report::channel().unwrap();
        let shutdown = Shutdown::new();

        let seen = AtomicUsize::new(0);
        let handler = |mut c: TcpStream, pid: ProcessId| {
            assert_eq!(pid, std::process::id() as ProcessId);
            seen.fetch_add(1, Ordering::SeqCst);
            c.write_all(b"hi")
        };

        let addr = listener.local_addr();
        let clients: Vec<_> = (0..2).map(|_| TcpStream::connect(addr).unwrap()).collect();

        let ctx = WorkerContext {
            listener: listener.handle(),
            mutex: Some(&mutex),
            reporter: Some(&tx),
            settings: settings(2),
        };
        let code = Worker::new(ctx, &handler, &shutdown).run_to_exit();

        assert_eq!(code, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(rx.take(std::process::id() as ProcessId).unwrap(), Some(1));
        // The mutex is free again once the loop is done.
        assert!(mutex.try_lock().unwrap().is_some());

        for mut c in clients {
            let mut buf = Vec::new();
            c.read_to_end(&mut buf).unwrap();
            assert_eq!(buf, b"hi");
        }
    }

    #[test]
    fn test_handler_error_keeps_worker_alive() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let shutdown = Shutdown::new();
        let calls = AtomicUsize::new(0);
        let handler = |_c: TcpStream, _p: ProcessId| -> io::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        };

        let addr = listener.local_addr();
        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();

        let ctx = WorkerContext {
            listener: listener.handle(),
            mutex: None,
            reporter: None,
            settings: settings(2),
        };
        let mut worker = Worker::new(ctx, &handler, &shutdown);
        assert_eq!(worker.run(), ExitCause::Recycle);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_accept_error_classes() {
        let class = |errno| classify_accept_error(&io::Error::from_raw_os_error(errno));
        assert_eq!(class(libc::EAGAIN), AcceptRetry::Skip);
        assert_eq!(class(libc::ECONNABORTED), AcceptRetry::Skip);
        assert_eq!(class(libc::EMFILE), AcceptRetry::Backoff);
        assert_eq!(class(libc::ENFILE), AcceptRetry::Backoff);
        assert_eq!(class(libc::ENOBUFS), AcceptRetry::Backoff);
        assert_eq!(class(libc::EBADF), AcceptRetry::Fatal);
    }

    #[test]
    fn test_poll_interval_saturates() {
        assert_eq!(poll_millis(Duration::from_secs(3600)), u16::MAX);
        assert_eq!(poll_millis(Duration::from_millis(250)), 250);
    }
}
