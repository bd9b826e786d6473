//! Startup orchestration
//!
//! [`Server::bind`] performs the fatal-on-failure startup steps in order:
//! validate config, take the lock, bind the listener. The resulting
//! [`BoundServer`] then runs either the worker pool or, in debug mode, a
//! single in-process serve loop.
//!
//! ```rust,ignore
//! let shutdown = Shutdown::from_signals()?;
//! let server = Server::bind(ServerConfig::try_from_env()?)?;
//! server.serve(&handler, &shutdown)?;
//! ```

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use prefork_core::{env_get_opt, handoff, ExitCause, PoolStats, RunMode, ServerConfig, SpawnMode};

use crate::error::{Result, ServerError};
use crate::listener::SharedListener;
use crate::lock::LockGuard;
use crate::mutex::ProcessMutex;
use crate::reap::ChildReaper;
use crate::report::{self, ReportSender};
use crate::signal::Shutdown;
use crate::spawn::{ExecSpawner, ForkSpawner, Spawn};
use crate::supervisor::Supervisor;
use crate::worker::{ConnectionHandler, Worker, WorkerContext, WorkerSettings};

/// How a finished [`BoundServer::serve`] went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSummary {
    Pooled(PoolStats),
    Debug { served: u64, cause: ExitCause },
}

/// Entry point.
pub struct Server;

impl Server {
    /// Validate, lock, bind. Every failure here is fatal.
    pub fn bind(config: ServerConfig) -> Result<BoundServer> {
        config.validate()?;
        config.log_summary();

        let lock = LockGuard::acquire(&config.lock_file)?;
        let listener = SharedListener::bind(config.listen_addr(), config.backlog)?;

        Ok(BoundServer { config, _lock: lock, listener })
    }
}

/// A locked, listening server that has not started serving yet.
pub struct BoundServer {
    config: ServerConfig,
    _lock: LockGuard,
    listener: SharedListener,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until `shutdown` is requested.
    pub fn serve<H>(self, handler: &H, shutdown: &Shutdown) -> Result<RunSummary>
    where
        H: ConnectionHandler + ?Sized,
    {
        match self.config.run_mode {
            RunMode::Pooled => self.serve_pooled(handler, shutdown),
            RunMode::Debug => self.serve_debug(handler, shutdown),
        }
    }

    fn serve_debug<H>(&self, handler: &H, shutdown: &Shutdown) -> Result<RunSummary>
    where
        H: ConnectionHandler + ?Sized,
    {
        tracing::info!(listen = %self.local_addr(), "Debug mode: serving in-process");
        let ctx = WorkerContext {
            listener: self.listener.handle(),
            mutex: None,
            reporter: None,
            settings: WorkerSettings::from(&self.config),
        };
        let mut worker = Worker::new(ctx, handler, shutdown);
        let cause = worker.run();
        Ok(RunSummary::Debug { served: worker.served(), cause })
    }

    fn serve_pooled<H>(&self, handler: &H, shutdown: &Shutdown) -> Result<RunSummary>
    where
        H: ConnectionHandler + ?Sized,
    {
        let mutex = if self.config.serialize_accept {
            Some(match self.config.spawn_mode {
                SpawnMode::Fork => ProcessMutex::create_anonymous()?,
                SpawnMode::Exec => ProcessMutex::create_at(mutex_path(&self.config.lock_file))?,
            })
        } else {
            None
        };
        let (receiver, sender) = report::channel()?;
        let reaper = ChildReaper::new(receiver);

        let stats = match self.config.spawn_mode {
            SpawnMode::Fork => {
                let ctx = WorkerContext {
                    listener: self.listener.handle(),
                    mutex: mutex.as_ref(),
                    reporter: Some(&sender),
                    settings: WorkerSettings::from(&self.config),
                };
                self.supervise(ForkSpawner::new(ctx, handler, shutdown.clone()), reaper, shutdown)?
            }
            SpawnMode::Exec => {
                let spawner =
                    ExecSpawner::current_exe(self.listener.handle(), &sender, mutex.as_ref())?;
                self.supervise(spawner, reaper, shutdown)?
            }
        };

        tracing::info!(?stats, "Supervisor stopped");
        Ok(RunSummary::Pooled(stats))
    }

    fn supervise<S: Spawn>(
        &self,
        spawner: S,
        reaper: ChildReaper,
        shutdown: &Shutdown,
    ) -> Result<PoolStats> {
        let mut supervisor = Supervisor::new(
            spawner,
            reaper,
            self.config.num_children,
            self.config.shutdown_timeout,
        );
        Ok(supervisor.run(shutdown)?)
    }
}

/// Backing file of the exec-mode accept mutex, next to the lock file.
pub fn mutex_path(lock_file: &Path) -> PathBuf {
    lock_file.with_extension("mutex")
}

/// Entry point of a re-executed worker image.
///
/// Rebuilds the worker context from the hand-off environment, serves, and
/// returns the process exit code.
pub fn run_worker_from_env<H>(config: &ServerConfig, handler: &H, shutdown: &Shutdown) -> Result<i32>
where
    H: ConnectionHandler + ?Sized,
{
    let listen_fd: RawFd =
        env_get_opt(handoff::LISTEN_FD).ok_or(ServerError::MissingHandoff(handoff::LISTEN_FD))?;
    let report_fd: RawFd =
        env_get_opt(handoff::REPORT_FD).ok_or(ServerError::MissingHandoff(handoff::REPORT_FD))?;

    // SAFETY: the supervisor cleared CLOEXEC on exactly these two
    // descriptors for us and nothing else in this process owns them.
    let listener = unsafe { SharedListener::from_inherited_fd(listen_fd) }?;
    let reporter = unsafe { ReportSender::from_inherited_fd(report_fd) }?;

    let mutex = match env_get_opt::<PathBuf>(handoff::MUTEX_PATH) {
        Some(path) => Some(ProcessMutex::open_at(path)?),
        None => None,
    };

    let ctx = WorkerContext {
        listener: listener.handle(),
        mutex: mutex.as_ref(),
        reporter: Some(&reporter),
        settings: WorkerSettings::from(config),
    };
    Ok(Worker::new(ctx, handler, shutdown).run_to_exit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::time::Duration;

    fn test_config(dir: &Path) -> ServerConfig {
        ServerConfig::new()
            .listen_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .lock_file(dir.join("server.lock"))
            .accept_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_lock_failure_comes_before_bind() {
        let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupant.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        // Lock path is a directory and the port is taken: the lock error wins.
        let config = test_config(dir.path()).port(port).lock_file(dir.path());
        let err = Server::bind(config).err().unwrap();
        assert!(matches!(err, ServerError::Lock(_)), "{err}");
    }

    #[test]
    fn test_port_in_use_is_fatal() {
        let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupant.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        let err = Server::bind(test_config(dir.path()).port(port)).err().unwrap();
        assert!(matches!(err, ServerError::Listen(_)), "{err}");
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Server::bind(test_config(dir.path()).num_children(0)).err().unwrap();
        assert!(matches!(err, ServerError::Config(_)));
        assert!(!dir.path().join("server.lock").exists());
    }

    #[test]
    fn test_second_instance_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = Server::bind(test_config(dir.path())).unwrap();
        assert_ne!(first.local_addr().port(), 0);

        let err = Server::bind(test_config(dir.path())).err().unwrap();
        assert!(matches!(err, ServerError::Lock(_)));
    }

    #[test]
    fn test_debug_mode_serves_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path()).run_mode(RunMode::Debug);
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();

        let shutdown = Shutdown::new();
        let stop = shutdown.clone();
        let serving = std::thread::spawn(move || {
            let handler = move |mut conn: TcpStream, pid: i32| -> io::Result<()> {
                assert_eq!(pid, std::process::id() as i32);
                conn.write_all(b"pong")?;
                stop.request();
                Ok(())
            };
            server.serve(&handler, &shutdown)
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"pong");

        let summary = serving.join().unwrap().unwrap();
        assert_eq!(summary, RunSummary::Debug { served: 1, cause: ExitCause::Shutdown });
    }

    #[test]
    fn test_mutex_path_next_to_lock() {
        assert_eq!(mutex_path(Path::new("/tmp/prefork.lock")), PathBuf::from("/tmp/prefork.mutex"));
    }
}
