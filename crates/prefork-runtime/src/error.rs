//! Runtime error types
//!
//! One enum per resource. [`ServerError`] aggregates everything that can
//! stop the service at startup or from the supervisor loop.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitStatus;

use prefork_core::ConfigError;
use thiserror::Error;

/// Single-instance lock failures. Fatal.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("lock file {path} is held by another supervisor")]
    AlreadyLocked { path: PathBuf },

    #[error("cannot write lock file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Listening socket failures. Fatal at startup.
#[derive(Error, Debug)]
pub enum ListenError {
    #[error("socket() failed: {0}")]
    Socket(#[source] io::Error),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listen() on {addr} failed: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot configure listener: {0}")]
    Configure(#[source] io::Error),

    #[error("fd {0} is not a listening socket")]
    InvalidFd(RawFd),
}

/// Worker creation failures. Logged and tolerated in steady state.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("cannot execute worker image {path}: {source}")]
    Exec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot locate current executable: {0}")]
    CurrentExe(#[source] io::Error),
}

/// Process-shared mutex failures.
#[derive(Error, Debug)]
pub enum MutexError {
    #[error("cannot map shared mutex memory: {0}")]
    Map(#[source] io::Error),

    #[error("cannot initialize shared mutex: {0}")]
    Init(#[source] io::Error),

    #[error("cannot open mutex file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot lock shared mutex: {0}")]
    Wait(#[source] io::Error),
}

/// Exit-report channel failures.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("cannot create report pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("cannot send exit report: {0}")]
    Send(#[source] io::Error),

    #[error("cannot read exit reports: {0}")]
    Receive(#[source] io::Error),

    #[error("fd {0} is not a usable report descriptor")]
    InvalidFd(RawFd),
}

/// Startup script failures. Fatal.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("cannot launch startup script {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("startup script {path} failed: {status}")]
    Failed { path: PathBuf, status: ExitStatus },
}

/// Errors that end the worker serve loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error(transparent)]
    Mutex(#[from] MutexError),
}

/// Supervisor loop failures.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("wait for children failed: {0}")]
    Wait(#[source] io::Error),

    #[error("no live workers left and none could be spawned")]
    PoolExhausted,
}

/// Everything that stops the service.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error(transparent)]
    Mutex(#[from] MutexError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("cannot install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error("missing worker hand-off variable {0}")]
    MissingHandoff(&'static str),
}

/// Result alias for runtime operations.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;
