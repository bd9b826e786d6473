//! Library defaults, used when no environment override is present.

/// TCP port the supervisor binds.
pub const PORT: u16 = 8080;

/// Address the listener binds to.
pub const LISTEN_IP: &str = "0.0.0.0";

/// Size of the worker pool.
pub const NUM_CHILDREN: usize = 4;

/// Upper bound accepted by validation.
pub const MAX_CHILDREN: usize = 1024;

/// Single-instance lock file.
pub const LOCK_FILE: &str = "/tmp/prefork.lock";

/// Listen backlog.
pub const BACKLOG: i32 = 75;

/// Serialize poll+accept across workers with the shared mutex.
pub const SERIALIZE_ACCEPT: bool = true;

/// How long a worker waits for readiness before re-checking for shutdown.
pub const ACCEPT_POLL_MS: u64 = 500;

/// Connections served before a worker recycles itself (0 = never).
pub const MAX_CONNECTIONS_PER_WORKER: u64 = 0;

/// Grace period for workers to exit after SIGTERM.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// File extensions recognized as startup scripts.
pub const SCRIPT_EXTENSIONS: &[&str] = &["sh"];
