//! Server configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls (e.g. the `-d` flag selecting [`RunMode::Debug`])
//! 2. Environment variables
//! 3. Library defaults ([`defaults`])
//!
//! # Example
//!
//! ```rust,ignore
//! use prefork_core::config::{ServerConfig, RunMode};
//!
//! let config = ServerConfig::try_from_env()?
//!     .num_children(8)
//!     .run_mode(RunMode::Debug);
//! config.validate()?;
//! ```

pub mod defaults;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::env::{
    env_get, env_get_bool, env_get_list, env_get_millis, env_get_str, parse_bool, parse_value,
    split_list,
};
use crate::error::ConfigError;

/// Environment variable names read by [`ServerConfig::from_env`].
pub mod keys {
    pub const PORT: &str = "PREFORK_PORT";
    pub const LISTEN_IP: &str = "PREFORK_LISTEN_IP";
    pub const NUM_CHILDREN: &str = "PREFORK_NUM_CHILDREN";
    pub const LOCK_FILE: &str = "PREFORK_LOCK_FILE";
    pub const BACKLOG: &str = "PREFORK_BACKLOG";
    pub const SPAWN_MODE: &str = "PREFORK_SPAWN_MODE";
    pub const SERIALIZE_ACCEPT: &str = "PREFORK_SERIALIZE_ACCEPT";
    pub const ACCEPT_POLL_MS: &str = "PREFORK_ACCEPT_POLL_MS";
    pub const MAX_CONNECTIONS: &str = "PREFORK_MAX_CONNECTIONS";
    pub const SHUTDOWN_TIMEOUT_MS: &str = "PREFORK_SHUTDOWN_TIMEOUT_MS";
    pub const SCRIPT_EXTENSIONS: &str = "PREFORK_SCRIPT_EXTENSIONS";
}

/// Top-level execution strategy.
///
/// Both strategies drive the same worker serve loop; they differ only in
/// whether that loop runs in pre-forked children or in the supervisor
/// process itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Supervisor plus a pool of worker processes.
    #[default]
    Pooled,
    /// Single in-process serve loop, verbose logging.
    Debug,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Pooled => write!(f, "pooled"),
            RunMode::Debug => write!(f, "debug"),
        }
    }
}

/// How a worker process image is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpawnMode {
    /// `fork()`; the child inherits the listener and runs the serve loop.
    #[default]
    Fork,
    /// `fork()` + `exec()` of the current binary; shared resources are
    /// handed over explicitly by descriptor number and path.
    Exec,
}

impl FromStr for SpawnMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fork" => Ok(SpawnMode::Fork),
            "exec" => Ok(SpawnMode::Exec),
            _ => Err(ConfigError::Parse {
                key: keys::SPAWN_MODE,
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnMode::Fork => write!(f, "fork"),
            SpawnMode::Exec => write!(f, "exec"),
        }
    }
}

/// Supervisor configuration with builder pattern.
///
/// Loaded once before the listener is created and never mutated by
/// workers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to bind
    pub port: u16,
    /// Address to bind
    pub listen_ip: IpAddr,
    /// Target pool size
    pub num_children: usize,
    /// Single-instance lock file
    pub lock_file: PathBuf,
    /// Listen backlog
    pub backlog: i32,
    /// Worker process creation strategy
    pub spawn_mode: SpawnMode,
    /// Serialize poll+accept through the shared mutex
    pub serialize_accept: bool,
    /// Readiness wait before re-checking for shutdown
    pub accept_poll_interval: Duration,
    /// Connections before a worker recycles itself (0 = unlimited)
    pub max_connections_per_worker: u64,
    /// Grace period for workers during shutdown
    pub shutdown_timeout: Duration,
    /// Extensions recognized as startup scripts (without the dot)
    pub script_extensions: Vec<String>,
    /// Pooled or single-process debug loop
    pub run_mode: RunMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Lenient: a malformed variable is treated as unset. Startup paths
    /// use [`ServerConfig::try_from_env`] instead.
    ///
    /// Environment variables (all optional):
    /// - `PREFORK_PORT` - TCP port
    /// - `PREFORK_LISTEN_IP` - Bind address
    /// - `PREFORK_NUM_CHILDREN` - Worker pool size
    /// - `PREFORK_LOCK_FILE` - Lock file path
    /// - `PREFORK_BACKLOG` - Listen backlog
    /// - `PREFORK_SPAWN_MODE` - `fork` or `exec`
    /// - `PREFORK_SERIALIZE_ACCEPT` - Use the accept mutex (0/1)
    /// - `PREFORK_ACCEPT_POLL_MS` - Readiness wait in milliseconds
    /// - `PREFORK_MAX_CONNECTIONS` - Connections per worker before recycling
    /// - `PREFORK_SHUTDOWN_TIMEOUT_MS` - Shutdown grace period
    /// - `PREFORK_SCRIPT_EXTENSIONS` - Comma-separated script extensions
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            port: env_get(keys::PORT, base.port),
            listen_ip: env_get(keys::LISTEN_IP, base.listen_ip),
            num_children: env_get(keys::NUM_CHILDREN, base.num_children),
            lock_file: PathBuf::from(env_get_str(keys::LOCK_FILE, defaults::LOCK_FILE)),
            backlog: env_get(keys::BACKLOG, base.backlog),
            spawn_mode: env_get(keys::SPAWN_MODE, base.spawn_mode),
            serialize_accept: env_get_bool(keys::SERIALIZE_ACCEPT, base.serialize_accept),
            accept_poll_interval: env_get_millis(keys::ACCEPT_POLL_MS, defaults::ACCEPT_POLL_MS),
            max_connections_per_worker: env_get(
                keys::MAX_CONNECTIONS,
                base.max_connections_per_worker,
            ),
            shutdown_timeout: env_get_millis(
                keys::SHUTDOWN_TIMEOUT_MS,
                defaults::SHUTDOWN_TIMEOUT_MS,
            ),
            script_extensions: env_get_list(keys::SCRIPT_EXTENSIONS, defaults::SCRIPT_EXTENSIONS),
            run_mode: RunMode::Pooled,
        }
    }

    /// Like [`ServerConfig::from_env`], but a set variable that does not
    /// parse is a [`ConfigError::Parse`].
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(|key| std::env::var(key).ok())
    }

    /// Strict loader reading variables through `lookup` instead of the
    /// process environment.
    pub fn try_from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key);
        let base = Self::new();

        let serialize_accept = match get(keys::SERIALIZE_ACCEPT) {
            None => base.serialize_accept,
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::Parse {
                key: keys::SERIALIZE_ACCEPT,
                value: raw,
            })?,
        };
        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_value::<u64>(key, get(key).as_deref())?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };
        let script_extensions = get(keys::SCRIPT_EXTENSIONS)
            .map(|raw| split_list(&raw))
            .filter(|exts| !exts.is_empty())
            .unwrap_or(base.script_extensions);

        Ok(Self {
            port: parse_value(keys::PORT, get(keys::PORT).as_deref())?.unwrap_or(base.port),
            listen_ip: parse_value(keys::LISTEN_IP, get(keys::LISTEN_IP).as_deref())?
                .unwrap_or(base.listen_ip),
            num_children: parse_value(keys::NUM_CHILDREN, get(keys::NUM_CHILDREN).as_deref())?
                .unwrap_or(base.num_children),
            lock_file: get(keys::LOCK_FILE).map(PathBuf::from).unwrap_or(base.lock_file),
            backlog: parse_value(keys::BACKLOG, get(keys::BACKLOG).as_deref())?
                .unwrap_or(base.backlog),
            spawn_mode: parse_value(keys::SPAWN_MODE, get(keys::SPAWN_MODE).as_deref())?
                .unwrap_or(base.spawn_mode),
            serialize_accept,
            accept_poll_interval: millis(keys::ACCEPT_POLL_MS, base.accept_poll_interval)?,
            max_connections_per_worker: parse_value(
                keys::MAX_CONNECTIONS,
                get(keys::MAX_CONNECTIONS).as_deref(),
            )?
            .unwrap_or(base.max_connections_per_worker),
            shutdown_timeout: millis(keys::SHUTDOWN_TIMEOUT_MS, base.shutdown_timeout)?,
            script_extensions,
            run_mode: RunMode::Pooled,
        })
    }

    /// Create config with library defaults only (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            port: defaults::PORT,
            listen_ip: defaults::LISTEN_IP
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            num_children: defaults::NUM_CHILDREN,
            lock_file: PathBuf::from(defaults::LOCK_FILE),
            backlog: defaults::BACKLOG,
            spawn_mode: SpawnMode::Fork,
            serialize_accept: defaults::SERIALIZE_ACCEPT,
            accept_poll_interval: Duration::from_millis(defaults::ACCEPT_POLL_MS),
            max_connections_per_worker: defaults::MAX_CONNECTIONS_PER_WORKER,
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            script_extensions: defaults::SCRIPT_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            run_mode: RunMode::Pooled,
        }
    }

    // Builder methods

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    pub fn num_children(mut self, n: usize) -> Self {
        self.num_children = n;
        self
    }

    pub fn lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = path.into();
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn_mode = mode;
        self
    }

    pub fn serialize_accept(mut self, enable: bool) -> Self {
        self.serialize_accept = enable;
        self
    }

    pub fn accept_poll_interval(mut self, d: Duration) -> Self {
        self.accept_poll_interval = d;
        self
    }

    pub fn max_connections_per_worker(mut self, n: u64) -> Self {
        self.max_connections_per_worker = n;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn script_extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script_extensions = exts.into_iter().map(Into::into).collect();
        self
    }

    pub fn run_mode(mut self, mode: RunMode) -> Self {
        self.run_mode = mode;
        self
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    /// Whether `path` ends in one of the recognized script extensions.
    pub fn is_startup_script(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.script_extensions
                    .iter()
                    .any(|known| known.trim_start_matches('.') == ext)
            })
            .unwrap_or(false)
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_children == 0 {
            return Err(ConfigError::InvalidValue("num_children must be > 0"));
        }
        if self.num_children > defaults::MAX_CHILDREN {
            return Err(ConfigError::InvalidValue("num_children must be <= 1024"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.lock_file.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue("lock_file must not be empty"));
        }
        if self.accept_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("accept_poll_interval must be > 0"));
        }
        Ok(())
    }

    /// Log the effective configuration at info level.
    pub fn log_summary(&self) {
        tracing::info!(
            listen = %self.listen_addr(),
            num_children = self.num_children,
            backlog = self.backlog,
            lock_file = %self.lock_file.display(),
            spawn_mode = %self.spawn_mode,
            run_mode = %self.run_mode,
            serialize_accept = self.serialize_accept,
            accept_poll_ms = self.accept_poll_interval.as_millis() as u64,
            max_connections_per_worker = self.max_connections_per_worker,
            shutdown_timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Server configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::new();
        assert_eq!(config.port, defaults::PORT);
        assert_eq!(config.backlog, 75);
        assert_eq!(config.run_mode, RunMode::Pooled);
        assert_eq!(config.spawn_mode, SpawnMode::Fork);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .port(9000)
            .listen_ip("127.0.0.1".parse().unwrap())
            .num_children(2)
            .backlog(10)
            .run_mode(RunMode::Debug);

        assert_eq!(config.listen_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.num_children, 2);
        assert_eq!(config.backlog, 10);
        assert_eq!(config.run_mode, RunMode::Debug);
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::new().num_children(0).validate().is_err());
        assert!(ServerConfig::new().num_children(5000).validate().is_err());
        assert!(ServerConfig::new().backlog(0).validate().is_err());
        assert!(ServerConfig::new().lock_file("").validate().is_err());
        assert!(ServerConfig::new()
            .accept_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_spawn_mode_parse() {
        assert_eq!("fork".parse::<SpawnMode>().unwrap(), SpawnMode::Fork);
        assert_eq!(" EXEC ".parse::<SpawnMode>().unwrap(), SpawnMode::Exec);
        assert!("clone".parse::<SpawnMode>().is_err());
    }

    #[test]
    fn test_startup_script_detection() {
        let config = ServerConfig::new().script_extensions([".sh", "bash"]);
        assert!(config.is_startup_script(Path::new("setup.sh")));
        assert!(config.is_startup_script(Path::new("/opt/init.bash")));
        assert!(!config.is_startup_script(Path::new("notes.txt")));
        assert!(!config.is_startup_script(Path::new("-d")));
    }

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key: &str| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_lookup_overrides() {
        let config = ServerConfig::try_from_lookup(lookup(&[
            (keys::BACKLOG, "12"),
            (keys::SPAWN_MODE, "exec"),
            (keys::SERIALIZE_ACCEPT, "off"),
            (keys::ACCEPT_POLL_MS, "40"),
            (keys::SCRIPT_EXTENSIONS, "sh, bash"),
            (keys::LOCK_FILE, "/run/prefork.lock"),
        ]))
        .unwrap();

        assert_eq!(config.backlog, 12);
        assert_eq!(config.spawn_mode, SpawnMode::Exec);
        assert!(!config.serialize_accept);
        assert_eq!(config.accept_poll_interval, Duration::from_millis(40));
        assert_eq!(config.script_extensions, vec!["sh", "bash"]);
        assert_eq!(config.lock_file, PathBuf::from("/run/prefork.lock"));
        assert_eq!(config.port, defaults::PORT);
    }

    #[test]
    fn test_lookup_empty_is_defaults() {
        let config = ServerConfig::try_from_lookup(lookup(&[])).unwrap();
        let base = ServerConfig::new();
        assert_eq!(config.port, base.port);
        assert_eq!(config.num_children, base.num_children);
        assert_eq!(config.script_extensions, base.script_extensions);
        assert_eq!(config.shutdown_timeout, base.shutdown_timeout);
    }

    #[test]
    fn test_malformed_spawn_mode_is_error() {
        let err = ServerConfig::try_from_lookup(lookup(&[(keys::SPAWN_MODE, "clone")])).unwrap_err();
        assert_eq!(err, ConfigError::Parse { key: keys::SPAWN_MODE, value: "clone".into() });
    }

    #[test]
    fn test_malformed_port_is_error() {
        let err = ServerConfig::try_from_lookup(lookup(&[(keys::PORT, "80800")])).unwrap_err();
        assert_eq!(err, ConfigError::Parse { key: keys::PORT, value: "80800".into() });
    }

    #[test]
    fn test_malformed_bool_and_millis_are_errors() {
        let err = ServerConfig::try_from_lookup(lookup(&[(keys::SERIALIZE_ACCEPT, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { key: keys::SERIALIZE_ACCEPT, .. }));

        let err = ServerConfig::try_from_lookup(lookup(&[(keys::SHUTDOWN_TIMEOUT_MS, "5s")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { key: keys::SHUTDOWN_TIMEOUT_MS, .. }));
    }
}
