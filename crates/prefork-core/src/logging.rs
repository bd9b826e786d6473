//! Logging setup shared by the supervisor, workers and the binaries.
//!
//! # Environment Variables
//!
//! - `PREFORK_LOG` - Filter directive (e.g. `prefork_runtime=debug`), wins over level
//! - `PREFORK_LOG_LEVEL` - error, warn, info, debug, trace
//! - `PREFORK_LOG_FORMAT` - pretty or compact
//!
//! Output always goes to stderr. Forked workers inherit the subscriber
//! installed by the supervisor; re-executed workers call [`init`] again.

use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::ConfigError;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human readable
    Pretty,
    /// Single line per event
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(ConfigError::Parse {
                key: "PREFORK_LOG_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no filter directive is set
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Filter directive, overrides `level`
    pub filter: Option<String>,
    /// Show module target on each line
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for `-d`: debug level, pretty output.
    pub fn for_debug() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Pretty,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Apply `PREFORK_LOG*` overrides.
    ///
    /// An explicit filter set by the caller is kept.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PREFORK_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none() {
            if let Some(level) = std::env::var("PREFORK_LOG_LEVEL")
                .ok()
                .and_then(|s| parse_level(&s))
            {
                self.level = level;
            }
        }

        if let Some(format) = std::env::var("PREFORK_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.format = format;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        match self.filter {
            Some(ref directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| {
                eprintln!("Warning: invalid log filter '{}', using default", directive);
                fallback()
            }),
            None => fallback(),
        }
    }
}

/// Parse a level name.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed; later calls are no-ops.
pub fn init(config: LogConfig) -> bool {
    let filter = config.build_filter();

    let result = match config.format {
        LogFormat::Compact => {
            let layer = tfmt::layer()
                .compact()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        LogFormat::Pretty => {
            let layer = tfmt::layer()
                .pretty()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("json".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING"), Some(Level::WARN));
        assert_eq!(parse_level(" trace "), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_debug_preset() {
        let c = LogConfig::for_debug();
        assert_eq!(c.level, Level::DEBUG);
        assert_eq!(c.format, LogFormat::Pretty);
        assert!(c.filter.is_none());
    }

    #[test]
    fn test_explicit_filter_survives_env() {
        let c = LogConfig::new().with_filter("prefork_runtime=trace").with_env_overrides();
        assert_eq!(c.filter.as_deref(), Some("prefork_runtime=trace"));
    }

    #[test]
    fn test_init_idempotent() {
        init(LogConfig::new());
        assert!(!init(LogConfig::new()));
    }
}
