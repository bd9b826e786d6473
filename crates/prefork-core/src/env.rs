//! Environment variable helpers
//!
//! Every runtime knob of the supervisor can be overridden from the
//! environment. The `env_get*` helpers parse a variable into the target
//! type and fall back to a default when it is unset or malformed;
//! [`parse_value`] and [`parse_bool`] are the strict forms used where a
//! malformed value must be reported.
//!
//! # Usage
//!
//! ```ignore
//! use prefork_core::env::{env_get, env_get_bool, env_get_list};
//!
//! let children: usize = env_get("PREFORK_NUM_CHILDREN", 4);
//! let serialize = env_get_bool("PREFORK_SERIALIZE_ACCEPT", true);
//! let exts = env_get_list("PREFORK_SCRIPT_EXTENSIONS", &["sh"]);
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Get environment variable parsed as type T, or return default
///
/// A value that fails to parse is treated like an unset variable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
///
/// Returns `Some(T)` only if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are
/// false (case-insensitive). Anything else, including unset, yields
/// the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|val| parse_bool(&val))
        .unwrap_or(default)
}

/// Get environment variable as a string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a comma-separated list, trimming entries and dropping empty ones
///
/// An unset variable, or one that contains no entries, yields `default`.
pub fn env_get_list(key: &str, default: &[&str]) -> Vec<String> {
    let parsed = std::env::var(key).map(|v| split_list(&v)).unwrap_or_default();
    if parsed.is_empty() {
        default.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}

/// Get a millisecond count as a `Duration`
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Parse a raw variable value strictly.
///
/// An absent value stays `None`. A value that does not parse is a
/// [`ConfigError::Parse`] naming `key`.
pub fn parse_value<T>(key: &'static str, raw: Option<&str>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
{
    match raw {
        None => Ok(None),
        Some(val) => val.trim().parse().map(Some).map_err(|_| ConfigError::Parse {
            key,
            value: val.to_string(),
        }),
    }
}

/// "1", "true", "yes", "on" / "0", "false", "no", "off", any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated value, trimming entries and dropping empty ones.
pub fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
