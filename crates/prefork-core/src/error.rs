//! Error types shared by every prefork crate

use thiserror::Error;

/// Configuration errors. Always fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is outside its accepted range
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),

    /// A value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: &'static str, value: String },
}

/// Exit-report frame decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than one frame
    #[error("truncated report frame: {0} bytes")]
    Truncated(usize),

    /// Frame does not start with the report magic
    #[error("bad report magic: {0:#06x}")]
    BadMagic(u16),

    /// Frame written by an incompatible worker image
    #[error("unsupported report version {0}")]
    UnsupportedVersion(u8),
}
