//! Error types shared across all tether crates.

use std::path::PathBuf;

/// Errors raised while loading or validating agent configuration.
///
/// These are the only startup errors that are allowed to stop the process;
/// everything past startup is recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config file {path} is {size} bytes, exceeding the {limit}-byte limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("configuration error: {0}")]
    Invalid(String),
}
