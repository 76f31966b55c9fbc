//! Configuration errors.

use std::path::PathBuf;

use super::CredentialType;

/// Errors produced while loading, validating or watching configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid credential type: expected {expected}, got {actual}")]
    InvalidCredentialType {
        expected: CredentialType,
        actual: CredentialType,
    },

    #[error("config watcher error: {0}")]
    Watch(#[from] notify::Error),
}
