//! Configuration error types.

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown discovery kind: {0}")]
    UnknownDiscovery(String),

    #[error("discovery section '{section}' invalid: {reason}")]
    InvalidDiscovery { section: String, reason: String },

    #[error("etcd section invalid: {0}")]
    InvalidEtcd(String),

    #[error("log section invalid: {0}")]
    InvalidLog(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
