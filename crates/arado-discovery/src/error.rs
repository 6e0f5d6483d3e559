//! Discovery error types.

/// Error type for discoverer construction and registry operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("object at {0} carries no service reference")]
    MissingRef(String),

    #[error("no discoverer configured for kind '{0}'")]
    UnknownKind(String),

    #[error("settings for '{0}' do not match its discoverer kind")]
    SettingsMismatch(String),

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("zookeeper error: {0}")]
    Zookeeper(#[from] zookeeper_client::Error),

    #[error("registry rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected registry payload: {0}")]
    Payload(String),

    #[error("service '{0}' is not registered yet")]
    ServiceNotVisible(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
