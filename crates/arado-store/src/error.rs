//! Store error types.

/// Error type for store and codec operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key '{0}' does not belong to any configured kind")]
    UnknownKind(String),

    #[error("decode {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode {key}: document is not a JSON object")]
    NotAnObject { key: String },

    #[error("encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("watch on '{0}' is already running")]
    AlreadyWatching(String),

    #[error("store closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;
