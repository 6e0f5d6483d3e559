//! Core error types.

/// Error type for watcher and rewriter setup. Steady-state errors never
/// surface here; single-event failures are logged and absorbed so one bad
/// object cannot stall reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] arado_store::StoreError),

    #[error("output channel of discoverer '{0}' was already taken")]
    OutputTaken(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
