//! The raw key/value surface a configuration store must provide.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One raw entry from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Per-key monotonic revision used for compare-and-swap writes.
    pub version: i64,
}

/// One raw change reported by a watch.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Put(KeyValue),
    Delete { key: String },
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// The key moved past the expected revision; the competing writer's own
    /// change will re-drive reconciliation.
    Conflict,
}

/// Raw store access. Implementations translate their client's events into
/// [`RawEvent`]s; sentinel filtering and decoding happen a layer up.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// One-shot snapshot of every key under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Write `value` only if the key is still at `expected_version`.
    async fn put_cas(&self, key: &str, value: Vec<u8>, expected_version: i64)
    -> Result<PutOutcome>;

    /// Stream batches of raw changes under `prefix` until `cancel` fires or
    /// the underlying watch ends. The stream is not re-established here; a
    /// terminated watch surfaces as end-of-stream.
    async fn watch(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<RawEvent>>>;
}
