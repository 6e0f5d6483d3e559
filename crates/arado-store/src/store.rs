//! Per-kind configuration store: typed list/watch over one key prefix plus
//! the binding cache the watcher dispatches against.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::INIT_DIR;
use crate::backend::{Backend, PutOutcome, RawEvent};
use crate::error::{Result, StoreError};
use crate::message::{Message, StoreEvent};
use crate::object::ConfKind;

const EVENT_CHANNEL_DEPTH: usize = 16;

/// Typed access to one kind's keyspace (`<prefix>/<kind>/…`).
///
/// The store decodes raw values, skips directory placeholders, and keeps the
/// cache of currently bound objects. Events for one key are delivered in
/// store order; the cache is a concurrent map because the watcher serializes
/// writers per key.
pub struct ConfStore {
    kind: ConfKind,
    base_path: String,
    backend: Arc<dyn Backend>,
    cache: DashMap<String, Message>,
    watch_cancel: Mutex<Option<CancellationToken>>,
}

impl ConfStore {
    pub fn new(kind: ConfKind, prefix: &str, backend: Arc<dyn Backend>) -> Self {
        Self {
            kind,
            base_path: format!("{}/{}", prefix, kind.segment()),
            backend,
            cache: DashMap::new(),
            watch_cancel: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ConfKind {
        self.kind
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Snapshot the keyspace, decode each entry, keep those passing `filter`
    /// and register them in the cache. Transient backend errors fail the call;
    /// individually undecodable values are logged and skipped.
    pub async fn list<F>(&self, filter: F) -> Result<Vec<Message>>
    where
        F: Fn(&Message) -> bool,
    {
        let entries = self.backend.list(&self.base_path).await?;

        let mut messages = Vec::new();
        for kv in entries {
            if kv.value == INIT_DIR {
                continue;
            }
            let msg = match Message::new(&kv.key, kv.version, self.kind, &kv.value) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("list {}: {err}", kv.key);
                    continue;
                }
            };
            if filter(&msg) {
                self.cache.insert(msg.key().to_string(), msg.clone());
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// Start watching this kind's prefix, translating raw changes into typed
    /// events. Decode failures are logged and dropped without touching the
    /// cache. The stream ends when [`ConfStore::unwatch`] is called or the
    /// backend watch terminates.
    pub async fn watch(&self) -> Result<mpsc::Receiver<Vec<StoreEvent>>> {
        let cancel = CancellationToken::new();
        {
            let mut guard = self.watch_cancel.lock();
            if guard.is_some() {
                return Err(StoreError::AlreadyWatching(self.base_path.clone()));
            }
            *guard = Some(cancel.clone());
        }

        let mut raw_rx = self.backend.watch(&self.base_path, cancel).await?;
        let kind = self.kind;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        tokio::spawn(async move {
            while let Some(raw_events) = raw_rx.recv().await {
                let mut events = Vec::with_capacity(raw_events.len());
                for raw in raw_events {
                    match raw {
                        RawEvent::Put(kv) => {
                            if kv.value == INIT_DIR {
                                continue;
                            }
                            match Message::new(&kv.key, kv.version, kind, &kv.value) {
                                Ok(msg) => events.push(StoreEvent::Put(msg)),
                                Err(err) => warn!("watch {}: {err}", kv.key),
                            }
                        }
                        RawEvent::Delete { key } => events.push(StoreEvent::Delete { key }),
                    }
                }
                if !events.is_empty() && tx.send(events).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Stop the running watch, if any.
    pub fn unwatch(&self) {
        if let Some(cancel) = self.watch_cancel.lock().take() {
            cancel.cancel();
        }
    }

    /// Write resolved nodes back: stamp the update time, re-encode and put
    /// with compare-and-swap on the version the message was decoded at. A
    /// conflict means a concurrent writer moved the key; its own change will
    /// re-drive reconciliation, so the conflict is logged and swallowed.
    pub async fn write_nodes(&self, msg: &mut Message) -> Result<()> {
        msg.touch();
        let bytes = msg.encode()?;
        match self
            .backend
            .put_cas(msg.key(), bytes, msg.version())
            .await?
        {
            PutOutcome::Written => {
                debug!("updated nodes at {}", msg.key());
            }
            PutOutcome::Conflict => {
                info!(
                    "write to {} superseded by a concurrent revision, skipping",
                    msg.key()
                );
            }
        }
        Ok(())
    }

    /// Register the latest bound object for a key, returning the previous one.
    pub fn insert(&self, msg: Message) -> Option<Message> {
        self.cache.insert(msg.key().to_string(), msg)
    }

    pub fn get_cached(&self, key: &str) -> Option<Message> {
        self.cache.get(key).map(|entry| entry.clone())
    }

    /// Drop a key's binding, returning the object it was bound with.
    pub fn remove(&self, key: &str) -> Option<Message> {
        self.cache.remove(key).map(|(_, msg)| msg)
    }
}
