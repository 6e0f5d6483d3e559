//! In-memory backend with etcd-like revision semantics, used by tests in
//! place of a live cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyValue, PutOutcome, RawEvent};
use crate::error::Result;

#[derive(Default)]
struct State {
    entries: BTreeMap<String, (Vec<u8>, i64)>,
    revision: i64,
}

/// A store backend living entirely in process memory. Writes bump a global
/// revision counter the way etcd's `mod_revision` does, so CAS behavior is
/// observable in tests.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    watchers: Mutex<Vec<(String, mpsc::Sender<Vec<RawEvent>>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional write, as an external writer would issue.
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> i64 {
        let value = value.into();
        let version = {
            let mut state = self.state.lock();
            state.revision += 1;
            let version = state.revision;
            state.entries.insert(key.to_string(), (value.clone(), version));
            version
        };
        self.notify(RawEvent::Put(KeyValue {
            key: key.to_string(),
            value,
            version,
        }))
        .await;
        version
    }

    /// Unconditional delete, as an external writer would issue.
    pub async fn delete(&self, key: &str) {
        let removed = {
            let mut state = self.state.lock();
            state.revision += 1;
            state.entries.remove(key).is_some()
        };
        if removed {
            self.notify(RawEvent::Delete {
                key: key.to_string(),
            })
            .await;
        }
    }

    /// Current value and revision of a key.
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, i64)> {
        self.state.lock().entries.get(key).cloned()
    }

    async fn notify(&self, event: RawEvent) {
        let targets: Vec<mpsc::Sender<Vec<RawEvent>>> = {
            let watchers = self.watchers.lock();
            watchers
                .iter()
                .filter(|(prefix, _)| event_key(&event).starts_with(prefix.as_str()))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(vec![event.clone()]).await;
        }
        self.watchers.lock().retain(|(_, tx)| !tx.is_closed());
    }
}

fn event_key(event: &RawEvent) -> &str {
    match event {
        RawEvent::Put(kv) => &kv.key,
        RawEvent::Delete { key } => key,
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, version))| KeyValue {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }

    async fn put_cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: i64,
    ) -> Result<PutOutcome> {
        let outcome = {
            let mut state = self.state.lock();
            let current = state.entries.get(key).map(|(_, version)| *version);
            if current != Some(expected_version) {
                return Ok(PutOutcome::Conflict);
            }
            state.revision += 1;
            let version = state.revision;
            state.entries.insert(key.to_string(), (value.clone(), version));
            version
        };
        self.notify(RawEvent::Put(KeyValue {
            key: key.to_string(),
            value,
            version: outcome,
        }))
        .await;
        Ok(PutOutcome::Written)
    }

    async fn watch(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<RawEvent>>> {
        let (tx, rx) = mpsc::channel(64);
        self.watchers.lock().push((prefix.to_string(), tx.clone()));
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(tx);
        });
        Ok(rx)
    }
}
