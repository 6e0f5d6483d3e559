//! The watcher: owner of the binding table.
//!
//! `init` performs the blocking catch-up (list, filter, query) before any
//! watch loop starts, so the first watch event cannot race a missing
//! subscription. `watch` then runs one event loop per kind store. Events for
//! one key are applied in store order; distinct keys fan out under a
//! semaphore sized to the CPU count plus headroom.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arado_discovery::{DiscovererHub, DiscoveryError, ServiceRef};
use arado_store::{ConfStore, Message, StoreEvent, StoreHub};

use crate::error::Result;

/// Headroom added to the CPU count when sizing the catch-up semaphore.
const SEMAPHORE_HEADROOM: usize = 10;

pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    hubs: Vec<Arc<StoreHub>>,
    discoverers: Arc<DiscovererHub>,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(hubs: Vec<Arc<StoreHub>>, discoverers: Arc<DiscovererHub>) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            inner: Arc::new(Inner {
                hubs,
                discoverers,
                sem: Arc::new(Semaphore::new(parallelism + SEMAPHORE_HEADROOM)),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Catch-up: list every store, register each object carrying a service
    /// reference, and issue the initial queries. Blocks until every listed
    /// object has been handled. A failing list is fatal; the caller decides
    /// whether to retry or exit.
    pub async fn init(&self) -> Result<()> {
        for hub in &self.inner.hubs {
            for store in hub.stores() {
                let messages = store.list(Message::has_service_ref).await?;
                debug!(
                    "catch-up on {}: {} objects to resolve",
                    store.base_path(),
                    messages.len()
                );

                let mut join = JoinSet::new();
                for msg in messages {
                    let permit = self
                        .inner
                        .sem
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    let inner = self.inner.clone();
                    let store = store.clone();
                    join.spawn(async move {
                        let _permit = permit;
                        inner.run_query(&store, &msg).await;
                    });
                }
                while join.join_next().await.is_some() {}
            }
        }
        Ok(())
    }

    /// Start one event loop per kind store.
    pub async fn watch(&self) -> Result<()> {
        for hub in &self.inner.hubs {
            for store in hub.stores() {
                let rx = store.watch().await?;
                let inner = self.inner.clone();
                let store = store.clone();
                let handle = tokio::spawn(async move {
                    inner.event_loop(store, rx).await;
                });
                self.inner.tasks.lock().push(handle);
            }
        }
        Ok(())
    }

    /// Cancel the event loops, stop the store watches and wait for the loops
    /// to drain.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        for hub in &self.inner.hubs {
            hub.close();
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("watcher closed");
    }
}

impl Inner {
    async fn event_loop(
        self: &Arc<Self>,
        store: Arc<ConfStore>,
        mut rx: tokio::sync::mpsc::Receiver<Vec<StoreEvent>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(events) => self.dispatch_batch(&store, events).await,
                    None => {
                        info!("watch on {} ended", store.base_path());
                        break;
                    }
                }
            }
        }
    }

    /// Apply a batch: events for one key stay in order, distinct keys run
    /// concurrently under the semaphore. The batch is fully applied before
    /// the next one starts, preserving store order per key across batches.
    async fn dispatch_batch(self: &Arc<Self>, store: &Arc<ConfStore>, events: Vec<StoreEvent>) {
        let mut order: Vec<String> = Vec::new();
        let mut by_key: HashMap<String, Vec<StoreEvent>> = HashMap::new();
        for event in events {
            match by_key.entry(event.key().to_string()) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().push(event);
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    order.push(entry.key().clone());
                    entry.insert(vec![event]);
                }
            }
        }

        let mut join = JoinSet::new();
        for key in order {
            let events = by_key.remove(&key).unwrap();
            let permit = self
                .sem
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let inner = self.clone();
            let store = store.clone();
            join.spawn(async move {
                let _permit = permit;
                for event in events {
                    match event {
                        StoreEvent::Put(msg) => inner.handle_put(&store, msg).await,
                        StoreEvent::Delete { key } => inner.handle_delete(&store, &key).await,
                    }
                }
            });
        }
        while join.join_next().await.is_some() {}
    }

    /// The dispatch table. `old` is the cached binding, `new_ref` the
    /// reference the incoming object carries (references to unconfigured
    /// registries count as none).
    async fn handle_put(&self, store: &Arc<ConfStore>, msg: Message) {
        let new_ref = self.known_ref(&msg);
        let old = store.get_cached(msg.key());

        match (old, new_ref) {
            // unbound object without a reference: nothing to do
            (None, None) => {}

            (None, Some(_)) => {
                store.insert(msg.clone());
                self.run_query(store, &msg).await;
            }

            // the object no longer needs resolution, whether or not it now
            // carries literal nodes; drop the binding
            (Some(old), None) => {
                store.remove(msg.key());
                self.run_delete(&old).await;
            }

            (Some(old), Some(new_ref)) => {
                let old_ref = self.known_ref(&old);
                match old_ref {
                    Some(old_ref) if old_ref.same_identity(&new_ref) => {
                        store.insert(msg.clone());
                        self.run_update(&old, &msg, &new_ref).await;
                    }
                    Some(_) => {
                        // identity changed: delete-then-query
                        store.insert(msg.clone());
                        self.run_delete(&old).await;
                        self.run_query(store, &msg).await;
                    }
                    None => {
                        store.insert(msg.clone());
                        self.run_query(store, &msg).await;
                    }
                }
            }
        }
    }

    async fn handle_delete(&self, store: &Arc<ConfStore>, key: &str) {
        if let Some(old) = store.remove(key) {
            self.run_delete(&old).await;
        }
    }

    /// The reference an object carries, if its registry kind is configured.
    /// An unknown kind is reported once per event and treated as no
    /// reference, so such objects are never bound.
    fn known_ref(&self, msg: &Message) -> Option<ServiceRef> {
        let sref = ServiceRef::from_message(msg)?;
        if self.discoverers.get(&sref.discovery_type).is_none() {
            warn!(
                "object {} references unconfigured discovery type '{}'",
                msg.key(),
                sref.discovery_type
            );
            return None;
        }
        Some(sref)
    }

    async fn run_query(&self, store: &Arc<ConfStore>, msg: &Message) {
        let Some(sref) = self.known_ref(msg) else {
            store.remove(msg.key());
            return;
        };
        let Some(discoverer) = self.discoverers.get(&sref.discovery_type) else {
            store.remove(msg.key());
            return;
        };
        match discoverer.query(msg).await {
            Ok(()) => {}
            Err(DiscoveryError::ServiceNotVisible(name)) => {
                // the registry-side watch keeps looking; the binding stays
                warn!("service '{name}' for {} is not registered yet", msg.key());
            }
            Err(err) => {
                error!("query for {} failed: {err}", msg.key());
                store.remove(msg.key());
            }
        }
    }

    async fn run_update(&self, old: &Message, new: &Message, sref: &ServiceRef) {
        let Some(discoverer) = self.discoverers.get(&sref.discovery_type) else {
            return;
        };
        if let Err(err) = discoverer.update(old, new).await {
            error!("update for {} failed: {err}", new.key());
        }
    }

    async fn run_delete(&self, old: &Message) {
        let Some(sref) = ServiceRef::from_message(old) else {
            return;
        };
        let Some(discoverer) = self.discoverers.get(&sref.discovery_type) else {
            return;
        };
        if let Err(err) = discoverer.delete(old).await {
            error!("delete for {} failed: {err}", old.key());
        }
    }
}
