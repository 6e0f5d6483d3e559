//! The rewriter: one consumer task per discoverer output channel.
//!
//! Messages arrive with the node list already injected into the object the
//! discoverer received at query or update time, so all that is left is to
//! find the owning store, stamp the update time and issue the CAS write. A
//! conflict is not retried; the competing writer's change produces the watch
//! event that reconverges.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arado_discovery::DiscovererHub;
use arado_store::{Message, StoreHub};

use crate::error::{CoreError, Result};

pub struct Rewriter {
    inner: Arc<Inner>,
}

struct Inner {
    hubs: Vec<Arc<StoreHub>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Rewriter {
    pub fn new(hubs: Vec<Arc<StoreHub>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                hubs,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach one consumer per discoverer. Each task runs until the
    /// discoverer closes its channel on stop, or the rewriter is closed.
    pub fn init(&self, discoverers: &DiscovererHub) -> Result<()> {
        for (kind, discoverer) in discoverers.iter() {
            let Some(rx) = discoverer.watch() else {
                return Err(CoreError::OutputTaken(kind.to_string()));
            };
            let inner = self.inner.clone();
            let kind = kind.to_string();
            let handle = tokio::spawn(async move {
                inner.consume(&kind, rx).await;
            });
            self.inner.tasks.lock().push(handle);
        }
        Ok(())
    }

    /// Wait for the consumer tasks to drain. Called after the discoverers
    /// have been stopped so buffered updates are still written out.
    pub async fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("rewriter closed");
    }

    /// Abort without draining.
    pub fn abort(&self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn consume(&self, kind: &str, mut rx: mpsc::Receiver<Message>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(mut msg) => self.write(&mut msg).await,
                    None => {
                        info!("discoverer '{kind}' closed its channel");
                        break;
                    }
                }
            }
        }
    }

    async fn write(&self, msg: &mut Message) {
        let Some(store) = self.hubs.iter().find_map(|hub| hub.resolve(msg.key())) else {
            error!("key {} does not belong to any store prefix", msg.key());
            return;
        };
        if let Err(err) = store.write_nodes(msg).await {
            warn!("write back of {} failed: {err}", msg.key());
        }
    }
}
