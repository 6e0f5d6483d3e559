//! Service discovery integrations for the Arado reconciler.
//!
//! A [`Discoverer`] owns every live subscription of one registry kind. The
//! watcher drives it with `query`/`update`/`delete` calls keyed by
//! configuration object; the discoverer answers by publishing messages with
//! the current node list injected on its single output channel, which the
//! rewriter consumes.

mod error;
pub mod mock;
mod nacos;
mod service_ref;
mod zookeeper;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use arado_config::DiscoverySettings;
use arado_store::Message;

pub use error::{DiscoveryError, Result};
pub use nacos::NacosDiscoverer;
pub use service_ref::{ServiceArgs, ServiceRef};
pub use zookeeper::ZookeeperDiscoverer;

/// Depth of each discoverer's output channel. Senders tolerate a slow
/// rewriter up to this depth, then block; backpressure propagates into the
/// registry watch tasks.
pub const OUTPUT_CHANNEL_DEPTH: usize = 16;

/// One registry integration.
///
/// Every call is keyed by the referring configuration object. A subscription
/// exists exactly while its referrer set is non-empty, and a key belongs to
/// at most one subscription at a time; `update` keeps those invariants across
/// argument changes, and an identity change (type or name) never reaches
/// `update` because the watcher splits it into `delete` + `query`.
#[async_trait]
pub trait Discoverer: Send + Sync + 'static {
    /// Record that the object now depends on its reference, subscribe on
    /// first use, and publish the current node list for this referrer.
    async fn query(&self, msg: &Message) -> Result<()>;

    /// The object moved from `old`'s reference to `new`'s without changing
    /// identity. With equal references only the stored referrer is refreshed;
    /// otherwise the new subscription is established before the old one is
    /// released.
    async fn update(&self, old: &Message, new: &Message) -> Result<()>;

    /// Remove the object from its reference's referrer set, unsubscribing
    /// when the set becomes empty. The subscription record is destroyed, not
    /// parked; a later query builds a fresh one.
    async fn delete(&self, msg: &Message) -> Result<()>;

    /// Take the output channel. There is a single consumer; the channel can
    /// be taken once.
    fn watch(&self) -> Option<mpsc::Receiver<Message>>;

    /// Close the output channel, then tear down every live subscription.
    async fn stop(&self);
}

/// Constructor registry, assembled at startup. No package-level singletons:
/// the resulting [`DiscovererHub`] is owned by the reconciler.
pub struct DiscovererBuilders {
    builders: HashMap<String, BuildFn>,
}

type BuildFn = Box<dyn Fn(&DiscoverySettings) -> Result<Arc<dyn Discoverer>> + Send + Sync>;

impl DiscovererBuilders {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// The registry with every built-in kind.
    pub fn defaults() -> Self {
        let mut builders = Self::new();
        builders.register("nacos", |settings| match settings {
            DiscoverySettings::Nacos(nacos) => {
                Ok(Arc::new(NacosDiscoverer::new(nacos)?) as Arc<dyn Discoverer>)
            }
            _ => Err(DiscoveryError::SettingsMismatch("nacos".to_string())),
        });
        builders.register("zookeeper", |settings| match settings {
            DiscoverySettings::Zookeeper(zk) => {
                Ok(Arc::new(ZookeeperDiscoverer::new(zk)) as Arc<dyn Discoverer>)
            }
            _ => Err(DiscoveryError::SettingsMismatch("zookeeper".to_string())),
        });
        builders
    }

    pub fn register<F>(&mut self, kind: &str, build: F)
    where
        F: Fn(&DiscoverySettings) -> Result<Arc<dyn Discoverer>> + Send + Sync + 'static,
    {
        self.builders.insert(kind.to_string(), Box::new(build));
    }

    /// Build one discoverer per configured kind. An unknown kind is fatal.
    pub fn build_all(
        &self,
        settings: &BTreeMap<String, DiscoverySettings>,
    ) -> Result<DiscovererHub> {
        let mut hub = HashMap::new();
        for (kind, section) in settings {
            let builder = self
                .builders
                .get(kind)
                .ok_or_else(|| DiscoveryError::UnknownKind(kind.clone()))?;
            hub.insert(kind.clone(), builder(section)?);
        }
        Ok(DiscovererHub { inner: hub })
    }
}

impl Default for DiscovererBuilders {
    fn default() -> Self {
        Self::defaults()
    }
}

/// The typed handle from registry kind to its live discoverer.
pub struct DiscovererHub {
    inner: HashMap<String, Arc<dyn Discoverer>>,
}

impl std::fmt::Debug for DiscovererHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscovererHub")
            .field("kinds", &self.inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DiscovererHub {
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Discoverer>> {
        self.inner.get(kind).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Discoverer>)> {
        self.inner.iter().map(|(kind, d)| (kind.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Stop every discoverer, closing their output channels.
    pub async fn stop_all(&self) {
        for discoverer in self.inner.values() {
            discoverer.stop().await;
        }
    }
}

impl FromIterator<(String, Arc<dyn Discoverer>)> for DiscovererHub {
    fn from_iter<T: IntoIterator<Item = (String, Arc<dyn Discoverer>)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
