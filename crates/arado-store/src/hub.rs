//! The per-endpoint store hub: one [`ConfStore`] per object kind, sharing a
//! backend, plus key parsing.

use std::sync::Arc;

use crate::backend::Backend;
use crate::object::ConfKind;
use crate::store::ConfStore;

/// All kind stores of one configuration endpoint. The hub is the typed handle
/// handed to the watcher and the rewriter; there are no process-global store
/// registries.
pub struct StoreHub {
    prefix: String,
    stores: Vec<Arc<ConfStore>>,
}

impl StoreHub {
    pub fn new(backend: Arc<dyn Backend>, prefix: &str) -> Self {
        let stores = ConfKind::ALL
            .iter()
            .map(|kind| Arc::new(ConfStore::new(*kind, prefix, backend.clone())))
            .collect();
        Self {
            prefix: prefix.to_string(),
            stores,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn stores(&self) -> &[Arc<ConfStore>] {
        &self.stores
    }

    pub fn get(&self, kind: ConfKind) -> &Arc<ConfStore> {
        self.stores
            .iter()
            .find(|store| store.kind() == kind)
            .expect("hub holds a store per kind")
    }

    /// Find the store responsible for a full key, if the key belongs to this
    /// hub's prefix.
    pub fn resolve(&self, key: &str) -> Option<&Arc<ConfStore>> {
        let (kind, _) = parse_key(key, &self.prefix)?;
        Some(self.get(kind))
    }

    /// Stop every running watch.
    pub fn close(&self) {
        for store in &self.stores {
            store.unwatch();
        }
    }
}

/// Split `<prefix>/<kind>/<id>` into kind and id. The id may itself contain
/// `/`. Returns `None` for keys outside the prefix or without a known kind.
pub fn parse_key<'a>(key: &'a str, prefix: &str) -> Option<(ConfKind, &'a str)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    let (segment, id) = rest.split_once('/')?;
    if id.is_empty() {
        return None;
    }
    Some((ConfKind::from_segment(segment)?, id))
}
