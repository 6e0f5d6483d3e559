//! Change messages: a decoded configuration object tied to its key and the
//! store revision used for the compare-and-swap write-back.

use crate::error::Result;
use crate::object::{ConfKind, ConfObject, DiscoveryArgs, Node};

/// A configuration object in flight between the store, the watcher, the
/// discoverers and the rewriter.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    key: String,
    version: i64,
    object: ConfObject,
}

impl Message {
    /// Decode a stored value into a message. Fails on malformed JSON; an
    /// undecodable value never invalidates existing state, so callers log and
    /// drop the event.
    pub fn new(key: impl Into<String>, version: i64, kind: ConfKind, bytes: &[u8]) -> Result<Self> {
        let key = key.into();
        let object = ConfObject::decode(kind, &key, bytes)?;
        Ok(Self {
            key,
            version,
            object,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store revision of the decoded value, used for the CAS write-back.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn kind(&self) -> ConfKind {
        self.object.kind()
    }

    pub fn object(&self) -> &ConfObject {
        &self.object
    }

    pub fn service_name(&self) -> Option<&str> {
        self.object.upstream.service_name()
    }

    pub fn discovery_type(&self) -> Option<&str> {
        self.object.upstream.discovery_type()
    }

    pub fn discovery_args(&self) -> Option<&DiscoveryArgs> {
        self.object.upstream.discovery_args.as_ref()
    }

    /// True when the object names a service to resolve.
    pub fn has_service_ref(&self) -> bool {
        self.object.upstream.has_service_ref()
    }

    pub fn has_nodes(&self) -> bool {
        self.object.upstream.has_nodes()
    }

    pub fn inject_nodes(&mut self, nodes: &[Node]) {
        self.object.inject_nodes(nodes);
    }

    /// Stamp `update_time` before a write-back.
    pub fn touch(&mut self) {
        self.object.touch();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.object.encode(&self.key)
    }
}

/// A typed change reported by a store watch.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Put(Message),
    Delete { key: String },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Put(msg) => msg.key(),
            StoreEvent::Delete { key } => key,
        }
    }
}
