//! Channel-backed discoverer double for watcher and rewriter tests.
//!
//! Keeps the same referrer-set bookkeeping as the real discoverers so tests
//! can assert the subscription invariants, and lets a test play the registry
//! by pushing node lists through the output channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use arado_store::{Message, Node};

use crate::error::{DiscoveryError, Result};
use crate::service_ref::ServiceRef;
use crate::{Discoverer, OUTPUT_CHANNEL_DEPTH};

/// One observed contract call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Query { key: String, sref: ServiceRef },
    Update { key: String, old: ServiceRef, new: ServiceRef },
    Delete { key: String, sref: ServiceRef },
}

#[derive(Default)]
struct MockState {
    subscriptions: HashMap<ServiceRef, HashMap<String, Message>>,
    calls: Vec<MockCall>,
    nodes: Vec<Node>,
}

pub struct MockDiscoverer {
    state: Mutex<MockState>,
    fail_next_query: AtomicBool,
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl MockDiscoverer {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            fail_next_query: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Node list answered on the next queries.
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.state.lock().nodes = nodes;
    }

    /// Make the next `query` fail the way a broken registry would.
    pub fn fail_next_query(&self) {
        self.fail_next_query.store(true, Ordering::SeqCst);
    }

    /// Simulate a registry change: store the list and emit one message per
    /// referrer across every live subscription.
    pub async fn push_nodes(&self, nodes: Vec<Node>) {
        let (outgoing, tx) = {
            let mut state = self.state.lock();
            state.nodes = nodes.clone();
            let outgoing: Vec<Message> = state
                .subscriptions
                .values()
                .flat_map(|referrers| referrers.values().cloned())
                .collect();
            (outgoing, self.tx.lock().clone())
        };
        let Some(tx) = tx else { return };
        for mut msg in outgoing {
            msg.inject_nodes(&nodes);
            let _ = tx.send(msg).await;
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// The store version the subscription currently holds for a referrer.
    pub fn referrer_version(&self, sref: &ServiceRef, key: &str) -> Option<i64> {
        self.state
            .lock()
            .subscriptions
            .get(sref)?
            .get(key)
            .map(Message::version)
    }

    /// The keys currently referring to a subscription, sorted.
    pub fn referrers(&self, sref: &ServiceRef) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .subscriptions
            .get(sref)
            .map(|referrers| referrers.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn attach(&self, sref: &ServiceRef, msg: &Message) -> Vec<Node> {
        let mut state = self.state.lock();
        let nodes = state.nodes.clone();
        state
            .subscriptions
            .entry(sref.clone())
            .or_default()
            .insert(msg.key().to_string(), msg.clone());
        nodes
    }

    fn release(&self, key: &str, sref: &ServiceRef) {
        let mut state = self.state.lock();
        if let Some(referrers) = state.subscriptions.get_mut(sref) {
            referrers.remove(key);
            if referrers.is_empty() {
                state.subscriptions.remove(sref);
            }
        }
    }

    async fn emit(&self, mut msg: Message, nodes: &[Node]) {
        let Some(tx) = self.tx.lock().clone() else {
            return;
        };
        msg.inject_nodes(nodes);
        let _ = tx.send(msg).await;
    }
}

#[async_trait::async_trait]
impl Discoverer for MockDiscoverer {
    async fn query(&self, msg: &Message) -> Result<()> {
        let sref = ServiceRef::from_message(msg)
            .ok_or_else(|| DiscoveryError::MissingRef(msg.key().to_string()))?;
        self.state.lock().calls.push(MockCall::Query {
            key: msg.key().to_string(),
            sref: sref.clone(),
        });
        if self.fail_next_query.swap(false, Ordering::SeqCst) {
            return Err(DiscoveryError::Rejected("mock registry down".to_string()));
        }
        let nodes = self.attach(&sref, msg);
        self.emit(msg.clone(), &nodes).await;
        Ok(())
    }

    async fn update(&self, old: &Message, new: &Message) -> Result<()> {
        let old_ref = ServiceRef::from_message(old)
            .ok_or_else(|| DiscoveryError::MissingRef(old.key().to_string()))?;
        let new_ref = ServiceRef::from_message(new)
            .ok_or_else(|| DiscoveryError::MissingRef(new.key().to_string()))?;
        self.state.lock().calls.push(MockCall::Update {
            key: new.key().to_string(),
            old: old_ref.clone(),
            new: new_ref.clone(),
        });

        if old_ref == new_ref {
            let mut state = self.state.lock();
            if let Some(referrers) = state.subscriptions.get_mut(&new_ref) {
                referrers.insert(new.key().to_string(), new.clone());
            }
            return Ok(());
        }

        let nodes = self.attach(&new_ref, new);
        self.release(old.key(), &old_ref);
        self.emit(new.clone(), &nodes).await;
        Ok(())
    }

    async fn delete(&self, msg: &Message) -> Result<()> {
        let sref = ServiceRef::from_message(msg)
            .ok_or_else(|| DiscoveryError::MissingRef(msg.key().to_string()))?;
        self.state.lock().calls.push(MockCall::Delete {
            key: msg.key().to_string(),
            sref: sref.clone(),
        });
        self.release(msg.key(), &sref);
        Ok(())
    }

    fn watch(&self) -> Option<mpsc::Receiver<Message>> {
        self.rx.lock().take()
    }

    async fn stop(&self) {
        drop(self.tx.lock().take());
        self.state.lock().subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arado_store::ConfKind;

    fn message(key: &str, group: &str) -> Message {
        let value = format!(
            r#"{{"upstream":{{"discovery_type":"mock","service_name":"S","discovery_args":{{"group_name":"{group}"}}}}}}"#
        );
        Message::new(key, 1, ConfKind::Routes, value.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_query_registers_and_emits() {
        let mock = MockDiscoverer::new();
        mock.set_nodes(vec![Node::new("10.0.0.11", 8848, 10)]);
        let mut rx = mock.watch().unwrap();

        let msg = message("/apisix/routes/1", "A");
        mock.query(&msg).await.unwrap();

        assert_eq!(mock.subscription_count(), 1);
        let sref = ServiceRef::from_message(&msg).unwrap();
        assert_eq!(mock.referrers(&sref), vec!["/apisix/routes/1".to_string()]);

        let out = rx.recv().await.unwrap();
        let encoded: serde_json::Value = serde_json::from_slice(&out.encode().unwrap()).unwrap();
        assert_eq!(encoded["upstream"]["nodes"][0]["host"], "10.0.0.11");
    }

    #[tokio::test]
    async fn test_update_with_changed_args_moves_subscription() {
        let mock = MockDiscoverer::new();
        let _rx = mock.watch().unwrap();

        let old = message("/apisix/routes/1", "A");
        let new = message("/apisix/routes/1", "B");
        mock.query(&old).await.unwrap();
        mock.update(&old, &new).await.unwrap();

        assert_eq!(mock.subscription_count(), 1);
        let old_ref = ServiceRef::from_message(&old).unwrap();
        let new_ref = ServiceRef::from_message(&new).unwrap();
        assert!(mock.referrers(&old_ref).is_empty());
        assert_eq!(mock.referrers(&new_ref), vec!["/apisix/routes/1".to_string()]);
    }

    #[tokio::test]
    async fn test_push_nodes_reaches_every_referrer() {
        let mock = MockDiscoverer::new();
        let mut rx = mock.watch().unwrap();

        mock.query(&message("/apisix/routes/1", "A")).await.unwrap();
        mock.query(&message("/apisix/routes/2", "A")).await.unwrap();
        let _ = rx.recv().await;
        let _ = rx.recv().await;

        mock.push_nodes(vec![Node::new("10.0.0.12", 8848, 10)]).await;
        let mut keys = vec![
            rx.recv().await.unwrap().key().to_string(),
            rx.recv().await.unwrap().key().to_string(),
        ];
        keys.sort();
        assert_eq!(keys, vec!["/apisix/routes/1", "/apisix/routes/2"]);
    }
}
