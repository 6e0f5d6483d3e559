//! ZooKeeper discoverer.
//!
//! ZooKeeper has no push subscription, so every watched service runs a task
//! that re-arms a one-shot data watch after each event: a data change
//! refetches, a deletion publishes an empty node list and waits on an
//! existence watch for the node to come back. A root children watch keeps an
//! eye on the service prefix so services registered after a failed first
//! fetch are picked up without a new store event.
//!
//! The session is shared by every subscription and established lazily, so a
//! registry that is down at boot only fails the services that need it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zookeeper_client as zk;

use arado_config::ZookeeperSettings;
use arado_store::{Message, Node};

use crate::error::{DiscoveryError, Result};
use crate::service_ref::ServiceRef;
use crate::{Discoverer, OUTPUT_CHANNEL_DEPTH};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Service node payload as registered in ZooKeeper.
#[derive(Debug, Deserialize)]
struct ServicePayload {
    host: String,
    port: u16,
    #[serde(default)]
    weight: u32,
}

struct Subscription {
    nodes: Vec<Node>,
    referrers: HashMap<String, Message>,
    /// Set once the first node list has been observed; referrers attaching
    /// before that must not receive a spurious empty list.
    resolved: bool,
    cancel: CancellationToken,
}

struct Inner {
    cluster: String,
    prefix: String,
    default_weight: u32,
    session_timeout: Duration,
    client: OnceCell<zk::Client>,
    services: Mutex<HashMap<String, Subscription>>,
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    root_watch_started: AtomicBool,
    stop: CancellationToken,
}

pub struct ZookeeperDiscoverer {
    inner: Arc<Inner>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl ZookeeperDiscoverer {
    pub fn new(settings: &ZookeeperSettings) -> Self {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        Self {
            inner: Arc::new(Inner {
                cluster: settings.hosts.join(","),
                prefix: settings.prefix.clone(),
                default_weight: settings.weight,
                session_timeout: Duration::from_secs(settings.timeout),
                client: OnceCell::new(),
                services: Mutex::new(HashMap::new()),
                tx: Mutex::new(Some(tx)),
                root_watch_started: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait::async_trait]
impl Discoverer for ZookeeperDiscoverer {
    async fn query(&self, msg: &Message) -> Result<()> {
        let sref = ServiceRef::from_message(msg)
            .ok_or_else(|| DiscoveryError::MissingRef(msg.key().to_string()))?;
        let name = sref.service_name;
        let path = self.inner.service_path(&name);
        let client = self.inner.client().await?;

        // register the referrer; first one spawns the watch task
        let known_nodes = {
            let mut services = self.inner.services.lock();
            match services.get_mut(&name) {
                Some(sub) => {
                    sub.referrers.insert(msg.key().to_string(), msg.clone());
                    sub.resolved.then(|| sub.nodes.clone())
                }
                None => {
                    let cancel = self.inner.stop.child_token();
                    services.insert(
                        name.clone(),
                        Subscription {
                            nodes: Vec::new(),
                            referrers: HashMap::from([(msg.key().to_string(), msg.clone())]),
                            resolved: false,
                            cancel: cancel.clone(),
                        },
                    );
                    tokio::spawn(watch_service(
                        self.inner.clone(),
                        client.clone(),
                        name.clone(),
                        cancel,
                    ));
                    debug!("subscribed {}", path);
                    None
                }
            }
        };

        if let Some(nodes) = known_nodes {
            return self.inner.emit(msg.clone(), &nodes).await;
        }

        // initial fetch; a missing node keeps the subscription armed and
        // reports the state to the caller
        match client.get_data(&path).await {
            Ok((data, _stat)) => {
                self.inner.apply_payload(&name, &data).await;
                Ok(())
            }
            Err(zk::Error::NoNode) => Err(DiscoveryError::ServiceNotVisible(name)),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, _old: &Message, new: &Message) -> Result<()> {
        // references here carry no arguments, so only the stored referrer
        // (and with it the CAS version) can change
        let sref = ServiceRef::from_message(new)
            .ok_or_else(|| DiscoveryError::MissingRef(new.key().to_string()))?;
        let mut services = self.inner.services.lock();
        if let Some(sub) = services.get_mut(&sref.service_name) {
            sub.referrers.insert(new.key().to_string(), new.clone());
        }
        Ok(())
    }

    async fn delete(&self, msg: &Message) -> Result<()> {
        let sref = ServiceRef::from_message(msg)
            .ok_or_else(|| DiscoveryError::MissingRef(msg.key().to_string()))?;
        let removed = {
            let mut services = self.inner.services.lock();
            match services.get_mut(&sref.service_name) {
                Some(sub) => {
                    sub.referrers.remove(msg.key());
                    if sub.referrers.is_empty() {
                        services.remove(&sref.service_name)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(sub) = removed {
            sub.cancel.cancel();
            debug!("unsubscribed {}", self.inner.service_path(&sref.service_name));
        }
        Ok(())
    }

    fn watch(&self) -> Option<mpsc::Receiver<Message>> {
        self.rx.lock().take()
    }

    async fn stop(&self) {
        drop(self.inner.tx.lock().take());
        self.inner.stop.cancel();
        let services: Vec<(String, Subscription)> = self.inner.services.lock().drain().collect();
        for (name, sub) in services {
            sub.cancel.cancel();
            debug!("unsubscribed {}", self.inner.service_path(&name));
        }
    }
}

impl Inner {
    fn service_path(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Connect on first use, create the service root if it is missing and
    /// start the root children watch.
    async fn client(self: &Arc<Self>) -> Result<zk::Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let client = zk::Client::connector()
                    .session_timeout(self.session_timeout)
                    .connect(&self.cluster)
                    .await?;
                if let Err(err) = client
                    .create(
                        &self.prefix,
                        b"",
                        &zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all()),
                    )
                    .await
                {
                    if !matches!(err, zk::Error::NodeExists) {
                        return Err(DiscoveryError::from(err));
                    }
                }
                Ok::<_, DiscoveryError>(client)
            })
            .await?
            .clone();

        if !self.root_watch_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(watch_root(self.clone(), client.clone()));
        }
        Ok(client)
    }

    /// Parse a service payload and publish the resulting single-node list.
    async fn apply_payload(self: &Arc<Self>, name: &str, data: &[u8]) {
        let payload: ServicePayload = match serde_json::from_slice(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("service {} carries an unreadable payload: {err}", name);
                return;
            }
        };
        let mut weight = payload.weight;
        if weight == 0 {
            weight = self.default_weight;
        }
        self.apply_nodes(name, vec![Node::new(payload.host, payload.port, weight)])
            .await;
    }

    /// Store a new node list and emit one message per referrer when it
    /// differs from the last observed list.
    async fn apply_nodes(self: &Arc<Self>, name: &str, nodes: Vec<Node>) {
        let outgoing: Vec<Message> = {
            let mut services = self.services.lock();
            let Some(sub) = services.get_mut(name) else {
                return;
            };
            if sub.resolved && sub.nodes == nodes {
                return;
            }
            sub.resolved = true;
            sub.nodes = nodes.clone();
            sub.referrers.values().cloned().collect()
        };
        for msg in outgoing {
            let _ = self.emit(msg, &nodes).await;
        }
    }

    async fn emit(&self, mut msg: Message, nodes: &[Node]) -> Result<()> {
        let Some(tx) = self.tx.lock().clone() else {
            return Ok(());
        };
        msg.inject_nodes(nodes);
        let _ = tx.send(msg).await;
        Ok(())
    }
}

/// Watch one service path, re-arming a one-shot watch after every event.
async fn watch_service(inner: Arc<Inner>, client: zk::Client, name: String, cancel: CancellationToken) {
    let path = inner.service_path(&name);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match client.get_and_watch_data(&path).await {
            Ok((data, _stat, watcher)) => {
                inner.apply_payload(&name, &data).await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = watcher.changed() => {
                        if event.event_type == zk::EventType::NodeDeleted {
                            inner.apply_nodes(&name, Vec::new()).await;
                        }
                        // a data change falls through to the refetch above
                    }
                }
            }
            Err(zk::Error::NoNode) => match client.check_and_watch_stat(&path).await {
                Ok((Some(_stat), _watcher)) => continue,
                Ok((None, watcher)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = watcher.changed() => {}
                    }
                }
                Err(err) => {
                    warn!("arm existence watch on {path}: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            },
            Err(err) => {
                warn!("watch {path}: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}

/// Watch the service root's children so services appearing after a failed
/// first fetch get their pending subscriptions refreshed.
async fn watch_root(inner: Arc<Inner>, client: zk::Client) {
    let prefix = inner.prefix.clone();
    loop {
        if inner.stop.is_cancelled() {
            return;
        }
        match client.get_and_watch_children(&prefix).await {
            Ok((children, _stat, watcher)) => {
                // nudge unresolved subscriptions whose node is now visible
                let pending: Vec<String> = {
                    let services = inner.services.lock();
                    children
                        .into_iter()
                        .filter(|name| {
                            services.get(name).is_some_and(|sub| !sub.resolved)
                        })
                        .collect()
                };
                for name in pending {
                    let path = inner.service_path(&name);
                    match client.get_data(&path).await {
                        Ok((data, _stat)) => inner.apply_payload(&name, &data).await,
                        Err(err) => debug!("refresh {path}: {err}"),
                    }
                }

                tokio::select! {
                    _ = inner.stop.cancelled() => return,
                    event = watcher.changed() => {
                        debug!("service root event on {prefix}: {:?}", event.event_type);
                    }
                }
            }
            Err(err) => {
                warn!("watch service root {prefix}: {err}");
                tokio::select! {
                    _ = inner.stop.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}
