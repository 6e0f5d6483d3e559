//! Nacos discoverer over the HTTP open API.
//!
//! One pooled HTTP client serves every subscription. Each subscription runs a
//! watch task that polls the instance list and, on change, takes the cache
//! mutex, stores the new node list and emits one message per referrer; that
//! task is the translated form of the SDK's push callback, so all downstream
//! effects flow through the single output channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arado_config::NacosSettings;
use arado_store::{Message, Node};

use crate::error::{DiscoveryError, Result};
use crate::service_ref::ServiceRef;
use crate::{Discoverer, OUTPUT_CHANNEL_DEPTH};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tracks one service reference and the keys depending on it.
struct Subscription {
    nodes: Vec<Node>,
    referrers: HashMap<String, Message>,
    cancel: CancellationToken,
}

struct Inner {
    default_weight: u32,
    poll_interval: Duration,
    client: NacosClient,
    cache: Mutex<HashMap<ServiceRef, Subscription>>,
    tx: Mutex<Option<mpsc::Sender<Message>>>,
}

pub struct NacosDiscoverer {
    inner: Arc<Inner>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl NacosDiscoverer {
    pub fn new(settings: &NacosSettings) -> Result<Self> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        Ok(Self {
            inner: Arc::new(Inner {
                default_weight: settings.weight,
                poll_interval: POLL_INTERVAL,
                client: NacosClient::new(settings)?,
                cache: Mutex::new(HashMap::new()),
                tx: Mutex::new(Some(tx)),
            }),
            rx: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait::async_trait]
impl Discoverer for NacosDiscoverer {
    async fn query(&self, msg: &Message) -> Result<()> {
        let sref = ServiceRef::from_message(msg)
            .ok_or_else(|| DiscoveryError::MissingRef(msg.key().to_string()))?;
        self.inner.attach(&sref, msg).await
    }

    async fn update(&self, old: &Message, new: &Message) -> Result<()> {
        let old_ref = ServiceRef::from_message(old)
            .ok_or_else(|| DiscoveryError::MissingRef(old.key().to_string()))?;
        let new_ref = ServiceRef::from_message(new)
            .ok_or_else(|| DiscoveryError::MissingRef(new.key().to_string()))?;

        if old_ref == new_ref {
            // only the stored object (and with it the CAS version) changed
            let mut cache = self.inner.cache.lock();
            if let Some(sub) = cache.get_mut(&new_ref) {
                sub.referrers.insert(new.key().to_string(), new.clone());
            }
            return Ok(());
        }

        // arguments changed: subscribe the new reference before releasing the
        // old one. Both share the service name, and a backend that keys its
        // callbacks by name must never observe the service unwatched between
        // the two steps; the reverse order is only safe when the identity
        // changes, which the watcher routes through delete-then-query instead.
        self.inner.attach(&new_ref, new).await?;
        self.inner.release(old.key(), &old_ref);
        Ok(())
    }

    async fn delete(&self, msg: &Message) -> Result<()> {
        let sref = ServiceRef::from_message(msg)
            .ok_or_else(|| DiscoveryError::MissingRef(msg.key().to_string()))?;
        self.inner.release(msg.key(), &sref);
        Ok(())
    }

    fn watch(&self) -> Option<mpsc::Receiver<Message>> {
        self.rx.lock().take()
    }

    async fn stop(&self) {
        drop(self.inner.tx.lock().take());
        let subscriptions: Vec<(ServiceRef, Subscription)> =
            self.inner.cache.lock().drain().collect();
        for (sref, sub) in subscriptions {
            sub.cancel.cancel();
            debug!("unsubscribed {sref}");
        }
    }
}

impl Inner {
    /// Add `msg` as a referrer of `sref`, subscribing on first use, and
    /// publish the current node list for this referrer.
    async fn attach(self: &Arc<Self>, sref: &ServiceRef, msg: &Message) -> Result<()> {
        let key = msg.key().to_string();

        // fast path: the subscription already exists
        let existing = {
            let mut cache = self.cache.lock();
            cache.get_mut(sref).map(|sub| {
                sub.referrers.insert(key.clone(), msg.clone());
                sub.nodes.clone()
            })
        };
        if let Some(nodes) = existing {
            return self.emit(msg.clone(), &nodes).await;
        }

        // first referrer: fetch outside the lock, then insert
        let instances = self.client.instances(sref).await?;
        let nodes = self.to_nodes(instances, sref);

        let nodes = {
            let mut cache = self.cache.lock();
            match cache.entry(sref.clone()) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    // a concurrent query won the race; join its subscription
                    let sub = entry.get_mut();
                    sub.referrers.insert(key, msg.clone());
                    sub.nodes.clone()
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let cancel = CancellationToken::new();
                    let tx = self.tx.lock().clone();
                    entry.insert(Subscription {
                        nodes: nodes.clone(),
                        referrers: HashMap::from([(key, msg.clone())]),
                        cancel: cancel.clone(),
                    });
                    if let Some(tx) = tx {
                        tokio::spawn(watch_service(
                            self.clone(),
                            sref.clone(),
                            cancel,
                            tx,
                        ));
                    }
                    debug!("subscribed {sref}");
                    nodes
                }
            }
        };

        self.emit(msg.clone(), &nodes).await
    }

    /// Remove the key from `sref`'s referrer set; the last referrer out tears
    /// the subscription down.
    fn release(&self, key: &str, sref: &ServiceRef) {
        let removed = {
            let mut cache = self.cache.lock();
            match cache.get_mut(sref) {
                Some(sub) => {
                    sub.referrers.remove(key);
                    if sub.referrers.is_empty() {
                        cache.remove(sref)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(sub) = removed {
            sub.cancel.cancel();
            debug!("unsubscribed {sref}");
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

    /// Instance list to node list: only enabled, healthy instances whose
    /// metadata contains every requested pair; zero weights get the
    /// configured default. Sorted so list comparison is order-insensitive.
    fn to_nodes(&self, instances: Vec<NacosInstance>, sref: &ServiceRef) -> Vec<Node> {
        let wanted = &sref.args.metadata;
        let mut nodes: Vec<Node> = instances
            .into_iter()
            .filter(|inst| inst.enabled && inst.healthy)
            .filter(|inst| {
                wanted
                    .iter()
                    .all(|(k, v)| inst.metadata.get(k) == Some(v))
            })
            .map(|inst| {
                let mut weight = inst.weight.round() as u32;
                if weight == 0 {
                    weight = self.default_weight;
                }
                Node::new(inst.ip, inst.port, weight)
            })
            .collect();
        nodes.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        nodes
    }
}

/// The steady-state update path: poll the instance list and fan changed node
/// lists out to every referrer.
async fn watch_service(
    inner: Arc<Inner>,
    sref: ServiceRef,
    cancel: CancellationToken,
    tx: mpsc::Sender<Message>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.poll_interval) => {}
        }

        let instances = match inner.client.instances(&sref).await {
            Ok(instances) => instances,
            Err(err) => {
                warn!("poll {sref}: {err}");
                continue;
            }
        };
        let nodes = inner.to_nodes(instances, &sref);

        let outgoing: Vec<Message> = {
            let mut cache = inner.cache.lock();
            let Some(sub) = cache.get_mut(&sref) else {
                return;
            };
            if sub.nodes == nodes {
                continue;
            }
            sub.nodes = nodes.clone();
            sub.referrers.values().cloned().collect()
        };

        for mut msg in outgoing {
            msg.inject_nodes(&nodes);
            if tx.send(msg).await.is_err() {
                return;
            }
        }
    }
}

/// Thin client for the Nacos HTTP open API with login-token auth and
/// round-robin failover across the configured hosts.
struct NacosClient {
    http: reqwest::Client,
    bases: Vec<String>,
    current: AtomicUsize,
    credentials: Option<(String, String)>,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<NacosInstance>,
}

#[derive(Debug, Deserialize)]
struct NacosInstance {
    ip: String,
    port: u16,
    #[serde(default)]
    weight: f64,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    metadata: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    token_ttl: u64,
}

fn default_true() -> bool {
    true
}

impl NacosClient {
    fn new(settings: &NacosSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.timeout.connect))
            .timeout(Duration::from_millis(
                settings.timeout.send + settings.timeout.read,
            ))
            .build()?;

        let bases = settings
            .host
            .iter()
            .map(|host| format!("{}{}", host.trim_end_matches('/'), settings.prefix))
            .collect();

        let credentials = match (&settings.user, &settings.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            http,
            bases,
            current: AtomicUsize::new(0),
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Fetch the instance list of a service, trying each host once.
    async fn instances(&self, sref: &ServiceRef) -> Result<Vec<NacosInstance>> {
        let token = self.ensure_token().await?;

        let mut query: Vec<(&str, String)> =
            vec![("serviceName", sref.service_name.clone())];
        if !sref.args.group_name.is_empty() {
            query.push(("groupName", sref.args.group_name.clone()));
        }
        if !sref.args.namespace_id.is_empty() {
            query.push(("namespaceId", sref.args.namespace_id.clone()));
        }
        if let Some(token) = &token {
            query.push(("accessToken", token.clone()));
        }

        let start = self.current.load(Ordering::Relaxed);
        let mut last_err: Option<DiscoveryError> = None;
        for offset in 0..self.bases.len() {
            let index = (start + offset) % self.bases.len();
            let url = format!("{}/v1/ns/instance/list", self.bases[index]);
            match self.http.get(&url).query(&query).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.current.store(index, Ordering::Relaxed);
                    let list: InstanceList = resp
                        .json()
                        .await
                        .map_err(|err| DiscoveryError::Payload(err.to_string()))?;
                    return Ok(list.hosts);
                }
                Ok(resp) => {
                    last_err = Some(DiscoveryError::Rejected(format!(
                        "{} returned {}",
                        url,
                        resp.status()
                    )));
                }
                Err(err) => {
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            DiscoveryError::Rejected("no nacos host configured".to_string())
        }))
    }

    /// Log in when credentials are configured, reusing the token until it
    /// nears its TTL.
    async fn ensure_token(&self) -> Result<Option<String>> {
        let Some((user, password)) = &self.credentials else {
            return Ok(None);
        };

        if let Some(token) = self.token.lock().clone() {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.value));
            }
        }

        let form = [("username", user.as_str()), ("password", password.as_str())];
        let mut last_err: Option<DiscoveryError> = None;
        for base in &self.bases {
            let url = format!("{base}/v1/auth/login");
            match self.http.post(&url).form(&form).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let login: LoginResponse = resp
                        .json()
                        .await
                        .map_err(|err| DiscoveryError::Payload(err.to_string()))?;
                    // refresh slightly early so in-flight requests never
                    // carry an expired token
                    let ttl = login.token_ttl.max(60);
                    let token = AccessToken {
                        value: login.access_token,
                        expires_at: Instant::now() + Duration::from_secs(ttl - ttl / 10),
                    };
                    *self.token.lock() = Some(token.clone());
                    return Ok(Some(token.value));
                }
                Ok(resp) => {
                    last_err = Some(DiscoveryError::Rejected(format!(
                        "login at {} returned {}",
                        url,
                        resp.status()
                    )));
                }
                Err(err) => last_err = Some(err.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            DiscoveryError::Rejected("no nacos host configured".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arado_store::ConfKind;

    fn discoverer() -> NacosDiscoverer {
        let settings: NacosSettings = serde_yaml::from_str(
            r#"
host: ["http://127.0.0.1:8848"]
weight: 100
"#,
        )
        .unwrap();
        NacosDiscoverer::new(&settings).unwrap()
    }

    fn sref(group: &str) -> ServiceRef {
        let value = format!(
            r#"{{"upstream":{{"discovery_type":"nacos","service_name":"S","discovery_args":{{"group_name":"{group}"}}}}}}"#
        );
        let msg = Message::new("/apisix/routes/1", 1, ConfKind::Routes, value.as_bytes()).unwrap();
        ServiceRef::from_message(&msg).unwrap()
    }

    fn instance(ip: &str, weight: f64, healthy: bool) -> NacosInstance {
        NacosInstance {
            ip: ip.to_string(),
            port: 8848,
            weight,
            healthy,
            enabled: true,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_to_nodes_filters_and_defaults() {
        let d = discoverer();
        let nodes = d.inner.to_nodes(
            vec![
                instance("10.0.0.11", 10.0, true),
                instance("10.0.0.12", 0.0, true),
                instance("10.0.0.13", 5.0, false),
            ],
            &sref("DEFAULT_GROUP"),
        );
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], Node::new("10.0.0.11", 8848, 10));
        // zero weight replaced by the configured default
        assert_eq!(nodes[1], Node::new("10.0.0.12", 8848, 100));
    }

    #[test]
    fn test_to_nodes_metadata_selection() {
        let d = discoverer();
        let value = r#"{"upstream":{"discovery_type":"nacos","service_name":"S","discovery_args":{"metadata":{"idc":"shanghai"}}}}"#;
        let msg = Message::new("/apisix/routes/1", 1, ConfKind::Routes, value.as_bytes()).unwrap();
        let sref = ServiceRef::from_message(&msg).unwrap();

        let mut matching = instance("10.0.0.11", 1.0, true);
        matching
            .metadata
            .insert("idc".to_string(), "shanghai".to_string());
        let other = instance("10.0.0.12", 1.0, true);

        let nodes = d.inner.to_nodes(vec![matching, other], &sref);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].host, "10.0.0.11");
    }

    #[tokio::test]
    async fn test_update_with_equal_refs_refreshes_referrer() {
        let d = discoverer();
        let sref = sref("A");
        // seed a subscription without touching the network
        d.inner.cache.lock().insert(
            sref.clone(),
            Subscription {
                nodes: vec![Node::new("10.0.0.11", 8848, 10)],
                referrers: HashMap::new(),
                cancel: CancellationToken::new(),
            },
        );

        let value = r#"{"upstream":{"discovery_type":"nacos","service_name":"S","discovery_args":{"group_name":"A"}}}"#;
        let old = Message::new("/apisix/routes/1", 1, ConfKind::Routes, value.as_bytes()).unwrap();
        let new = Message::new("/apisix/routes/1", 9, ConfKind::Routes, value.as_bytes()).unwrap();
        d.update(&old, &new).await.unwrap();

        let cache = d.inner.cache.lock();
        let sub = cache.get(&sref).unwrap();
        assert_eq!(sub.referrers.get("/apisix/routes/1").unwrap().version(), 9);
    }

    #[tokio::test]
    async fn test_delete_tears_down_last_referrer() {
        let d = discoverer();
        let sref = sref("A");
        let value = r#"{"upstream":{"discovery_type":"nacos","service_name":"S","discovery_args":{"group_name":"A"}}}"#;
        let msg = Message::new("/apisix/routes/1", 1, ConfKind::Routes, value.as_bytes()).unwrap();

        let cancel = CancellationToken::new();
        d.inner.cache.lock().insert(
            sref.clone(),
            Subscription {
                nodes: Vec::new(),
                referrers: HashMap::from([(msg.key().to_string(), msg.clone())]),
                cancel: cancel.clone(),
            },
        );

        d.delete(&msg).await.unwrap();
        assert!(d.inner.cache.lock().is_empty());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_closes_output() {
        let d = discoverer();
        let mut rx = d.watch().unwrap();
        d.stop().await;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_client_base_urls() {
        let settings: NacosSettings = serde_yaml::from_str(
            r#"
host:
  - "http://127.0.0.1:8848/"
  - "https://nacos.example.com:8858"
prefix: /nacos
"#,
        )
        .unwrap();
        let client = NacosClient::new(&settings).unwrap();
        assert_eq!(
            client.bases,
            vec![
                "http://127.0.0.1:8848/nacos".to_string(),
                "https://nacos.example.com:8858/nacos".to_string(),
            ]
        );
        assert!(client.credentials.is_none());
    }
}
