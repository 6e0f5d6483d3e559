//! etcd backend: list, conditional put and prefix watch over an etcd v3
//! cluster.
//!
//! The client is channel-based and cheap to clone; every operation works on
//! its own clone because the etcd API takes `&mut self`. The watch task owns
//! its clone until the stream ends or the cancellation token fires.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, Identity, TlsOptions, Txn,
    TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arado_config::EtcdSettings;

use crate::backend::{Backend, KeyValue, PutOutcome, RawEvent};
use crate::error::Result;

const EVENT_CHANNEL_DEPTH: usize = 16;

pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    /// Connect to the endpoints in `settings`. Connection failure is fatal to
    /// init; the caller decides whether to retry or exit.
    pub async fn connect(settings: &EtcdSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.timeout);
        let mut options = ConnectOptions::new()
            .with_timeout(timeout)
            .with_connect_timeout(timeout);

        if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
            options = options.with_user(user, password);
        }

        if let Some(tls) = &settings.tls {
            if tls.verify {
                let cert = std::fs::read(&tls.cert)?;
                let key = std::fs::read(&tls.key)?;
                let identity = Identity::from_pem(cert, key);
                options = options.with_tls(TlsOptions::new().identity(identity));
            }
        }

        let client = Client::connect(&settings.host, Some(options)).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let Ok(key) = kv.key_str() else {
                warn!("skipping non-utf8 key under {prefix}");
                continue;
            };
            entries.push(KeyValue {
                key: key.to_string(),
                value: kv.value().to_vec(),
                version: kv.mod_revision(),
            });
        }
        Ok(entries)
    }

    async fn put_cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: i64,
    ) -> Result<PutOutcome> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_version,
            )])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            Ok(PutOutcome::Written)
        } else {
            Ok(PutOutcome::Conflict)
        }
    }

    async fn watch(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<RawEvent>>> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        let prefix = prefix.to_string();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(err) = watcher.cancel().await {
                            debug!("cancel watch on {prefix}: {err}");
                        }
                        break;
                    }
                    resp = stream.message() => match resp {
                        Ok(Some(resp)) => {
                            let events: Vec<RawEvent> =
                                resp.events().iter().filter_map(translate_event).collect();
                            if !events.is_empty() && tx.send(events).await.is_err() {
                                break;
                            }
                            if resp.canceled() {
                                debug!("watch on {prefix} canceled by server");
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!("watch stream on {prefix} ended");
                            break;
                        }
                        Err(err) => {
                            warn!("watch stream on {prefix} failed: {err}");
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn translate_event(event: &etcd_client::Event) -> Option<RawEvent> {
    let kv = event.kv()?;
    let key = kv.key_str().ok()?.to_string();
    match event.event_type() {
        EventType::Put => Some(RawEvent::Put(KeyValue {
            key,
            value: kv.value().to_vec(),
            version: kv.mod_revision(),
        })),
        EventType::Delete => Some(RawEvent::Delete { key }),
    }
}
