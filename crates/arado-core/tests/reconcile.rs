//! End-to-end reconciliation over an in-memory store and mock registries:
//! catch-up, the dispatch table, subscription lifecycles and write-backs.

use std::sync::Arc;
use std::time::Duration;

use arado_core::{Rewriter, Watcher};
use arado_discovery::mock::{MockCall, MockDiscoverer};
use arado_discovery::{Discoverer, DiscovererHub, ServiceRef};
use arado_store::memory::MemoryBackend;
use arado_store::{ConfKind, Message, Node, StoreHub};
use serde_json::Value;

const NACOS_ROUTE: &str = r#"{"uri":"/t","upstream":{"service_name":"APISIX-NACOS","discovery_type":"nacos","discovery_args":{"group_name":"DEFAULT_GROUP"}}}"#;
const NACOS_ROUTE_GROUP_B: &str = r#"{"uri":"/t","upstream":{"service_name":"APISIX-NACOS","discovery_type":"nacos","discovery_args":{"group_name":"GROUP-B"}}}"#;
const ZK_ROUTE: &str = r#"{"uri":"/t","upstream":{"service_name":"APISIX-NACOS","discovery_type":"zookeeper"}}"#;
const STATIC_ROUTE: &str = r#"{"uri":"/t","upstream":{"nodes":[{"host":"9.9.9.9","port":80,"weight":1}]}}"#;

struct Harness {
    backend: Arc<MemoryBackend>,
    nacos: Arc<MockDiscoverer>,
    zookeeper: Arc<MockDiscoverer>,
    watcher: Watcher,
    rewriter: Rewriter,
    discoverers: Arc<DiscovererHub>,
}

impl Harness {
    /// Build the full pipeline and run catch-up against whatever the backend
    /// already contains.
    async fn start(backend: Arc<MemoryBackend>) -> Self {
        let hub = Arc::new(StoreHub::new(backend.clone(), "/apisix"));

        let nacos = MockDiscoverer::new();
        nacos.set_nodes(vec![Node::new("10.0.0.11", 8848, 10)]);
        let zookeeper = MockDiscoverer::new();
        zookeeper.set_nodes(vec![Node::new("10.0.0.21", 2181, 1)]);

        let discoverers: Arc<DiscovererHub> = Arc::new(
            [
                (
                    "nacos".to_string(),
                    nacos.clone() as Arc<dyn Discoverer>,
                ),
                (
                    "zookeeper".to_string(),
                    zookeeper.clone() as Arc<dyn Discoverer>,
                ),
            ]
            .into_iter()
            .collect(),
        );

        let rewriter = Rewriter::new(vec![hub.clone()]);
        rewriter.init(&discoverers).unwrap();

        let watcher = Watcher::new(vec![hub.clone()], discoverers.clone());
        watcher.init().await.unwrap();
        watcher.watch().await.unwrap();

        Self {
            backend,
            nacos,
            zookeeper,
            watcher,
            rewriter,
            discoverers,
        }
    }

    async fn shutdown(self) {
        self.watcher.close().await;
        self.discoverers.stop_all().await;
        self.rewriter.close().await;
    }

    fn stored(&self, key: &str) -> Option<Value> {
        let (bytes, _) = self.backend.get(key)?;
        serde_json::from_slice(&bytes).ok()
    }
}

async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn service_ref(value: &str) -> ServiceRef {
    let msg = Message::new("/probe", 1, ConfKind::Routes, value.as_bytes()).unwrap();
    ServiceRef::from_message(&msg).unwrap()
}

fn nodes_hosts(stored: &Value) -> Vec<String> {
    stored["upstream"]["nodes"]
        .as_array()
        .map(|nodes| {
            nodes
                .iter()
                .map(|n| n["host"].as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_happy_path_writes_resolved_nodes() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;

    eventually("rewritten route", || {
        h.stored("/apisix/routes/1")
            .map(|v| !nodes_hosts(&v).is_empty())
            .unwrap_or(false)
    })
    .await;

    let stored = h.stored("/apisix/routes/1").unwrap();
    let upstream = &stored["upstream"];
    assert_eq!(upstream["_service_name"], "APISIX-NACOS");
    assert_eq!(upstream["_discovery_type"], "nacos");
    assert!(upstream.get("service_name").is_none());
    assert!(upstream.get("discovery_type").is_none());
    assert_eq!(upstream["discovery_args"]["group_name"], "DEFAULT_GROUP");
    assert_eq!(
        upstream["nodes"],
        serde_json::json!([{"host": "10.0.0.11", "port": 8848, "weight": 10}])
    );
    assert_eq!(stored["uri"], "/t");
    assert!(stored["update_time"].is_i64());

    // the write-back event refreshes the stored referrer instead of looping
    eventually("feedback settles into an update", || {
        h.nacos
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::Update { .. }))
    })
    .await;
    assert_eq!(h.nacos.subscription_count(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_catch_up_binds_preexisting_objects() {
    let backend = Arc::new(MemoryBackend::new());
    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    backend.put("/apisix/routes/2", STATIC_ROUTE.as_bytes()).await;
    backend
        .put("/apisix/services/7", NACOS_ROUTE_GROUP_B.as_bytes())
        .await;
    backend.put("/apisix/upstreams", b"init_dir".to_vec()).await;

    let h = Harness::start(backend.clone()).await;

    // both referenced objects were queried during catch-up, the static one
    // was not
    let calls = h.nacos.calls();
    let queried: Vec<&str> = calls
        .iter()
        .filter_map(|call| match call {
            MockCall::Query { key, .. } => Some(key.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(queried.len(), 2);
    assert!(queried.contains(&"/apisix/routes/1"));
    assert!(queried.contains(&"/apisix/services/7"));

    assert_eq!(h.nacos.subscription_count(), 2);
    eventually("both objects rewritten", || {
        ["/apisix/routes/1", "/apisix/services/7"].iter().all(|key| {
            h.stored(key)
                .map(|v| !nodes_hosts(&v).is_empty())
                .unwrap_or(false)
        })
    })
    .await;

    // the static route is untouched
    let static_route = h.stored("/apisix/routes/2").unwrap();
    assert!(static_route.get("update_time").is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn test_args_only_change_is_one_update() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    let group_a = service_ref(NACOS_ROUTE);
    eventually("initial subscription", || {
        h.nacos.referrers(&group_a) == vec!["/apisix/routes/1".to_string()]
    })
    .await;

    backend
        .put("/apisix/routes/1", NACOS_ROUTE_GROUP_B.as_bytes())
        .await;

    let group_b = service_ref(NACOS_ROUTE_GROUP_B);
    eventually("subscription moved to the new group", || {
        h.nacos.referrers(&group_b) == vec!["/apisix/routes/1".to_string()]
            && h.nacos.referrers(&group_a).is_empty()
    })
    .await;

    // exactly one argument-changing update was observed
    let count = h
        .nacos
        .calls()
        .iter()
        .filter(|call| matches!(call, MockCall::Update { old, new, .. } if old != new))
        .count();
    assert_eq!(count, 1);
    assert_eq!(h.nacos.subscription_count(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_replace_is_delete_then_query() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    eventually("nacos nodes written", || {
        h.stored("/apisix/routes/1")
            .map(|v| nodes_hosts(&v) == vec!["10.0.0.11".to_string()])
            .unwrap_or(false)
    })
    .await;

    backend.put("/apisix/routes/1", ZK_ROUTE.as_bytes()).await;

    eventually("zookeeper nodes written", || {
        h.stored("/apisix/routes/1")
            .map(|v| nodes_hosts(&v) == vec!["10.0.0.21".to_string()])
            .unwrap_or(false)
    })
    .await;

    let nacos_deletes = h
        .nacos
        .calls()
        .iter()
        .filter(|call| matches!(call, MockCall::Delete { key, .. } if key == "/apisix/routes/1"))
        .count();
    assert_eq!(nacos_deletes, 1);

    let zk_queries = h
        .zookeeper
        .calls()
        .iter()
        .filter(|call| matches!(call, MockCall::Query { key, .. } if key == "/apisix/routes/1"))
        .count();
    assert_eq!(zk_queries, 1);

    assert_eq!(h.nacos.subscription_count(), 0);
    assert_eq!(h.zookeeper.subscription_count(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_explicit_nodes_resume_authority() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    eventually("subscription established", || h.nacos.subscription_count() == 1).await;

    backend.put("/apisix/routes/1", STATIC_ROUTE.as_bytes()).await;

    eventually("binding removed", || h.nacos.subscription_count() == 0).await;

    // the object's own nodes are now authoritative: no rewrite happens
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = h.stored("/apisix/routes/1").unwrap();
    assert_eq!(nodes_hosts(&stored), vec!["9.9.9.9".to_string()]);
    assert!(stored.get("update_time").is_none());
    assert!(stored["upstream"].get("_service_name").is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn test_delete_event_unsubscribes() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    backend.put("/apisix/routes/2", NACOS_ROUTE.as_bytes()).await;
    let sref = service_ref(NACOS_ROUTE);
    eventually("both keys bound", || h.nacos.referrers(&sref).len() == 2).await;

    backend.delete("/apisix/routes/1").await;
    eventually("one referrer left", || {
        h.nacos.referrers(&sref) == vec!["/apisix/routes/2".to_string()]
    })
    .await;
    assert_eq!(h.nacos.subscription_count(), 1);

    backend.delete("/apisix/routes/2").await;
    eventually("subscription destroyed", || h.nacos.subscription_count() == 0).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_registry_change_fans_out() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    backend.put("/apisix/routes/2", NACOS_ROUTE.as_bytes()).await;
    eventually("both rewritten", || {
        ["/apisix/routes/1", "/apisix/routes/2"].iter().all(|key| {
            h.stored(key)
                .map(|v| nodes_hosts(&v) == vec!["10.0.0.11".to_string()])
                .unwrap_or(false)
        })
    })
    .await;

    // wait for the write-back feedback to refresh the stored referrer
    // versions, as a real registry's next callback would find them
    let sref = service_ref(NACOS_ROUTE);
    let caught_up = |h: &Harness| {
        ["/apisix/routes/1", "/apisix/routes/2"].iter().all(|key| {
            let stored = h.backend.get(key).map(|(_, version)| version);
            h.nacos.referrer_version(&sref, key) == stored
        })
    };
    eventually("referrer versions caught up", || caught_up(&h)).await;

    h.nacos
        .push_nodes(vec![
            Node::new("10.0.0.11", 8848, 10),
            Node::new("10.0.0.12", 8848, 10),
        ])
        .await;

    eventually("membership change reaches both keys", || {
        ["/apisix/routes/1", "/apisix/routes/2"].iter().all(|key| {
            h.stored(key)
                .map(|v| nodes_hosts(&v).len() == 2)
                .unwrap_or(false)
        })
    })
    .await;

    // a registry losing its last instance produces an explicit empty list
    eventually("referrer versions caught up again", || caught_up(&h)).await;
    h.nacos.push_nodes(Vec::new()).await;
    eventually("empty node list written", || {
        h.stored("/apisix/routes/1")
            .map(|v| v["upstream"]["nodes"] == serde_json::json!([]))
            .unwrap_or(false)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_failed_query_retries_on_next_event() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    h.nacos.fail_next_query();
    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;

    eventually("failed query observed", || {
        h.nacos
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::Query { .. }))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.nacos.subscription_count(), 0);

    // the next event for the key re-drives the binding from scratch
    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    eventually("binding established on retry", || {
        h.nacos.subscription_count() == 1
    })
    .await;
    eventually("nodes written after retry", || {
        h.stored("/apisix/routes/1")
            .map(|v| !nodes_hosts(&v).is_empty())
            .unwrap_or(false)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_catch_up_matches_event_driven_bindings() {
    // the same snapshot produces the same bindings whether it is listed at
    // init or replayed as individual put events
    let listed = Arc::new(MemoryBackend::new());
    listed.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    listed
        .put("/apisix/routes/2", NACOS_ROUTE_GROUP_B.as_bytes())
        .await;
    listed.put("/apisix/services/3", ZK_ROUTE.as_bytes()).await;
    let via_list = Harness::start(listed).await;

    let replayed = Arc::new(MemoryBackend::new());
    let via_events = Harness::start(replayed.clone()).await;
    replayed
        .put("/apisix/services/3", ZK_ROUTE.as_bytes())
        .await;
    replayed
        .put("/apisix/routes/2", NACOS_ROUTE_GROUP_B.as_bytes())
        .await;
    replayed.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;

    let group_a = service_ref(NACOS_ROUTE);
    let group_b = service_ref(NACOS_ROUTE_GROUP_B);
    let zk = service_ref(ZK_ROUTE);
    eventually("replayed bindings complete", || {
        via_events.nacos.subscription_count() == 2 && via_events.zookeeper.subscription_count() == 1
    })
    .await;

    for h in [&via_list, &via_events] {
        assert_eq!(h.nacos.referrers(&group_a), vec!["/apisix/routes/1".to_string()]);
        assert_eq!(h.nacos.referrers(&group_b), vec!["/apisix/routes/2".to_string()]);
        assert_eq!(h.zookeeper.referrers(&zk), vec!["/apisix/services/3".to_string()]);
    }

    via_list.shutdown().await;
    via_events.shutdown().await;
}

#[tokio::test]
async fn test_two_store_endpoints_share_discoverers() {
    let first = Arc::new(MemoryBackend::new());
    let second = Arc::new(MemoryBackend::new());
    let hubs = vec![
        Arc::new(StoreHub::new(first.clone(), "/apisix")),
        Arc::new(StoreHub::new(second.clone(), "/gateway")),
    ];

    let nacos = MockDiscoverer::new();
    nacos.set_nodes(vec![Node::new("10.0.0.11", 8848, 10)]);
    let discoverers: Arc<DiscovererHub> =
        Arc::new([("nacos".to_string(), nacos.clone() as Arc<dyn Discoverer>)]
            .into_iter()
            .collect());

    let rewriter = Rewriter::new(hubs.clone());
    rewriter.init(&discoverers).unwrap();
    let watcher = Watcher::new(hubs, discoverers.clone());
    watcher.init().await.unwrap();
    watcher.watch().await.unwrap();

    first.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    second.put("/gateway/routes/1", NACOS_ROUTE.as_bytes()).await;

    // one subscription serves both endpoints, and each write lands in the
    // store the key came from
    let sref = service_ref(NACOS_ROUTE);
    eventually("both endpoints bound", || {
        nacos.referrers(&sref)
            == vec![
                "/apisix/routes/1".to_string(),
                "/gateway/routes/1".to_string(),
            ]
    })
    .await;
    assert_eq!(nacos.subscription_count(), 1);

    let written = |backend: &MemoryBackend, key: &str| {
        backend
            .get(key)
            .and_then(|(bytes, _)| serde_json::from_slice::<Value>(&bytes).ok())
            .map(|v| !nodes_hosts(&v).is_empty())
            .unwrap_or(false)
    };
    eventually("both endpoints rewritten", || {
        written(&first, "/apisix/routes/1") && written(&second, "/gateway/routes/1")
    })
    .await;

    watcher.close().await;
    discoverers.stop_all().await;
    rewriter.close().await;
}

#[tokio::test]
async fn test_binding_uniqueness_across_flapping() {
    let backend = Arc::new(MemoryBackend::new());
    let h = Harness::start(backend.clone()).await;

    // drive the same key through add, args change, replace and back
    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;
    backend
        .put("/apisix/routes/1", NACOS_ROUTE_GROUP_B.as_bytes())
        .await;
    backend.put("/apisix/routes/1", ZK_ROUTE.as_bytes()).await;
    backend.put("/apisix/routes/1", NACOS_ROUTE.as_bytes()).await;

    eventually("key settles on the final reference", || {
        let sref = service_ref(NACOS_ROUTE);
        h.nacos.referrers(&sref) == vec!["/apisix/routes/1".to_string()]
            && h.zookeeper.subscription_count() == 0
    })
    .await;

    // at most one subscription holds the key anywhere
    assert_eq!(h.nacos.subscription_count(), 1);
    assert_eq!(h.zookeeper.subscription_count(), 0);

    h.shutdown().await;
}
