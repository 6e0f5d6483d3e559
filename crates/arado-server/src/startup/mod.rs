//! Application startup: component wiring and the shutdown sequence.

mod shutdown;
mod telemetry;

use std::sync::Arc;

use tracing::{info, warn};

use arado_config::Settings;
use arado_core::{Rewriter, Watcher};
use arado_discovery::{DiscovererBuilders, DiscovererHub};
use arado_store::{EtcdBackend, StoreHub};

pub use shutdown::{abort_on_second_signal, wait_for_signal};
pub use telemetry::{TelemetryGuard, init_telemetry};

/// The assembled reconciler: one store hub per configured etcd endpoint, one
/// discoverer per configured registry kind, and the watcher/rewriter pair
/// running them as independent subtrees over a shared discoverer set.
pub struct Application {
    hubs: Vec<Arc<StoreHub>>,
    discoverers: Arc<DiscovererHub>,
    watcher: Watcher,
    rewriter: Rewriter,
}

impl Application {
    /// Construct every component. Any failure here is fatal; nothing has
    /// started watching yet.
    pub async fn build(settings: &Settings) -> anyhow::Result<Self> {
        if settings.discovery.is_empty() {
            warn!("no discovery registries configured; objects will never resolve");
        }
        let discoverers = Arc::new(DiscovererBuilders::defaults().build_all(&settings.discovery)?);

        let mut hubs = Vec::with_capacity(settings.etcd.len());
        for etcd in &settings.etcd {
            let backend = Arc::new(EtcdBackend::connect(etcd).await?);
            info!(
                "connected to configuration store at {:?} under {}",
                etcd.host, etcd.prefix
            );
            hubs.push(Arc::new(StoreHub::new(backend, &etcd.prefix)));
        }

        let rewriter = Rewriter::new(hubs.clone());
        rewriter.init(&discoverers)?;

        let watcher = Watcher::new(hubs.clone(), discoverers.clone());

        Ok(Self {
            hubs,
            discoverers,
            watcher,
            rewriter,
        })
    }

    /// Catch up, watch, and reconcile until a signal arrives, then shut the
    /// components down in dependency order: watcher first (no new bindings),
    /// discoverers second (closing the rewriter's inputs), rewriter last
    /// (draining buffered writes).
    pub async fn run_until_shutdown(self) -> anyhow::Result<()> {
        self.watcher.init().await?;
        self.watcher.watch().await?;
        info!("reconciling");

        let signal = wait_for_signal().await;
        info!("received {signal}, shutting down");
        abort_on_second_signal();

        self.watcher.close().await;
        self.discoverers.stop_all().await;
        self.rewriter.close().await;
        for hub in &self.hubs {
            hub.close();
        }
        info!("shutdown complete");
        Ok(())
    }
}
