//! Main entry point for the Arado reconciler.
//!
//! Loads `conf/conf.yaml`, initializes logging, wires the stores, the
//! discoverers, the watcher and the rewriter together, then reconciles until
//! an interrupt or terminate signal arrives.

use anyhow::Context;
use tracing::info;

use arado_config::Settings;
use arado_server::startup::{self, Application};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load configuration")?;
    let _telemetry_guard =
        startup::init_telemetry(&settings.log).context("failed to initialize logging")?;

    info!("starting arado");
    let app = Application::build(&settings)
        .await
        .context("failed to start")?;
    app.run_until_shutdown().await
}
