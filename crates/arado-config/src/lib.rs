//! Process configuration for the Arado reconciler.
//!
//! Settings are read from `conf/conf.yaml` relative to the working directory
//! (overridable with the `ARADO_WORKDIR` environment variable) and validated
//! before any component starts. A broken configuration is fatal at init.

mod error;
mod settings;

pub use error::{ConfigError, Result};
pub use settings::{
    DiscoverySettings, EtcdSettings, LogSettings, NacosSettings, NacosTimeouts, Settings,
    TlsSettings, ZookeeperSettings,
};

/// Environment variable that relocates the working directory used to find
/// `conf/conf.yaml`.
pub const WORKDIR_ENV: &str = "ARADO_WORKDIR";

/// Relative path of the configuration file inside the working directory.
pub const CONF_PATH: &str = "conf/conf.yaml";
