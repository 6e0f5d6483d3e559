//! Settings model: typed views of `conf/conf.yaml` with defaults and
//! validation.
//!
//! The file has three sections: `etcd` (a list, one entry per configuration
//! store), `log`, and `discovery` (a map keyed by registry kind). Unknown
//! discovery kinds are rejected here so the process fails before any store
//! watch starts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::{CONF_PATH, WORKDIR_ENV};

/// Top-level settings for one reconciler process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub etcd: Vec<EtcdSettings>,
    pub log: LogSettings,
    pub discovery: BTreeMap<String, DiscoverySettings>,
}

/// Raw file shape before per-kind discovery dispatch.
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    etcd: Vec<EtcdSettings>,
    #[serde(default)]
    log: LogSettings,
    #[serde(default)]
    discovery: BTreeMap<String, serde_yaml::Value>,
}

impl Settings {
    /// Load settings from `conf/conf.yaml` under the working directory,
    /// honoring the `ARADO_WORKDIR` override.
    pub fn load() -> Result<Self> {
        let workdir = std::env::var(WORKDIR_ENV).unwrap_or_else(|_| ".".to_string());
        let path = PathBuf::from(workdir).join(CONF_PATH);
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate settings from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawSettings = serde_yaml::from_str(content)?;

        let mut etcd = Vec::with_capacity(raw.etcd.len());
        for entry in raw.etcd {
            // An entry with no hosts is treated as disabled, matching the
            // behavior for commented-out secondary stores.
            if entry.host.is_empty() {
                continue;
            }
            entry.validate()?;
            etcd.push(entry);
        }
        if etcd.is_empty() {
            etcd.push(EtcdSettings::default());
        }

        raw.log.validate()?;

        let mut discovery = BTreeMap::new();
        for (kind, value) in raw.discovery {
            let settings = match kind.as_str() {
                "nacos" => {
                    let nacos: NacosSettings = serde_yaml::from_value(value)?;
                    nacos.validate()?;
                    DiscoverySettings::Nacos(nacos)
                }
                "zookeeper" => {
                    let zk: ZookeeperSettings = serde_yaml::from_value(value)?;
                    zk.validate()?;
                    DiscoverySettings::Zookeeper(zk)
                }
                other => return Err(ConfigError::UnknownDiscovery(other.to_string())),
            };
            discovery.insert(kind, settings);
        }

        Ok(Settings {
            etcd,
            log: raw.log,
            discovery,
        })
    }
}

/// One configuration store endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdSettings {
    #[serde(default)]
    pub host: Vec<String>,
    #[serde(default = "default_etcd_prefix")]
    pub prefix: String,
    /// Request timeout in seconds.
    #[serde(default = "default_etcd_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Default for EtcdSettings {
    fn default() -> Self {
        Self {
            host: vec!["127.0.0.1:2379".to_string()],
            prefix: default_etcd_prefix(),
            timeout: default_etcd_timeout(),
            user: None,
            password: None,
            tls: None,
        }
    }
}

impl EtcdSettings {
    fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || !self.prefix.starts_with('/') {
            return Err(ConfigError::InvalidEtcd(format!(
                "prefix must start with '/', got '{}'",
                self.prefix
            )));
        }
        if self.timeout == 0 {
            return Err(ConfigError::InvalidEtcd("timeout must be positive".into()));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(ConfigError::InvalidEtcd(
                "user and password must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// Client TLS material for an etcd endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub verify: bool,
}

/// Logging options.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path; stderr when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Retention in hours. Accepted for compatibility; enforcement is left to
    /// external rotation tooling.
    #[serde(default)]
    pub max_age: Option<u64>,
    /// Maximum file size in bytes. Accepted for compatibility; the rolling
    /// writer rotates by time only.
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Rotation period in seconds; periods below one day roll hourly,
    /// anything else rolls daily.
    #[serde(default = "default_rotation_time")]
    pub rotation_time: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
            max_age: None,
            max_size: None,
            rotation_time: default_rotation_time(),
        }
    }
}

impl LogSettings {
    fn validate(&self) -> Result<()> {
        match self.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::InvalidLog(format!(
                "unknown log level '{other}'"
            ))),
        }
    }
}

/// Per-kind registry settings.
#[derive(Debug, Clone)]
pub enum DiscoverySettings {
    Nacos(NacosSettings),
    Zookeeper(ZookeeperSettings),
}

/// Nacos registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NacosSettings {
    pub host: Vec<String>,
    #[serde(default = "default_nacos_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Weight substituted for registry instances reporting weight 0.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub timeout: NacosTimeouts,
}

/// Nacos HTTP timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct NacosTimeouts {
    #[serde(default = "default_connect_ms")]
    pub connect: u64,
    #[serde(default = "default_send_ms")]
    pub send: u64,
    #[serde(default = "default_read_ms")]
    pub read: u64,
}

impl Default for NacosTimeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_ms(),
            send: default_send_ms(),
            read: default_read_ms(),
        }
    }
}

impl NacosSettings {
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidDiscovery {
                section: "nacos".into(),
                reason: "host list must not be empty".into(),
            });
        }
        for host in &self.host {
            if !host.starts_with("http://") && !host.starts_with("https://") {
                return Err(ConfigError::InvalidDiscovery {
                    section: "nacos".into(),
                    reason: format!("host '{host}' must carry an http(s) scheme"),
                });
            }
        }
        if self.weight == 0 {
            return Err(ConfigError::InvalidDiscovery {
                section: "nacos".into(),
                reason: "weight must be at least 1".into(),
            });
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(ConfigError::InvalidDiscovery {
                section: "nacos".into(),
                reason: "user and password must be set together".into(),
            });
        }
        Ok(())
    }
}

/// ZooKeeper registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ZookeeperSettings {
    pub hosts: Vec<String>,
    #[serde(default = "default_zookeeper_prefix")]
    pub prefix: String,
    /// Weight substituted for service nodes reporting weight 0.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Session timeout in seconds.
    #[serde(default = "default_zookeeper_timeout")]
    pub timeout: u64,
}

impl ZookeeperSettings {
    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ConfigError::InvalidDiscovery {
                section: "zookeeper".into(),
                reason: "hosts list must not be empty".into(),
            });
        }
        if self.prefix.is_empty() || !self.prefix.starts_with('/') {
            return Err(ConfigError::InvalidDiscovery {
                section: "zookeeper".into(),
                reason: format!("prefix must start with '/', got '{}'", self.prefix),
            });
        }
        if self.weight == 0 {
            return Err(ConfigError::InvalidDiscovery {
                section: "zookeeper".into(),
                reason: "weight must be at least 1".into(),
            });
        }
        if self.timeout == 0 {
            return Err(ConfigError::InvalidDiscovery {
                section: "zookeeper".into(),
                reason: "timeout must be positive".into(),
            });
        }
        Ok(())
    }
}

fn default_etcd_prefix() -> String {
    "/apisix".to_string()
}

fn default_etcd_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_rotation_time() -> u64 {
    3600
}

fn default_nacos_prefix() -> String {
    "/nacos".to_string()
}

fn default_zookeeper_prefix() -> String {
    "/zookeeper".to_string()
}

fn default_zookeeper_timeout() -> u64 {
    10
}

fn default_weight() -> u32 {
    100
}

fn default_connect_ms() -> u64 {
    2000
}

fn default_send_ms() -> u64 {
    2000
}

fn default_read_ms() -> u64 {
    5000
}
