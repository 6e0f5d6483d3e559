//! Typed view of stored configuration objects.
//!
//! A stored value is parsed twice: once into [`UpstreamView`] for the fields
//! the reconciler acts on, once into an opaque map that keeps every other
//! field byte-faithful across a write-back. Encoding merges the view back
//! into the map, so only recognized paths are ever rewritten.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Result, StoreError};

/// The logical bucket of a configuration object, derived from its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfKind {
    Routes,
    Services,
    Upstreams,
}

impl ConfKind {
    pub const ALL: [ConfKind; 3] = [ConfKind::Routes, ConfKind::Services, ConfKind::Upstreams];

    /// The key segment naming this kind, e.g. `routes` in `/apisix/routes/1`.
    pub fn segment(&self) -> &'static str {
        match self {
            ConfKind::Routes => "routes",
            ConfKind::Services => "services",
            ConfKind::Upstreams => "upstreams",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "routes" => Some(ConfKind::Routes),
            "services" => Some(ConfKind::Services),
            "upstreams" => Some(ConfKind::Upstreams),
            _ => None,
        }
    }

    /// `upstreams` objects carry their upstream fields at the top level;
    /// routes and services nest them under an `upstream` field.
    fn nests_upstream(&self) -> bool {
        !matches!(self, ConfKind::Upstreams)
    }
}

impl std::fmt::Display for ConfKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.segment())
    }
}

/// One resolved endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            metadata: None,
        }
    }
}

/// Registry-specific arguments of a service reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// The upstream fields the reconciler recognizes.
///
/// `service_name` and `discovery_type` each have a `_`-prefixed twin: the
/// write-back hides the plain spelling behind the prefix whenever `nodes` is
/// present, because a downstream consumer rejects the two appearing together.
/// Decoding accepts either spelling and prefers the plain one.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamView {
    #[serde(default)]
    pub nodes: Option<Value>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(rename = "_service_name", default)]
    pub hidden_service_name: Option<String>,
    #[serde(default)]
    pub discovery_type: Option<String>,
    #[serde(rename = "_discovery_type", default)]
    pub hidden_discovery_type: Option<String>,
    #[serde(default)]
    pub discovery_args: Option<DiscoveryArgs>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl UpstreamView {
    /// Effective service name, whichever spelling is populated.
    pub fn service_name(&self) -> Option<&str> {
        non_empty(&self.service_name).or_else(|| non_empty(&self.hidden_service_name))
    }

    /// Effective discovery type, whichever spelling is populated.
    pub fn discovery_type(&self) -> Option<&str> {
        non_empty(&self.discovery_type).or_else(|| non_empty(&self.hidden_discovery_type))
    }

    /// True when the object names a service to resolve.
    pub fn has_service_ref(&self) -> bool {
        self.service_name().is_some() && self.discovery_type().is_some()
    }

    pub fn has_nodes(&self) -> bool {
        self.nodes.is_some()
    }

    /// Parse the `nodes` value into a node list, accepting both the list form
    /// `[{"host","port","weight"}]` and the map form `{"host:port": weight}`.
    pub fn nodes_list(&self) -> Option<Vec<Node>> {
        match self.nodes.as_ref()? {
            Value::Array(_) => serde_json::from_value(self.nodes.clone()?).ok(),
            Value::Object(map) => {
                let mut nodes = Vec::with_capacity(map.len());
                for (addr, weight) in map {
                    let (host, port) = addr.rsplit_once(':')?;
                    let port = port.parse().ok()?;
                    let weight = weight.as_f64()? as u32;
                    nodes.push(Node::new(host, port, weight));
                }
                Some(nodes)
            }
            _ => None,
        }
    }

    pub fn set_nodes(&mut self, nodes: &[Node]) {
        self.nodes = Some(json!(nodes));
    }
}

/// A decoded configuration object: the typed upstream view plus the opaque
/// remainder used to re-serialize without field loss.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfObject {
    kind: ConfKind,
    pub upstream: UpstreamView,
    all: Map<String, Value>,
}

impl ConfObject {
    /// Decode stored bytes. `key` provides error context and the fallback
    /// `id` (its last path segment) when the document carries none.
    pub fn decode(kind: ConfKind, key: &str, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })?;
        let Value::Object(mut all) = value else {
            return Err(StoreError::NotAnObject {
                key: key.to_string(),
            });
        };

        let upstream_source = if kind.nests_upstream() {
            all.get("upstream").cloned().unwrap_or(Value::Null)
        } else {
            Value::Object(all.clone())
        };
        let upstream = match upstream_source {
            Value::Null => UpstreamView::default(),
            other => {
                serde_json::from_value(other).map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })?
            }
        };

        if !all.contains_key("id") {
            let id = key.rsplit('/').next().unwrap_or(key);
            all.insert("id".to_string(), json!(id));
        }

        Ok(Self {
            kind,
            upstream,
            all,
        })
    }

    pub fn kind(&self) -> ConfKind {
        self.kind
    }

    /// A top-level field of the stored document.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.all.get(field)
    }

    /// Replace the node list with freshly resolved endpoints.
    pub fn inject_nodes(&mut self, nodes: &[Node]) {
        self.upstream.set_nodes(nodes);
    }

    /// Stamp `update_time` with the current wall-clock second. `create_time`
    /// is never touched.
    pub fn touch(&mut self) {
        self.all
            .insert("update_time".to_string(), json!(chrono::Utc::now().timestamp()));
    }

    /// Re-serialize, merging the typed view back into the opaque remainder so
    /// unrecognized fields survive the round-trip.
    pub fn encode(&self, key: &str) -> Result<Vec<u8>> {
        let mut all = self.all.clone();

        if self.kind.nests_upstream() {
            let needs_section =
                all.contains_key("upstream") || self.upstream != UpstreamView::default();
            if needs_section {
                let section = all
                    .entry("upstream".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(section) = section {
                    self.merge_upstream(section);
                }
            }
        } else {
            self.merge_upstream(&mut all);
        }

        serde_json::to_vec(&Value::Object(all)).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })
    }

    fn merge_upstream(&self, section: &mut Map<String, Value>) {
        let view = &self.upstream;

        match &view.nodes {
            Some(nodes) => {
                section.insert("nodes".to_string(), nodes.clone());
            }
            None => {
                section.remove("nodes");
            }
        }

        let hide = view.nodes.is_some();
        merge_dual_prefix(section, "service_name", view.service_name(), hide);
        merge_dual_prefix(section, "discovery_type", view.discovery_type(), hide);

        match &view.discovery_args {
            Some(args) => {
                section.insert("discovery_args".to_string(), json!(args));
            }
            None => {
                section.remove("discovery_args");
            }
        }
    }
}

/// Write `name` under its plain or `_`-prefixed spelling and drop the other,
/// so exactly one spelling survives the write-back.
fn merge_dual_prefix(
    section: &mut Map<String, Value>,
    field: &'static str,
    value: Option<&str>,
    hide: bool,
) {
    let Some(value) = value else { return };
    let hidden = format!("_{field}");
    if hide {
        section.insert(hidden, json!(value));
        section.remove(field);
    } else {
        section.insert(field.to_string(), json!(value));
        section.remove(&hidden);
    }
}
