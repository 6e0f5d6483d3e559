//! Service references: the equality tuple identifying one subscription.

use std::collections::BTreeMap;

use arado_store::{DiscoveryArgs, Message};

/// Normalized registry arguments. Missing keys become empty strings and a
/// missing metadata map becomes empty, so two objects spelling the same
/// arguments differently compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceArgs {
    pub namespace_id: String,
    pub group_name: String,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceArgs {
    pub fn normalize(args: Option<&DiscoveryArgs>) -> Self {
        let Some(args) = args else {
            return Self::default();
        };
        Self {
            namespace_id: args.namespace_id.clone().unwrap_or_default(),
            group_name: args.group_name.clone().unwrap_or_default(),
            metadata: args.metadata.clone().unwrap_or_default(),
        }
    }
}

/// Identity of a subscription: two references are the same subscription iff
/// discovery type, service name and normalized arguments are all equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub discovery_type: String,
    pub service_name: String,
    pub args: ServiceArgs,
}

impl ServiceRef {
    /// Extract the reference an object carries, if any.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let service_name = msg.service_name()?.to_string();
        let discovery_type = msg.discovery_type()?.to_string();
        Some(Self {
            discovery_type,
            service_name,
            args: ServiceArgs::normalize(msg.discovery_args()),
        })
    }

    /// Whether two references name the same service in the same registry.
    /// References with equal identity but different arguments move through
    /// the one-step update path; a changed identity requires delete-then-query.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.discovery_type == other.discovery_type && self.service_name == other.service_name
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}@{}",
            self.discovery_type, self.args.namespace_id, self.args.group_name, self.service_name
        )
    }
}
