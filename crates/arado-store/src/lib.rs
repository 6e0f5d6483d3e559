//! Configuration store access for the Arado reconciler.
//!
//! The crate has two halves. The codec half (`object`, `message`) turns raw
//! JSON values from the store into typed views that expose the service
//! reference and keep every unrecognized field for a faithful write-back. The
//! store half (`backend`, `etcd`, `memory`, `store`, `hub`) lists, watches and
//! conditionally writes the keyspace, one `ConfStore` per object kind.

mod backend;
mod error;
mod etcd;
mod hub;
pub mod memory;
mod message;
mod object;
mod store;

pub use backend::{Backend, KeyValue, PutOutcome, RawEvent};
pub use error::{Result, StoreError};
pub use etcd::EtcdBackend;
pub use hub::{StoreHub, parse_key};
pub use message::{Message, StoreEvent};
pub use object::{ConfKind, ConfObject, DiscoveryArgs, Node, UpstreamView};
pub use store::ConfStore;

/// Sentinel value the store uses to materialize empty directories; entries
/// carrying it are skipped on list and watch.
pub const INIT_DIR: &[u8] = b"init_dir";
