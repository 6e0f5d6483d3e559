//! The reconciliation engine: the watcher derives bindings from store events
//! and drives the discoverers; the rewriter consumes their node updates and
//! writes resolved endpoints back to the store.

mod error;
mod rewriter;
mod watcher;

pub use error::{CoreError, Result};
pub use rewriter::Rewriter;
pub use watcher::Watcher;
