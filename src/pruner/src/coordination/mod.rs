//! Coordination between independent pruner replicas.
//!
//! - [`lock`]: advisory processing lock kept in a resource annotation
//! - [`dedup`]: short-window de-duplication of deletion events

pub mod dedup;
pub mod lock;

pub use dedup::DeletionDeduplicator;
pub use lock::{LockRecord, ResourceLocker};
