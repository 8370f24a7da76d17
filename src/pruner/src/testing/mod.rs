//! Test utilities for the pruner.
//!
//! This module is only available when the `testing` feature is enabled or
//! during tests:
//!
//! ```toml
//! [dev-dependencies]
//! pruner = { path = "src/pruner", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pruner::testing::{InMemoryStore, ManualClock};
//!
//! let store = InMemoryStore::new(ResourceKind::PipelineRun);
//! store.insert(run);
//! store.fail_next(StoreOp::Delete, StoreError::Timeout("boom".into()));
//! ```

mod clock;
mod store;

pub use clock::ManualClock;
pub use store::{InMemoryStore, StoreOp};
