//! runpruner core library
//!
//! Policy-driven garbage collection of completed pipeline and task runs.
//!
//! - [`policy`]: layered policy documents and the [`ConfigResolver`] that
//!   answers "what is the effective value of this field here?"
//! - [`retention`]: the [`RetentionEngine`] (history-limit and TTL eviction)
//!   and the pure TTL evaluator
//! - [`coordination`]: the advisory annotation lock and the deletion
//!   de-duplicator that let independent replicas race safely
//! - [`store`]: the resource store capability set supplied by the caller
//! - [`metrics`]: the single observability hook the core reports through

pub mod clock;
pub mod coordination;
pub mod metrics;
pub mod policy;
pub mod resource;
pub mod retention;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use coordination::{DeletionDeduplicator, LockRecord, ResourceLocker};
pub use metrics::{NoopRecorder, Operation, PruneRecorder, RetentionMetrics, SkipReason};
pub use policy::{
    ConfigResolver, EnforcementLevel, GlobalPolicy, NamespacePolicy, PolicyError, PolicyField,
    PolicySource, PolicySpec, ResolvedValue, Selector,
};
pub use resource::{ResourceKind, ResourceRecord, RunStatus};
pub use retention::{
    CleanupResult, ProcessOutcome, PruneError, RetentionEngine, TtlDecision, TtlEvaluator,
    TtlOutcome,
};
pub use store::{LabelSelector, ResourceStore, StoreError};
