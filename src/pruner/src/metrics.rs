//! Pruning observability hook.
//!
//! The core reports through a single [`PruneRecorder`]. Every method has a
//! no-op default so a recorder can pick the events it cares about; exporters
//! live with the deployment, not here.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::resource::ResourceKind;

/// Kind of eviction that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    HistoryLimit,
    Ttl,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::HistoryLimit => "history_limit",
            Operation::Ttl => "ttl",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a resource or cleanup pass was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    AlreadyProcessed,
    NotCompleted,
    LockHeld,
    NoGroupingLabel,
    NoLimit,
    NoTtl,
    NotExpired,
}

impl SkipReason {
    pub const ALL: [SkipReason; 7] = [
        SkipReason::AlreadyProcessed,
        SkipReason::NotCompleted,
        SkipReason::LockHeld,
        SkipReason::NoGroupingLabel,
        SkipReason::NoLimit,
        SkipReason::NoTtl,
        SkipReason::NotExpired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already_processed",
            SkipReason::NotCompleted => "not_completed",
            SkipReason::LockHeld => "lock_held",
            SkipReason::NoGroupingLabel => "no_grouping_label",
            SkipReason::NoLimit => "no_limit",
            SkipReason::NoTtl => "no_ttl",
            SkipReason::NotExpired => "not_expired",
        }
    }

    fn index(&self) -> usize {
        match self {
            SkipReason::AlreadyProcessed => 0,
            SkipReason::NotCompleted => 1,
            SkipReason::LockHeld => 2,
            SkipReason::NoGroupingLabel => 3,
            SkipReason::NoLimit => 4,
            SkipReason::NoTtl => 5,
            SkipReason::NotExpired => 6,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability hook called by the retention engine.
///
/// Implementations must not block; they are called inline on the
/// processing path.
pub trait PruneRecorder: Send + Sync + fmt::Debug {
    /// A resource entered processing.
    fn resource_processed(&self, _kind: ResourceKind, _namespace: &str, _operation: Operation) {}

    fn resource_skipped(&self, _kind: ResourceKind, _namespace: &str, _reason: SkipReason) {}

    /// A resource was deleted. `age` is measured from completion (or
    /// creation when the completion time is unknown).
    fn resource_deleted(
        &self,
        _kind: ResourceKind,
        _namespace: &str,
        _operation: Operation,
        _age: Duration,
    ) {
    }

    /// An error surfaced during processing, labelled with a coarse class.
    fn resource_error(&self, _kind: ResourceKind, _namespace: &str, _error_class: &'static str) {}

    fn processing_duration(&self, _kind: ResourceKind, _operation: Operation, _elapsed: Duration) {}
}

/// Recorder that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl PruneRecorder for NoopRecorder {}

/// Thread-safe in-process counters
#[derive(Debug, Clone)]
pub struct RetentionMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Resources that entered processing
    resources_processed: AtomicUsize,
    /// Skips, indexed by reason
    resources_skipped: [AtomicUsize; SkipReason::ALL.len()],
    /// Deletions by history limit
    history_deletions: AtomicUsize,
    /// Deletions by TTL
    ttl_deletions: AtomicUsize,
    /// Errors surfaced to the caller or logged
    errors: AtomicUsize,
    /// Total processing time in milliseconds
    total_duration_ms: AtomicU64,
}

impl Default for RetentionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RetentionMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                resources_processed: AtomicUsize::new(0),
                resources_skipped: std::array::from_fn(|_| AtomicUsize::new(0)),
                history_deletions: AtomicUsize::new(0),
                ttl_deletions: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                total_duration_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn resources_processed(&self) -> usize {
        self.inner.resources_processed.load(Ordering::Relaxed)
    }

    /// Skips for one reason
    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.inner.resources_skipped[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total_skipped(&self) -> usize {
        self.inner
            .resources_skipped
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn deletions(&self, operation: Operation) -> usize {
        match operation {
            Operation::HistoryLimit => self.inner.history_deletions.load(Ordering::Relaxed),
            Operation::Ttl => self.inner.ttl_deletions.load(Ordering::Relaxed),
        }
    }

    pub fn errors(&self) -> usize {
        self.inner.errors.load(Ordering::Relaxed)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.inner.total_duration_ms.load(Ordering::Relaxed)
    }
}

impl PruneRecorder for RetentionMetrics {
    fn resource_processed(&self, _kind: ResourceKind, _namespace: &str, _operation: Operation) {
        self.inner
            .resources_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn resource_skipped(&self, _kind: ResourceKind, _namespace: &str, reason: SkipReason) {
        self.inner.resources_skipped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn resource_deleted(
        &self,
        _kind: ResourceKind,
        _namespace: &str,
        operation: Operation,
        _age: Duration,
    ) {
        let counter = match operation {
            Operation::HistoryLimit => &self.inner.history_deletions,
            Operation::Ttl => &self.inner.ttl_deletions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn resource_error(&self, _kind: ResourceKind, _namespace: &str, _error_class: &'static str) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn processing_duration(&self, _kind: ResourceKind, _operation: Operation, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.inner
            .total_duration_ms
            .fetch_add(millis, Ordering::Relaxed);
    }
}
