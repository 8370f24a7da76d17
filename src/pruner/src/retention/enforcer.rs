//! Retention Engine
//!
//! Evicts completed runs of one resource kind, either because a workflow
//! keeps more completed runs than its history limit allows or because a run
//! outlived its TTL.
//!
//! ## Safety Guarantees
//!
//! - Never deletes more than the excess over the limit
//! - Advisory lock so concurrent replicas skip rather than double-process
//! - Processed marker makes repeated events for the same run a no-op
//! - Dry-run mode for auditing a policy without deleting anything

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::Configuration;

use crate::clock::{Clock, SystemClock};
use crate::coordination::{DeletionDeduplicator, ResourceLocker};
use crate::metrics::{NoopRecorder, Operation, PruneRecorder, SkipReason};
use crate::policy::{ConfigResolver, PolicyField};
use crate::resource::{PROCESSED_ANNOTATION, ResourceKind, ResourceRecord, RunStatus};
use crate::store::{LabelSelector, ResourceStore, StoreError, annotation_patch};

use super::ttl::{TtlDecision, TtlEvaluator};

/// Errors returned to the caller's reconcile loop.
#[derive(Error, Debug)]
pub enum PruneError {
    #[error("failed to list {kind} in {namespace} with selector {selector}: {source}")]
    List {
        kind: ResourceKind,
        namespace: String,
        selector: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to delete {kind} {namespace}/{name}: {source}")]
    Delete {
        kind: ResourceKind,
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    /// The pass was cancelled; a retry re-lists and recomputes the excess.
    #[error("cleanup cancelled after deleting {deleted} resource(s)")]
    Cancelled { deleted: usize },
}

impl PruneError {
    /// Coarse error class used as a metrics label.
    pub fn class(&self) -> &'static str {
        match self {
            PruneError::List { source, .. } | PruneError::Delete { source, .. } => source.class(),
            PruneError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Result of one history-limit cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupResult {
    /// Status the pass filtered on.
    pub status: RunStatus,
    /// Effective limit, when one was configured.
    pub limit: Option<u64>,
    /// Completed siblings with the matching status, including the trigger.
    pub candidates: usize,
    /// Resources deleted (or, in dry-run mode, that would have been).
    pub deleted: Vec<String>,
    /// Victims that were already gone when deleted.
    pub already_gone: usize,
    /// Set when the pass did not run.
    pub skipped: Option<SkipReason>,
    pub dry_run: bool,
}

impl CleanupResult {
    fn new(status: RunStatus, dry_run: bool) -> Self {
        Self {
            status,
            limit: None,
            candidates: 0,
            deleted: Vec::new(),
            already_gone: 0,
            skipped: None,
            dry_run,
        }
    }

    fn skipped(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self
    }
}

/// Outcome of [`RetentionEngine::process_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    AlreadyProcessed,
    NotCompleted,
    /// Another instance holds the processing lock; retry on a later event.
    LockHeld,
    Processed(CleanupResult),
}

/// Outcome of [`RetentionEngine::process_ttl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlOutcome {
    NotCompleted,
    NoTtl,
    /// Not yet expired; re-invoke at `at`.
    Requeue { at: chrono::DateTime<Utc> },
    LockHeld,
    Deleted,
    /// Expired but already removed by someone else.
    AlreadyGone,
}

/// Retention engine for one resource kind.
pub struct RetentionEngine {
    store: Arc<dyn ResourceStore>,
    resolver: Arc<ConfigResolver>,
    locker: ResourceLocker,
    dedup: Arc<DeletionDeduplicator>,
    recorder: Arc<dyn PruneRecorder>,
    clock: Arc<dyn Clock>,
    ttl: TtlEvaluator,
    dry_run: bool,
}

impl RetentionEngine {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        resolver: Arc<ConfigResolver>,
        locker: ResourceLocker,
        dedup: Arc<DeletionDeduplicator>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            resolver,
            locker,
            dedup,
            recorder: Arc::new(NoopRecorder),
            ttl: TtlEvaluator::new(clock.clone()),
            clock,
            dry_run: false,
        }
    }

    /// Engine wired from process configuration: lock owner and timeout,
    /// de-duplication windows and dry-run mode.
    pub fn from_config(
        store: Arc<dyn ResourceStore>,
        resolver: Arc<ConfigResolver>,
        config: &Configuration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locker = ResourceLocker::new(
            config.pruner.resolved_instance_id(),
            &config.lock,
            clock.clone(),
        );
        let dedup = Arc::new(DeletionDeduplicator::new(&config.dedup, clock.clone()));

        info!(
            kind = %store.kind(),
            owner_id = locker.owner_id(),
            dry_run = config.pruner.dry_run,
            "Retention engine configured"
        );

        Self::new(store, resolver, locker, dedup)
            .with_dry_run(config.pruner.dry_run)
            .with_clock(clock)
    }

    /// Sweep the de-duplication cache on its configured interval until
    /// `cancel` fires.
    pub fn spawn_dedup_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let dedup = self.dedup.clone();
        let interval = dedup.sweep_interval();
        dedup.spawn_sweeper(interval, cancel)
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn PruneRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Clock used for TTL decisions, marker timestamps and deletion ages.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ttl = TtlEvaluator::new(clock.clone());
        self.clock = clock;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.store.kind()
    }

    /// Apply history limits in response to an event for `resource`.
    pub async fn process_event(
        &self,
        resource: &ResourceRecord,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PruneError> {
        let kind = self.kind();
        let namespace = resource.namespace.as_str();

        if resource.is_processed() {
            debug!(resource = %resource.display(), "Already processed, skipping");
            self.recorder
                .resource_skipped(kind, namespace, SkipReason::AlreadyProcessed);
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let field = match resource.status {
            RunStatus::Succeeded if resource.is_completed() => PolicyField::SuccessfulHistoryLimit,
            RunStatus::Failed if resource.is_completed() => PolicyField::FailedHistoryLimit,
            _ => {
                self.recorder
                    .resource_skipped(kind, namespace, SkipReason::NotCompleted);
                return Ok(ProcessOutcome::NotCompleted);
            }
        };

        if !self.acquire(resource).await {
            self.recorder
                .resource_skipped(kind, namespace, SkipReason::LockHeld);
            return Ok(ProcessOutcome::LockHeld);
        }

        let started = Instant::now();
        if self.mark_processed(resource).await {
            self.recorder
                .resource_processed(kind, namespace, Operation::HistoryLimit);
        }

        let result = self
            .cleanup(resource, field, resource.status, cancel)
            .await;

        self.release(resource).await;
        self.recorder
            .processing_duration(kind, Operation::HistoryLimit, started.elapsed());

        match result {
            Ok(result) => {
                if let Some(reason) = result.skipped {
                    self.recorder.resource_skipped(kind, namespace, reason);
                }
                Ok(ProcessOutcome::Processed(result))
            }
            Err(e) => {
                warn!(
                    resource = %resource.display(),
                    error = %e,
                    "History limit cleanup failed"
                );
                self.recorder.resource_error(kind, namespace, e.class());
                Err(e)
            }
        }
    }

    /// Delete `resource` once its TTL has elapsed.
    pub async fn process_ttl(
        &self,
        resource: &ResourceRecord,
        cancel: &CancellationToken,
    ) -> Result<TtlOutcome, PruneError> {
        let kind = self.kind();
        let namespace = resource.namespace.as_str();

        let ttl = self
            .resolver
            .resolve(
                namespace,
                resource.policy_name(),
                kind,
                PolicyField::TtlSecondsAfterFinished,
            )
            .map(|resolved| resolved.value);

        match self.ttl.evaluate(resource, ttl) {
            TtlDecision::NotCompleted => {
                self.recorder
                    .resource_skipped(kind, namespace, SkipReason::NotCompleted);
                return Ok(TtlOutcome::NotCompleted);
            }
            TtlDecision::NoTtl => {
                self.recorder
                    .resource_skipped(kind, namespace, SkipReason::NoTtl);
                return Ok(TtlOutcome::NoTtl);
            }
            TtlDecision::Pending { check_at } => {
                self.recorder
                    .resource_skipped(kind, namespace, SkipReason::NotExpired);
                return Ok(TtlOutcome::Requeue { at: check_at });
            }
            TtlDecision::Expired => {}
        }

        if cancel.is_cancelled() {
            return Err(PruneError::Cancelled { deleted: 0 });
        }

        match self.locker.try_lock(resource, self.store.as_ref()).await {
            Ok(true) => {}
            Ok(false) => {
                self.recorder
                    .resource_skipped(kind, namespace, SkipReason::LockHeld);
                return Ok(TtlOutcome::LockHeld);
            }
            Err(e) if e.is_not_found() => return Ok(TtlOutcome::AlreadyGone),
            Err(e) => {
                warn!(resource = %resource.display(), error = %e, "Failed to acquire processing lock");
                self.recorder.resource_error(kind, namespace, e.class());
                return Ok(TtlOutcome::LockHeld);
            }
        }

        let started = Instant::now();
        self.recorder
            .resource_processed(kind, namespace, Operation::Ttl);

        info!(
            resource = %resource.display(),
            ttl_seconds = ttl,
            "Resource exceeded its TTL"
        );

        let outcome = match self.delete_resource(resource, Operation::Ttl).await {
            Ok(true) => {
                if self.dry_run {
                    self.release(resource).await;
                }
                Ok(TtlOutcome::Deleted)
            }
            Ok(false) => Ok(TtlOutcome::AlreadyGone),
            Err(source) => {
                self.release(resource).await;
                self.recorder.resource_error(kind, namespace, source.class());
                Err(PruneError::Delete {
                    kind,
                    namespace: resource.namespace.clone(),
                    name: resource.name.clone(),
                    source,
                })
            }
        };

        self.recorder
            .processing_duration(kind, Operation::Ttl, started.elapsed());
        outcome
    }

    /// History-limit pass for the trigger's workflow and `status`.
    async fn cleanup(
        &self,
        resource: &ResourceRecord,
        field: PolicyField,
        status: RunStatus,
        cancel: &CancellationToken,
    ) -> Result<CleanupResult, PruneError> {
        let kind = self.kind();
        let namespace = resource.namespace.as_str();
        let result = CleanupResult::new(status, self.dry_run);

        let Some(workflow) = resource.grouping_name() else {
            debug!(
                resource = %resource.display(),
                label = kind.grouping_label(),
                "No grouping label, skipping history limit"
            );
            return Ok(result.skipped(SkipReason::NoGroupingLabel));
        };

        let level = self.resolver.enforcement_level(namespace, workflow, kind);
        let Some(limit) = self
            .resolver
            .effective_field(namespace, workflow, kind, field, level)
        else {
            debug!(
                resource = %resource.display(),
                workflow = %workflow,
                field = %field,
                level = %level,
                "No history limit configured"
            );
            return Ok(result.skipped(SkipReason::NoLimit));
        };

        let mut result = CleanupResult {
            limit: Some(limit),
            ..result
        };

        let selector = LabelSelector::new(kind.grouping_label(), workflow);
        let listed = self
            .store
            .list(namespace, &selector)
            .await
            .map_err(|source| PruneError::List {
                kind,
                namespace: namespace.to_string(),
                selector: selector.to_string(),
                source,
            })?;

        let mut candidates: Vec<ResourceRecord> = listed
            .into_iter()
            .filter(|r| r.is_completed() && r.status == status)
            .collect();
        result.candidates = candidates.len();

        let keep = usize::try_from(limit).unwrap_or(usize::MAX);
        if candidates.len() <= keep {
            debug!(
                namespace = %namespace,
                workflow = %workflow,
                status = %status,
                count = candidates.len(),
                limit,
                "Within history limit"
            );
            return Ok(result);
        }

        candidates.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        let excess = candidates.len() - keep;

        info!(
            namespace = %namespace,
            workflow = %workflow,
            status = %status,
            count = candidates.len(),
            limit,
            level = %level,
            excess,
            dry_run = self.dry_run,
            "Evicting runs over history limit"
        );

        for victim in candidates.iter().take(excess) {
            if cancel.is_cancelled() {
                info!(
                    namespace = %namespace,
                    workflow = %workflow,
                    deleted = result.deleted.len(),
                    "History limit cleanup cancelled"
                );
                return Err(PruneError::Cancelled {
                    deleted: result.deleted.len(),
                });
            }

            match self.delete_resource(victim, Operation::HistoryLimit).await {
                Ok(true) => result.deleted.push(victim.name.clone()),
                Ok(false) => result.already_gone += 1,
                Err(source) => {
                    return Err(PruneError::Delete {
                        kind,
                        namespace: namespace.to_string(),
                        name: victim.name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(result)
    }

    /// Delete one resource. `Ok(false)` means it was already gone.
    async fn delete_resource(
        &self,
        victim: &ResourceRecord,
        operation: Operation,
    ) -> Result<bool, StoreError> {
        let kind = self.kind();
        let age = self.age_of(victim);

        if self.dry_run {
            info!(
                resource = %victim.display(),
                operation = %operation,
                age_secs = age.as_secs(),
                "[DRY RUN] Would delete"
            );
        } else {
            match self.store.delete(&victim.namespace, &victim.name).await {
                Ok(()) => {
                    info!(
                        resource = %victim.display(),
                        operation = %operation,
                        age_secs = age.as_secs(),
                        "Deleted"
                    );
                }
                Err(e) if e.is_not_found() => {
                    debug!(resource = %victim.display(), "Already deleted");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        if self
            .dedup
            .record_deletion(kind, &victim.namespace, &victim.name)
        {
            self.recorder
                .resource_deleted(kind, &victim.namespace, operation, age);
        }
        Ok(true)
    }

    async fn acquire(&self, resource: &ResourceRecord) -> bool {
        match self.locker.try_lock(resource, self.store.as_ref()).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(resource = %resource.display(), error = %e, "Failed to acquire processing lock");
                self.recorder
                    .resource_error(self.kind(), &resource.namespace, e.class());
                false
            }
        }
    }

    async fn release(&self, resource: &ResourceRecord) {
        if let Err(e) = self.locker.release_lock(resource, self.store.as_ref()).await {
            warn!(resource = %resource.display(), error = %e, "Failed to release processing lock");
        }
    }

    /// Write the processed marker. Best effort; a failure only means the run
    /// may be examined again.
    ///
    /// Returns `false` when the same run was already processed within the
    /// de-duplication window.
    async fn mark_processed(&self, resource: &ResourceRecord) -> bool {
        let first = self
            .dedup
            .record_processed(self.kind(), &resource.namespace, &resource.name);
        if !first {
            debug!(resource = %resource.display(), "Processed recently, not counting again");
        }

        let patch = annotation_patch(
            PROCESSED_ANNOTATION,
            Some(&self.clock.now().to_rfc3339()),
            None,
        );
        if let Err(e) = self
            .store
            .patch(&resource.namespace, &resource.name, &patch)
            .await
        {
            warn!(resource = %resource.display(), error = %e, "Failed to mark resource as processed");
        }
        first
    }

    fn age_of(&self, resource: &ResourceRecord) -> Duration {
        let since = resource.completed_at.unwrap_or(resource.created_at);
        self.clock
            .now()
            .signed_duration_since(since)
            .to_std()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for RetentionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionEngine")
            .field("kind", &self.kind())
            .field("owner_id", &self.locker.owner_id())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}
