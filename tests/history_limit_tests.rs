use chrono::{DateTime, TimeZone, Utc};
use common::config::{DedupConfig, LockConfig};
use pruner::resource::{LOCK_ANNOTATION, PIPELINE_LABEL, PROCESSED_ANNOTATION};
use pruner::testing::{InMemoryStore, ManualClock, StoreOp};
use pruner::{
    ConfigResolver, DeletionDeduplicator, Operation, ProcessOutcome, PruneError, ResourceKind,
    ResourceLocker, ResourceRecord, RetentionEngine, RetentionMetrics, RunStatus, SkipReason,
    StoreError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const NS: &str = "ci";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn pipeline_run(name: &str, pipeline: &str, created: i64, status: RunStatus) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::PipelineRun, NS, name, at(created))
        .with_label(PIPELINE_LABEL, pipeline)
        .completed(status, at(created + 30))
}

struct Fixture {
    store: Arc<InMemoryStore>,
    resolver: Arc<ConfigResolver>,
    clock: Arc<ManualClock>,
    dedup: Arc<DeletionDeduplicator>,
    metrics: RetentionMetrics,
}

impl Fixture {
    fn new(policy: &str) -> Self {
        let resolver = Arc::new(ConfigResolver::new());
        resolver.load_global(policy).unwrap();
        let clock = Arc::new(ManualClock::new(at(100_000)));
        Self {
            store: Arc::new(InMemoryStore::new(ResourceKind::PipelineRun)),
            resolver,
            dedup: Arc::new(DeletionDeduplicator::new(
                &DedupConfig::default(),
                clock.clone(),
            )),
            clock,
            metrics: RetentionMetrics::new(),
        }
    }

    fn engine(&self, owner: &str) -> RetentionEngine {
        RetentionEngine::new(
            self.store.clone(),
            self.resolver.clone(),
            ResourceLocker::new(owner, &LockConfig::default(), self.clock.clone()),
            self.dedup.clone(),
        )
        .with_clock(self.clock.clone())
        .with_recorder(Arc::new(self.metrics.clone()))
    }

    fn seed(&self, runs: impl IntoIterator<Item = ResourceRecord>) {
        for run in runs {
            self.store.insert(run);
        }
    }

    fn current(&self, name: &str) -> ResourceRecord {
        self.store.get_record(NS, name).unwrap()
    }
}

fn processed(outcome: ProcessOutcome) -> pruner::CleanupResult {
    match outcome {
        ProcessOutcome::Processed(result) => result,
        other => panic!("expected a cleanup pass, got {other:?}"),
    }
}

#[tokio::test]
async fn oldest_successful_run_is_evicted_over_limit() {
    let fx = Fixture::new("successfulHistoryLimit: 2\n");
    fx.seed([
        pipeline_run("build-t0", "build", 0, RunStatus::Succeeded),
        pipeline_run("build-t1", "build", 10, RunStatus::Succeeded),
        pipeline_run("build-t2", "build", 20, RunStatus::Succeeded),
    ]);

    let result = processed(
        fx.engine("replica-a")
            .process_event(&fx.current("build-t2"), &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(result.deleted, vec!["build-t0".to_string()]);
    assert_eq!(
        fx.store.names(NS),
        vec!["build-t1".to_string(), "build-t2".to_string()]
    );
}

#[tokio::test]
async fn unset_failed_limit_deletes_nothing() {
    let fx = Fixture::new("successfulHistoryLimit: 1\n");
    fx.seed((0..5).map(|i| pipeline_run(&format!("f{i}"), "build", i, RunStatus::Failed)));

    let result = processed(
        fx.engine("replica-a")
            .process_event(&fx.current("f4"), &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(result.skipped, Some(SkipReason::NoLimit));
    assert!(result.deleted.is_empty());
    assert_eq!(fx.store.names(NS).len(), 5);
    assert_eq!(fx.store.calls(StoreOp::Delete), 0);
}

#[tokio::test]
async fn zero_limit_deletes_every_completed_run_of_that_status() {
    let fx = Fixture::new("failedHistoryLimit: 0\n");
    fx.seed([
        pipeline_run("f0", "build", 0, RunStatus::Failed),
        pipeline_run("f1", "build", 1, RunStatus::Failed),
        pipeline_run("s0", "build", 2, RunStatus::Succeeded),
        ResourceRecord::new(ResourceKind::PipelineRun, NS, "running", at(3))
            .with_label(PIPELINE_LABEL, "build"),
    ]);

    let result = processed(
        fx.engine("replica-a")
            .process_event(&fx.current("f1"), &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(result.deleted, vec!["f0".to_string(), "f1".to_string()]);
    assert_eq!(
        fx.store.names(NS),
        vec!["running".to_string(), "s0".to_string()]
    );
}

#[tokio::test]
async fn cleanup_keeps_exactly_the_newest_runs() {
    for (count, limit) in [(1_i64, 0_u64), (4, 1), (6, 3), (7, 6)] {
        let fx = Fixture::new(&format!("successfulHistoryLimit: {limit}\n"));
        fx.seed((0..count).map(|i| pipeline_run(&format!("r{i}"), "build", i, RunStatus::Succeeded)));
        let newest = format!("r{}", count - 1);

        let result = processed(
            fx.engine("replica-a")
                .process_event(&fx.current(&newest), &CancellationToken::new())
                .await
                .unwrap(),
        );

        let excess = usize::try_from(count).unwrap() - usize::try_from(limit).unwrap();
        assert_eq!(result.deleted.len(), excess, "count={count} limit={limit}");

        let expected: Vec<String> = (count - i64::try_from(limit).unwrap()..count)
            .map(|i| format!("r{i}"))
            .collect();
        assert_eq!(fx.store.names(NS), expected, "count={count} limit={limit}");
    }
}

#[tokio::test]
async fn rerunning_on_retained_set_deletes_nothing() {
    let fx = Fixture::new("successfulHistoryLimit: 2\n");
    fx.seed((0..4).map(|i| pipeline_run(&format!("r{i}"), "build", i, RunStatus::Succeeded)));
    let engine = fx.engine("replica-a");

    processed(
        engine
            .process_event(&fx.current("r3"), &CancellationToken::new())
            .await
            .unwrap(),
    );

    // Same trigger again: marker short-circuits.
    let again = engine
        .process_event(&fx.current("r3"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again, ProcessOutcome::AlreadyProcessed);

    // A retained sibling without a marker: pass runs, nothing over the limit.
    let result = processed(
        engine
            .process_event(&fx.current("r2"), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert!(result.deleted.is_empty());
    assert_eq!(result.candidates, 2);
    assert_eq!(fx.store.deleted(), vec!["r0".to_string(), "r1".to_string()]);
}

#[tokio::test]
async fn workflows_are_counted_separately() {
    let fx = Fixture::new(
        r#"
successfulHistoryLimit: 3
namespaces:
  ci:
    pipelineRuns:
      - name: nightly
        successfulHistoryLimit: 1
"#,
    );
    fx.seed((0..3).map(|i| pipeline_run(&format!("build-{i}"), "build", i, RunStatus::Succeeded)));
    fx.seed((0..3).map(|i| pipeline_run(&format!("nightly-{i}"), "nightly", i, RunStatus::Succeeded)));
    let engine = fx.engine("replica-a");

    let build = processed(
        engine
            .process_event(&fx.current("build-2"), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(build.limit, Some(3));
    assert!(build.deleted.is_empty());

    let nightly = processed(
        engine
            .process_event(&fx.current("nightly-2"), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(nightly.limit, Some(1));
    assert_eq!(
        nightly.deleted,
        vec!["nightly-0".to_string(), "nightly-1".to_string()]
    );
}

#[tokio::test]
async fn concurrently_deleted_victim_is_tolerated() {
    let fx = Fixture::new("successfulHistoryLimit: 1\n");
    fx.seed((0..3).map(|i| pipeline_run(&format!("r{i}"), "build", i, RunStatus::Succeeded)));
    fx.store
        .fail_next(StoreOp::Delete, StoreError::not_found(NS, "r0"));

    let result = processed(
        fx.engine("replica-a")
            .process_event(&fx.current("r2"), &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(result.already_gone, 1);
    assert_eq!(result.deleted, vec!["r1".to_string()]);
    assert_eq!(fx.metrics.deletions(Operation::HistoryLimit), 1);
}

#[tokio::test]
async fn delete_error_aborts_the_remaining_batch() {
    let fx = Fixture::new("successfulHistoryLimit: 0\n");
    fx.seed((0..3).map(|i| pipeline_run(&format!("r{i}"), "build", i, RunStatus::Succeeded)));
    fx.store
        .fail_delete_of("r1", StoreError::Forbidden("rbac".to_string()));

    let err = fx
        .engine("replica-a")
        .process_event(&fx.current("r2"), &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        PruneError::Delete { name, source, .. } => {
            assert_eq!(name, "r1");
            assert_eq!(source.class(), "permission");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.store.deleted(), vec!["r0".to_string()]);
    assert!(fx.store.contains(NS, "r2"));
    assert!(fx.store.annotation(NS, "r2", LOCK_ANNOTATION).is_none());
    assert_eq!(fx.metrics.errors(), 1);
}

#[tokio::test]
async fn list_error_aborts_the_pass() {
    let fx = Fixture::new("successfulHistoryLimit: 0\n");
    fx.seed([pipeline_run("r0", "build", 0, RunStatus::Succeeded)]);
    fx.store
        .fail_next(StoreOp::List, StoreError::Timeout("list".to_string()));

    let err = fx
        .engine("replica-a")
        .process_event(&fx.current("r0"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PruneError::List { .. }));
    assert_eq!(err.class(), "timeout");
    assert!(fx.store.contains(NS, "r0"));
}

#[tokio::test]
async fn cancelled_pass_never_double_deletes_on_retry() {
    let fx = Fixture::new("successfulHistoryLimit: 2\n");
    fx.seed((0..5).map(|i| pipeline_run(&format!("r{i}"), "build", i, RunStatus::Succeeded)));
    let engine = fx.engine("replica-a");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .process_event(&fx.current("r4"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PruneError::Cancelled { deleted: 0 }));
    assert_eq!(fx.store.names(NS).len(), 5);
    assert!(fx.store.annotation(NS, "r4", LOCK_ANNOTATION).is_none());

    // The next sibling event re-lists and recomputes the excess.
    let result = processed(
        engine
            .process_event(&fx.current("r3"), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(
        result.deleted,
        vec!["r0".to_string(), "r1".to_string(), "r2".to_string()]
    );
    assert_eq!(
        fx.store.names(NS),
        vec!["r3".to_string(), "r4".to_string()]
    );
}

#[tokio::test]
async fn held_lock_skips_the_cycle() {
    let fx = Fixture::new("successfulHistoryLimit: 0\n");
    fx.seed([pipeline_run("r0", "build", 0, RunStatus::Succeeded)]);

    let other = ResourceLocker::new("replica-b", &LockConfig::default(), fx.clock.clone());
    assert!(other.try_lock(&fx.current("r0"), fx.store.as_ref()).await.unwrap());

    let engine = fx.engine("replica-a");
    let outcome = engine
        .process_event(&fx.current("r0"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::LockHeld);
    assert!(fx.store.contains(NS, "r0"));
    assert!(fx.store.annotation(NS, "r0", PROCESSED_ANNOTATION).is_none());

    // Once the holder's lock expires the next resync proceeds.
    fx.clock.advance(std::time::Duration::from_secs(5 * 60 + 1));
    let result = processed(
        engine
            .process_event(&fx.current("r0"), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(result.deleted, vec!["r0".to_string()]);
}

#[tokio::test]
async fn repeated_dry_run_deletions_are_counted_once() {
    let fx = Fixture::new("successfulHistoryLimit: 1\n");
    fx.seed((0..2).map(|i| pipeline_run(&format!("r{i}"), "build", i, RunStatus::Succeeded)));

    let a = fx.engine("replica-a").with_dry_run(true);
    let b = fx.engine("replica-b").with_dry_run(true);

    // Two replicas see events for different siblings; both would evict r0.
    let first = processed(
        a.process_event(&fx.current("r1"), &CancellationToken::new())
            .await
            .unwrap(),
    );
    let second = processed(
        b.process_event(&fx.current("r0"), &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(first.deleted, vec!["r0".to_string()]);
    assert_eq!(second.deleted, vec!["r0".to_string()]);
    assert_eq!(fx.metrics.deletions(Operation::HistoryLimit), 1);
    assert_eq!(fx.store.calls(StoreOp::Delete), 0);
}
