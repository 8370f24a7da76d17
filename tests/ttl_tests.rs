use chrono::{DateTime, TimeZone, Utc};
use common::config::{DedupConfig, LockConfig};
use pruner::resource::TASK_LABEL;
use pruner::testing::{InMemoryStore, ManualClock, StoreOp};
use pruner::{
    ConfigResolver, DeletionDeduplicator, PruneError, ResourceKind, ResourceLocker,
    ResourceRecord, RetentionEngine, RunStatus, TtlOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn task_run(namespace: &str, name: &str, task: &str, completed: i64) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::TaskRun, namespace, name, at(completed - 10))
        .with_label(TASK_LABEL, task)
        .completed(RunStatus::Succeeded, at(completed))
}

fn engine(
    resolver: Arc<ConfigResolver>,
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
) -> RetentionEngine {
    RetentionEngine::new(
        store,
        resolver,
        ResourceLocker::new("replica-a", &LockConfig::default(), clock.clone()),
        Arc::new(DeletionDeduplicator::new(&DedupConfig::default(), clock.clone())),
    )
    .with_clock(clock)
}

#[tokio::test]
async fn namespace_document_selector_sets_resource_ttl() {
    let resolver = Arc::new(ConfigResolver::new());
    resolver.load_global("ttlSecondsAfterFinished: 3600\n").unwrap();
    resolver
        .load_namespace(
            "team-a",
            r#"
taskRuns:
  - name: lint
    ttlSecondsAfterFinished: 60
"#,
        )
        .unwrap();

    let clock = Arc::new(ManualClock::new(at(1_000)));
    let store = Arc::new(InMemoryStore::new(ResourceKind::TaskRun));
    let lint = task_run("team-a", "lint-1", "lint", 900);
    let build = task_run("team-a", "build-1", "build", 900);
    store.insert(lint.clone());
    store.insert(build.clone());

    let engine = engine(resolver, store.clone(), clock);
    let cancel = CancellationToken::new();

    assert_eq!(
        engine.process_ttl(&lint, &cancel).await.unwrap(),
        TtlOutcome::Deleted
    );
    assert_eq!(
        engine.process_ttl(&build, &cancel).await.unwrap(),
        TtlOutcome::Requeue { at: at(4_500) }
    );
    assert_eq!(store.names("team-a"), vec!["build-1".to_string()]);
}

#[tokio::test]
async fn ttl_dry_run_keeps_resource_and_releases_lock() {
    let resolver = Arc::new(ConfigResolver::new());
    resolver.load_global("ttlSecondsAfterFinished: 0\n").unwrap();
    let clock = Arc::new(ManualClock::new(at(1_000)));
    let store = Arc::new(InMemoryStore::new(ResourceKind::TaskRun));
    let run = task_run("ns", "r", "lint", 900);
    store.insert(run.clone());

    let engine = engine(resolver, store.clone(), clock).with_dry_run(true);
    let cancel = CancellationToken::new();

    assert_eq!(engine.process_ttl(&run, &cancel).await.unwrap(), TtlOutcome::Deleted);
    assert!(store.contains("ns", "r"));
    assert_eq!(store.calls(StoreOp::Delete), 0);

    // Lock was released, so a second pass can take it again.
    assert_eq!(engine.process_ttl(&run, &cancel).await.unwrap(), TtlOutcome::Deleted);
}

#[tokio::test]
async fn ttl_respects_cancellation_and_lock_holders() {
    let resolver = Arc::new(ConfigResolver::new());
    resolver.load_global("ttlSecondsAfterFinished: 10\n").unwrap();
    let clock = Arc::new(ManualClock::new(at(1_000)));
    let store = Arc::new(InMemoryStore::new(ResourceKind::TaskRun));
    let run = task_run("ns", "r", "lint", 900);
    store.insert(run.clone());

    let engine = engine(resolver, store.clone(), clock.clone());

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(matches!(
        engine.process_ttl(&run, &cancelled).await,
        Err(PruneError::Cancelled { deleted: 0 })
    ));

    let other = ResourceLocker::new("replica-b", &LockConfig::default(), clock.clone());
    assert!(other.try_lock(&run, store.as_ref()).await.unwrap());
    assert_eq!(
        engine.process_ttl(&run, &CancellationToken::new()).await.unwrap(),
        TtlOutcome::LockHeld
    );

    clock.advance(Duration::from_secs(301));
    assert_eq!(
        engine.process_ttl(&run, &CancellationToken::new()).await.unwrap(),
        TtlOutcome::Deleted
    );
}
