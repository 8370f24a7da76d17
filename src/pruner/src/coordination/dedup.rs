//! Short-window de-duplication of deletion and processing events.
//!
//! Several replicas (or repeated informer events) can observe the same
//! deletion. The de-duplicator lets the engine report each one once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::config::DedupConfig;

use crate::clock::Clock;
use crate::resource::ResourceKind;

#[derive(Debug)]
pub struct DeletionDeduplicator {
    window: chrono::Duration,
    retention: chrono::Duration,
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl DeletionDeduplicator {
    pub fn new(config: &DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: to_chrono(config.window),
            retention: to_chrono(config.retention),
            sweep_interval: config.sweep_interval,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a deletion. Returns `false` when the same resource was
    /// recorded within the window.
    pub fn record_deletion(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        self.record(format!("{kind}/{namespace}/{name}"))
    }

    /// Same as [`record_deletion`](Self::record_deletion) in a separate key
    /// space, for "processed" events.
    pub fn record_processed(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        self.record(format!("processed-{kind}/{namespace}/{name}"))
    }

    fn record(&self, key: String) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(seen) = entries.get(&key) {
            if now.signed_duration_since(*seen) < self.window {
                return false;
            }
        }

        entries.insert(key, now);
        true
    }

    /// Evict entries older than the retention window. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen| now.signed_duration_since(*seen) <= self.retention);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Configured interval between background sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Deletion de-duplicator sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "Swept de-duplication entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;
    use chrono::TimeZone;

    const KIND: ResourceKind = ResourceKind::TaskRun;

    fn setup() -> (Arc<ManualClock>, Arc<DeletionDeduplicator>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let dedup = Arc::new(DeletionDeduplicator::new(&DedupConfig::default(), clock.clone()));
        (clock, dedup)
    }

    #[test]
    fn test_duplicate_within_window() {
        let (clock, dedup) = setup();

        assert!(dedup.record_deletion(KIND, "ns", "a"));
        assert!(!dedup.record_deletion(KIND, "ns", "a"));
        assert!(dedup.record_deletion(KIND, "ns", "b"));
        assert!(dedup.record_deletion(ResourceKind::PipelineRun, "ns", "a"));

        clock.advance(Duration::from_secs(59));
        assert!(!dedup.record_deletion(KIND, "ns", "a"));

        clock.advance(Duration::from_secs(60));
        assert!(dedup.record_deletion(KIND, "ns", "a"));
    }

    #[test]
    fn test_processed_keys_are_separate() {
        let (_clock, dedup) = setup();

        assert!(dedup.record_deletion(KIND, "ns", "a"));
        assert!(dedup.record_processed(KIND, "ns", "a"));
        assert!(!dedup.record_processed(KIND, "ns", "a"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_sweep_evicts_old_entries() {
        let (clock, dedup) = setup();

        dedup.record_deletion(KIND, "ns", "old");
        clock.advance(Duration::from_secs(6 * 60));
        dedup.record_deletion(KIND, "ns", "new");

        assert_eq!(dedup.sweep(), 0);
        clock.advance(Duration::from_secs(5 * 60));
        assert_eq!(dedup.sweep(), 1);
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let (clock, dedup) = setup();
        dedup.record_deletion(KIND, "ns", "a");
        clock.advance(Duration::from_secs(11 * 60));

        let cancel = CancellationToken::new();
        let handle = dedup
            .clone()
            .spawn_sweeper(Duration::from_secs(300), cancel.clone());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(dedup.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
