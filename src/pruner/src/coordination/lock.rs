//! Advisory processing lock stored in a resource annotation.
//!
//! The lock is cooperative: every replica writes its identity and the
//! acquisition time into [`LOCK_ANNOTATION`] and backs off while another
//! live holder is present. A holder that crashed is superseded once the
//! lock is older than the configured timeout.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use common::config::LockConfig;

use crate::clock::Clock;
use crate::resource::{LOCK_ANNOTATION, ResourceRecord};
use crate::store::{ResourceStore, StoreError, annotation_patch};

/// Decoded lock annotation value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub owner_id: String,
    /// Unix seconds.
    pub acquired_at: i64,
}

impl LockRecord {
    pub fn new(owner_id: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            acquired_at: acquired_at.timestamp(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::json!({
            "ownerId": self.owner_id,
            "acquiredAt": self.acquired_at,
        })
        .to_string()
    }

    /// Decode a lock value. Accepts the JSON form and the legacy
    /// `owner:unix_seconds` form; in the latter the owner may contain ':'.
    pub fn decode(raw: &str) -> Option<Self> {
        if let Ok(record) = serde_json::from_str::<LockRecord>(raw) {
            return Some(record);
        }

        let (owner, ts) = raw.rsplit_once(':')?;
        if owner.is_empty() {
            return None;
        }
        let acquired_at = ts.trim().parse::<i64>().ok()?;
        Some(Self {
            owner_id: owner.to_string(),
            acquired_at,
        })
    }

    pub fn acquired_at_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.acquired_at, 0).single()
    }

    /// A lock is expired once strictly more than `timeout` has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Some(acquired) = self.acquired_at_time() else {
            return true;
        };
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(acquired) > timeout
    }
}

/// Acquires and releases the advisory lock on behalf of one replica.
#[derive(Debug, Clone)]
pub struct ResourceLocker {
    owner_id: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ResourceLocker {
    pub fn new(owner_id: impl Into<String>, config: &LockConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            owner_id: owner_id.into(),
            timeout: config.timeout,
            clock,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Current lock on `resource`, if any parses.
    pub fn current_lock(resource: &ResourceRecord) -> Option<LockRecord> {
        resource
            .annotations
            .get(LOCK_ANNOTATION)
            .and_then(|raw| LockRecord::decode(raw))
    }

    fn is_ours(&self, lock: &LockRecord) -> bool {
        lock.owner_id == self.owner_id
    }

    /// Try to take the lock on `resource`.
    ///
    /// Returns `Ok(false)` when another live holder owns it or a concurrent
    /// writer won the race.
    pub async fn try_lock(
        &self,
        resource: &ResourceRecord,
        store: &dyn ResourceStore,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let current = store.get(&resource.namespace, &resource.name).await?;

        match current.annotations.get(LOCK_ANNOTATION) {
            None => {}
            Some(raw) => match LockRecord::decode(raw) {
                Some(lock) if self.is_ours(&lock) => {}
                Some(lock) if lock.is_expired(now, self.timeout) => {
                    debug!(
                        resource = %resource.display(),
                        previous_owner = %lock.owner_id,
                        "Taking over expired processing lock"
                    );
                }
                Some(lock) => {
                    debug!(
                        resource = %resource.display(),
                        owner = %lock.owner_id,
                        "Processing lock held by another instance"
                    );
                    return Ok(false);
                }
                None => {
                    warn!(
                        resource = %resource.display(),
                        value = %raw,
                        "Replacing unreadable processing lock"
                    );
                }
            },
        }

        let record = LockRecord::new(self.owner_id.clone(), now);
        let patch = annotation_patch(
            LOCK_ANNOTATION,
            Some(&record.encode()),
            current.resource_version.as_deref(),
        );

        match store.patch(&resource.namespace, &resource.name, &patch).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(resource = %resource.display(), "Lost processing lock race");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        // Another writer may have patched without a precondition in between.
        let verified = store.get(&resource.namespace, &resource.name).await?;
        let acquired = Self::current_lock(&verified).as_ref() == Some(&record);
        if acquired {
            debug!(resource = %resource.display(), owner = %self.owner_id, "Acquired processing lock");
        }
        Ok(acquired)
    }

    /// Clear the lock if this instance still owns it.
    pub async fn release_lock(
        &self,
        resource: &ResourceRecord,
        store: &dyn ResourceStore,
    ) -> Result<(), StoreError> {
        let current = match store.get(&resource.namespace, &resource.name).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        match Self::current_lock(&current) {
            Some(lock) if self.is_ours(&lock) => {}
            _ => return Ok(()),
        }

        let patch = annotation_patch(LOCK_ANNOTATION, None, current.resource_version.as_deref());
        match store.patch(&resource.namespace, &resource.name, &patch).await {
            Ok(()) => {
                debug!(resource = %resource.display(), "Released processing lock");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
