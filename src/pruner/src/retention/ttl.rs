//! Time-based expiry of completed runs.
//!
//! Pure decision logic; the caller supplies the effective TTL and the
//! retention engine acts on the result.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::clock::Clock;
use crate::resource::ResourceRecord;

/// Outcome of evaluating one resource against its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlDecision {
    NotCompleted,
    /// No TTL configured; the resource never expires.
    NoTtl,
    Expired,
    /// Not yet expired; check again at `check_at`.
    Pending { check_at: DateTime<Utc> },
}

/// Instant at which `resource` expires: completion time plus `ttl` seconds.
pub fn next_check_at(resource: &ResourceRecord, ttl_seconds: Option<u64>) -> Option<DateTime<Utc>> {
    let completed_at = resource.completed_at.filter(|_| resource.is_completed())?;
    let ttl = i64::try_from(ttl_seconds?).ok()?;
    completed_at.checked_add_signed(chrono::Duration::try_seconds(ttl)?)
}

pub fn is_expired_at(resource: &ResourceRecord, ttl_seconds: Option<u64>, now: DateTime<Utc>) -> bool {
    next_check_at(resource, ttl_seconds).is_some_and(|deadline| now >= deadline)
}

pub fn evaluate_at(
    resource: &ResourceRecord,
    ttl_seconds: Option<u64>,
    now: DateTime<Utc>,
) -> TtlDecision {
    if !resource.is_completed() {
        return TtlDecision::NotCompleted;
    }
    if ttl_seconds.is_none() {
        return TtlDecision::NoTtl;
    }

    match next_check_at(resource, ttl_seconds) {
        Some(deadline) if now >= deadline => TtlDecision::Expired,
        Some(deadline) => TtlDecision::Pending { check_at: deadline },
        // Deadline beyond the representable range.
        None => TtlDecision::NoTtl,
    }
}

/// TTL evaluation against an injected clock.
#[derive(Debug, Clone)]
pub struct TtlEvaluator {
    clock: Arc<dyn Clock>,
}

impl TtlEvaluator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn is_expired(&self, resource: &ResourceRecord, ttl_seconds: Option<u64>) -> bool {
        is_expired_at(resource, ttl_seconds, self.clock.now())
    }

    pub fn next_check_at(
        &self,
        resource: &ResourceRecord,
        ttl_seconds: Option<u64>,
    ) -> Option<DateTime<Utc>> {
        next_check_at(resource, ttl_seconds)
    }

    pub fn evaluate(&self, resource: &ResourceRecord, ttl_seconds: Option<u64>) -> TtlDecision {
        evaluate_at(resource, ttl_seconds, self.clock.now())
    }
}
