//! Retention enforcement for completed runs.
//!
//! This module provides:
//! - History-limit eviction per workflow and terminal status
//! - TTL-based expiry with requeue hints
//! - Dry-run mode for auditing a policy

pub mod enforcer;
pub mod ttl;

pub use enforcer::{CleanupResult, ProcessOutcome, PruneError, RetentionEngine, TtlOutcome};
pub use ttl::{TtlDecision, TtlEvaluator};
