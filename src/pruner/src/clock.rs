//! Time source abstraction.
//!
//! Lock expiry, TTL evaluation and de-duplication windows all compare
//! against "now"; injecting the clock keeps those decisions deterministic
//! under test.

use chrono::{DateTime, Utc};
use std::fmt;

pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
