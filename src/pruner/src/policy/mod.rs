//! Layered pruning policy.
//!
//! This module provides:
//! - Policy document structures with lenient numeric parsing
//! - Field-path validation
//! - Effective-value resolution under an enforcement level

pub mod config;
pub mod resolver;

pub use config::{
    EnforcementLevel, GlobalPolicy, NamespacePolicy, PolicyError, PolicyField, PolicyOverride,
    PolicySpec, Selector,
};
pub use resolver::{ConfigResolver, PolicySnapshot, PolicySource, ResolvedValue};
