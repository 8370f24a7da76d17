//! Effective-value resolution across policy layers.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::{
    EnforcementLevel, GlobalPolicy, NamespacePolicy, PolicyError, PolicyField, PolicyOverride,
    PolicySpec,
};
use crate::resource::ResourceKind;

/// Layer a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    /// Selector in a namespace-scoped document.
    NamespaceSelector,
    /// Root of a namespace-scoped document.
    Namespace,
    /// Selector under `namespaces.<ns>` in the global document.
    GlobalNamespaceSelector,
    /// `namespaces.<ns>` block of the global document.
    GlobalNamespace,
    /// Root of the global document.
    Global,
    /// Nothing set; built-in default applies.
    Default,
}

impl PolicySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicySource::NamespaceSelector => "namespace_selector",
            PolicySource::Namespace => "namespace",
            PolicySource::GlobalNamespaceSelector => "global_namespace_selector",
            PolicySource::GlobalNamespace => "global_namespace",
            PolicySource::Global => "global",
            PolicySource::Default => "default",
        }
    }
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field value together with the level used and the layer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedValue {
    pub value: u64,
    pub level: EnforcementLevel,
    pub source: PolicySource,
}

/// Immutable view of every loaded policy document.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub global: GlobalPolicy,
    pub namespaces: BTreeMap<String, NamespacePolicy>,
}

const RESOURCE_CHAIN: &[PolicySource] = &[
    PolicySource::NamespaceSelector,
    PolicySource::Namespace,
    PolicySource::GlobalNamespaceSelector,
    PolicySource::GlobalNamespace,
    PolicySource::Global,
];

const NAMESPACE_CHAIN: &[PolicySource] = &[
    PolicySource::Namespace,
    PolicySource::GlobalNamespace,
    PolicySource::Global,
];

const GLOBAL_CHAIN: &[PolicySource] = &[
    PolicySource::GlobalNamespaceSelector,
    PolicySource::GlobalNamespace,
    PolicySource::Global,
];

/// The global document is consulted first so a namespace document cannot
/// lift a level set by the cluster operator.
const ENFORCEMENT_CHAIN: &[PolicySource] = &[
    PolicySource::GlobalNamespaceSelector,
    PolicySource::GlobalNamespace,
    PolicySource::Global,
    PolicySource::NamespaceSelector,
    PolicySource::Namespace,
];

fn field_chain(level: EnforcementLevel) -> &'static [PolicySource] {
    match level {
        EnforcementLevel::Resource => RESOURCE_CHAIN,
        EnforcementLevel::Namespace => NAMESPACE_CHAIN,
        EnforcementLevel::Global => GLOBAL_CHAIN,
    }
}

impl PolicySnapshot {
    /// Policy block of one layer for the given run, if that layer exists.
    pub fn layer(
        &self,
        source: PolicySource,
        namespace: &str,
        name: &str,
        kind: ResourceKind,
    ) -> Option<&PolicySpec> {
        match source {
            PolicySource::NamespaceSelector => self
                .namespaces
                .get(namespace)
                .and_then(|ns| ns.selector_for(kind, name))
                .map(PolicyOverride::policy),
            PolicySource::Namespace => self.namespaces.get(namespace).map(PolicyOverride::policy),
            PolicySource::GlobalNamespaceSelector => self
                .global
                .namespaces
                .get(namespace)
                .and_then(|ns| ns.selector_for(kind, name))
                .map(PolicyOverride::policy),
            PolicySource::GlobalNamespace => self
                .global
                .namespaces
                .get(namespace)
                .map(PolicyOverride::policy),
            PolicySource::Global => Some(self.global.policy()),
            PolicySource::Default => None,
        }
    }

    pub fn enforcement_level(
        &self,
        namespace: &str,
        name: &str,
        kind: ResourceKind,
    ) -> (EnforcementLevel, PolicySource) {
        ENFORCEMENT_CHAIN
            .iter()
            .find_map(|&source| {
                self.layer(source, namespace, name, kind)
                    .and_then(|spec| spec.enforced_config_level)
                    .map(|level| (level, source))
            })
            .unwrap_or((EnforcementLevel::default(), PolicySource::Default))
    }

    /// First layer in the level's chain that sets `field`.
    pub fn field_at_level(
        &self,
        namespace: &str,
        name: &str,
        kind: ResourceKind,
        field: PolicyField,
        level: EnforcementLevel,
    ) -> Option<(u64, PolicySource)> {
        field_chain(level).iter().find_map(|&source| {
            self.layer(source, namespace, name, kind)
                .and_then(|spec| spec.get(field))
                .and_then(|value| u64::try_from(value).ok())
                .map(|value| (value, source))
        })
    }
}

/// Holds the active policy and answers effective-value queries.
///
/// Shared by `Arc`; reloads swap the whole snapshot so readers never observe
/// a half-applied document.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and install the global policy document.
    ///
    /// On error the previously active policy is kept.
    pub fn load_global(&self, raw: &str) -> Result<(), PolicyError> {
        let global = GlobalPolicy::from_yaml(raw).inspect_err(|e| {
            warn!(error = %e, "Rejected global policy document, keeping previous policy");
        })?;

        let namespace_overrides = global.namespaces.len();
        let mut current = self.current.write();
        *current = Arc::new(PolicySnapshot {
            global,
            namespaces: current.namespaces.clone(),
        });
        drop(current);

        info!(namespace_overrides, "Loaded global policy");
        Ok(())
    }

    /// Parse and install the namespace-scoped document for `namespace`.
    pub fn load_namespace(&self, namespace: &str, raw: &str) -> Result<(), PolicyError> {
        let policy = NamespacePolicy::from_yaml(raw).inspect_err(|e| {
            warn!(namespace, error = %e, "Rejected namespace policy document");
        })?;

        let mut current = self.current.write();
        let mut namespaces = current.namespaces.clone();
        namespaces.insert(namespace.to_string(), policy);
        *current = Arc::new(PolicySnapshot {
            global: current.global.clone(),
            namespaces,
        });
        drop(current);

        info!(namespace, "Loaded namespace policy");
        Ok(())
    }

    /// Drop the namespace-scoped document. Returns whether one was loaded.
    pub fn remove_namespace(&self, namespace: &str) -> bool {
        let mut current = self.current.write();
        if !current.namespaces.contains_key(namespace) {
            return false;
        }

        let mut namespaces = current.namespaces.clone();
        namespaces.remove(namespace);
        *current = Arc::new(PolicySnapshot {
            global: current.global.clone(),
            namespaces,
        });
        drop(current);

        debug!(namespace, "Removed namespace policy");
        true
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    pub fn enforcement_level(&self, namespace: &str, name: &str, kind: ResourceKind) -> EnforcementLevel {
        self.snapshot().enforcement_level(namespace, name, kind).0
    }

    /// Effective value of `field` under an explicit enforcement level.
    /// `None` means unset at every applicable layer.
    pub fn effective_field(
        &self,
        namespace: &str,
        name: &str,
        kind: ResourceKind,
        field: PolicyField,
        level: EnforcementLevel,
    ) -> Option<u64> {
        self.snapshot()
            .field_at_level(namespace, name, kind, field, level)
            .map(|(value, _)| value)
    }

    /// Resolve the enforcement level and then `field`, from one snapshot.
    pub fn resolve(
        &self,
        namespace: &str,
        name: &str,
        kind: ResourceKind,
        field: PolicyField,
    ) -> Option<ResolvedValue> {
        let snapshot = self.snapshot();
        let (level, _) = snapshot.enforcement_level(namespace, name, kind);
        snapshot
            .field_at_level(namespace, name, kind, field, level)
            .map(|(value, source)| ResolvedValue {
                value,
                level,
                source,
            })
    }
}
