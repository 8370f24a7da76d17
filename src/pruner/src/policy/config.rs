//! Policy document structures.
//!
//! A policy document is YAML with a global block, a per-namespace override
//! map and per-workflow selectors inside each namespace block. Every numeric
//! field accepts either an integer or a numeric string (`"5"`).

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::resource::ResourceKind;

/// Which configuration layer is authoritative for a field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    Global,
    Namespace,
    #[default]
    Resource,
}

impl EnforcementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementLevel::Global => "global",
            EnforcementLevel::Namespace => "namespace",
            EnforcementLevel::Resource => "resource",
        }
    }
}

impl fmt::Display for EnforcementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy fields that resolve independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyField {
    TtlSecondsAfterFinished,
    SuccessfulHistoryLimit,
    FailedHistoryLimit,
    /// Combined limit across both statuses. Parsed and resolvable, never
    /// used for eviction.
    HistoryLimit,
}

impl PolicyField {
    pub const ALL: [PolicyField; 4] = [
        PolicyField::TtlSecondsAfterFinished,
        PolicyField::SuccessfulHistoryLimit,
        PolicyField::FailedHistoryLimit,
        PolicyField::HistoryLimit,
    ];

    /// Key of the field in the policy document.
    pub fn key(&self) -> &'static str {
        match self {
            PolicyField::TtlSecondsAfterFinished => "ttlSecondsAfterFinished",
            PolicyField::SuccessfulHistoryLimit => "successfulHistoryLimit",
            PolicyField::FailedHistoryLimit => "failedHistoryLimit",
            PolicyField::HistoryLimit => "historyLimit",
        }
    }
}

impl fmt::Display for PolicyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Settings that may appear at any layer. Absent means "not set here".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(
        default,
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl_seconds_after_finished: Option<i64>,

    #[serde(
        default,
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub successful_history_limit: Option<i64>,

    #[serde(
        default,
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub failed_history_limit: Option<i64>,

    #[serde(
        default,
        deserialize_with = "lenient_int",
        alias = "totalHistoryLimit",
        skip_serializing_if = "Option::is_none"
    )]
    pub history_limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced_config_level: Option<EnforcementLevel>,
}

impl PolicySpec {
    pub fn get(&self, field: PolicyField) -> Option<i64> {
        match field {
            PolicyField::TtlSecondsAfterFinished => self.ttl_seconds_after_finished,
            PolicyField::SuccessfulHistoryLimit => self.successful_history_limit,
            PolicyField::FailedHistoryLimit => self.failed_history_limit,
            PolicyField::HistoryLimit => self.history_limit,
        }
    }

    /// Reject negative values. `prefix` is the path of the enclosing block.
    pub fn validate(&self, prefix: &str) -> Result<(), PolicyError> {
        for field in PolicyField::ALL {
            match self.get(field) {
                Some(value) if value < 0 => {
                    return Err(PolicyError::NegativeValue {
                        path: join_path(prefix, field.key()),
                        value,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Override for one logical workflow, matched by exact name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawSelector")]
pub struct Selector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Reserved; not consulted during resolution.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Reserved; not consulted during resolution.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub match_annotations: BTreeMap<String, String>,

    #[serde(flatten)]
    pub policy: PolicySpec,
}

impl Selector {
    pub fn named(name: impl Into<String>, policy: PolicySpec) -> Self {
        Self {
            name: Some(name.into()),
            policy,
            ..Default::default()
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// Namespace-level policy with per-workflow selectors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawNamespacePolicy")]
pub struct NamespacePolicy {
    #[serde(flatten)]
    pub policy: PolicySpec,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pipeline_runs: Vec<Selector>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_runs: Vec<Selector>,
}

impl NamespacePolicy {
    /// Parse a standalone namespace-scoped document.
    pub fn from_yaml(raw: &str) -> Result<Self, PolicyError> {
        let policy: NamespacePolicy = parse_yaml(raw)?;
        policy.validate("")?;
        Ok(policy)
    }

    pub fn selectors(&self, kind: ResourceKind) -> &[Selector] {
        match kind {
            ResourceKind::PipelineRun => &self.pipeline_runs,
            ResourceKind::TaskRun => &self.task_runs,
        }
    }

    /// First selector whose name matches exactly.
    pub fn selector_for(&self, kind: ResourceKind, name: &str) -> Option<&Selector> {
        self.selectors(kind).iter().find(|s| s.matches_name(name))
    }

    pub fn validate(&self, prefix: &str) -> Result<(), PolicyError> {
        self.policy.validate(prefix)?;

        for (list, selectors) in [
            ("pipelineRuns", &self.pipeline_runs),
            ("taskRuns", &self.task_runs),
        ] {
            for (index, selector) in selectors.iter().enumerate() {
                let path = join_path(prefix, &format!("{list}[{index}]"));
                selector.policy.validate(&path)?;
            }
        }

        Ok(())
    }
}

/// Cluster-wide policy document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawGlobalPolicy")]
pub struct GlobalPolicy {
    #[serde(flatten)]
    pub policy: PolicySpec,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub namespaces: BTreeMap<String, NamespacePolicy>,
}

impl GlobalPolicy {
    /// Parse and validate a policy document. An empty document is an empty
    /// policy.
    pub fn from_yaml(raw: &str) -> Result<Self, PolicyError> {
        let policy: GlobalPolicy = parse_yaml(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.policy.validate("")?;

        for (namespace, namespace_policy) in &self.namespaces {
            namespace_policy.validate(&format!("namespaces.{namespace}"))?;
        }

        Ok(())
    }
}

/// Access to the [`PolicySpec`] carried by each layer.
pub trait PolicyOverride {
    fn policy(&self) -> &PolicySpec;
}

impl PolicyOverride for Selector {
    fn policy(&self) -> &PolicySpec {
        &self.policy
    }
}

impl PolicyOverride for NamespacePolicy {
    fn policy(&self) -> &PolicySpec {
        &self.policy
    }
}

impl PolicyOverride for GlobalPolicy {
    fn policy(&self) -> &PolicySpec {
        &self.policy
    }
}

// Wire shapes of the three layers. Policy fields must stay inline, not
// `#[serde(flatten)]`, for parse errors to carry the field path.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSelector {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    match_labels: BTreeMap<String, String>,
    #[serde(default)]
    match_annotations: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "lenient_int")]
    ttl_seconds_after_finished: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    successful_history_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    failed_history_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int", alias = "totalHistoryLimit")]
    history_limit: Option<i64>,
    #[serde(default)]
    enforced_config_level: Option<EnforcementLevel>,
}

impl From<RawSelector> for Selector {
    fn from(raw: RawSelector) -> Self {
        Self {
            name: raw.name,
            match_labels: raw.match_labels,
            match_annotations: raw.match_annotations,
            policy: PolicySpec {
                ttl_seconds_after_finished: raw.ttl_seconds_after_finished,
                successful_history_limit: raw.successful_history_limit,
                failed_history_limit: raw.failed_history_limit,
                history_limit: raw.history_limit,
                enforced_config_level: raw.enforced_config_level,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNamespacePolicy {
    #[serde(default, deserialize_with = "lenient_int")]
    ttl_seconds_after_finished: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    successful_history_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    failed_history_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int", alias = "totalHistoryLimit")]
    history_limit: Option<i64>,
    #[serde(default)]
    enforced_config_level: Option<EnforcementLevel>,

    #[serde(default, alias = "pipelineruns")]
    pipeline_runs: Vec<Selector>,
    #[serde(default, alias = "taskruns")]
    task_runs: Vec<Selector>,
}

impl From<RawNamespacePolicy> for NamespacePolicy {
    fn from(raw: RawNamespacePolicy) -> Self {
        Self {
            policy: PolicySpec {
                ttl_seconds_after_finished: raw.ttl_seconds_after_finished,
                successful_history_limit: raw.successful_history_limit,
                failed_history_limit: raw.failed_history_limit,
                history_limit: raw.history_limit,
                enforced_config_level: raw.enforced_config_level,
            },
            pipeline_runs: raw.pipeline_runs,
            task_runs: raw.task_runs,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGlobalPolicy {
    #[serde(default, deserialize_with = "lenient_int")]
    ttl_seconds_after_finished: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    successful_history_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    failed_history_limit: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int", alias = "totalHistoryLimit")]
    history_limit: Option<i64>,
    #[serde(default)]
    enforced_config_level: Option<EnforcementLevel>,

    #[serde(default)]
    namespaces: BTreeMap<String, NamespacePolicy>,
}

impl From<RawGlobalPolicy> for GlobalPolicy {
    fn from(raw: RawGlobalPolicy) -> Self {
        Self {
            policy: PolicySpec {
                ttl_seconds_after_finished: raw.ttl_seconds_after_finished,
                successful_history_limit: raw.successful_history_limit,
                failed_history_limit: raw.failed_history_limit,
                history_limit: raw.history_limit,
                enforced_config_level: raw.enforced_config_level,
            },
            namespaces: raw.namespaces,
        }
    }
}

/// Errors raised while loading a policy document.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// The document is not valid YAML or does not fit the policy shape.
    #[error("failed to parse policy document{}: {source}", at_path(.path))]
    Parse {
        path: Option<String>,
        #[source]
        source: serde_yaml::Error,
    },

    /// A limit or TTL is negative.
    #[error("invalid policy: {path} must be non-negative, got {value}")]
    NegativeValue { path: String, value: i64 },
}

impl PolicyError {
    /// Path of the offending field, when known.
    pub fn path(&self) -> Option<String> {
        match self {
            PolicyError::NegativeValue { path, .. } => Some(path.clone()),
            PolicyError::Parse { path, .. } => path.clone(),
        }
    }
}

fn at_path(path: &Option<String>) -> String {
    path.as_ref()
        .map(|path| format!(" at {path}"))
        .unwrap_or_default()
}

fn parse_yaml<T>(raw: &str) -> Result<T, PolicyError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if raw.trim().is_empty() {
        return Ok(T::default());
    }

    serde_path_to_error::deserialize(serde_yaml::Deserializer::from_str(raw)).map_err(|err| {
        let path = err.path().to_string();
        PolicyError::Parse {
            // "." is the document root, i.e. the error is not tied to a field.
            path: (path != ".").then_some(path),
            source: err.into_inner(),
        }
    })
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Int(value)) => Ok(Some(value)),
        Some(IntOrString::Str(raw)) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid integer value '{raw}'"))),
    }
}
