//! Resource store capability set.
//!
//! The surrounding controller implements [`ResourceStore`] once per resource
//! kind (typically on top of a Kubernetes client). Annotation writes are sent
//! as JSON merge patches on `metadata.annotations`.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

use crate::resource::{ResourceKind, ResourceRecord};

/// Equality selector on a single label, rendered as `key=value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &ResourceRecord) -> bool {
        record.labels.get(&self.key) == Some(&self.value)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Errors surfaced by a resource store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// Optimistic-concurrency precondition failed.
    #[error("conflict updating {namespace}/{name}: {message}")]
    Conflict {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn not_found(namespace: &str, name: &str) -> Self {
        StoreError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Coarse error class used as a metrics label.
    pub fn class(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Timeout(_) => "timeout",
            StoreError::Forbidden(_) => "permission",
            StoreError::Unavailable(_) => "api_error",
            StoreError::InvalidPatch(_) => "validation",
            StoreError::Other(_) => "internal",
        }
    }
}

/// Operations the core needs from the store for one resource kind.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceRecord, StoreError>;

    async fn update(&self, resource: &ResourceRecord) -> Result<(), StoreError>;

    /// Apply a JSON merge patch.
    async fn patch(&self, namespace: &str, name: &str, patch: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ResourceRecord>, StoreError>;
}

/// Build a merge patch setting (`Some`) or clearing (`None`) one annotation.
///
/// When `resource_version` is given it is included as `metadata.resourceVersion`,
/// which makes the patch conditional on the object not having changed.
pub fn annotation_patch(key: &str, value: Option<&str>, resource_version: Option<&str>) -> Vec<u8> {
    let mut annotations = Map::new();
    annotations.insert(
        key.to_string(),
        value.map_or(Value::Null, |v| Value::String(v.to_string())),
    );

    let mut metadata = Map::new();
    metadata.insert("annotations".to_string(), Value::Object(annotations));
    if let Some(version) = resource_version {
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(version.to_string()),
        );
    }

    json!({ "metadata": metadata }).to_string().into_bytes()
}

/// Decoded form of the annotation merge patches the core emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationPatch {
    /// `None` values remove the annotation.
    pub annotations: Vec<(String, Option<String>)>,
    pub resource_version: Option<String>,
}

impl AnnotationPatch {
    /// Parse a merge patch restricted to `metadata.annotations` and
    /// `metadata.resourceVersion`.
    pub fn parse(patch: &[u8]) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_slice(patch)
            .map_err(|e| StoreError::InvalidPatch(e.to_string()))?;

        let metadata = value
            .get("metadata")
            .and_then(Value::as_object)
            .ok_or_else(|| StoreError::InvalidPatch("missing metadata object".to_string()))?;

        let mut annotations = Vec::new();
        if let Some(entries) = metadata.get("annotations") {
            let entries = entries.as_object().ok_or_else(|| {
                StoreError::InvalidPatch("metadata.annotations must be an object".to_string())
            })?;
            for (key, value) in entries {
                let value = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => {
                        return Err(StoreError::InvalidPatch(format!(
                            "annotation '{key}' must be a string or null, got {other}"
                        )));
                    }
                };
                annotations.push((key.clone(), value));
            }
        }

        let resource_version = metadata
            .get("resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            annotations,
            resource_version,
        })
    }

    pub fn apply(&self, record: &mut ResourceRecord) {
        for (key, value) in &self.annotations {
            match value {
                Some(value) => {
                    record.annotations.insert(key.clone(), value.clone());
                }
                None => {
                    record.annotations.remove(key);
                }
            }
        }
    }
}
