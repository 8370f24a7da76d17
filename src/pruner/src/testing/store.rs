use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::resource::{ResourceKind, ResourceRecord};
use crate::store::{AnnotationPatch, LabelSelector, ResourceStore, StoreError};

/// Store operation targeted by injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Update,
    Patch,
    Delete,
    List,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<(String, String), ResourceRecord>,
    next_version: u64,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    delete_failures: HashMap<String, StoreError>,
    patch_failures: HashMap<String, StoreError>,
    deleted: Vec<String>,
    calls: HashMap<StoreOp, usize>,
}

impl Inner {
    fn bump(&mut self, record: &mut ResourceRecord) {
        self.next_version += 1;
        record.resource_version = Some(self.next_version.to_string());
    }

    fn take_failure(&mut self, op: StoreOp) -> Option<StoreError> {
        *self.calls.entry(op).or_default() += 1;
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

/// In-memory [`ResourceStore`] with optimistic concurrency and failure
/// injection.
#[derive(Debug)]
pub struct InMemoryStore {
    kind: ResourceKind,
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert or replace a resource, assigning a fresh resource version.
    pub fn insert(&self, mut record: ResourceRecord) {
        let mut inner = self.inner.lock();
        inner.bump(&mut record);
        inner
            .resources
            .insert((record.namespace.clone(), record.name.clone()), record);
    }

    /// Remove a resource without recording a deletion, as another actor
    /// would.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<ResourceRecord> {
        self.inner
            .lock()
            .resources
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Fail the next call of `op` with `error`. Queued errors are consumed
    /// in order.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.inner
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail every delete of `name` with `error`.
    pub fn fail_delete_of(&self, name: &str, error: StoreError) {
        self.inner
            .lock()
            .delete_failures
            .insert(name.to_string(), error);
    }

    /// Fail every patch that touches annotation `key` with `error`.
    pub fn fail_patch_of(&self, key: &str, error: StoreError) {
        self.inner
            .lock()
            .patch_failures
            .insert(key.to_string(), error);
    }

    pub fn get_record(&self, namespace: &str, name: &str) -> Option<ResourceRecord> {
        self.inner
            .lock()
            .resources
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.get_record(namespace, name).is_some()
    }

    pub fn annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.get_record(namespace, name)
            .and_then(|r| r.annotations.get(key).cloned())
    }

    /// Names in `namespace`, sorted.
    pub fn names(&self, namespace: &str) -> Vec<String> {
        self.inner
            .lock()
            .resources
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Names deleted through the store, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().deleted.clone()
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<ResourceRecord, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure(StoreOp::Get) {
            return Err(err);
        }
        inner
            .resources
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(namespace, name))
    }

    async fn update(&self, resource: &ResourceRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure(StoreOp::Update) {
            return Err(err);
        }

        let k = key(&resource.namespace, &resource.name);
        let current = inner
            .resources
            .get(&k)
            .ok_or_else(|| StoreError::not_found(&resource.namespace, &resource.name))?;
        if resource.resource_version.is_some() && resource.resource_version != current.resource_version
        {
            return Err(StoreError::Conflict {
                namespace: resource.namespace.clone(),
                name: resource.name.clone(),
                message: "resource version mismatch".to_string(),
            });
        }

        let mut updated = resource.clone();
        inner.bump(&mut updated);
        inner.resources.insert(k, updated);
        Ok(())
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure(StoreOp::Patch) {
            return Err(err);
        }

        let patch = AnnotationPatch::parse(patch)?;
        if let Some(err) = patch
            .annotations
            .iter()
            .find_map(|(key, _)| inner.patch_failures.get(key))
        {
            return Err(err.clone());
        }
        let k = key(namespace, name);
        let mut record = inner
            .resources
            .get(&k)
            .cloned()
            .ok_or_else(|| StoreError::not_found(namespace, name))?;

        if patch.resource_version.is_some() && patch.resource_version != record.resource_version {
            return Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: "resource version mismatch".to_string(),
            });
        }

        patch.apply(&mut record);
        inner.bump(&mut record);
        inner.resources.insert(k, record);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure(StoreOp::Delete) {
            return Err(err);
        }
        if let Some(err) = inner.delete_failures.get(name) {
            return Err(err.clone());
        }

        inner
            .resources
            .remove(&key(namespace, name))
            .ok_or_else(|| StoreError::not_found(namespace, name))?;
        inner.deleted.push(name.to_string());
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ResourceRecord>, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_failure(StoreOp::List) {
            return Err(err);
        }
        Ok(inner
            .resources
            .values()
            .filter(|r| r.namespace == namespace && selector.matches(r))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::PIPELINE_LABEL;
    use crate::store::annotation_patch;
    use chrono::Utc;

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord::new(ResourceKind::PipelineRun, "ns", name, Utc::now())
            .with_label(PIPELINE_LABEL, "build")
    }

    #[tokio::test]
    async fn test_patch_precondition() {
        let store = InMemoryStore::new(ResourceKind::PipelineRun);
        store.insert(record("a"));
        let version = store.get_record("ns", "a").unwrap().resource_version;

        let patch = annotation_patch("k", Some("v"), version.as_deref());
        store.patch("ns", "a", &patch).await.unwrap();
        assert_eq!(store.annotation("ns", "a", "k").as_deref(), Some("v"));

        // Same precondition is now stale.
        let err = store.patch("ns", "a", &patch).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_label() {
        let store = InMemoryStore::new(ResourceKind::PipelineRun);
        store.insert(record("a"));
        store.insert(record("b").with_label(PIPELINE_LABEL, "deploy"));
        store.insert(ResourceRecord {
            namespace: "other".to_string(),
            ..record("c")
        });

        let listed = store
            .list("ns", &LabelSelector::new(PIPELINE_LABEL, "build"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = InMemoryStore::new(ResourceKind::PipelineRun);
        store.insert(record("a"));
        store.fail_next(StoreOp::Delete, StoreError::Timeout("slow".to_string()));

        assert_eq!(store.delete("ns", "a").await.unwrap_err().class(), "timeout");
        store.delete("ns", "a").await.unwrap();
        assert!(store.delete("ns", "a").await.unwrap_err().is_not_found());
        assert_eq!(store.deleted(), vec!["a".to_string()]);
        assert_eq!(store.calls(StoreOp::Delete), 3);
    }
}
