use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use super::Backend;
use crate::resources::{make_key, Manifest, Meta, ObjectKind, ResourceStatus};

/// A recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    Get(String),
    Create(String),
    Delete(String),
    Status(String, ResourceStatus),
}

impl BackendOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Get(key) | Self::Create(key) | Self::Delete(key) | Self::Status(key, _) => key,
        }
    }
}

/// Dry-run backend keeping objects in memory.
///
/// Readiness follows a per-key script; once a script is exhausted its last
/// entry repeats. Keys without a script are ready immediately.
#[derive(Default)]
pub struct InMemoryBackend {
    objects: DashMap<String, Manifest>,
    scripts: DashMap<String, VecDeque<ResourceStatus>>,
    create_failures: DashMap<String, String>,
    status_failures: DashMap<String, String>,
    create_delay: Mutex<Option<Duration>>,
    ops: Mutex<Vec<BackendOp>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an object, as if created by someone else
    pub fn insert_existing(&self, kind: ObjectKind, manifest: Manifest) {
        self.objects
            .insert(make_key(kind.tag(), manifest.name()), manifest);
    }

    /// Readiness answers for `key`, consumed one per status check
    pub fn script_status(&self, key: &str, statuses: Vec<ResourceStatus>) {
        self.scripts.insert(key.to_string(), statuses.into());
    }

    pub fn fail_create(&self, key: &str, message: &str) {
        self.create_failures
            .insert(key.to_string(), message.to_string());
    }

    pub fn fail_status(&self, key: &str, message: &str) {
        self.status_failures
            .insert(key.to_string(), message.to_string());
    }

    /// Make every create call take this long
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Manifest> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn operations(&self) -> Vec<BackendOp> {
        self.ops.lock().clone()
    }

    pub fn create_count(&self, key: &str) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, BackendOp::Create(k) if k == key))
            .count()
    }

    pub fn status_count(&self, key: &str) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, BackendOp::Status(k, _) if k == key))
            .count()
    }

    /// Position of the first recorded op matching `pred`
    pub fn position(&self, pred: impl Fn(&BackendOp) -> bool) -> Option<usize> {
        self.ops.lock().iter().position(|op| pred(op))
    }

    fn record(&self, op: BackendOp) {
        self.ops.lock().push(op);
    }

    fn next_status(&self, key: &str) -> ResourceStatus {
        match self.scripts.get_mut(key) {
            Some(mut script) => {
                if script.len() > 1 {
                    script.pop_front().unwrap_or(ResourceStatus::Ready)
                } else {
                    script.front().copied().unwrap_or(ResourceStatus::Ready)
                }
            }
            None => ResourceStatus::Ready,
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn get(&self, kind: ObjectKind, name: &str) -> anyhow::Result<Option<Manifest>> {
        let key = make_key(kind.tag(), name);
        self.record(BackendOp::Get(key.clone()));
        Ok(self.object(&key))
    }

    async fn create(&self, kind: ObjectKind, manifest: &Manifest) -> anyhow::Result<()> {
        let key = make_key(kind.tag(), manifest.name());
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(BackendOp::Create(key.clone()));

        if let Some(message) = self.create_failures.get(&key) {
            return Err(anyhow!("{}", message.value()));
        }
        if self.objects.contains_key(&key) {
            return Err(anyhow!("{} already exists", key));
        }
        self.objects.insert(key, manifest.clone());
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, name: &str) -> anyhow::Result<()> {
        let key = make_key(kind.tag(), name);
        self.record(BackendOp::Delete(key.clone()));
        self.objects
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("{} not found", key))
    }

    async fn readiness(
        &self,
        kind: ObjectKind,
        name: &str,
        _meta: &Meta,
    ) -> anyhow::Result<ResourceStatus> {
        let key = make_key(kind.tag(), name);
        if let Some(message) = self.status_failures.get(&key) {
            self.record(BackendOp::Status(key.clone(), ResourceStatus::Error));
            return Err(anyhow!("{}", message.value()));
        }
        if !self.objects.contains_key(&key) {
            self.record(BackendOp::Status(key.clone(), ResourceStatus::Error));
            return Err(anyhow!("{} not found", key));
        }
        let status = self.next_status(&key);
        self.record(BackendOp::Status(key, status));
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_readiness_repeats_last() {
        let backend = InMemoryBackend::new();
        let manifest = Manifest::new("db");
        backend.create(ObjectKind::StatefulSet, &manifest).await.unwrap();
        backend.script_status(
            "statefulset/db",
            vec![ResourceStatus::NotReady, ResourceStatus::Ready],
        );

        let meta = Meta::new();
        let first = backend.readiness(ObjectKind::StatefulSet, "db", &meta).await.unwrap();
        let second = backend.readiness(ObjectKind::StatefulSet, "db", &meta).await.unwrap();
        let third = backend.readiness(ObjectKind::StatefulSet, "db", &meta).await.unwrap();
        assert_eq!(first, ResourceStatus::NotReady);
        assert_eq!(second, ResourceStatus::Ready);
        assert_eq!(third, ResourceStatus::Ready);
        assert_eq!(backend.status_count("statefulset/db"), 3);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let backend = InMemoryBackend::new();
        let manifest = Manifest::new("web");
        backend.create(ObjectKind::Pod, &manifest).await.unwrap();
        assert!(backend.create(ObjectKind::Pod, &manifest).await.is_err());
        assert_eq!(backend.create_count("pod/web"), 2);
        assert_eq!(backend.object_count(), 1);
    }

    #[tokio::test]
    async fn test_readiness_of_missing_object_fails() {
        let backend = InMemoryBackend::new();
        assert!(backend
            .readiness(ObjectKind::Job, "ghost", &Meta::new())
            .await
            .is_err());
    }
}
