//! Client seam to the managed system.
//!
//! The engine never constructs a backend; one is injected into the
//! scheduler and handed to every object resource it builds.

use async_trait::async_trait;

use crate::resources::{Manifest, Meta, ObjectKind, ResourceStatus};

pub mod memory;

pub use memory::{BackendOp, InMemoryBackend};

/// Operations a managed system must offer for object resources
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, kind: ObjectKind, name: &str) -> anyhow::Result<Option<Manifest>>;

    async fn create(&self, kind: ObjectKind, manifest: &Manifest) -> anyhow::Result<()>;

    async fn delete(&self, kind: ObjectKind, name: &str) -> anyhow::Result<()>;

    /// Current readiness of an object; `meta` carries per-resource hints
    async fn readiness(
        &self,
        kind: ObjectKind,
        name: &str,
        meta: &Meta,
    ) -> anyhow::Result<ResourceStatus>;
}
