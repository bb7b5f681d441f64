//! Backend object resources: the thin create/delete/status translation
//! shared by every [`ObjectKind`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    make_key, parametrize, Manifest, Meta, ObjectKind, Reporting, Resource, ResourceDefinition,
    ResourceFactory, ResourceStatus,
};
use crate::backend::Backend;
use crate::core::errors::{DeployError, Result};
use crate::graph::GraphContext;

/// An object this deployment creates if absent
pub struct ManagedObject {
    key: String,
    kind: ObjectKind,
    manifest: Manifest,
    meta: Meta,
    backend: Arc<dyn Backend>,
}

impl ManagedObject {
    pub fn new(kind: ObjectKind, manifest: Manifest, meta: Meta, backend: Arc<dyn Backend>) -> Self {
        Self {
            key: make_key(kind.tag(), manifest.name()),
            kind,
            manifest,
            meta,
            backend,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

#[async_trait]
impl Resource for ManagedObject {
    fn key(&self) -> &str {
        &self.key
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Looks the object up and creates it only when it is not there
    async fn create(&self) -> Result<()> {
        let existing = self
            .backend
            .get(self.kind, self.manifest.name())
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "get", e))?;

        if existing.is_some() {
            debug!(key = %self.key, "Already present, skipping create");
            return Ok(());
        }

        info!(key = %self.key, "Creating");
        self.backend
            .create(self.kind, &self.manifest)
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "create", e))
    }

    async fn delete(&self) -> Result<()> {
        self.backend
            .delete(self.kind, self.manifest.name())
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "delete", e))
    }

    async fn status(&self, meta: &Meta) -> Result<ResourceStatus> {
        self.backend
            .readiness(self.kind, self.manifest.name(), meta)
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "status", e))
    }
}

/// An object expected to exist before the deployment starts
pub struct ExistingObject {
    key: String,
    kind: ObjectKind,
    name: String,
    meta: Meta,
    backend: Arc<dyn Backend>,
}

impl ExistingObject {
    pub fn new(kind: ObjectKind, name: &str, backend: Arc<dyn Backend>) -> Self {
        Self {
            key: make_key(kind.tag(), name),
            kind,
            name: name.to_string(),
            meta: Meta::new(),
            backend,
        }
    }
}

#[async_trait]
impl Resource for ExistingObject {
    fn key(&self) -> &str {
        &self.key
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Fails when the object is missing; never creates anything
    async fn create(&self) -> Result<()> {
        let existing = self
            .backend
            .get(self.kind, &self.name)
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "get", e))?;

        match existing {
            Some(_) => Ok(()),
            None => Err(DeployError::not_found(self.key.as_str())),
        }
    }

    async fn delete(&self) -> Result<()> {
        self.backend
            .delete(self.kind, &self.name)
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "delete", e))
    }

    async fn status(&self, meta: &Meta) -> Result<ResourceStatus> {
        self.backend
            .readiness(self.kind, &self.name, meta)
            .await
            .map_err(|e| DeployError::backend(self.key.as_str(), "status", e))
    }
}

/// Factory for one backend object kind
pub struct ObjectFactory {
    kind: ObjectKind,
}

impl ObjectFactory {
    pub fn new(kind: ObjectKind) -> Self {
        Self { kind }
    }
}

impl ResourceFactory for ObjectFactory {
    fn short_name(&self, definition: &ResourceDefinition) -> Option<String> {
        match definition.body.as_object() {
            Some((kind, manifest)) if kind == self.kind => Some(manifest.name().to_string()),
            _ => None,
        }
    }

    fn kind(&self) -> &str {
        self.kind.tag()
    }

    fn new_resource(
        &self,
        definition: &ResourceDefinition,
        backend: Arc<dyn Backend>,
        ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>> {
        let template = match definition.body.as_object() {
            Some((kind, manifest)) if kind == self.kind => manifest,
            _ => {
                return Err(DeployError::validation(format!(
                    "Definition '{}' is not a {}",
                    definition.template_key(),
                    self.kind
                )))
            }
        };

        let manifest = parametrize(template, ctx.as_ref(), self.kind.param_fields())?;
        if manifest.name().is_empty() {
            return Err(DeployError::validation_field(
                format!(
                    "Name of '{}' resolved to an empty string",
                    definition.template_key()
                ),
                "metadata.name",
            ));
        }

        let object = ManagedObject::new(self.kind, manifest, definition.meta.clone(), backend);
        Ok(Arc::new(Reporting::new(object, ctx.sink())))
    }

    fn new_existing(
        &self,
        name: &str,
        backend: Arc<dyn Backend>,
        ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>> {
        let object = ExistingObject::new(self.kind, name, backend);
        Ok(Arc::new(Reporting::new(object, ctx.sink())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::testing::StaticContext;

    #[tokio::test]
    async fn test_managed_create_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new());
        let object = ManagedObject::new(
            ObjectKind::Deployment,
            Manifest::new("web"),
            Meta::new(),
            backend.clone(),
        );

        object.create().await.unwrap();
        object.create().await.unwrap();

        assert_eq!(backend.create_count("deployment/web"), 1);
        assert_eq!(
            object.status(&Meta::new()).await.unwrap(),
            ResourceStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_existing_object_requires_presence() {
        let backend = Arc::new(InMemoryBackend::new());
        let missing = ExistingObject::new(ObjectKind::Secret, "creds", backend.clone());
        assert!(matches!(
            missing.create().await,
            Err(DeployError::NotFound { .. })
        ));

        backend.insert_existing(ObjectKind::Secret, Manifest::new("creds"));
        missing.create().await.unwrap();
        assert_eq!(backend.create_count("secret/creds"), 0);
    }

    #[tokio::test]
    async fn test_factory_parametrizes_name() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let ctx: Arc<dyn GraphContext> = Arc::new(StaticContext::new(&[("idx", "3")]));
        let factory = ObjectFactory::new(ObjectKind::Pod);
        let def = ResourceDefinition::object(ObjectKind::Pod, Manifest::new("worker-$idx"));

        assert_eq!(factory.short_name(&def), Some("worker-$idx".to_string()));
        let resource = factory.new_resource(&def, backend, ctx).unwrap();
        assert_eq!(resource.key(), "pod/worker-3");
        assert!(resource.report().is_some());
    }

    #[test]
    fn test_factory_ignores_other_kinds() {
        let factory = ObjectFactory::new(ObjectKind::Pod);
        let def = ResourceDefinition::object(ObjectKind::Job, Manifest::new("x"));
        assert_eq!(factory.short_name(&def), None);
    }
}
