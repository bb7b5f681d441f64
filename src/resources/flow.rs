//! Flow resources: a parametrized sub-graph deployed as a single node.

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    make_key, parametrize, FlowTemplate, Meta, Reporting, Resource, ResourceDefinition,
    ResourceFactory, ResourceStatus, StatusCell,
};
use crate::backend::Backend;
use crate::core::errors::{DeployError, Result};
use crate::graph::{DeploymentOptions, GraphContext};

lazy_static! {
    /// Process-wide instance counter shared by default flow factories
    static ref FLOW_INSTANCES: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
}

/// Fields of a flow template that take part in parametrization
const FLOW_PARAM_FIELDS: &[&str] = &["parameters"];

/// A flow instance inside a parent graph
pub struct Flow {
    key: String,
    flow_name: String,
    template: FlowTemplate,
    args: BTreeMap<String, String>,
    meta: Meta,
    ctx: Arc<dyn GraphContext>,
    status: Arc<StatusCell>,
    running: Arc<AtomicBool>,
    nested: Mutex<Option<CancellationToken>>,
}

impl Flow {
    /// Name of the template this instance deploys
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Template with its parameter defaults resolved in the parent graph
    pub fn template(&self) -> &FlowTemplate {
        &self.template
    }

    /// Arguments the nested graph is built with: bound values, else the
    /// resolved parameter defaults
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }
}

#[async_trait]
impl Resource for Flow {
    fn key(&self) -> &str {
        &self.key
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Build the nested graph and start deploying it in the background
    async fn create(&self) -> Result<()> {
        if self.status.load() == ResourceStatus::Ready {
            return Ok(());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.status.store(ResourceStatus::NotReady);

        let options = DeploymentOptions {
            flow_name: Some(self.flow_name.clone()),
            args: self.args.clone(),
        };
        let graph = match self.ctx.scheduler().build_dependency_graph(&options) {
            Ok(graph) => graph,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        info!(key = %self.key, nodes = graph.len(), "Starting nested deployment");
        let cancel = self.ctx.cancellation().child_token();
        *self.nested.lock() = Some(cancel.clone());
        let status = self.status.clone();
        let running = self.running.clone();
        let key = self.key.clone();

        tokio::spawn(async move {
            let report = graph.deploy(cancel).await;
            if report.cancelled {
                warn!(key = %key, "Nested deployment cancelled");
            } else if report.is_success() {
                status.store(ResourceStatus::Ready);
            } else {
                error!(
                    key = %key,
                    failed = report.failed().len(),
                    "Nested deployment failed"
                );
                status.store(ResourceStatus::Error);
            }
            running.store(false, Ordering::Release);
        });

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        Err(DeployError::unsupported("delete", self.key.as_str()))
    }

    async fn status(&self, _meta: &Meta) -> Result<ResourceStatus> {
        Ok(self.status.load())
    }

    /// Cancel the nested deployment, if one is running
    fn abandon(&self) {
        if let Some(token) = self.nested.lock().take() {
            warn!(key = %self.key, "Abandoning nested deployment");
            token.cancel();
        }
    }
}

/// Factory for flow instances
pub struct FlowFactory {
    counter: Arc<AtomicU32>,
}

impl FlowFactory {
    /// Factory numbering its instances from `counter`
    pub fn with_counter(counter: Arc<AtomicU32>) -> Self {
        Self { counter }
    }
}

impl Default for FlowFactory {
    fn default() -> Self {
        Self::with_counter(FLOW_INSTANCES.clone())
    }
}

impl ResourceFactory for FlowFactory {
    fn short_name(&self, definition: &ResourceDefinition) -> Option<String> {
        definition.body.as_flow().map(|flow| flow.name.clone())
    }

    fn kind(&self) -> &str {
        "flow"
    }

    fn new_resource(
        &self,
        definition: &ResourceDefinition,
        _backend: Arc<dyn Backend>,
        ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>> {
        let template = definition.body.as_flow().ok_or_else(|| {
            DeployError::validation(format!(
                "Definition '{}' is not a flow",
                definition.template_key()
            ))
        })?;

        let parametrized = parametrize(template, ctx.as_ref(), FLOW_PARAM_FIELDS)?;
        let args: BTreeMap<String, String> = parametrized
            .parameters
            .iter()
            .filter_map(|(name, param)| {
                let mut value = ctx.get_arg(name);
                if value.is_empty() {
                    value = param.default.clone().unwrap_or_default();
                }
                (!value.is_empty()).then(|| (name.clone(), value))
            })
            .collect();

        let instance = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let key = make_key("flow", &format!("{}-{}", template.name, instance));

        let flow = Flow {
            key,
            flow_name: template.name.clone(),
            template: parametrized,
            args,
            meta: definition.meta.clone(),
            ctx: ctx.clone(),
            status: Arc::new(StatusCell::new(ResourceStatus::NotReady)),
            running: Arc::new(AtomicBool::new(false)),
            nested: Mutex::new(None),
        };
        Ok(Arc::new(Reporting::new(flow, ctx.sink())))
    }

    fn new_existing(
        &self,
        name: &str,
        _backend: Arc<dyn Backend>,
        _ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>> {
        Err(DeployError::adoption("flow", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::testing::StaticContext;

    fn flow_definition() -> ResourceDefinition {
        ResourceDefinition::flow(
            FlowTemplate::new("db")
                .parameter("replicas", Some("1"))
                .parameter("zone", None),
        )
    }

    #[test]
    fn test_keys_come_from_counter() {
        let counter = Arc::new(AtomicU32::new(0));
        let factory = FlowFactory::with_counter(counter.clone());
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let ctx: Arc<dyn GraphContext> = Arc::new(StaticContext::new(&[]));

        let first = factory
            .new_resource(&flow_definition(), backend.clone(), ctx.clone())
            .unwrap();
        let second = factory
            .new_resource(&flow_definition(), backend, ctx)
            .unwrap();

        assert_eq!(first.key(), "flow/db-1");
        assert_eq!(second.key(), "flow/db-2");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parametrized_flow_keeps_template_name() {
        let factory = FlowFactory::with_counter(Arc::new(AtomicU32::new(0)));
        let ctx: Arc<dyn GraphContext> = Arc::new(StaticContext::new(&[("zone", "eu")]));
        let definition = flow_definition();
        let template = definition.body.as_flow().unwrap();

        let parametrized = parametrize(template, ctx.as_ref(), FLOW_PARAM_FIELDS).unwrap();
        assert_eq!(parametrized.name, "db");

        let resource = factory
            .new_resource(&definition, Arc::new(InMemoryBackend::new()), ctx)
            .unwrap();
        assert!(resource.key().starts_with("flow/db-"));
        assert!(resource.report().is_some());
    }

    #[tokio::test]
    async fn test_delete_unsupported() {
        let factory = FlowFactory::with_counter(Arc::new(AtomicU32::new(0)));
        let ctx: Arc<dyn GraphContext> = Arc::new(StaticContext::new(&[]));
        let resource = factory
            .new_resource(&flow_definition(), Arc::new(InMemoryBackend::new()), ctx)
            .unwrap();

        assert!(matches!(
            resource.delete().await,
            Err(DeployError::Unsupported { .. })
        ));
        assert_eq!(
            resource.status(&Meta::new()).await.unwrap(),
            ResourceStatus::NotReady
        );
    }

    #[test]
    fn test_adoption_rejected() {
        let factory = FlowFactory::default();
        let ctx: Arc<dyn GraphContext> = Arc::new(StaticContext::new(&[]));
        assert!(matches!(
            factory.new_existing("db-1", Arc::new(InMemoryBackend::new()), ctx),
            Err(DeployError::Adoption { .. })
        ));
    }
}
