use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::Scheduler;
use crate::resources::{FlowTemplate, ReportSink};

/// Input to graph construction: which flow, with which arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentOptions {
    /// Flow template to build; `None` selects the root definition set
    #[serde(default)]
    pub flow_name: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl DeploymentOptions {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn flow<S: Into<String>>(name: S) -> Self {
        Self {
            flow_name: Some(name.into()),
            args: BTreeMap::new(),
        }
    }

    pub fn arg<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

/// What a resource may ask of the graph it is built into
pub trait GraphContext: Send + Sync {
    /// Argument value, empty when unset
    fn get_arg(&self, name: &str) -> String;

    /// Handle used by flows to build and deploy nested graphs
    fn scheduler(&self) -> &Scheduler;

    /// Cancellation of the run currently deploying this graph
    fn cancellation(&self) -> CancellationToken;

    fn sink(&self) -> Arc<dyn ReportSink>;
}

/// State shared by every node of one graph
pub(crate) struct GraphScope {
    args: BTreeMap<String, String>,
    flow: Option<FlowTemplate>,
    cancel: RwLock<CancellationToken>,
}

impl GraphScope {
    pub(crate) fn new(args: BTreeMap<String, String>, flow: Option<FlowTemplate>) -> Self {
        Self {
            args,
            flow,
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Graph-level lookup: explicit args, then flow parameter defaults
    pub(crate) fn get_arg(&self, name: &str) -> String {
        if let Some(value) = self.args.get(name) {
            return value.clone();
        }
        self.flow
            .as_ref()
            .and_then(|flow| flow.parameters.get(name))
            .and_then(|param| param.default.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_cancellation(&self, token: CancellationToken) {
        *self.cancel.write() = token;
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.read().clone()
    }
}

/// Context handed to each node at construction
pub struct NodeContext {
    scheduler: Scheduler,
    scope: Arc<GraphScope>,
    bindings: BTreeMap<String, String>,
}

impl NodeContext {
    pub(crate) fn new(
        scheduler: Scheduler,
        scope: Arc<GraphScope>,
        bindings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            scheduler,
            scope,
            bindings,
        }
    }
}

impl GraphContext for NodeContext {
    fn get_arg(&self, name: &str) -> String {
        match self.bindings.get(name) {
            Some(value) => value.clone(),
            None => self.scope.get_arg(name),
        }
    }

    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn cancellation(&self) -> CancellationToken {
        self.scope.cancellation()
    }

    fn sink(&self) -> Arc<dyn ReportSink> {
        self.scheduler.sink()
    }
}
