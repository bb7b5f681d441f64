use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::context::GraphScope;
use crate::core::config::DeployConfig;
use crate::core::errors::DeployError;
use crate::resources::{
    meta_seconds, DeploymentEvent, EventEnvelope, Meta, NodeReport, ReportSink, Resource,
    ResourceStatus, META_TIMEOUT,
};

pub(crate) struct GraphNode {
    pub(crate) template_key: String,
    pub(crate) resource: Arc<dyn Resource>,
}

/// A validated, acyclic graph of resources ready to deploy.
///
/// Edges point from a dependency to its dependent.
pub struct DependencyGraph {
    name: String,
    graph: DiGraph<GraphNode, ()>,
    scope: Arc<GraphScope>,
    config: DeployConfig,
    sink: Arc<dyn ReportSink>,
}

/// Final state of one node after a deployment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub key: String,
    pub status: ResourceStatus,
    /// Whether `create` ran and succeeded
    pub created: bool,
    pub status_checks: u32,
    pub error: Option<String>,
}

impl NodeOutcome {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            status: ResourceStatus::NotReady,
            created: false,
            status_checks: 0,
            error: None,
        }
    }

    fn failed(mut self, message: String) -> Self {
        self.status = ResourceStatus::Error;
        self.error = Some(message);
        self
    }
}

/// Outcome of [`DependencyGraph::deploy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub run_id: String,
    pub graph: String,
    /// One entry per node, in graph order
    pub nodes: Vec<NodeOutcome>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl DeploymentReport {
    /// True when every node reached Ready
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.nodes.iter().all(|n| n.status == ResourceStatus::Ready)
    }

    pub fn status_of(&self, key: &str) -> Option<ResourceStatus> {
        self.nodes.iter().find(|n| n.key == key).map(|n| n.status)
    }

    pub fn node(&self, key: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn failed(&self) -> Vec<&NodeOutcome> {
        self.nodes
            .iter()
            .filter(|n| n.status == ResourceStatus::Error)
            .collect()
    }

    pub fn not_ready(&self) -> Vec<&NodeOutcome> {
        self.nodes
            .iter()
            .filter(|n| n.status == ResourceStatus::NotReady)
            .collect()
    }
}

impl DependencyGraph {
    pub(crate) fn new(
        name: String,
        graph: DiGraph<GraphNode, ()>,
        scope: Arc<GraphScope>,
        config: DeployConfig,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            name,
            graph,
            scope,
            config,
            sink,
        }
    }

    /// `root`, or the name of the flow this graph was built from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node keys in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.graph
            .node_weights()
            .map(|node| node.resource.key().to_string())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.graph
            .node_weights()
            .any(|node| node.resource.key() == key)
    }

    pub fn resource(&self, key: &str) -> Option<Arc<dyn Resource>> {
        self.graph
            .node_weights()
            .find(|node| node.resource.key() == key)
            .map(|node| node.resource.clone())
    }

    /// Keys of the nodes `key` waits for
    pub fn dependencies_of(&self, key: &str) -> Vec<String> {
        let Some(index) = self
            .graph
            .node_indices()
            .find(|i| self.graph[*i].resource.key() == key)
        else {
            return Vec::new();
        };
        let mut parents: Vec<String> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|p| self.graph[p].resource.key().to_string())
            .collect();
        parents.sort();
        parents
    }

    /// Keys in an order where every dependency precedes its dependents
    pub fn topological_order(&self) -> Vec<String> {
        toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .map(|i| self.graph[i].resource.key().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Progress snapshots of every decorated node
    pub fn reports(&self) -> Vec<NodeReport> {
        self.graph
            .node_weights()
            .filter_map(|node| node.resource.report())
            .collect()
    }

    fn readiness_timeout(&self, meta: &Meta) -> Option<Duration> {
        match meta_seconds(meta, META_TIMEOUT) {
            Some(seconds) => Some(Duration::from_secs(seconds)),
            None => self.config.readiness_timeout,
        }
    }

    /// Deploy every node, honoring dependency order.
    ///
    /// Each node gets its own task: it waits for its dependencies to settle,
    /// calls `create`, then polls `status` until a terminal value, a timeout
    /// or cancellation. At most `max_parallel_nodes` creates run at once.
    /// A failed dependency fails its dependents without touching them.
    /// Cancellation leaves unfinished nodes NotReady.
    #[instrument(skip(self, cancel), fields(graph = %self.name))]
    pub async fn deploy(&self, cancel: CancellationToken) -> DeploymentReport {
        let run_id = cuid2::create_id();
        let started = Instant::now();
        self.scope.set_cancellation(cancel.clone());

        info!(run_id = %run_id, nodes = self.len(), "Deploying graph");

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_nodes));
        let (senders, receivers): (Vec<_>, Vec<_>) = self
            .graph
            .node_indices()
            .map(|_| watch::channel(ResourceStatus::NotReady))
            .unzip();

        let mut tasks = FuturesUnordered::new();
        for (index, status_tx) in self.graph.node_indices().zip(senders) {
            let node = &self.graph[index];
            let parents = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|p| {
                    (
                        self.graph[p].resource.key().to_string(),
                        receivers[p.index()].clone(),
                    )
                })
                .collect();

            let run = NodeRun {
                resource: node.resource.clone(),
                parents,
                status_tx,
                semaphore: semaphore.clone(),
                cancel: cancel.clone(),
                poll_interval: self.config.poll_interval,
                timeout: self.readiness_timeout(node.resource.meta()),
                sink: self.sink.clone(),
            };

            let key = node.resource.key().to_string();
            let handle = tokio::spawn(run.execute());
            tasks.push(async move { (index, key, handle.await) });
        }
        drop(receivers);

        let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; self.len()];
        while let Some((index, key, joined)) = tasks.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(key = %key, error = %e, "Node task aborted");
                    NodeOutcome::new(&key).failed(format!("node task aborted: {}", e))
                }
            };
            outcomes[index.index()] = Some(outcome);
        }

        let nodes: Vec<NodeOutcome> = outcomes.into_iter().flatten().collect();
        let report = DeploymentReport {
            run_id,
            graph: self.name.clone(),
            cancelled: cancel.is_cancelled(),
            elapsed: started.elapsed(),
            nodes,
        };

        info!(
            run_id = %report.run_id,
            ready = report.nodes.len() - report.failed().len() - report.not_ready().len(),
            failed = report.failed().len(),
            pending = report.not_ready().len(),
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Deployment finished"
        );
        report
    }
}

/// Everything one node task needs
struct NodeRun {
    resource: Arc<dyn Resource>,
    parents: Vec<(String, watch::Receiver<ResourceStatus>)>,
    status_tx: watch::Sender<ResourceStatus>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    poll_interval: Duration,
    timeout: Option<Duration>,
    sink: Arc<dyn ReportSink>,
}

enum Polled {
    Settled(ResourceStatus, Option<String>),
    Cancelled,
}

impl NodeRun {
    async fn execute(self) -> NodeOutcome {
        let NodeRun {
            resource,
            parents,
            status_tx,
            semaphore,
            cancel,
            poll_interval,
            timeout,
            sink,
        } = self;
        let key = resource.key().to_string();
        let mut outcome = NodeOutcome::new(&key);

        for (dependency, mut rx) in parents {
            match wait_settled(&mut rx, &cancel).await {
                None => {
                    debug!(key = %key, "Cancelled while waiting for dependencies");
                    return outcome;
                }
                Some(ResourceStatus::Error) => {
                    warn!(key = %key, dependency = %dependency, "Dependency failed, skipping");
                    sink.emit(&EventEnvelope::new(DeploymentEvent::DependencyFailed {
                        key: key.clone(),
                        dependency: dependency.clone(),
                    }));
                    status_tx.send_replace(ResourceStatus::Error);
                    return outcome.failed(format!("dependency {} failed", dependency));
                }
                Some(_) => {}
            }
        }

        // the permit bounds concurrent creates only; polling runs unthrottled
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return outcome,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    status_tx.send_replace(ResourceStatus::Error);
                    return outcome.failed(e.to_string());
                }
            },
        };

        debug!(key = %key, "Dependencies ready, creating");
        let created = resource.create().await;
        drop(permit);
        if let Err(e) = created {
            error!(key = %key, error = %e, "Create failed");
            status_tx.send_replace(ResourceStatus::Error);
            return outcome.failed(e.to_string());
        }
        outcome.created = true;

        if cancel.is_cancelled() {
            return outcome;
        }

        let polled = poll_readiness(
            resource.as_ref(),
            &cancel,
            poll_interval,
            timeout,
            &mut outcome.status_checks,
        )
        .await;

        match polled {
            Polled::Cancelled => {
                debug!(key = %key, "Cancelled while polling");
                outcome
            }
            Polled::Settled(ResourceStatus::Ready, _) => {
                info!(key = %key, checks = outcome.status_checks, "Ready");
                status_tx.send_replace(ResourceStatus::Ready);
                outcome.status = ResourceStatus::Ready;
                outcome
            }
            Polled::Settled(_, message) => {
                let message = message.unwrap_or_else(|| "resource reported error".to_string());
                error!(key = %key, error = %message, "Readiness failed");
                resource.abandon();
                status_tx.send_replace(ResourceStatus::Error);
                outcome.failed(message)
            }
        }
    }
}

/// Wait until a dependency reaches a terminal status.
///
/// `None` means the run was cancelled first.
async fn wait_settled(
    rx: &mut watch::Receiver<ResourceStatus>,
    cancel: &CancellationToken,
) -> Option<ResourceStatus> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        settled = rx.wait_for(|status| status.is_terminal()) => match settled.map(|status| *status) {
            Ok(status) => Some(status),
            // the dependency's task ended without settling
            Err(_) if cancel.is_cancelled() => None,
            Err(_) => Some(ResourceStatus::Error),
        },
    }
}

async fn poll_readiness(
    resource: &dyn Resource,
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Option<Duration>,
    checks: &mut u32,
) -> Polled {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        *checks += 1;
        match resource.status(resource.meta()).await {
            Ok(ResourceStatus::Ready) => return Polled::Settled(ResourceStatus::Ready, None),
            Ok(ResourceStatus::Error) => return Polled::Settled(ResourceStatus::Error, None),
            Ok(ResourceStatus::NotReady) => {
                debug!(key = %resource.key(), checks = *checks, "Not ready yet");
            }
            Err(e) => return Polled::Settled(ResourceStatus::Error, Some(e.to_string())),
        }

        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                let e = DeployError::timeout(resource.key(), timeout.as_millis() as u64);
                return Polled::Settled(ResourceStatus::Error, Some(e.to_string()));
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Polled::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::graph::{DeploymentOptions, Scheduler};
    use crate::resources::{DefinitionSet, Dependency, Manifest, NullSink, ObjectKind, ResourceDefinition};
    use serde_json::json;

    fn scheduler(set: DefinitionSet, backend: Arc<InMemoryBackend>) -> Scheduler {
        Scheduler::builder(set, backend)
            .config(DeployConfig::development())
            .sink(Arc::new(NullSink))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_graph_succeeds() {
        let backend = Arc::new(InMemoryBackend::new());
        let graph = scheduler(DefinitionSet::new(), backend)
            .build_dependency_graph(&DeploymentOptions::root())
            .unwrap();

        let report = graph.deploy(CancellationToken::new()).await;
        assert!(report.is_success());
        assert!(report.nodes.is_empty());
        assert!(!report.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_meta_timeout_fails_slow_node() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.script_status("job/slow", vec![ResourceStatus::NotReady]);
        let set = DefinitionSet::new()
            .definition(
                ResourceDefinition::object(ObjectKind::Job, Manifest::new("slow"))
                    .with_meta("timeout", json!(0)),
            )
            .unwrap();

        let graph = scheduler(set, backend.clone())
            .build_dependency_graph(&DeploymentOptions::root())
            .unwrap();
        let report = graph.deploy(CancellationToken::new()).await;

        let node = report.node("job/slow").unwrap();
        assert_eq!(node.status, ResourceStatus::Error);
        assert!(node.created);
        assert!(node.error.as_deref().unwrap_or_default().contains("job/slow"));
    }

    #[tokio::test]
    async fn test_status_error_propagates() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_status("pod/a", "crash loop");
        let set = DefinitionSet::new()
            .definition(ResourceDefinition::object(ObjectKind::Pod, Manifest::new("a")))
            .unwrap()
            .definition(ResourceDefinition::object(ObjectKind::Pod, Manifest::new("b")))
            .unwrap()
            .dependency(Dependency::new("pod/a", "pod/b"));

        let graph = scheduler(set, backend.clone())
            .build_dependency_graph(&DeploymentOptions::root())
            .unwrap();
        let report = graph.deploy(CancellationToken::new()).await;

        assert_eq!(report.status_of("pod/a"), Some(ResourceStatus::Error));
        assert_eq!(report.status_of("pod/b"), Some(ResourceStatus::Error));
        assert_eq!(backend.create_count("pod/b"), 0);
        assert!(!report.node("pod/b").unwrap().created);
    }

    #[tokio::test]
    async fn test_reports_track_status_checks() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.script_status(
            "service/web",
            vec![ResourceStatus::NotReady, ResourceStatus::Ready],
        );
        let set = DefinitionSet::new()
            .definition(ResourceDefinition::object(ObjectKind::Service, Manifest::new("web")))
            .unwrap();

        let graph = scheduler(set, backend)
            .build_dependency_graph(&DeploymentOptions::root())
            .unwrap();
        let report = graph.deploy(CancellationToken::new()).await;
        assert!(report.is_success());

        let reports = graph.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status_checks, 2);
        assert!(reports[0].created);
        assert_eq!(report.node("service/web").unwrap().status_checks, 2);
    }
}
