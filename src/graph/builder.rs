use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::context::{DeploymentOptions, GraphContext, GraphScope, NodeContext};
use super::executor::{DependencyGraph, GraphNode};
use crate::backend::Backend;
use crate::core::config::DeployConfig;
use crate::core::errors::{DeployError, Result};
use crate::resources::{
    expand, make_key, meta_strings, split_key, DefinitionSet, FactoryRegistry, LoggingSink,
    ReportSink, Resource, META_AFTER,
};

/// Scheduler handle: owns the definitions and builds dependency graphs.
///
/// Cheap to clone; flow nodes keep one to build their nested graphs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    definitions: DefinitionSet,
    registry: FactoryRegistry,
    backend: Arc<dyn Backend>,
    config: DeployConfig,
    sink: Arc<dyn ReportSink>,
}

/// Fluent builder for a [`Scheduler`]
pub struct SchedulerBuilder {
    definitions: DefinitionSet,
    backend: Arc<dyn Backend>,
    registry: Option<FactoryRegistry>,
    config: DeployConfig,
    sink: Arc<dyn ReportSink>,
}

impl SchedulerBuilder {
    pub fn registry(mut self, registry: FactoryRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: DeployConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate definitions and config, then build the scheduler
    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        self.definitions.validate()?;
        check_flow_nesting(&self.definitions)?;
        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                definitions: self.definitions,
                registry: self.registry.unwrap_or_else(FactoryRegistry::with_defaults),
                backend: self.backend,
                config: self.config,
                sink: self.sink,
            }),
        })
    }
}

/// Keys that make up one graph, in discovery order, with who referenced them
#[derive(Default)]
struct Members {
    order: Vec<String>,
    referrers: HashMap<String, String>,
}

/// A parent-to-child edge; `binding` picks one instance of the child, or
/// every instance when the dependency carries no arguments
struct Edge {
    parent: String,
    child: String,
    binding: Option<usize>,
}

/// Distinct argument sets bound to each child, one node per set
#[derive(Default)]
struct Bindings {
    sets: HashMap<String, Vec<BTreeMap<String, String>>>,
}

impl Bindings {
    fn bind(&mut self, child: &str, args: BTreeMap<String, String>) -> usize {
        let sets = self.sets.entry(child.to_string()).or_default();
        match sets.iter().position(|set| *set == args) {
            Some(index) => index,
            None => {
                sets.push(args);
                sets.len() - 1
            }
        }
    }

    fn take(&mut self, child: &str) -> Vec<BTreeMap<String, String>> {
        match self.sets.remove(child) {
            Some(sets) if !sets.is_empty() => sets,
            _ => vec![BTreeMap::new()],
        }
    }
}

impl Members {
    fn add(&mut self, key: &str, referrer: &str) {
        if !self.referrers.contains_key(key) {
            self.referrers.insert(key.to_string(), referrer.to_string());
            self.order.push(key.to_string());
        }
    }
}

impl Scheduler {
    pub fn builder(definitions: DefinitionSet, backend: Arc<dyn Backend>) -> SchedulerBuilder {
        SchedulerBuilder {
            definitions,
            backend,
            registry: None,
            config: DeployConfig::default(),
            sink: Arc::new(LoggingSink),
        }
    }

    /// Scheduler with default factories, config and logging sink
    pub fn new(definitions: DefinitionSet, backend: Arc<dyn Backend>) -> Result<Self> {
        Self::builder(definitions, backend).build()
    }

    pub fn definitions(&self) -> &DefinitionSet {
        &self.inner.definitions
    }

    pub fn registry(&self) -> &FactoryRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &DeployConfig {
        &self.inner.config
    }

    pub fn sink(&self) -> Arc<dyn ReportSink> {
        self.inner.sink.clone()
    }

    /// Assemble and validate the graph selected by `options`.
    ///
    /// Purely in-memory: no backend call is made here.
    #[instrument(skip(self, options), fields(flow = ?options.flow_name))]
    pub fn build_dependency_graph(&self, options: &DeploymentOptions) -> Result<DependencyGraph> {
        let definitions = self.definitions();

        let flow = match &options.flow_name {
            Some(name) => Some(
                definitions
                    .flow(name)
                    .cloned()
                    .ok_or_else(|| DeployError::flow_not_found(name.as_str()))?,
            ),
            None => None,
        };
        let scope_name = flow.as_ref().map(|f| f.name.clone());
        let graph_name = scope_name.clone().unwrap_or_else(|| "root".to_string());
        let scope = Arc::new(GraphScope::new(options.args.clone(), flow.clone()));

        let mut members = Members::default();
        let mut edges: Vec<Edge> = Vec::new();
        let mut bindings = Bindings::default();

        match &flow {
            Some(flow) => {
                let referrer = format!("flow/{}", flow.name);
                for key in &flow.resources {
                    members.add(key, &referrer);
                }
            }
            None => {
                let flow_members = self.flow_members();
                for definition in &definitions.definitions {
                    let key = definition.template_key();
                    if definition.body.as_flow().is_none() && !flow_members.contains(&key) {
                        members.add(&key, "root");
                    }
                }
            }
        }

        let lookup = |name: &str| scope.get_arg(name);
        for dependency in definitions
            .dependencies
            .iter()
            .filter(|d| d.flow == scope_name)
        {
            members.add(&dependency.parent, &dependency.child);
            members.add(&dependency.child, &dependency.parent);

            let binding = (!dependency.args.is_empty()).then(|| {
                let args = dependency
                    .args
                    .iter()
                    .map(|(name, value)| (name.clone(), expand(value, &lookup)))
                    .collect();
                bindings.bind(&dependency.child, args)
            });
            edges.push(Edge {
                parent: dependency.parent.clone(),
                child: dependency.child.clone(),
                binding,
            });
        }

        // implicit ordering from `after` metadata, including on members it pulls in
        let mut cursor = 0;
        while cursor < members.order.len() {
            let key = members.order[cursor].clone();
            if let Some(definition) = definitions.find(&key) {
                for parent in meta_strings(&definition.meta, META_AFTER) {
                    members.add(&parent, &key);
                    edges.push(Edge {
                        parent,
                        child: key.clone(),
                        binding: None,
                    });
                }
            }
            cursor += 1;
        }

        let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
        let mut instances: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        let mut template_by_key: HashMap<String, String> = HashMap::new();

        for template_key in &members.order {
            for args in bindings.take(template_key) {
                let ctx: Arc<dyn GraphContext> =
                    Arc::new(NodeContext::new(self.clone(), scope.clone(), args));

                let resource = match definitions.find(template_key) {
                    Some(definition) => {
                        let (factory, _) = self.registry().resolve(definition)?;
                        factory.new_resource(definition, self.inner.backend.clone(), ctx)?
                    }
                    None => {
                        let referrer = members.referrers[template_key].as_str();
                        self.adopt(template_key, referrer, ctx)?
                    }
                };

                let key = resource.key().to_string();
                if let Some(previous) = template_by_key.insert(key.clone(), template_key.clone()) {
                    return Err(DeployError::validation(format!(
                        "Resources '{}' and '{}' both resolve to key '{}'",
                        previous, template_key, key
                    )));
                }

                debug!(template = %template_key, key = %key, "Added node");
                let index = graph.add_node(GraphNode {
                    template_key: template_key.clone(),
                    resource,
                });
                instances.entry(template_key.clone()).or_default().push(index);
            }
        }

        for edge in &edges {
            let children = &instances[&edge.child];
            let children = match edge.binding {
                Some(binding) => &children[binding..=binding],
                None => &children[..],
            };
            for &parent in &instances[&edge.parent] {
                for &child in children {
                    graph.update_edge(parent, child, ());
                }
            }
        }

        if is_cyclic_directed(&graph) {
            let path = find_cycle(&graph, &|node: &GraphNode| node.template_key.clone())
                .unwrap_or_default();
            return Err(DeployError::cycle(path));
        }

        info!(
            graph = %graph_name,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Built dependency graph"
        );

        Ok(DependencyGraph::new(
            graph_name,
            graph,
            scope,
            self.config().clone(),
            self.sink(),
        ))
    }

    /// Every template key that belongs to some flow's graph
    fn flow_members(&self) -> HashSet<String> {
        let definitions = self.definitions();
        let mut keys: HashSet<String> = definitions
            .flows()
            .flat_map(|flow| flow.resources.iter().cloned())
            .collect();
        for dependency in definitions.dependencies.iter().filter(|d| d.flow.is_some()) {
            keys.insert(dependency.parent.clone());
            keys.insert(dependency.child.clone());
        }
        keys
    }

    /// Bind an undefined reference to a pre-existing backend object
    fn adopt(
        &self,
        reference: &str,
        referrer: &str,
        ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>> {
        let (kind, name) =
            split_key(reference).ok_or_else(|| DeployError::dangling(referrer, reference))?;
        let factory = self
            .registry()
            .lookup(kind)
            .ok_or_else(|| DeployError::dangling(referrer, reference))?;

        debug!(key = %reference, "Adopting existing resource");
        factory.new_existing(name, self.inner.backend.clone(), ctx)
    }
}

/// Reject flows that contain themselves, directly or through other flows.
///
/// A flow contains another when `flow/<name>` is one of its resources or an
/// endpoint of a dependency scoped to it.
fn check_flow_nesting(definitions: &DefinitionSet) -> Result<()> {
    let mut nesting: DiGraph<String, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = definitions
        .flows()
        .map(|flow| (flow.name.as_str(), nesting.add_node(make_key("flow", &flow.name))))
        .collect();

    for flow in definitions.flows() {
        let outer = index[flow.name.as_str()];
        let scoped = definitions
            .dependencies
            .iter()
            .filter(|d| d.flow.as_deref() == Some(flow.name.as_str()))
            .flat_map(|d| [d.parent.as_str(), d.child.as_str()]);

        for member in flow.resources.iter().map(String::as_str).chain(scoped) {
            if let Some(("flow", name)) = split_key(member) {
                if let Some(&inner) = index.get(name) {
                    nesting.update_edge(outer, inner, ());
                }
            }
        }
    }

    match find_cycle(&nesting, &|key: &String| key.clone()) {
        Some(path) => Err(DeployError::cycle(path)),
        None => Ok(()),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Locate one cycle and return its labels, first node repeated last
fn find_cycle<N>(graph: &DiGraph<N, ()>, label: &dyn Fn(&N) -> String) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack = Vec::new();

    for start in graph.node_indices() {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(cycle) = visit(graph, label, start, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<N>(
    graph: &DiGraph<N, ()>,
    label: &dyn Fn(&N) -> String,
    node: NodeIndex,
    marks: &mut Vec<Mark>,
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<String>> {
    marks[node.index()] = Mark::InProgress;
    stack.push(node);

    for next in graph.neighbors_directed(node, Direction::Outgoing) {
        match marks[next.index()] {
            Mark::InProgress => {
                let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                let mut path: Vec<String> = stack[start..]
                    .iter()
                    .map(|n| label(&graph[*n]))
                    .collect();
                path.push(label(&graph[next]));
                return Some(path);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(graph, label, next, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node.index()] = Mark::Done;
    None
}
