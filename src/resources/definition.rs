use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::{make_key, Meta};
use crate::core::errors::{DeployError, Result};

/// Backend object kinds the default factories know how to manage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    StatefulSet,
    Deployment,
    Pod,
    Job,
    Service,
    ConfigMap,
    Secret,
}

const WORKLOAD_PARAM_FIELDS: &[&str] = &[
    "metadata",
    "spec.template.metadata",
    "spec.template.spec.containers.name",
    "spec.template.spec.containers.env",
    "spec.template.spec.initContainers.name",
    "spec.template.spec.initContainers.env",
];

const POD_PARAM_FIELDS: &[&str] = &[
    "metadata",
    "spec.containers.name",
    "spec.containers.env",
    "spec.initContainers.name",
    "spec.initContainers.env",
];

const SERVICE_PARAM_FIELDS: &[&str] = &["metadata", "spec.selector"];

const DATA_PARAM_FIELDS: &[&str] = &["metadata", "data", "stringData"];

impl ObjectKind {
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::StatefulSet,
        ObjectKind::Deployment,
        ObjectKind::Pod,
        ObjectKind::Job,
        ObjectKind::Service,
        ObjectKind::ConfigMap,
        ObjectKind::Secret,
    ];

    /// Stable tag used in keys and for factory routing
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StatefulSet => "statefulset",
            Self::Deployment => "deployment",
            Self::Pod => "pod",
            Self::Job => "job",
            Self::Service => "service",
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    /// Manifest paths whose strings accept `$arg` placeholders
    pub fn param_fields(&self) -> &'static [&'static str] {
        match self {
            Self::StatefulSet | Self::Deployment | Self::Job => WORKLOAD_PARAM_FIELDS,
            Self::Pod => POD_PARAM_FIELDS,
            Self::Service => SERVICE_PARAM_FIELDS,
            Self::ConfigMap | Self::Secret => DATA_PARAM_FIELDS,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Kind-specific body of a backend object, opaque to the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Manifest {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                labels: BTreeMap::new(),
            },
            body: Map::new(),
        }
    }

    pub fn with_label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_field<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowParameter {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named, parametrized sub-graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, FlowParameter>,
    /// Member keys (`kind/name`) deployed by this flow
    #[serde(default)]
    pub resources: Vec<String>,
}

impl FlowTemplate {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn parameter<S: Into<String>>(mut self, name: S, default: Option<&str>) -> Self {
        self.parameters.insert(
            name.into(),
            FlowParameter {
                default: default.map(str::to_string),
                description: None,
            },
        );
        self
    }

    pub fn resource<S: Into<String>>(mut self, key: S) -> Self {
        self.resources.push(key.into());
        self
    }
}

/// Exactly one populated resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceBody {
    Flow(FlowTemplate),
    StatefulSet(Manifest),
    Deployment(Manifest),
    Pod(Manifest),
    Job(Manifest),
    Service(Manifest),
    ConfigMap(Manifest),
    Secret(Manifest),
}

impl ResourceBody {
    pub fn object(kind: ObjectKind, manifest: Manifest) -> Self {
        match kind {
            ObjectKind::StatefulSet => Self::StatefulSet(manifest),
            ObjectKind::Deployment => Self::Deployment(manifest),
            ObjectKind::Pod => Self::Pod(manifest),
            ObjectKind::Job => Self::Job(manifest),
            ObjectKind::Service => Self::Service(manifest),
            ObjectKind::ConfigMap => Self::ConfigMap(manifest),
            ObjectKind::Secret => Self::Secret(manifest),
        }
    }

    /// Kind and manifest of a backend object body
    pub fn as_object(&self) -> Option<(ObjectKind, &Manifest)> {
        match self {
            Self::Flow(_) => None,
            Self::StatefulSet(m) => Some((ObjectKind::StatefulSet, m)),
            Self::Deployment(m) => Some((ObjectKind::Deployment, m)),
            Self::Pod(m) => Some((ObjectKind::Pod, m)),
            Self::Job(m) => Some((ObjectKind::Job, m)),
            Self::Service(m) => Some((ObjectKind::Service, m)),
            Self::ConfigMap(m) => Some((ObjectKind::ConfigMap, m)),
            Self::Secret(m) => Some((ObjectKind::Secret, m)),
        }
    }

    pub fn as_flow(&self) -> Option<&FlowTemplate> {
        match self {
            Self::Flow(flow) => Some(flow),
            _ => None,
        }
    }

    pub fn kind_tag(&self) -> &'static str {
        match self.as_object() {
            Some((kind, _)) => kind.tag(),
            None => "flow",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Flow(flow) => &flow.name,
            _ => self.as_object().map(|(_, m)| m.name()).unwrap_or_default(),
        }
    }
}

/// One resource as loaded from configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    #[serde(default)]
    pub meta: Meta,
    #[serde(flatten)]
    pub body: ResourceBody,
}

impl ResourceDefinition {
    pub fn new(body: ResourceBody) -> Self {
        Self {
            meta: Meta::new(),
            body,
        }
    }

    pub fn object(kind: ObjectKind, manifest: Manifest) -> Self {
        Self::new(ResourceBody::object(kind, manifest))
    }

    pub fn flow(template: FlowTemplate) -> Self {
        Self::new(ResourceBody::Flow(template))
    }

    pub fn with_meta<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Key of the unparametrized template, used to resolve references
    pub fn template_key(&self) -> String {
        make_key(self.body.kind_tag(), self.body.name())
    }
}

/// Declared "parent must be ready before child is created" edge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub parent: String,
    pub child: String,
    /// Flow whose graph owns this edge; `None` for the root graph
    #[serde(default)]
    pub flow: Option<String>,
    /// Arguments bound to the child, typically a flow
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: Meta,
}

impl Dependency {
    pub fn new<P: Into<String>, C: Into<String>>(parent: P, child: C) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            ..Default::default()
        }
    }

    pub fn in_flow<S: Into<String>>(mut self, flow: S) -> Self {
        self.flow = Some(flow.into());
        self
    }

    pub fn arg<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

/// Every definition and dependency known to a scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionSet {
    #[serde(default)]
    pub definitions: Vec<ResourceDefinition>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl DefinitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, rejecting empty names and duplicate template keys
    pub fn add_definition(&mut self, definition: ResourceDefinition) -> Result<()> {
        if definition.body.name().is_empty() {
            return Err(DeployError::validation_field(
                format!("{} definition has an empty name", definition.body.kind_tag()),
                "name",
            ));
        }
        let key = definition.template_key();
        if self.find(&key).is_some() {
            return Err(DeployError::validation(format!(
                "Duplicate resource definition '{}'",
                key
            )));
        }
        self.definitions.push(definition);
        Ok(())
    }

    pub fn add_dependency(&mut self, dependency: Dependency) {
        self.dependencies.push(dependency);
    }

    pub fn definition(mut self, definition: ResourceDefinition) -> Result<Self> {
        self.add_definition(definition)?;
        Ok(self)
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.add_dependency(dependency);
        self
    }

    /// Check the whole set, for sets built through deserialization
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for definition in &self.definitions {
            if definition.body.name().is_empty() {
                return Err(DeployError::validation_field(
                    format!("{} definition has an empty name", definition.body.kind_tag()),
                    "name",
                ));
            }
            if !seen.insert(definition.template_key()) {
                return Err(DeployError::validation(format!(
                    "Duplicate resource definition '{}'",
                    definition.template_key()
                )));
            }
        }
        for dependency in &self.dependencies {
            if let Some(flow) = &dependency.flow {
                if self.flow(flow).is_none() {
                    return Err(DeployError::flow_not_found(flow.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn find(&self, template_key: &str) -> Option<&ResourceDefinition> {
        self.definitions
            .iter()
            .find(|definition| definition.template_key() == template_key)
    }

    pub fn flow(&self, name: &str) -> Option<&FlowTemplate> {
        self.definitions
            .iter()
            .filter_map(|definition| definition.body.as_flow())
            .find(|flow| flow.name == name)
    }

    pub fn flows(&self) -> impl Iterator<Item = &FlowTemplate> {
        self.definitions
            .iter()
            .filter_map(|definition| definition.body.as_flow())
    }
}
