//! Resource abstraction and the concrete resource kinds.
//!
//! Every schedulable unit of a dependency graph implements [`Resource`].
//! Factories registered in a [`FactoryRegistry`] turn definitions (or bare
//! names of pre-existing objects) into resources, parametrizing templates
//! with the graph's arguments along the way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::core::errors::Result;

pub mod definition;
pub mod flow;
pub mod object;
pub mod parametrize;
pub mod registry;
pub mod report;

pub use definition::{
    Dependency, DefinitionSet, FlowParameter, FlowTemplate, Manifest, ObjectKind, ObjectMeta,
    ResourceBody, ResourceDefinition,
};
pub use flow::{Flow, FlowFactory};
pub use object::{ExistingObject, ManagedObject, ObjectFactory};
pub use parametrize::{expand, parametrize};
pub use registry::{FactoryRegistry, ResourceFactory};
pub use report::{
    BufferingSink, DeploymentEvent, EventEnvelope, LoggingSink, NodeReport, NullSink, ReportSink,
    Reporting,
};

/// Generic key-value metadata attached to every definition
pub type Meta = HashMap<String, Value>;

/// Meta key holding a readiness timeout override, in seconds
pub const META_TIMEOUT: &str = "timeout";
/// Meta key listing resources that must be ready first
pub const META_AFTER: &str = "after";

/// Readiness state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    NotReady,
    Ready,
    Error,
}

impl ResourceStatus {
    /// Ready and Error are final; nothing transitions out of them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::NotReady => 0,
            Self::Ready => 1,
            Self::Error => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Error,
            _ => Self::NotReady,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "not ready"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Single-writer, multi-reader status slot
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: ResourceStatus) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub fn load(&self) -> ResourceStatus {
        ResourceStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: ResourceStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }
}

/// A schedulable unit wrapping one backend object or a nested graph.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Globally unique `<kind>/<name>` identifier
    fn key(&self) -> &str;

    /// Metadata from the definition this resource was built from
    fn meta(&self) -> &Meta;

    /// Ensure the backend object exists, creating it if absent.
    ///
    /// Must return promptly; readiness is observed through [`Resource::status`].
    async fn create(&self) -> Result<()>;

    async fn delete(&self) -> Result<()>;

    async fn status(&self, meta: &Meta) -> Result<ResourceStatus>;

    /// Stop background work started by `create` once the node is given up
    fn abandon(&self) {}

    /// Progress snapshot, when the resource is decorated with reporting
    fn report(&self) -> Option<NodeReport> {
        None
    }
}

/// Compose a graph key from a kind tag and a name
pub fn make_key(kind: &str, name: &str) -> String {
    format!("{}/{}", kind, name)
}

/// Split a `<kind>/<name>` key; both halves must be non-empty
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (kind, name) = key.split_once('/')?;
    if kind.is_empty() || name.is_empty() {
        return None;
    }
    Some((kind, name))
}

/// Read a whole-second duration from metadata
pub fn meta_seconds(meta: &Meta, key: &str) -> Option<u64> {
    match meta.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a string or list of strings from metadata
pub fn meta_strings(meta: &Meta, key: &str) -> Vec<String> {
    match meta.get(key) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
