//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use dagdeploy::backend::InMemoryBackend;
use dagdeploy::resources::{
    BufferingSink, DefinitionSet, FactoryRegistry, FlowFactory, Manifest, ObjectKind,
    ResourceDefinition,
};
use dagdeploy::{DeployConfig, Scheduler};

pub fn init_tracing() {
    dagdeploy::init_tracing(tracing::Level::DEBUG);
}

pub fn object(kind: ObjectKind, name: &str) -> ResourceDefinition {
    ResourceDefinition::object(kind, Manifest::new(name))
}

/// Everything a test needs to drive and observe one scheduler
pub struct Harness {
    pub scheduler: Scheduler,
    pub backend: Arc<InMemoryBackend>,
    pub sink: Arc<BufferingSink>,
    pub flow_counter: Arc<AtomicU32>,
}

pub fn harness(set: DefinitionSet) -> Harness {
    harness_with(set, DeployConfig::development())
}

pub fn harness_with(set: DefinitionSet, config: DeployConfig) -> Harness {
    let backend = Arc::new(InMemoryBackend::new());
    let sink = Arc::new(BufferingSink::new());
    let flow_counter = Arc::new(AtomicU32::new(0));

    let registry = FactoryRegistry::with_defaults();
    registry.register(Arc::new(FlowFactory::with_counter(flow_counter.clone())));

    let scheduler = Scheduler::builder(set, backend.clone())
        .registry(registry)
        .config(config)
        .sink(sink.clone())
        .build()
        .expect("scheduler should build");

    Harness {
        scheduler,
        backend,
        sink,
        flow_counter,
    }
}
