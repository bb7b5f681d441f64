//! Flow nodes: nested graphs behind a single resource

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{harness, object};
use dagdeploy::resources::{DefinitionSet, Dependency, FlowTemplate, ObjectKind, ResourceDefinition};
use dagdeploy::{DeployError, DeploymentOptions, ResourceStatus};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// `pod/base -> flow/workers`, the flow deploying `pod/worker-$idx`
fn worker_flow() -> DefinitionSet {
    DefinitionSet::new()
        .definition(object(ObjectKind::Pod, "base"))
        .unwrap()
        .definition(object(ObjectKind::Pod, "worker-$idx"))
        .unwrap()
        .definition(ResourceDefinition::flow(
            FlowTemplate::new("workers")
                .parameter("idx", Some("0"))
                .resource("pod/worker-$idx"),
        ))
        .unwrap()
}

#[tokio::test]
async fn test_flow_deploys_nested_graph_with_bound_args() {
    common::init_tracing();
    let set = worker_flow().dependency(Dependency::new("pod/base", "flow/workers").arg("idx", "7"));
    let h = harness(set);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    assert_eq!(graph.keys(), vec!["pod/base".to_string(), "flow/workers-1".to_string()]);

    let report = graph.deploy(CancellationToken::new()).await;

    assert!(report.is_success());
    assert_eq!(report.status_of("flow/workers-1"), Some(ResourceStatus::Ready));
    assert!(h.backend.contains("pod/worker-7"));
    assert!(!h.backend.contains("pod/worker-0"));
}

#[tokio::test]
async fn test_flow_parameter_default_applies_when_unbound() {
    let set = worker_flow().dependency(Dependency::new("pod/base", "flow/workers"));
    let h = harness(set);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let report = graph.deploy(CancellationToken::new()).await;

    assert!(report.is_success());
    assert!(h.backend.contains("pod/worker-0"));
}

#[tokio::test]
async fn test_nested_failure_fails_flow_and_dependents() {
    let set = worker_flow()
        .definition(object(ObjectKind::Service, "frontend"))
        .unwrap()
        .dependency(Dependency::new("pod/base", "flow/workers").arg("idx", "1"))
        .dependency(Dependency::new("flow/workers", "service/frontend"));
    let h = harness(set);
    h.backend.fail_create("pod/worker-1", "image pull failed");

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let report = graph.deploy(CancellationToken::new()).await;

    assert_eq!(report.status_of("pod/base"), Some(ResourceStatus::Ready));
    assert_eq!(report.status_of("flow/workers-1"), Some(ResourceStatus::Error));
    assert_eq!(report.status_of("service/frontend"), Some(ResourceStatus::Error));
    assert_eq!(h.backend.create_count("service/frontend"), 0);
}

#[tokio::test]
async fn test_invalid_nested_graph_fails_flow_create() {
    let set = DefinitionSet::new()
        .definition(object(ObjectKind::Job, "a"))
        .unwrap()
        .definition(object(ObjectKind::Job, "b"))
        .unwrap()
        .definition(ResourceDefinition::flow(FlowTemplate::new("broken")))
        .unwrap()
        .definition(object(ObjectKind::Pod, "trigger"))
        .unwrap()
        .dependency(Dependency::new("job/a", "job/b").in_flow("broken"))
        .dependency(Dependency::new("job/b", "job/a").in_flow("broken"))
        .dependency(Dependency::new("pod/trigger", "flow/broken"));
    let h = harness(set);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let report = graph.deploy(CancellationToken::new()).await;

    let flow = report.node("flow/broken-1").unwrap();
    assert_eq!(flow.status, ResourceStatus::Error);
    assert!(flow
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("Cycle detected"));
    assert_eq!(h.backend.create_count("job/a"), 0);
}

#[test]
fn test_concurrent_instantiation_yields_distinct_keys() {
    let set = worker_flow().dependency(Dependency::new("pod/base", "flow/workers"));
    let h = harness(set);

    let keys: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    let graph = h
                        .scheduler
                        .build_dependency_graph(&DeploymentOptions::root())
                        .unwrap();
                    graph
                        .keys()
                        .into_iter()
                        .find(|key| key.starts_with("flow/"))
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let distinct: HashSet<&String> = keys.iter().collect();
    assert_eq!(distinct.len(), 2);
    assert!(distinct.contains(&"flow/workers-1".to_string()));
    assert!(distinct.contains(&"flow/workers-2".to_string()));
    assert_eq!(h.flow_counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_flow_delete_is_unsupported() {
    let set = worker_flow().dependency(Dependency::new("pod/base", "flow/workers"));
    let h = harness(set);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let flow = graph.resource("flow/workers-1").unwrap();

    assert!(matches!(
        flow.delete().await,
        Err(DeployError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_cancelling_parent_run_stops_nested_run() {
    let set = worker_flow().dependency(Dependency::new("pod/base", "flow/workers"));
    let h = harness(set);
    h.backend
        .script_status("pod/worker-0", vec![ResourceStatus::NotReady]);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = graph.deploy(cancel).await;

    assert!(report.cancelled);
    assert_eq!(report.status_of("flow/workers-1"), Some(ResourceStatus::NotReady));
    assert!(h.backend.contains("pod/worker-0"));
}

#[tokio::test]
async fn test_flow_parameter_default_resolves_in_parent_graph() {
    let set = DefinitionSet::new()
        .definition(object(ObjectKind::Pod, "base"))
        .unwrap()
        .definition(object(ObjectKind::Pod, "worker-$idx"))
        .unwrap()
        .definition(ResourceDefinition::flow(
            FlowTemplate::new("workers")
                .parameter("idx", Some("${env}"))
                .resource("pod/worker-$idx"),
        ))
        .unwrap()
        .dependency(Dependency::new("pod/base", "flow/workers"));
    let h = harness(set);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root().arg("env", "prod"))
        .unwrap();
    let report = graph.deploy(CancellationToken::new()).await;

    assert!(report.is_success());
    assert!(h.backend.contains("pod/worker-prod"));
    assert!(!h.backend.contains("pod/worker-${env}"));
}

#[tokio::test]
async fn test_each_binding_set_gets_its_own_flow_instance() {
    let set = worker_flow()
        .definition(object(ObjectKind::Pod, "a"))
        .unwrap()
        .definition(object(ObjectKind::Pod, "b"))
        .unwrap()
        .dependency(Dependency::new("pod/a", "flow/workers").arg("idx", "1"))
        .dependency(Dependency::new("pod/b", "flow/workers").arg("idx", "2"));
    let h = harness(set);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let mut keys = graph.keys();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "flow/workers-1".to_string(),
            "flow/workers-2".to_string(),
            "pod/a".to_string(),
            "pod/b".to_string(),
            "pod/base".to_string(),
        ]
    );

    let report = graph.deploy(CancellationToken::new()).await;

    assert!(report.is_success());
    assert!(h.backend.contains("pod/worker-1"));
    assert!(h.backend.contains("pod/worker-2"));
}

#[tokio::test]
async fn test_timed_out_flow_stops_nested_run() {
    let set = DefinitionSet::new()
        .definition(object(ObjectKind::Pod, "worker-$idx"))
        .unwrap()
        .definition(
            ResourceDefinition::flow(
                FlowTemplate::new("workers")
                    .parameter("idx", Some("0"))
                    .resource("pod/worker-$idx"),
            )
            .with_meta("timeout", json!(0)),
        )
        .unwrap()
        .definition(object(ObjectKind::Pod, "trigger"))
        .unwrap()
        .dependency(Dependency::new("pod/trigger", "flow/workers"));
    let h = harness(set);
    h.backend
        .script_status("pod/worker-0", vec![ResourceStatus::NotReady]);

    let graph = h
        .scheduler
        .build_dependency_graph(&DeploymentOptions::root())
        .unwrap();
    let report = graph.deploy(CancellationToken::new()).await;

    let flow = report.node("flow/workers-1").unwrap();
    assert_eq!(flow.status, ResourceStatus::Error);
    assert!(flow
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Timed out waiting for"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let checks = h.backend.status_count("pod/worker-0");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.status_count("pod/worker-0"), checks);
}
