use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use dagdeploy::backend::InMemoryBackend;
use dagdeploy::resources::DefinitionSet;
use dagdeploy::{DeployConfig, DeploymentOptions, ResourceStatus, Scheduler};
use tokio_util::sync::CancellationToken;

// Dry-run deployment of stack.yaml against the in-memory backend
#[tokio::main]
async fn main() -> Result<()> {
    dagdeploy::init_tracing(tracing::Level::INFO);

    let set: DefinitionSet = serde_yaml::from_str(include_str!("../stack.yaml"))
        .context("parsing stack.yaml")?;

    let backend = Arc::new(InMemoryBackend::new());
    // the database takes a couple of checks to come up
    backend.script_status(
        "statefulset/postgres",
        vec![
            ResourceStatus::NotReady,
            ResourceStatus::NotReady,
            ResourceStatus::Ready,
        ],
    );

    let config = DeployConfig::builder()
        .poll_interval(Duration::from_millis(200))
        .readiness_timeout(Some(Duration::from_secs(30)))
        .build()?;
    let scheduler = Scheduler::builder(set, backend.clone())
        .config(config)
        .build()?;

    let options = DeploymentOptions::root()
        .arg("release", "v2")
        .arg("db_password", "hunter2");
    let graph = scheduler.build_dependency_graph(&options)?;
    println!("Deploying in order: {:?}", graph.topological_order());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = graph.deploy(cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    for op in backend.operations() {
        tracing::debug!(?op, "backend call");
    }

    if !report.is_success() {
        anyhow::bail!("{} resources failed", report.failed().len());
    }
    Ok(())
}
