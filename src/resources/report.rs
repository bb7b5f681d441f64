//! Progress reporting for resources
//!
//! [`Reporting`] decorates any [`Resource`] and publishes what happens to it
//! to a [`ReportSink`] without changing create/delete/status semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::{Meta, Resource, ResourceStatus};
use crate::core::errors::Result;

/// Deployment event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeploymentEvent {
    CreateStarted {
        key: String,
    },
    CreateFinished {
        key: String,
        success: bool,
        error: Option<String>,
        duration_ms: u64,
    },
    StatusObserved {
        key: String,
        status: ResourceStatus,
        error: Option<String>,
    },
    DeleteFinished {
        key: String,
        success: bool,
    },
    DependencyFailed {
        key: String,
        dependency: String,
    },
}

impl DeploymentEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::CreateStarted { key }
            | Self::CreateFinished { key, .. }
            | Self::StatusObserved { key, .. }
            | Self::DeleteFinished { key, .. }
            | Self::DependencyFailed { key, .. } => key,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: DeploymentEvent,
}

/// Global sequence counter for events
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl EventEnvelope {
    pub fn new(event: DeploymentEvent) -> Self {
        Self {
            sequence: EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Observer of deployment progress
pub trait ReportSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Forwards events to `tracing`
pub struct LoggingSink;

impl ReportSink for LoggingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        match &envelope.event {
            DeploymentEvent::CreateFinished {
                key,
                success: false,
                error,
                ..
            } => tracing::warn!(key = %key, error = ?error, "Create failed"),
            DeploymentEvent::DependencyFailed { key, dependency } => {
                tracing::warn!(key = %key, dependency = %dependency, "Skipped after dependency failure")
            }
            event => tracing::debug!(seq = envelope.sequence, ?event, "Deployment event"),
        }
    }
}

/// Drops every event
pub struct NullSink;

impl ReportSink for NullSink {
    fn emit(&self, _envelope: &EventEnvelope) {}
}

/// Collects events in memory
#[derive(Default)]
pub struct BufferingSink {
    events: RwLock<Vec<EventEnvelope>>,
}

impl BufferingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    /// Events concerning one key, in emission order
    pub fn events_for(&self, key: &str) -> Vec<DeploymentEvent> {
        self.events
            .read()
            .iter()
            .filter(|envelope| envelope.event.key() == key)
            .map(|envelope| envelope.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl ReportSink for BufferingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Last known progress of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub key: String,
    pub created: bool,
    pub status: ResourceStatus,
    pub status_checks: u32,
    pub error: Option<String>,
}

impl NodeReport {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            created: false,
            status: ResourceStatus::NotReady,
            status_checks: 0,
            error: None,
        }
    }
}

/// Reporting decorator over any resource
pub struct Reporting<R> {
    inner: R,
    sink: Arc<dyn ReportSink>,
    state: RwLock<NodeReport>,
}

impl<R: Resource> Reporting<R> {
    pub fn new(inner: R, sink: Arc<dyn ReportSink>) -> Self {
        let state = RwLock::new(NodeReport::new(inner.key()));
        Self { inner, sink, state }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn emit(&self, event: DeploymentEvent) {
        self.sink.emit(&EventEnvelope::new(event));
    }
}

#[async_trait]
impl<R: Resource> Resource for Reporting<R> {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn meta(&self) -> &Meta {
        self.inner.meta()
    }

    async fn create(&self) -> Result<()> {
        let key = self.key().to_string();
        self.emit(DeploymentEvent::CreateStarted { key: key.clone() });
        let started = Instant::now();

        let result = self.inner.create().await;

        let error = result.as_ref().err().map(|e| e.to_string());
        {
            let mut state = self.state.write();
            state.created = result.is_ok();
            state.error = error.clone();
        }
        self.emit(DeploymentEvent::CreateFinished {
            key,
            success: result.is_ok(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    async fn delete(&self) -> Result<()> {
        let result = self.inner.delete().await;
        self.emit(DeploymentEvent::DeleteFinished {
            key: self.key().to_string(),
            success: result.is_ok(),
        });
        result
    }

    async fn status(&self, meta: &Meta) -> Result<ResourceStatus> {
        let result = self.inner.status(meta).await;

        let (status, error) = match &result {
            Ok(status) => (*status, None),
            Err(e) => (ResourceStatus::Error, Some(e.to_string())),
        };
        {
            let mut state = self.state.write();
            state.status = status;
            state.status_checks += 1;
            if error.is_some() {
                state.error = error.clone();
            }
        }
        self.emit(DeploymentEvent::StatusObserved {
            key: self.key().to_string(),
            status,
            error,
        });
        result
    }

    fn abandon(&self) {
        self.inner.abandon()
    }

    fn report(&self) -> Option<NodeReport> {
        Some(self.state.read().clone())
    }
}
