use thiserror::Error;

/// Unified error type for graph construction and deployment
#[derive(Debug, Error)]
pub enum DeployError {
    /// Malformed definitions or options
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The dependency graph contains a cycle
    #[error("Cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A dependency names something that resolves to no node
    #[error("Dangling reference: '{from}' refers to unknown resource '{reference}'")]
    DanglingReference { from: String, reference: String },

    /// No factory registered for a resource kind
    #[error("Unknown resource kind: {kind}")]
    UnknownKind { kind: String },

    /// Requested flow template does not exist
    #[error("Flow not found: {name}")]
    FlowNotFound { name: String },

    /// A kind without existing-resource semantics was asked to adopt one
    #[error("Cannot adopt existing {kind} '{name}' without a resource definition")]
    Adoption { kind: String, name: String },

    /// The backend rejected or failed an operation
    #[error("Backend {operation} failed for {key}: {source}")]
    Backend {
        key: String,
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// An adopted object is missing from the backend
    #[error("Existing resource not found: {key}")]
    NotFound { key: String },

    /// Readiness polling exceeded its deadline
    #[error("Timed out waiting for {key} to become ready (timeout: {timeout_ms}ms)")]
    Timeout { key: String, timeout_ms: u64 },

    /// Operation not implemented for a resource kind
    #[error("{operation} is not supported for {key}")]
    Unsupported { operation: String, key: String },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DeployError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cycle error from the offending path
    pub fn cycle(path: Vec<String>) -> Self {
        Self::CycleDetected { path }
    }

    /// Create a dangling reference error
    pub fn dangling<F: Into<String>, R: Into<String>>(from: F, reference: R) -> Self {
        Self::DanglingReference {
            from: from.into(),
            reference: reference.into(),
        }
    }

    /// Create an unknown kind error
    pub fn unknown_kind<S: Into<String>>(kind: S) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Create a flow not found error
    pub fn flow_not_found<S: Into<String>>(name: S) -> Self {
        Self::FlowNotFound { name: name.into() }
    }

    /// Create an adoption error for a kind that cannot adopt
    pub fn adoption<K: Into<String>, N: Into<String>>(kind: K, name: N) -> Self {
        Self::Adoption {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap a backend failure for the given resource key
    pub fn backend<K: Into<String>, O: Into<String>>(key: K, operation: O, source: anyhow::Error) -> Self {
        Self::Backend {
            key: key.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a not found error for a missing adopted object
    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a readiness timeout error
    pub fn timeout<S: Into<String>>(key: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            key: key.into(),
            timeout_ms,
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported<O: Into<String>, K: Into<String>>(operation: O, key: K) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            key: key.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error with field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors raised while assembling a graph, before any backend call
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::CycleDetected { .. }
                | Self::DanglingReference { .. }
                | Self::UnknownKind { .. }
                | Self::FlowNotFound { .. }
                | Self::Adoption { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::CycleDetected { .. } => "cycle",
            Self::DanglingReference { .. } => "dangling_reference",
            Self::UnknownKind { .. } => "unknown_kind",
            Self::FlowNotFound { .. } => "flow_not_found",
            Self::Adoption { .. } => "adoption",
            Self::Backend { .. } => "backend",
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::Unsupported { .. } => "unsupported",
            Self::Configuration { .. } => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DeployError>;
