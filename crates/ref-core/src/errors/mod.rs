//! Error types for the orchestration core.

use std::path::PathBuf;

use crate::storage::StoreError;

/// Errors surfaced by the registry, provisioner, solver and configuration layers.
///
/// Failures inside a metric body never show up here: the executor converts
/// them into failed [`ExecutionResult`](crate::metrics::ExecutionResult)s.
#[derive(Debug, thiserror::Error)]
pub enum RefError {
    /// A metric does not satisfy the metric capability set.
    #[error("invalid metric: '{metric}': {reason}")]
    InvalidMetric { metric: String, reason: String },

    /// No metric is registered under the requested slug.
    #[error("metric not found: {slug}")]
    MetricNotFound { slug: String },

    /// A provider reference could not be resolved or the provider is malformed.
    #[error("invalid provider: '{reference}': {reason}")]
    InvalidProvider { reference: String, reason: String },

    /// The dataset catalog handed to the core is unreadable or malformed.
    #[error("invalid catalog: {message}")]
    InvalidCatalog { message: String },

    /// Configuration-level problem. Aborts the whole run.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The environment manager failed to materialize an environment.
    #[error("failed to provision environment at {}: {message}", path.display())]
    EnvironmentProvision { path: PathBuf, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RefError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_catalog(message: impl Into<String>) -> Self {
        Self::InvalidCatalog {
            message: message.into(),
        }
    }

    pub fn invalid_metric(metric: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetric {
            metric: metric.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_provider(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProvider {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn provision(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::EnvironmentProvision {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the error must abort the run rather than a single provider or unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::InvalidCatalog { .. }
        )
    }

    /// Exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } | Self::InvalidCatalog { .. } => 1,
            _ => 2,
        }
    }
}

/// Result type for core operations.
pub type RefResult<T> = Result<T, RefError>;
