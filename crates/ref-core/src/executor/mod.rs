//! Executors run a metric against a definition and always hand back an
//! [`ExecutionResult`]; metric failures never escape as errors.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::definition::ExecutionDefinition;
use crate::metrics::{ExecutionResult, Metric};

pub mod isolated;
pub mod local;

pub use isolated::{IsolatedExecutor, DEFINITION_ENV_VAR};
pub use local::LocalExecutor;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `metric` for `definition`. `environment` is the provider's
    /// provisioned runtime, when it has one.
    async fn run(
        &self,
        metric: Arc<dyn Metric>,
        definition: Arc<ExecutionDefinition>,
        environment: Option<PathBuf>,
    ) -> ExecutionResult;
}

/// Why a metric did not produce a successful result.
#[derive(Debug, Error)]
pub(crate) enum ExecutionFailure {
    #[error("metric returned an error: {0:#}")]
    Metric(anyhow::Error),

    #[error("metric panicked: {0}")]
    Panicked(String),

    #[error("metric timed out after {0:?}")]
    TimedOut(Duration),

    #[error("failed to prepare execution files: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start metric command: {0}")]
    Spawn(String),

    #[error("metric command exited with {0}")]
    Exit(String),

    #[error("metric command produced no usable bundle: {0:#}")]
    Bundle(anyhow::Error),
}

impl ExecutionFailure {
    /// Failed result for `definition`. `captured` is appended to the diagnostics.
    pub(crate) fn into_result(
        self,
        definition: &ExecutionDefinition,
        captured: Option<&str>,
    ) -> ExecutionResult {
        let diagnostics = match captured.filter(|c| !c.trim().is_empty()) {
            Some(output) => format!("{self}\n{output}"),
            None => self.to_string(),
        };
        ExecutionResult::failure(definition, diagnostics)
    }
}

/// Force the result to describe `definition`; successful results without a
/// bundle get the default one, failed results never carry one.
pub(crate) fn normalize(mut result: ExecutionResult, definition: &ExecutionDefinition) -> ExecutionResult {
    result.key = definition.key.clone();
    result.output_fragment = definition.output_fragment.clone();
    if result.successful {
        if result.bundle_filename.is_none() {
            result.bundle_filename = Some(definition.default_bundle_filename());
        }
    } else {
        result.bundle_filename = None;
        result.assets.clear();
    }
    result
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
