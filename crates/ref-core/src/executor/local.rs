use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{normalize, panic_message, ExecutionFailure, Executor};
use crate::definition::ExecutionDefinition;
use crate::metrics::{ExecutionResult, Metric};

/// Runs metric bodies in-process on the blocking pool.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn try_run(
        &self,
        metric: Arc<dyn Metric>,
        definition: Arc<ExecutionDefinition>,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        tokio::fs::create_dir_all(&definition.output_directory).await?;

        let def = definition.clone();
        let handle = tokio::task::spawn_blocking(move || metric.run(&def));

        // On timeout the JoinHandle is dropped; the blocking task keeps running detached.
        let joined = tokio::time::timeout(self.timeout, handle)
            .await
            .map_err(|_| ExecutionFailure::TimedOut(self.timeout))?;

        let outcome = joined.map_err(|e| {
            if e.is_panic() {
                ExecutionFailure::Panicked(panic_message(e.into_panic()))
            } else {
                ExecutionFailure::Panicked("metric task was cancelled".to_string())
            }
        })?;

        let result = outcome.map_err(ExecutionFailure::Metric)?;
        Ok(normalize(result, &definition))
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(
        &self,
        metric: Arc<dyn Metric>,
        definition: Arc<ExecutionDefinition>,
        _environment: Option<PathBuf>,
    ) -> ExecutionResult {
        let slug = metric.slug().to_string();
        match self.try_run(metric, definition.clone()).await {
            Ok(result) => result,
            Err(failure) => {
                tracing::warn!(
                    metric = %slug,
                    key = %definition.key,
                    error = %failure,
                    "execution failed"
                );
                failure.into_result(&definition, None)
            }
        }
    }
}
