//! Execution definitions: the keyed, reproducible unit of work for one
//! (metric, dataset collection) pair.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::datasets::MetricDataset;
use crate::fingerprint::execution_identity;
use crate::metrics::Metric;
use crate::providers::MetricsProvider;
use crate::storage::{Store, StoreError};

/// Name of the bundle a metric writes into its output directory.
pub const OUTPUT_BUNDLE_FILENAME: &str = "output.json";

/// Name of the serialized definition handed to out-of-process metrics.
pub const DEFINITION_FILENAME: &str = "definition.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDefinition {
    /// `{provider}_{metric}_{digest}`; identical across runs for identical inputs.
    pub key: String,
    pub provider_slug: String,
    pub metric_slug: String,
    pub metric_version: String,
    /// `{provider}/{metric}/{digest}`, relative to the scratch and results roots.
    pub output_fragment: PathBuf,
    pub output_directory: PathBuf,
    pub dataset_fingerprint: String,
    pub metric_dataset: MetricDataset,
}

impl ExecutionDefinition {
    /// Absolute path of the bundle inside the output directory.
    pub fn bundle_path(&self) -> PathBuf {
        self.output_directory.join(OUTPUT_BUNDLE_FILENAME)
    }

    /// Bundle filename recorded when a metric does not declare its own.
    pub fn default_bundle_filename(&self) -> PathBuf {
        self.output_fragment.join(OUTPUT_BUNDLE_FILENAME)
    }

    pub fn to_output_path(&self, filename: impl AsRef<Path>) -> PathBuf {
        self.output_directory.join(filename)
    }
}

/// Builds definitions under a scratch root.
#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    scratch_root: PathBuf,
}

impl DefinitionBuilder {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn build(
        &self,
        provider: &MetricsProvider,
        metric: &dyn Metric,
        metric_dataset: MetricDataset,
    ) -> ExecutionDefinition {
        let metric_version = metric.version().unwrap_or(provider.version()).to_string();
        let identity = execution_identity(
            provider.slug(),
            metric.slug(),
            &metric_version,
            &metric_dataset.selector_entries(),
        );

        let output_fragment = PathBuf::from(provider.slug())
            .join(metric.slug())
            .join(&identity.hex);

        ExecutionDefinition {
            key: format!("{}_{}_{}", provider.slug(), metric.slug(), identity.hex),
            provider_slug: provider.slug().to_string(),
            metric_slug: metric.slug().to_string(),
            metric_version,
            output_directory: self.scratch_root.join(&output_fragment),
            output_fragment,
            dataset_fingerprint: metric_dataset.fingerprint(),
            metric_dataset,
        }
    }
}

/// Whether `definition` still has to run.
///
/// False once its key has a successful result covering the same dataset
/// fingerprint, unless `force` is set. A group whose datasets changed since
/// the last success runs again.
pub fn needs_execution(
    store: &Store,
    definition: &ExecutionDefinition,
    force: bool,
) -> Result<bool, StoreError> {
    if force {
        return Ok(true);
    }
    let Some(execution) = store.get_execution(&definition.key)? else {
        return Ok(true);
    };
    if execution.dataset_fingerprint != definition.dataset_fingerprint {
        tracing::debug!(
            key = %definition.key,
            stored = %execution.dataset_fingerprint,
            current = %definition.dataset_fingerprint,
            "datasets changed since last result"
        );
        return Ok(true);
    }
    Ok(!store.has_successful_result(&definition.key)?)
}
