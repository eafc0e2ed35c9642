//! Metric providers: named, versioned collections of metrics.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{RefError, RefResult};
use crate::metrics::Metric;

pub mod loader;
pub mod registry;

pub use loader::{ProviderFactory, ProviderLoader};
pub use registry::ProviderRegistry;

/// Lower-case the name and replace spaces with `-`.
pub fn slugify(value: &str) -> String {
    value.to_lowercase().replace(' ', "-")
}

/// Lock/manifest file describing a provider's isolated runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    path: PathBuf,
}

impl EnvironmentSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct MetricsProvider {
    name: String,
    slug: String,
    version: String,
    environment: Option<EnvironmentSpec>,
    metrics: BTreeMap<String, Arc<dyn Metric>>,
}

impl fmt::Debug for MetricsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsProvider")
            .field("name", &self.name)
            .field("slug", &self.slug)
            .field("version", &self.version)
            .field("environment", &self.environment)
            .field("metrics", &self.metrics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MetricsProvider {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            slug: slugify(&name),
            name,
            version: version.into(),
            environment: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_environment(mut self, spec: EnvironmentSpec) -> Self {
        self.environment = Some(spec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn environment(&self) -> Option<&EnvironmentSpec> {
        self.environment.as_ref()
    }

    /// Register a metric. Re-registering a slug replaces the previous metric.
    pub fn register(&mut self, metric: impl Metric + 'static) -> RefResult<()> {
        self.register_arc(Arc::new(metric))
    }

    pub fn register_arc(&mut self, metric: Arc<dyn Metric>) -> RefResult<()> {
        validate_metric(metric.as_ref())?;
        self.metrics.insert(metric.slug().to_lowercase(), metric);
        Ok(())
    }

    /// Look up a metric by slug, case-insensitively.
    pub fn get(&self, slug: &str) -> RefResult<Arc<dyn Metric>> {
        self.metrics
            .get(&slug.to_lowercase())
            .cloned()
            .ok_or_else(|| RefError::MetricNotFound {
                slug: slug.to_string(),
            })
    }

    /// Metrics in slug order.
    pub fn metrics(&self) -> impl Iterator<Item = &Arc<dyn Metric>> {
        self.metrics.values()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

fn validate_metric(metric: &dyn Metric) -> RefResult<()> {
    let label = if metric.slug().is_empty() {
        metric.name()
    } else {
        metric.slug()
    };
    if metric.name().trim().is_empty() {
        return Err(RefError::invalid_metric(label, "metric name is empty"));
    }
    if metric.slug().trim().is_empty() {
        return Err(RefError::invalid_metric(label, "metric slug is empty"));
    }
    let requirements = metric.data_requirements();
    if requirements.is_empty() {
        return Err(RefError::invalid_metric(
            label,
            "metric declares no data requirements",
        ));
    }
    let mut seen = HashSet::new();
    for requirement in requirements {
        if !seen.insert(requirement.source_type) {
            return Err(RefError::invalid_metric(
                label,
                format!(
                    "source type '{}' is required more than once",
                    requirement.source_type
                ),
            ));
        }
    }
    Ok(())
}

/// Check a provider against the provider capability set.
pub(crate) fn validate_provider(reference: &str, provider: &MetricsProvider) -> RefResult<()> {
    for (field, value) in [
        ("name", provider.name()),
        ("slug", provider.slug()),
        ("version", provider.version()),
    ] {
        if value.trim().is_empty() {
            return Err(RefError::invalid_provider(
                reference,
                format!("provider {field} is empty"),
            ));
        }
    }
    Ok(())
}
