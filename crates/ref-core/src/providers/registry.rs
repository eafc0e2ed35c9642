use std::collections::BTreeMap;
use std::sync::Arc;

use super::{MetricsProvider, ProviderLoader};
use crate::errors::{RefError, RefResult};

/// Providers taking part in a solve, keyed by slug.
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<MetricsProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import every reference. Providers that fail to import are logged and
    /// skipped; a malformed reference aborts.
    pub fn from_references<S: AsRef<str>>(
        references: &[S],
        loader: &ProviderLoader,
    ) -> RefResult<Self> {
        let mut registry = Self::new();
        for reference in references {
            let reference = reference.as_ref();
            match loader.import_provider(reference) {
                Ok(provider) => {
                    tracing::info!(
                        reference,
                        provider = provider.slug(),
                        version = provider.version(),
                        metrics = provider.len(),
                        "provider loaded"
                    );
                    registry.add(provider);
                }
                Err(e @ RefError::InvalidProvider { .. }) => {
                    tracing::error!(reference, error = %e, "skipping provider");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(registry)
    }

    /// Add a provider. A provider with the same slug is replaced.
    pub fn add(&mut self, provider: MetricsProvider) {
        let slug = provider.slug().to_string();
        if let Some(previous) = self.providers.insert(slug.clone(), Arc::new(provider)) {
            tracing::warn!(
                provider = %slug,
                replaced_version = previous.version(),
                "duplicate provider slug, last one wins"
            );
        }
    }

    pub fn get(&self, slug: &str) -> Option<&Arc<MetricsProvider>> {
        self.providers.get(slug)
    }

    /// Providers in slug order.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<MetricsProvider>> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
