//! Build-time plugin loader.
//!
//! Providers are compiled in and registered under a `module.attribute`
//! reference; configuration names providers by those references.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{validate_provider, MetricsProvider};
use crate::errors::{RefError, RefResult};

/// Attribute used when a reference has no dot.
pub const DEFAULT_ATTRIBUTE: &str = "provider";

pub type ProviderFactory = Arc<dyn Fn() -> anyhow::Result<MetricsProvider> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ProviderLoader {
    modules: BTreeMap<String, BTreeMap<String, ProviderFactory>>,
}

impl fmt::Debug for ProviderLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known: Vec<String> = self
            .modules
            .iter()
            .flat_map(|(module, attrs)| attrs.keys().map(move |a| format!("{module}.{a}")))
            .collect();
        f.debug_struct("ProviderLoader")
            .field("references", &known)
            .finish()
    }
}

impl ProviderLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: &str, attribute: &str, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<MetricsProvider> + Send + Sync + 'static,
    {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(attribute.to_string(), Arc::new(factory));
        self
    }

    pub fn with<F>(mut self, module: &str, attribute: &str, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<MetricsProvider> + Send + Sync + 'static,
    {
        self.register(module, attribute, factory);
        self
    }

    /// Resolve `module.attribute` (or `module`, meaning `module.provider`) and
    /// build the provider.
    pub fn import_provider(&self, reference: &str) -> RefResult<MetricsProvider> {
        let (module, attribute) = parse_reference(reference)?;

        let attrs = self.modules.get(module).ok_or_else(|| {
            RefError::invalid_provider(reference, format!("module '{module}' not found"))
        })?;
        let factory = attrs.get(attribute).ok_or_else(|| {
            RefError::invalid_provider(
                reference,
                format!("module '{module}' has no provider '{attribute}'"),
            )
        })?;

        let provider = factory().map_err(|e| {
            RefError::invalid_provider(reference, format!("provider factory failed: {e:#}"))
        })?;
        validate_provider(reference, &provider)?;
        Ok(provider)
    }
}

fn parse_reference(reference: &str) -> RefResult<(&str, &str)> {
    let malformed = |why: &str| {
        RefError::configuration(format!("malformed provider reference '{reference}': {why}"))
    };

    if reference.is_empty() {
        return Err(malformed("empty"));
    }
    if reference.chars().any(char::is_whitespace) {
        return Err(malformed("contains whitespace"));
    }
    if reference.split('.').any(str::is_empty) {
        return Err(malformed("empty path segment"));
    }

    Ok(match reference.rsplit_once('.') {
        Some((module, attribute)) => (module, attribute),
        None => (reference, DEFAULT_ATTRIBUTE),
    })
}
