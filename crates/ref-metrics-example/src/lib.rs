//! Example metrics provider.
//!
//! Registered with a [`ProviderLoader`] under `ref_metrics_example`, so a
//! configuration can name it as `ref_metrics_example` or
//! `ref_metrics_example.provider`.

use ref_core::providers::loader::DEFAULT_ATTRIBUTE;
use ref_core::{MetricsProvider, ProviderLoader};

pub mod annual_cycle;
pub mod inventory;

pub use annual_cycle::AnnualCycleMetric;
pub use inventory::InventoryMetric;

/// Module name the provider is registered under.
pub const MODULE: &str = "ref_metrics_example";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the provider with both example metrics.
pub fn provider() -> anyhow::Result<MetricsProvider> {
    let mut provider = MetricsProvider::new("Example", VERSION);
    provider.register(AnnualCycleMetric::new())?;
    provider.register(InventoryMetric::new())?;
    Ok(provider)
}

/// Make the provider importable through `loader`.
pub fn register(loader: &mut ProviderLoader) {
    loader.register(MODULE, DEFAULT_ATTRIBUTE, provider);
}
