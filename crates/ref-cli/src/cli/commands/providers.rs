use ref_core::Config;

use crate::exit_codes;

pub fn run(config: &Config) -> anyhow::Result<i32> {
    let registry = super::registry(config)?;
    for provider in registry.providers() {
        let environment = provider
            .environment()
            .map(|spec| spec.path().display().to_string())
            .unwrap_or_else(|| "in-process".to_string());
        println!(
            "{} {} ({}) [{}]",
            provider.slug(),
            provider.version(),
            provider.name(),
            environment
        );
        for metric in provider.metrics() {
            let version = metric.version().unwrap_or(provider.version());
            println!("  {} {} ({})", metric.slug(), version, metric.name());
        }
    }
    Ok(exit_codes::SUCCESS)
}
