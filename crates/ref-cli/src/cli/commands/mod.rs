use ref_core::{Config, ProviderLoader, ProviderRegistry};

use super::args::{Cli, Command};

pub mod providers;
pub mod solve;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    match cli.cmd {
        Command::Solve(args) => solve::run(args, config).await,
        Command::Providers => providers::run(&config),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    tracing::debug!(
        database_url = config.database_url(),
        providers = config.providers.len(),
        "config loaded"
    );
    Ok(config)
}

/// Providers compiled into this binary.
pub(crate) fn loader() -> ProviderLoader {
    let mut loader = ProviderLoader::new();
    ref_metrics_example::register(&mut loader);
    loader
}

pub(crate) fn registry(config: &Config) -> anyhow::Result<ProviderRegistry> {
    if config.providers.is_empty() {
        tracing::warn!("no providers configured");
    }
    Ok(ProviderRegistry::from_references(
        &config.providers,
        &loader(),
    )?)
}
