use std::sync::Arc;
use std::time::Duration;

use ref_core::report::progress::{ProgressEvent, ProgressSink};
use ref_core::{Config, DataCatalog, Solver};

use crate::cli::args::SolveArgs;
use crate::exit_codes;

pub async fn run(args: SolveArgs, mut config: Config) -> anyhow::Result<i32> {
    config.force_recompute |= args.force;

    let catalog = DataCatalog::load(&args.catalog)?;
    tracing::info!(
        catalog = %args.catalog.display(),
        rows = catalog.len(),
        "catalog loaded"
    );

    let progress: ProgressSink = Arc::new(|event: ProgressEvent| {
        tracing::info!(done = event.done, total = event.total, "progress");
    });
    let solver = Solver::from_config(&config, super::registry(&config)?)?.with_progress(progress);

    let summary = solver
        .solve(&catalog, Duration::from_secs(args.timeout))
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(exit_codes::SUCCESS)
}
