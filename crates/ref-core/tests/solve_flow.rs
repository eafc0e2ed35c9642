//! End-to-end solve tests: matching, execution, failure isolation and
//! idempotent re-runs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ref_core::datasets::{DataCatalog, DatasetCatalogEntry, SourceDatasetType};
use ref_core::definition::{DefinitionBuilder, ExecutionDefinition};
use ref_core::errors::{RefError, RefResult};
use ref_core::executor::LocalExecutor;
use ref_core::metrics::{AssetType, ExecutionResult, Metric, OutputBundle};
use ref_core::providers::{EnvironmentSpec, MetricsProvider, ProviderRegistry};
use ref_core::provisioner::{EnvironmentManager, Provisioner};
use ref_core::report::progress::{ProgressEvent, ProgressSink};
use ref_core::requirements::{DataRequirement, GroupBy};
use ref_core::solver::{SolveOptions, Solver};
use ref_core::storage::Store;

const BUDGET: Duration = Duration::from_secs(30);

/// Writes a bundle with one plot and succeeds.
struct MockMetric {
    requirements: Vec<DataRequirement>,
}

/// Always returns an error.
struct FailedMetric {
    requirements: Vec<DataRequirement>,
}

/// Panics partway through its computation.
struct PanickingMetric {
    requirements: Vec<DataRequirement>,
}

fn by_source_id() -> Vec<DataRequirement> {
    vec![DataRequirement::new(
        SourceDatasetType::Cmip6,
        GroupBy::facets(["source_id"]),
    )]
}

impl Metric for MockMetric {
    fn name(&self) -> &str {
        "Mock"
    }
    fn slug(&self) -> &str {
        "mock"
    }
    fn data_requirements(&self) -> &[DataRequirement] {
        &self.requirements
    }
    fn run(&self, definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
        std::fs::write(definition.to_output_path("map.png"), b"png")?;
        let mut bundle = OutputBundle::default();
        bundle.add(AssetType::Plot, "map", "map.png", "Map", "annual mean");
        bundle.write(&definition.bundle_path())?;
        Ok(ExecutionResult::from_bundle(
            definition,
            definition.default_bundle_filename(),
            &bundle,
        ))
    }
}

impl Metric for FailedMetric {
    fn name(&self) -> &str {
        "Failed"
    }
    fn slug(&self) -> &str {
        "failed"
    }
    fn data_requirements(&self) -> &[DataRequirement] {
        &self.requirements
    }
    fn run(&self, _definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
        anyhow::bail!("this metric always fails")
    }
}

impl Metric for PanickingMetric {
    fn name(&self) -> &str {
        "Panicking"
    }
    fn slug(&self) -> &str {
        "panicking"
    }
    fn data_requirements(&self) -> &[DataRequirement] {
        &self.requirements
    }
    fn run(&self, _definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
        panic!("divides by zero on an empty time axis")
    }
}

fn provider(name: &str, with_failing: bool) -> MetricsProvider {
    let mut provider = MetricsProvider::new(name, "1.0.0");
    provider
        .register(MockMetric {
            requirements: by_source_id(),
        })
        .unwrap();
    if with_failing {
        provider
            .register(FailedMetric {
                requirements: by_source_id(),
            })
            .unwrap();
    }
    provider
}

fn catalog() -> DataCatalog {
    DataCatalog::new(vec![
        DatasetCatalogEntry::new(SourceDatasetType::Cmip6, "CMIP6.ABC.tas", "/data/abc_tas.nc")
            .with_facet("source_id", "ABC"),
        DatasetCatalogEntry::new(SourceDatasetType::Cmip6, "CMIP6.ABC.pr", "/data/abc_pr.nc")
            .with_facet("source_id", "ABC"),
    ])
    .unwrap()
}

fn catalog_with(extra: Vec<DatasetCatalogEntry>) -> DataCatalog {
    let mut entries = vec![
        DatasetCatalogEntry::new(SourceDatasetType::Cmip6, "CMIP6.ABC.tas", "/data/abc_tas.nc")
            .with_facet("source_id", "ABC"),
        DatasetCatalogEntry::new(SourceDatasetType::Cmip6, "CMIP6.ABC.pr", "/data/abc_pr.nc")
            .with_facet("source_id", "ABC"),
    ];
    entries.extend(extra);
    DataCatalog::new(entries).unwrap()
}

fn solver(dir: &Path, registry: ProviderRegistry, store: Store) -> Solver {
    Solver::new(
        registry,
        store,
        DefinitionBuilder::new(dir.join("scratch")),
        Arc::new(LocalExecutor::new(Duration::from_secs(10))),
        SolveOptions {
            concurrency: 2,
            ..SolveOptions::default()
        },
    )
    .with_results_root(dir.join("results"))
}

fn registry(providers: Vec<MetricsProvider>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for p in providers {
        registry.add(p);
    }
    registry
}

#[tokio::test]
async fn failing_metric_does_not_affect_sibling() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let solver = solver(dir.path(), registry(vec![provider("Example", true)]), store.clone());

    let summary = solver.solve(&catalog(), BUDGET).await?;
    assert_eq!(summary.providers_run, 1);
    assert_eq!(summary.executions_created, 2);
    assert_eq!(summary.executions_succeeded, 1);
    assert_eq!(summary.executions_failed, 1);
    assert_eq!(summary.executions_pending, 0);
    assert!(summary.providers_failed.is_empty());

    let executions = store.executions()?;
    assert_eq!(executions.len(), 2);
    let outcomes: Vec<(String, Vec<bool>)> = executions
        .iter()
        .map(|e| {
            let results = store.results_for_execution(e.id).unwrap();
            (
                e.metric_slug.clone(),
                results.iter().map(|r| r.successful).collect(),
            )
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("failed".to_string(), vec![false]),
            ("mock".to_string(), vec![true]),
        ]
    );

    let failed = store.results_for_execution(executions[0].id)?;
    assert_eq!(failed[0].bundle_filename, None);
    assert!(failed[0]
        .diagnostics
        .as_deref()
        .unwrap_or_default()
        .contains("this metric always fails"));
    Ok(())
}

#[tokio::test]
async fn assets_and_outputs_are_recorded() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let solver = solver(dir.path(), registry(vec![provider("Example", false)]), store.clone());
    solver.solve(&catalog(), BUDGET).await?;

    let execution = store.executions()?.remove(0);
    assert!(execution.key.starts_with("example_mock_"));
    let result = store.results_for_execution(execution.id)?.remove(0);
    let bundle = result.bundle_filename.clone().unwrap();
    assert_eq!(
        PathBuf::from(&bundle),
        PathBuf::from(&result.output_fragment).join("output.json")
    );
    assert!(dir.path().join("results").join(&bundle).exists());
    assert!(dir
        .path()
        .join("results")
        .join(&result.output_fragment)
        .join("map.png")
        .exists());

    let assets = store.assets_for_result(result.id)?;
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].asset_type, AssetType::Plot);
    assert_eq!(assets[0].short_name, "map");
    assert_eq!(assets[0].description, "annual mean");
    Ok(())
}

#[tokio::test]
async fn second_solve_skips_successes_and_retries_failures() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let solver = solver(dir.path(), registry(vec![provider("Example", true)]), store.clone());

    solver.solve(&catalog(), BUDGET).await?;
    let second = solver.solve(&catalog(), BUDGET).await?;

    assert_eq!(second.executions_skipped, 1);
    assert_eq!(second.executions_created, 0);
    assert_eq!(second.executions_failed, 1);
    assert_eq!(second.executions_succeeded, 0);
    assert_eq!(store.count_executions()?, 2);

    let failed = store
        .executions()?
        .into_iter()
        .find(|e| e.metric_slug == "failed")
        .unwrap();
    assert_eq!(store.results_for_execution(failed.id)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn force_recompute_reruns_everything() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    solver(dir.path(), registry(vec![provider("Example", false)]), store.clone())
        .solve(&catalog(), BUDGET)
        .await?;

    let forced = Solver::new(
        registry(vec![provider("Example", false)]),
        store.clone(),
        DefinitionBuilder::new(dir.path().join("scratch")),
        Arc::new(LocalExecutor::new(Duration::from_secs(10))),
        SolveOptions {
            force_recompute: true,
            ..SolveOptions::default()
        },
    );
    let summary = forced.solve(&catalog(), BUDGET).await?;
    assert_eq!(summary.executions_skipped, 0);
    assert_eq!(summary.executions_succeeded, 1);
    assert_eq!(summary.executions_created, 0);

    let execution = store.executions()?.remove(0);
    assert_eq!(store.results_for_execution(execution.id)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn zero_budget_leaves_everything_pending() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let solver = solver(dir.path(), registry(vec![provider("Example", true)]), store.clone());

    let summary = solver.solve(&catalog(), Duration::ZERO).await?;
    assert_eq!(summary.executions_pending, 2);
    assert_eq!(summary.executions_created, 0);
    assert_eq!(summary.providers_run, 0);
    assert_eq!(store.count_executions()?, 0);
    Ok(())
}

#[tokio::test]
async fn no_matching_data_schedules_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let solver = solver(dir.path(), registry(vec![provider("Example", true)]), store.clone());

    let summary = solver.solve(&DataCatalog::default(), BUDGET).await?;
    assert_eq!(summary, Default::default());
    assert_eq!(store.providers()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn progress_reports_every_completion() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink_events = events.clone();
    let sink: ProgressSink = Arc::new(move |e: ProgressEvent| sink_events.lock().unwrap().push(e));

    let solver = solver(
        dir.path(),
        registry(vec![provider("Example", true)]),
        Store::memory()?,
    )
    .with_progress(sink);
    solver.solve(&catalog(), BUDGET).await?;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events.last().copied(), Some(ProgressEvent { done: 2, total: 2 }));
    Ok(())
}

/// Fails creation for specs whose file name starts with `broken`, or aborts
/// for `fatal`; creates the directory otherwise.
struct SelectiveManager;

#[async_trait]
impl EnvironmentManager for SelectiveManager {
    async fn create(&self, spec: &EnvironmentSpec, target: &Path) -> RefResult<()> {
        let name = spec
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with("broken") {
            return Err(RefError::provision(target, "solver failed: unsatisfiable"));
        }
        if name.starts_with("fatal") {
            return Err(RefError::configuration("conda executable not found"));
        }
        std::fs::create_dir_all(target).map_err(|e| RefError::provision(target, e.to_string()))
    }

    fn command(&self, _env: &Path, args: &[String]) -> Vec<String> {
        args.to_vec()
    }
}

fn provider_with_env(name: &str, spec: PathBuf) -> MetricsProvider {
    provider(name, false).with_environment(EnvironmentSpec::new(spec))
}

#[tokio::test]
async fn provisioning_failure_only_affects_its_provider() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let broken_spec = dir.path().join("broken.yml");
    let healthy_spec = dir.path().join("healthy.yml");
    std::fs::write(&broken_spec, "dependencies: [does-not-exist]\n")?;
    std::fs::write(&healthy_spec, "dependencies: [numpy]\n")?;

    let store = Store::memory()?;
    let registry = registry(vec![
        provider_with_env("Broken", broken_spec),
        provider_with_env("Healthy", healthy_spec),
    ]);
    let provisioner = Arc::new(Provisioner::new(dir.path().join("envs"), Arc::new(SelectiveManager)));
    let solver = solver(dir.path(), registry, store.clone()).with_provisioner(provisioner);

    let summary = solver.solve(&catalog(), BUDGET).await?;
    assert_eq!(summary.providers_failed, vec!["broken".to_string()]);
    assert_eq!(summary.executions_pending, 1);
    assert_eq!(summary.executions_succeeded, 1);
    assert_eq!(summary.providers_run, 1);

    let executions = store.executions()?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].provider_slug, "healthy");
    Ok(())
}

#[tokio::test]
async fn configuration_error_aborts_after_draining() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fatal_spec = dir.path().join("fatal.yml");
    std::fs::write(&fatal_spec, "dependencies: [numpy]\n")?;

    let store = Store::memory()?;
    // "alpha" has no environment and dispatches before "beta" provisions.
    let registry = registry(vec![
        provider("Alpha", false),
        provider_with_env("Beta", fatal_spec),
    ]);
    let provisioner = Arc::new(Provisioner::new(dir.path().join("envs"), Arc::new(SelectiveManager)));
    let solver = solver(dir.path(), registry, store.clone()).with_provisioner(provisioner);

    let err = solver.solve(&catalog(), BUDGET).await.unwrap_err();
    assert!(err.is_fatal());

    let executions = store.executions()?;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].provider_slug, "alpha");
    assert_eq!(store.results_for_execution(executions[0].id)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn panicking_metric_is_recorded_as_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let mut provider = provider("Example", false);
    provider.register(PanickingMetric {
        requirements: by_source_id(),
    })?;
    let solver = solver(dir.path(), registry(vec![provider]), store.clone());

    let summary = solver.solve(&catalog(), BUDGET).await?;
    assert_eq!(summary.executions_succeeded, 1);
    assert_eq!(summary.executions_failed, 1);

    let executions = store.executions()?;
    let outcomes: Vec<(String, Vec<bool>)> = executions
        .iter()
        .map(|e| {
            let results = store.results_for_execution(e.id).unwrap();
            (
                e.metric_slug.clone(),
                results.iter().map(|r| r.successful).collect(),
            )
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("mock".to_string(), vec![true]),
            ("panicking".to_string(), vec![false]),
        ]
    );

    let panicked = store.results_for_execution(executions[1].id)?;
    let diagnostics = panicked[0].diagnostics.as_deref().unwrap_or_default();
    assert!(diagnostics.contains("panicked"), "{diagnostics}");
    assert!(diagnostics.contains("divides by zero"), "{diagnostics}");
    Ok(())
}

#[tokio::test]
async fn new_dataset_in_group_reruns_the_execution() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::memory()?;
    let solver = solver(dir.path(), registry(vec![provider("Example", false)]), store.clone());

    solver.solve(&catalog(), BUDGET).await?;
    let before = store.executions()?.remove(0);

    let grown = catalog_with(vec![DatasetCatalogEntry::new(
        SourceDatasetType::Cmip6,
        "CMIP6.ABC.tos",
        "/data/abc_tos.nc",
    )
    .with_facet("source_id", "ABC")]);
    let second = solver.solve(&grown, BUDGET).await?;
    assert_eq!(second.executions_succeeded, 1);
    assert_eq!(second.executions_skipped, 0);
    assert_eq!(second.executions_created, 0);

    let after = store.executions()?.remove(0);
    assert_eq!(after.id, before.id);
    assert_ne!(after.dataset_fingerprint, before.dataset_fingerprint);
    assert_eq!(store.results_for_execution(after.id)?.len(), 2);

    let third = solver.solve(&grown, BUDGET).await?;
    assert_eq!(third.executions_skipped, 1);
    assert_eq!(third.executions_succeeded, 0);
    Ok(())
}

#[tokio::test]
async fn failed_asset_write_leaves_execution_outstanding() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("ref.db");
    let store = Store::open(&db)?;
    let solver = solver(dir.path(), registry(vec![provider("Example", false)]), store.clone());

    let side = rusqlite::Connection::open(&db)?;
    side.execute_batch(
        "CREATE TRIGGER reject_assets BEFORE INSERT ON execution_result_asset
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )?;

    let first = solver.solve(&catalog(), BUDGET).await?;
    assert_eq!(first.executions_succeeded, 0);
    assert_eq!(first.executions_failed, 1);
    let execution = store.executions()?.remove(0);
    assert!(store.results_for_execution(execution.id)?.is_empty());
    assert!(!store.has_successful_result(&execution.key)?);

    side.execute_batch("DROP TRIGGER reject_assets;")?;
    let second = solver.solve(&catalog(), BUDGET).await?;
    assert_eq!(second.executions_skipped, 0);
    assert_eq!(second.executions_succeeded, 1);
    let result = store.results_for_execution(execution.id)?.remove(0);
    assert_eq!(store.assets_for_result(result.id)?.len(), 1);
    Ok(())
}

#[cfg(unix)]
mod isolated {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ref_core::executor::IsolatedExecutor;
    use ref_core::metrics::CommandLineMetric;

    use super::*;

    /// Creates environments as plain directories and runs commands through
    /// a shell that first records the environment it was given.
    #[derive(Default)]
    struct RecordingManager {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl EnvironmentManager for RecordingManager {
        async fn create(&self, _spec: &EnvironmentSpec, target: &Path) -> RefResult<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(target).map_err(|e| RefError::provision(target, e.to_string()))
        }

        fn command(&self, env: &Path, args: &[String]) -> Vec<String> {
            let mut argv = vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"printf '%s' "$0" > env.txt && exec "$@""#.to_string(),
                env.display().to_string(),
            ];
            argv.extend_from_slice(args);
            argv
        }
    }

    /// Writes an empty bundle from a shell command.
    struct ShellMetric {
        requirements: Vec<DataRequirement>,
    }

    impl Metric for ShellMetric {
        fn name(&self) -> &str {
            "Shell"
        }
        fn slug(&self) -> &str {
            "shell"
        }
        fn data_requirements(&self) -> &[DataRequirement] {
            &self.requirements
        }
        fn run(&self, _definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
            anyhow::bail!("only runs out-of-process")
        }
        fn command_line(&self) -> Option<&dyn CommandLineMetric> {
            Some(self)
        }
    }

    impl CommandLineMetric for ShellMetric {
        fn build_command(&self, _definition: &ExecutionDefinition) -> Vec<String> {
            vec![
                "sh".into(),
                "-c".into(),
                r#"test -f "$REF_EXECUTION_DEFINITION" && printf '{}' > output.json"#.into(),
            ]
        }
    }

    #[tokio::test]
    async fn command_metrics_run_inside_the_provisioned_environment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = dir.path().join("conda-lock.yml");
        std::fs::write(&spec, "dependencies: [numpy]\n")?;

        let mut provider = provider("Example", false).with_environment(EnvironmentSpec::new(&spec));
        provider.register(ShellMetric {
            requirements: by_source_id(),
        })?;

        let manager = Arc::new(RecordingManager::default());
        let provisioner = Arc::new(Provisioner::new(dir.path().join("envs"), manager.clone()));
        let expected_env = provisioner.path_for(&EnvironmentSpec::new(&spec)).await?;

        let store = Store::memory()?;
        let solver = Solver::new(
            registry(vec![provider]),
            store.clone(),
            DefinitionBuilder::new(dir.path().join("scratch")),
            Arc::new(IsolatedExecutor::new(manager.clone(), Duration::from_secs(10))),
            SolveOptions {
                concurrency: 2,
                ..SolveOptions::default()
            },
        )
        .with_results_root(dir.path().join("results"))
        .with_provisioner(provisioner);

        let summary = solver.solve(&catalog(), BUDGET).await?;
        assert_eq!(summary.executions_succeeded, 2, "{summary:?}");
        assert_eq!(summary.executions_failed, 0);
        assert_eq!(manager.creates.load(Ordering::SeqCst), 1);

        let shell = store
            .executions()?
            .into_iter()
            .find(|e| e.metric_slug == "shell")
            .unwrap();
        let result = store.results_for_execution(shell.id)?.remove(0);
        assert!(result.successful);
        let recorded = std::fs::read_to_string(
            dir.path()
                .join("results")
                .join(&result.output_fragment)
                .join("env.txt"),
        )?;
        assert_eq!(PathBuf::from(recorded), expected_env);
        Ok(())
    }
}
