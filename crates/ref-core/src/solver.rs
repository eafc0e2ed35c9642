//! The solve loop: match every registered metric against the catalog, skip
//! satisfied work, then execute and persist the rest on a bounded pool.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ExecutorKind};
use crate::datasets::DataCatalog;
use crate::definition::{needs_execution, DefinitionBuilder, ExecutionDefinition};
use crate::errors::{RefError, RefResult};
use crate::executor::{Executor, IsolatedExecutor, LocalExecutor};
use crate::metrics::{ExecutionResult, Metric};
use crate::providers::{MetricsProvider, ProviderRegistry};
use crate::provisioner::{CondaManager, EnvironmentManager, Provisioner};
use crate::report::progress::{ProgressEvent, ProgressSink};
use crate::requirements::solve_metric_datasets;
use crate::storage::{NewExecution, Store, StoreError};

#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub concurrency: usize,
    pub force_recompute: bool,
    pub persistence_timeout: Duration,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            force_recompute: false,
            persistence_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for SolveOptions {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.executor.concurrency,
            force_recompute: config.force_recompute,
            persistence_timeout: config.persistence_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveSummary {
    /// Providers with at least one dispatched unit.
    pub providers_run: usize,
    /// Execution rows inserted by this solve.
    pub executions_created: usize,
    pub executions_succeeded: usize,
    pub executions_failed: usize,
    /// Planned units never dispatched (budget exhausted or provider unavailable).
    pub executions_pending: usize,
    /// Units whose key already had a successful result.
    pub executions_skipped: usize,
    pub providers_failed: Vec<String>,
}

/// One planned (metric, dataset collection) execution.
struct Unit {
    provider: Arc<MetricsProvider>,
    metric: Arc<dyn Metric>,
    definition: Arc<ExecutionDefinition>,
}

#[derive(Debug, Clone, Copy)]
struct UnitOutcome {
    successful: bool,
    created: bool,
}

pub struct Solver {
    registry: ProviderRegistry,
    store: Store,
    builder: DefinitionBuilder,
    executor: Arc<dyn Executor>,
    provisioner: Option<Arc<Provisioner>>,
    results_root: Option<PathBuf>,
    options: SolveOptions,
    progress: Option<ProgressSink>,
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("registry", &self.registry)
            .field("builder", &self.builder)
            .field("provisioner", &self.provisioner)
            .field("results_root", &self.results_root)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Solver {
    pub fn new(
        registry: ProviderRegistry,
        store: Store,
        builder: DefinitionBuilder,
        executor: Arc<dyn Executor>,
        options: SolveOptions,
    ) -> Self {
        Self {
            registry,
            store,
            builder,
            executor,
            provisioner: None,
            results_root: None,
            options,
            progress: None,
        }
    }

    /// Wire a solver from configuration.
    ///
    /// Environments are only provisioned for the isolated executor; the local
    /// executor runs every metric in-process.
    pub fn from_config(config: &Config, registry: ProviderRegistry) -> RefResult<Self> {
        config.validate()?;
        let store = Store::from_database_url(config.database_url())?;
        let builder = DefinitionBuilder::new(&config.paths.scratch);
        let options = SolveOptions::from(config);

        let solver = match config.executor.kind {
            ExecutorKind::Local => {
                let executor = Arc::new(LocalExecutor::new(config.execution_timeout()));
                Self::new(registry, store, builder, executor, options)
            }
            ExecutorKind::Isolated => {
                let manager: Arc<dyn EnvironmentManager> = Arc::new(CondaManager::new(
                    &config.provisioning.manager_executable,
                    config.provisioning_timeout(),
                ));
                let provisioner = Arc::new(Provisioner::new(&config.paths.software, manager.clone()));
                let executor = Arc::new(IsolatedExecutor::new(manager, config.execution_timeout()));
                Self::new(registry, store, builder, executor, options).with_provisioner(provisioner)
            }
        };
        Ok(solver.with_results_root(&config.paths.results))
    }

    pub fn with_provisioner(mut self, provisioner: Arc<Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Copy successful outputs from scratch to `root/<output_fragment>`.
    pub fn with_results_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.results_root = Some(root.into());
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Run every outstanding execution the catalog implies, within `timeout`.
    ///
    /// Only configuration-level errors abort; in that case in-flight units
    /// are awaited before the error is returned.
    pub async fn solve(&self, catalog: &DataCatalog, timeout: Duration) -> RefResult<SolveSummary> {
        let deadline = Instant::now() + timeout;
        let mut summary = SolveSummary::default();

        self.record_providers().await;
        let units = self.plan(catalog, &mut summary).await;
        let total = units.len();
        info!(
            providers = self.registry.len(),
            planned = total,
            skipped = summary.executions_skipped,
            "solve planned"
        );

        let sem = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut join_set = JoinSet::new();
        let mut environments: HashMap<String, Option<PathBuf>> = HashMap::new();
        let mut failed_providers: BTreeSet<String> = BTreeSet::new();
        let mut providers_run: BTreeSet<String> = BTreeSet::new();
        let mut fatal: Option<RefError> = None;

        let mut queue = units.into_iter();
        while let Some(unit) = queue.next() {
            if Instant::now() >= deadline {
                summary.executions_pending += 1 + queue.len();
                warn!(pending = summary.executions_pending, "solve budget exhausted");
                break;
            }

            let slug = unit.provider.slug().to_string();
            if failed_providers.contains(&slug) {
                summary.executions_pending += 1;
                continue;
            }

            let environment = match environments.get(&slug) {
                Some(env) => env.clone(),
                None => match self.ensure_environment(&unit.provider).await {
                    Ok(env) => {
                        environments.insert(slug.clone(), env.clone());
                        env
                    }
                    Err(e) if e.is_fatal() => {
                        error!(provider = %slug, error = %e, "aborting solve");
                        summary.executions_pending += 1 + queue.len();
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => {
                        error!(provider = %slug, error = %e, "environment unavailable, skipping provider");
                        failed_providers.insert(slug);
                        summary.executions_pending += 1;
                        continue;
                    }
                },
            };

            let permit = match tokio::time::timeout_at(deadline, sem.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    summary.executions_pending += 1 + queue.len();
                    warn!(pending = summary.executions_pending, "solve budget exhausted");
                    break;
                }
            };

            providers_run.insert(slug);
            let executor = self.executor.clone();
            let store = self.store.clone();
            let results_root = self.results_root.clone();
            let persistence_timeout = self.options.persistence_timeout;
            join_set.spawn(async move {
                let _permit = permit;
                run_unit(
                    executor,
                    store,
                    results_root,
                    persistence_timeout,
                    unit,
                    environment,
                )
                .await
            });
        }

        // Never drop the JoinSet early: that would abort in-flight units.
        let mut done = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if outcome.created {
                        summary.executions_created += 1;
                    }
                    if outcome.successful {
                        summary.executions_succeeded += 1;
                    } else {
                        summary.executions_failed += 1;
                    }
                }
                Err(e) => {
                    error!(error = %e, "execution task failed");
                    summary.executions_failed += 1;
                }
            }
            done += 1;
            if let Some(ref sink) = self.progress {
                sink(ProgressEvent { done, total });
            }
        }

        summary.providers_run = providers_run.len();
        summary.providers_failed = failed_providers.into_iter().collect();

        if let Some(e) = fatal {
            return Err(e);
        }

        info!(
            providers_run = summary.providers_run,
            created = summary.executions_created,
            succeeded = summary.executions_succeeded,
            failed = summary.executions_failed,
            pending = summary.executions_pending,
            skipped = summary.executions_skipped,
            "solve finished"
        );
        Ok(summary)
    }

    async fn record_providers(&self) {
        for provider in self.registry.providers() {
            let (slug, name, version) = (
                provider.slug().to_string(),
                provider.name().to_string(),
                provider.version().to_string(),
            );
            let recorded = self
                .store
                .call(self.options.persistence_timeout, move |s| {
                    s.upsert_provider(&slug, &name, &version)
                })
                .await;
            if let Err(e) = recorded {
                warn!(provider = provider.slug(), error = %e, "failed to record provider");
            }
        }
    }

    async fn plan(&self, catalog: &DataCatalog, summary: &mut SolveSummary) -> Vec<Unit> {
        let mut units = Vec::new();
        for provider in self.registry.providers() {
            for metric in provider.metrics() {
                let datasets = solve_metric_datasets(metric.data_requirements(), catalog);
                if datasets.is_empty() {
                    debug!(
                        provider = provider.slug(),
                        metric = metric.slug(),
                        "no matching datasets"
                    );
                    continue;
                }

                for dataset in datasets {
                    let definition = Arc::new(self.builder.build(provider, metric.as_ref(), dataset));
                    if self.is_satisfied(&definition).await {
                        debug!(key = %definition.key, "already satisfied, skipping");
                        summary.executions_skipped += 1;
                        continue;
                    }
                    units.push(Unit {
                        provider: provider.clone(),
                        metric: metric.clone(),
                        definition,
                    });
                }
            }
        }
        units
    }

    async fn is_satisfied(&self, definition: &Arc<ExecutionDefinition>) -> bool {
        let force = self.options.force_recompute;
        let def = definition.clone();
        match self
            .store
            .call(self.options.persistence_timeout, move |s| {
                needs_execution(s, &def, force)
            })
            .await
        {
            Ok(needed) => !needed,
            Err(e) => {
                warn!(key = %definition.key, error = %e, "cannot check previous results, scheduling anyway");
                false
            }
        }
    }

    async fn ensure_environment(&self, provider: &MetricsProvider) -> RefResult<Option<PathBuf>> {
        match (&self.provisioner, provider.environment()) {
            (Some(provisioner), Some(spec)) => provisioner.ensure(spec).await.map(Some),
            _ => Ok(None),
        }
    }
}

async fn run_unit(
    executor: Arc<dyn Executor>,
    store: Store,
    results_root: Option<PathBuf>,
    persistence_timeout: Duration,
    unit: Unit,
    environment: Option<PathBuf>,
) -> UnitOutcome {
    let Unit {
        provider,
        metric,
        definition,
    } = unit;
    debug!(
        provider = provider.slug(),
        metric = metric.slug(),
        key = %definition.key,
        "executing"
    );

    let mut result = executor.run(metric, definition.clone(), environment).await;

    if result.successful {
        if let Some(root) = results_root {
            let src = definition.output_directory.clone();
            let dst = root.join(&definition.output_fragment);
            let copied = tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst)).await;
            let failure = match copied {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                warn!(key = %definition.key, error = %reason, "failed to copy outputs to results");
                result = ExecutionResult::failure(
                    &definition,
                    format!("failed to copy outputs to results: {reason}"),
                );
            }
        }
    }

    let successful = result.successful;
    let key = definition.key.clone();
    let persisted = store
        .call(persistence_timeout, move |s| persist(s, &definition, &result))
        .await;

    match persisted {
        Ok(created) => UnitOutcome {
            successful,
            created,
        },
        Err(e) => {
            error!(key = %key, error = %e, "failed to persist execution result");
            UnitOutcome {
                successful: false,
                created: false,
            }
        }
    }
}

fn persist(
    store: &Store,
    definition: &ExecutionDefinition,
    result: &ExecutionResult,
) -> Result<bool, StoreError> {
    let (execution, created) = store.get_or_create_execution(&NewExecution {
        provider_slug: &definition.provider_slug,
        metric_slug: &definition.metric_slug,
        key: &definition.key,
        dataset_fingerprint: &definition.dataset_fingerprint,
    })?;
    store.append_result_with_assets(execution.id, &definition.dataset_fingerprint, result)?;
    Ok(created)
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
