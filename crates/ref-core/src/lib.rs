//! Orchestration core: matches catalog datasets to provider metrics, builds
//! keyed execution units, provisions provider environments, runs metrics with
//! failure containment and records the outcomes in SQLite.

pub mod config;
pub mod datasets;
pub mod definition;
pub mod errors;
pub mod executor;
pub mod fingerprint;
pub mod metrics;
pub mod providers;
pub mod provisioner;
pub mod report;
pub mod requirements;
pub mod solver;
pub mod storage;

pub use config::Config;
pub use datasets::{DataCatalog, DatasetCatalogEntry, DatasetGroup, MetricDataset, SourceDatasetType};
pub use definition::{DefinitionBuilder, ExecutionDefinition};
pub use errors::{RefError, RefResult};
pub use executor::{Executor, IsolatedExecutor, LocalExecutor};
pub use metrics::{AssetType, CommandLineMetric, ExecutionResult, Metric, OutputBundle, ResultAsset};
pub use providers::{EnvironmentSpec, MetricsProvider, ProviderLoader, ProviderRegistry};
pub use provisioner::{CondaManager, EnvironmentManager, Provisioner};
pub use requirements::{solve_metric_datasets, DataRequirement, FacetFilter, GroupBy};
pub use solver::{SolveOptions, SolveSummary, Solver};
pub use storage::{Store, StoreError};
