use std::fs;

use anyhow::Context;
use ref_core::datasets::SourceDatasetType;
use ref_core::{
    AssetType, DataRequirement, ExecutionDefinition, ExecutionResult, FacetFilter, GroupBy, Metric,
    OutputBundle,
};
use serde_json::json;

const GROUP_FACETS: [&str; 4] = ["source_id", "experiment_id", "variant_label", "variable_id"];

/// Monthly climatology of one model member and variable.
///
/// Runs over monthly CMIP6 output, one execution per
/// (source, experiment, member, variable). Control runs are excluded.
pub struct AnnualCycleMetric {
    requirements: Vec<DataRequirement>,
}

impl AnnualCycleMetric {
    pub fn new() -> Self {
        let cmip6 = DataRequirement::new(SourceDatasetType::Cmip6, GroupBy::facets(GROUP_FACETS))
            .with_filter(FacetFilter::including("frequency", ["mon"]))
            .with_filter(FacetFilter::excluding("experiment_id", ["piControl"]));
        Self {
            requirements: vec![cmip6],
        }
    }
}

impl Default for AnnualCycleMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for AnnualCycleMetric {
    fn name(&self) -> &str {
        "Annual Cycle"
    }

    fn slug(&self) -> &str {
        "annual-cycle"
    }

    fn data_requirements(&self) -> &[DataRequirement] {
        &self.requirements
    }

    fn run(&self, definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
        let group = definition
            .metric_dataset
            .get(SourceDatasetType::Cmip6)
            .context("no CMIP6 group in metric dataset")?;

        let selector: serde_json::Map<String, serde_json::Value> = group
            .selector
            .iter()
            .map(|(facet, value)| (facet.clone(), json!(value)))
            .collect();
        let files: Vec<String> = group
            .paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        // One row per calendar month; values are filled by the diagnostic backend.
        let months: Vec<serde_json::Value> = (1..=12)
            .map(|month| json!({ "month": month, "files": files.len() }))
            .collect();
        let climatology = json!({
            "selector": selector,
            "months": months,
            "files": files,
        });
        let data_file = "annual_cycle.json";
        fs::write(
            definition.to_output_path(data_file),
            serde_json::to_vec_pretty(&climatology)?,
        )
        .with_context(|| format!("failed to write {data_file}"))?;

        let variable = group.selector_value("variable_id").unwrap_or("unknown");
        let mut bundle = OutputBundle {
            provenance: json!({
                "metric": self.slug(),
                "version": definition.metric_version,
                "key": definition.key,
                "instance_ids": group.instance_ids(),
            }),
            ..OutputBundle::default()
        };
        bundle.add(
            AssetType::Data,
            "annual_cycle",
            data_file,
            &format!("Annual cycle of {variable}"),
            "Monthly climatology over all input files",
        );
        bundle.write(&definition.bundle_path())?;

        tracing::debug!(key = %definition.key, variable, "annual cycle written");
        Ok(ExecutionResult::from_bundle(
            definition,
            definition.default_bundle_filename(),
            &bundle,
        ))
    }
}
