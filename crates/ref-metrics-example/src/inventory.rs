use std::fmt::Write as _;
use std::fs;

use anyhow::Context;
use ref_core::datasets::SourceDatasetType;
use ref_core::{
    AssetType, DataRequirement, ExecutionDefinition, ExecutionResult, GroupBy, Metric, OutputBundle,
};
use serde_json::json;

/// Lists the model and reference files that share a variable.
///
/// CMIP6 and obs4MIPs groups are joined on `variable_id`, so each execution
/// sees one variable from both sources.
pub struct InventoryMetric {
    requirements: Vec<DataRequirement>,
}

impl InventoryMetric {
    pub fn new() -> Self {
        Self {
            requirements: vec![
                DataRequirement::new(
                    SourceDatasetType::Cmip6,
                    GroupBy::facets(["variable_id", "source_id"]),
                ),
                DataRequirement::new(SourceDatasetType::Obs4Mips, GroupBy::facets(["variable_id"])),
            ],
        }
    }
}

impl Default for InventoryMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for InventoryMetric {
    fn name(&self) -> &str {
        "Inventory"
    }

    fn slug(&self) -> &str {
        "inventory"
    }

    fn version(&self) -> Option<&str> {
        Some("1")
    }

    fn data_requirements(&self) -> &[DataRequirement] {
        &self.requirements
    }

    fn run(&self, definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
        let mut rows = Vec::new();
        let mut html = String::from("<table>\n<tr><th>source</th><th>instance</th></tr>\n");
        for group in definition.metric_dataset.groups() {
            for id in group.instance_ids() {
                rows.push(json!({ "source_type": group.source_type, "instance_id": id }));
                writeln!(html, "<tr><td>{}</td><td>{id}</td></tr>", group.source_type)?;
            }
        }
        html.push_str("</table>\n");

        if rows.is_empty() {
            anyhow::bail!("metric dataset for {} is empty", definition.key);
        }

        fs::write(
            definition.to_output_path("inventory.json"),
            serde_json::to_vec_pretty(&rows)?,
        )
        .context("failed to write inventory.json")?;
        fs::write(definition.to_output_path("index.html"), html)
            .context("failed to write index.html")?;

        let mut bundle = OutputBundle {
            provenance: json!({ "metric": self.slug(), "key": definition.key }),
            ..OutputBundle::default()
        };
        bundle
            .add(AssetType::Data, "inventory", "inventory.json", "Input inventory", "")
            .add(AssetType::Html, "index", "index.html", "Input inventory table", "");
        bundle.write(&definition.bundle_path())?;

        Ok(ExecutionResult::from_bundle(
            definition,
            definition.default_bundle_filename(),
            &bundle,
        ))
    }
}
