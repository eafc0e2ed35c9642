//! Metric plugin contract and execution results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::definition::ExecutionDefinition;
use crate::requirements::DataRequirement;

/// A diagnostic computed over a [`MetricDataset`](crate::datasets::MetricDataset).
///
/// Implementations are provider-supplied and opaque to the core. `run` is
/// invoked on the blocking pool and may take arbitrarily long; an `Err` or a
/// panic becomes a failed [`ExecutionResult`].
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn slug(&self) -> &str;

    /// Metric version. Falls back to the provider version when `None`.
    fn version(&self) -> Option<&str> {
        None
    }

    fn data_requirements(&self) -> &[DataRequirement];

    fn run(&self, definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult>;

    /// Out-of-process form of this metric, if it has one.
    fn command_line(&self) -> Option<&dyn CommandLineMetric> {
        None
    }
}

/// A metric that can run as a command inside a provisioned environment.
pub trait CommandLineMetric: Send + Sync {
    /// Argument vector, program first. The definition is also available to the
    /// process through `REF_EXECUTION_DEFINITION`.
    fn build_command(&self, definition: &ExecutionDefinition) -> Vec<String>;

    /// Build the result after the command exited successfully.
    fn build_result(&self, definition: &ExecutionDefinition) -> anyhow::Result<ExecutionResult> {
        let bundle = OutputBundle::read(&definition.bundle_path())?;
        Ok(ExecutionResult::from_bundle(
            definition,
            definition.default_bundle_filename(),
            &bundle,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Plot,
    Data,
    #[serde(rename = "HTML")]
    Html,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Plot => "Plot",
            AssetType::Data => "Data",
            AssetType::Html => "HTML",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Plot" => Some(AssetType::Plot),
            "Data" => Some(AssetType::Data),
            "HTML" => Some(AssetType::Html),
            _ => None,
        }
    }
}

/// A file produced by a successful execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultAsset {
    pub asset_type: AssetType,
    pub short_name: String,
    pub filename: PathBuf,
    pub long_name: String,
    pub description: String,
}

/// Outcome of running a metric against one [`ExecutionDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub key: String,
    pub output_fragment: PathBuf,
    pub successful: bool,
    /// Bundle path relative to the results root. Only set on success.
    pub bundle_filename: Option<PathBuf>,
    pub assets: Vec<ResultAsset>,
    pub diagnostics: Option<String>,
}

impl ExecutionResult {
    pub fn success(definition: &ExecutionDefinition) -> Self {
        Self {
            key: definition.key.clone(),
            output_fragment: definition.output_fragment.clone(),
            successful: true,
            bundle_filename: None,
            assets: Vec::new(),
            diagnostics: None,
        }
    }

    pub fn failure(definition: &ExecutionDefinition, diagnostics: impl Into<String>) -> Self {
        Self {
            key: definition.key.clone(),
            output_fragment: definition.output_fragment.clone(),
            successful: false,
            bundle_filename: None,
            assets: Vec::new(),
            diagnostics: Some(diagnostics.into()),
        }
    }

    /// Successful result whose assets come from an output bundle.
    pub fn from_bundle(
        definition: &ExecutionDefinition,
        bundle_filename: impl Into<PathBuf>,
        bundle: &OutputBundle,
    ) -> Self {
        Self {
            bundle_filename: Some(bundle_filename.into()),
            assets: bundle.assets(),
            ..Self::success(definition)
        }
    }
}

/// One named file in an output bundle section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub filename: PathBuf,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub description: String,
}

/// The `output.json` bundle a metric writes into its output directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputBundle {
    #[serde(default)]
    pub plots: BTreeMap<String, BundleEntry>,
    #[serde(default)]
    pub data: BTreeMap<String, BundleEntry>,
    #[serde(default)]
    pub html: BTreeMap<String, BundleEntry>,
    #[serde(default)]
    pub provenance: serde_json::Value,
}

impl OutputBundle {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read output bundle {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse output bundle {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write output bundle {}", path.display()))
    }

    pub fn add(
        &mut self,
        asset_type: AssetType,
        short_name: &str,
        filename: impl Into<PathBuf>,
        long_name: &str,
        description: &str,
    ) -> &mut Self {
        let section = match asset_type {
            AssetType::Plot => &mut self.plots,
            AssetType::Data => &mut self.data,
            AssetType::Html => &mut self.html,
        };
        section.insert(
            short_name.to_string(),
            BundleEntry {
                filename: filename.into(),
                long_name: long_name.to_string(),
                description: description.to_string(),
            },
        );
        self
    }

    /// Plots, then data, then html; each section in short-name order.
    pub fn assets(&self) -> Vec<ResultAsset> {
        [
            (AssetType::Plot, &self.plots),
            (AssetType::Data, &self.data),
            (AssetType::Html, &self.html),
        ]
        .into_iter()
        .flat_map(|(asset_type, section)| {
            section.iter().map(move |(short_name, entry)| ResultAsset {
                asset_type,
                short_name: short_name.clone(),
                filename: entry.filename.clone(),
                long_name: entry.long_name.clone(),
                description: entry.description.clone(),
            })
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_assets_follow_section_then_name_order() {
        let mut bundle = OutputBundle::default();
        bundle
            .add(AssetType::Html, "index", "index.html", "Index", "")
            .add(AssetType::Data, "zonal", "zonal.nc", "Zonal mean", "")
            .add(AssetType::Plot, "zmap", "zmap.png", "Z map", "")
            .add(AssetType::Plot, "amap", "amap.png", "A map", "first");

        let names: Vec<_> = bundle
            .assets()
            .into_iter()
            .map(|a| (a.asset_type, a.short_name))
            .collect();
        assert_eq!(
            names,
            vec![
                (AssetType::Plot, "amap".to_string()),
                (AssetType::Plot, "zmap".to_string()),
                (AssetType::Data, "zonal".to_string()),
                (AssetType::Html, "index".to_string()),
            ]
        );
    }

    #[test]
    fn bundle_sections_are_optional() {
        let bundle: OutputBundle =
            serde_json::from_str(r#"{"plots": {"map": {"filename": "map.png"}}}"#).unwrap();
        let assets = bundle.assets();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].long_name, "");
        assert!(bundle.provenance.is_null());
    }

    #[test]
    fn asset_type_names_match_schema() {
        for t in [AssetType::Plot, AssetType::Data, AssetType::Html] {
            assert_eq!(AssetType::parse(t.as_str()), Some(t));
        }
        assert_eq!(
            serde_json::to_string(&AssetType::Html).unwrap(),
            "\"HTML\""
        );
        assert_eq!(AssetType::parse("html"), None);
    }
}
