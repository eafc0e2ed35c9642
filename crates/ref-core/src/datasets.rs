//! Dataset catalog model: source types, catalog rows, groups and the
//! per-execution dataset collection handed to metrics.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{RefError, RefResult};
use crate::fingerprint::sha256_hex;

/// Facet holding the globally unique dataset id.
pub const INSTANCE_ID_FACET: &str = "instance_id";
/// Facet holding the storage path of a catalog row.
pub const PATH_FACET: &str = "path";

/// Supported dataset families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceDatasetType {
    Cmip6,
    Cmip7,
    Obs4Mips,
    PmpClimatology,
}

impl SourceDatasetType {
    pub const ALL: [SourceDatasetType; 4] = [
        SourceDatasetType::Cmip6,
        SourceDatasetType::Cmip7,
        SourceDatasetType::Obs4Mips,
        SourceDatasetType::PmpClimatology,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDatasetType::Cmip6 => "cmip6",
            SourceDatasetType::Cmip7 => "cmip7",
            SourceDatasetType::Obs4Mips => "obs4mips",
            SourceDatasetType::PmpClimatology => "pmp-climatology",
        }
    }
}

impl fmt::Display for SourceDatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceDatasetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered)
            .ok_or_else(|| format!("unknown source dataset type '{s}'"))
    }
}

impl TryFrom<String> for SourceDatasetType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceDatasetType> for String {
    fn from(value: SourceDatasetType) -> Self {
        value.as_str().to_string()
    }
}

/// One catalog row. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCatalogEntry {
    pub source_type: SourceDatasetType,
    #[serde(flatten)]
    pub facets: BTreeMap<String, String>,
}

impl DatasetCatalogEntry {
    pub fn new(source_type: SourceDatasetType, instance_id: &str, path: impl AsRef<Path>) -> Self {
        let mut facets = BTreeMap::new();
        facets.insert(INSTANCE_ID_FACET.to_string(), instance_id.to_string());
        facets.insert(
            PATH_FACET.to_string(),
            path.as_ref().to_string_lossy().into_owned(),
        );
        Self {
            source_type,
            facets,
        }
    }

    pub fn with_facet(mut self, name: &str, value: &str) -> Self {
        self.facets.insert(name.to_string(), value.to_string());
        self
    }

    pub fn facet(&self, name: &str) -> Option<&str> {
        self.facets.get(name).map(String::as_str)
    }

    pub fn instance_id(&self) -> &str {
        self.facet(INSTANCE_ID_FACET).unwrap_or_default()
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.facet(PATH_FACET).unwrap_or_default())
    }

    fn sort_key(&self) -> (&str, &str) {
        (
            self.instance_id(),
            self.facet(PATH_FACET).unwrap_or_default(),
        )
    }
}

/// The queryable dataset catalog consumed by the matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataCatalog {
    entries: Vec<DatasetCatalogEntry>,
}

impl DataCatalog {
    /// Build a catalog, rejecting rows without an instance id or path.
    pub fn new(entries: Vec<DatasetCatalogEntry>) -> RefResult<Self> {
        for (idx, entry) in entries.iter().enumerate() {
            for required in [INSTANCE_ID_FACET, PATH_FACET] {
                if entry.facet(required).map_or(true, |v| v.trim().is_empty()) {
                    return Err(RefError::invalid_catalog(format!(
                        "row {idx} ({}) is missing facet '{required}'",
                        entry.source_type
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn from_json_str(raw: &str) -> RefResult<Self> {
        let entries: Vec<DatasetCatalogEntry> = serde_json::from_str(raw)
            .map_err(|e| RefError::invalid_catalog(format!("failed to parse catalog: {e}")))?;
        Self::new(entries)
    }

    pub fn load(path: &Path) -> RefResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RefError::invalid_catalog(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn entries(&self) -> &[DatasetCatalogEntry] {
        &self.entries
    }

    pub fn of_type(
        &self,
        source_type: SourceDatasetType,
    ) -> impl Iterator<Item = &DatasetCatalogEntry> {
        self.entries
            .iter()
            .filter(move |e| e.source_type == source_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Catalog rows of one source type sharing identical group-by facet values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetGroup {
    pub source_type: SourceDatasetType,
    /// Discriminating `(facet, value)` pairs, in group-by order.
    pub selector: Vec<(String, String)>,
    pub datasets: Vec<DatasetCatalogEntry>,
}

impl DatasetGroup {
    /// Entries are sorted by instance id (then path).
    pub fn new(
        source_type: SourceDatasetType,
        selector: Vec<(String, String)>,
        mut datasets: Vec<DatasetCatalogEntry>,
    ) -> Self {
        datasets.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self {
            source_type,
            selector,
            datasets,
        }
    }

    pub fn selector_value(&self, facet: &str) -> Option<&str> {
        self.selector
            .iter()
            .find(|(name, _)| name == facet)
            .map(|(_, value)| value.as_str())
    }

    /// `source_type:facet=value` entries identifying this group.
    pub fn selector_entries(&self) -> Vec<String> {
        self.selector
            .iter()
            .map(|(facet, value)| format!("{}:{facet}={value}", self.source_type))
            .collect()
    }

    /// Distinct instance ids in order.
    pub fn instance_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.datasets.iter().map(|d| d.instance_id()).collect();
        ids.dedup();
        ids
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.datasets.iter().map(|d| d.path()).collect()
    }
}

/// The datasets one execution sees: at most one group per source type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDataset {
    groups: BTreeMap<SourceDatasetType, DatasetGroup>,
}

impl MetricDataset {
    pub fn new(groups: impl IntoIterator<Item = DatasetGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.source_type, g)).collect(),
        }
    }

    pub fn get(&self, source_type: SourceDatasetType) -> Option<&DatasetGroup> {
        self.groups.get(&source_type)
    }

    pub fn groups(&self) -> impl Iterator<Item = &DatasetGroup> {
        self.groups.values()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Selector entries across every group.
    pub fn selector_entries(&self) -> Vec<String> {
        self.groups
            .values()
            .flat_map(DatasetGroup::selector_entries)
            .collect()
    }

    /// Stable content hash over the ordered instance ids of every group.
    pub fn fingerprint(&self) -> String {
        let lines: Vec<String> = self
            .groups
            .values()
            .map(|g| format!("{}|{}", g.source_type, g.instance_ids().join(",")))
            .collect();
        sha256_hex(&lines.join("\n"))
    }
}
