//! Data requirements and the matcher that turns them, plus a catalog, into
//! the dataset collections a metric runs over.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::datasets::{
    DataCatalog, DatasetCatalogEntry, DatasetGroup, MetricDataset, SourceDatasetType,
};

/// Facet constraint on catalog rows.
///
/// A row matches when, for every facet in the filter, its value is one of the
/// allowed values. Rows missing a facet never match. `keep = false` inverts
/// the filter into a drop list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetFilter {
    pub facets: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_keep")]
    pub keep: bool,
}

fn default_keep() -> bool {
    true
}

impl FacetFilter {
    /// Keep rows where `facet` takes one of `values`.
    pub fn including<I, S>(facet: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            facets: BTreeMap::new(),
            keep: true,
        }
        .and(facet, values)
    }

    /// Drop rows where `facet` takes one of `values`.
    pub fn excluding<I, S>(facet: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            facets: BTreeMap::new(),
            keep: false,
        }
        .and(facet, values)
    }

    /// Add another facet constraint.
    pub fn and<I, S>(mut self, facet: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.facets
            .insert(facet.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, entry: &DatasetCatalogEntry) -> bool {
        self.facets.iter().all(|(facet, allowed)| {
            entry
                .facet(facet)
                .is_some_and(|value| allowed.iter().any(|a| a == value))
        })
    }

    /// Whether the row survives this filter.
    pub fn admits(&self, entry: &DatasetCatalogEntry) -> bool {
        self.matches(entry) == self.keep
    }
}

/// How filtered rows are partitioned into groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupBy {
    /// All matching rows form one group.
    Ungrouped,
    Facets(Vec<String>),
}

impl GroupBy {
    pub fn facets<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupBy::Facets(names.into_iter().map(Into::into).collect())
    }

    pub fn facet_names(&self) -> &[String] {
        match self {
            GroupBy::Ungrouped => &[],
            GroupBy::Facets(names) => names,
        }
    }
}

/// What data a metric needs from one source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequirement {
    pub source_type: SourceDatasetType,
    pub filters: Vec<FacetFilter>,
    pub group_by: GroupBy,
}

impl DataRequirement {
    pub fn new(source_type: SourceDatasetType, group_by: GroupBy) -> Self {
        Self {
            source_type,
            filters: Vec::new(),
            group_by,
        }
    }

    pub fn with_filter(mut self, filter: FacetFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Catalog rows of this requirement's source type passing every filter.
    pub fn apply_filters<'a>(
        &'a self,
        catalog: &'a DataCatalog,
    ) -> impl Iterator<Item = &'a DatasetCatalogEntry> + 'a {
        catalog
            .of_type(self.source_type)
            .filter(move |entry| self.filters.iter().all(|f| f.admits(entry)))
    }

    /// Partition the filtered rows into groups ordered by selector values.
    ///
    /// Rows lacking one of the group-by facets are dropped.
    pub fn group(&self, catalog: &DataCatalog) -> Vec<DatasetGroup> {
        let names = self.group_by.facet_names();
        let mut buckets: BTreeMap<Vec<String>, Vec<DatasetCatalogEntry>> = BTreeMap::new();

        for entry in self.apply_filters(catalog) {
            let values: Option<Vec<String>> = names
                .iter()
                .map(|name| entry.facet(name).map(str::to_string))
                .collect();
            let Some(values) = values else {
                tracing::debug!(
                    source_type = %self.source_type,
                    instance_id = entry.instance_id(),
                    "row lacks a group-by facet, dropped"
                );
                continue;
            };
            buckets.entry(values).or_default().push(entry.clone());
        }

        buckets
            .into_iter()
            .map(|(values, datasets)| {
                let selector = names.iter().cloned().zip(values).collect();
                DatasetGroup::new(self.source_type, selector, datasets)
            })
            .collect()
    }
}

/// Compute every dataset collection a metric with `requirements` should run over.
///
/// Groups from different requirements are joined on the selector facets they
/// share and cross-producted otherwise. An empty requirement list, or any
/// requirement matching nothing, yields no collections.
pub fn solve_metric_datasets(
    requirements: &[DataRequirement],
    catalog: &DataCatalog,
) -> Vec<MetricDataset> {
    if requirements.is_empty() {
        return Vec::new();
    }

    let mut combinations: Vec<Vec<DatasetGroup>> = vec![Vec::new()];
    for requirement in requirements {
        let groups = requirement.group(catalog);
        if groups.is_empty() {
            return Vec::new();
        }

        let mut next = Vec::new();
        for combination in &combinations {
            for group in &groups {
                if compatible(combination, group) {
                    let mut extended = combination.clone();
                    extended.push(group.clone());
                    next.push(extended);
                }
            }
        }
        combinations = next;
    }

    combinations.into_iter().map(MetricDataset::new).collect()
}

fn compatible(combination: &[DatasetGroup], candidate: &DatasetGroup) -> bool {
    combination.iter().all(|existing| {
        candidate.selector.iter().all(|(facet, value)| {
            existing
                .selector_value(facet)
                .map_or(true, |other| other == value)
        })
    })
}
