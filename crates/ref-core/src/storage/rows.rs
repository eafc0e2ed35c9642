use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRow {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub version: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: i64,
    pub metric_slug: String,
    pub provider_slug: String,
    pub key: String,
    pub dataset_fingerprint: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResultRow {
    pub id: i64,
    pub execution_id: i64,
    pub successful: bool,
    pub bundle_filename: Option<String>,
    pub output_fragment: String,
    pub diagnostics: Option<String>,
    pub created_at: String,
}

/// Parameters for [`Store::get_or_create_execution`](super::Store::get_or_create_execution).
#[derive(Debug, Clone, Copy)]
pub struct NewExecution<'a> {
    pub provider_slug: &'a str,
    pub metric_slug: &'a str,
    pub key: &'a str,
    pub dataset_fingerprint: &'a str,
}
