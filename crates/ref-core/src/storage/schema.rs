//! SQLite schema for the execution store.
//!
//! Tables:
//! - `provider`: one row per provider slug, refreshed on every solve
//! - `execution`: one row per execution key
//! - `execution_result`: append-only attempt history per execution
//! - `execution_result_asset`: plots/data/html declared by a successful result

/// DDL for the execution store.
///
/// Schema version: 1
pub const REF_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS provider (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    slug        TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    version     TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    metric_slug          TEXT NOT NULL,
    provider_slug        TEXT NOT NULL,
    key                  TEXT NOT NULL UNIQUE,
    dataset_fingerprint  TEXT NOT NULL,
    created_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_result (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id     INTEGER NOT NULL REFERENCES execution(id),
    successful       INTEGER NOT NULL,
    bundle_filename  TEXT,
    output_fragment  TEXT NOT NULL,
    diagnostics      TEXT,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_result_asset (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_result_id  INTEGER NOT NULL REFERENCES execution_result(id),
    asset_type           TEXT NOT NULL CHECK (asset_type IN ('Plot', 'Data', 'HTML')),
    short_name           TEXT NOT NULL,
    filename             TEXT NOT NULL,
    long_name            TEXT NOT NULL,
    description          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_execution_metric
    ON execution(provider_slug, metric_slug);
CREATE INDEX IF NOT EXISTS idx_execution_result_execution_id
    ON execution_result(execution_id);
CREATE INDEX IF NOT EXISTS idx_execution_result_asset_result_id
    ON execution_result_asset(execution_result_id);
"#;
