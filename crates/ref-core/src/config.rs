//! Configuration loaded from `<root>/ref.yaml`.
//!
//! The root comes from `REF_CONFIGURATION` (default `./.ref`). A missing file
//! yields defaults; `REF_DATABASE_URL` and `REF_SOFTWARE_ROOT` override the
//! corresponding settings after the file is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RefError, RefResult};

pub const CONFIG_ROOT_ENV_VAR: &str = "REF_CONFIGURATION";
pub const DATABASE_URL_ENV_VAR: &str = "REF_DATABASE_URL";
pub const SOFTWARE_ROOT_ENV_VAR: &str = "REF_SOFTWARE_ROOT";
pub const CONFIG_FILENAME: &str = "ref.yaml";
pub const DEFAULT_ROOT: &str = ".ref";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Working directories of in-flight executions.
    pub scratch: PathBuf,
    pub results: PathBuf,
    /// Prefix under which provider environments are created.
    pub software: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch: PathBuf::from("scratch"),
            results: PathBuf::from("results"),
            software: PathBuf::from("software"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Defaults to `<root>/db/ref.db`.
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Local,
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub concurrency: usize,
    pub execution_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Local,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            execution_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub manager_executable: PathBuf,
    pub timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            manager_executable: PathBuf::from("conda"),
            timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub db: DbConfig,
    /// Provider references (`module` or `module.attribute`).
    pub providers: Vec<String>,
    pub executor: ExecutorConfig,
    pub provisioning: ProvisioningConfig,
    pub persistence_timeout_secs: u64,
    pub force_recompute: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            db: DbConfig::default(),
            providers: Vec::new(),
            executor: ExecutorConfig::default(),
            provisioning: ProvisioningConfig::default(),
            persistence_timeout_secs: 30,
            force_recompute: false,
        }
    }
}

impl Config {
    /// Load from the root named by `REF_CONFIGURATION`, then apply environment overrides.
    pub fn from_env() -> RefResult<Self> {
        let root = std::env::var_os(CONFIG_ROOT_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let mut config = Self::load_root(&root)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit config file; relative paths resolve against its directory.
    pub fn from_file(path: &Path) -> RefResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RefError::configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut config = Self::from_yaml_str(&raw, root)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// `<root>/ref.yaml` if present, defaults otherwise.
    pub fn load_root(root: &Path) -> RefResult<Self> {
        let file = root.join(CONFIG_FILENAME);
        match std::fs::read_to_string(&file) {
            Ok(raw) => Self::from_yaml_str(&raw, root),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %file.display(), "no config file, using defaults");
                Ok(Self::default().resolved(root))
            }
            Err(e) => Err(RefError::configuration(format!(
                "cannot read config {}: {e}",
                file.display()
            ))),
        }
    }

    pub fn from_yaml_str(raw: &str, root: &Path) -> RefResult<Self> {
        let config: Config = if raw.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(raw)
                .map_err(|e| RefError::configuration(format!("invalid config: {e}")))?
        };
        Ok(config.resolved(root))
    }

    /// Make relative paths absolute against `root` and fill the database default.
    fn resolved(mut self, root: &Path) -> Self {
        let anchor = |p: &Path| {
            if p.is_relative() {
                root.join(p)
            } else {
                p.to_path_buf()
            }
        };
        self.paths.scratch = anchor(&self.paths.scratch);
        self.paths.results = anchor(&self.paths.results);
        self.paths.software = anchor(&self.paths.software);
        if self.db.database_url.is_none() {
            self.db.database_url = Some(format!(
                "sqlite:///{}",
                root.join("db").join("ref.db").display()
            ));
        }
        self
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV_VAR).filter(|v| !v.is_empty()) {
            self.db.database_url = Some(url);
        }
        if let Some(software) = lookup(SOFTWARE_ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
            self.paths.software = PathBuf::from(software);
        }
    }

    pub fn validate(&self) -> RefResult<()> {
        if self.executor.concurrency == 0 {
            return Err(RefError::configuration("executor.concurrency must be at least 1"));
        }
        for (name, secs) in [
            ("executor.execution_timeout_secs", self.executor.execution_timeout_secs),
            ("provisioning.timeout_secs", self.provisioning.timeout_secs),
            ("persistence_timeout_secs", self.persistence_timeout_secs),
        ] {
            if secs == 0 {
                return Err(RefError::configuration(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    pub fn database_url(&self) -> &str {
        self.db.database_url.as_deref().unwrap_or("sqlite:///:memory:")
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.execution_timeout_secs)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning.timeout_secs)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_secs)
    }
}
