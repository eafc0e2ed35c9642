//! Environment provisioning: content-addressed, lazily created runtimes per
//! provider environment specification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::errors::{RefError, RefResult};
use crate::fingerprint::sha256_bytes_hex;
use crate::providers::EnvironmentSpec;

pub mod conda;

pub use conda::CondaManager;

/// Hex characters of the spec digest used in environment directory names.
const ENV_DIGEST_CHARS: usize = 16;

/// External tool that materializes environments and runs commands in them.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Create the environment described by `spec` at `target`.
    async fn create(&self, spec: &EnvironmentSpec, target: &Path) -> RefResult<()>;

    /// Argument vector running `args` inside the environment at `env`.
    fn command(&self, env: &Path, args: &[String]) -> Vec<String>;
}

/// Environment path for spec bytes under `prefix`.
pub fn environment_path(prefix: &Path, spec_bytes: &[u8]) -> PathBuf {
    let digest = sha256_bytes_hex(spec_bytes);
    prefix.join(format!("env-{}", &digest[..ENV_DIGEST_CHARS]))
}

pub struct Provisioner {
    prefix: PathBuf,
    manager: Arc<dyn EnvironmentManager>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(prefix: impl Into<PathBuf>, manager: Arc<dyn EnvironmentManager>) -> Self {
        Self {
            prefix: prefix.into(),
            manager,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn manager(&self) -> &Arc<dyn EnvironmentManager> {
        &self.manager
    }

    /// Derived environment path for `spec`.
    pub async fn path_for(&self, spec: &EnvironmentSpec) -> RefResult<PathBuf> {
        let bytes = tokio::fs::read(spec.path()).await.map_err(|e| {
            RefError::provision(
                spec.path(),
                format!("cannot read environment specification: {e}"),
            )
        })?;
        Ok(environment_path(&self.prefix, &bytes))
    }

    /// Make sure the environment for `spec` exists, creating it at most once
    /// per derived path. Returns the environment path.
    pub async fn ensure(&self, spec: &EnvironmentSpec) -> RefResult<PathBuf> {
        let path = self.path_for(spec).await?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        if environment_exists(&path).await? {
            tracing::debug!(path = %path.display(), "environment already exists");
            return Ok(path);
        }

        tracing::info!(
            path = %path.display(),
            spec = %spec.path().display(),
            "creating environment"
        );
        self.manager.create(spec, &path).await?;

        if !environment_exists(&path).await? {
            return Err(RefError::provision(
                &path,
                "environment manager reported success but the environment is missing",
            ));
        }
        Ok(path)
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }
}

async fn environment_exists(path: &Path) -> RefResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| RefError::provision(path, format!("cannot inspect environment: {e}")))
}
