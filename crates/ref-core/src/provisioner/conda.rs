use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::EnvironmentManager;
use crate::errors::{RefError, RefResult};
use crate::providers::EnvironmentSpec;

/// Environment manager backed by the `conda` executable.
#[derive(Debug, Clone)]
pub struct CondaManager {
    executable: PathBuf,
    timeout: Duration,
}

impl CondaManager {
    pub fn new(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn create_args(spec: &EnvironmentSpec, target: &Path) -> Vec<String> {
        vec![
            "create".to_string(),
            "--file".to_string(),
            spec.path().display().to_string(),
            "--prefix".to_string(),
            target.display().to_string(),
        ]
    }
}

#[async_trait]
impl EnvironmentManager for CondaManager {
    async fn create(&self, spec: &EnvironmentSpec, target: &Path) -> RefResult<()> {
        let result = self.run_create(spec, target).await;
        if matches!(result, Err(RefError::EnvironmentProvision { .. })) {
            // A half-built prefix would otherwise count as ready on the next solve.
            let _ = tokio::fs::remove_dir_all(target).await;
        }
        result
    }

    fn command(&self, env: &Path, args: &[String]) -> Vec<String> {
        let mut cmd = vec![
            self.executable.display().to_string(),
            "run".to_string(),
            "--prefix".to_string(),
            env.display().to_string(),
        ];
        cmd.extend_from_slice(args);
        cmd
    }
}

impl CondaManager {
    async fn run_create(&self, spec: &EnvironmentSpec, target: &Path) -> RefResult<()> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(Self::create_args(spec, target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RefError::configuration(format!(
                    "environment manager executable not found: {}",
                    self.executable.display()
                ))
            } else {
                RefError::provision(target, format!("failed to start conda: {e}"))
            }
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RefError::provision(
                    target,
                    format!("failed waiting for conda: {e}"),
                ))
            }
            Err(_) => {
                return Err(RefError::provision(
                    target,
                    format!("conda create timed out after {:?}", self.timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RefError::provision(
                target,
                format!("conda create exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(())
    }
}
