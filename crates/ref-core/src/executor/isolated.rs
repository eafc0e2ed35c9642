//! Out-of-process execution inside a provisioned environment.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{normalize, ExecutionFailure, Executor, LocalExecutor};
use crate::definition::{ExecutionDefinition, DEFINITION_FILENAME};
use crate::metrics::{CommandLineMetric, ExecutionResult, Metric};
use crate::provisioner::EnvironmentManager;

/// Variable pointing the child process at its serialized definition.
pub const DEFINITION_ENV_VAR: &str = "REF_EXECUTION_DEFINITION";

/// Maximum stdout or stderr size captured per stream (1 MiB).
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for the output readers once the command has exited.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Output captured so far from one stream, shared with its reader task.
type CaptureBuffer = Arc<Mutex<Vec<u8>>>;

/// Runs command-line metrics through the environment manager; other metrics
/// fall back to in-process execution.
#[derive(Clone)]
pub struct IsolatedExecutor {
    manager: Arc<dyn EnvironmentManager>,
    timeout: Duration,
    fallback: LocalExecutor,
}

impl std::fmt::Debug for IsolatedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl IsolatedExecutor {
    pub fn new(manager: Arc<dyn EnvironmentManager>, timeout: Duration) -> Self {
        Self {
            manager,
            timeout,
            fallback: LocalExecutor::new(timeout),
        }
    }

    async fn run_command(
        &self,
        command_line: &dyn CommandLineMetric,
        definition: &ExecutionDefinition,
        environment: Option<&PathBuf>,
    ) -> (Result<ExecutionResult, ExecutionFailure>, Option<String>) {
        if let Err(e) = tokio::fs::create_dir_all(&definition.output_directory).await {
            return (Err(e.into()), None);
        }

        let definition_path = definition.to_output_path(DEFINITION_FILENAME);
        let payload = match serde_json::to_vec_pretty(definition) {
            Ok(payload) => payload,
            Err(e) => return (Err(ExecutionFailure::Spawn(e.to_string())), None),
        };
        if let Err(e) = tokio::fs::write(&definition_path, payload).await {
            return (Err(e.into()), None);
        }

        let args = command_line.build_command(definition);
        let argv = match environment {
            Some(env) => self.manager.command(env, &args),
            None => args,
        };
        let Some((program, rest)) = argv.split_first() else {
            return (
                Err(ExecutionFailure::Spawn("metric built an empty command".into())),
                None,
            );
        };

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .env(DEFINITION_ENV_VAR, &definition_path)
            .current_dir(&definition.output_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return (Err(ExecutionFailure::Spawn(format!("{program}: {e}"))), None),
        };

        let stdout = CaptureBuffer::default();
        let stderr = CaptureBuffer::default();
        let readers = [
            child.stdout.take().map(|h| spawn_reader(h, stdout.clone())),
            child.stderr.take().map(|h| spawn_reader(h, stderr.clone())),
        ];

        // No kill_on_drop: on timeout the child is abandoned, not killed. Its
        // readers keep draining so it never blocks on a full pipe.
        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return (
                    Err(ExecutionFailure::Spawn(format!("failed waiting for {program}: {e}"))),
                    Some(snapshot(&stdout, &stderr)),
                )
            }
            Err(_) => {
                return (
                    Err(ExecutionFailure::TimedOut(self.timeout)),
                    Some(snapshot(&stdout, &stderr)),
                )
            }
        };

        // A background process inheriting the pipes may keep them open.
        for reader in readers.into_iter().flatten() {
            let _ = tokio::time::timeout(READER_GRACE, reader).await;
        }
        let captured = snapshot(&stdout, &stderr);

        tracing::debug!(
            key = %definition.key,
            status = %status,
            duration_ms = start.elapsed().as_millis() as u64,
            "metric command finished"
        );

        if !status.success() {
            return (Err(ExecutionFailure::Exit(status.to_string())), Some(captured));
        }

        match command_line.build_result(definition) {
            Ok(result) => (Ok(normalize(result, definition)), Some(captured)),
            Err(e) => (Err(ExecutionFailure::Bundle(e)), Some(captured)),
        }
    }
}

#[async_trait]
impl Executor for IsolatedExecutor {
    async fn run(
        &self,
        metric: Arc<dyn Metric>,
        definition: Arc<ExecutionDefinition>,
        environment: Option<PathBuf>,
    ) -> ExecutionResult {
        if let Some(command_line) = metric.command_line() {
            let (outcome, captured) = self
                .run_command(command_line, &definition, environment.as_ref())
                .await;
            return match outcome {
                Ok(result) => result,
                Err(failure) => {
                    tracing::warn!(
                        metric = metric.slug(),
                        key = %definition.key,
                        error = %failure,
                        "execution failed"
                    );
                    failure.into_result(&definition, captured.as_deref())
                }
            };
        }
        self.fallback.run(metric, definition, environment).await
    }
}

/// Drain `handle` to EOF, keeping the first [`MAX_OUTPUT_BYTES`] in `sink`.
///
/// Bytes past the cap are read and dropped; closing the pipe early would
/// kill a chatty metric with SIGPIPE.
fn spawn_reader<R>(mut handle: R, sink: CaptureBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            let n = match handle.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
            let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..n.min(room)]);
        }
    })
}

fn snapshot(stdout: &CaptureBuffer, stderr: &CaptureBuffer) -> String {
    let read = |buf: &CaptureBuffer| {
        let buf = buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    };
    format!(
        "--- stdout ---\n{}\n--- stderr ---\n{}",
        read(stdout),
        read(stderr)
    )
}
