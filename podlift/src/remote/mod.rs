//! Remote execution port
//!
//! Everything the engine does on a server goes through [`RemoteExecutor`]. The
//! OpenSSH-backed implementation lives in [`ssh`], an in-memory host in `fake`
//! (tests and the `test` feature only).
//! [`HostSession`] sits in front of an executor and turns mutations into a
//! recorded plan when running dry.

#[cfg(any(test, feature = "test"))]
pub mod fake;
pub mod ssh;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Server;
use crate::docker::container::{self, ContainerSummary, LABEL_DEPLOYED_AT};
use crate::errors::PodliftError;
use crate::utils::shell_quote;

/// Heredoc delimiter used when writing files remotely
pub const HEREDOC_MARKER: &str = "PODLIFT_EOF";

/// Callback receiving one line of streamed output
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Callback receiving `(bytes_sent, bytes_total)` during a copy
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Time limits an executor puts on a single remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    /// Captured commands
    pub command: Duration,
    /// Streamed commands and file copies
    pub long: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(120),
            long: Duration::from_secs(30 * 60),
        }
    }
}

/// Await `fut`, failing with `CommandFailed` once `limit` has passed
pub async fn bounded<T, F>(
    host: &str,
    command: &str,
    limit: Duration,
    fut: F,
) -> Result<T, PodliftError>
where
    F: Future<Output = Result<T, PodliftError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(host, command, limit_ms = limit.as_millis() as u64, "command timed out");
            Err(PodliftError::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                stderr: format!("timed out after {:?}", limit),
            })
        }
    }
}

/// What is currently deployed for a service on a host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub exists: bool,
    pub containers: Vec<String>,
    pub version: Option<String>,
    pub deployed_at: Option<String>,
}

/// Capability to run commands on one host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Host this executor is bound to
    fn host(&self) -> &str;

    /// Run a command and capture its output; only transport problems are errors
    async fn run(&self, command: &str) -> Result<CommandOutput, PodliftError>;

    /// Run a command, forwarding each output line as it arrives
    async fn execute_streaming(
        &self,
        command: &str,
        stdout: LineSink<'_>,
        stderr: LineSink<'_>,
    ) -> Result<(), PodliftError>;

    /// Copy a local file to `remote_path`
    async fn copy_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), PodliftError>;

    /// Run a command; a non-zero exit is a `CommandFailed` carrying stderr
    async fn execute(&self, command: &str) -> Result<String, PodliftError> {
        let output = self.run(command).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(PodliftError::CommandFailed {
                host: self.host().to_string(),
                command: command.to_string(),
                stderr: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            })
        }
    }

    /// Check that the host accepts commands
    async fn test_connectivity(&self) -> Result<(), PodliftError> {
        let output = self.run("echo ok").await?;
        if output.success() && output.stdout.trim() == "ok" {
            Ok(())
        } else {
            Err(PodliftError::ConnectivityFailed {
                host: self.host().to_string(),
                reason: format!("unexpected response: {}", output.stderr.trim()),
            })
        }
    }

    /// Look up containers already deployed for a service
    async fn inspect_existing_service(&self, service: &str) -> Result<ServiceInfo, PodliftError> {
        let listing = self
            .execute(&container::list_app_containers_command(service, false))
            .await?;
        let containers = ContainerSummary::parse_listing(&listing);
        if containers.is_empty() {
            return Ok(ServiceInfo::default());
        }

        let deployed_at = match containers.first() {
            Some(first) => self
                .execute(&container::inspect_label_command(&first.name, LABEL_DEPLOYED_AT))
                .await
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            None => None,
        };

        Ok(ServiceInfo {
            exists: true,
            version: containers.first().map(|c| c.version.clone()),
            containers: containers.into_iter().map(|c| c.name).collect(),
            deployed_at,
        })
    }

    /// Read a remote file, `None` when it does not exist
    async fn read_file(&self, path: &str) -> Result<Option<String>, PodliftError> {
        let output = self.run(&format!("sudo cat {}", shell_quote(path))).await?;
        Ok(output.success().then_some(output.stdout))
    }

    /// Replace a remote file with `contents`
    async fn write_file(&self, contents: &str, path: &str) -> Result<(), PodliftError> {
        self.execute(&write_file_command(contents, path)).await?;
        Ok(())
    }
}

/// Shell command writing `contents` to `path` through a quoted heredoc
pub fn write_file_command(contents: &str, path: &str) -> String {
    let mut body = contents.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!(
        "sudo tee {} > /dev/null <<'{marker}'\n{}{marker}",
        shell_quote(path),
        body,
        marker = HEREDOC_MARKER
    )
}

/// Opens executors for configured servers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExecutor>, PodliftError>;
}

/// Per-server handle used by the orchestration code
///
/// Reads always reach the host. In dry-run mode mutations are recorded instead
/// of executed and report success with empty output.
pub struct HostSession {
    executor: Arc<dyn RemoteExecutor>,
    dry_run: bool,
    plan: Mutex<Vec<String>>,
}

impl HostSession {
    pub fn new(executor: Arc<dyn RemoteExecutor>, dry_run: bool) -> Self {
        Self {
            executor,
            dry_run,
            plan: Mutex::new(Vec::new()),
        }
    }

    pub fn host(&self) -> &str {
        self.executor.host()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    /// Read-only command, executed in every mode
    pub async fn inspect(&self, command: &str) -> Result<String, PodliftError> {
        self.executor.execute(command).await
    }

    /// Read-only command whose exit status is the answer
    pub async fn check(&self, command: &str) -> Result<bool, PodliftError> {
        Ok(self.executor.run(command).await?.success())
    }

    /// State-changing command
    pub async fn mutate(&self, command: &str) -> Result<String, PodliftError> {
        if self.dry_run {
            self.record(command.to_string()).await;
            return Ok(String::new());
        }
        debug!(host = %self.host(), command = %command, "executing");
        self.executor.execute(command).await
    }

    /// State-changing command whose text must not be logged or recorded
    pub async fn mutate_secret(&self, command: &str, shown: &str) -> Result<(), PodliftError> {
        if self.dry_run {
            self.record(shown.to_string()).await;
            return Ok(());
        }
        debug!(host = %self.host(), command = %shown, "executing");
        self.executor
            .execute(command)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                PodliftError::CommandFailed { host, stderr, .. } => PodliftError::CommandFailed {
                    host,
                    command: shown.to_string(),
                    stderr,
                },
                other => other,
            })
    }

    /// State-changing command allowed to run for minutes, output goes to the debug log
    pub async fn mutate_long(&self, command: &str) -> Result<(), PodliftError> {
        let host = self.host().to_string();
        let log = |line: &str| debug!(host = %host, "{}", line);
        self.stream(command, &log, &log).await
    }

    /// State-changing command with live output
    pub async fn stream(
        &self,
        command: &str,
        stdout: LineSink<'_>,
        stderr: LineSink<'_>,
    ) -> Result<(), PodliftError> {
        if self.dry_run {
            self.record(command.to_string()).await;
            return Ok(());
        }
        self.executor.execute_streaming(command, stdout, stderr).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<String>, PodliftError> {
        self.executor.read_file(path).await
    }

    pub async fn write_file(&self, contents: &str, path: &str) -> Result<(), PodliftError> {
        if self.dry_run {
            self.record(format!("write {} ({} bytes)", path, contents.len()))
                .await;
            return Ok(());
        }
        self.executor.write_file(contents, path).await
    }

    pub async fn copy_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), PodliftError> {
        if self.dry_run {
            self.record(format!("copy {} -> {}", local_path.display(), remote_path))
                .await;
            return Ok(());
        }
        self.executor
            .copy_file(local_path, remote_path, progress)
            .await
    }

    async fn record(&self, entry: String) {
        debug!(host = %self.host(), command = %entry, "dry-run");
        self.plan.lock().await.push(entry);
    }

    /// Mutations recorded so far in dry-run mode
    pub async fn plan(&self) -> Vec<String> {
        self.plan.lock().await.clone()
    }
}
