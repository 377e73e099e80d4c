//! OpenSSH-backed executor

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::config::Server;
use crate::errors::PodliftError;
use crate::remote::{
    bounded, CommandOutput, CommandTimeouts, Connector, LineSink, ProgressFn, RemoteExecutor,
};
use crate::utils::shell_quote;

const COPY_CHUNK: usize = 256 * 1024;

/// Executor running commands over a multiplexed SSH master connection
pub struct SshExecutor {
    host: String,
    session: Session,
    timeouts: CommandTimeouts,
}

impl SshExecutor {
    /// Open a session to `server`
    pub async fn connect(
        server: &Server,
        connect_timeout: Duration,
        timeouts: CommandTimeouts,
    ) -> Result<Self, PodliftError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(server.user.clone())
            .port(server.port)
            .keyfile(&server.ssh_key)
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(connect_timeout)
            .server_alive_interval(Duration::from_secs(30));

        debug!(host = %server.host, user = %server.user, port = server.port, "connecting");
        let session = builder
            .connect_mux(&server.host)
            .await
            .map_err(|e| PodliftError::ConnectivityFailed {
                host: server.host.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            host: server.host.clone(),
            session,
            timeouts,
        })
    }

    fn transport_error(&self, e: openssh::Error) -> PodliftError {
        PodliftError::ConnectivityFailed {
            host: self.host.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, PodliftError> {
        bounded(&self.host, command, self.timeouts.command, async {
            let output = self
                .session
                .raw_command(command)
                .output()
                .await
                .map_err(|e| self.transport_error(e))?;

            Ok::<_, PodliftError>(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            })
        })
        .await
    }

    async fn execute_streaming(
        &self,
        command: &str,
        stdout: LineSink<'_>,
        stderr: LineSink<'_>,
    ) -> Result<(), PodliftError> {
        bounded(
            &self.host,
            command,
            self.timeouts.long,
            self.stream_command(command, stdout, stderr),
        )
        .await
    }

    async fn copy_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), PodliftError> {
        let label = format!("copy {} -> {}", local_path.display(), remote_path);
        bounded(
            &self.host,
            &label,
            self.timeouts.long,
            self.copy(local_path, remote_path, progress),
        )
        .await
    }
}

impl SshExecutor {
    async fn stream_command(
        &self,
        command: &str,
        stdout: LineSink<'_>,
        stderr: LineSink<'_>,
    ) -> Result<(), PodliftError> {
        let mut child = self
            .session
            .raw_command(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|e| self.transport_error(e))?;

        let out = child.stdout().take();
        let err = child.stderr().take();
        let mut captured_err = String::new();

        let forward_out = async {
            if let Some(out) = out {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stdout(&line);
                }
            }
        };
        let forward_err = async {
            if let Some(err) = err {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr(&line);
                    captured_err.push_str(&line);
                    captured_err.push('\n');
                }
            }
        };
        tokio::join!(forward_out, forward_err);

        let status = child.wait().await.map_err(|e| self.transport_error(e))?;
        if status.success() {
            Ok(())
        } else {
            Err(PodliftError::CommandFailed {
                host: self.host.clone(),
                command: command.to_string(),
                stderr: captured_err.trim().to_string(),
            })
        }
    }

    async fn copy(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), PodliftError> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let total = file.metadata().await?.len();
        info!(host = %self.host, remote = %remote_path, bytes = total, "copying file");

        let mut child = self
            .session
            .raw_command(format!("cat > {}", shell_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|e| self.transport_error(e))?;

        let mut stdin = child.stdin().take().ok_or_else(|| {
            PodliftError::TransferFailed(format!("no stdin for copy to {}", self.host))
        })?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdin.write_all(&buf[..n]).await.map_err(|e| {
                PodliftError::TransferFailed(format!("copy to {}:{} failed: {}", self.host, remote_path, e))
            })?;
            sent += n as u64;
            if let Some(progress) = progress {
                progress(sent, total);
            }
        }
        stdin.shutdown().await?;
        drop(stdin);

        let mut captured_err = String::new();
        if let Some(mut err) = child.stderr().take() {
            let _ = err.read_to_string(&mut captured_err).await;
        }
        let status = child.wait().await.map_err(|e| self.transport_error(e))?;
        if !status.success() {
            return Err(PodliftError::TransferFailed(format!(
                "copy to {}:{} failed: {}",
                self.host,
                remote_path,
                captured_err.trim()
            )));
        }
        Ok(())
    }
}

/// Connector opening one SSH session per server
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
    timeouts: CommandTimeouts,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, timeouts: CommandTimeouts) -> Self {
        Self {
            connect_timeout,
            timeouts,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExecutor>, PodliftError> {
        let executor = SshExecutor::connect(server, self.connect_timeout, self.timeouts).await?;
        Ok(Arc::new(executor))
    }
}
