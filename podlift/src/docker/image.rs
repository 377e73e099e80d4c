//! Local image toolchain

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::errors::PodliftError;

/// Operations on the machine running the deploy
#[async_trait]
pub trait ImageToolchain: Send + Sync {
    /// Build `image_ref` from the context directory
    async fn build(&self, image_ref: &str, context: &Path) -> Result<(), PodliftError>;

    /// Write `image_ref` to a tar archive
    async fn save(&self, image_ref: &str, output: &Path) -> Result<(), PodliftError>;

    /// Authenticate against the registry
    async fn login(&self, registry: &RegistryConfig) -> Result<(), PodliftError>;

    /// Tag `image_ref` as `remote_ref` and push it
    async fn push(&self, image_ref: &str, remote_ref: &str) -> Result<(), PodliftError>;
}

/// Toolchain backed by the local `docker` CLI
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn docker(&self, args: &[&str]) -> Result<(), String> {
        debug!("docker {}", args.join(" "));
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run docker: {}", e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl ImageToolchain for DockerCli {
    async fn build(&self, image_ref: &str, context: &Path) -> Result<(), PodliftError> {
        if !context.join("Dockerfile").is_file() {
            return Err(PodliftError::BuildFailed(format!(
                "Dockerfile not found in {}",
                context.display()
            )));
        }

        info!("Building image: {}", image_ref);
        let status = Command::new("docker")
            .arg("build")
            .arg("-t")
            .arg(image_ref)
            .arg(context)
            .status()
            .await
            .map_err(|e| PodliftError::BuildFailed(format!("failed to run docker build: {}", e)))?;

        if !status.success() {
            return Err(PodliftError::BuildFailed(format!(
                "docker build failed for {}",
                image_ref
            )));
        }
        Ok(())
    }

    async fn save(&self, image_ref: &str, output: &Path) -> Result<(), PodliftError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = output.to_string_lossy();
        self.docker(&["save", "-o", &output, image_ref])
            .await
            .map_err(|e| PodliftError::BuildFailed(format!("failed to save image: {}", e)))
    }

    async fn login(&self, registry: &RegistryConfig) -> Result<(), PodliftError> {
        let password = registry
            .password
            .as_ref()
            .ok_or_else(|| PodliftError::TransferFailed("registry password missing".to_string()))?;

        info!("Logging into {}", registry.server_name());
        let login = async {
            let mut child = Command::new("docker")
                .args([
                    "login",
                    registry.server_name(),
                    "-u",
                    &registry.username,
                    "--password-stdin",
                ])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(password.expose_secret().as_bytes()).await?;
            }
            child.wait_with_output().await
        }
        .await
        .map_err(|e| PodliftError::TransferFailed(format!("failed to run docker login: {}", e)))?;

        if !login.status.success() {
            return Err(PodliftError::TransferFailed(format!(
                "registry login failed: {}",
                String::from_utf8_lossy(&login.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn push(&self, image_ref: &str, remote_ref: &str) -> Result<(), PodliftError> {
        self.docker(&["tag", image_ref, remote_ref])
            .await
            .map_err(|e| PodliftError::TransferFailed(format!("failed to tag image: {}", e)))?;
        info!("Pushing {}", remote_ref);
        self.docker(&["push", remote_ref])
            .await
            .map_err(|e| PodliftError::TransferFailed(format!("failed to push image: {}", e)))
    }
}
