//! Image transfer
//!
//! With registry credentials the image is pushed once and pulled by every
//! server. Without them it is saved to a tar archive that is copied to each
//! server, checked against its local SHA-256 and loaded.

use std::path::PathBuf;

use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::docker::container;
use crate::docker::image::ImageToolchain;
use crate::errors::PodliftError;
use crate::filesys::file::File;
use crate::remote::HostSession;
use crate::utils::shell_quote;

/// How the image reaches the servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    /// Pull `remote_ref` from the registry and tag it locally
    Registry { remote_ref: String },

    /// Copy and load a saved archive
    Archive { archive: PathBuf, checksum: String },
}

impl TransferPlan {
    pub fn describe(&self) -> String {
        match self {
            Self::Registry { remote_ref } => format!("registry ({})", remote_ref),
            Self::Archive { archive, .. } => format!("archive ({})", archive.display()),
        }
    }
}

/// Scratch directory for image archives
pub fn artifacts_dir() -> PathBuf {
    std::env::temp_dir().join("podlift")
}

/// Local artifact path for an image version
pub fn archive_file(image: &str, version: &str) -> File {
    File::new(artifacts_dir().join(format!(
        "{}-{}.tar",
        image.replace(['/', ':'], "_"),
        version
    )))
}

/// Push or save the image once, before any server is touched
///
/// Nothing is pushed or saved when `dry_run` is set.
pub async fn prepare(
    config: &AppConfig,
    toolchain: &dyn ImageToolchain,
    image_ref: &str,
    version: &str,
    dry_run: bool,
) -> Result<TransferPlan, PodliftError> {
    if let Some(registry) = config.active_registry() {
        let remote_ref = registry.image_path(&config.image, version);
        if !dry_run {
            toolchain.login(registry).await?;
            toolchain.push(image_ref, &remote_ref).await?;
            info!(image = %remote_ref, "image pushed");
        }
        return Ok(TransferPlan::Registry { remote_ref });
    }

    let archive = archive_file(&config.image, version);
    if dry_run {
        return Ok(TransferPlan::Archive {
            archive: archive.path().to_path_buf(),
            checksum: String::new(),
        });
    }

    tokio::fs::create_dir_all(artifacts_dir()).await?;
    toolchain.save(image_ref, archive.path()).await?;
    let checksum = archive.sha256().await?;
    info!(
        archive = %archive.path().display(),
        bytes = archive.size().await.unwrap_or_default(),
        "image saved"
    );
    Ok(TransferPlan::Archive {
        archive: archive.path().to_path_buf(),
        checksum,
    })
}

/// Make `image_ref` available on the session's host
pub async fn deliver(
    plan: &TransferPlan,
    config: &AppConfig,
    session: &HostSession,
    image_ref: &str,
) -> Result<(), PodliftError> {
    match plan {
        TransferPlan::Registry { remote_ref } => {
            if let Some(registry) = config.active_registry() {
                let password = registry
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_string())
                    .unwrap_or_default();
                let login = format!(
                    "printf '%s' {} | sudo docker login {} -u {} --password-stdin",
                    shell_quote(&password),
                    shell_quote(registry.server_name()),
                    shell_quote(&registry.username)
                );
                let display = format!(
                    "sudo docker login {} -u {} --password-stdin",
                    registry.server_name(),
                    registry.username
                );
                session.mutate_secret(&login, &display).await?;
            }
            session.mutate_long(&container::pull_command(remote_ref)).await?;
            session
                .mutate(&format!(
                    "sudo docker tag {} {}",
                    shell_quote(remote_ref),
                    shell_quote(image_ref)
                ))
                .await?;
        }
        TransferPlan::Archive { archive, checksum } => {
            let file_name = archive
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    PodliftError::TransferFailed(format!("invalid archive path {}", archive.display()))
                })?;
            let remote = format!("/tmp/{}", file_name);
            let host = session.host().to_string();
            let progress = |sent: u64, total: u64| {
                debug!(host = %host, sent, total, "copying image");
            };
            session.copy_file(archive, &remote, Some(&progress)).await?;

            let loaded = async {
                if !session.is_dry_run() {
                    verify_checksum(session, &remote, checksum).await?;
                }
                session.mutate_long(&container::load_command(&remote)).await
            }
            .await;
            let cleanup = session
                .mutate(&format!("rm -f {}", shell_quote(&remote)))
                .await;
            loaded?;
            cleanup?;
        }
    }
    info!(host = %session.host(), image = %image_ref, "image available");
    Ok(())
}

async fn verify_checksum(
    session: &HostSession,
    remote: &str,
    expected: &str,
) -> Result<(), PodliftError> {
    let output = session
        .inspect(&format!("sha256sum {}", shell_quote(remote)))
        .await
        .map_err(|e| PodliftError::TransferFailed(format!("checksum failed: {}", e)))?;
    let actual = output.split_whitespace().next().unwrap_or_default();
    if actual != expected {
        return Err(PodliftError::TransferFailed(format!(
            "checksum mismatch on {}:{} (expected {}, got {})",
            session.host(),
            remote,
            expected,
            actual
        )));
    }
    Ok(())
}
