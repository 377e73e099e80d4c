//! Error types for podlift

use thiserror::Error;

/// Main error type for podlift
#[derive(Error, Debug)]
pub enum PodliftError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Connection to {host} failed: {reason}")]
    ConnectivityFailed { host: String, reason: String },

    #[error("Command failed on {host}: {command}\n{stderr}")]
    CommandFailed {
        host: String,
        command: String,
        stderr: String,
    },

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Health check failed after {attempts} attempts: {reason}")]
    HealthCheckFailed { attempts: u32, reason: String },

    #[error("Proxy reload failed: {0}")]
    ProxyReloadFailed(String),

    #[error("Dependency {name} degraded: {reason}")]
    DependencyDegraded { name: String, reason: String },

    #[error("Nothing to roll back to: {0}")]
    RollbackTargetNotFound(String),

    #[error("Service '{service}' on {host} belongs to a different application (deployed from {deployed_repo})")]
    ServiceConflict {
        service: String,
        host: String,
        deployed_repo: String,
    },

    #[error("Version {version} is already live on {host}")]
    VersionAlreadyLive { version: String, host: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Hook failed: {0}")]
    HookFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PodliftError {
    /// Short category name used in reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PodliftError::IoError(_) => "io",
            PodliftError::JsonError(_) => "json",
            PodliftError::HttpError(_) => "http",
            PodliftError::ConfigurationInvalid(_) => "configuration_invalid",
            PodliftError::TargetNotFound(_) => "target_resolution_failed",
            PodliftError::ConnectivityFailed { .. } => "connectivity_failed",
            PodliftError::CommandFailed { .. } => "command_failed",
            PodliftError::BuildFailed(_) => "build_failed",
            PodliftError::TransferFailed(_) => "transfer_failed",
            PodliftError::HealthCheckFailed { .. } => "health_check_failed",
            PodliftError::ProxyReloadFailed(_) => "proxy_reload_failed",
            PodliftError::DependencyDegraded { .. } => "dependency_degraded",
            PodliftError::RollbackTargetNotFound(_) => "rollback_target_not_found",
            PodliftError::ServiceConflict { .. } => "service_conflict",
            PodliftError::VersionAlreadyLive { .. } => "version_already_live",
            PodliftError::InvalidTransition(_) => "invalid_transition",
            PodliftError::CertificateError(_) => "certificate",
            PodliftError::HookFailed(_) => "hook_failed",
            PodliftError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for PodliftError {
    fn from(err: anyhow::Error) -> Self {
        PodliftError::Internal(err.to_string())
    }
}
