//! Dependency lifecycle
//!
//! Dependencies (databases, caches) outlive application versions: they are
//! created once, started again if stopped, and never replaced by a deploy.
//! Only creation failures are fatal; an unhealthy dependency is reported and
//! the deployment continues.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AppConfig, Dependency, DeploySettings};
use crate::docker::container::{self, ContainerSpec, ContainerStatus, HealthStatus};
use crate::errors::PodliftError;
use crate::remote::HostSession;

/// What happened to one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DependencyOutcome {
    /// Container was already running; nothing was done
    AlreadyRunning,

    /// Container created and healthy
    Started,

    /// Stopped container started again and healthy
    Restarted,

    /// Running but not healthy within the timeout
    Degraded(String),

    /// Exited or died while waiting for it
    Failed(String),
}

impl DependencyOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::Started | Self::Restarted)
    }
}

impl fmt::Display for DependencyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "already running"),
            Self::Started => write!(f, "started"),
            Self::Restarted => write!(f, "restarted"),
            Self::Degraded(reason) => write!(f, "degraded: {}", reason),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome for one dependency on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub name: String,
    pub container: String,
    pub host: String,
    pub outcome: DependencyOutcome,
}

/// Provision every dependency that resolves to this session's host
pub async fn ensure_all(
    config: &AppConfig,
    settings: &DeploySettings,
    session: &HostSession,
    deployed_at: &str,
) -> Result<Vec<DependencyReport>, PodliftError> {
    let mut reports = Vec::new();
    for (name, dep) in &config.dependencies {
        let target = config.servers.resolve_dependency_target(dep)?;
        if target.host() != session.host() {
            continue;
        }

        let outcome = ensure(config, settings, session, name, dep, deployed_at).await?;
        let report = DependencyReport {
            name: name.clone(),
            container: container::dependency_container_name(&config.service, name),
            host: session.host().to_string(),
            outcome,
        };
        match &report.outcome {
            DependencyOutcome::Degraded(reason) => {
                let degraded = PodliftError::DependencyDegraded {
                    name: name.clone(),
                    reason: reason.clone(),
                };
                warn!(host = %report.host, "{}", degraded);
            }
            DependencyOutcome::Failed(reason) => {
                error!(host = %report.host, dependency = %name, "dependency failed to start: {}", reason);
            }
            outcome => info!(host = %report.host, dependency = %name, "{}", outcome),
        }
        reports.push(report);
    }
    Ok(reports)
}

/// Make sure one dependency container exists and is running
///
/// Running again against a satisfied dependency only inspects it.
pub async fn ensure(
    config: &AppConfig,
    settings: &DeploySettings,
    session: &HostSession,
    name: &str,
    dep: &Dependency,
    deployed_at: &str,
) -> Result<DependencyOutcome, PodliftError> {
    let container_name = container::dependency_container_name(&config.service, name);

    let started = match current_status(session, &container_name).await? {
        Some(status) if status.is_running() => return Ok(DependencyOutcome::AlreadyRunning),
        Some(_) => {
            info!(host = %session.host(), container = %container_name, "starting stopped dependency");
            session
                .mutate(&container::start_command(&container_name))
                .await?;
            DependencyOutcome::Restarted
        }
        None => {
            if let Some(volume) = dep.named_volume() {
                session
                    .mutate(&container::volume_create_command(volume))
                    .await?;
            }
            let spec = ContainerSpec::dependency(&config.service, name, dep, deployed_at);
            info!(host = %session.host(), container = %container_name, image = %dep.image, "creating dependency");
            session.mutate(&container::run_command(&spec)).await?;
            DependencyOutcome::Started
        }
    };

    if session.is_dry_run() {
        return Ok(started);
    }
    Ok(match wait_healthy(session, &container_name, settings).await? {
        None => started,
        Some(problem) => problem,
    })
}

async fn current_status(
    session: &HostSession,
    name: &str,
) -> Result<Option<ContainerStatus>, PodliftError> {
    let output = session
        .executor()
        .run(&container::inspect_status_command(name))
        .await?;
    Ok(output
        .success()
        .then(|| ContainerStatus::parse(&output.stdout)))
}

/// Poll engine state until healthy; `None` when healthy
async fn wait_healthy(
    session: &HostSession,
    name: &str,
    settings: &DeploySettings,
) -> Result<Option<DependencyOutcome>, PodliftError> {
    let deadline = Instant::now() + settings.dependency_timeout;
    loop {
        match current_status(session, name).await? {
            Some(status) if status.is_terminal() => {
                return Ok(Some(DependencyOutcome::Failed(format!(
                    "container {} is {:?}",
                    name, status
                ))));
            }
            Some(_) => {}
            None => {
                return Ok(Some(DependencyOutcome::Failed(format!(
                    "container {} disappeared",
                    name
                ))));
            }
        }

        let health = session
            .inspect(&container::inspect_health_command(name))
            .await?;
        match HealthStatus::parse(&health) {
            HealthStatus::Healthy => return Ok(None),
            HealthStatus::Unhealthy => {
                return Ok(Some(DependencyOutcome::Degraded(
                    "engine reports unhealthy".to_string(),
                )));
            }
            HealthStatus::None => {
                tokio::time::sleep(settings.dependency_settle).await;
                let settled = current_status(session, name).await?;
                return Ok(match settled {
                    Some(status) if status.is_terminal() => Some(DependencyOutcome::Failed(
                        format!("container {} is {:?}", name, status),
                    )),
                    _ => None,
                });
            }
            HealthStatus::Starting => {}
        }

        if Instant::now() >= deadline {
            return Ok(Some(DependencyOutcome::Degraded(format!(
                "still starting after {:?}",
                settings.dependency_timeout
            ))));
        }
        tokio::time::sleep(settings.dependency_poll_interval).await;
    }
}
