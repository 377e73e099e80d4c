//! Rollback to a stopped generation
//!
//! Stopped containers are restarted by name, so the image and environment they
//! were created with come back unchanged.

use tracing::{error, info, warn};

use crate::config::{AppConfig, DeploySettings, Server};
use crate::deploy::{gate_health, live_generation, upstreams_for, Replica};
use crate::docker::container::{self, ContainerSummary};
use crate::docker::health::HealthProber;
use crate::errors::PodliftError;
use crate::proxy;
use crate::remote::HostSession;

/// Containers restored by a rollback on one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackSummary {
    pub version: String,
    pub restored: Vec<Replica>,
    /// Containers that were running before
    pub stopped: Vec<String>,
}

/// Pick the containers to restore from a newest-first stopped listing
///
/// With `to`, containers of exactly that version win; otherwise any container
/// whose name or version contains it. Without `to`, every container of the
/// newest listed version.
pub fn select_target(
    stopped: &[ContainerSummary],
    to: Option<&str>,
) -> Result<Vec<ContainerSummary>, PodliftError> {
    let selected: Vec<ContainerSummary> = match to.filter(|t| !t.is_empty()) {
        Some(to) => {
            let exact: Vec<ContainerSummary> = stopped
                .iter()
                .filter(|c| c.version == to)
                .cloned()
                .collect();
            if exact.is_empty() {
                stopped
                    .iter()
                    .filter(|c| c.name.contains(to) || c.version.contains(to))
                    .cloned()
                    .collect()
            } else {
                exact
            }
        }
        None => match stopped.first() {
            Some(newest) => stopped
                .iter()
                .filter(|c| c.version == newest.version)
                .cloned()
                .collect(),
            None => Vec::new(),
        },
    };

    if selected.is_empty() {
        return Err(PodliftError::RollbackTargetNotFound(match to {
            Some(to) => format!("no stopped containers match '{}'", to),
            None => "nothing to roll back to".to_string(),
        }));
    }
    Ok(selected)
}

/// Restore a stopped generation on one host
pub async fn run(
    config: &AppConfig,
    settings: &DeploySettings,
    prober: &dyn HealthProber,
    session: &HostSession,
    server: &Server,
    to: Option<&str>,
    skip_healthcheck: bool,
) -> Result<RollbackSummary, PodliftError> {
    let service = &config.service;
    let listing = session
        .inspect(&container::list_stopped_app_containers_command(service))
        .await?;
    let selected = select_target(&ContainerSummary::parse_listing(&listing), to)?;
    let version = selected
        .first()
        .map(|c| c.version.clone())
        .unwrap_or_default();

    let running: Vec<String> = live_generation(session, service)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();
    info!(host = %session.host(), service = %service, version = %version, "rolling back");

    for name in &running {
        session.mutate(&container::stop_command(name)).await?;
    }

    let mut restored = Vec::new();
    for summary in &selected {
        if let Err(e) = session.mutate(&container::start_command(&summary.name)).await {
            error!(host = %session.host(), container = %summary.name, "failed to start container: {}", e);
            undo(session, &restored, &running).await;
            return Err(e);
        }
        restored.push(Replica::from(summary));
    }

    if config.proxy.enabled {
        proxy::route_to(session, config, server, &upstreams_for(&restored)).await?;
    }

    if !skip_healthcheck {
        gate_health(config, settings, prober, session, server, &restored).await?;
    }

    info!(host = %session.host(), service = %service, version = %version, "rollback complete");
    Ok(RollbackSummary {
        version,
        restored,
        stopped: running,
    })
}

async fn undo(session: &HostSession, restored: &[Replica], previous: &[String]) {
    for replica in restored {
        if let Err(e) = session.mutate(&container::stop_command(&replica.name)).await {
            warn!(host = %session.host(), container = %replica.name, "failed to stop container: {}", e);
        }
    }
    for name in previous {
        if let Err(e) = session.mutate(&container::start_command(name)).await {
            warn!(host = %session.host(), container = %name, "failed to restart container: {}", e);
        }
    }
}
