//! Deployment module

pub mod dependencies;
pub mod direct;
pub mod fsm;
pub mod hooks;
pub mod pipeline;
pub mod rollback;
pub mod state;
pub mod transfer;
pub mod zero_downtime;

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, DeploySettings, Server, ServiceSpec};
use crate::docker::container::{self, ContainerSpec, ContainerSummary};
use crate::docker::health::{HealthProber, ProbeRequest};
use crate::errors::PodliftError;
use crate::proxy::nginx::Upstream;
use crate::remote::HostSession;

/// Process whose replicas receive proxied traffic when it exists
pub const PROXIED_PROCESS: &str = "web";

/// Inputs shared by every per-server step of one deployment
pub struct DeployContext<'a> {
    pub config: &'a AppConfig,
    pub settings: &'a DeploySettings,
    pub prober: &'a dyn HealthProber,
    pub version: &'a str,
    /// Image reference as known on the servers
    pub image_ref: &'a str,
    pub deployed_at: &'a str,
    pub skip_healthcheck: bool,
}

/// A started application container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub name: String,
    pub process: String,
    pub port: u16,
}

impl From<&ContainerSummary> for Replica {
    fn from(summary: &ContainerSummary) -> Self {
        Self {
            name: summary.name.clone(),
            process: summary.process.clone(),
            port: summary.port.unwrap_or_default(),
        }
    }
}

/// Backends for the proxy: the `web` replicas, or every replica without one
pub fn upstreams_for(replicas: &[Replica]) -> Vec<Upstream> {
    let has_web = replicas.iter().any(|r| r.process == PROXIED_PROCESS);
    replicas
        .iter()
        .filter(|r| !has_web || r.process == PROXIED_PROCESS)
        .filter(|r| r.port > 0)
        .map(|r| Upstream::local(&r.name, r.port))
        .collect()
}

/// Hands out host ports in increasing order, skipping reserved ones
#[derive(Debug, Clone)]
pub struct PortAllocator {
    next: u16,
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        Self {
            next: base,
            reserved: reserved.into_iter().collect(),
        }
    }

    /// Next free port at or above the cursor
    pub fn allocate(&mut self) -> Result<u16, PodliftError> {
        self.allocate_from(self.next)
    }

    /// Next free port at or above `start`, never below the cursor
    pub fn allocate_from(&mut self, start: u16) -> Result<u16, PodliftError> {
        let mut port = start;
        while self.reserved.contains(&port) {
            port = port.checked_add(1).ok_or_else(|| {
                PodliftError::Internal("no free host port left".to_string())
            })?;
        }
        self.reserved.insert(port);
        if port >= self.next {
            self.next = port.saturating_add(1);
        }
        Ok(port)
    }
}

/// Result of replacing one generation with another on a host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapSummary {
    /// Containers now serving the service
    pub incoming: Vec<Replica>,
    /// Containers of the generation that was live before
    pub outgoing: Vec<String>,
    /// Outgoing containers that could not be stopped or removed
    pub cleanup_failures: Vec<String>,
}

/// Container specs for every process and replica of the service
///
/// `port_for` picks the host port of a replica given its service spec and
/// replica number (starting at 1).
pub(crate) fn plan_generation<F>(
    ctx: &DeployContext<'_>,
    mut port_for: F,
) -> Result<Vec<ContainerSpec>, PodliftError>
where
    F: FnMut(&ServiceSpec, u32) -> Result<u16, PodliftError>,
{
    let mut specs = Vec::new();
    for (process, spec) in &ctx.config.services {
        for replica in 1..=spec.replicas {
            let port = port_for(spec, replica)?;
            specs.push(ContainerSpec::app_replica(
                &ctx.config.service,
                process,
                spec,
                ctx.image_ref,
                ctx.version,
                replica,
                port,
                ctx.deployed_at,
            ));
        }
    }
    Ok(specs)
}

/// Create and start containers in order, stopping at the first failure
///
/// Returns the replicas started so far together with the failure, if any.
pub(crate) async fn start_generation(
    session: &HostSession,
    specs: &[ContainerSpec],
) -> (Vec<Replica>, Option<PodliftError>) {
    let mut started = Vec::new();
    for spec in specs {
        if let Err(e) = session.mutate(&container::run_command(spec)).await {
            error!(host = %session.host(), container = %spec.name, "failed to start container: {}", e);
            return (started, Some(e));
        }
        debug!(host = %session.host(), container = %spec.name, "container started");
        started.push(Replica {
            name: spec.name.clone(),
            process: spec
                .labels
                .get(container::LABEL_CONTAINER_TYPE)
                .cloned()
                .unwrap_or_default(),
            port: spec.host_port.unwrap_or_default(),
        });
    }
    (started, None)
}

/// Probe the first replica of every health-checked process
pub(crate) async fn gate_health(
    config: &AppConfig,
    settings: &DeploySettings,
    prober: &dyn HealthProber,
    session: &HostSession,
    server: &Server,
    replicas: &[Replica],
) -> Result<(), PodliftError> {
    if session.is_dry_run() {
        return Ok(());
    }
    if !settings.warm_up.is_zero() {
        tokio::time::sleep(settings.warm_up).await;
    }

    for (process, spec) in &config.services {
        let Some(check) = spec.active_healthcheck() else {
            continue;
        };
        let Some(first) = replicas.iter().find(|r| &r.process == process) else {
            continue;
        };
        let request = ProbeRequest::for_check(&server.host, first.port, check);
        info!(host = %server.host, process = %process, url = %request.url, "health gating");
        prober.probe(&request).await?;
    }
    Ok(())
}

/// Application containers of the service on a host, newest first
pub(crate) async fn app_containers(
    session: &HostSession,
    service: &str,
    include_stopped: bool,
) -> Result<Vec<ContainerSummary>, PodliftError> {
    let listing = session
        .inspect(&container::list_app_containers_command(service, include_stopped))
        .await?;
    Ok(ContainerSummary::parse_listing(&listing))
}

/// Running application containers of the service on a host
pub(crate) async fn live_generation(
    session: &HostSession,
    service: &str,
) -> Result<Vec<ContainerSummary>, PodliftError> {
    app_containers(session, service, false).await
}

/// Fail on names already running, drop stopped containers holding them
pub(crate) async fn clear_name_collisions(
    session: &HostSession,
    service: &str,
    version: &str,
    names: &[String],
) -> Result<(), PodliftError> {
    for existing in app_containers(session, service, true).await? {
        if !names.contains(&existing.name) {
            continue;
        }
        if existing.status.is_running() {
            return Err(PodliftError::VersionAlreadyLive {
                version: version.to_string(),
                host: session.host().to_string(),
            });
        }
        session
            .mutate(&container::remove_command(&existing.name))
            .await?;
    }
    Ok(())
}

/// Remove containers, logging failures
pub(crate) async fn remove_all(session: &HostSession, names: &[String]) -> Vec<String> {
    let mut failures = Vec::new();
    for name in names {
        if let Err(e) = session.mutate(&container::remove_command(name)).await {
            warn!(host = %session.host(), container = %name, "failed to remove container: {}", e);
            failures.push(name.clone());
        }
    }
    failures
}

/// Delete stopped generations beyond the newest `keep` versions
pub(crate) async fn prune_stopped(
    session: &HostSession,
    service: &str,
    keep: usize,
) -> Result<Vec<String>, PodliftError> {
    let listing = session
        .inspect(&container::list_stopped_app_containers_command(service))
        .await?;
    let stopped = ContainerSummary::parse_listing(&listing);

    let mut versions: Vec<&str> = Vec::new();
    for summary in &stopped {
        if !versions.contains(&summary.version.as_str()) {
            versions.push(&summary.version);
        }
    }
    let doomed: Vec<String> = stopped
        .iter()
        .filter(|s| {
            versions
                .iter()
                .position(|v| *v == s.version)
                .is_some_and(|i| i >= keep)
        })
        .map(|s| s.name.clone())
        .collect();

    remove_all(session, &doomed).await;
    Ok(doomed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(name: &str, process: &str, port: u16) -> Replica {
        Replica {
            name: name.to_string(),
            process: process.to_string(),
            port,
        }
    }

    #[test]
    fn test_port_allocator_skips_reserved() {
        let mut ports = PortAllocator::new(9000, [9000, 9002]);
        assert_eq!(ports.allocate().unwrap(), 9001);
        assert_eq!(ports.allocate().unwrap(), 9003);
        assert_eq!(ports.allocate_from(8000).unwrap(), 8000);
        assert_eq!(ports.allocate_from(8000).unwrap(), 8001);
        assert_eq!(ports.allocate().unwrap(), 9004);
    }

    #[test]
    fn test_upstreams_prefer_web_process() {
        let replicas = vec![
            replica("a-web-v1-1", "web", 9000),
            replica("a-worker-v1-1", "worker", 9001),
            replica("a-web-v1-2", "web", 9002),
        ];
        let ports: Vec<u16> = upstreams_for(&replicas).iter().map(|u| u.port).collect();
        assert_eq!(ports, vec![9000, 9002]);

        let only_api = vec![replica("a-api-v1-1", "api", 9000)];
        assert_eq!(upstreams_for(&only_api).len(), 1);
    }
}
