//! Zero-downtime cutover
//!
//! Drives [`CutoverFsm`] through provision, health gate, proxy swap, drain and
//! decommission for one server. The outgoing generation is only touched once
//! the proxy routes to the incoming one.

use tracing::{error, info, warn};

use crate::config::Server;
use crate::deploy::fsm::{CutoverEvent, CutoverFsm};
use crate::deploy::{
    app_containers, clear_name_collisions, gate_health, plan_generation, prune_stopped,
    remove_all, start_generation, upstreams_for, DeployContext, PortAllocator, Replica,
    SwapSummary,
};
use crate::docker::container;
use crate::errors::PodliftError;
use crate::proxy;
use crate::remote::HostSession;

/// Run a full cutover on `server`, recording every transition in `fsm`
pub async fn run(
    ctx: &DeployContext<'_>,
    session: &HostSession,
    server: &Server,
    fsm: &mut CutoverFsm,
) -> Result<SwapSummary, PodliftError> {
    let service = &ctx.config.service;
    let known = app_containers(session, service, true).await?;
    let outgoing: Vec<String> = known
        .iter()
        .filter(|c| c.status.is_running())
        .map(|c| c.name.clone())
        .collect();

    let mut ports = PortAllocator::new(
        ctx.settings.temp_port_base,
        known.iter().filter_map(|c| c.port),
    );
    let specs = plan_generation(ctx, |_, _| ports.allocate())?;
    let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
    clear_name_collisions(session, service, ctx.version, &names).await?;

    info!(
        host = %session.host(),
        service = %service,
        version = %ctx.version,
        outgoing = outgoing.len(),
        incoming = specs.len(),
        "starting cutover"
    );
    fsm.process(CutoverEvent::Begin)?;

    let (incoming, failure) = start_generation(session, &specs).await;
    if let Some(e) = failure {
        fsm.process(CutoverEvent::ProvisionFailed(e.to_string()))?;
        discard(session, &incoming, fsm).await?;
        return Err(e);
    }
    fsm.process(CutoverEvent::Provisioned)?;

    if ctx.skip_healthcheck {
        warn!(host = %session.host(), "health checks skipped");
    } else if let Err(e) = gate_health(
        ctx.config,
        ctx.settings,
        ctx.prober,
        session,
        server,
        &incoming,
    )
    .await
    {
        error!(host = %session.host(), "incoming generation failed its health check: {}", e);
        fsm.process(CutoverEvent::GateFailed(e.to_string()))?;
        discard(session, &incoming, fsm).await?;
        return Err(e);
    }
    fsm.process(CutoverEvent::Healthy)?;

    if ctx.config.proxy.enabled {
        if let Err(e) = proxy::route_to(session, ctx.config, server, &upstreams_for(&incoming)).await
        {
            error!(
                host = %session.host(),
                "proxy update failed, incoming generation left running for inspection: {}",
                e
            );
            fsm.process(CutoverEvent::ProxyFailed(e.to_string()))?;
            return Err(e);
        }
    }
    fsm.process(CutoverEvent::CutOver)?;

    if !outgoing.is_empty() && !session.is_dry_run() && !ctx.settings.drain_grace.is_zero() {
        info!(host = %session.host(), grace = ?ctx.settings.drain_grace, "draining outgoing generation");
        tokio::time::sleep(ctx.settings.drain_grace).await;
    }
    fsm.process(CutoverEvent::Drained)?;

    let cleanup_failures = decommission(ctx, session, &outgoing).await;
    fsm.process(CutoverEvent::Decommissioned)?;

    info!(host = %session.host(), service = %service, version = %ctx.version, "cutover complete");
    Ok(SwapSummary {
        incoming,
        outgoing,
        cleanup_failures,
    })
}

/// Remove the incoming generation after a failed start or health gate
async fn discard(
    session: &HostSession,
    incoming: &[Replica],
    fsm: &mut CutoverFsm,
) -> Result<(), PodliftError> {
    let names: Vec<String> = incoming.iter().map(|r| r.name.clone()).collect();
    let leftovers = remove_all(session, &names).await;
    if !leftovers.is_empty() {
        warn!(host = %session.host(), containers = ?leftovers, "incoming containers left behind");
    }
    fsm.process(CutoverEvent::RolledBack)?;
    Ok(())
}

/// Stop the outgoing generation and prune older stopped ones
///
/// Failures are logged and returned, the cutover has already happened.
async fn decommission(
    ctx: &DeployContext<'_>,
    session: &HostSession,
    outgoing: &[String],
) -> Vec<String> {
    let mut failures = Vec::new();
    for name in outgoing {
        if let Err(e) = session.mutate(&container::stop_command(name)).await {
            warn!(host = %session.host(), container = %name, "failed to stop outgoing container: {}", e);
            failures.push(name.clone());
        }
    }

    match prune_stopped(
        session,
        &ctx.config.service,
        ctx.settings.retain_stopped_generations,
    )
    .await
    {
        Ok(pruned) if !pruned.is_empty() => {
            info!(host = %session.host(), containers = ?pruned, "pruned old generations");
        }
        Ok(_) => {}
        Err(e) => warn!(host = %session.host(), "failed to prune old generations: {}", e),
    }
    failures
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{AppConfig, DeploySettings, Topology};
    use crate::deploy::fsm::CutoverState;
    use crate::remote::fake::{FakeConnector, FakeContainer, FakeHost, FakeProber};

    fn config() -> AppConfig {
        let servers = Topology::new().with_role("web", vec![Server::new("h1")]);
        AppConfig::new("shop", "shop", servers)
    }

    #[tokio::test]
    async fn test_cutover_replaces_live_generation() {
        let host = FakeHost::new("h1");
        host.install_nginx();
        host.add_container(FakeContainer::app("shop", "web", "v1", 1, 9000, true));
        let prober = FakeProber::new(FakeConnector::new().with_host(host.clone()));
        let config = config();
        let settings = DeploySettings::immediate();
        let ctx = DeployContext {
            config: &config,
            settings: &settings,
            prober: &prober,
            version: "v2",
            image_ref: "shop:v2",
            deployed_at: "2026-01-01T00:00:00Z",
            skip_healthcheck: false,
        };
        let session = HostSession::new(Arc::new(host.clone()), false);
        let mut fsm = CutoverFsm::new();

        let summary = run(&ctx, &session, &Server::new("h1"), &mut fsm)
            .await
            .unwrap();

        assert_eq!(fsm.state(), &CutoverState::Done);
        assert_eq!(summary.outgoing, vec!["shop-web-v1-1".to_string()]);
        assert_eq!(summary.incoming[0].port, 9001);
        assert_eq!(host.upstream_ports("shop"), vec![9001]);
        assert_eq!(host.reloads(), 1);
        let running: Vec<String> = host.running_containers().into_iter().map(|c| c.name).collect();
        assert_eq!(running, vec!["shop-web-v2-1".to_string()]);
        assert!(host.container("shop-web-v1-1").is_some());
    }

    #[tokio::test]
    async fn test_running_version_is_refused() {
        let host = FakeHost::new("h1");
        host.add_container(FakeContainer::app("shop", "web", "v1", 1, 9000, true));
        let prober = FakeProber::new(FakeConnector::new());
        let config = config();
        let settings = DeploySettings::immediate();
        let ctx = DeployContext {
            config: &config,
            settings: &settings,
            prober: &prober,
            version: "v1",
            image_ref: "shop:v1",
            deployed_at: "t",
            skip_healthcheck: true,
        };
        let session = HostSession::new(Arc::new(host.clone()), false);
        let mut fsm = CutoverFsm::new();

        let err = run(&ctx, &session, &Server::new("h1"), &mut fsm)
            .await
            .unwrap_err();
        assert!(matches!(err, PodliftError::VersionAlreadyLive { .. }));
        assert_eq!(fsm.state(), &CutoverState::Idle);
    }
}
