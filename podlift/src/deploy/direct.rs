//! Stop-then-start replacement
//!
//! Used when zero-downtime is off: the live generation is stopped, the new one
//! takes the configured ports, and the old one is started again if the new one
//! fails to start or to pass its health check.

use tracing::{error, info, warn};

use crate::config::Server;
use crate::deploy::{
    clear_name_collisions, gate_health, live_generation, plan_generation, prune_stopped,
    remove_all, start_generation, upstreams_for, DeployContext, PortAllocator, SwapSummary,
};
use crate::docker::container;
use crate::errors::PodliftError;
use crate::proxy;
use crate::remote::HostSession;

pub async fn run(
    ctx: &DeployContext<'_>,
    session: &HostSession,
    server: &Server,
) -> Result<SwapSummary, PodliftError> {
    let service = &ctx.config.service;
    let outgoing: Vec<String> = live_generation(session, service)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();

    let mut ports = PortAllocator::new(0, []);
    let specs = plan_generation(ctx, |spec, replica| {
        let preferred = u16::try_from(u32::from(spec.port) + replica - 1).map_err(|_| {
            PodliftError::ConfigurationInvalid(format!(
                "replica {} of port {} is out of range",
                replica, spec.port
            ))
        })?;
        ports.allocate_from(preferred)
    })?;
    let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
    clear_name_collisions(session, service, ctx.version, &names).await?;

    info!(host = %session.host(), service = %service, version = %ctx.version, "replacing containers");
    for (i, name) in outgoing.iter().enumerate() {
        if let Err(e) = session.mutate(&container::stop_command(name)).await {
            error!(host = %session.host(), container = %name, "failed to stop live container: {}", e);
            restart_all(session, &outgoing[..i]).await;
            return Err(e);
        }
    }

    let (incoming, failure) = start_generation(session, &specs).await;
    let outcome = match failure {
        Some(e) => Err(e),
        None if ctx.skip_healthcheck => Ok(()),
        None => {
            gate_health(ctx.config, ctx.settings, ctx.prober, session, server, &incoming).await
        }
    };

    if let Err(e) = outcome {
        error!(host = %session.host(), "new containers failed, restoring previous ones: {}", e);
        let names: Vec<String> = incoming.iter().map(|r| r.name.clone()).collect();
        remove_all(session, &names).await;
        restart_all(session, &outgoing).await;
        return Err(e);
    }

    if ctx.config.proxy.enabled {
        proxy::route_to(session, ctx.config, server, &upstreams_for(&incoming)).await?;
    }

    if let Err(e) = prune_stopped(session, service, ctx.settings.retain_stopped_generations).await
    {
        warn!(host = %session.host(), "failed to prune old generations: {}", e);
    }

    Ok(SwapSummary {
        incoming,
        outgoing,
        cleanup_failures: Vec::new(),
    })
}

/// Start previously live containers again, logging failures
async fn restart_all(session: &HostSession, names: &[String]) {
    for name in names {
        if let Err(e) = session.mutate(&container::start_command(name)).await {
            warn!(host = %session.host(), container = %name, "failed to restart previous container: {}", e);
        }
    }
}
