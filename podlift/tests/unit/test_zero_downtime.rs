//! Cutover behaviour on a simulated host

use std::sync::Arc;

use podlift::config::{AppConfig, DeploySettings, Server, ServiceSpec, Topology};
use podlift::deploy::fsm::{CutoverFsm, CutoverState};
use podlift::deploy::{zero_downtime, DeployContext, SwapSummary};
use podlift::errors::PodliftError;
use podlift::remote::fake::{FakeConnector, FakeContainer, FakeHost, FakeProber};
use podlift::remote::HostSession;

fn config() -> AppConfig {
    let servers = Topology::new().with_role("web", vec![Server::new("h1")]);
    AppConfig::new("shop", "shop", servers)
}

fn live_host() -> FakeHost {
    let host = FakeHost::new("h1");
    host.install_nginx();
    host.add_container(FakeContainer::app("shop", "web", "v0", 1, 9000, false));
    host.add_container(FakeContainer::app("shop", "web", "v1", 1, 9001, true));
    host
}

/// Names and ports of every container, in creation order
fn snapshot(host: &FakeHost) -> Vec<(String, Option<u16>, String)> {
    host.containers()
        .into_iter()
        .map(|c| (c.name, c.host_port, c.status))
        .collect()
}

async fn cutover(
    host: &FakeHost,
    config: &AppConfig,
    version: &str,
    skip_healthcheck: bool,
) -> (Result<SwapSummary, PodliftError>, CutoverFsm) {
    cutover_with(host, config, version, skip_healthcheck, DeploySettings::immediate()).await
}

async fn cutover_with(
    host: &FakeHost,
    config: &AppConfig,
    version: &str,
    skip_healthcheck: bool,
    settings: DeploySettings,
) -> (Result<SwapSummary, PodliftError>, CutoverFsm) {
    let prober = FakeProber::new(FakeConnector::new().with_host(host.clone()));
    let image_ref = format!("shop:{}", version);
    let ctx = DeployContext {
        config,
        settings: &settings,
        prober: &prober,
        version,
        image_ref: &image_ref,
        deployed_at: "2026-03-01T12:00:00Z",
        skip_healthcheck,
    };
    let session = HostSession::new(Arc::new(host.clone()), false);
    let mut fsm = CutoverFsm::new();
    let result = zero_downtime::run(&ctx, &session, &Server::new("h1"), &mut fsm).await;
    (result, fsm)
}

#[tokio::test]
async fn test_failed_gate_leaves_outgoing_generation_untouched() {
    let host = live_host();
    host.set_http_unhealthy("shop:v2");
    let before = snapshot(&host);

    let (result, fsm) = cutover(&host, &config(), "v2", false).await;

    match result {
        Err(PodliftError::HealthCheckFailed { attempts, .. }) => assert_eq!(attempts, 15),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(fsm.state(), CutoverState::Failed(_)));
    assert!(!fsm.history().contains(&CutoverState::CuttingOver));
    assert_eq!(snapshot(&host), before);
    assert_eq!(host.reloads(), 0);
    assert_eq!(host.count_commands("docker stop"), 0);
}

#[tokio::test]
async fn test_skipped_health_check_still_cuts_over() {
    let host = live_host();
    host.set_http_unhealthy("shop:v2");

    let (result, fsm) = cutover(&host, &config(), "v2", true).await;

    let summary = result.unwrap();
    assert_eq!(fsm.state(), &CutoverState::Done);
    assert_eq!(summary.incoming[0].port, 9002);
    assert_eq!(host.upstream_ports("shop"), vec![9002]);
}

#[tokio::test]
async fn test_cutover_keeps_one_stopped_generation() {
    let host = live_host();

    let (result, _) = cutover(&host, &config(), "v2", false).await;

    let summary = result.unwrap();
    assert_eq!(summary.outgoing, vec!["shop-web-v1-1".to_string()]);
    assert!(summary.cleanup_failures.is_empty());
    assert!(host.container("shop-web-v0-1").is_none());
    assert_eq!(host.container("shop-web-v1-1").unwrap().status, "exited");
    assert!(host.container("shop-web-v2-1").unwrap().is_running());
}

#[tokio::test]
async fn test_zero_retention_removes_outgoing_generation() {
    let host = live_host();
    let settings = DeploySettings {
        retain_stopped_generations: 0,
        ..DeploySettings::immediate()
    };

    let (result, fsm) = cutover_with(&host, &config(), "v2", false, settings).await;

    let summary = result.unwrap();
    assert_eq!(fsm.state(), &CutoverState::Done);
    assert_eq!(summary.outgoing, vec!["shop-web-v1-1".to_string()]);
    assert!(host.container("shop-web-v0-1").is_none());
    assert!(host.container("shop-web-v1-1").is_none());
    assert!(host.container("shop-web-v2-1").unwrap().is_running());
    assert_eq!(host.upstream_ports("shop"), vec![9002]);
}

#[tokio::test]
async fn test_certificate_failure_keeps_traffic_on_live_generation() {
    let host = FakeHost::new("h1");
    host.install_nginx();
    let mut config = config();
    let (first, _) = cutover(&host, &config, "v1", false).await;
    assert_eq!(first.unwrap().incoming[0].port, 9000);
    assert_eq!(host.reloads(), 1);

    config.proxy.ssl = Some("letsencrypt".to_string());
    config.proxy.ssl_email = Some("ops@example.com".to_string());
    host.fail_on("certbot certonly");
    let (result, fsm) = cutover(&host, &config, "v2", false).await;

    assert!(matches!(result, Err(PodliftError::ProxyReloadFailed(_))));
    assert!(matches!(fsm.state(), CutoverState::Failed(_)));
    assert_eq!(host.upstream_ports("shop"), vec![9000]);
    assert_eq!(host.reloads(), 1);
    assert!(host.container("shop-web-v1-1").unwrap().is_running());
    assert!(host.container("shop-web-v2-1").unwrap().is_running());
}

#[tokio::test]
async fn test_certificate_failure_on_new_host_never_routes_incoming() {
    let host = FakeHost::new("h1");
    host.install_nginx();
    host.fail_on("certbot certonly");
    let mut config = config();
    config.proxy.ssl = Some("letsencrypt".to_string());
    config.proxy.ssl_email = Some("ops@example.com".to_string());

    let (result, _) = cutover(&host, &config, "v1", false).await;

    assert!(matches!(result, Err(PodliftError::ProxyReloadFailed(_))));
    assert!(host.upstream_ports("shop").is_empty());
}

#[tokio::test]
async fn test_proxy_failure_leaves_both_generations_running() {
    let host = live_host();
    host.fail_on("nginx -t");

    let (result, fsm) = cutover(&host, &config(), "v2", false).await;

    assert!(matches!(result, Err(PodliftError::ProxyReloadFailed(_))));
    assert!(matches!(fsm.state(), CutoverState::Failed(_)));
    assert_eq!(host.reloads(), 0);
    assert!(host.container("shop-web-v1-1").unwrap().is_running());
    assert!(host.container("shop-web-v2-1").unwrap().is_running());
}

#[tokio::test]
async fn test_only_web_replicas_are_proxied() {
    let host = FakeHost::new("h1");
    host.install_nginx();
    let mut config = config();
    if let Some(web) = config.services.get_mut("web") {
        web.replicas = 2;
    }
    config.services.insert(
        "worker".to_string(),
        ServiceSpec {
            healthcheck: None,
            command: Some("bin/worker".to_string()),
            ..ServiceSpec::default()
        },
    );

    let (result, fsm) = cutover(&host, &config, "v1", false).await;

    let summary = result.unwrap();
    assert_eq!(fsm.state(), &CutoverState::Done);
    assert_eq!(summary.incoming.len(), 3);
    let web_ports: Vec<u16> = summary
        .incoming
        .iter()
        .filter(|r| r.process == "web")
        .map(|r| r.port)
        .collect();
    assert_eq!(host.upstream_ports("shop"), web_ports);
    assert!(host.container("shop-worker-v1-1").unwrap().is_running());
}
