//! Rollback on a simulated host

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use podlift::config::{AppConfig, DeploySettings, Server, Topology};
use podlift::deploy::rollback;
use podlift::errors::PodliftError;
use podlift::remote::fake::{FakeConnector, FakeContainer, FakeHost, FakeProber};
use podlift::remote::HostSession;

fn config() -> AppConfig {
    let servers = Topology::new().with_role("web", vec![Server::new("h1")]);
    AppConfig::new("shop", "shop", servers)
}

/// v1 and v2 stopped, v3 live
fn host_with_history() -> FakeHost {
    let host = FakeHost::new("h1");
    host.install_nginx();
    host.add_container(FakeContainer::app("shop", "web", "v1", 1, 9000, false));
    host.add_container(FakeContainer::app("shop", "web", "v2", 1, 9001, false));
    host.add_container(FakeContainer::app("shop", "web", "v3", 1, 9002, true));
    host
}

async fn roll_back(
    host: &FakeHost,
    to: Option<&str>,
) -> Result<rollback::RollbackSummary, PodliftError> {
    let config = config();
    let prober = FakeProber::new(FakeConnector::new().with_host(host.clone()));
    let session = HostSession::new(Arc::new(host.clone()), false);
    rollback::run(
        &config,
        &DeploySettings::immediate(),
        &prober,
        &session,
        &Server::new("h1"),
        to,
        false,
    )
    .await
}

#[tokio::test]
async fn test_rollback_to_named_version() {
    let host = host_with_history();

    let summary = assert_ok!(roll_back(&host, Some("v1")).await);

    assert_eq!(summary.version, "v1");
    assert_eq!(summary.stopped, vec!["shop-web-v3-1".to_string()]);
    let running: Vec<String> = host.running_containers().into_iter().map(|c| c.name).collect();
    assert_eq!(running, vec!["shop-web-v1-1".to_string()]);
    assert_eq!(host.upstream_ports("shop"), vec![9000]);
    assert_eq!(host.reloads(), 1);
}

#[tokio::test]
async fn test_rollback_defaults_to_newest_stopped() {
    let host = host_with_history();

    let summary = roll_back(&host, None).await.unwrap();

    assert_eq!(summary.version, "v2");
    assert!(host.container("shop-web-v2-1").unwrap().is_running());
    assert!(!host.container("shop-web-v3-1").unwrap().is_running());
    assert_eq!(host.upstream_ports("shop"), vec![9001]);
}

#[tokio::test]
async fn test_unknown_target_changes_nothing() {
    let host = host_with_history();

    let err = assert_err!(roll_back(&host, Some("v9")).await);

    assert!(matches!(err, PodliftError::RollbackTargetNotFound(_)));
    assert!(host.container("shop-web-v3-1").unwrap().is_running());
    assert_eq!(host.count_commands("docker stop"), 0);
}

#[tokio::test]
async fn test_failed_start_restores_previous_generation() {
    let host = host_with_history();
    host.fail_on("docker start shop-web-v1-1");

    let err = roll_back(&host, Some("v1")).await.unwrap_err();

    assert!(matches!(err, PodliftError::CommandFailed { .. }));
    assert!(host.container("shop-web-v3-1").unwrap().is_running());
    assert!(!host.container("shop-web-v1-1").unwrap().is_running());
    assert_eq!(host.reloads(), 0);
}
