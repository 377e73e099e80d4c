//! Dependency lifecycle on a simulated host

use std::sync::Arc;

use podlift::config::{AppConfig, DeploySettings, Dependency, Server, Topology};
use podlift::deploy::dependencies::{ensure_all, DependencyOutcome};
use podlift::remote::fake::FakeHost;
use podlift::remote::HostSession;

fn config() -> AppConfig {
    let servers = Topology::new()
        .with_role("web", vec![Server::new("app1")])
        .with_role("db", vec![Server::new("db1")]);
    let mut config = AppConfig::new("shop", "shop", servers);

    let mut postgres = Dependency::new("postgres:16");
    postgres.role = Some("db".to_string());
    postgres.port = Some(5432);
    postgres.volume = Some("shop-pgdata:/var/lib/postgresql/data".to_string());
    config.dependencies.insert("postgres".to_string(), postgres);

    let mut redis = Dependency::new("redis:7");
    redis.host = Some("app1".to_string());
    config.dependencies.insert("redis".to_string(), redis);
    config
}

#[tokio::test]
async fn test_second_deploy_creates_nothing() {
    let config = config();
    let settings = DeploySettings::immediate();
    let host = FakeHost::new("db1");
    host.set_engine_health("postgres:16", "healthy");
    let session = HostSession::new(Arc::new(host.clone()), false);

    let first = ensure_all(&config, &settings, &session, "t1").await.unwrap();
    let second = ensure_all(&config, &settings, &session, "t2").await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].container, "shop-postgres");
    assert_eq!(first[0].outcome, DependencyOutcome::Started);
    assert_eq!(second[0].outcome, DependencyOutcome::AlreadyRunning);
    assert_eq!(host.count_commands("docker run"), 1);
    assert_eq!(host.volumes(), vec!["shop-pgdata".to_string()]);
    assert!(host.container("shop-redis").is_none());
}

#[tokio::test]
async fn test_unhealthy_dependency_does_not_abort() {
    let config = config();
    let settings = DeploySettings::immediate();
    let host = FakeHost::new("app1");
    host.set_engine_health("redis:7", "unhealthy");
    let session = HostSession::new(Arc::new(host.clone()), false);

    let reports = ensure_all(&config, &settings, &session, "t1").await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "redis");
    assert!(matches!(reports[0].outcome, DependencyOutcome::Degraded(_)));
    assert!(!reports[0].outcome.is_healthy());
    assert!(host.container("shop-redis").unwrap().is_running());
}

#[tokio::test]
async fn test_dry_run_records_creation_only() {
    let config = config();
    let settings = DeploySettings::immediate();
    let host = FakeHost::new("db1");
    let session = HostSession::new(Arc::new(host.clone()), true);

    let reports = ensure_all(&config, &settings, &session, "t1").await.unwrap();

    assert_eq!(reports[0].outcome, DependencyOutcome::Started);
    assert!(host.containers().is_empty());
    let plan = session.plan().await;
    assert!(plan.iter().any(|c| c.contains("docker volume create shop-pgdata")));
    assert!(plan.iter().any(|c| c.contains("--name shop-postgres")));
}
