//! End-to-end pipeline runs against simulated servers

use std::sync::{Arc, Mutex};

use podlift::config::{AppConfig, DeploySettings, HooksConfig, Server, Topology};
use podlift::deploy::fsm::CutoverState;
use podlift::deploy::pipeline::{
    DeployOptions, LogsOptions, Pipeline, RollbackOptions, ServerOutcome, TeardownOptions,
};
use podlift::deploy::state::state_path;
use podlift::errors::PodliftError;
use podlift::proxy::nginx::site_path;
use podlift::remote::fake::{FakeConnector, FakeContainer, FakeHost, FakeProber, FakeToolchain};

struct Cluster {
    pipeline: Pipeline,
    connector: FakeConnector,
}

impl Cluster {
    fn host(&self, name: &str) -> &FakeHost {
        self.connector.host(name).unwrap()
    }
}

fn cluster(hosts: &[&str], configure: impl FnOnce(&mut AppConfig)) -> Cluster {
    let servers = Topology::new().with_role(
        "web",
        hosts.iter().map(|h| Server::new(*h)).collect(),
    );
    let mut config = AppConfig::new("shop", "shop", servers);
    configure(&mut config);

    let mut connector = FakeConnector::new();
    for name in hosts {
        let host = FakeHost::new(*name);
        host.install_nginx();
        connector = connector.with_host(host);
    }
    let pipeline = Pipeline::new(
        Arc::new(config),
        DeploySettings::immediate(),
        Arc::new(connector.clone()),
        Arc::new(FakeToolchain::new()),
        Arc::new(FakeProber::new(connector.clone())),
    );
    Cluster {
        pipeline,
        connector,
    }
}

fn two_replicas(config: &mut AppConfig) {
    if let Some(web) = config.services.get_mut("web") {
        web.replicas = 2;
    }
}

#[tokio::test]
async fn test_two_servers_two_replicas() {
    let cluster = cluster(&["h1", "h2"], two_replicas);
    for name in ["h1", "h2"] {
        let host = cluster.host(name);
        host.add_container(FakeContainer::app("shop", "web", "e2e-old", 1, 9000, true));
        host.add_container(FakeContainer::app("shop", "web", "e2e-old", 2, 9001, true));
    }

    let report = cluster
        .pipeline
        .deploy(&DeployOptions::new("e2e-new"))
        .await
        .unwrap();

    assert!(report.success());
    for name in ["h1", "h2"] {
        let host = cluster.host(name);
        let running: Vec<String> = host.running_containers().into_iter().map(|c| c.name).collect();
        assert_eq!(
            running,
            vec!["shop-web-e2e-new-1".to_string(), "shop-web-e2e-new-2".to_string()]
        );
        assert_eq!(host.upstream_ports("shop"), vec![9002, 9003]);
        assert_eq!(host.reloads(), 1);

        let server = report.server(name).unwrap();
        assert_eq!(server.outcome, ServerOutcome::Succeeded);
        assert_eq!(server.cutover_state, Some(CutoverState::Done));
        assert_eq!(server.containers.len(), 2);
        assert!(host
            .file(&state_path("shop"))
            .unwrap()
            .contains("\"version\": \"e2e-new\""));
    }
}

#[tokio::test]
async fn test_first_deploy_on_empty_hosts() {
    let cluster = cluster(&["h1", "h2"], two_replicas);

    let report = cluster
        .pipeline
        .deploy(&DeployOptions::new("fresh"))
        .await
        .unwrap();

    assert!(report.success());
    let mut total = 0;
    for name in ["h1", "h2"] {
        let host = cluster.host(name);
        let containers = host.containers();
        assert!(containers.iter().all(|c| c.is_running()));
        total += containers.len();
        assert_eq!(host.upstream_ports("shop"), vec![9000, 9001]);
        assert_eq!(host.reloads(), 1);
        assert_eq!(host.count_commands("docker stop"), 0);
        assert!(report.server(name).unwrap().succeeded());
    }
    assert_eq!(total, 4);
}

#[tokio::test]
async fn test_parallel_failure_is_isolated() {
    let cluster = cluster(&["a", "b"], |_| {});
    cluster.host("b").fail_copies();

    let mut options = DeployOptions::new("par-1");
    options.parallel = true;
    let report = cluster.pipeline.deploy(&options).await.unwrap();

    assert!(!report.success());
    let a = report.server("a").unwrap();
    assert_eq!(a.outcome, ServerOutcome::Succeeded);
    assert_eq!(a.cutover_state, Some(CutoverState::Done));

    let b = report.server("b").unwrap();
    assert_eq!(b.outcome, ServerOutcome::Failed);
    assert_eq!(b.error_kind, Some("transfer_failed"));
    assert_eq!(b.cutover_state, Some(CutoverState::Idle));
    assert!(cluster.host("b").containers().is_empty());
    assert!(cluster.host("a").container("shop-web-par-1-1").unwrap().is_running());
}

#[tokio::test]
async fn test_other_repository_is_refused() {
    let cluster = cluster(&["h1"], |_| {});
    cluster.host("h1").set_file(
        state_path("shop"),
        r#"{"current": {"version": "x1", "git_repo": "git@github.com:acme/blog.git", "deployed_at": "t"}}"#,
    );

    let mut options = DeployOptions::new("conflict-1");
    options.git_repo = Some("https://github.com/acme/shop".to_string());
    let report = cluster.pipeline.deploy(&options).await.unwrap();

    let server = report.server("h1").unwrap();
    assert_eq!(server.error_kind, Some("service_conflict"));
    assert!(cluster.host("h1").containers().is_empty());
    assert_eq!(cluster.host("h1").count_commands("docker load"), 0);
}

#[tokio::test]
async fn test_hooks_wrap_the_deploy() {
    let cluster = cluster(&["h1"], |config| {
        config.hooks = HooksConfig {
            before_deploy: vec!["bin/migrate".to_string()],
            after_deploy: vec!["bin/notify".to_string()],
            ..HooksConfig::default()
        };
    });

    let report = cluster
        .pipeline
        .deploy(&DeployOptions::new("hook-1"))
        .await
        .unwrap();

    assert!(report.success());
    let commands = cluster.host("h1").commands();
    let migrate = commands.iter().position(|c| c.contains("bin/migrate")).unwrap();
    let run = commands.iter().position(|c| c.contains("docker run")).unwrap();
    let notify = commands.iter().position(|c| c.contains("bin/notify")).unwrap();
    assert!(migrate < run && run < notify);
    assert!(commands[notify].contains("PODLIFT_VERSION=hook-1"));
}

#[tokio::test]
async fn test_failing_before_hook_aborts() {
    let cluster = cluster(&["h1"], |config| {
        config.hooks.before_deploy = vec!["bin/migrate".to_string()];
    });
    cluster.host("h1").fail_on("bin/migrate");

    let err = cluster
        .pipeline
        .deploy(&DeployOptions::new("hook-2"))
        .await
        .unwrap_err();

    assert!(matches!(err, PodliftError::HookFailed(_)));
    assert!(cluster.host("h1").containers().is_empty());
}

#[tokio::test]
async fn test_rollback_after_two_deploys() {
    let cluster = cluster(&["h1"], |_| {});
    for version in ["rb-1", "rb-2"] {
        let report = cluster
            .pipeline
            .deploy(&DeployOptions::new(version))
            .await
            .unwrap();
        assert!(report.success());
    }

    let report = cluster
        .pipeline
        .rollback(&RollbackOptions::default())
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.servers[0].version.as_deref(), Some("rb-1"));
    let host = cluster.host("h1");
    assert!(host.container("shop-web-rb-1-1").unwrap().is_running());
    assert!(!host.container("shop-web-rb-2-1").unwrap().is_running());
    assert_eq!(host.upstream_ports("shop"), vec![9000]);
    assert!(host
        .file(&state_path("shop"))
        .unwrap()
        .contains("\"version\": \"rb-1\""));
}

#[tokio::test]
async fn test_validate_reports_unreachable_hosts() {
    let cluster = cluster(&["h1", "h2"], |_| {});
    cluster.host("h2").set_unreachable(true);

    let reports = cluster.pipeline.validate().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports[0].error.is_none());
    assert!(reports[1].error.as_deref().unwrap().contains("h2"));
    assert!(reports[1].deployed.is_none());
}

#[tokio::test]
async fn test_validate_reports_deployed_version() {
    let cluster = cluster(&["h1"], |_| {});
    let before = cluster.pipeline.validate().await.unwrap();
    assert!(!before[0].deployed.as_ref().unwrap().exists);

    cluster
        .pipeline
        .deploy(&DeployOptions::new("val-1"))
        .await
        .unwrap();
    let after = cluster.pipeline.validate().await.unwrap();

    let live = after[0].deployed.as_ref().unwrap();
    assert!(live.exists);
    assert_eq!(live.version.as_deref(), Some("val-1"));
    assert!(live.deployed_at.is_some());
    assert_eq!(live.containers, vec!["shop-web-val-1-1".to_string()]);
}

#[tokio::test]
async fn test_status_lists_live_and_stopped_generations() {
    let cluster = cluster(&["h1", "h2"], |_| {});
    cluster.host("h2").set_unreachable(true);
    for version in ["st-1", "st-2"] {
        cluster
            .pipeline
            .deploy(&DeployOptions::new(version))
            .await
            .unwrap();
    }

    let live = cluster.pipeline.status(false).await;
    assert_eq!(live[0].version.as_deref(), Some("st-2"));
    assert!(live[0].deployed_at.is_some());
    assert_eq!(live[0].running(), 1);
    assert_eq!(live[0].containers.len(), 1);
    assert!(live[1].error.as_deref().unwrap().contains("h2"));

    let all = cluster.pipeline.status(true).await;
    let states: Vec<(&str, &str)> = all[0]
        .containers
        .iter()
        .map(|c| (c.name.as_str(), c.state.as_str()))
        .collect();
    assert_eq!(
        states,
        vec![("shop-web-st-2-1", "running"), ("shop-web-st-1-1", "exited")]
    );
}

#[tokio::test]
async fn test_logs_read_newest_replica_on_primary() {
    let cluster = cluster(&["h1"], |_| {});
    cluster
        .pipeline
        .deploy(&DeployOptions::new("log-1"))
        .await
        .unwrap();
    let host = cluster.host("h1");
    host.set_logs("shop-web-log-1-1", &["booting", "listening", "GET /"]);

    let lines = Mutex::new(Vec::new());
    let sink = |line: &str| lines.lock().unwrap().push(line.to_string());
    let options = LogsOptions {
        tail: Some(2),
        ..LogsOptions::default()
    };
    let name = cluster.pipeline.logs(&options, &sink).await.unwrap();

    assert_eq!(name, "shop-web-log-1-1");
    assert_eq!(*lines.lock().unwrap(), vec!["listening".to_string(), "GET /".to_string()]);
    assert_eq!(host.count_commands("docker logs --tail 2 shop-web-log-1-1"), 1);

    let options = LogsOptions {
        process: "worker".to_string(),
        follow: true,
        ..LogsOptions::default()
    };
    let err = cluster.pipeline.logs(&options, &sink).await.unwrap_err();
    assert!(matches!(err, PodliftError::TargetNotFound(_)));
}

#[tokio::test]
async fn test_teardown_removes_site_containers_and_state() {
    let cluster = cluster(&["h1", "h2"], |_| {});
    for version in ["td-1", "td-2"] {
        cluster
            .pipeline
            .deploy(&DeployOptions::new(version))
            .await
            .unwrap();
    }

    let dry = cluster
        .pipeline
        .teardown(&TeardownOptions {
            dry_run: true,
            ..TeardownOptions::default()
        })
        .await;
    assert!(dry[0].plan.iter().any(|c| c == "sudo docker rm -f shop-web-td-1-1"));
    assert_eq!(cluster.host("h1").containers().len(), 2);
    assert!(cluster.host("h1").site_enabled("shop"));

    let reports = cluster.pipeline.teardown(&TeardownOptions::default()).await;

    for (report, name) in reports.iter().zip(["h1", "h2"]) {
        assert!(report.succeeded());
        assert_eq!(report.containers.len(), 2);
        let host = cluster.host(name);
        assert!(host.containers().is_empty());
        assert!(!host.site_enabled("shop"));
        assert!(host.file(&site_path("shop")).is_none());
        assert!(host.file(&state_path("shop")).is_none());
        assert_eq!(host.reloads(), 3);
    }
}
