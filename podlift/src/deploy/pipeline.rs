//! Deployment pipeline
//!
//! Build, transfer, dependencies and cutover for every configured server.
//! Local steps (build, push or save) run once and abort everything on failure.
//! Remote steps run per server: a failure stops that server only, and servers
//! already deployed stay deployed.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DeploySettings, Server, ServerWithRole};
use crate::deploy::dependencies::{self, DependencyReport};
use crate::deploy::fsm::{CutoverFsm, CutoverState};
use crate::deploy::hooks::{self, HookStage};
use crate::deploy::state::{self, DeploymentRecord};
use crate::deploy::transfer::{self, TransferPlan};
use crate::deploy::{direct, remove_all, rollback, zero_downtime, DeployContext, PROXIED_PROCESS};
use crate::docker::container::{self, ContainerSummary};
use crate::docker::health::HealthProber;
use crate::docker::image::ImageToolchain;
use crate::errors::PodliftError;
use crate::filesys::file::File;
use crate::proxy::{self, certbot::Certbot, nginx::Nginx};
use crate::remote::{Connector, HostSession, LineSink, ServiceInfo};
use crate::utils::{generate_uuid, shell_quote};

/// Deploy command options
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub version: String,
    /// Repository the version was built from
    pub git_repo: Option<String>,
    /// Docker build context
    pub context_dir: PathBuf,
    pub skip_build: bool,
    pub skip_healthcheck: bool,
    pub parallel: bool,
    pub dry_run: bool,
    pub zero_downtime: bool,
}

impl DeployOptions {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            git_repo: None,
            context_dir: PathBuf::from("."),
            skip_build: false,
            skip_healthcheck: false,
            parallel: false,
            dry_run: false,
            zero_downtime: true,
        }
    }
}

/// Rollback command options
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Version (or part of a container name) to restore
    pub to: Option<String>,
    pub skip_healthcheck: bool,
    pub parallel: bool,
    pub dry_run: bool,
}

/// Logs command options
#[derive(Debug, Clone)]
pub struct LogsOptions {
    /// Process whose newest running replica is read
    pub process: String,
    /// Server to read from (default: the primary)
    pub host: Option<String>,
    pub tail: Option<u32>,
    pub follow: bool,
    /// Only entries newer than this, in any form `docker logs --since` accepts
    pub since: Option<String>,
}

impl Default for LogsOptions {
    fn default() -> Self {
        Self {
            process: PROXIED_PROCESS.to_string(),
            host: None,
            tail: Some(100),
            follow: false,
            since: None,
        }
    }
}

/// Teardown command options
#[derive(Debug, Clone, Default)]
pub struct TeardownOptions {
    pub parallel: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerOutcome {
    Succeeded,
    Failed,
    /// Not attempted because an earlier server failed
    Skipped,
}

/// What happened on one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub host: String,
    pub role: String,
    pub outcome: ServerOutcome,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    /// Version now live on the server
    pub version: Option<String>,
    pub cutover_state: Option<CutoverState>,
    pub history: Vec<CutoverState>,
    pub containers: Vec<String>,
    pub dependencies: Vec<DependencyReport>,
    /// Commands that would have run, in dry-run mode
    pub plan: Vec<String>,
}

impl ServerReport {
    fn new(target: &ServerWithRole, outcome: ServerOutcome) -> Self {
        Self {
            host: target.host().to_string(),
            role: target.role.clone(),
            outcome,
            error: None,
            error_kind: None,
            version: None,
            cutover_state: None,
            history: Vec::new(),
            containers: Vec::new(),
            dependencies: Vec::new(),
            plan: Vec::new(),
        }
    }

    fn failed(mut self, err: &PodliftError) -> Self {
        self.outcome = ServerOutcome::Failed;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == ServerOutcome::Succeeded
    }
}

/// Result of a deploy across all servers
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub version: String,
    pub deployment_id: String,
    pub transfer: String,
    pub servers: Vec<ServerReport>,
    /// Set when the after-deploy hook failed
    pub hook_error: Option<String>,
}

impl DeployReport {
    pub fn success(&self) -> bool {
        self.hook_error.is_none() && self.servers.iter().all(ServerReport::succeeded)
    }

    pub fn server(&self, host: &str) -> Option<&ServerReport> {
        self.servers.iter().find(|s| s.host == host)
    }
}

/// Result of a rollback across all servers
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub servers: Vec<ServerReport>,
    pub hook_error: Option<String>,
}

impl RollbackReport {
    pub fn success(&self) -> bool {
        self.hook_error.is_none() && self.servers.iter().all(ServerReport::succeeded)
    }
}

/// Reachability of one server
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub host: String,
    pub role: String,
    pub error: Option<String>,
    /// What is already deployed there, when the server answered
    pub deployed: Option<ServiceInfo>,
}

/// One application container as listed on a server
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRow {
    pub name: String,
    pub state: String,
    pub version: String,
    pub process: String,
    pub port: Option<u16>,
}

impl From<ContainerSummary> for ContainerRow {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            state: summary.status.as_str().to_string(),
            name: summary.name,
            version: summary.version,
            process: summary.process,
            port: summary.port,
        }
    }
}

/// Deployed state of the service on one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub host: String,
    pub role: String,
    /// Version of the newest running container
    pub version: Option<String>,
    pub deployed_at: Option<String>,
    pub containers: Vec<ContainerRow>,
    pub error: Option<String>,
}

impl ServerStatus {
    pub fn running(&self) -> usize {
        self.containers.iter().filter(|c| c.state == "running").count()
    }
}

/// Per-deploy values shared by every server
struct DeployRun<'a> {
    ctx: DeployContext<'a>,
    plan: &'a TransferPlan,
    options: &'a DeployOptions,
    deployment_id: &'a str,
}

/// Entry point for every operation on the configured servers
pub struct Pipeline {
    config: Arc<AppConfig>,
    settings: DeploySettings,
    connector: Arc<dyn Connector>,
    toolchain: Arc<dyn ImageToolchain>,
    prober: Arc<dyn HealthProber>,
}

impl Pipeline {
    pub fn new(
        config: Arc<AppConfig>,
        settings: DeploySettings,
        connector: Arc<dyn Connector>,
        toolchain: Arc<dyn ImageToolchain>,
        prober: Arc<dyn HealthProber>,
    ) -> Self {
        Self {
            config,
            settings,
            connector,
            toolchain,
            prober,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Servers in traversal order, each host once
    pub fn targets(&self) -> Vec<ServerWithRole> {
        let mut targets: Vec<ServerWithRole> = Vec::new();
        for target in self.config.servers.all_servers() {
            if !targets.iter().any(|t| t.host() == target.host()) {
                targets.push(target);
            }
        }
        targets
    }

    /// Build, ship and cut over `options.version` on every server
    pub async fn deploy(&self, options: &DeployOptions) -> Result<DeployReport, PodliftError> {
        if options.version.trim().is_empty() {
            return Err(PodliftError::ConfigurationInvalid(
                "version must not be empty".to_string(),
            ));
        }

        let image_ref = self.config.image_ref(&options.version);
        let deployed_at = Utc::now().to_rfc3339();
        let deployment_id = generate_uuid();
        let targets = self.targets();
        info!(
            service = %self.config.service,
            version = %options.version,
            servers = targets.len(),
            dry_run = options.dry_run,
            "deploying"
        );

        if options.skip_build || options.dry_run {
            info!(image = %image_ref, "skipping build");
        } else {
            info!(image = %image_ref, "building image");
            self.toolchain.build(&image_ref, &options.context_dir).await?;
        }

        let plan = transfer::prepare(
            &self.config,
            self.toolchain.as_ref(),
            &image_ref,
            &options.version,
            options.dry_run,
        )
        .await?;

        self.run_primary_hooks(HookStage::BeforeDeploy, &options.version, options.dry_run)
            .await?;

        let run = DeployRun {
            ctx: DeployContext {
                config: &self.config,
                settings: &self.settings,
                prober: self.prober.as_ref(),
                version: &options.version,
                image_ref: &image_ref,
                deployed_at: &deployed_at,
                skip_healthcheck: options.skip_healthcheck,
            },
            plan: &plan,
            options,
            deployment_id: &deployment_id,
        };
        let servers =
            for_each_target(&targets, options.parallel, |target| self.deploy_server(&run, target))
                .await;

        let mut report = DeployReport {
            version: options.version.clone(),
            deployment_id: deployment_id.clone(),
            transfer: plan.describe(),
            servers,
            hook_error: None,
        };

        if report.servers.iter().all(ServerReport::succeeded) {
            if let Err(e) = self
                .run_primary_hooks(HookStage::AfterDeploy, &options.version, options.dry_run)
                .await
            {
                error!("{}", e);
                report.hook_error = Some(e.to_string());
            }
        }

        if let TransferPlan::Archive { archive, .. } = &plan {
            if !options.dry_run {
                if let Err(e) = File::new(archive).delete().await {
                    warn!(archive = %archive.display(), "failed to delete image archive: {}", e);
                }
            }
        }

        info!(
            service = %self.config.service,
            version = %options.version,
            success = report.success(),
            "deploy finished"
        );
        Ok(report)
    }

    async fn deploy_server(&self, run: &DeployRun<'_>, target: &ServerWithRole) -> ServerReport {
        let mut report = ServerReport::new(target, ServerOutcome::Succeeded);
        let session = match self.open_session(&target.server, run.options.dry_run).await {
            Ok(session) => session,
            Err(e) => {
                error!(host = %target.host(), "{}", e);
                return report.failed(&e);
            }
        };

        let mut fsm = CutoverFsm::new();
        let result = self
            .deploy_on(run, target, &session, &mut fsm, &mut report)
            .await;
        if run.options.zero_downtime {
            report.cutover_state = Some(fsm.state().clone());
            report.history = fsm.history().to_vec();
        }
        report.plan = session.plan().await;

        match result {
            Ok(()) => {
                report.version = Some(run.options.version.clone());
                report
            }
            Err(e) => {
                error!(host = %target.host(), kind = e.kind(), "deploy failed: {}", e);
                report.failed(&e)
            }
        }
    }

    async fn deploy_on(
        &self,
        run: &DeployRun<'_>,
        target: &ServerWithRole,
        session: &HostSession,
        fsm: &mut CutoverFsm,
        report: &mut ServerReport,
    ) -> Result<(), PodliftError> {
        let config = run.ctx.config;
        let service = &config.service;
        session.executor().test_connectivity().await?;

        let mut remote_state = state::load(session, service).await?;
        state::check_conflict(
            &remote_state,
            service,
            target.host(),
            run.options.git_repo.as_deref(),
        )?;

        transfer::deliver(run.plan, config, session, run.ctx.image_ref).await?;

        report.dependencies =
            dependencies::ensure_all(config, &self.settings, session, run.ctx.deployed_at).await?;

        let summary = if run.options.zero_downtime {
            zero_downtime::run(&run.ctx, session, &target.server, fsm).await?
        } else {
            direct::run(&run.ctx, session, &target.server).await?
        };
        report.containers = summary.incoming.iter().map(|r| r.name.clone()).collect();
        if !summary.cleanup_failures.is_empty() {
            warn!(
                host = %target.host(),
                containers = ?summary.cleanup_failures,
                "outgoing containers could not be stopped"
            );
        }

        remote_state.advance(DeploymentRecord {
            version: run.options.version.clone(),
            git_repo: run.options.git_repo.clone(),
            deployed_at: run.ctx.deployed_at.to_string(),
            deployment_id: run.deployment_id.to_string(),
        });
        if let Err(e) = state::save(session, service, &remote_state).await {
            warn!(host = %target.host(), "failed to record deployment state: {}", e);
        }
        Ok(())
    }

    /// Restart a stopped generation on every server
    pub async fn rollback(&self, options: &RollbackOptions) -> Result<RollbackReport, PodliftError> {
        let targets = self.targets();
        info!(
            service = %self.config.service,
            to = ?options.to,
            servers = targets.len(),
            "rolling back"
        );

        let servers = for_each_target(&targets, options.parallel, |target| {
            self.rollback_server(options, target)
        })
        .await;

        let mut report = RollbackReport {
            servers,
            hook_error: None,
        };
        if report.servers.iter().all(ServerReport::succeeded) {
            let version = report
                .servers
                .iter()
                .find_map(|s| s.version.clone())
                .unwrap_or_default();
            if let Err(e) = self
                .run_primary_hooks(HookStage::AfterRollback, &version, options.dry_run)
                .await
            {
                error!("{}", e);
                report.hook_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    async fn rollback_server(
        &self,
        options: &RollbackOptions,
        target: &ServerWithRole,
    ) -> ServerReport {
        let mut report = ServerReport::new(target, ServerOutcome::Succeeded);
        let session = match self.open_session(&target.server, options.dry_run).await {
            Ok(session) => session,
            Err(e) => return report.failed(&e),
        };

        let result = rollback::run(
            &self.config,
            &self.settings,
            self.prober.as_ref(),
            &session,
            &target.server,
            options.to.as_deref(),
            options.skip_healthcheck || options.dry_run,
        )
        .await;

        report.plan = session.plan().await;
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                error!(host = %target.host(), "rollback failed: {}", e);
                return report.failed(&e);
            }
        };

        report.version = Some(summary.version.clone());
        report.containers = summary.restored.iter().map(|r| r.name.clone()).collect();

        match state::load(&session, &self.config.service).await {
            Ok(mut remote_state) => {
                let git_repo = remote_state
                    .current
                    .as_ref()
                    .and_then(|c| c.git_repo.clone());
                remote_state.advance(DeploymentRecord {
                    version: summary.version,
                    git_repo,
                    deployed_at: Utc::now().to_rfc3339(),
                    deployment_id: generate_uuid(),
                });
                if let Err(e) = state::save(&session, &self.config.service, &remote_state).await {
                    warn!(host = %target.host(), "failed to record rollback state: {}", e);
                }
            }
            Err(e) => warn!(host = %target.host(), "failed to read deployment state: {}", e),
        }
        report.plan = session.plan().await;
        report
    }

    /// Validate the configuration and reach every server
    pub async fn validate(&self) -> Result<Vec<ConnectivityReport>, PodliftError> {
        self.config.validate()?;
        let targets = self.targets();
        let service = self.config.service.as_str();
        let checks = targets.iter().map(|target| async move {
            let mut report = ConnectivityReport {
                host: target.host().to_string(),
                role: target.role.clone(),
                error: None,
                deployed: None,
            };
            let executor = match self.connector.connect(&target.server).await {
                Ok(executor) => executor,
                Err(e) => {
                    report.error = Some(e.to_string());
                    return report;
                }
            };
            if let Err(e) = executor.test_connectivity().await {
                report.error = Some(e.to_string());
                return report;
            }
            match executor.inspect_existing_service(service).await {
                Ok(info) => report.deployed = Some(info),
                Err(e) => warn!(host = %target.host(), "could not inspect deployed service: {}", e),
            }
            report
        });
        Ok(join_all(checks).await)
    }

    /// Application containers and live version on every server
    pub async fn status(&self, include_stopped: bool) -> Vec<ServerStatus> {
        let targets = self.targets();
        let checks = targets.iter().map(|target| async move {
            let mut status = ServerStatus {
                host: target.host().to_string(),
                role: target.role.clone(),
                version: None,
                deployed_at: None,
                containers: Vec::new(),
                error: None,
            };
            match self.status_on(&target.server, include_stopped).await {
                Ok((info, containers)) => {
                    status.version = info.version;
                    status.deployed_at = info.deployed_at;
                    status.containers = containers;
                }
                Err(e) => status.error = Some(e.to_string()),
            }
            status
        });
        join_all(checks).await
    }

    async fn status_on(
        &self,
        server: &Server,
        include_stopped: bool,
    ) -> Result<(ServiceInfo, Vec<ContainerRow>), PodliftError> {
        let session = self.open_session(server, false).await?;
        let service = &self.config.service;
        let info = session.executor().inspect_existing_service(service).await?;
        let listing = session
            .inspect(&container::list_app_containers_command(service, include_stopped))
            .await?;
        let rows = ContainerSummary::parse_listing(&listing)
            .into_iter()
            .map(ContainerRow::from)
            .collect();
        Ok((info, rows))
    }

    /// Forward the logs of the newest running replica of `options.process`
    ///
    /// Returns the container read. Following ends when the container stops or
    /// the long command limit is reached.
    pub async fn logs(
        &self,
        options: &LogsOptions,
        sink: LineSink<'_>,
    ) -> Result<String, PodliftError> {
        let server = match &options.host {
            Some(host) => self
                .targets()
                .into_iter()
                .find(|t| t.host() == host.as_str())
                .map(|t| t.server)
                .ok_or_else(|| PodliftError::TargetNotFound(format!("no server {}", host)))?,
            None => self.config.servers.primary()?.server,
        };
        let session = self.open_session(&server, false).await?;
        let listing = session
            .inspect(&container::list_app_containers_command(&self.config.service, false))
            .await?;
        let name = ContainerSummary::parse_listing(&listing)
            .into_iter()
            .find(|c| c.process == options.process)
            .map(|c| c.name)
            .ok_or_else(|| {
                PodliftError::TargetNotFound(format!(
                    "no running {} container of {} on {}",
                    options.process, self.config.service, server.host
                ))
            })?;

        info!(host = %server.host, container = %name, follow = options.follow, "reading logs");
        let command = container::logs_command(
            &name,
            options.tail,
            options.follow,
            options.since.as_deref(),
        );
        session.stream(&command, sink, sink).await?;
        Ok(name)
    }

    /// Remove the service's proxy site and every application container
    ///
    /// Dependencies and their volumes are left in place.
    pub async fn teardown(&self, options: &TeardownOptions) -> Vec<ServerReport> {
        let targets = self.targets();
        for_each_target(&targets, options.parallel, |target| async move {
            let mut report = ServerReport::new(target, ServerOutcome::Succeeded);
            let session = match self.open_session(&target.server, options.dry_run).await {
                Ok(session) => session,
                Err(e) => return report.failed(&e),
            };
            let result = self.teardown_on(&session).await;
            report.plan = session.plan().await;
            match result {
                Ok(removed) => {
                    report.containers = removed;
                    report
                }
                Err(e) => report.failed(&e),
            }
        })
        .await
    }

    async fn teardown_on(&self, session: &HostSession) -> Result<Vec<String>, PodliftError> {
        let service = &self.config.service;
        let nginx = Nginx::new(session);
        if nginx.is_installed().await? && nginx.site_exists(service).await? {
            nginx.remove_site(service).await?;
            info!(host = %session.host(), service = %service, "proxy site removed");
        }

        let listing = session
            .inspect(&container::list_app_containers_command(service, true))
            .await?;
        let names: Vec<String> = ContainerSummary::parse_listing(&listing)
            .into_iter()
            .map(|c| c.name)
            .collect();
        let failures = remove_all(session, &names).await;
        if let Some(first) = failures.first() {
            return Err(PodliftError::CommandFailed {
                host: session.host().to_string(),
                command: container::remove_command(first),
                stderr: format!("{} of {} containers not removed", failures.len(), names.len()),
            });
        }
        session
            .mutate(&format!("sudo rm -f {}", shell_quote(&state::state_path(service))))
            .await?;
        info!(host = %session.host(), containers = names.len(), "service torn down");
        Ok(names)
    }

    /// Request certificates for the configured domain on every server
    pub async fn obtain_certificates(&self) -> Result<Vec<ServerReport>, PodliftError> {
        let email = self
            .config
            .proxy
            .ssl_email
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                PodliftError::ConfigurationInvalid("proxy.ssl_email is required".to_string())
            })?;

        let targets = self.targets();
        let email = email.as_str();
        Ok(for_each_target(&targets, false, |target| async move {
            let report = ServerReport::new(target, ServerOutcome::Succeeded);
            match self.obtain_on(&target.server, email).await {
                Ok(()) => report,
                Err(e) => report.failed(&e),
            }
        })
        .await)
    }

    async fn obtain_on(&self, server: &Server, email: &str) -> Result<(), PodliftError> {
        let session = self.open_session(server, false).await?;
        let certbot = Certbot::new(&session);
        certbot.install().await?;
        let domain = self.config.domain_for(server);
        if certbot.certificate_exists(&domain).await? {
            info!(host = %server.host, domain = %domain, "certificate already present");
            return Ok(());
        }
        let nginx = Nginx::new(&session);
        nginx.install().await?;
        proxy::prepare_challenge_site(&nginx, &self.config.service, &domain).await?;
        certbot.obtain(&domain, email).await?;
        Ok(())
    }

    /// Renew every certificate on every server
    pub async fn renew_certificates(&self) -> Result<Vec<ServerReport>, PodliftError> {
        let targets = self.targets();
        Ok(for_each_target(&targets, false, |target| async move {
            let report = ServerReport::new(target, ServerOutcome::Succeeded);
            let result = match self.open_session(&target.server, false).await {
                Ok(session) => Certbot::new(&session).renew_all().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report,
                Err(e) => report.failed(&e),
            }
        })
        .await)
    }

    async fn open_session(&self, server: &Server, dry_run: bool) -> Result<HostSession, PodliftError> {
        let executor = self.connector.connect(server).await?;
        Ok(HostSession::new(executor, dry_run))
    }

    async fn run_primary_hooks(
        &self,
        stage: HookStage,
        version: &str,
        dry_run: bool,
    ) -> Result<(), PodliftError> {
        if stage.commands(&self.config.hooks).is_empty() {
            return Ok(());
        }
        let primary = self.config.servers.primary()?;
        let session = self
            .open_session(&primary.server, dry_run)
            .await
            .map_err(|e| PodliftError::HookFailed(format!("{}: {}", stage, e)))?;
        hooks::run_hooks(
            &session,
            stage,
            &self.config.hooks,
            &self.config.service,
            version,
        )
        .await
    }
}

/// Run `f` for every target, concurrently or one after another
///
/// Sequential runs stop at the first server that does not succeed; the rest
/// are reported as skipped.
async fn for_each_target<'a, F, Fut>(
    targets: &'a [ServerWithRole],
    parallel: bool,
    f: F,
) -> Vec<ServerReport>
where
    F: Fn(&'a ServerWithRole) -> Fut,
    Fut: Future<Output = ServerReport>,
{
    if parallel {
        return join_all(targets.iter().map(&f)).await;
    }

    let mut reports: Vec<ServerReport> = Vec::with_capacity(targets.len());
    for target in targets {
        if reports.iter().any(|r| !r.succeeded()) {
            reports.push(ServerReport::new(target, ServerOutcome::Skipped));
            continue;
        }
        reports.push(f(target).await);
    }
    reports
}
