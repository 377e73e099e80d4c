//! Podlift - Entry Point
//!
//! Deploys a containerised application to plain servers over SSH.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use podlift::config::{AppConfig, DeploySettings, Substitutions, CONFIG_FILE_NAME};
use podlift::deploy::pipeline::{
    DeployOptions, DeployReport, LogsOptions, Pipeline, RollbackOptions, ServerOutcome,
    ServerReport, ServerStatus, TeardownOptions,
};
use podlift::docker::health::HttpProber;
use podlift::docker::image::DockerCli;
use podlift::filesys::file::File;
use podlift::git::GitInfo;
use podlift::logs::{init_logging, LogLevel, LogOptions};
use podlift::remote::ssh::SshConnector;
use podlift::remote::CommandTimeouts;
use podlift::utils::version_info;

#[derive(Parser, Debug)]
#[command(name = "podlift", about = "Zero-downtime container deployments over SSH")]
struct Cli {
    /// Configuration file (default: podlift.json in this or a parent directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write daily-rolling log files here
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and deploy the current commit to every server
    Deploy {
        /// Deploy this version instead of the one derived from git
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        skip_build: bool,
        #[arg(long)]
        skip_healthcheck: bool,
        /// Deploy to all servers at once
        #[arg(long)]
        parallel: bool,
        /// Print the commands instead of running them
        #[arg(long)]
        dry_run: bool,
        /// Stage the new version on temporary ports before switching traffic
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        zero_downtime: bool,
    },
    /// Restart a previous version
    Rollback {
        /// Version to restore (default: the most recent stopped one)
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        skip_healthcheck: bool,
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Check the configuration and reach every server
    Validate,
    /// Show the deployed version and containers on every server
    #[command(alias = "ps")]
    Status {
        /// Include stopped containers
        #[arg(short, long)]
        all: bool,
    },
    /// Print the logs of the newest running replica
    Logs {
        /// Process to read
        #[arg(default_value = "web")]
        process: String,
        /// Server to read from (default: the primary)
        #[arg(long)]
        host: Option<String>,
        #[arg(short = 'n', long, default_value_t = 100)]
        tail: u32,
        #[arg(short, long)]
        follow: bool,
        /// Only entries newer than this, e.g. 10m or a timestamp
        #[arg(long)]
        since: Option<String>,
    },
    /// Remove the service's proxy site and containers from every server
    Teardown {
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage TLS certificates
    Ssl {
        #[command(subcommand)]
        action: SslAction,
    },
    /// Print version information
    Version,
}

#[derive(Subcommand, Debug)]
enum SslAction {
    /// Obtain certificates for the configured domain
    Obtain,
    /// Renew every certificate
    Renew,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    if let Command::Version = cli.command {
        println!("{}", serde_json::to_string_pretty(&version_info())?);
        return Ok(true);
    }

    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let config_file = match &cli.config {
        Some(path) => File::new(path),
        None => File::find_upward(&cwd, CONFIG_FILE_NAME)
            .ok_or_else(|| anyhow!("{} not found; create one first", CONFIG_FILE_NAME))?,
    };
    let project_dir = config_file
        .path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    let mut config = AppConfig::load(&config_file).await?;
    config.substitute(&substitutions(&project_dir).await)?;

    let _guard = init_logging(LogOptions {
        log_level: cli.log_level.clone().unwrap_or_else(|| config.log_level.clone()),
        json_format: cli.json_logs,
        log_dir: cli.log_dir.clone(),
        ..Default::default()
    })?;
    info!(config = %config_file.path().display(), service = %config.service, "configuration loaded");

    let settings = DeploySettings::default();
    let pipeline = Pipeline::new(
        Arc::new(config),
        settings.clone(),
        Arc::new(SshConnector::new(
            settings.connect_timeout,
            CommandTimeouts {
                command: settings.command_timeout,
                long: settings.long_command_timeout,
            },
        )),
        Arc::new(DockerCli::new()),
        Arc::new(HttpProber::new()?),
    );

    match cli.command {
        Command::Deploy {
            tag,
            skip_build,
            skip_healthcheck,
            parallel,
            dry_run,
            zero_downtime,
        } => {
            let (version, git_repo) = resolve_version(&pipeline, &project_dir, tag, dry_run).await?;
            let options = DeployOptions {
                version,
                git_repo,
                context_dir: project_dir,
                skip_build,
                skip_healthcheck,
                parallel,
                dry_run,
                zero_downtime,
            };
            let report = pipeline.deploy(&options).await?;
            print_deploy(&report, dry_run);
            Ok(report.success())
        }
        Command::Rollback {
            to,
            skip_healthcheck,
            parallel,
            dry_run,
        } => {
            let report = pipeline
                .rollback(&RollbackOptions {
                    to,
                    skip_healthcheck,
                    parallel,
                    dry_run,
                })
                .await?;
            print_servers(&report.servers, dry_run);
            if let Some(hook) = &report.hook_error {
                println!("{} {}", "hook failed:".red(), hook);
            }
            Ok(report.success())
        }
        Command::Validate => {
            let reports = pipeline.validate().await?;
            println!("{}", "configuration valid".green());
            let mut ok = true;
            for report in &reports {
                match &report.error {
                    None => println!("  {} {} ({})", "✓".green(), report.host, report.role),
                    Some(e) => {
                        ok = false;
                        println!("  {} {} ({}): {}", "✗".red(), report.host, report.role, e);
                    }
                }
                match &report.deployed {
                    Some(info) if info.exists => println!(
                        "      {} {} deployed {}",
                        "redeployment:".yellow(),
                        info.version.as_deref().unwrap_or("unknown"),
                        info.deployed_at.as_deref().unwrap_or("at an unknown time")
                    ),
                    Some(_) => println!("      {}", "new deployment".dimmed()),
                    None => {}
                }
            }
            Ok(ok)
        }
        Command::Status { all } => {
            let statuses = pipeline.status(all).await;
            print_status(&statuses);
            Ok(statuses.iter().all(|s| s.error.is_none()))
        }
        Command::Logs {
            process,
            host,
            tail,
            follow,
            since,
        } => {
            let options = LogsOptions {
                process,
                host,
                tail: Some(tail),
                follow,
                since,
            };
            let print = |line: &str| println!("{}", line);
            pipeline.logs(&options, &print).await?;
            Ok(true)
        }
        Command::Teardown { parallel, dry_run } => {
            let reports = pipeline
                .teardown(&TeardownOptions { parallel, dry_run })
                .await;
            print_servers(&reports, dry_run);
            Ok(reports.iter().all(ServerReport::succeeded))
        }
        Command::Ssl { action } => {
            let reports = match action {
                SslAction::Obtain => pipeline.obtain_certificates().await?,
                SslAction::Renew => pipeline.renew_certificates().await?,
            };
            print_servers(&reports, false);
            Ok(reports.iter().all(ServerReport::succeeded))
        }
        Command::Version => Ok(true),
    }
}

/// Variables for `${NAME}` references: process environment, then `.env`
async fn substitutions(project_dir: &Path) -> Substitutions {
    let mut vars = Substitutions::from_process_env();
    let dotenv = File::new(project_dir.join(".env"));
    if dotenv.exists().await {
        match dotenv.read_string().await {
            Ok(contents) => vars.merge_dotenv(&contents),
            Err(e) => warn!("failed to read .env: {}", e),
        }
    }
    vars
}

/// Version to deploy and the repository it comes from
async fn resolve_version(
    pipeline: &Pipeline,
    project_dir: &Path,
    tag: Option<String>,
    dry_run: bool,
) -> anyhow::Result<(String, Option<String>)> {
    let configured_repo = pipeline.config().git.as_ref().and_then(|g| g.repo.clone());
    let git = GitInfo::inspect(project_dir).await;

    let (version, remote_url) = match (tag, git) {
        (Some(tag), git) => (tag, git.ok().and_then(|g| g.remote_url)),
        (None, Ok(git)) => {
            if !git.clean && !dry_run {
                bail!("working tree has uncommitted changes; commit them or pass --tag");
            }
            (git.version(), git.remote_url.clone())
        }
        (None, Err(e)) => bail!("{}; pass --tag to deploy without git", e),
    };
    Ok((version, configured_repo.or(remote_url)))
}

fn print_deploy(report: &DeployReport, dry_run: bool) {
    println!(
        "{} {} ({})",
        "deploying".bold(),
        report.version.cyan(),
        report.transfer
    );
    print_servers(&report.servers, dry_run);
    if let Some(hook) = &report.hook_error {
        println!("{} {}", "hook failed:".red(), hook);
    }
    if report.success() {
        println!("{}", "deploy succeeded".green().bold());
    } else {
        println!("{}", "deploy failed".red().bold());
    }
}

fn print_servers(servers: &[ServerReport], dry_run: bool) {
    for server in servers {
        let mark = match server.outcome {
            ServerOutcome::Succeeded => "✓".green(),
            ServerOutcome::Failed => "✗".red(),
            ServerOutcome::Skipped => "-".yellow(),
        };
        println!("{} {} ({})", mark, server.host.bold(), server.role);
        for container in &server.containers {
            println!("    {}", container);
        }
        for dep in &server.dependencies {
            println!("    {}: {}", dep.name, dep.outcome);
        }
        if let Some(error) = &server.error {
            println!("    {}", error.red());
        }
        if dry_run {
            for command in &server.plan {
                println!("    $ {}", command.dimmed());
            }
        }
    }
}

fn print_status(statuses: &[ServerStatus]) {
    for status in statuses {
        if let Some(error) = &status.error {
            println!("{} {} ({}): {}", "✗".red(), status.host.bold(), status.role, error.red());
            continue;
        }
        let version = status.version.as_deref().unwrap_or("not deployed");
        println!(
            "{} {} ({}) {} [{}/{} running]",
            "✓".green(),
            status.host.bold(),
            status.role,
            version.cyan(),
            status.running(),
            status.containers.len()
        );
        if let Some(at) = &status.deployed_at {
            println!("    deployed {}", at.dimmed());
        }
        for container in &status.containers {
            let port = container
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<32} {:<8} {:<12} {}",
                container.name, container.state, container.version, port
            );
        }
    }
}
