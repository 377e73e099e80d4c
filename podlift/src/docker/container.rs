//! Container command builder
//!
//! Pure functions producing the engine command lines the orchestrator sends to
//! a host, plus parsers for the plain-text answers of the inspect and list
//! commands.

use std::collections::BTreeMap;

use crate::config::{Dependency, ServiceSpec};
use crate::utils::shell_quote;

pub const LABEL_SERVICE: &str = "podlift.service";
pub const LABEL_VERSION: &str = "podlift.version";
pub const LABEL_DEPLOYED_AT: &str = "podlift.deployed_at";
pub const LABEL_CONTAINER_TYPE: &str = "podlift.container_type";
pub const LABEL_DEPENDENCY: &str = "podlift.dependency";
pub const LABEL_PORT: &str = "podlift.port";

const LIST_FORMAT: &str = r#"{{.Names}}\t{{.State}}\t{{.Label "podlift.version"}}\t{{.Label "podlift.port"}}\t{{.Label "podlift.container_type"}}"#;

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Port published on the host
    pub host_port: Option<u16>,
    /// Port inside the container, defaults to `host_port`
    pub container_port: Option<u16>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub command: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// One replica of an application service
    #[allow(clippy::too_many_arguments)]
    pub fn app_replica(
        service: &str,
        process: &str,
        spec: &ServiceSpec,
        image: &str,
        version: &str,
        replica: u32,
        host_port: u16,
        deployed_at: &str,
    ) -> Self {
        let mut container = Self::new(container_name(service, process, version, replica), image);
        container.host_port = Some(host_port);
        container.container_port = Some(spec.port);
        container.env = spec.env.clone();
        container.volumes = spec.volumes.clone();
        container.options = spec.options.clone();
        container
            .options
            .entry("restart".to_string())
            .or_insert_with(|| "unless-stopped".to_string());
        container.command = spec.command.clone();
        container.labels = BTreeMap::from([
            (LABEL_SERVICE.to_string(), service.to_string()),
            (LABEL_VERSION.to_string(), version.to_string()),
            (LABEL_DEPLOYED_AT.to_string(), deployed_at.to_string()),
            (LABEL_CONTAINER_TYPE.to_string(), process.to_string()),
            (LABEL_PORT.to_string(), host_port.to_string()),
        ]);
        container
    }

    /// A dependency container; its version label is the image reference
    pub fn dependency(service: &str, name: &str, dep: &Dependency, deployed_at: &str) -> Self {
        let mut container = Self::new(dependency_container_name(service, name), &dep.image);
        container.host_port = dep.port;
        container.env = dep.env.clone();
        container.volumes = dep.volume.iter().cloned().collect();
        container.options = dep.options.clone();
        container
            .options
            .insert("restart".to_string(), "unless-stopped".to_string());
        container.command = dep.command.clone();
        container.labels = BTreeMap::from([
            (LABEL_SERVICE.to_string(), service.to_string()),
            (LABEL_VERSION.to_string(), dep.image.clone()),
            (LABEL_DEPLOYED_AT.to_string(), deployed_at.to_string()),
            (LABEL_DEPENDENCY.to_string(), name.to_string()),
        ]);
        container
    }
}

/// Name of an application replica, e.g. `shop-web-v1.2.0-1`
pub fn container_name(service: &str, process: &str, version: &str, replica: u32) -> String {
    format!("{}-{}-{}-{}", service, process, version, replica)
}

pub fn dependency_container_name(service: &str, dependency: &str) -> String {
    format!("{}-{}", service, dependency)
}

/// `docker run` command creating and starting the container
pub fn run_command(spec: &ContainerSpec) -> String {
    let mut parts = vec![
        "sudo docker run -d".to_string(),
        format!("--name {}", shell_quote(&spec.name)),
    ];

    if let Some(host_port) = spec.host_port {
        let container_port = spec.container_port.unwrap_or(host_port);
        parts.push(format!("-p {}:{}", host_port, container_port));
    }

    for (key, value) in &spec.env {
        parts.push(format!("-e {}", shell_quote(&format!("{}={}", key, value))));
    }

    for (key, value) in &spec.labels {
        parts.push(format!("--label {}", shell_quote(&format!("{}={}", key, value))));
    }

    for volume in &spec.volumes {
        parts.push(format!("-v {}", shell_quote(volume)));
    }

    for (key, value) in &spec.options {
        if value.is_empty() {
            parts.push(format!("--{}", key));
        } else {
            parts.push(format!("--{}={}", key, shell_quote(value)));
        }
    }

    parts.push(shell_quote(&spec.image));

    if let Some(command) = spec.command.as_deref().filter(|c| !c.trim().is_empty()) {
        parts.push(command.to_string());
    }

    parts.join(" ")
}

pub fn start_command(name: &str) -> String {
    format!("sudo docker start {}", shell_quote(name))
}

pub fn stop_command(name: &str) -> String {
    format!("sudo docker stop {}", shell_quote(name))
}

/// Force-remove, stopping the container first if needed
pub fn remove_command(name: &str) -> String {
    format!("sudo docker rm -f {}", shell_quote(name))
}

/// `docker logs` for one container, optionally limited and followed
pub fn logs_command(name: &str, tail: Option<u32>, follow: bool, since: Option<&str>) -> String {
    let mut parts = vec!["sudo docker logs".to_string()];
    if let Some(tail) = tail {
        parts.push(format!("--tail {}", tail));
    }
    if follow {
        parts.push("-f".to_string());
    }
    if let Some(since) = since.filter(|s| !s.trim().is_empty()) {
        parts.push(format!("--since {}", shell_quote(since)));
    }
    parts.push(shell_quote(name));
    parts.join(" ")
}

pub fn volume_create_command(name: &str) -> String {
    format!("sudo docker volume create {}", shell_quote(name))
}

pub fn load_command(archive: &str) -> String {
    format!("sudo docker load -i {}", shell_quote(archive))
}

pub fn pull_command(image: &str) -> String {
    format!("sudo docker pull {}", shell_quote(image))
}

/// Prints one of `running|exited|dead|created|...`; fails if the container is absent
pub fn inspect_status_command(name: &str) -> String {
    format!(
        "sudo docker inspect --format {} {}",
        shell_quote("{{.State.Status}}"),
        shell_quote(name)
    )
}

/// Prints one of `healthy|unhealthy|starting|none`
pub fn inspect_health_command(name: &str) -> String {
    format!(
        "sudo docker inspect --format {} {}",
        shell_quote("{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}"),
        shell_quote(name)
    )
}

pub fn inspect_label_command(name: &str, label: &str) -> String {
    format!(
        "sudo docker inspect --format {} {}",
        shell_quote(&format!("{{{{index .Config.Labels \"{}\"}}}}", label)),
        shell_quote(name)
    )
}

/// Application containers of a service, newest first, dependencies excluded
pub fn list_app_containers_command(service: &str, include_stopped: bool) -> String {
    format!(
        "sudo docker ps{} --filter {} --filter {} --format {}",
        if include_stopped { " -a" } else { "" },
        shell_quote(&format!("label={}={}", LABEL_SERVICE, service)),
        shell_quote(&format!("label={}", LABEL_CONTAINER_TYPE)),
        shell_quote(LIST_FORMAT)
    )
}

/// Stopped application containers of a service, newest first
pub fn list_stopped_app_containers_command(service: &str) -> String {
    format!(
        "sudo docker ps -a --filter {} --filter {} --filter status=exited --format {}",
        shell_quote(&format!("label={}={}", LABEL_SERVICE, service)),
        shell_quote(&format!("label={}", LABEL_CONTAINER_TYPE)),
        shell_quote(LIST_FORMAT)
    )
}

/// Engine-reported container state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Dead,
    Created,
    Other(String),
}

impl ContainerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => Self::Running,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "created" => Self::Created,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Created => "created",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Stopped for good, as opposed to starting or paused
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

/// Engine-reported health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// No health check defined in the image
    None,
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "starting" => Self::Starting,
            _ => Self::None,
        }
    }
}

/// One row of a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub status: ContainerStatus,
    pub version: String,
    pub port: Option<u16>,
    /// Service process, empty for dependencies
    pub process: String,
}

impl ContainerSummary {
    /// Parse `name\tstatus\tversion[\tport[\tprocess]]` rows, skipping blank lines
    pub fn parse_listing(listing: &str) -> Vec<ContainerSummary> {
        listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let name = fields.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some(ContainerSummary {
                    name: name.to_string(),
                    status: ContainerStatus::parse(fields.next().unwrap_or("")),
                    version: fields.next().unwrap_or("").trim().to_string(),
                    port: fields.next().and_then(|p| p.trim().parse().ok()),
                    process: fields.next().unwrap_or("").trim().to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_is_deterministic_and_quoted() {
        let mut spec = ContainerSpec::new("shop-web-v1-1", "shop:v1");
        spec.host_port = Some(9000);
        spec.container_port = Some(3000);
        spec.env.insert("Z_LAST".to_string(), "1".to_string());
        spec.env.insert("GREETING".to_string(), "it's here".to_string());
        spec.labels.insert(LABEL_SERVICE.to_string(), "shop".to_string());
        spec.volumes.push("data:/data".to_string());
        spec.options.insert("memory".to_string(), "512m".to_string());
        spec.options.insert("init".to_string(), String::new());
        spec.command = Some("bin/server --port 3000".to_string());

        assert_eq!(
            run_command(&spec),
            "sudo docker run -d --name shop-web-v1-1 -p 9000:3000 \
             -e 'GREETING=it'\\''s here' -e Z_LAST=1 \
             --label podlift.service=shop -v data:/data \
             --init --memory=512m shop:v1 bin/server --port 3000"
        );
    }

    #[test]
    fn test_port_defaults_to_host_port() {
        let mut spec = ContainerSpec::new("redis", "redis:7");
        spec.host_port = Some(6379);
        assert!(run_command(&spec).contains("-p 6379:6379"));
        spec.host_port = None;
        assert!(!run_command(&spec).contains("-p "));
    }

    #[test]
    fn test_app_replica_labels() {
        let spec = ServiceSpec::default();
        let c = ContainerSpec::app_replica("shop", "web", &spec, "shop:v2", "v2", 1, 9001, "t0");
        assert_eq!(c.name, "shop-web-v2-1");
        assert_eq!(c.labels[LABEL_VERSION], "v2");
        assert_eq!(c.labels[LABEL_CONTAINER_TYPE], "web");
        assert_eq!(c.labels[LABEL_PORT], "9001");
        assert_eq!(c.container_port, Some(8000));
        assert_eq!(c.options["restart"], "unless-stopped");
    }

    #[test]
    fn test_dependency_spec() {
        let mut dep = Dependency::new("postgres:16");
        dep.port = Some(5432);
        dep.volume = Some("pgdata:/var/lib/postgresql/data".to_string());
        let c = ContainerSpec::dependency("shop", "postgres", &dep, "t0");
        assert_eq!(c.name, "shop-postgres");
        assert_eq!(c.labels[LABEL_DEPENDENCY], "postgres");
        assert!(!c.labels.contains_key(LABEL_CONTAINER_TYPE));
        assert!(run_command(&c).contains("--restart=unless-stopped"));
    }

    #[test]
    fn test_parse_listing() {
        let rows = ContainerSummary::parse_listing(
            "shop-web-v2-1\trunning\tv2\t9000\tweb\nshop-web-v1-1\texited\tv1\t\n\n",
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].port, Some(9000));
        assert_eq!(rows[0].process, "web");
        assert!(rows[0].status.is_running());
        assert_eq!(rows[1].status, ContainerStatus::Exited);
        assert_eq!(rows[1].port, None);
    }

    #[test]
    fn test_status_parsing() {
        assert!(ContainerStatus::parse("dead\n").is_terminal());
        assert_eq!(HealthStatus::parse("starting"), HealthStatus::Starting);
        assert_eq!(HealthStatus::parse(""), HealthStatus::None);
    }

    #[test]
    fn test_logs_command() {
        assert_eq!(
            logs_command("shop-web-v1-1", Some(100), true, Some("10m")),
            "sudo docker logs --tail 100 -f --since 10m shop-web-v1-1"
        );
        assert_eq!(logs_command("shop-web-v1-1", None, false, Some(" ")), "sudo docker logs shop-web-v1-1");
    }
}
