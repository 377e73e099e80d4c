//! In-memory hosts
//!
//! [`FakeHost`] interprets the commands the engine emits against a simulated
//! container engine, nginx, certbot and file system, so deployments can be
//! asserted on observable host state. [`FakeConnector`], [`FakeProber`] and
//! [`FakeToolchain`] complete the set of ports needed to run a pipeline
//! without a network.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::{RegistryConfig, Server};
use crate::docker::container::{LABEL_CONTAINER_TYPE, LABEL_PORT, LABEL_SERVICE, LABEL_VERSION};
use crate::docker::health::{HealthProber, ProbeRequest};
use crate::docker::image::ImageToolchain;
use crate::errors::PodliftError;
use crate::proxy::certbot::certificate_paths;
use crate::proxy::nginx::{site_path, SITES_ENABLED};
use crate::remote::{
    bounded, CommandOutput, CommandTimeouts, Connector, LineSink, ProgressFn, RemoteExecutor,
    HEREDOC_MARKER,
};
use crate::utils::sha256_hash;

/// A simulated container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub name: String,
    pub image: String,
    /// `running`, `exited`, ...
    pub status: String,
    /// `healthy`, `unhealthy`, `starting` or `none`
    pub health: String,
    pub labels: BTreeMap<String, String>,
    pub host_port: Option<u16>,
    pub env: BTreeMap<String, String>,
}

impl FakeContainer {
    /// An application replica as the engine would have created it
    pub fn app(
        service: &str,
        process: &str,
        version: &str,
        replica: u32,
        host_port: u16,
        running: bool,
    ) -> Self {
        Self {
            name: crate::docker::container::container_name(service, process, version, replica),
            image: format!("{}:{}", service, version),
            status: if running { "running" } else { "exited" }.to_string(),
            health: "none".to_string(),
            labels: BTreeMap::from([
                (LABEL_SERVICE.to_string(), service.to_string()),
                (LABEL_VERSION.to_string(), version.to_string()),
                (LABEL_CONTAINER_TYPE.to_string(), process.to_string()),
                (LABEL_PORT.to_string(), host_port.to_string()),
            ]),
            host_port: Some(host_port),
            env: BTreeMap::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

#[derive(Debug, Default)]
struct HostState {
    containers: Vec<FakeContainer>,
    volumes: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    enabled_sites: BTreeSet<String>,
    packages: BTreeSet<String>,
    images: BTreeSet<String>,
    reloads: u32,
    commands: Vec<String>,
    fail_patterns: Vec<String>,
    hang_patterns: Vec<String>,
    timeouts: CommandTimeouts,
    container_logs: BTreeMap<String, Vec<String>>,
    fail_copies: bool,
    unreachable: bool,
    engine_health: HashMap<String, String>,
    exiting_images: HashSet<String>,
    http_unhealthy_images: HashSet<String>,
}

/// A simulated server
#[derive(Debug, Clone)]
pub struct FakeHost {
    host: String,
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every command containing `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state().fail_patterns.push(pattern.into());
    }

    /// Never answer commands containing `pattern`
    pub fn hang_on(&self, pattern: impl Into<String>) {
        self.state().hang_patterns.push(pattern.into());
    }

    pub fn set_timeouts(&self, timeouts: CommandTimeouts) {
        self.state().timeouts = timeouts;
    }

    /// Output `docker logs` prints for a container
    pub fn set_logs(&self, container: impl Into<String>, lines: &[&str]) {
        self.state().container_logs.insert(
            container.into(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_patterns.clear();
        state.fail_copies = false;
    }

    pub fn fail_copies(&self) {
        self.state().fail_copies = true;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Engine health reported for containers created from `image`
    pub fn set_engine_health(&self, image: impl Into<String>, health: impl Into<String>) {
        self.state()
            .engine_health
            .insert(image.into(), health.into());
    }

    /// Containers from `image` exit right after starting
    pub fn exit_on_start(&self, image: impl Into<String>) {
        self.state().exiting_images.insert(image.into());
    }

    /// HTTP endpoints served by `image` answer 503
    pub fn set_http_unhealthy(&self, image: impl Into<String>) {
        self.state().http_unhealthy_images.insert(image.into());
    }

    pub fn install_nginx(&self) {
        self.state().packages.insert("nginx".to_string());
    }

    pub fn add_container(&self, container: FakeContainer) {
        self.state().containers.push(container);
    }

    pub fn set_file(&self, path: impl Into<String>, contents: impl Into<String>) {
        self.state()
            .files
            .insert(path.into(), contents.into().into_bytes());
    }

    /// All containers in creation order
    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.clone()
    }

    pub fn running_containers(&self) -> Vec<FakeContainer> {
        self.containers()
            .into_iter()
            .filter(|c| c.is_running())
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.iter().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    pub fn images(&self) -> Vec<String> {
        self.state().images.iter().cloned().collect()
    }

    pub fn reloads(&self) -> u32 {
        self.state().reloads
    }

    pub fn site_enabled(&self, service: &str) -> bool {
        self.state().enabled_sites.contains(service)
    }

    /// Backend ports listed in a service's nginx site, in file order
    pub fn upstream_ports(&self, service: &str) -> Vec<u16> {
        let Some(config) = self.file(&site_path(service)) else {
            return Vec::new();
        };
        config
            .lines()
            .filter_map(|line| {
                let rest = line.trim().strip_prefix("server ")?;
                let addr = rest.split(';').next()?;
                let (_, port) = addr.rsplit_once(':')?;
                port.trim().parse().ok()
            })
            .collect()
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count_commands(&self, pattern: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Status an HTTP probe of `port` would see
    pub fn http_status(&self, port: u16) -> Option<u16> {
        let state = self.state();
        let container = state
            .containers
            .iter()
            .find(|c| c.is_running() && c.host_port == Some(port))?;
        if state.http_unhealthy_images.contains(&container.image) {
            Some(503)
        } else {
            Some(200)
        }
    }

    async fn respond(&self, command: &str, limit: Duration) -> Result<CommandOutput, PodliftError> {
        let hangs = {
            let mut state = self.state();
            if state.unreachable {
                return Err(PodliftError::ConnectivityFailed {
                    host: self.host.clone(),
                    reason: "host unreachable".to_string(),
                });
            }
            let hangs = matches_any(&state.hang_patterns, command);
            if hangs {
                state.commands.push(command.to_string());
            }
            hangs
        };
        bounded(&self.host, command, limit, async {
            if hangs {
                std::future::pending::<()>().await;
            }
            Ok::<_, PodliftError>(self.handle(command))
        })
        .await
    }

    fn handle(&self, command: &str) -> CommandOutput {
        let mut state = self.state();
        state.commands.push(command.to_string());

        if let Some(pattern) = state
            .fail_patterns
            .iter()
            .find(|p| command.contains(p.as_str()))
        {
            return CommandOutput::failed(1, format!("simulated failure matching '{}'", pattern));
        }

        if let Some((header, body)) = command.split_once('\n') {
            if header.contains(&format!("<<'{}'", HEREDOC_MARKER)) {
                return write_heredoc(&mut state, header, body);
            }
        }

        let mut stdout = String::new();
        for segment in command.split(" && ") {
            let segment = segment.rsplit(" | ").next().unwrap_or(segment);
            let output = run_segment(&mut state, segment);
            if !output.success() {
                return output;
            }
            stdout.push_str(&output.stdout);
        }
        CommandOutput::ok(stdout)
    }
}

fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| text.contains(p.as_str()))
}

fn write_heredoc(state: &mut HostState, header: &str, body: &str) -> CommandOutput {
    let tokens = tokenize(header);
    let Some(path) = tokens
        .iter()
        .position(|t| t == "tee")
        .and_then(|i| tokens.get(i + 1))
    else {
        return CommandOutput::failed(1, "tee: missing operand");
    };
    let contents = body.strip_suffix(HEREDOC_MARKER).unwrap_or(body);
    state
        .files
        .insert(path.clone(), contents.as_bytes().to_vec());
    CommandOutput::ok("")
}

fn run_segment(state: &mut HostState, segment: &str) -> CommandOutput {
    let mut tokens = tokenize(segment);
    if tokens.first().map(String::as_str) == Some("sudo") {
        tokens.remove(0);
    }
    let args: Vec<&str> = tokens.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["docker", rest @ ..] => docker(state, rest),
        ["which", program] => {
            if state.packages.contains(*program) {
                CommandOutput::ok(format!("/usr/bin/{}\n", program))
            } else {
                CommandOutput::failed(1, "")
            }
        }
        ["apt-get", rest @ ..] => {
            if let Some(i) = rest.iter().position(|a| *a == "install") {
                for package in rest[i + 1..].iter().filter(|a| !a.starts_with('-')) {
                    state.packages.insert(package.to_string());
                }
            }
            CommandOutput::ok("")
        }
        ["nginx", "-t"] => {
            if state.packages.contains("nginx") {
                CommandOutput::ok("nginx: configuration file /etc/nginx/nginx.conf test is successful\n")
            } else {
                CommandOutput::failed(127, "nginx: command not found")
            }
        }
        ["systemctl", "reload", "nginx"] => {
            if state.packages.contains("nginx") {
                state.reloads += 1;
                CommandOutput::ok("")
            } else {
                CommandOutput::failed(5, "Unit nginx.service not loaded.")
            }
        }
        ["ln", "-sf", _, target] => {
            if let Some(site) = target.strip_prefix(&format!("{}/", SITES_ENABLED)) {
                state.enabled_sites.insert(site.to_string());
            }
            CommandOutput::ok("")
        }
        ["rm", rest @ ..] => {
            for path in rest.iter().filter(|a| !a.starts_with('-')) {
                state.files.remove(*path);
                if let Some(site) = path.strip_prefix(&format!("{}/", SITES_ENABLED)) {
                    state.enabled_sites.remove(site);
                }
            }
            CommandOutput::ok("")
        }
        ["cat", path] => match state.files.get(*path) {
            Some(bytes) => CommandOutput::ok(String::from_utf8_lossy(bytes).to_string()),
            None => CommandOutput::failed(1, format!("cat: {}: No such file or directory", path)),
        },
        ["test", "-f", path] => {
            if state.files.contains_key(*path) {
                CommandOutput::ok("")
            } else {
                CommandOutput::failed(1, "")
            }
        }
        ["sha256sum", path] => match state.files.get(*path) {
            Some(bytes) => CommandOutput::ok(format!("{}  {}\n", sha256_hash(bytes), path)),
            None => CommandOutput::failed(1, format!("sha256sum: {}: No such file or directory", path)),
        },
        ["certbot", "certonly", rest @ ..] => {
            let domain = rest
                .iter()
                .position(|a| *a == "-d")
                .and_then(|i| rest.get(i + 1));
            match domain {
                Some(domain) => {
                    let paths = certificate_paths(domain);
                    state.files.insert(paths.cert, b"CERT".to_vec());
                    state.files.insert(paths.key, b"KEY".to_vec());
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, "certbot: no domain given"),
            }
        }
        ["echo", rest @ ..] => CommandOutput::ok(format!("{}\n", rest.join(" "))),
        _ => CommandOutput::ok(""),
    }
}

fn docker(state: &mut HostState, args: &[&str]) -> CommandOutput {
    match args {
        ["run", rest @ ..] => docker_run(state, rest),
        ["start", name] => {
            let exiting = state.exiting_images.clone();
            let Some(index) = state.containers.iter().position(|c| c.name == *name) else {
                return no_such_container(name);
            };
            if let Some(port) = state.containers[index].host_port {
                if state
                    .containers
                    .iter()
                    .enumerate()
                    .any(|(i, c)| i != index && c.is_running() && c.host_port == Some(port))
                {
                    return CommandOutput::failed(
                        125,
                        format!("Bind for 0.0.0.0:{} failed: port is already allocated", port),
                    );
                }
            }
            let container = &mut state.containers[index];
            container.status = if exiting.contains(&container.image) {
                "exited"
            } else {
                "running"
            }
            .to_string();
            CommandOutput::ok(format!("{}\n", name))
        }
        ["stop", name] => match state.containers.iter_mut().find(|c| c.name == *name) {
            Some(container) => {
                container.status = "exited".to_string();
                CommandOutput::ok(format!("{}\n", name))
            }
            None => no_such_container(name),
        },
        ["rm", rest @ ..] => {
            let force = rest.contains(&"-f");
            for name in rest.iter().filter(|a| !a.starts_with('-')) {
                let Some(index) = state.containers.iter().position(|c| c.name == *name) else {
                    return no_such_container(name);
                };
                if state.containers[index].is_running() && !force {
                    return CommandOutput::failed(
                        1,
                        format!("cannot remove running container {}", name),
                    );
                }
                state.containers.remove(index);
            }
            CommandOutput::ok("")
        }
        ["ps", rest @ ..] => docker_ps(state, rest),
        ["logs", rest @ ..] => docker_logs(state, rest),
        ["inspect", "--format", format, name] => {
            let Some(container) = state.containers.iter().find(|c| c.name == *name) else {
                return CommandOutput::failed(1, format!("Error: No such object: {}", name));
            };
            let value = if format.contains("Health") {
                container.health.clone()
            } else if format.contains(".Config.Labels") {
                let label = format.split('"').nth(1).unwrap_or("");
                container.labels.get(label).cloned().unwrap_or_default()
            } else {
                container.status.clone()
            };
            CommandOutput::ok(format!("{}\n", value))
        }
        ["volume", "create", name] => {
            state.volumes.insert(name.to_string());
            CommandOutput::ok(format!("{}\n", name))
        }
        ["load", "-i", path] => {
            if state.files.contains_key(*path) {
                state.images.insert(format!("archive:{}", path));
                CommandOutput::ok("Loaded image\n")
            } else {
                CommandOutput::failed(1, format!("open {}: no such file or directory", path))
            }
        }
        ["pull", image] => {
            state.images.insert(image.to_string());
            CommandOutput::ok("")
        }
        _ => CommandOutput::ok(""),
    }
}

fn no_such_container(name: &str) -> CommandOutput {
    CommandOutput::failed(1, format!("Error: No such container: {}", name))
}

fn docker_logs(state: &HostState, args: &[&str]) -> CommandOutput {
    let Some(name) = args.last().filter(|a| !a.starts_with('-')) else {
        return CommandOutput::failed(1, "docker logs: missing container");
    };
    if !state.containers.iter().any(|c| c.name == *name) {
        return no_such_container(name);
    }
    let lines = state
        .container_logs
        .get(*name)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let tail = args
        .iter()
        .position(|a| *a == "--tail")
        .and_then(|i| args.get(i + 1))
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(lines.len());
    let start = lines.len().saturating_sub(tail);
    let mut out = String::new();
    for line in &lines[start..] {
        out.push_str(line);
        out.push('\n');
    }
    CommandOutput::ok(out)
}

fn docker_run(state: &mut HostState, args: &[&str]) -> CommandOutput {
    let mut name = None;
    let mut host_port = None;
    let mut labels = BTreeMap::new();
    let mut env = BTreeMap::new();
    let mut image = None;
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "-d" => i += 1,
            "--name" => {
                name = args.get(i + 1).map(|s| s.to_string());
                i += 2;
            }
            "-p" => {
                host_port = args
                    .get(i + 1)
                    .and_then(|p| p.split(':').next())
                    .and_then(|p| p.parse::<u16>().ok());
                i += 2;
            }
            "--label" | "-e" => {
                if let Some((k, v)) = args.get(i + 1).and_then(|kv| kv.split_once('=')) {
                    let target = if args[i] == "-e" { &mut env } else { &mut labels };
                    target.insert(k.to_string(), v.to_string());
                }
                i += 2;
            }
            "-v" => i += 2,
            flag if flag.starts_with("--") => i += 1,
            other => {
                image = Some(other.to_string());
                break;
            }
        }
    }

    let (Some(name), Some(image)) = (name, image) else {
        return CommandOutput::failed(125, "docker run: missing --name or image");
    };
    if state.containers.iter().any(|c| c.name == name) {
        return CommandOutput::failed(
            125,
            format!(
                "Conflict. The container name \"/{}\" is already in use",
                name
            ),
        );
    }
    if let Some(port) = host_port {
        if state
            .containers
            .iter()
            .any(|c| c.is_running() && c.host_port == Some(port))
        {
            return CommandOutput::failed(
                125,
                format!("Bind for 0.0.0.0:{} failed: port is already allocated", port),
            );
        }
    }

    let status = if state.exiting_images.contains(&image) {
        "exited"
    } else {
        "running"
    };
    let health = state
        .engine_health
        .get(&image)
        .cloned()
        .unwrap_or_else(|| "none".to_string());
    let id = sha256_hash(name.as_bytes());
    state.containers.push(FakeContainer {
        name,
        image,
        status: status.to_string(),
        health,
        labels,
        host_port,
        env,
    });
    CommandOutput::ok(format!("{}\n", &id[..12]))
}

fn docker_ps(state: &HostState, args: &[&str]) -> CommandOutput {
    let all = args.contains(&"-a");
    let filters: Vec<&str> = args
        .iter()
        .enumerate()
        .filter(|(i, _)| *i > 0 && args[i - 1] == "--filter")
        .map(|(_, f)| *f)
        .collect();

    let matches = |c: &FakeContainer| {
        filters.iter().all(|filter| {
            if let Some(label) = filter.strip_prefix("label=") {
                match label.split_once('=') {
                    Some((k, v)) => c.labels.get(k).map(String::as_str) == Some(v),
                    None => c.labels.contains_key(label),
                }
            } else if let Some(status) = filter.strip_prefix("status=") {
                c.status == status
            } else if let Some(name) = filter.strip_prefix("name=") {
                c.name.contains(name.trim_start_matches('^').trim_end_matches('$'))
            } else {
                true
            }
        })
    };

    let listing: String = state
        .containers
        .iter()
        .rev()
        .filter(|c| all || c.is_running())
        .filter(|c| matches(*c))
        .map(|c| {
            format!(
                "{}\t{}\t{}\t{}\t{}\n",
                c.name,
                c.status,
                label(c, LABEL_VERSION),
                label(c, LABEL_PORT),
                label(c, LABEL_CONTAINER_TYPE)
            )
        })
        .collect();
    CommandOutput::ok(listing)
}

fn label<'a>(container: &'a FakeContainer, key: &str) -> &'a str {
    container.labels.get(key).map(String::as_str).unwrap_or("")
}

/// Split a shell command into words, honouring quotes and backslashes
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(c),
            },
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[async_trait]
impl RemoteExecutor for FakeHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, PodliftError> {
        let limit = self.state().timeouts.command;
        self.respond(command, limit).await
    }

    async fn execute_streaming(
        &self,
        command: &str,
        stdout: LineSink<'_>,
        stderr: LineSink<'_>,
    ) -> Result<(), PodliftError> {
        let limit = self.state().timeouts.long;
        let output = self.respond(command, limit).await?;
        output.stdout.lines().for_each(stdout);
        output.stderr.lines().for_each(stderr);
        if output.success() {
            Ok(())
        } else {
            Err(PodliftError::CommandFailed {
                host: self.host.clone(),
                command: command.to_string(),
                stderr: output.stderr,
            })
        }
    }

    async fn copy_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), PodliftError> {
        {
            let mut state = self.state();
            state
                .commands
                .push(format!("copy {} -> {}", local_path.display(), remote_path));
            if state.unreachable {
                return Err(PodliftError::ConnectivityFailed {
                    host: self.host.clone(),
                    reason: "host unreachable".to_string(),
                });
            }
            if state.fail_copies {
                return Err(PodliftError::TransferFailed(format!(
                    "copy to {}:{} interrupted",
                    self.host, remote_path
                )));
            }
        }
        let (hangs, limit) = {
            let state = self.state();
            (matches_any(&state.hang_patterns, remote_path), state.timeouts.long)
        };
        let label = format!("copy {} -> {}", local_path.display(), remote_path);
        bounded(&self.host, &label, limit, async {
            if hangs {
                std::future::pending::<()>().await;
            }
            Ok::<_, PodliftError>(())
        })
        .await?;
        let bytes = tokio::fs::read(local_path).await?;
        let total = bytes.len() as u64;
        if let Some(progress) = progress {
            progress(total, total);
        }
        self.state()
            .files
            .insert(remote_path.to_string(), bytes);
        Ok(())
    }
}

/// Connector handing out registered fake hosts
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    hosts: BTreeMap<String, FakeHost>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: FakeHost) -> Self {
        self.hosts.insert(host.host.clone(), host);
        self
    }

    pub fn host(&self, name: &str) -> Option<&FakeHost> {
        self.hosts.get(name)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExecutor>, PodliftError> {
        let host = self
            .hosts
            .get(&server.host)
            .ok_or_else(|| PodliftError::ConnectivityFailed {
                host: server.host.clone(),
                reason: "no route to host".to_string(),
            })?;
        if host.state().unreachable {
            return Err(PodliftError::ConnectivityFailed {
                host: server.host.clone(),
                reason: "connection timed out".to_string(),
            });
        }
        Ok(Arc::new(host.clone()))
    }
}

/// Prober answering from the fake hosts' container state
#[derive(Debug, Clone)]
pub struct FakeProber {
    connector: FakeConnector,
    probes: Arc<Mutex<Vec<String>>>,
}

impl FakeProber {
    pub fn new(connector: FakeConnector) -> Self {
        Self {
            connector,
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// URLs probed so far, one entry per attempt
    pub fn probes(&self) -> Vec<String> {
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HealthProber for FakeProber {
    async fn probe(&self, request: &ProbeRequest) -> Result<u32, PodliftError> {
        let url = Url::parse(&request.url)
            .map_err(|e| PodliftError::Internal(format!("invalid probe url: {}", e)))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let attempts = request.attempts();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            self.probes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.url.clone());
            match self.connector.host(&host).and_then(|h| h.http_status(port)) {
                Some(status) if request.accepts(status) => return Ok(attempt),
                Some(status) => last_error = format!("unexpected status {}", status),
                None => last_error = "connection refused".to_string(),
            }
        }

        Err(PodliftError::HealthCheckFailed {
            attempts,
            reason: format!("{}: {}", request.url, last_error),
        })
    }
}

/// Local toolchain that records what it was asked to do
#[derive(Debug, Clone, Default)]
pub struct FakeToolchain {
    calls: Arc<Mutex<Vec<String>>>,
    fail_build: bool,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_build() -> Self {
        Self {
            fail_build: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[async_trait]
impl ImageToolchain for FakeToolchain {
    async fn build(&self, image_ref: &str, _context: &Path) -> Result<(), PodliftError> {
        self.record(format!("build {}", image_ref));
        if self.fail_build {
            return Err(PodliftError::BuildFailed(format!(
                "docker build failed for {}",
                image_ref
            )));
        }
        Ok(())
    }

    async fn save(&self, image_ref: &str, output: &Path) -> Result<(), PodliftError> {
        self.record(format!("save {}", image_ref));
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, format!("image archive for {}", image_ref)).await?;
        Ok(())
    }

    async fn login(&self, registry: &RegistryConfig) -> Result<(), PodliftError> {
        self.record(format!("login {}", registry.server_name()));
        Ok(())
    }

    async fn push(&self, image_ref: &str, remote_ref: &str) -> Result<(), PodliftError> {
        self.record(format!("push {} {}", image_ref, remote_ref));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize(r#"sudo docker run -e 'A=it'\''s' --label "x=y z" img"#),
            vec!["sudo", "docker", "run", "-e", "A=it's", "--label", "x=y z", "img"]
        );
        assert_eq!(tokenize("  ''  a"), vec!["", "a"]);
    }

    #[tokio::test]
    async fn test_run_name_and_port_conflicts() {
        let host = FakeHost::new("h");
        host.execute("sudo docker run -d --name a -p 9000:80 img").await.unwrap();
        assert!(host.execute("sudo docker run -d --name a -p 9001:80 img").await.is_err());
        assert!(host.execute("sudo docker run -d --name b -p 9000:80 img").await.is_err());
        host.execute("sudo docker stop a").await.unwrap();
        host.execute("sudo docker run -d --name b -p 9000:80 img").await.unwrap();
        assert!(host.execute("sudo docker start a").await.is_err());
    }

    #[tokio::test]
    async fn test_ps_filters_and_order() {
        let host = FakeHost::new("h");
        host.add_container(FakeContainer::app("shop", "web", "v1", 1, 9000, false));
        host.add_container(FakeContainer::app("shop", "web", "v2", 1, 9001, true));
        host.add_container(FakeContainer::app("blog", "web", "v1", 1, 9100, true));

        let running = host
            .execute("sudo docker ps --filter label=podlift.service=shop")
            .await
            .unwrap();
        assert_eq!(running, "shop-web-v2-1\trunning\tv2\t9001\tweb\n");

        let stopped = host
            .execute("sudo docker ps -a --filter label=podlift.service=shop --filter status=exited")
            .await
            .unwrap();
        assert_eq!(stopped, "shop-web-v1-1\texited\tv1\t9000\tweb\n");
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let host = FakeHost::new("h");
        host.set_unreachable(true);
        assert!(matches!(
            host.test_connectivity().await,
            Err(PodliftError::ConnectivityFailed { .. })
        ));
        let connector = FakeConnector::new().with_host(host);
        assert!(connector.connect(&Server::new("h")).await.is_err());
        assert!(connector.connect(&Server::new("other")).await.is_err());
    }
}
