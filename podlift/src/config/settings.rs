//! Application description (`podlift.json`)

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::config::topology::{Server, Topology};
use crate::errors::PodliftError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Name of the configuration file looked up from the working directory
pub const CONFIG_FILE_NAME: &str = "podlift.json";

/// Complete application description
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Service name, unique per server
    pub service: String,

    /// Public domain served by the proxy
    #[serde(default)]
    pub domain: Option<String>,

    /// Image name (without tag)
    pub image: String,

    /// Source repository identity
    #[serde(default)]
    pub git: Option<GitConfig>,

    /// Role to servers mapping
    pub servers: Topology,

    /// Registry credentials; archive copy is used when absent
    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    /// Auxiliary containers
    #[serde(default)]
    pub dependencies: BTreeMap<String, Dependency>,

    /// Application processes
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Deployment hooks
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Git repository information
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub repo: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,
}

/// Registry credentials
#[derive(Debug, Default, Deserialize)]
pub struct RegistryConfig {
    /// Registry host, Docker Hub when empty
    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(SecretString::from))
}

impl RegistryConfig {
    /// Registry host, defaulting to Docker Hub
    pub fn server_name(&self) -> &str {
        self.server
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("docker.io")
    }

    /// Full image reference in the registry
    pub fn image_path(&self, image: &str, tag: &str) -> String {
        match self.server.as_deref() {
            None | Some("") | Some("docker.io") => {
                format!("{}/{}:{}", self.username, image, tag)
            }
            Some(server) => format!("{}/{}/{}:{}", server, self.username, image, tag),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.username.is_empty()
            && self
                .password
                .as_ref()
                .map(|p| !p.expose_secret().is_empty())
                .unwrap_or(false)
    }
}

/// An auxiliary container (database, cache, ...)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dependency {
    pub image: String,

    /// Explicit server host
    #[serde(default)]
    pub host: Option<String>,

    /// Explicit server role
    #[serde(default)]
    pub role: Option<String>,

    /// Match servers carrying any of these labels
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Volume spec, `name:/path` for named volumes
    #[serde(default)]
    pub volume: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub command: Option<String>,

    /// Extra engine options (`--key=value`)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Dependency {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Named volume to create before start, if the volume spec names one
    pub fn named_volume(&self) -> Option<&str> {
        let volume = self.volume.as_deref()?;
        let name = volume.split(':').next()?;
        if name.is_empty() || name.starts_with('/') || name.starts_with('.') {
            None
        } else {
            Some(name)
        }
    }
}

/// An application process group
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    /// Port the process listens on inside the container
    #[serde(default = "default_service_port")]
    pub port: u16,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Override for the image command
    #[serde(default)]
    pub command: Option<String>,

    /// HTTP health check; `null` disables it
    #[serde(default = "default_healthcheck")]
    pub healthcheck: Option<HealthCheck>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_service_port() -> u16 {
    8000
}

fn default_replicas() -> u32 {
    1
}

fn default_healthcheck() -> Option<HealthCheck> {
    Some(HealthCheck::default())
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            port: default_service_port(),
            replicas: default_replicas(),
            command: None,
            healthcheck: default_healthcheck(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl ServiceSpec {
    /// Health check settings if checking is enabled
    pub fn active_healthcheck(&self) -> Option<&HealthCheck> {
        self.healthcheck.as_ref().filter(|h| h.enabled)
    }
}

/// HTTP health check settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheck {
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Accepted status codes
    #[serde(default = "default_expect")]
    pub expect: Vec<u16>,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Delay between attempts in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Maximum attempts
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_expect() -> Vec<u16> {
    vec![200]
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_interval() -> u64 {
    2
}

fn default_health_retries() -> u32 {
    15
}

fn default_true() -> bool {
    true
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            expect: default_expect(),
            timeout_secs: default_health_timeout(),
            interval_secs: default_health_interval(),
            retries: default_health_retries(),
            enabled: true,
        }
    }
}

impl HealthCheck {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Certificate provider; only `letsencrypt` is supported
    #[serde(default)]
    pub ssl: Option<String>,

    /// Contact email for certificate requests
    #[serde(default)]
    pub ssl_email: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ssl: None,
            ssl_email: None,
        }
    }
}

impl ProxyConfig {
    pub fn tls_enabled(&self) -> bool {
        self.ssl.as_deref() == Some("letsencrypt")
    }
}

/// Commands run on the primary server around deployments
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub before_deploy: Vec<String>,

    #[serde(default)]
    pub after_deploy: Vec<String>,

    #[serde(default)]
    pub after_rollback: Vec<String>,
}

impl AppConfig {
    /// Minimal configuration, mostly useful for tests and `init`
    pub fn new(service: impl Into<String>, image: impl Into<String>, servers: Topology) -> Self {
        let mut config = Self {
            service: service.into(),
            domain: None,
            image: image.into(),
            git: None,
            servers,
            registry: None,
            dependencies: BTreeMap::new(),
            services: BTreeMap::new(),
            proxy: ProxyConfig::default(),
            hooks: HooksConfig::default(),
            log_level: LogLevel::default(),
        };
        config.apply_defaults();
        config
    }

    /// Read, default and validate a configuration file
    pub async fn load(file: &File) -> Result<Self, PodliftError> {
        let contents = file.read_string().await.map_err(|e| {
            PodliftError::ConfigurationInvalid(format!(
                "failed to read {}: {}",
                file.path().display(),
                e
            ))
        })?;
        Self::from_json_str(&contents)
    }

    /// Parse, default and validate a configuration document
    pub fn from_json_str(contents: &str) -> Result<Self, PodliftError> {
        let mut config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| PodliftError::ConfigurationInvalid(e.to_string()))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.services.is_empty() {
            self.services
                .insert("web".to_string(), ServiceSpec::default());
        }
    }

    /// Check the configuration; every failure is `ConfigurationInvalid`
    pub fn validate(&self) -> Result<(), PodliftError> {
        let invalid = |msg: String| Err(PodliftError::ConfigurationInvalid(msg));

        if self.service.trim().is_empty() {
            return invalid("service name is required".to_string());
        }
        if self.image.trim().is_empty() {
            return invalid("image name is required".to_string());
        }

        self.servers.validate()?;

        for (name, svc) in &self.services {
            if svc.port == 0 {
                return invalid(format!("service '{}' has invalid port: {}", name, svc.port));
            }
            if svc.replicas < 1 {
                return invalid(format!("service '{}' replicas must be >= 1", name));
            }
            if let Some(hc) = svc.active_healthcheck() {
                if !hc.path.starts_with('/') {
                    return invalid(format!(
                        "service '{}' healthcheck path must start with '/'",
                        name
                    ));
                }
            }
        }

        for (name, dep) in &self.dependencies {
            if dep.image.trim().is_empty() {
                return invalid(format!("dependency '{}' missing image", name));
            }
            if let Err(e) = self.servers.resolve_dependency_target(dep) {
                return invalid(format!("dependency '{}': {}", name, e));
            }
        }

        if let Some(registry) = &self.registry {
            if registry.server.as_deref().is_some_and(|s| !s.is_empty())
                && registry.username.is_empty()
            {
                return invalid(
                    "registry username required when server is specified".to_string(),
                );
            }
        }

        if self.proxy.tls_enabled() && self.domain.as_deref().unwrap_or("").is_empty() {
            return invalid("a domain is required when ssl is enabled".to_string());
        }

        Ok(())
    }

    /// Expand `${NAME}` references from an explicit variable set
    pub fn substitute(&mut self, vars: &Substitutions) -> Result<(), PodliftError> {
        for svc in self.services.values_mut() {
            for value in svc.env.values_mut() {
                *value = vars.expand(value)?;
            }
        }
        for dep in self.dependencies.values_mut() {
            for value in dep.env.values_mut() {
                *value = vars.expand(value)?;
            }
        }
        if let Some(registry) = self.registry.as_mut() {
            registry.username = vars.expand(&registry.username)?;
            if let Some(password) = registry.password.take() {
                let expanded = vars.expand(password.expose_secret())?;
                registry.password = Some(SecretString::from(expanded));
            }
        }
        Ok(())
    }

    /// Image reference for a version
    pub fn image_ref(&self, version: &str) -> String {
        format!("{}:{}", self.image, version)
    }

    /// Registry credentials when both username and password are present
    pub fn active_registry(&self) -> Option<&RegistryConfig> {
        self.registry.as_ref().filter(|r| r.is_configured())
    }

    /// Domain the proxy serves on a server
    pub fn domain_for(&self, server: &Server) -> String {
        self.domain
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| server.host.clone())
    }
}

/// Variables available to `${NAME}` substitution
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    vars: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the process environment
    pub fn from_process_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Merge `KEY=value` lines; existing keys win
    pub fn merge_dotenv(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                self.vars
                    .entry(key.trim().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
    }

    /// Replace every `${NAME}` in `input`
    pub fn expand(&self, input: &str) -> Result<String, PodliftError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                PodliftError::ConfigurationInvalid(format!("unterminated variable in '{}'", input))
            })?;
            let name = &after[..end];
            let value = self.vars.get(name).ok_or_else(|| {
                PodliftError::ConfigurationInvalid(format!("environment variable {} is not set", name))
            })?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
