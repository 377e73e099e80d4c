//! Servers, roles and target resolution

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::settings::Dependency;
use crate::errors::PodliftError;

/// Label that marks the server used for cluster-wide actions
pub const PRIMARY_LABEL: &str = "primary";

/// A deployment server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Host address
    pub host: String,

    /// Login user
    #[serde(default = "default_user")]
    pub user: String,

    /// Path to the private key
    #[serde(default = "default_ssh_key")]
    pub ssh_key: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Free-form labels, in declaration order
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_ssh_key() -> String {
    "~/.ssh/id_rsa".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl Server {
    /// Create a server with default login settings
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: default_user(),
            ssh_key: default_ssh_key(),
            port: default_ssh_port(),
            labels: Vec::new(),
        }
    }

    /// Attach labels to the server
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for label in labels {
            let label = label.into();
            if !self.labels.contains(&label) {
                self.labels.push(label);
            }
        }
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    fn apply_defaults(&mut self) {
        if self.user.is_empty() {
            self.user = default_user();
        }
        if self.ssh_key.is_empty() {
            self.ssh_key = default_ssh_key();
        }
        if self.port == 0 {
            self.port = default_ssh_port();
        }
    }
}

/// A server together with the role it was declared under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerWithRole {
    pub server: Server,
    pub role: String,
}

impl ServerWithRole {
    pub fn host(&self) -> &str {
        &self.server.host
    }
}

/// The role to servers mapping
///
/// Roles are kept in a `BTreeMap`, so every traversal is lexicographic by role
/// and then in declaration order within a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "ServersSpec")]
pub struct Topology {
    roles: BTreeMap<String, Vec<Server>>,
}

/// `servers` may be written as a plain list (role `web`) or as a role map
#[derive(Deserialize)]
#[serde(untagged)]
enum ServersSpec {
    Roles(BTreeMap<String, Vec<Server>>),
    List(Vec<Server>),
}

impl From<ServersSpec> for Topology {
    fn from(spec: ServersSpec) -> Self {
        let roles = match spec {
            ServersSpec::Roles(roles) => roles,
            ServersSpec::List(list) => BTreeMap::from([("web".to_string(), list)]),
        };
        let mut topology = Topology { roles };
        topology.apply_defaults();
        topology
    }
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role with its servers, replacing any previous entry
    pub fn with_role(mut self, role: impl Into<String>, servers: Vec<Server>) -> Self {
        self.roles.insert(role.into(), servers);
        self.apply_defaults();
        self
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &[Server])> {
        self.roles.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn servers_in(&self, role: &str) -> Option<&[Server]> {
        self.roles.get(role).map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.roles.values().all(|servers| servers.is_empty())
    }

    /// Total number of server entries across all roles
    pub fn len(&self) -> usize {
        self.roles.values().map(|servers| servers.len()).sum()
    }

    fn apply_defaults(&mut self) {
        for servers in self.roles.values_mut() {
            for server in servers.iter_mut() {
                server.apply_defaults();
            }
        }
    }

    /// Every role has at least one server and every server has a host
    pub fn validate(&self) -> Result<(), PodliftError> {
        if self.roles.is_empty() {
            return Err(PodliftError::ConfigurationInvalid(
                "at least one server is required".to_string(),
            ));
        }
        for (role, servers) in &self.roles {
            if servers.is_empty() {
                return Err(PodliftError::ConfigurationInvalid(format!(
                    "role '{}' has no servers",
                    role
                )));
            }
            for (i, server) in servers.iter().enumerate() {
                if server.host.trim().is_empty() {
                    return Err(PodliftError::ConfigurationInvalid(format!(
                        "server {} in role '{}' missing host",
                        i, role
                    )));
                }
            }
        }
        Ok(())
    }

    /// Flatten into a role-tagged list in traversal order
    pub fn all_servers(&self) -> Vec<ServerWithRole> {
        self.iter_with_role()
            .map(|(role, server)| ServerWithRole {
                server: server.clone(),
                role: role.to_string(),
            })
            .collect()
    }

    fn iter_with_role(&self) -> impl Iterator<Item = (&str, &Server)> {
        self.roles
            .iter()
            .flat_map(|(role, servers)| servers.iter().map(move |s| (role.as_str(), s)))
    }

    /// First server labelled `primary`, else the first server in traversal order
    pub fn primary(&self) -> Result<ServerWithRole, PodliftError> {
        let found = self
            .iter_with_role()
            .find(|(_, server)| server.has_label(PRIMARY_LABEL))
            .or_else(|| self.iter_with_role().next());

        found
            .map(|(role, server)| ServerWithRole {
                server: server.clone(),
                role: role.to_string(),
            })
            .ok_or_else(|| PodliftError::TargetNotFound("no servers configured".to_string()))
    }

    /// Pick the server that hosts a dependency
    ///
    /// Precedence: explicit host, then role, then label intersection, then primary.
    pub fn resolve_dependency_target(
        &self,
        dependency: &Dependency,
    ) -> Result<ServerWithRole, PodliftError> {
        let with_role = |(role, server): (&str, &Server)| ServerWithRole {
            server: server.clone(),
            role: role.to_string(),
        };

        if let Some(host) = dependency.host.as_deref().filter(|h| !h.is_empty()) {
            return self
                .iter_with_role()
                .find(|(_, server)| server.host == host)
                .map(with_role)
                .ok_or_else(|| {
                    PodliftError::TargetNotFound(format!(
                        "dependency host '{}' not found in servers",
                        host
                    ))
                });
        }

        if let Some(role) = dependency.role.as_deref().filter(|r| !r.is_empty()) {
            return self
                .roles
                .get(role)
                .and_then(|servers| servers.first())
                .map(|server| with_role((role, server)))
                .ok_or_else(|| {
                    PodliftError::TargetNotFound(format!(
                        "dependency role '{}' not found in servers",
                        role
                    ))
                });
        }

        if !dependency.labels.is_empty() {
            return self
                .iter_with_role()
                .find(|(_, server)| dependency.labels.iter().any(|l| server.has_label(l)))
                .map(with_role)
                .ok_or_else(|| {
                    PodliftError::TargetNotFound(format!(
                        "no server found with labels {:?}",
                        dependency.labels
                    ))
                });
        }

        self.primary()
    }
}
