//! Configuration module

pub mod settings;
pub mod topology;

use std::time::Duration;

pub use settings::{
    AppConfig, Dependency, HealthCheck, HooksConfig, ProxyConfig, RegistryConfig, ServiceSpec,
    Substitutions, CONFIG_FILE_NAME,
};
pub use topology::{Server, ServerWithRole, Topology, PRIMARY_LABEL};

/// Engine timings and limits
#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// First temporary host port handed to a new generation
    pub temp_port_base: u16,

    /// Grace period before the outgoing generation is stopped
    pub drain_grace: Duration,

    /// Upper bound on waiting for a dependency to become healthy
    pub dependency_timeout: Duration,

    /// Delay between dependency health polls
    pub dependency_poll_interval: Duration,

    /// Wait for dependencies without an engine health check
    pub dependency_settle: Duration,

    /// Delay between starting containers and the first health probe
    pub warm_up: Duration,

    /// Connection-level timeout when opening a remote session
    pub connect_timeout: Duration,

    /// Limit on one captured remote command
    pub command_timeout: Duration,

    /// Limit on streamed commands (pulls, image loads, installs) and file copies
    pub long_command_timeout: Duration,

    /// Stopped generations kept for rollback
    ///
    /// Zero stops and removes the outgoing generation at cutover, which
    /// leaves nothing for `rollback` to restart.
    pub retain_stopped_generations: usize,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            temp_port_base: 9000,
            drain_grace: Duration::from_secs(5),
            dependency_timeout: Duration::from_secs(30),
            dependency_poll_interval: Duration::from_secs(2),
            dependency_settle: Duration::from_secs(2),
            warm_up: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            long_command_timeout: Duration::from_secs(30 * 60),
            retain_stopped_generations: 1,
        }
    }
}

impl DeploySettings {
    /// Settings with every wait collapsed, for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            drain_grace: Duration::ZERO,
            dependency_timeout: Duration::from_millis(50),
            dependency_poll_interval: Duration::from_millis(1),
            dependency_settle: Duration::ZERO,
            warm_up: Duration::ZERO,
            ..Self::default()
        }
    }
}
