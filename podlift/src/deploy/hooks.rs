//! Deployment hooks

use std::fmt;

use tracing::{info, warn};

use crate::config::HooksConfig;
use crate::errors::PodliftError;
use crate::remote::HostSession;
use crate::utils::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeDeploy,
    AfterDeploy,
    AfterRollback,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::BeforeDeploy => "before_deploy",
            HookStage::AfterDeploy => "after_deploy",
            HookStage::AfterRollback => "after_rollback",
        }
    }

    pub fn commands<'a>(&self, hooks: &'a HooksConfig) -> &'a [String] {
        match self {
            HookStage::BeforeDeploy => &hooks.before_deploy,
            HookStage::AfterDeploy => &hooks.after_deploy,
            HookStage::AfterRollback => &hooks.after_rollback,
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shell line running a hook with the service and version exported
pub fn hook_command(command: &str, service: &str, version: &str) -> String {
    format!(
        "PODLIFT_SERVICE={} PODLIFT_VERSION={} sh -c {}",
        shell_quote(service),
        shell_quote(version),
        shell_quote(command)
    )
}

/// Run a stage's commands in order, streaming their output; stops at the first failure
pub async fn run_hooks(
    session: &HostSession,
    stage: HookStage,
    hooks: &HooksConfig,
    service: &str,
    version: &str,
) -> Result<(), PodliftError> {
    let commands = stage.commands(hooks);
    if commands.is_empty() {
        return Ok(());
    }

    let host = session.host().to_string();
    let stdout = |line: &str| info!(host = %host, hook = %stage, "{}", line);
    let stderr = |line: &str| warn!(host = %host, hook = %stage, "{}", line);

    for command in commands {
        info!(host = %host, hook = %stage, command = %command, "running hook");
        session
            .stream(&hook_command(command, service, version), &stdout, &stderr)
            .await
            .map_err(|e| PodliftError::HookFailed(format!("{} '{}': {}", stage, command, e)))?;
    }
    Ok(())
}
