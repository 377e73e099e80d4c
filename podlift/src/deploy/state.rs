//! Deployment record kept on each server
//!
//! `/opt/<service>/.podlift/state.json` remembers which repository and version
//! own a service name on a host, so an unrelated application reusing the name
//! is refused before anything is changed.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::PodliftError;
use crate::git::normalize_repo_url;
use crate::remote::HostSession;
use crate::utils::shell_quote;

/// One deployment of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub version: String,
    #[serde(default)]
    pub git_repo: Option<String>,
    pub deployed_at: String,
    #[serde(default)]
    pub deployment_id: String,
}

/// Contents of the state document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    #[serde(default)]
    pub current: Option<DeploymentRecord>,
    #[serde(default)]
    pub previous: Option<DeploymentRecord>,
}

impl RemoteState {
    /// Make `record` current, keeping the old current one as previous
    pub fn advance(&mut self, record: DeploymentRecord) {
        self.previous = self.current.take();
        self.current = Some(record);
    }
}

pub fn state_dir(service: &str) -> String {
    format!("/opt/{}/.podlift", service)
}

pub fn state_path(service: &str) -> String {
    format!("{}/state.json", state_dir(service))
}

/// Read the state document; a missing or unreadable one counts as empty
pub async fn load(session: &HostSession, service: &str) -> Result<RemoteState, PodliftError> {
    let Some(contents) = session.read_file(&state_path(service)).await? else {
        return Ok(RemoteState::default());
    };
    match serde_json::from_str(&contents) {
        Ok(state) => Ok(state),
        Err(e) => {
            warn!(host = %session.host(), service, "ignoring unreadable state file: {}", e);
            Ok(RemoteState::default())
        }
    }
}

/// Refuse to deploy over a service owned by a different repository
///
/// Only applies when both sides know their repository.
pub fn check_conflict(
    state: &RemoteState,
    service: &str,
    host: &str,
    git_repo: Option<&str>,
) -> Result<(), PodliftError> {
    let deployed = state.current.as_ref().and_then(|c| c.git_repo.as_deref());
    match (deployed, git_repo) {
        (Some(deployed), Some(ours)) if normalize_repo_url(deployed) != normalize_repo_url(ours) => {
            Err(PodliftError::ServiceConflict {
                service: service.to_string(),
                host: host.to_string(),
                deployed_repo: deployed.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Write the state document
pub async fn save(
    session: &HostSession,
    service: &str,
    state: &RemoteState,
) -> Result<(), PodliftError> {
    let contents = serde_json::to_string_pretty(state)?;
    session
        .mutate(&format!("sudo mkdir -p {}", shell_quote(&state_dir(service))))
        .await?;
    session.write_file(&contents, &state_path(service)).await
}
