//! Finite State Machine for a zero-downtime cutover

use serde::{Deserialize, Serialize};

use crate::errors::PodliftError;

/// Cutover state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverState {
    /// Nothing started yet
    Idle,

    /// Starting the incoming generation on temporary ports
    ProvisioningNew,

    /// Probing the incoming generation
    HealthGating,

    /// Rewriting and reloading the proxy
    CuttingOver,

    /// Letting in-flight requests to the outgoing generation finish
    Draining,

    /// Stopping the outgoing generation
    DecommissioningOld,

    /// Removing the incoming generation after a failed start or gate
    RollingBack,

    /// Traffic served by the incoming generation
    Done,

    /// Cutover abandoned
    Failed(String),
}

impl CutoverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CutoverState::Done | CutoverState::Failed(_))
    }
}

/// Cutover event
#[derive(Debug, Clone)]
pub enum CutoverEvent {
    /// Start the cutover
    Begin,

    /// Every container of the incoming generation started
    Provisioned,

    /// Starting the incoming generation failed
    ProvisionFailed(String),

    /// Every gated service answered its health check
    Healthy,

    /// A health check failed
    GateFailed(String),

    /// Incoming generation removed
    RolledBack,

    /// Proxy now routes to the incoming generation
    CutOver,

    /// Proxy update failed, incoming generation left running
    ProxyFailed(String),

    /// Grace period elapsed
    Drained,

    /// Outgoing generation stopped
    Decommissioned,
}

/// Cutover FSM
#[derive(Debug, Clone)]
pub struct CutoverFsm {
    state: CutoverState,
    error: Option<String>,
    history: Vec<CutoverState>,
}

impl CutoverFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: CutoverState::Idle,
            error: None,
            history: vec![CutoverState::Idle],
        }
    }

    /// Get current state
    pub fn state(&self) -> &CutoverState {
        &self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[CutoverState] {
        &self.history
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: CutoverEvent) -> Result<&CutoverState, PodliftError> {
        let new_state = match (&self.state, &event) {
            (CutoverState::Idle, CutoverEvent::Begin) => CutoverState::ProvisioningNew,

            (CutoverState::ProvisioningNew, CutoverEvent::Provisioned) => CutoverState::HealthGating,
            (CutoverState::ProvisioningNew, CutoverEvent::ProvisionFailed(err)) => {
                self.error = Some(err.clone());
                CutoverState::RollingBack
            }

            (CutoverState::HealthGating, CutoverEvent::Healthy) => CutoverState::CuttingOver,
            (CutoverState::HealthGating, CutoverEvent::GateFailed(err)) => {
                self.error = Some(err.clone());
                CutoverState::RollingBack
            }

            (CutoverState::RollingBack, CutoverEvent::RolledBack) => {
                CutoverState::Failed(self.error.clone().unwrap_or_default())
            }

            (CutoverState::CuttingOver, CutoverEvent::CutOver) => CutoverState::Draining,
            (CutoverState::CuttingOver, CutoverEvent::ProxyFailed(err)) => {
                self.error = Some(err.clone());
                CutoverState::Failed(err.clone())
            }

            (CutoverState::Draining, CutoverEvent::Drained) => CutoverState::DecommissioningOld,

            (CutoverState::DecommissioningOld, CutoverEvent::Decommissioned) => CutoverState::Done,

            (state, event) => {
                return Err(PodliftError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.history.push(new_state.clone());
        self.state = new_state;
        Ok(&self.state)
    }
}

impl Default for CutoverFsm {
    fn default() -> Self {
        Self::new()
    }
}
