//! FSM unit tests

use podlift::deploy::fsm::{CutoverEvent, CutoverFsm, CutoverState};
use podlift::errors::PodliftError;

#[test]
fn test_fsm_initial_state() {
    let fsm = CutoverFsm::new();
    assert_eq!(fsm.state(), &CutoverState::Idle);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[CutoverState::Idle]);
}

#[test]
fn test_fsm_cutover_success_flow() {
    let mut fsm = CutoverFsm::new();

    fsm.process(CutoverEvent::Begin).unwrap();
    assert_eq!(fsm.state(), &CutoverState::ProvisioningNew);

    fsm.process(CutoverEvent::Provisioned).unwrap();
    assert_eq!(fsm.state(), &CutoverState::HealthGating);

    fsm.process(CutoverEvent::Healthy).unwrap();
    assert_eq!(fsm.state(), &CutoverState::CuttingOver);

    fsm.process(CutoverEvent::CutOver).unwrap();
    assert_eq!(fsm.state(), &CutoverState::Draining);

    fsm.process(CutoverEvent::Drained).unwrap();
    assert_eq!(fsm.state(), &CutoverState::DecommissioningOld);

    fsm.process(CutoverEvent::Decommissioned).unwrap();
    assert_eq!(fsm.state(), &CutoverState::Done);
    assert!(fsm.state().is_terminal());
    assert_eq!(fsm.history().len(), 7);
}

#[test]
fn test_fsm_gate_failure_rolls_back() {
    let mut fsm = CutoverFsm::new();

    fsm.process(CutoverEvent::Begin).unwrap();
    fsm.process(CutoverEvent::Provisioned).unwrap();
    fsm.process(CutoverEvent::GateFailed("503".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), &CutoverState::RollingBack);
    assert_eq!(fsm.error(), Some("503"));

    fsm.process(CutoverEvent::RolledBack).unwrap();
    assert_eq!(fsm.state(), &CutoverState::Failed("503".to_string()));
    assert!(!fsm.history().contains(&CutoverState::CuttingOver));
}

#[test]
fn test_fsm_provision_failure_rolls_back() {
    let mut fsm = CutoverFsm::new();

    fsm.process(CutoverEvent::Begin).unwrap();
    fsm.process(CutoverEvent::ProvisionFailed("port taken".to_string()))
        .unwrap();
    fsm.process(CutoverEvent::RolledBack).unwrap();
    assert_eq!(fsm.state(), &CutoverState::Failed("port taken".to_string()));
}

#[test]
fn test_fsm_proxy_failure_is_terminal() {
    let mut fsm = CutoverFsm::new();

    fsm.process(CutoverEvent::Begin).unwrap();
    fsm.process(CutoverEvent::Provisioned).unwrap();
    fsm.process(CutoverEvent::Healthy).unwrap();
    fsm.process(CutoverEvent::ProxyFailed("nginx -t".to_string()))
        .unwrap();
    assert!(fsm.state().is_terminal());
    assert!(fsm.process(CutoverEvent::RolledBack).is_err());
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = CutoverFsm::new();

    // Cannot reload the proxy before the gate
    let result = fsm.process(CutoverEvent::CutOver);
    assert!(matches!(result, Err(PodliftError::InvalidTransition(_))));
    assert_eq!(fsm.state(), &CutoverState::Idle);

    fsm.process(CutoverEvent::Begin).unwrap();
    assert!(fsm.process(CutoverEvent::Healthy).is_err());
    assert!(fsm.process(CutoverEvent::Begin).is_err());
    assert_eq!(fsm.state(), &CutoverState::ProvisioningNew);
}
