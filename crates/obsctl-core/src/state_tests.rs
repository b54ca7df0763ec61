use crate::command::CommandKind;
use crate::state::{transition, Decision, FailureCause, ObsState, ObservationStateMachine};

const ALL_STATES: [ObsState; 11] = [
    ObsState::Empty,
    ObsState::Resourcing,
    ObsState::Idle,
    ObsState::Configuring,
    ObsState::Ready,
    ObsState::Scanning,
    ObsState::Aborting,
    ObsState::Aborted,
    ObsState::Resetting,
    ObsState::Restarting,
    ObsState::Fault,
];

#[test]
fn request_is_accepted_exactly_from_allowed_states() {
    for kind in CommandKind::ALL {
        let allowed = transition(kind).allowed_from;
        for state in ALL_STATES {
            // Arrange
            let mut machine = ObservationStateMachine::new(state);

            // Act
            let decision = machine.request(kind);

            // Assert
            assert_eq!(
                decision.is_accepted(),
                allowed.contains(&state),
                "{kind} from {state}"
            );
            if !decision.is_accepted() {
                assert_eq!(machine.current(), state, "rejection must not move the state");
            }
        }
    }
}

#[test]
fn configure_from_empty_is_rejected_with_current_state() {
    let mut machine = ObservationStateMachine::default();

    let decision = machine.request(CommandKind::Configure);

    match decision {
        Decision::Rejected { state, .. } => assert_eq!(state, ObsState::Empty),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn acceptance_is_provisional_until_completion() {
    // Arrange
    let mut machine = ObservationStateMachine::default();

    // Act
    let decision = machine.request(CommandKind::AssignResources);

    // Assert
    assert_eq!(
        decision,
        Decision::Accepted {
            provisional: ObsState::Resourcing
        }
    );
    assert_eq!(machine.current(), ObsState::Resourcing);
    assert_eq!(machine.in_flight(), Some(CommandKind::AssignResources));

    assert_eq!(machine.complete(CommandKind::AssignResources), ObsState::Idle);
    assert_eq!(machine.in_flight(), None);
}

#[test]
fn evaluate_has_no_side_effects() {
    let machine = ObservationStateMachine::new(ObsState::Ready);

    let decision = machine.evaluate(CommandKind::Scan);

    assert!(decision.is_accepted());
    assert_eq!(machine.current(), ObsState::Ready);
    assert_eq!(machine.in_flight(), None);
}

#[test]
fn assign_then_release_returns_to_empty() {
    let mut machine = ObservationStateMachine::default();

    assert!(machine.request(CommandKind::AssignResources).is_accepted());
    machine.complete(CommandKind::AssignResources);
    assert!(machine.request(CommandKind::ReleaseAllResources).is_accepted());
    machine.complete(CommandKind::ReleaseAllResources);

    assert_eq!(machine.current(), ObsState::Empty);
}

#[test]
fn remote_failure_restores_pre_command_state_for_setup_commands() {
    // Arrange
    let mut machine = ObservationStateMachine::new(ObsState::Idle);
    assert!(machine.request(CommandKind::Configure).is_accepted());

    // Act
    let to = machine.fail(
        CommandKind::Configure,
        ObsState::Idle,
        &FailureCause::Remote("bad beam".to_string()),
    );

    // Assert
    assert_eq!(to, ObsState::Idle);
    assert_eq!(machine.in_flight(), None);
}

#[test]
fn timeout_always_faults() {
    let mut machine = ObservationStateMachine::new(ObsState::Idle);
    assert!(machine.request(CommandKind::AssignResources).is_accepted());

    let to = machine.fail(CommandKind::AssignResources, ObsState::Idle, &FailureCause::Timeout);

    assert_eq!(to, ObsState::Fault);
}

#[test]
fn failed_abort_faults() {
    let mut machine = ObservationStateMachine::new(ObsState::Scanning);
    assert!(machine.request(CommandKind::Abort).is_accepted());

    let to = machine.fail(
        CommandKind::Abort,
        ObsState::Scanning,
        &FailureCause::Remote("stuck".to_string()),
    );

    assert_eq!(to, ObsState::Fault);
}

#[test]
fn recovery_paths_from_fault() {
    let mut machine = ObservationStateMachine::new(ObsState::Fault);
    assert!(machine.request(CommandKind::ObsReset).is_accepted());
    assert_eq!(machine.complete(CommandKind::ObsReset), ObsState::Idle);

    let mut machine = ObservationStateMachine::new(ObsState::Aborted);
    assert!(machine.request(CommandKind::Restart).is_accepted());
    assert_eq!(machine.current(), ObsState::Restarting);
    assert_eq!(machine.complete(CommandKind::Restart), ObsState::Empty);
}

#[test]
fn subordinate_state_is_followed_only_without_command_in_flight() {
    // Arrange
    let mut machine = ObservationStateMachine::new(ObsState::Idle);

    // Act + Assert: no command in flight, aggregate wins
    assert_eq!(machine.on_subordinate_obs_state(ObsState::Ready), Some(ObsState::Ready));

    // Command in flight: only FAULT folds in
    assert!(machine.request(CommandKind::Scan).is_accepted());
    assert_eq!(machine.on_subordinate_obs_state(ObsState::Ready), None);
    assert_eq!(machine.current(), ObsState::Scanning);
    assert_eq!(machine.on_subordinate_obs_state(ObsState::Fault), Some(ObsState::Fault));
    assert_eq!(machine.in_flight(), None);
}

#[test]
fn state_names_parse_case_insensitively() {
    assert_eq!(ObsState::parse("scanning"), Some(ObsState::Scanning));
    assert_eq!(ObsState::parse(" FAULT "), Some(ObsState::Fault));
    assert_eq!(ObsState::parse("ON"), None);
}
