use rollback_core::{
    AbortReason, AppTarget, ChangeId, ChangeRef, CiOutcome, Environment, EventPayload, FsmState, SampleWindow, WaitKind,
};
use rollback_kernel::state_machine::{allowed_transitions, transition, validate_transition, Guards};
use proptest::prelude::*;

fn app() -> AppTarget {
    AppTarget {
        name: "checkout".into(),
        environment: Environment::Staging,
        repo: "org/checkout".into(),
        branch: "main".into(),
        namespace: "apps".into(),
        workload: "checkout".into(),
    }
}

fn state() -> impl Strategy<Value = FsmState> {
    prop_oneof![
        Just(FsmState::Idle),
        Just(FsmState::DegradationDetected),
        Just(FsmState::CandidateResolved),
        Just(FsmState::ChangeProposed),
        Just(FsmState::AwaitingMergeDecision),
        Just(FsmState::Merged),
        Just(FsmState::RollbackComplete),
        Just(FsmState::Abort),
    ]
}

fn payload() -> impl Strategy<Value = EventPayload> {
    proptest::sample::select(vec![
        EventPayload::DegradationConfirmed {
            app: app(),
            current_revision: "ccc".into(),
            samples: SampleWindow::new(),
        },
        EventPayload::NoCandidateFound { examined: 3 },
        EventPayload::ChangeCreated {
            change: ChangeRef {
                id: ChangeId(7),
                head_branch: "rollback/checkout/x".into(),
                url: None,
            },
        },
        EventPayload::CiResult {
            change_id: ChangeId(7),
            outcome: CiOutcome::Success,
        },
        EventPayload::CiResult {
            change_id: ChangeId(7),
            outcome: CiOutcome::Failure,
        },
        EventPayload::MergeCompleted {
            change_id: ChangeId(7),
            already_merged: false,
        },
        EventPayload::HealthRestored { sustained_secs: 60 },
        EventPayload::ApprovalGranted { approver: "alice".into() },
        EventPayload::Timeout { wait: WaitKind::CandidateSearch },
        EventPayload::Timeout { wait: WaitKind::CheckCompletion },
        EventPayload::Timeout { wait: WaitKind::Approval },
        EventPayload::Timeout { wait: WaitKind::HealthConfirmation },
        EventPayload::Failed {
            reason: AbortReason::ChecksFailed,
        },
        EventPayload::EmergencyStop { detail: "operator".into() },
        EventPayload::ResetRequested { operator: "bob".into() },
    ])
}

fn environment() -> impl Strategy<Value = Environment> {
    prop_oneof![Just(Environment::Staging), Just(Environment::Production)]
}

#[test]
fn test_idle_transitions() {
    assert!(validate_transition(FsmState::Idle, FsmState::DegradationDetected).is_ok());
    assert!(validate_transition(FsmState::Idle, FsmState::Merged).is_err());
    assert!(validate_transition(FsmState::Idle, FsmState::ChangeProposed).is_err());
}

#[test]
fn test_terminal_transitions() {
    assert!(allowed_transitions(FsmState::RollbackComplete).is_empty());
    assert_eq!(allowed_transitions(FsmState::Abort), vec![FsmState::Idle]);
    assert!(validate_transition(FsmState::Abort, FsmState::Merged).is_err());
}

#[test]
fn test_merge_requires_a_proposal() {
    for from in [FsmState::Idle, FsmState::DegradationDetected, FsmState::CandidateResolved] {
        assert!(validate_transition(from, FsmState::Merged).is_err(), "{from} -> Merged");
    }
}

proptest! {
    #[test]
    fn prop_all_transitions_are_subset_of_allowed(
        from in state(),
        event in payload(),
        env in environment(),
    ) {
        if let Ok(t) = transition(from, &event, &Guards { environment: env }) {
            prop_assert!(t.next == from || allowed_transitions(from).contains(&t.next));
        }
    }

    #[test]
    fn prop_complete_ignores_every_event(event in payload(), env in environment()) {
        let guards = Guards { environment: env };
        prop_assert!(transition(FsmState::RollbackComplete, &event, &guards).is_err());
    }

    #[test]
    fn prop_abort_only_leaves_on_reset(event in payload(), env in environment()) {
        let result = transition(FsmState::Abort, &event, &Guards { environment: env });
        match event {
            EventPayload::ResetRequested { .. } => prop_assert_eq!(result.map(|t| t.next).ok(), Some(FsmState::Idle)),
            _ => prop_assert!(result.is_err()),
        }
    }

    #[test]
    fn prop_emergency_stop_aborts_live_states(from in state(), env in environment()) {
        let stop = EventPayload::EmergencyStop { detail: "stop".into() };
        let result = transition(from, &stop, &Guards { environment: env });
        if from.is_terminal() {
            prop_assert!(result.is_err());
        } else {
            prop_assert_eq!(result.map(|t| t.next).ok(), Some(FsmState::Abort));
        }
    }

    #[test]
    fn prop_staging_never_requests_approval(from in state(), event in payload()) {
        if let Ok(t) = transition(from, &event, &Guards { environment: Environment::Staging }) {
            prop_assert!(!t.actions.contains(&rollback_core::Action::RequestApproval));
        }
    }
}
