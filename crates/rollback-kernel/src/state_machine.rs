//! Pure FSM transition table
//!
//! `transition(state, event, guards)` decides the next state and the actions
//! to run. It never performs I/O; merge-gating checks against fresh
//! collaborator state happen inside the `AttemptMerge` action.

use rollback_core::{AbortReason, Action, CiOutcome, Environment, EventKind, EventPayload, FsmState, WaitKind};

/// Static inputs to guarded transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guards {
    pub environment: Environment,
}

/// Result of applying an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: FsmState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn to(next: FsmState, actions: Vec<Action>) -> Self {
        Self { next, actions }
    }

    fn abort(reason: AbortReason) -> Self {
        Self::to(FsmState::Abort, vec![Action::CancelWaits, Action::Escalate { reason }])
    }
}

/// Transition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Event has no meaning in this state
    #[error("event {event} not applicable in state {state}")]
    NotApplicable { state: FsmState, event: EventKind },

    /// Target state not reachable from source state
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: FsmState, to: FsmState },
}

/// Decide the next state and actions for `payload` in `state`
pub fn transition(state: FsmState, payload: &EventPayload, guards: &Guards) -> Result<Transition, TransitionError> {
    use EventPayload as E;
    use FsmState as S;

    let not_applicable = || TransitionError::NotApplicable {
        state,
        event: payload.kind(),
    };

    let t = match (state, payload) {
        // Critical violations and surfaced failures abort from any live state
        (s, E::EmergencyStop { detail }) if !s.is_terminal() => {
            Transition::abort(AbortReason::EmergencyStop { detail: detail.clone() })
        }
        (s, E::Failed { reason }) if !s.is_terminal() => Transition::abort(reason.clone()),

        (S::Idle, E::DegradationConfirmed { .. }) => {
            Transition::to(S::DegradationDetected, vec![Action::ResolveCandidate, Action::WatchRecovery])
        }

        (S::DegradationDetected, E::CandidateResolved { .. }) => {
            Transition::to(S::CandidateResolved, vec![Action::CancelWaits, Action::ProposeChange])
        }
        (S::DegradationDetected, E::NoCandidateFound { examined }) => {
            Transition::abort(AbortReason::NoCandidateFound { examined: *examined })
        }
        (S::DegradationDetected, E::Timeout { wait: WaitKind::CandidateSearch }) => {
            Transition::abort(AbortReason::CandidateSearchTimedOut)
        }
        (S::DegradationDetected, E::HealthRestored { .. }) => {
            Transition::to(S::Idle, vec![Action::CancelWaits, Action::Retire])
        }

        (S::CandidateResolved, E::ChangeCreated { .. }) => Transition::to(S::ChangeProposed, vec![Action::AwaitChecks]),

        (S::ChangeProposed, E::CiResult { outcome: CiOutcome::Success, .. }) => {
            let decide = match guards.environment {
                Environment::Staging => Action::AttemptMerge { approved: false },
                Environment::Production => Action::RequestApproval,
            };
            Transition::to(S::AwaitingMergeDecision, vec![Action::CancelWaits, decide])
        }
        (S::ChangeProposed, E::CiResult { outcome: CiOutcome::Failure, .. }) => {
            Transition::abort(AbortReason::ChecksFailed)
        }
        (S::ChangeProposed, E::Timeout { wait: WaitKind::CheckCompletion }) => {
            Transition::abort(AbortReason::ChecksTimedOut)
        }
        // Merged outside the engine while checks were pending
        (S::ChangeProposed | S::AwaitingMergeDecision, E::MergeCompleted { .. }) => {
            Transition::to(S::Merged, vec![Action::CancelWaits, Action::ConfirmHealth])
        }

        (S::AwaitingMergeDecision, E::ApprovalGranted { .. }) if guards.environment == Environment::Production => {
            Transition::to(
                S::AwaitingMergeDecision,
                vec![Action::CancelWaits, Action::AttemptMerge { approved: true }],
            )
        }
        (S::AwaitingMergeDecision, E::HealthRestored { .. }) => Transition::to(
            S::Idle,
            vec![
                Action::CancelWaits,
                Action::CloseChange {
                    reason: "health restored before merge".to_string(),
                },
                Action::Retire,
            ],
        ),
        (S::AwaitingMergeDecision, E::Timeout { wait: WaitKind::Approval }) => {
            Transition::abort(AbortReason::ApprovalTimedOut)
        }

        (S::Merged, E::HealthRestored { .. }) => Transition::to(S::RollbackComplete, vec![Action::CancelWaits]),
        (S::Merged, E::Timeout { wait: WaitKind::HealthConfirmation }) => {
            Transition::abort(AbortReason::HealthNotRestored)
        }

        (S::Abort, E::ResetRequested { .. }) => Transition::to(S::Idle, vec![Action::Retire]),
        // Audit echo of the abort itself
        (S::Abort, E::Abort { .. }) => Transition::to(S::Abort, Vec::new()),

        _ => return Err(not_applicable()),
    };

    debug_assert!(
        t.next == state || allowed_transitions(state).contains(&t.next),
        "table produced {state} -> {}",
        t.next
    );
    Ok(t)
}

/// States reachable from `from` in one transition
#[must_use]
pub fn allowed_transitions(from: FsmState) -> Vec<FsmState> {
    use FsmState::*;
    match from {
        Idle => vec![DegradationDetected, Abort],
        DegradationDetected => vec![CandidateResolved, Idle, Abort],
        CandidateResolved => vec![ChangeProposed, Abort],
        ChangeProposed => vec![AwaitingMergeDecision, Merged, Abort],
        AwaitingMergeDecision => vec![Merged, Idle, Abort],
        Merged => vec![RollbackComplete, Abort],
        RollbackComplete => vec![],
        Abort => vec![Idle],
    }
}

/// Check that `from -> to` is a legal edge
pub fn validate_transition(from: FsmState, to: FsmState) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollback_core::{ChangeId, ChangeRef};

    const STAGING: Guards = Guards {
        environment: Environment::Staging,
    };
    const PRODUCTION: Guards = Guards {
        environment: Environment::Production,
    };

    fn ci(outcome: CiOutcome) -> EventPayload {
        EventPayload::CiResult {
            change_id: ChangeId(7),
            outcome,
        }
    }

    #[test]
    fn staging_checks_success_attempts_merge() {
        let t = transition(FsmState::ChangeProposed, &ci(CiOutcome::Success), &STAGING).unwrap();
        assert_eq!(t.next, FsmState::AwaitingMergeDecision);
        assert!(t.actions.contains(&Action::AttemptMerge { approved: false }));
    }

    #[test]
    fn production_checks_success_requests_approval() {
        let t = transition(FsmState::ChangeProposed, &ci(CiOutcome::Success), &PRODUCTION).unwrap();
        assert!(t.actions.contains(&Action::RequestApproval));
        assert!(!t.actions.iter().any(|a| matches!(a, Action::AttemptMerge { .. })));
    }

    #[test]
    fn approval_ignored_in_staging() {
        let approval = EventPayload::ApprovalGranted {
            approver: "ops".into(),
        };
        assert!(transition(FsmState::AwaitingMergeDecision, &approval, &STAGING).is_err());
        let t = transition(FsmState::AwaitingMergeDecision, &approval, &PRODUCTION).unwrap();
        assert_eq!(t.actions.last(), Some(&Action::AttemptMerge { approved: true }));
    }

    #[test]
    fn checks_failure_aborts_with_reason() {
        let t = transition(FsmState::ChangeProposed, &ci(CiOutcome::Failure), &STAGING).unwrap();
        assert_eq!(t.next, FsmState::Abort);
        assert!(t.actions.contains(&Action::Escalate {
            reason: AbortReason::ChecksFailed
        }));
    }

    #[test]
    fn terminal_states_ignore_failures() {
        let failed = EventPayload::Failed {
            reason: AbortReason::ChecksFailed,
        };
        assert!(transition(FsmState::RollbackComplete, &failed, &STAGING).is_err());
        assert!(transition(FsmState::Abort, &failed, &STAGING).is_err());
    }

    #[test]
    fn change_created_only_after_candidate() {
        let created = EventPayload::ChangeCreated {
            change: ChangeRef {
                id: ChangeId(1),
                head_branch: "rollback/x/y".into(),
                url: None,
            },
        };
        assert!(transition(FsmState::DegradationDetected, &created, &STAGING).is_err());
        assert_eq!(
            transition(FsmState::CandidateResolved, &created, &STAGING).unwrap().next,
            FsmState::ChangeProposed
        );
    }

    #[test]
    fn reset_only_from_abort() {
        let reset = EventPayload::ResetRequested {
            operator: "ops".into(),
        };
        assert_eq!(transition(FsmState::Abort, &reset, &STAGING).unwrap().next, FsmState::Idle);
        assert!(transition(FsmState::Merged, &reset, &STAGING).is_err());
    }

    #[test]
    fn validate_edges() {
        assert!(validate_transition(FsmState::Merged, FsmState::RollbackComplete).is_ok());
        assert!(validate_transition(FsmState::RollbackComplete, FsmState::Idle).is_err());
    }
}
