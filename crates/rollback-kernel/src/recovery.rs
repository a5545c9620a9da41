//! Crash recovery
//!
//! On startup every recoverable attempt in the store gets exactly one worker:
//! - in-flight attempts older than `stale_after` are force-aborted and escalated
//! - attempts with persisted pending actions replay them, whatever their
//!   state (an `Abort` still owes its escalation, an `Idle` its close)
//! - everything else re-validates external state before resuming

use crate::controller::{EngineContext, WorkerRegistry, WorkerStart};
use chrono::{DateTime, Utc};
use rollback_core::{telemetry, Action, AppTarget, CorrelationId, FsmState, RollbackAttempt, StoreError};
use serde::Serialize;
use std::sync::Arc;

/// What recovery does with one attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RecoveryDecision {
    /// Re-validate external state for the current state, then resume
    Resume,
    /// Actions were persisted but not completed before the crash
    ReplayPending { actions: Vec<Action> },
    /// Too old to trust; abort with `stale on recovery`
    ForceAbort,
}

impl RecoveryDecision {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::ReplayPending { .. } => "replay_pending",
            Self::ForceAbort => "force_abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryEntry {
    pub correlation_id: CorrelationId,
    pub app: AppTarget,
    pub state: FsmState,
    pub age_secs: i64,
    #[serde(flatten)]
    pub decision: RecoveryDecision,
}

/// Decisions for every recoverable attempt found at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryPlan {
    pub entries: Vec<RecoveryEntry>,
}

impl RecoveryPlan {
    /// Decide per attempt; finished attempts without pending actions are skipped
    #[must_use]
    pub fn build(attempts: &[RollbackAttempt], now: DateTime<Utc>, stale_after: chrono::Duration) -> Self {
        let entries = attempts
            .iter()
            .filter(|a| a.needs_recovery())
            .map(|attempt| {
                let age = attempt.age(now);
                let decision = if attempt.is_in_flight() && age > stale_after {
                    RecoveryDecision::ForceAbort
                } else if attempt.pending_actions.is_empty() {
                    RecoveryDecision::Resume
                } else {
                    RecoveryDecision::ReplayPending {
                        actions: attempt.pending_actions.clone(),
                    }
                };
                RecoveryEntry {
                    correlation_id: attempt.correlation_id,
                    app: attempt.app.clone(),
                    state: attempt.fsm_state,
                    age_secs: age.num_seconds(),
                    decision,
                }
            })
            .collect();
        Self { entries }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attempts resumed (including pending replays)
    #[must_use]
    pub fn resumed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.decision != RecoveryDecision::ForceAbort)
            .count()
    }

    #[must_use]
    pub fn force_aborted(&self) -> usize {
        self.entries.len() - self.resumed()
    }

    #[must_use]
    pub fn decision_for(&self, id: CorrelationId) -> Option<&RecoveryDecision> {
        self.entries.iter().find(|e| e.correlation_id == id).map(|e| &e.decision)
    }
}

pub(crate) struct RecoveryManager {
    ctx: Arc<EngineContext>,
}

impl RecoveryManager {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Spawn one worker per recoverable attempt
    pub(crate) async fn recover(&self, registry: &Arc<WorkerRegistry>) -> Result<RecoveryPlan, StoreError> {
        let attempts = self.ctx.store.list_recoverable().await?;
        let plan = RecoveryPlan::build(&attempts, self.ctx.now(), self.ctx.config.stale_after());

        for attempt in attempts {
            let Some(decision) = plan.decision_for(attempt.correlation_id) else {
                continue;
            };
            let start = match decision {
                RecoveryDecision::ForceAbort => {
                    tracing::warn!(
                        correlation_id = %attempt.correlation_id,
                        app = %attempt.app.name,
                        state = %attempt.fsm_state,
                        "attempt too old to resume; force-aborting"
                    );
                    WorkerStart::ForceAbort
                }
                RecoveryDecision::Resume | RecoveryDecision::ReplayPending { .. } => {
                    tracing::info!(
                        correlation_id = %attempt.correlation_id,
                        app = %attempt.app.name,
                        state = %attempt.fsm_state,
                        decision = decision.as_str(),
                        "resuming attempt"
                    );
                    WorkerStart::Resume
                }
            };
            telemetry::record_recovery(decision.as_str());
            registry.spawn(&self.ctx, attempt, start);
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollback_core::{AbortReason, Environment, SampleWindow};

    fn attempt(state: FsmState, created_at: DateTime<Utc>) -> RollbackAttempt {
        let app = AppTarget {
            name: "checkout".into(),
            environment: Environment::Staging,
            repo: "org/checkout".into(),
            branch: "main".into(),
            namespace: "shop".into(),
            workload: "checkout".into(),
        };
        let mut attempt = RollbackAttempt::new(CorrelationId::new(), app, "ccc", SampleWindow::new(), created_at);
        attempt.enter(state, created_at);
        attempt
    }

    #[test]
    fn stale_attempts_are_force_aborted() {
        let now = Utc::now();
        let fresh = attempt(FsmState::ChangeProposed, now - chrono::Duration::hours(2));
        let stale = attempt(FsmState::ChangeProposed, now - chrono::Duration::hours(30));
        let plan = RecoveryPlan::build(&[fresh.clone(), stale.clone()], now, chrono::Duration::hours(24));

        assert_eq!(plan.decision_for(fresh.correlation_id), Some(&RecoveryDecision::Resume));
        assert_eq!(plan.decision_for(stale.correlation_id), Some(&RecoveryDecision::ForceAbort));
        assert_eq!(plan.resumed(), 1);
        assert_eq!(plan.force_aborted(), 1);
    }

    #[test]
    fn pending_actions_are_replayed() {
        let now = Utc::now();
        let mut a = attempt(FsmState::CandidateResolved, now - chrono::Duration::minutes(5));
        a.pending_actions = vec![Action::ProposeChange];
        let plan = RecoveryPlan::build(std::slice::from_ref(&a), now, chrono::Duration::hours(24));
        assert_eq!(
            plan.decision_for(a.correlation_id),
            Some(&RecoveryDecision::ReplayPending {
                actions: vec![Action::ProposeChange]
            })
        );
    }

    #[test]
    fn finished_attempts_are_skipped() {
        let now = Utc::now();
        let done = attempt(FsmState::RollbackComplete, now);
        let aborted = attempt(FsmState::Abort, now);
        let mut retired = attempt(FsmState::DegradationDetected, now);
        retired.retired = true;
        assert!(RecoveryPlan::build(&[done, aborted, retired], now, chrono::Duration::hours(24)).is_empty());
    }

    #[test]
    fn unfinished_actions_are_replayed_outside_flight() {
        let now = Utc::now();
        let escalate = vec![
            Action::CancelWaits,
            Action::Escalate {
                reason: AbortReason::CandidateSearchTimedOut,
            },
        ];
        let close = vec![
            Action::CancelWaits,
            Action::CloseChange {
                reason: "health restored before merge".into(),
            },
            Action::Retire,
        ];
        // Old enough to force-abort if it were still in flight
        let mut aborted = attempt(FsmState::Abort, now - chrono::Duration::hours(30));
        aborted.pending_actions.clone_from(&escalate);
        let mut idle = attempt(FsmState::Idle, now - chrono::Duration::minutes(20));
        idle.pending_actions.clone_from(&close);

        let plan = RecoveryPlan::build(&[aborted.clone(), idle.clone()], now, chrono::Duration::hours(24));
        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.decision_for(aborted.correlation_id),
            Some(&RecoveryDecision::ReplayPending { actions: escalate })
        );
        assert_eq!(
            plan.decision_for(idle.correlation_id),
            Some(&RecoveryDecision::ReplayPending { actions: close })
        );
        assert_eq!(plan.force_aborted(), 0);
    }
}
