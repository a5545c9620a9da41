//! Merge-gating invariants
//!
//! Eight named predicates evaluated against freshly fetched collaborator
//! state immediately before a merge decision:
//!
//! | Id | Predicate |
//! |----|-----------|
//! | I1 | environment is staging |
//! | I2 | health status is degraded right now |
//! | I3 | available replicas below desired right now |
//! | I4 | three consecutive shortage samples, including a fresh one |
//! | I5 | candidate uptime at or above threshold (or checks-passed fallback) |
//! | I6 | checks on the proposal succeeded |
//! | I7 | exactly one open rollback proposal for the app and branch |
//! | I8 | proposal is mergeable |
//!
//! Inputs that cannot be fetched evaluate to `Unknown`, which blocks an
//! autonomous merge. Permission failures are returned to the caller.

use crate::config::EngineConfig;
use crate::error::{CallError, CollaboratorError};
use crate::ports::{ChangeState, ChangeStatus, CheckState, Collaborators, HealthReport};
use crate::retry::RetryPolicy;
use crate::telemetry;
use crate::types::{Environment, HealthSample, HealthStatus, ReplicaStatus, RollbackAttempt, SampleWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The eight merge-gating invariants
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantId {
    StagingEnvironment,
    StillDegraded,
    ReplicasShort,
    PersistentShortage,
    CandidateStable,
    ChecksPassed,
    SingleProposal,
    Mergeable,
}

impl InvariantId {
    /// All invariants in report order
    pub const ALL: [InvariantId; 8] = [
        InvariantId::StagingEnvironment,
        InvariantId::StillDegraded,
        InvariantId::ReplicasShort,
        InvariantId::PersistentShortage,
        InvariantId::CandidateStable,
        InvariantId::ChecksPassed,
        InvariantId::SingleProposal,
        InvariantId::Mergeable,
    ];

    /// Position in [`InvariantReport::results`]
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short code (`I1`..`I8`)
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            InvariantId::StagingEnvironment => "I1",
            InvariantId::StillDegraded => "I2",
            InvariantId::ReplicasShort => "I3",
            InvariantId::PersistentShortage => "I4",
            InvariantId::CandidateStable => "I5",
            InvariantId::ChecksPassed => "I6",
            InvariantId::SingleProposal => "I7",
            InvariantId::Mergeable => "I8",
        }
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            InvariantId::StagingEnvironment => "environment is staging",
            InvariantId::StillDegraded => "health status is degraded",
            InvariantId::ReplicasShort => "available replicas below desired",
            InvariantId::PersistentShortage => "three consecutive shortage samples",
            InvariantId::CandidateStable => "candidate historically stable",
            InvariantId::ChecksPassed => "checks on proposal succeeded",
            InvariantId::SingleProposal => "exactly one open rollback proposal",
            InvariantId::Mergeable => "proposal is mergeable",
        }
    }
}

impl fmt::Display for InvariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Result of one invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvariantOutcome {
    Pass,
    Fail,
    /// Input could not be fetched
    Unknown,
}

impl From<bool> for InvariantOutcome {
    fn from(value: bool) -> Self {
        if value {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

impl From<Option<bool>> for InvariantOutcome {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Self::Unknown, Self::from)
    }
}

/// Evidence behind the candidate stability check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UptimeEvidence {
    /// Uptime source answered
    Measured(f64),
    /// Uptime source unavailable; candidate checks are the only signal
    Unavailable { ci_passed: bool },
    /// No candidate recorded
    Missing,
}

/// Freshly observed inputs to the invariants
///
/// `None` means the input could not be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    pub environment: Environment,
    pub health: Option<HealthStatus>,
    pub replicas: Option<ReplicaStatus>,
    /// Recorded samples plus the fresh one
    pub samples: SampleWindow,
    pub uptime: UptimeEvidence,
    pub uptime_threshold: f64,
    pub change: Option<ChangeStatus>,
    /// Open rollback proposals for the app and branch
    pub open_proposals: Option<usize>,
}

/// Results of all eight invariants at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantReport {
    pub results: [InvariantOutcome; 8],
    pub evaluated_at: DateTime<Utc>,
    /// Candidate stability passed on the checks-passed fallback
    pub uptime_fallback: bool,
}

impl InvariantReport {
    /// Evaluate every invariant from observations, without I/O
    #[must_use]
    pub fn from_observations(obs: &Observations, evaluated_at: DateTime<Utc>) -> Self {
        let mut results = [InvariantOutcome::Unknown; 8];
        let mut set = |id: InvariantId, outcome: InvariantOutcome| results[id.index()] = outcome;

        set(InvariantId::StagingEnvironment, (obs.environment == Environment::Staging).into());
        set(InvariantId::StillDegraded, obs.health.map(|h| h == HealthStatus::Degraded).into());
        set(InvariantId::ReplicasShort, obs.replicas.map(|r| r.is_short()).into());
        set(InvariantId::PersistentShortage, obs.samples.is_persistently_short().into());

        let (stable, uptime_fallback) = match obs.uptime {
            UptimeEvidence::Measured(percent) => (InvariantOutcome::from(percent >= obs.uptime_threshold), false),
            UptimeEvidence::Unavailable { ci_passed } => (ci_passed.into(), ci_passed),
            UptimeEvidence::Missing => (InvariantOutcome::Fail, false),
        };
        set(InvariantId::CandidateStable, stable);

        set(InvariantId::ChecksPassed, obs.change.map(|c| c.checks == CheckState::Success).into());
        set(InvariantId::SingleProposal, obs.open_proposals.map(|n| n == 1).into());
        set(
            InvariantId::Mergeable,
            obs.change.map(|c| c.mergeable && c.state == ChangeState::Open).into(),
        );

        Self {
            results,
            evaluated_at,
            uptime_fallback,
        }
    }

    #[inline]
    #[must_use]
    pub fn outcome(&self, id: InvariantId) -> InvariantOutcome {
        self.results[id.index()]
    }

    #[inline]
    #[must_use]
    pub fn passed(&self, id: InvariantId) -> bool {
        self.outcome(id) == InvariantOutcome::Pass
    }

    /// All eight invariants pass
    #[must_use]
    pub fn can_auto_merge(&self) -> bool {
        self.results.iter().all(|r| *r == InvariantOutcome::Pass)
    }

    /// Invariants that did not pass (failed or unknown)
    #[must_use]
    pub fn failed(&self) -> Vec<InvariantId> {
        InvariantId::ALL.into_iter().filter(|id| !self.passed(*id)).collect()
    }

    /// Of `ids`, those that did not pass
    #[must_use]
    pub fn failed_among(&self, ids: &[InvariantId]) -> Vec<InvariantId> {
        ids.iter().copied().filter(|id| !self.passed(*id)).collect()
    }
}

/// Invariants an approved production merge still requires
pub const PRODUCTION_GATES: [InvariantId; 3] = [
    InvariantId::StillDegraded,
    InvariantId::ChecksPassed,
    InvariantId::Mergeable,
];

/// What to do with a proposal awaiting its merge decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Issue the merge now
    Merge,
    /// Health restored on its own; close without merging
    Close,
    /// Production without approval; park for a human
    AwaitApproval,
    /// A gating invariant failed for a reason other than restored health
    Abort(Vec<InvariantId>),
}

/// Decide the merge from a fresh report
///
/// `health_restored` is true only when the health source reports `healthy`
/// and no replicas are missing.
#[must_use]
pub fn decide_merge(
    environment: Environment,
    report: &InvariantReport,
    health_restored: bool,
    approved: bool,
) -> MergeDecision {
    if health_restored {
        return MergeDecision::Close;
    }
    match environment {
        Environment::Staging => {
            if report.can_auto_merge() {
                MergeDecision::Merge
            } else {
                MergeDecision::Abort(report.failed())
            }
        }
        Environment::Production if !approved => MergeDecision::AwaitApproval,
        Environment::Production => {
            let failed = report.failed_among(&PRODUCTION_GATES);
            if failed.is_empty() {
                MergeDecision::Merge
            } else {
                MergeDecision::Abort(failed)
            }
        }
    }
}

/// `healthy` status with every desired replica available
#[inline]
#[must_use]
pub fn is_restored(health: Option<HealthStatus>, replicas: Option<ReplicaStatus>) -> bool {
    health == Some(HealthStatus::Healthy) && replicas.is_some_and(|r| !r.is_short())
}

/// A fresh evaluation and the observations behind it
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub report: InvariantReport,
    pub health: Option<HealthReport>,
    pub replicas: Option<ReplicaStatus>,
    pub change: Option<ChangeStatus>,
    pub health_restored: bool,
}

/// Fetches fresh state and evaluates the invariants for an attempt
#[derive(Debug, Clone)]
pub struct InvariantEvaluator {
    collaborators: Collaborators,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
}

impl InvariantEvaluator {
    #[must_use]
    pub fn new(collaborators: Collaborators, config: Arc<EngineConfig>, retry: RetryPolicy) -> Self {
        Self {
            collaborators,
            config,
            retry,
        }
    }

    /// Evaluate all eight invariants against freshly fetched state
    pub async fn evaluate(&self, attempt: &RollbackAttempt, now: DateTime<Utc>) -> Result<Evaluation, CallError> {
        let app = &attempt.app;
        let c = &self.collaborators;

        let health = tolerate(self.retry.call("get_health", || c.health.get_health(&app.name)).await)?;
        let replicas = tolerate(
            self.retry
                .call("get_replica_status", || c.orchestrator.get_replica_status(&app.namespace, &app.workload))
                .await,
        )?;

        let mut samples = attempt.health_check_history.clone();
        if let Some(r) = replicas {
            samples.push(HealthSample::from_replicas(now, r));
        }

        let uptime = match &attempt.candidate {
            None => UptimeEvidence::Missing,
            Some(candidate) => {
                let window = self.config.uptime_window();
                let queried = self
                    .retry
                    .call("query_uptime", || c.uptime.query_uptime(&app.name, &candidate.revision, window))
                    .await;
                match queried {
                    Ok(Some(percent)) => UptimeEvidence::Measured(percent),
                    Ok(None) => UptimeEvidence::Unavailable { ci_passed: candidate.ci_passed },
                    Err(e) if matches!(e.source, CollaboratorError::PermissionDenied(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(correlation_id = %attempt.correlation_id, error = %e, "uptime unavailable during invariant evaluation");
                        UptimeEvidence::Unavailable { ci_passed: candidate.ci_passed }
                    }
                }
            }
        };

        let (change, open_proposals) = match &attempt.change_ref {
            None => (None, None),
            Some(change_ref) => {
                let status = tolerate(
                    self.retry
                        .call("get_check_status", || c.source_control.get_check_status(&app.repo, change_ref.id))
                        .await,
                )?;
                let label = app.label();
                let open = tolerate(
                    self.retry
                        .call("list_open_changes", || {
                            c.source_control.list_open_changes(&app.repo, &app.branch, &self.config.rollback_label)
                        })
                        .await,
                )?
                .map(|changes| changes.iter().filter(|s| s.has_label(&label)).count());
                (status, open)
            }
        };

        let observations = Observations {
            environment: app.environment,
            health: health.as_ref().map(|h| h.status),
            replicas,
            samples,
            uptime,
            uptime_threshold: self.config.uptime_threshold_percent,
            change,
            open_proposals,
        };
        let report = InvariantReport::from_observations(&observations, now);
        if report.uptime_fallback {
            tracing::warn!(
                correlation_id = %attempt.correlation_id,
                app = %app.name,
                "candidate stability accepted on checks alone; uptime source unavailable"
            );
            telemetry::record_uptime_fallback(&app.name, "invariants");
        }
        let health_restored = is_restored(observations.health, replicas);

        let failed: Vec<&str> = report.failed().iter().map(InvariantId::code).collect();
        tracing::info!(
            correlation_id = %attempt.correlation_id,
            app = %app.name,
            can_auto_merge = report.can_auto_merge(),
            ?failed,
            "invariants evaluated"
        );

        Ok(Evaluation {
            report,
            health,
            replicas,
            change,
            health_restored,
        })
    }
}

/// Fetch failures become unknown inputs; permission failures propagate
fn tolerate<T>(result: Result<T, CallError>) -> Result<Option<T>, CallError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if matches!(e.source, CollaboratorError::PermissionDenied(_)) => Err(e),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn short_window() -> SampleWindow {
        (0..3)
            .map(|i| HealthSample {
                timestamp: now() + chrono::Duration::seconds(i * 10),
                available: 1,
                desired: 3,
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn all_good() -> Observations {
        Observations {
            environment: Environment::Staging,
            health: Some(HealthStatus::Degraded),
            replicas: Some(ReplicaStatus { desired: 3, available: 1, ready: 1 }),
            samples: short_window(),
            uptime: UptimeEvidence::Measured(99.8),
            uptime_threshold: 99.0,
            change: Some(ChangeStatus {
                checks: CheckState::Success,
                mergeable: true,
                state: ChangeState::Open,
                approved: false,
            }),
            open_proposals: Some(1),
        }
    }

    #[test]
    fn all_pass_allows_auto_merge() {
        let report = InvariantReport::from_observations(&all_good(), now());
        assert!(report.can_auto_merge());
        assert!(report.failed().is_empty());
        assert_eq!(decide_merge(Environment::Staging, &report, false, false), MergeDecision::Merge);
    }

    #[test]
    fn each_single_failure_blocks() {
        let breakers: Vec<(InvariantId, Box<dyn Fn(&mut Observations)>)> = vec![
            (InvariantId::StagingEnvironment, Box::new(|o| o.environment = Environment::Production)),
            (InvariantId::StillDegraded, Box::new(|o| o.health = Some(HealthStatus::Progressing))),
            (InvariantId::ReplicasShort, Box::new(|o| o.replicas = Some(ReplicaStatus { desired: 3, available: 3, ready: 3 }))),
            (InvariantId::PersistentShortage, Box::new(|o| o.samples = SampleWindow::new())),
            (InvariantId::CandidateStable, Box::new(|o| o.uptime = UptimeEvidence::Measured(95.0))),
            (InvariantId::ChecksPassed, Box::new(|o| o.change.as_mut().unwrap().checks = CheckState::Failure)),
            (InvariantId::SingleProposal, Box::new(|o| o.open_proposals = Some(2))),
            (InvariantId::Mergeable, Box::new(|o| o.change.as_mut().unwrap().mergeable = false)),
        ];
        for (id, breaker) in breakers {
            let mut obs = all_good();
            breaker(&mut obs);
            let report = InvariantReport::from_observations(&obs, now());
            assert!(!report.can_auto_merge(), "{id} should block");
            assert_eq!(report.failed(), vec![id]);
        }
    }

    #[test]
    fn unknown_blocks_auto_merge() {
        let mut obs = all_good();
        obs.open_proposals = None;
        let report = InvariantReport::from_observations(&obs, now());
        assert_eq!(report.outcome(InvariantId::SingleProposal), InvariantOutcome::Unknown);
        assert!(!report.can_auto_merge());
    }

    #[test]
    fn uptime_fallback_is_flagged() {
        let mut obs = all_good();
        obs.uptime = UptimeEvidence::Unavailable { ci_passed: true };
        let report = InvariantReport::from_observations(&obs, now());
        assert!(report.passed(InvariantId::CandidateStable));
        assert!(report.uptime_fallback);
    }

    #[test]
    fn restored_health_closes_instead_of_merging() {
        let mut obs = all_good();
        obs.health = Some(HealthStatus::Healthy);
        obs.replicas = Some(ReplicaStatus { desired: 3, available: 3, ready: 3 });
        let report = InvariantReport::from_observations(&obs, now());
        assert!(!report.passed(InvariantId::StillDegraded));
        let restored = is_restored(obs.health, obs.replicas);
        assert_eq!(decide_merge(Environment::Staging, &report, restored, false), MergeDecision::Close);
        assert_eq!(decide_merge(Environment::Production, &report, restored, true), MergeDecision::Close);
    }

    #[test]
    fn non_healthy_non_degraded_aborts() {
        let mut obs = all_good();
        obs.health = Some(HealthStatus::Unknown);
        let report = InvariantReport::from_observations(&obs, now());
        let restored = is_restored(obs.health, obs.replicas);
        assert_eq!(
            decide_merge(Environment::Staging, &report, restored, false),
            MergeDecision::Abort(vec![InvariantId::StillDegraded])
        );
    }

    #[test]
    fn production_needs_approval() {
        let mut obs = all_good();
        obs.environment = Environment::Production;
        let report = InvariantReport::from_observations(&obs, now());
        assert_eq!(decide_merge(Environment::Production, &report, false, false), MergeDecision::AwaitApproval);
        assert_eq!(decide_merge(Environment::Production, &report, false, true), MergeDecision::Merge);

        obs.change.as_mut().unwrap().checks = CheckState::Failure;
        let report = InvariantReport::from_observations(&obs, now());
        assert_eq!(
            decide_merge(Environment::Production, &report, false, true),
            MergeDecision::Abort(vec![InvariantId::ChecksPassed])
        );
    }

    #[test]
    fn report_serializes_as_array() {
        let report = InvariantReport::from_observations(&all_good(), now());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"].as_array().unwrap().len(), 8);
        assert_eq!(json["results"][0], "pass");
    }
}
