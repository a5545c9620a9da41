//! Core types for the rollback engine
//!
//! Defines the data model shared by every component:
//! - Identifiers (correlation ids, change ids)
//! - Monitored application targets
//! - Health samples and the 3-slot sample window
//! - FSM states and the side-effecting actions a transition asks for
//! - The `RollbackAttempt` aggregate and the selected `Candidate`
//! - The `Clock` port used for every wall-clock read

use crate::error::{AbortReason, Escalation};
use crate::events::EventKey;
use crate::invariants::InvariantReport;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Number of consecutive samples required to call a degradation persistent.
pub const SAMPLE_WINDOW: usize = 3;

/// Unique rollback attempt identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Ulid);

impl CorrelationId {
    /// Generate new correlation ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Deployment environment of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Autonomous merges allowed when every invariant holds
    Staging,
    /// Human sign-off always required
    Production,
}

impl Environment {
    /// Lowercase name used in labels and logs
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored application and where its deployment is declared
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppTarget {
    /// Application name as known to the health source
    pub name: String,
    /// Deployment environment
    pub environment: Environment,
    /// Repository holding the deployment declaration (`owner/name`)
    pub repo: String,
    /// Branch rollback proposals target
    pub branch: String,
    /// Orchestrator namespace of the workload
    pub namespace: String,
    /// Orchestrator workload name
    pub workload: String,
}

impl AppTarget {
    /// Key identifying the app across attempts (`name@environment`)
    #[inline]
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.environment)
    }

    /// Label attached to every proposal for this app
    #[inline]
    #[must_use]
    pub fn label(&self) -> String {
        format!("app:{}", self.name)
    }
}

/// Aggregate health reported by the deployment-health source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Progressing,
    Suspended,
    Missing,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Progressing => "progressing",
            HealthStatus::Suspended => "suspended",
            HealthStatus::Missing => "missing",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Replica counts reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub desired: u32,
    pub available: u32,
    pub ready: u32,
}

impl ReplicaStatus {
    /// Fewer replicas available than desired
    #[inline]
    #[must_use]
    pub fn is_short(&self) -> bool {
        self.available < self.desired
    }
}

/// One health observation of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub available: u32,
    pub desired: u32,
}

impl HealthSample {
    /// Build a sample from a replica reading
    #[inline]
    #[must_use]
    pub fn from_replicas(timestamp: DateTime<Utc>, replicas: ReplicaStatus) -> Self {
        Self {
            timestamp,
            available: replicas.available,
            desired: replicas.desired,
        }
    }

    /// `available < desired`
    #[inline]
    #[must_use]
    pub fn is_shortage(&self) -> bool {
        self.available < self.desired
    }
}

/// Bounded ring buffer of the most recent health samples
///
/// Never holds more than [`SAMPLE_WINDOW`] entries; pushing into a full
/// window evicts the oldest sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<HealthSample>", into = "Vec<HealthSample>")]
pub struct SampleWindow {
    samples: VecDeque<HealthSample>,
}

impl SampleWindow {
    /// Create empty window
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, evicting the oldest if full
    pub fn push(&mut self, sample: HealthSample) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Remove all samples
    #[inline]
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.samples.len() == SAMPLE_WINDOW
    }

    /// Window holds exactly [`SAMPLE_WINDOW`] samples and every one is a shortage
    #[must_use]
    pub fn is_persistently_short(&self) -> bool {
        self.is_full() && self.samples.iter().all(HealthSample::is_shortage)
    }

    /// Most recent sample
    #[inline]
    #[must_use]
    pub fn latest(&self) -> Option<&HealthSample> {
        self.samples.back()
    }

    /// Samples oldest-first
    pub fn iter(&self) -> impl Iterator<Item = &HealthSample> {
        self.samples.iter()
    }

    /// Copy of the samples oldest-first
    #[must_use]
    pub fn to_vec(&self) -> Vec<HealthSample> {
        self.samples.iter().copied().collect()
    }
}

impl From<Vec<HealthSample>> for SampleWindow {
    fn from(samples: Vec<HealthSample>) -> Self {
        let mut window = Self::new();
        for sample in samples {
            window.push(sample);
        }
        window
    }
}

impl From<SampleWindow> for Vec<HealthSample> {
    fn from(window: SampleWindow) -> Self {
        window.samples.into_iter().collect()
    }
}

/// Number of a proposed change on the source-control host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeId(pub u64);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A proposed change created for an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    pub id: ChangeId,
    pub head_branch: String,
    pub url: Option<String>,
}

/// A prior revision selected as rollback target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub revision: String,
    pub commit_message: String,
    pub commit_author: String,
    pub commit_date: DateTime<Utc>,
    /// Uptime while the revision was live; `None` when the source was unavailable
    pub upstream_uptime_percent: Option<f64>,
    pub ci_passed: bool,
    /// Selected on "checks passed" alone because uptime was unavailable
    pub uptime_fallback: bool,
}

/// States of one rollback attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsmState {
    Idle,
    DegradationDetected,
    CandidateResolved,
    ChangeProposed,
    AwaitingMergeDecision,
    Merged,
    RollbackComplete,
    Abort,
}

impl FsmState {
    /// All states, in lifecycle order
    pub const ALL: [FsmState; 8] = [
        FsmState::Idle,
        FsmState::DegradationDetected,
        FsmState::CandidateResolved,
        FsmState::ChangeProposed,
        FsmState::AwaitingMergeDecision,
        FsmState::Merged,
        FsmState::RollbackComplete,
        FsmState::Abort,
    ];

    /// No further transitions without external reset
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, FsmState::RollbackComplete | FsmState::Abort)
    }

    /// Neither idle nor terminal: an attempt in flight
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal() && *self != FsmState::Idle
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Idle => "idle",
            FsmState::DegradationDetected => "degradation_detected",
            FsmState::CandidateResolved => "candidate_resolved",
            FsmState::ChangeProposed => "change_proposed",
            FsmState::AwaitingMergeDecision => "awaiting_merge_decision",
            FsmState::Merged => "merged",
            FsmState::RollbackComplete => "rollback_complete",
            FsmState::Abort => "abort",
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect requested by a transition
///
/// Actions are persisted with the state that requested them and must be
/// safe to execute more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Start the bounded candidate search
    ResolveCandidate,
    /// Watch for sustained independent recovery
    WatchRecovery,
    /// Create (or adopt) the upstream rollback proposal
    ProposeChange,
    /// Wait for checks on the proposal
    AwaitChecks,
    /// Re-evaluate invariants and merge, close or abort
    AttemptMerge { approved: bool },
    /// Ask a human to approve the proposal and wait for the signal
    RequestApproval,
    /// Watch post-merge health until confirmed or timed out
    ConfirmHealth,
    /// Close the proposal without merging
    CloseChange { reason: String },
    /// Cancel every wait owned by the attempt
    CancelWaits,
    /// Record and publish the escalation for an abort
    Escalate { reason: AbortReason },
    /// Retire the attempt (returned to idle)
    Retire,
}

/// Aggregate root: one rollback attempt per degradation episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAttempt {
    pub correlation_id: CorrelationId,
    pub app: AppTarget,
    pub current_revision: String,
    /// Set only once the attempt reached `CandidateResolved`
    pub target_revision: Option<String>,
    pub candidate: Option<Candidate>,
    pub fsm_state: FsmState,
    pub state_entered_at: DateTime<Utc>,
    pub health_check_history: SampleWindow,
    pub change_ref: Option<ChangeRef>,
    pub invariant_results: Option<InvariantReport>,
    pub pending_actions: Vec<Action>,
    pub applied_events: BTreeSet<EventKey>,
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub abort_reason: Option<AbortReason>,
    pub escalation: Option<Escalation>,
    pub retired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal: bool,
}

impl RollbackAttempt {
    /// Create a fresh attempt in `Idle`
    #[must_use]
    pub fn new(
        correlation_id: CorrelationId,
        app: AppTarget,
        current_revision: impl Into<String>,
        history: SampleWindow,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            app,
            current_revision: current_revision.into(),
            target_revision: None,
            candidate: None,
            fsm_state: FsmState::Idle,
            state_entered_at: now,
            health_check_history: history,
            change_ref: None,
            invariant_results: None,
            pending_actions: Vec::new(),
            applied_events: BTreeSet::new(),
            approval_requested_at: None,
            abort_reason: None,
            escalation: None,
            retired: false,
            created_at: now,
            updated_at: now,
            terminal: false,
        }
    }

    /// Advance `updated_at`, keeping it strictly increasing
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.updated_at + ChronoDuration::microseconds(1);
        self.updated_at = if now > self.updated_at { now } else { floor };
    }

    /// Move to `state`, recording when it was entered
    pub fn enter(&mut self, state: FsmState, now: DateTime<Utc>) {
        if state != self.fsm_state {
            self.state_entered_at = now;
        }
        self.fsm_state = state;
        self.terminal = state.is_terminal();
        self.touch(now);
    }

    /// Record the resolved candidate as rollback target
    pub fn set_candidate(&mut self, candidate: Candidate) {
        self.target_revision = Some(candidate.revision.clone());
        self.candidate = Some(candidate);
    }

    /// Attempt still needs a worker
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.fsm_state.is_in_flight() && !self.retired
    }

    /// Attempt needs a worker after a restart: still in flight, or the
    /// actions of its last transition never completed. The second case
    /// covers `Abort` awaiting its escalation and `Idle` awaiting close.
    #[inline]
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.is_in_flight() || !self.pending_actions.is_empty()
    }

    /// Time since creation
    #[inline]
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.created_at
    }

    /// Time spent in the current state
    #[inline]
    #[must_use]
    pub fn time_in_state(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.state_entered_at
    }

    /// Highest event sequence this attempt has applied
    #[must_use]
    pub fn max_sequence(&self) -> u64 {
        self.applied_events.iter().map(|k| k.sequence).max().unwrap_or(0)
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by `tokio::time`
///
/// Follows the tokio clock, so a paused test runtime moves it
/// deterministically together with every bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Clock reading `base` at the current tokio instant
    #[must_use]
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.origin.elapsed()).unwrap_or(ChronoDuration::zero());
        self.base + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(secs: i64, available: u32, desired: u32) -> HealthSample {
        HealthSample {
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            available,
            desired,
        }
    }

    fn app() -> AppTarget {
        AppTarget {
            name: "checkout".to_string(),
            environment: Environment::Staging,
            repo: "acme/deploy".to_string(),
            branch: "main".to_string(),
            namespace: "shop".to_string(),
            workload: "checkout".to_string(),
        }
    }

    #[test]
    fn sample_window_evicts_oldest() {
        let mut window = SampleWindow::new();
        for i in 0..5 {
            window.push(sample(i, 1, 3));
        }
        assert_eq!(window.len(), SAMPLE_WINDOW);
        assert_eq!(window.iter().next().unwrap().timestamp.timestamp(), 2);
        assert_eq!(window.latest().unwrap().timestamp.timestamp(), 4);
    }

    #[test]
    fn sample_window_needs_full_shortage() {
        let mut window = SampleWindow::new();
        window.push(sample(0, 1, 3));
        window.push(sample(10, 1, 3));
        assert!(!window.is_persistently_short());

        window.push(sample(20, 3, 3));
        assert!(!window.is_persistently_short());

        window.push(sample(30, 1, 3));
        window.push(sample(40, 1, 3));
        assert!(!window.is_persistently_short());
        window.push(sample(50, 0, 3));
        assert!(window.is_persistently_short());
    }

    #[test]
    fn sample_window_serde_keeps_bound() {
        let json = serde_json::to_string(&vec![
            sample(0, 1, 3),
            sample(1, 1, 3),
            sample(2, 1, 3),
            sample(3, 1, 3),
        ])
        .unwrap();
        let window: SampleWindow = serde_json::from_str(&json).unwrap();
        assert_eq!(window.len(), SAMPLE_WINDOW);
    }

    #[test]
    fn correlation_id_round_trips_through_display() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn attempt_touch_is_monotonic() {
        let now = Utc::now();
        let mut attempt = RollbackAttempt::new(CorrelationId::new(), app(), "abc", SampleWindow::new(), now);
        let before = attempt.updated_at;
        attempt.touch(now - ChronoDuration::seconds(30));
        assert!(attempt.updated_at > before);
    }

    #[test]
    fn attempt_enter_tracks_terminal() {
        let now = Utc::now();
        let mut attempt = RollbackAttempt::new(CorrelationId::new(), app(), "abc", SampleWindow::new(), now);
        attempt.enter(FsmState::DegradationDetected, now);
        assert!(attempt.is_in_flight());
        attempt.enter(FsmState::Abort, now);
        assert!(attempt.terminal);
        assert!(!attempt.is_in_flight());
    }

    #[test]
    fn unfinished_actions_need_recovery_in_any_state() {
        let now = Utc::now();
        let mut attempt = RollbackAttempt::new(CorrelationId::new(), app(), "abc", SampleWindow::new(), now);
        attempt.enter(FsmState::Abort, now);
        assert!(!attempt.needs_recovery());

        attempt.pending_actions = vec![Action::CancelWaits, Action::Retire];
        assert!(attempt.needs_recovery());
        attempt.enter(FsmState::Idle, now);
        assert!(attempt.needs_recovery());

        attempt.pending_actions.clear();
        assert!(!attempt.needs_recovery());
    }

    #[test]
    fn state_classification() {
        assert!(FsmState::RollbackComplete.is_terminal());
        assert!(FsmState::Abort.is_terminal());
        assert!(!FsmState::Idle.is_in_flight());
        assert!(FsmState::Merged.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let base = Utc::now();
        let clock = TokioClock::starting_at(base);
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert_eq!((clock.now() - base).num_seconds(), 90);
    }
}
