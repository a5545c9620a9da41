//! Event definitions
//!
//! Events are immutable facts. Every event carries the attempt's correlation
//! id, a bus-assigned sequence and a timestamp; handlers dedupe on
//! `(correlation_id, kind, sequence)`.

use crate::error::{AbortReason, Escalation};
use crate::types::{AppTarget, Candidate, ChangeId, ChangeRef, CorrelationId, HealthSample, SampleWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of checks on a proposed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiOutcome {
    Success,
    Failure,
}

/// A bounded wait owned by an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    CandidateSearch,
    CheckCompletion,
    Approval,
    HealthConfirmation,
}

impl WaitKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitKind::CandidateSearch => "candidate_search",
            WaitKind::CheckCompletion => "check_completion",
            WaitKind::Approval => "approval",
            WaitKind::HealthConfirmation => "health_confirmation",
        }
    }
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// First shortage sample of an episode
    DegradationDetected { app: AppTarget, sample: HealthSample },
    /// Three consecutive shortage samples
    DegradationConfirmed {
        app: AppTarget,
        current_revision: String,
        samples: SampleWindow,
    },
    CandidateResolved { candidate: Candidate },
    NoCandidateFound { examined: usize },
    ChangeCreated { change: ChangeRef },
    CiResult { change_id: ChangeId, outcome: CiOutcome },
    MergeCompleted { change_id: ChangeId, already_merged: bool },
    HealthRestored { sustained_secs: u64 },
    ApprovalGranted { approver: String },
    Timeout { wait: WaitKind },
    Failed { reason: AbortReason },
    EmergencyStop { detail: String },
    ResetRequested { operator: String },
    /// Audit record of an attempt entering `Abort`
    Abort { reason: AbortReason, escalation: Escalation },
}

/// Discriminant of [`EventPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DegradationDetected,
    DegradationConfirmed,
    CandidateResolved,
    NoCandidateFound,
    ChangeCreated,
    CiResult,
    MergeCompleted,
    HealthRestored,
    ApprovalGranted,
    Timeout,
    Failed,
    EmergencyStop,
    ResetRequested,
    Abort,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DegradationDetected => "degradation_detected",
            EventKind::DegradationConfirmed => "degradation_confirmed",
            EventKind::CandidateResolved => "candidate_resolved",
            EventKind::NoCandidateFound => "no_candidate_found",
            EventKind::ChangeCreated => "change_created",
            EventKind::CiResult => "ci_result",
            EventKind::MergeCompleted => "merge_completed",
            EventKind::HealthRestored => "health_restored",
            EventKind::ApprovalGranted => "approval_granted",
            EventKind::Timeout => "timeout",
            EventKind::Failed => "failed",
            EventKind::EmergencyStop => "emergency_stop",
            EventKind::ResetRequested => "reset_requested",
            EventKind::Abort => "abort",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DegradationDetected { .. } => EventKind::DegradationDetected,
            Self::DegradationConfirmed { .. } => EventKind::DegradationConfirmed,
            Self::CandidateResolved { .. } => EventKind::CandidateResolved,
            Self::NoCandidateFound { .. } => EventKind::NoCandidateFound,
            Self::ChangeCreated { .. } => EventKind::ChangeCreated,
            Self::CiResult { .. } => EventKind::CiResult,
            Self::MergeCompleted { .. } => EventKind::MergeCompleted,
            Self::HealthRestored { .. } => EventKind::HealthRestored,
            Self::ApprovalGranted { .. } => EventKind::ApprovalGranted,
            Self::Timeout { .. } => EventKind::Timeout,
            Self::Failed { .. } => EventKind::Failed,
            Self::EmergencyStop { .. } => EventKind::EmergencyStop,
            Self::ResetRequested { .. } => EventKind::ResetRequested,
            Self::Abort { .. } => EventKind::Abort,
        }
    }

    /// Emitted to the external audit sink
    #[must_use]
    pub fn is_audit(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::DegradationDetected
                | EventKind::DegradationConfirmed
                | EventKind::CandidateResolved
                | EventKind::NoCandidateFound
                | EventKind::ChangeCreated
                | EventKind::MergeCompleted
                | EventKind::HealthRestored
                | EventKind::Abort
        )
    }
}

/// Dedupe key of an applied event within one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub kind: EventKind,
    pub sequence: u64,
}

/// An event as delivered by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub correlation_id: CorrelationId,
    /// Assigned by the bus on publish; zero before that
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Create an unpublished event
    #[must_use]
    pub fn new(correlation_id: CorrelationId, timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            correlation_id,
            sequence: 0,
            timestamp,
            payload,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey {
            kind: self.kind(),
            sequence: self.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_flat() {
        let event = Event::new(
            CorrelationId::new(),
            Utc::now(),
            EventPayload::Timeout { wait: WaitKind::Approval },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["wait"], "approval");
        assert!(json.get("correlation_id").is_some());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn keys_differ_by_sequence() {
        let mut a = Event::new(CorrelationId::new(), Utc::now(), EventPayload::HealthRestored { sustained_secs: 60 });
        let mut b = a.clone();
        a.sequence = 1;
        b.sequence = 2;
        assert_ne!(a.key(), b.key());
        assert_eq!(a.kind(), EventKind::HealthRestored);
    }

    #[test]
    fn audit_kinds() {
        assert!(EventPayload::NoCandidateFound { examined: 3 }.is_audit());
        assert!(!EventPayload::Timeout { wait: WaitKind::Approval }.is_audit());
    }
}
