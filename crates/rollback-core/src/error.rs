//! Error types for the rollback engine
//!
//! Provides the error taxonomy for:
//! - Collaborator calls (transient, permission, validation, conflict)
//! - State persistence
//! - Configuration loading
//! - Structured abort reasons and the escalation record every abort produces

use crate::invariants::{InvariantId, InvariantReport};
use crate::types::{CorrelationId, Environment, FsmState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure reported by a collaborator (source control, orchestrator, health, uptime)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CollaboratorError {
    /// Network failure or rate limit
    #[error("transient failure: {0}")]
    Transient(String),

    /// Access denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    Validation(String),

    /// Concurrent modification of the target
    #[error("conflicting modification: {0}")]
    Conflict(String),

    /// Referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

/// Retry class of a collaborator failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permission,
    Validation,
    Conflict,
    NotFound,
}

impl CollaboratorError {
    /// Classify for the retry policy
    #[inline]
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::PermissionDenied(_) => ErrorClass::Permission,
            Self::Validation(_) => ErrorClass::Validation,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::NotFound(_) => ErrorClass::NotFound,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Conflict)
    }
}

/// A collaborator call that failed after the retry policy gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct CallError {
    /// Collaborator operation name
    pub operation: &'static str,
    /// Calls made, including the first
    pub attempts: u32,
    /// Last failure
    #[source]
    pub source: CollaboratorError,
}

/// State store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Attempt not found
    #[error("attempt not found: {0}")]
    NotFound(CorrelationId),

    /// Write older than the stored record
    #[error("stale write rejected for {0}")]
    Stale(CorrelationId),

    /// Underlying I/O failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed but semantically invalid
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    /// Collaborator call failed
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CallError),

    /// Persistence failed
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Attempt unknown to the engine
    #[error("unknown attempt: {0}")]
    UnknownAttempt(CorrelationId),

    /// Operator command not valid in the attempt's current state
    #[error("cannot {command} attempt {correlation_id} in state {state}")]
    InvalidCommand {
        correlation_id: CorrelationId,
        state: FsmState,
        command: &'static str,
    },

    /// Engine is shutting down
    #[error("engine stopped")]
    Stopped,
}

impl RollbackError {
    /// Check if error requires human intervention
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::Collaborator(CallError {
                source: CollaboratorError::PermissionDenied(_) | CollaboratorError::Validation(_),
                ..
            })
        )
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Collaborator(e) => e.source.is_retryable(),
            _ => false,
        }
    }
}

/// Why an attempt was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// Candidate search exceeded its time budget
    CandidateSearchTimedOut,
    /// Search window exhausted without an acceptable candidate
    NoCandidateFound { examined: usize },
    /// Checks on the proposal failed
    ChecksFailed,
    /// Checks on the proposal did not complete in time
    ChecksTimedOut,
    /// Merge-gating invariants failed
    InvariantsFailed { failed: Vec<InvariantId> },
    /// No human approval arrived in time
    ApprovalTimedOut,
    /// Health did not restore after the merge
    HealthNotRestored,
    /// Health degraded again after having restored post-merge
    DegradationAfterMerge,
    /// Proposal was closed outside the engine
    ProposalClosedExternally,
    /// Collaborator denied access
    PermissionDenied { operation: String, detail: String },
    /// Engine sent a malformed request
    InvalidRequest { operation: String, detail: String },
    /// Concurrent modification persisted after a refresh
    ConflictUnresolved { operation: String, detail: String },
    /// Collaborator kept failing after retries
    CollaboratorFailure { operation: String, detail: String },
    /// Attempt found too old on restart
    StaleOnRecovery,
    /// Critical violation, operator or engine initiated
    EmergencyStop { detail: String },
}

impl AbortReason {
    /// Map a failed collaborator call to an abort reason
    #[must_use]
    pub fn from_call(err: &CallError) -> Self {
        let operation = err.operation.to_string();
        match &err.source {
            CollaboratorError::PermissionDenied(detail) => Self::PermissionDenied {
                operation,
                detail: detail.clone(),
            },
            CollaboratorError::Validation(detail) => Self::InvalidRequest {
                operation,
                detail: detail.clone(),
            },
            CollaboratorError::Conflict(detail) => Self::ConflictUnresolved {
                operation,
                detail: detail.clone(),
            },
            CollaboratorError::Transient(detail) | CollaboratorError::NotFound(detail) => {
                Self::CollaboratorFailure {
                    operation,
                    detail: detail.clone(),
                }
            }
        }
    }

    /// Raises a distinct security escalation
    #[inline]
    #[must_use]
    pub fn is_security(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Internal defect rather than an operational condition
    #[inline]
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. })
    }

    /// Short stable code for logs and metrics
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CandidateSearchTimedOut => "candidate_search_timed_out",
            Self::NoCandidateFound { .. } => "no_candidate_found",
            Self::ChecksFailed => "checks_failed",
            Self::ChecksTimedOut => "checks_timed_out",
            Self::InvariantsFailed { .. } => "invariants_failed",
            Self::ApprovalTimedOut => "approval_timed_out",
            Self::HealthNotRestored => "health_not_restored",
            Self::DegradationAfterMerge => "degradation_after_merge",
            Self::ProposalClosedExternally => "proposal_closed_externally",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::ConflictUnresolved { .. } => "conflict_unresolved",
            Self::CollaboratorFailure { .. } => "collaborator_failure",
            Self::StaleOnRecovery => "stale_on_recovery",
            Self::EmergencyStop { .. } => "emergency_stop",
        }
    }

    /// What an operator should do next
    #[must_use]
    pub fn recommended_next_step(&self) -> String {
        match self {
            Self::CandidateSearchTimedOut | Self::NoCandidateFound { .. } => {
                "No provably stable revision was found; investigate the degradation and roll back or fix forward manually".to_string()
            }
            Self::ChecksFailed | Self::ChecksTimedOut => {
                "Inspect the checks on the rollback proposal; merge manually only once they pass".to_string()
            }
            Self::InvariantsFailed { failed } => {
                let ids: Vec<&str> = failed.iter().map(InvariantId::code).collect();
                format!("Review failed safety conditions ({}) before merging the proposal by hand", ids.join(", "))
            }
            Self::ApprovalTimedOut => {
                "Approve and merge the rollback proposal manually, or close it if no longer needed".to_string()
            }
            Self::HealthNotRestored | Self::DegradationAfterMerge => {
                "Rollback did not restore health; page the owning team and consider an older revision".to_string()
            }
            Self::ProposalClosedExternally => {
                "Proposal was closed outside the engine; confirm the app state and reset the attempt".to_string()
            }
            Self::PermissionDenied { operation, .. } => {
                format!("Security: credentials were refused for {operation}; audit token scopes before resetting")
            }
            Self::InvalidRequest { operation, .. } => {
                format!("Engine defect: malformed {operation} request; file a bug and handle the rollback manually")
            }
            Self::ConflictUnresolved { operation, .. } => {
                format!("Concurrent modification during {operation}; resolve the conflict and reset the attempt")
            }
            Self::CollaboratorFailure { operation, .. } => {
                format!("{operation} kept failing; check collaborator availability and reset the attempt")
            }
            Self::StaleOnRecovery => {
                "Attempt outlived the recovery window while the engine was down; re-assess the app manually".to_string()
            }
            Self::EmergencyStop { .. } => {
                "Emergency stop engaged; review the attempt before resetting it".to_string()
            }
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCandidateFound { examined } => write!(f, "no candidate found ({examined} examined)"),
            Self::InvariantsFailed { failed } => {
                let ids: Vec<&str> = failed.iter().map(InvariantId::code).collect();
                write!(f, "invariants failed: {}", ids.join(","))
            }
            Self::PermissionDenied { operation, detail }
            | Self::InvalidRequest { operation, detail }
            | Self::ConflictUnresolved { operation, detail }
            | Self::CollaboratorFailure { operation, detail } => {
                write!(f, "{}: {operation}: {detail}", self.code())
            }
            Self::EmergencyStop { detail } => write!(f, "emergency stop: {detail}"),
            other => f.write_str(other.code()),
        }
    }
}

/// Escalation record produced by every abort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub correlation_id: CorrelationId,
    pub app_name: String,
    pub environment: Environment,
    pub reason: AbortReason,
    /// Last known invariant results, if any were evaluated
    pub invariants: Option<InvariantReport>,
    pub next_step: String,
    pub security: bool,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    /// Build the escalation for `reason`
    #[must_use]
    pub fn new(
        correlation_id: CorrelationId,
        app_name: impl Into<String>,
        environment: Environment,
        reason: AbortReason,
        invariants: Option<InvariantReport>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            app_name: app_name.into(),
            environment,
            next_step: reason.recommended_next_step(),
            security: reason.is_security(),
            reason,
            invariants,
            raised_at,
        }
    }

    /// Human-readable summary used in proposal comments
    #[must_use]
    pub fn summary(&self) -> String {
        let prefix = if self.security { "SECURITY ESCALATION" } else { "Escalation" };
        format!(
            "{prefix} for rollback {} ({} / {}): {}. Next step: {}",
            self.correlation_id, self.app_name, self.environment, self.reason, self.next_step
        )
    }
}
