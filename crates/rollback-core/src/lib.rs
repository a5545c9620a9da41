//! Rollback Core - data model and decision logic of the rollback engine
//!
//! Provides everything the reconciliation kernel decides with:
//! - The `RollbackAttempt` aggregate, events and FSM states
//! - Persistence confirmation of degradations (`StabilityAnalyzer`)
//! - Rollback target selection from history (`CandidateResolver`)
//! - The eight merge-gating invariants and the merge decision
//! - Typed collaborator ports and the retry policy around them
//! - One immutable `EngineConfig`
//!
//! Nothing in this crate spawns tasks; the kernel owns concurrency.
//!
//! # Example
//!
//! ```rust,ignore
//! use rollback_core::{decide_merge, Environment, InvariantReport, MergeDecision};
//!
//! let report = InvariantReport::from_observations(&observations, now);
//! match decide_merge(Environment::Staging, &report, false, false) {
//!     MergeDecision::Merge => println!("all eight invariants hold"),
//!     other => println!("blocked: {other:?}"),
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod candidate;
pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ports;
pub mod retry;
pub mod stability;
pub mod telemetry;
pub mod types;

// Re-exports for convenience
pub use candidate::{CandidateResolver, Resolution};
pub use config::EngineConfig;
pub use error::{
    AbortReason, CallError, CollaboratorError, ConfigError, ErrorClass, Escalation, RollbackError, StoreError,
};
pub use events::{CiOutcome, Event, EventKey, EventKind, EventPayload, WaitKind};
pub use invariants::{
    decide_merge, is_restored, Evaluation, InvariantEvaluator, InvariantId, InvariantOutcome, InvariantReport,
    MergeDecision, Observations, UptimeEvidence,
};
pub use ports::{
    ChangeRequest, ChangeState, ChangeStatus, ChangeSummary, CheckState, Collaborators, CommitInfo, HealthReport,
    HealthSource, MergeMethod, MergeOutcome, Orchestrator, SourceControl, UptimeSource,
};
pub use retry::RetryPolicy;
pub use stability::{StabilityAnalyzer, StabilitySignal};
pub use types::{
    Action, AppTarget, Candidate, ChangeId, ChangeRef, Clock, CorrelationId, Environment, FsmState, HealthSample,
    HealthStatus, ReplicaStatus, RollbackAttempt, SampleWindow, SystemClock, TokioClock, SAMPLE_WINDOW,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Rollback Core
    pub use crate::{
        Action, AppTarget, Clock, Collaborators, CorrelationId, EngineConfig, Environment, Event, EventPayload,
        FsmState, RollbackAttempt, RollbackError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
