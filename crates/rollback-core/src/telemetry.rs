//! Metric names and recording helpers
//!
//! Only the `metrics` facade is used here; installing an exporter is left
//! to the embedding process.

use crate::error::AbortReason;
use crate::types::{Environment, FsmState};

pub const TRANSITIONS: &str = "rollback_transitions_total";
pub const ABORTS: &str = "rollback_aborts_total";
pub const MERGES: &str = "rollback_merges_total";
pub const CLOSES: &str = "rollback_closes_total";
pub const RETRIES: &str = "rollback_collaborator_retries_total";
pub const UPTIME_FALLBACK: &str = "rollback_uptime_fallback_total";
pub const RECOVERIES: &str = "rollback_recoveries_total";
pub const DUPLICATE_EVENTS: &str = "rollback_duplicate_events_total";
pub const CONFIRMATIONS: &str = "rollback_degradations_confirmed_total";

pub fn record_transition(from: FsmState, to: FsmState) {
    metrics::counter!(TRANSITIONS, "from" => from.as_str(), "to" => to.as_str()).increment(1);
}

pub fn record_abort(reason: &AbortReason) {
    metrics::counter!(ABORTS, "reason" => reason.code(), "security" => if reason.is_security() { "true" } else { "false" })
        .increment(1);
}

pub fn record_merge(environment: Environment, already_merged: bool) {
    metrics::counter!(
        MERGES,
        "environment" => environment.as_str(),
        "already_merged" => if already_merged { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_close(environment: Environment) {
    metrics::counter!(CLOSES, "environment" => environment.as_str()).increment(1);
}

pub fn record_retry(operation: &'static str) {
    metrics::counter!(RETRIES, "operation" => operation).increment(1);
}

/// Candidate accepted on checks alone; tracked apart from uptime-backed selections
pub fn record_uptime_fallback(app: &str, stage: &'static str) {
    metrics::counter!(UPTIME_FALLBACK, "app" => app.to_string(), "stage" => stage).increment(1);
}

pub fn record_recovery(decision: &'static str) {
    metrics::counter!(RECOVERIES, "decision" => decision).increment(1);
}

pub fn record_duplicate_event() {
    metrics::counter!(DUPLICATE_EVENTS).increment(1);
}

pub fn record_confirmation(environment: Environment) {
    metrics::counter!(CONFIRMATIONS, "environment" => environment.as_str()).increment(1);
}
