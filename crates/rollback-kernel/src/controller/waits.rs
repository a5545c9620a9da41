//! Bounded waits
//!
//! Each wait runs as its own task, polls collaborators at the configured
//! interval and finishes by publishing exactly one event. Expiry of the
//! bound publishes a `Timeout` event; nothing here mutates the attempt.

use super::EngineContext;
use rollback_core::{
    is_restored, AbortReason, AppTarget, CallError, ChangeId, ChangeState, CheckState, CiOutcome, CollaboratorError,
    CorrelationId, EventPayload, HealthStatus, Resolution, WaitKind,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bound left after `elapsed` of it was already spent
#[must_use]
pub(crate) fn remaining(bound: Duration, elapsed: chrono::Duration) -> Duration {
    bound.saturating_sub(elapsed.to_std().unwrap_or(Duration::ZERO))
}

/// Run `body` under `bound`, publishing its payload or a timeout
async fn bounded<F>(ctx: Arc<EngineContext>, id: CorrelationId, wait: WaitKind, bound: Duration, body: F)
where
    F: Future<Output = EventPayload>,
{
    tracing::debug!(correlation_id = %id, %wait, ?bound, "wait started");
    let payload = match tokio::time::timeout(bound, body).await {
        Ok(payload) => payload,
        Err(_) => {
            tracing::warn!(correlation_id = %id, %wait, ?bound, "wait expired");
            EventPayload::Timeout { wait }
        }
    };
    ctx.emit(id, payload);
}

pub(crate) fn failed(err: &CallError) -> EventPayload {
    EventPayload::Failed {
        reason: AbortReason::from_call(err),
    }
}

pub(crate) fn is_permission(err: &CallError) -> bool {
    matches!(err.source, CollaboratorError::PermissionDenied(_))
}

/// One health observation: aggregate status and whether the app is restored
struct HealthReading {
    status: Option<HealthStatus>,
    restored: bool,
}

async fn read_health(ctx: &EngineContext, app: &AppTarget) -> Result<HealthReading, CallError> {
    let c = &ctx.collaborators;
    let health = match ctx.retry.call("get_health", || c.health.get_health(&app.name)).await {
        Ok(h) => Some(h.status),
        Err(e) if is_permission(&e) => return Err(e),
        Err(_) => None,
    };
    let replicas = match ctx
        .retry
        .call("get_replica_status", || c.orchestrator.get_replica_status(&app.namespace, &app.workload))
        .await
    {
        Ok(r) => Some(r),
        Err(e) if is_permission(&e) => return Err(e),
        Err(_) => None,
    };
    Ok(HealthReading {
        status: health,
        restored: is_restored(health, replicas),
    })
}

/// Tracks how long health has been continuously restored
#[derive(Debug, Default)]
struct Sustained {
    since: Option<chrono::DateTime<chrono::Utc>>,
    seen: bool,
}

impl Sustained {
    /// Feed one reading; returns the sustained span once it reaches `window`
    fn observe(&mut self, ctx: &EngineContext, restored: bool, window: Duration) -> Option<u64> {
        if !restored {
            self.since = None;
            return None;
        }
        self.seen = true;
        let now = ctx.now();
        let since = *self.since.get_or_insert(now);
        let span = (now - since).to_std().unwrap_or(Duration::ZERO);
        (span >= window).then_some(span.as_secs())
    }
}

/// Candidate search under the remaining search budget
pub(crate) async fn candidate_search(
    ctx: Arc<EngineContext>,
    id: CorrelationId,
    app: AppTarget,
    current_revision: String,
    bound: Duration,
) {
    let body = {
        let ctx = Arc::clone(&ctx);
        async move {
            match ctx.resolver.resolve(&app, &current_revision).await {
                Ok(Resolution::Found(candidate)) => EventPayload::CandidateResolved { candidate },
                Ok(Resolution::NotFound { examined }) => EventPayload::NoCandidateFound { examined },
                Ok(Resolution::TimedOut) => EventPayload::Timeout {
                    wait: WaitKind::CandidateSearch,
                },
                Err(e) => failed(&e),
            }
        }
    };
    bounded(ctx, id, WaitKind::CandidateSearch, bound, body).await;
}

/// Watch for sustained independent recovery; runs until cancelled
pub(crate) async fn recovery_watch(ctx: Arc<EngineContext>, id: CorrelationId, app: AppTarget) {
    let window = ctx.config.recovery_window();
    let mut sustained = Sustained::default();
    loop {
        match read_health(&ctx, &app).await {
            Ok(reading) => {
                if let Some(sustained_secs) = sustained.observe(&ctx, reading.restored, window) {
                    tracing::info!(correlation_id = %id, app = %app.name, sustained_secs, "health recovered independently");
                    ctx.emit(id, EventPayload::HealthRestored { sustained_secs });
                    return;
                }
            }
            Err(e) => {
                ctx.emit(id, failed(&e));
                return;
            }
        }
        tokio::time::sleep(ctx.config.poll_interval()).await;
    }
}

/// Wait for checks on the proposal to complete
pub(crate) async fn checks(ctx: Arc<EngineContext>, id: CorrelationId, app: AppTarget, change: ChangeId, bound: Duration) {
    let body = {
        let ctx = Arc::clone(&ctx);
        async move {
            let sc = &ctx.collaborators.source_control;
            loop {
                match ctx.retry.call("get_check_status", || sc.get_check_status(&app.repo, change)).await {
                    Ok(status) => match (status.state, status.checks) {
                        (ChangeState::Closed, _) => {
                            return EventPayload::Failed {
                                reason: AbortReason::ProposalClosedExternally,
                            }
                        }
                        (ChangeState::Merged, _) => {
                            return EventPayload::MergeCompleted {
                                change_id: change,
                                already_merged: true,
                            }
                        }
                        (ChangeState::Open, CheckState::Success) => {
                            return EventPayload::CiResult {
                                change_id: change,
                                outcome: CiOutcome::Success,
                            }
                        }
                        (ChangeState::Open, CheckState::Failure) => {
                            return EventPayload::CiResult {
                                change_id: change,
                                outcome: CiOutcome::Failure,
                            }
                        }
                        (ChangeState::Open, CheckState::Pending) => {}
                    },
                    Err(e) if is_permission(&e) => return failed(&e),
                    Err(e) => tracing::warn!(correlation_id = %id, error = %e, "check status unavailable"),
                }
                tokio::time::sleep(ctx.config.poll_interval()).await;
            }
        }
    };
    bounded(ctx, id, WaitKind::CheckCompletion, bound, body).await;
}

/// Wait for human approval, an external merge, or independent recovery
pub(crate) async fn approval(ctx: Arc<EngineContext>, id: CorrelationId, app: AppTarget, change: ChangeId, bound: Duration) {
    let body = {
        let ctx = Arc::clone(&ctx);
        async move {
            let sc = &ctx.collaborators.source_control;
            let window = ctx.config.recovery_window();
            let mut sustained = Sustained::default();
            loop {
                match ctx.retry.call("get_check_status", || sc.get_check_status(&app.repo, change)).await {
                    Ok(status) if status.state == ChangeState::Closed => {
                        return EventPayload::Failed {
                            reason: AbortReason::ProposalClosedExternally,
                        }
                    }
                    Ok(status) if status.state == ChangeState::Merged => {
                        return EventPayload::MergeCompleted {
                            change_id: change,
                            already_merged: true,
                        }
                    }
                    Ok(status) if status.approved => {
                        return EventPayload::ApprovalGranted {
                            approver: "review".to_string(),
                        }
                    }
                    Ok(_) => {}
                    Err(e) if is_permission(&e) => return failed(&e),
                    Err(e) => tracing::warn!(correlation_id = %id, error = %e, "approval status unavailable"),
                }
                match read_health(&ctx, &app).await {
                    Ok(reading) => {
                        if let Some(sustained_secs) = sustained.observe(&ctx, reading.restored, window) {
                            return EventPayload::HealthRestored { sustained_secs };
                        }
                    }
                    Err(e) => return failed(&e),
                }
                tokio::time::sleep(ctx.config.poll_interval()).await;
            }
        }
    };
    bounded(ctx, id, WaitKind::Approval, bound, body).await;
}

/// Watch post-merge health until confirmed, regressed, or timed out
pub(crate) async fn health_confirmation(ctx: Arc<EngineContext>, id: CorrelationId, app: AppTarget, bound: Duration) {
    let body = {
        let ctx = Arc::clone(&ctx);
        async move {
            let window = ctx.config.confirmation_window();
            let mut sustained = Sustained::default();
            loop {
                match read_health(&ctx, &app).await {
                    Ok(reading) => {
                        if let Some(sustained_secs) = sustained.observe(&ctx, reading.restored, window) {
                            return EventPayload::HealthRestored { sustained_secs };
                        }
                        if sustained.seen && reading.status == Some(HealthStatus::Degraded) {
                            tracing::error!(correlation_id = %id, app = %app.name, "degraded again after merge");
                            return EventPayload::Failed {
                                reason: AbortReason::DegradationAfterMerge,
                            };
                        }
                    }
                    Err(e) => return failed(&e),
                }
                tokio::time::sleep(ctx.config.poll_interval()).await;
            }
        }
    };
    bounded(ctx, id, WaitKind::HealthConfirmation, bound, body).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_subtracts_elapsed() {
        let bound = Duration::from_secs(300);
        assert_eq!(remaining(bound, chrono::Duration::seconds(120)), Duration::from_secs(180));
        assert_eq!(remaining(bound, chrono::Duration::seconds(900)), Duration::ZERO);
        assert_eq!(remaining(bound, chrono::Duration::seconds(-5)), bound);
    }
}
