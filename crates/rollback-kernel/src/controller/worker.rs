//! Per-attempt worker
//!
//! The single writer of one `RollbackAttempt`. Events are applied one at a
//! time in arrival order; events the worker produces itself are published
//! first and applied before the next queued message.

use super::waits::{self, failed, is_permission};
use super::{EngineContext, WorkerMessage, WorkerRegistry};
use crate::state_machine::{transition, Guards};
use rollback_core::{
    decide_merge, telemetry, AbortReason, Action, ChangeRequest, ChangeState, Environment, Escalation, Event,
    EventPayload, FsmState, MergeDecision, MergeOutcome, RollbackAttempt, StoreError,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How a worker begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStart {
    /// Wait for routed events
    Passive,
    /// Re-validate external state and resume the current state's work
    Resume,
    /// Abort a stale attempt found on recovery
    ForceAbort,
}

pub(crate) struct Worker {
    ctx: Arc<EngineContext>,
    registry: Arc<WorkerRegistry>,
    attempt: RollbackAttempt,
    waits: Vec<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(ctx: Arc<EngineContext>, registry: Arc<WorkerRegistry>, attempt: RollbackAttempt) -> Self {
        Self {
            ctx,
            registry,
            attempt,
            waits: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>, start: WorkerStart) {
        let id = self.attempt.correlation_id;
        if let Err(e) = self.drive(&mut rx, start).await {
            tracing::error!(correlation_id = %id, error = %e, "state store write failed; worker stopped");
        }
        self.cancel_waits();
        self.registry.release(&self.attempt.app.key(), id);
        tracing::debug!(correlation_id = %id, state = %self.attempt.fsm_state, "worker exited");
    }

    async fn drive(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<WorkerMessage>,
        start: WorkerStart,
    ) -> Result<(), StoreError> {
        match start {
            WorkerStart::Passive => {}
            WorkerStart::Resume => self.resume().await?,
            WorkerStart::ForceAbort => {
                let event = self.ctx.emit(
                    self.attempt.correlation_id,
                    EventPayload::Failed {
                        reason: AbortReason::StaleOnRecovery,
                    },
                );
                self.handle(event).await?;
            }
        }

        while !self.finished() {
            match rx.recv().await {
                Some(WorkerMessage::Event(event)) => self.handle(event).await?,
                Some(WorkerMessage::Shutdown) | None => break,
            }
        }
        Ok(())
    }

    /// No event can change the attempt any more
    fn finished(&self) -> bool {
        self.attempt.retired || self.attempt.fsm_state == FsmState::RollbackComplete
    }

    async fn persist(&mut self) -> Result<(), StoreError> {
        self.attempt.touch(self.ctx.now());
        self.ctx.store.put(&self.attempt).await
    }

    /// Apply an event and everything it causes
    async fn handle(&mut self, event: Event) -> Result<(), StoreError> {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let produced = self.apply(event).await?;
            queue.extend(produced);
        }
        Ok(())
    }

    async fn apply(&mut self, event: Event) -> Result<Vec<Event>, StoreError> {
        let id = self.attempt.correlation_id;
        let key = event.key();
        if self.attempt.applied_events.contains(&key) {
            telemetry::record_duplicate_event();
            tracing::trace!(correlation_id = %id, kind = %key.kind, sequence = key.sequence, "duplicate event");
            return Ok(Vec::new());
        }

        let guards = Guards {
            environment: self.attempt.app.environment,
        };
        let from = self.attempt.fsm_state;
        let t = match transition(from, &event.payload, &guards) {
            Ok(t) => t,
            Err(e) => {
                self.attempt.applied_events.insert(key);
                tracing::debug!(correlation_id = %id, error = %e, "event ignored");
                return Ok(Vec::new());
            }
        };

        self.attempt.applied_events.insert(key);
        self.record(&event.payload);
        self.attempt.enter(t.next, self.ctx.now());
        self.attempt.pending_actions.clone_from(&t.actions);
        self.persist().await?;

        if from != t.next {
            tracing::info!(
                correlation_id = %id,
                app = %self.attempt.app.name,
                from = %from,
                to = %t.next,
                event = %key.kind,
                "transition"
            );
            telemetry::record_transition(from, t.next);
        }

        self.run_actions(t.actions).await
    }

    /// Copy event data onto the attempt
    fn record(&mut self, payload: &EventPayload) {
        match payload {
            EventPayload::DegradationConfirmed {
                current_revision,
                samples,
                ..
            } => {
                self.attempt.current_revision.clone_from(current_revision);
                self.attempt.health_check_history = samples.clone();
                telemetry::record_confirmation(self.attempt.app.environment);
            }
            EventPayload::CandidateResolved { candidate } => self.attempt.set_candidate(candidate.clone()),
            EventPayload::ChangeCreated { change } => self.attempt.change_ref = Some(change.clone()),
            EventPayload::MergeCompleted { already_merged, .. } => {
                telemetry::record_merge(self.attempt.app.environment, *already_merged);
            }
            _ => {}
        }
    }

    /// Execute persisted actions, stopping after the first failure
    async fn run_actions(&mut self, actions: Vec<Action>) -> Result<Vec<Event>, StoreError> {
        let mut produced = Vec::new();
        for action in actions {
            let events = self.execute(action).await;
            let failed = events.iter().any(|e| matches!(e.payload, EventPayload::Failed { .. }));
            produced.extend(events);
            if failed {
                break;
            }
        }
        self.attempt.pending_actions.clear();
        self.persist().await?;
        Ok(produced)
    }

    async fn resume(&mut self) -> Result<(), StoreError> {
        let id = self.attempt.correlation_id;
        if !self.attempt.pending_actions.is_empty() {
            tracing::info!(correlation_id = %id, state = %self.attempt.fsm_state, pending = self.attempt.pending_actions.len(), "replaying pending actions");
            let produced = self.run_actions(self.attempt.pending_actions.clone()).await?;
            for event in produced {
                self.handle(event).await?;
            }
            return Ok(());
        }

        tracing::info!(correlation_id = %id, state = %self.attempt.fsm_state, "revalidating attempt");
        match self.revalidate().await {
            Ok(actions) => {
                self.attempt.pending_actions.clone_from(&actions);
                self.persist().await?;
                let produced = self.run_actions(actions).await?;
                for event in produced {
                    self.handle(event).await?;
                }
            }
            Err(payload) => {
                let event = self.ctx.emit(id, payload);
                self.handle(event).await?;
            }
        }
        Ok(())
    }

    /// Actions that resume the current state, checked against fresh state.
    /// An `Err` carries the event that replaces resuming.
    async fn revalidate(&mut self) -> Result<Vec<Action>, EventPayload> {
        match self.attempt.fsm_state {
            FsmState::DegradationDetected => Ok(vec![Action::ResolveCandidate, Action::WatchRecovery]),
            FsmState::CandidateResolved => Ok(vec![Action::ProposeChange]),
            FsmState::ChangeProposed => {
                let Some(change) = self.attempt.change_ref.clone() else {
                    return Err(invalid("resume_checks", "no proposal recorded"));
                };
                let sc = &self.ctx.collaborators.source_control;
                let repo = &self.attempt.app.repo;
                match self.ctx.retry.call("get_check_status", || sc.get_check_status(repo, change.id)).await {
                    Ok(status) => match status.state {
                        ChangeState::Open => Ok(vec![Action::AwaitChecks]),
                        ChangeState::Merged => Err(EventPayload::MergeCompleted {
                            change_id: change.id,
                            already_merged: true,
                        }),
                        ChangeState::Closed => Err(EventPayload::Failed {
                            reason: AbortReason::ProposalClosedExternally,
                        }),
                    },
                    Err(e) if is_permission(&e) => Err(failed(&e)),
                    Err(_) => Ok(vec![Action::AwaitChecks]),
                }
            }
            FsmState::AwaitingMergeDecision => Ok(match self.attempt.app.environment {
                Environment::Staging => vec![Action::AttemptMerge { approved: false }],
                Environment::Production => vec![Action::RequestApproval],
            }),
            FsmState::Merged => Ok(vec![Action::ConfirmHealth]),
            FsmState::Idle | FsmState::RollbackComplete | FsmState::Abort => Ok(Vec::new()),
        }
    }

    fn spawn_wait<F>(&mut self, wait: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.waits.retain(|w| !w.is_finished());
        self.waits.push(tokio::spawn(wait));
    }

    fn cancel_waits(&mut self) {
        for wait in self.waits.drain(..) {
            wait.abort();
        }
    }

    fn emit(&self, payload: EventPayload) -> Vec<Event> {
        vec![self.ctx.emit(self.attempt.correlation_id, payload)]
    }

    async fn execute(&mut self, action: Action) -> Vec<Event> {
        let id = self.attempt.correlation_id;
        let now = self.ctx.now();
        let app = self.attempt.app.clone();
        tracing::debug!(correlation_id = %id, ?action, "executing action");

        match action {
            Action::ResolveCandidate => {
                let bound = waits::remaining(self.ctx.config.candidate_search_budget(), self.attempt.time_in_state(now));
                let wait = waits::candidate_search(
                    Arc::clone(&self.ctx),
                    id,
                    app,
                    self.attempt.current_revision.clone(),
                    bound,
                );
                self.spawn_wait(wait);
                Vec::new()
            }
            Action::WatchRecovery => {
                self.spawn_wait(waits::recovery_watch(Arc::clone(&self.ctx), id, app));
                Vec::new()
            }
            Action::ProposeChange => self.propose_change().await,
            Action::AwaitChecks => {
                let Some(change_id) = self.attempt.change_ref.as_ref().map(|c| c.id) else {
                    return self.emit(invalid("await_checks", "no proposal recorded"));
                };
                let bound = waits::remaining(self.ctx.config.check_wait(), self.attempt.time_in_state(now));
                self.spawn_wait(waits::checks(Arc::clone(&self.ctx), id, app, change_id, bound));
                Vec::new()
            }
            Action::AttemptMerge { approved } => self.attempt_merge(approved).await,
            Action::RequestApproval => self.request_approval().await,
            Action::ConfirmHealth => {
                let bound = waits::remaining(self.ctx.config.health_confirmation(), self.attempt.time_in_state(now));
                self.spawn_wait(waits::health_confirmation(Arc::clone(&self.ctx), id, app, bound));
                Vec::new()
            }
            Action::CloseChange { reason } => self.close_change(&reason).await,
            Action::CancelWaits => {
                self.cancel_waits();
                Vec::new()
            }
            Action::Escalate { reason } => self.escalate(reason).await,
            Action::Retire => {
                self.attempt.retired = true;
                self.registry.release_app(&app.key(), id);
                tracing::info!(correlation_id = %id, app = %app.name, "attempt retired");
                Vec::new()
            }
        }
    }

    /// Create the proposal, or adopt the one a previous run already opened
    async fn propose_change(&mut self) -> Vec<Event> {
        let id = self.attempt.correlation_id;
        let app = self.attempt.app.clone();
        let Some(candidate) = self.attempt.candidate.clone() else {
            return self.emit(invalid("propose_change", "no candidate recorded"));
        };
        let sc = &self.ctx.collaborators.source_control;
        let config = &self.ctx.config;
        let head_branch = format!("rollback/{}/{}", app.name, id);

        let open = match self
            .ctx
            .retry
            .call("list_open_changes", || sc.list_open_changes(&app.repo, &app.branch, &config.rollback_label))
            .await
        {
            Ok(open) => open,
            Err(e) => return self.emit(failed(&e)),
        };
        if let Some(existing) = open.iter().find(|c| c.head_branch == head_branch) {
            tracing::info!(correlation_id = %id, change = %existing.id, "adopting existing rollback proposal");
            return self.emit(EventPayload::ChangeCreated {
                change: existing.to_ref(),
            });
        }

        let evidence = match candidate.upstream_uptime_percent {
            Some(percent) => format!("uptime {percent:.2}% while live"),
            None => "uptime unavailable; selected on passing checks alone".to_string(),
        };
        let request = ChangeRequest {
            repo: app.repo.clone(),
            base_branch: app.branch.clone(),
            head_branch,
            target_revision: candidate.revision.clone(),
            title: format!("Rollback {} ({}) to {}", app.name, app.environment, short(&candidate.revision)),
            body: format!(
                "Automated rollback {id}\n\nCurrent revision: {}\nTarget revision: {} ({})\nAuthor: {}\nEvidence: {evidence}\n",
                self.attempt.current_revision,
                candidate.revision,
                candidate.commit_message.lines().next().unwrap_or_default(),
                candidate.commit_author,
            ),
            labels: vec![config.rollback_label.clone(), app.label()],
        };
        match self.ctx.retry.call("create_change", || sc.create_change(&request)).await {
            Ok(change) => {
                tracing::info!(correlation_id = %id, change = %change.id, target = %candidate.revision, "rollback proposal created");
                self.emit(EventPayload::ChangeCreated { change })
            }
            Err(e) => self.emit(failed(&e)),
        }
    }

    /// Fresh evaluation, decision and merge with nothing awaited in between
    async fn attempt_merge(&mut self, approved: bool) -> Vec<Event> {
        let id = self.attempt.correlation_id;
        let environment = self.attempt.app.environment;
        let Some(change) = self.attempt.change_ref.clone() else {
            return self.emit(invalid("attempt_merge", "no proposal recorded"));
        };
        let repo = self.attempt.app.repo.clone();
        let sc = Arc::clone(&self.ctx.collaborators.source_control);

        match self.ctx.retry.call("get_check_status", || sc.get_check_status(&repo, change.id)).await {
            Ok(status) if status.state == ChangeState::Merged => {
                tracing::info!(correlation_id = %id, change = %change.id, "proposal already merged");
                return self.emit(EventPayload::MergeCompleted {
                    change_id: change.id,
                    already_merged: true,
                });
            }
            Ok(status) if status.state == ChangeState::Closed => {
                return self.emit(EventPayload::Failed {
                    reason: AbortReason::ProposalClosedExternally,
                });
            }
            Ok(_) => {}
            Err(e) if is_permission(&e) => return self.emit(failed(&e)),
            Err(e) => tracing::warn!(correlation_id = %id, error = %e, "merge pre-check unavailable"),
        }

        let evaluation = match self.ctx.evaluator.evaluate(&self.attempt, self.ctx.now()).await {
            Ok(evaluation) => evaluation,
            Err(e) => return self.emit(failed(&e)),
        };
        self.attempt.invariant_results = Some(evaluation.report.clone());

        match decide_merge(environment, &evaluation.report, evaluation.health_restored, approved) {
            MergeDecision::Merge => {
                let method = self.ctx.config.merge_method;
                match self
                    .ctx
                    .retry
                    .call("merge_change", || sc.merge_change(&repo, change.id, method))
                    .await
                {
                    Ok(outcome) => {
                        tracing::info!(correlation_id = %id, change = %change.id, ?outcome, %method, approved, "rollback merged");
                        self.emit(EventPayload::MergeCompleted {
                            change_id: change.id,
                            already_merged: outcome == MergeOutcome::AlreadyMerged,
                        })
                    }
                    Err(e) => self.emit(failed(&e)),
                }
            }
            MergeDecision::Close => {
                tracing::info!(correlation_id = %id, change = %change.id, "health restored before merge; closing proposal");
                self.emit(EventPayload::HealthRestored { sustained_secs: 0 })
            }
            MergeDecision::AwaitApproval => self.request_approval().await,
            MergeDecision::Abort(failed) => {
                let codes: Vec<&str> = failed.iter().map(|i| i.code()).collect();
                tracing::warn!(correlation_id = %id, failed = ?codes, "merge blocked by invariants");
                self.emit(EventPayload::Failed {
                    reason: AbortReason::InvariantsFailed { failed },
                })
            }
        }
    }

    /// Label and comment once, then wait for the remaining approval bound
    async fn request_approval(&mut self) -> Vec<Event> {
        let id = self.attempt.correlation_id;
        let app = self.attempt.app.clone();
        let Some(change) = self.attempt.change_ref.clone() else {
            return self.emit(invalid("request_approval", "no proposal recorded"));
        };
        let now = self.ctx.now();

        let requested_at = match self.attempt.approval_requested_at {
            Some(at) => at,
            None => {
                let sc = &self.ctx.collaborators.source_control;
                let labels = vec![self.ctx.config.approval_label.clone()];
                if let Err(e) = self
                    .ctx
                    .retry
                    .call("add_labels", || sc.add_labels(&app.repo, change.id, labels.clone()))
                    .await
                {
                    return self.emit(failed(&e));
                }
                let body = format!(
                    "Rollback {id} for {} ({}) passed checks and needs human approval before it is merged.",
                    app.name, app.environment
                );
                if let Err(e) = self
                    .ctx
                    .retry
                    .call("comment_on_change", || sc.comment_on_change(&app.repo, change.id, &body))
                    .await
                {
                    return self.emit(failed(&e));
                }
                tracing::info!(correlation_id = %id, change = %change.id, "human approval requested");
                self.attempt.approval_requested_at = Some(now);
                now
            }
        };

        let bound = waits::remaining(self.ctx.config.approval_wait(), now - requested_at);
        self.spawn_wait(waits::approval(Arc::clone(&self.ctx), id, app, change.id, bound));
        Vec::new()
    }

    async fn close_change(&mut self, reason: &str) -> Vec<Event> {
        let id = self.attempt.correlation_id;
        let app = self.attempt.app.clone();
        let Some(change) = self.attempt.change_ref.clone() else {
            return Vec::new();
        };
        let sc = &self.ctx.collaborators.source_control;

        match self.ctx.retry.call("get_check_status", || sc.get_check_status(&app.repo, change.id)).await {
            Ok(status) if status.state != ChangeState::Open => {
                tracing::info!(correlation_id = %id, change = %change.id, state = ?status.state, "proposal no longer open");
                return Vec::new();
            }
            Err(e) if is_permission(&e) => return self.emit(failed(&e)),
            _ => {}
        }

        let comment = format!("Closing rollback {id} without merging: {reason}.");
        match self
            .ctx
            .retry
            .call("close_change", || sc.close_change(&app.repo, change.id, &comment))
            .await
        {
            Ok(()) => {
                telemetry::record_close(app.environment);
                tracing::info!(correlation_id = %id, change = %change.id, reason, "proposal closed");
                Vec::new()
            }
            Err(e) => self.emit(failed(&e)),
        }
    }

    /// Record the escalation and emit the `Abort` audit event once
    async fn escalate(&mut self, reason: AbortReason) -> Vec<Event> {
        let id = self.attempt.correlation_id;
        if self.attempt.escalation.is_some() {
            return Vec::new();
        }
        let app = self.attempt.app.clone();
        let escalation = Escalation::new(
            id,
            app.name.clone(),
            app.environment,
            reason.clone(),
            self.attempt.invariant_results.clone(),
            self.ctx.now(),
        );
        self.attempt.abort_reason = Some(reason.clone());
        self.attempt.escalation = Some(escalation.clone());
        self.registry.release_app(&app.key(), id);
        telemetry::record_abort(&reason);

        if escalation.security {
            tracing::error!(correlation_id = %id, app = %app.name, security = true, %reason, next_step = %escalation.next_step, "security escalation");
        } else if reason.is_defect() {
            tracing::error!(correlation_id = %id, app = %app.name, defect = true, %reason, next_step = %escalation.next_step, "attempt aborted on internal defect");
        } else {
            tracing::warn!(correlation_id = %id, app = %app.name, %reason, next_step = %escalation.next_step, "attempt aborted");
        }

        if let Some(change) = &self.attempt.change_ref {
            let sc = &self.ctx.collaborators.source_control;
            let summary = escalation.summary();
            if let Err(e) = self
                .ctx
                .retry
                .call("comment_on_change", || sc.comment_on_change(&app.repo, change.id, &summary))
                .await
            {
                tracing::warn!(correlation_id = %id, error = %e, "could not post escalation on proposal");
            }
        }

        self.emit(EventPayload::Abort { reason, escalation })
    }
}

fn invalid(operation: &str, detail: &str) -> EventPayload {
    EventPayload::Failed {
        reason: AbortReason::InvalidRequest {
            operation: operation.to_string(),
            detail: detail.to_string(),
        },
    }
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}
