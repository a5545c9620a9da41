//! FSM controller
//!
//! - A dispatcher task subscribes to the bus and routes every event by
//!   correlation id to exactly one worker task
//! - Each worker owns its attempt: dedupe, pure transition, persist, then
//!   execute the requested actions
//! - Bounded waits are cancellable tasks that report back only through events
//! - Operator commands (`approve`, `emergency_stop`, `reset`) are events too

mod waits;
mod worker;

use crate::bus::EventBus;
use crate::monitor;
use crate::recovery::{RecoveryManager, RecoveryPlan};
use crate::store::{RetentionPolicy, StateStore};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rollback_core::{
    CandidateResolver, Clock, Collaborators, CorrelationId, EngineConfig, Environment, Event, EventPayload, FsmState,
    InvariantEvaluator, RetryPolicy, RollbackAttempt, RollbackError,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) use worker::WorkerStart;

/// Shared, immutable dependencies of every engine task
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub collaborators: Collaborators,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,
    pub resolver: CandidateResolver,
    pub evaluator: InvariantEvaluator,
}

impl EngineContext {
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        let resolver = CandidateResolver::new(collaborators.clone(), Arc::clone(&config), retry, Arc::clone(&clock));
        let evaluator = InvariantEvaluator::new(collaborators.clone(), Arc::clone(&config), retry);
        Self {
            config,
            collaborators,
            store,
            bus,
            clock,
            retry,
            resolver,
            evaluator,
        }
    }

    #[inline]
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Publish a new event for `correlation_id`
    pub fn emit(&self, correlation_id: CorrelationId, payload: EventPayload) -> Event {
        self.bus.publish(Event::new(correlation_id, self.now(), payload))
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Event(Event),
    Shutdown,
}

#[derive(Debug, Clone)]
struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// Live workers keyed by correlation id, plus the active attempt per app
#[derive(Debug, Default)]
pub(crate) struct WorkerRegistry {
    workers: DashMap<CorrelationId, WorkerHandle>,
    apps: DashMap<String, CorrelationId>,
}

impl WorkerRegistry {
    /// Spawn a worker for `attempt` unless one already exists
    pub(crate) fn spawn(self: &Arc<Self>, ctx: &Arc<EngineContext>, attempt: RollbackAttempt, start: WorkerStart) -> bool {
        let id = attempt.correlation_id;
        match self.workers.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!(correlation_id = %id, "worker already running");
                false
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(WorkerHandle { tx });
                if !attempt.fsm_state.is_terminal() && !attempt.retired {
                    self.apps.insert(attempt.app.key(), id);
                }
                let worker = worker::Worker::new(Arc::clone(ctx), Arc::clone(self), attempt);
                tokio::spawn(worker.run(rx, start));
                true
            }
        }
    }

    /// Deliver to the attempt's worker; false when none is running
    fn route(&self, event: &Event) -> bool {
        self.workers
            .get(&event.correlation_id)
            .is_some_and(|w| w.tx.send(WorkerMessage::Event(event.clone())).is_ok())
    }

    /// Attempt currently active for an app
    fn active_for(&self, app_key: &str) -> Option<CorrelationId> {
        self.apps.get(app_key).map(|id| *id)
    }

    /// Attempt no longer claims its app
    pub(crate) fn release_app(&self, app_key: &str, id: CorrelationId) {
        self.apps.remove_if(app_key, |_, active| *active == id);
    }

    pub(crate) fn release(&self, app_key: &str, id: CorrelationId) {
        self.workers.remove(&id);
        self.release_app(app_key, id);
    }

    fn len(&self) -> usize {
        self.workers.len()
    }

    fn contains(&self, id: CorrelationId) -> bool {
        self.workers.contains_key(&id)
    }

    fn shutdown_all(&self) {
        for worker in self.workers.iter() {
            let _ = worker.tx.send(WorkerMessage::Shutdown);
        }
    }
}

/// Attempt may still react to events
fn accepts_events(attempt: &RollbackAttempt) -> bool {
    !attempt.retired && attempt.fsm_state != FsmState::RollbackComplete && attempt.fsm_state != FsmState::Idle
}

/// Route bus events to workers, creating workers on demand
async fn dispatch(ctx: Arc<EngineContext>, registry: Arc<WorkerRegistry>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        if registry.route(&event) {
            continue;
        }
        let id = event.correlation_id;

        let existing = match ctx.store.get(id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::error!(correlation_id = %id, error = %e, "cannot load attempt for event");
                continue;
            }
        };

        match (&event.payload, existing) {
            (EventPayload::DegradationConfirmed { app, current_revision, samples }, None) => {
                if let Some(active) = registry.active_for(&app.key()) {
                    tracing::info!(
                        correlation_id = %id,
                        active = %active,
                        app = %app.name,
                        "ignoring confirmation: app already has an active attempt"
                    );
                    continue;
                }
                let attempt = RollbackAttempt::new(id, app.clone(), current_revision.clone(), samples.clone(), ctx.now());
                registry.spawn(&ctx, attempt, WorkerStart::Passive);
                registry.route(&event);
            }
            (_, Some(attempt)) if accepts_events(&attempt) => {
                let start = if attempt.needs_recovery() {
                    WorkerStart::Resume
                } else {
                    WorkerStart::Passive
                };
                registry.spawn(&ctx, attempt, start);
                registry.route(&event);
            }
            _ => {
                tracing::debug!(correlation_id = %id, kind = %event.kind(), "no live attempt for event");
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}

/// The running rollback engine
pub struct Engine {
    ctx: Arc<EngineContext>,
    registry: Arc<WorkerRegistry>,
    dispatcher: JoinHandle<()>,
    monitors: Vec<JoinHandle<()>>,
    recovery: RecoveryPlan,
}

impl Engine {
    /// Recover persisted attempts, then start dispatching and monitoring
    pub async fn start(
        config: EngineConfig,
        collaborators: Collaborators,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RollbackError> {
        config.validate()?;
        let config = Arc::new(config);
        let last_sequence = store.max_sequence().await?;
        let bus = Arc::new(EventBus::starting_at(last_sequence));
        let ctx = Arc::new(EngineContext::new(Arc::clone(&config), collaborators, store, bus, clock));
        let registry = Arc::new(WorkerRegistry::default());

        let events = ctx.bus.subscribe();
        let recovery = RecoveryManager::new(Arc::clone(&ctx)).recover(&registry).await?;
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&ctx), Arc::clone(&registry), events));
        let monitors = config
            .apps
            .iter()
            .map(|app| monitor::spawn(Arc::clone(&ctx), app.clone()))
            .collect();

        tracing::info!(
            apps = config.apps.len(),
            resumed = recovery.resumed(),
            force_aborted = recovery.force_aborted(),
            last_sequence,
            "rollback engine started"
        );

        Ok(Self {
            ctx,
            registry,
            dispatcher,
            monitors,
            recovery,
        })
    }

    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// What recovery decided at startup
    #[inline]
    #[must_use]
    pub fn recovery(&self) -> &RecoveryPlan {
        &self.recovery
    }

    /// Observe every event from now on (audit sink)
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.ctx.bus.subscribe()
    }

    /// Publish an externally produced event
    pub fn submit(&self, correlation_id: CorrelationId, payload: EventPayload) -> Event {
        self.ctx.emit(correlation_id, payload)
    }

    /// Hand an already published event to the controller again, as an
    /// at-least-once transport would after a lost acknowledgement
    pub fn redeliver(&self, event: &Event) {
        self.ctx.bus.redeliver(event);
    }

    /// Number of live attempt workers
    #[inline]
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    #[must_use]
    pub fn has_worker(&self, id: CorrelationId) -> bool {
        self.registry.contains(id)
    }

    pub async fn attempt(&self, id: CorrelationId) -> Result<Option<RollbackAttempt>, RollbackError> {
        Ok(self.ctx.store.get(id).await?)
    }

    async fn load(&self, id: CorrelationId) -> Result<RollbackAttempt, RollbackError> {
        self.attempt(id).await?.ok_or(RollbackError::UnknownAttempt(id))
    }

    /// Human sign-off for a production proposal
    pub async fn approve(&self, id: CorrelationId, approver: impl Into<String>) -> Result<Event, RollbackError> {
        let attempt = self.load(id).await?;
        if attempt.app.environment != Environment::Production || attempt.fsm_state != FsmState::AwaitingMergeDecision {
            return Err(RollbackError::InvalidCommand {
                correlation_id: id,
                state: attempt.fsm_state,
                command: "approve",
            });
        }
        let approver = approver.into();
        tracing::info!(correlation_id = %id, %approver, "approval granted");
        Ok(self.submit(id, EventPayload::ApprovalGranted { approver }))
    }

    /// Abort an attempt from any live state
    pub async fn emergency_stop(&self, id: CorrelationId, detail: impl Into<String>) -> Result<Event, RollbackError> {
        let attempt = self.load(id).await?;
        if attempt.fsm_state.is_terminal() || attempt.retired {
            return Err(RollbackError::InvalidCommand {
                correlation_id: id,
                state: attempt.fsm_state,
                command: "emergency_stop",
            });
        }
        let detail = detail.into();
        tracing::warn!(correlation_id = %id, %detail, "emergency stop requested");
        Ok(self.submit(id, EventPayload::EmergencyStop { detail }))
    }

    /// Return an aborted attempt to idle
    pub async fn reset(&self, id: CorrelationId, operator: impl Into<String>) -> Result<Event, RollbackError> {
        let attempt = self.load(id).await?;
        if attempt.fsm_state != FsmState::Abort || attempt.retired {
            return Err(RollbackError::InvalidCommand {
                correlation_id: id,
                state: attempt.fsm_state,
                command: "reset",
            });
        }
        let operator = operator.into();
        tracing::info!(correlation_id = %id, %operator, "reset requested");
        Ok(self.submit(id, EventPayload::ResetRequested { operator }))
    }

    /// Delete finished attempts past retention
    pub async fn purge(&self) -> Result<Vec<CorrelationId>, RollbackError> {
        let policy = RetentionPolicy::from_config(&self.ctx.config);
        Ok(self.ctx.store.purge_expired(self.ctx.now(), &policy).await?)
    }

    /// Stop monitors, dispatcher and workers; persisted state is kept for recovery
    pub async fn shutdown(self) {
        for monitor in &self.monitors {
            monitor.abort();
        }
        self.dispatcher.abort();
        self.registry.shutdown_all();
        let _ = futures::future::join_all(self.monitors.into_iter().chain(std::iter::once(self.dispatcher))).await;
        tracing::info!("rollback engine stopped");
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.registry.len())
            .field("monitors", &self.monitors.len())
            .finish_non_exhaustive()
    }
}
