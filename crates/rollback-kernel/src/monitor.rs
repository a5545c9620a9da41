//! Per-app health monitor
//!
//! Polls replica status at the configured interval, feeds the app's
//! [`StabilityAnalyzer`] and publishes degradation events. Confirmation
//! events carry a fresh correlation id and start a new attempt.

use crate::controller::EngineContext;
use rollback_core::{AppTarget, Event, EventPayload, HealthSample, StabilityAnalyzer, StabilitySignal};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub struct AppMonitor {
    ctx: Arc<EngineContext>,
    analyzer: StabilityAnalyzer,
}

impl AppMonitor {
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, app: AppTarget) -> Self {
        Self {
            ctx,
            analyzer: StabilityAnalyzer::new(app),
        }
    }

    #[inline]
    #[must_use]
    pub fn app(&self) -> &AppTarget {
        self.analyzer.app()
    }

    /// Take one sample; returns the event published for it, if any
    pub async fn poll_once(&mut self) -> Option<Event> {
        let app = self.analyzer.app().clone();
        let c = &self.ctx.collaborators;
        let replicas = match self
            .ctx
            .retry
            .call("get_replica_status", || c.orchestrator.get_replica_status(&app.namespace, &app.workload))
            .await
        {
            Ok(replicas) => replicas,
            Err(e) => {
                tracing::warn!(app = %app.name, error = %e, "replica status unavailable; sample skipped");
                return None;
            }
        };

        let sample = HealthSample::from_replicas(self.ctx.now(), replicas);
        match self.analyzer.observe(sample)? {
            StabilitySignal::Detected { correlation_id, sample } => Some(
                self.ctx
                    .emit(correlation_id, EventPayload::DegradationDetected { app, sample }),
            ),
            StabilitySignal::Confirmed { correlation_id, samples } => {
                let revision = match self.ctx.retry.call("get_health", || c.health.get_health(&app.name)).await {
                    Ok(report) => report.revision,
                    Err(e) => {
                        tracing::error!(app = %app.name, %correlation_id, error = %e, "cannot read deployed revision");
                        None
                    }
                };
                let Some(current_revision) = revision else {
                    tracing::error!(app = %app.name, %correlation_id, "deployed revision unknown; retrying on next sample");
                    self.analyzer.retract_confirmation(correlation_id);
                    return None;
                };
                Some(self.ctx.emit(
                    correlation_id,
                    EventPayload::DegradationConfirmed {
                        app,
                        current_revision,
                        samples,
                    },
                ))
            }
        }
    }

    /// Poll until the task is aborted
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(app = %self.app().name, environment = %self.app().environment, "monitor started");
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }
}

/// Spawn the monitor task for `app`
pub fn spawn(ctx: Arc<EngineContext>, app: AppTarget) -> JoinHandle<()> {
    tokio::spawn(AppMonitor::new(ctx, app).run())
}
