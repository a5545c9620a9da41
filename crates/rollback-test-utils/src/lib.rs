//! Testing utilities for the rollback workspace
//!
//! In-memory fakes of the four collaborator ports. Every fake is scriptable
//! from the test while the engine runs, and records the calls tests assert on.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rollback_core::ports::{
    ChangeRequest, ChangeState, ChangeStatus, ChangeSummary, CheckState, CommitInfo, HealthReport, HealthSource,
    MergeMethod, MergeOutcome, Orchestrator, SourceControl, UptimeSource,
};
use rollback_core::{
    AppTarget, ChangeId, ChangeRef, CollaboratorError, Collaborators, EngineConfig, Environment, HealthStatus,
    ReplicaStatus,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Queued one-shot failures per operation name
#[derive(Debug, Default)]
struct Failures {
    queued: Mutex<HashMap<&'static str, VecDeque<CollaboratorError>>>,
}

impl Failures {
    fn push(&self, operation: &'static str, err: CollaboratorError) {
        self.queued.lock().entry(operation).or_default().push_back(err);
    }

    fn take(&self, operation: &'static str) -> Result<(), CollaboratorError> {
        match self.queued.lock().get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeHealth {
    reports: Mutex<HashMap<String, HealthReport>>,
    failures: Failures,
}

impl FakeHealth {
    pub fn set(&self, app: &str, status: HealthStatus, revision: &str) {
        self.reports.lock().insert(
            app.to_string(),
            HealthReport {
                status,
                detail: format!("{status:?}"),
                revision: Some(revision.to_string()),
            },
        );
    }

    pub fn set_status(&self, app: &str, status: HealthStatus) {
        if let Some(report) = self.reports.lock().get_mut(app) {
            report.status = status;
        }
    }

    pub fn fail_next(&self, err: CollaboratorError) {
        self.failures.push("get_health", err);
    }
}

#[async_trait]
impl HealthSource for FakeHealth {
    async fn get_health(&self, app: &str) -> Result<HealthReport, CollaboratorError> {
        self.failures.take("get_health")?;
        self.reports
            .lock()
            .get(app)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("app {app}")))
    }
}

#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    replicas: Mutex<HashMap<(String, String), ReplicaStatus>>,
    failures: Failures,
    calls: AtomicUsize,
}

impl FakeOrchestrator {
    pub fn set_replicas(&self, app: &AppTarget, available: u32, desired: u32) {
        self.replicas.lock().insert(
            (app.namespace.clone(), app.workload.clone()),
            ReplicaStatus {
                desired,
                available,
                ready: available,
            },
        );
    }

    pub fn fail_next(&self, err: CollaboratorError) {
        self.failures.push("get_replica_status", err);
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn get_replica_status(&self, namespace: &str, name: &str) -> Result<ReplicaStatus, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures.take("get_replica_status")?;
        self.replicas
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| CollaboratorError::NotFound(format!("{namespace}/{name}")))
    }
}

/// A change held by [`FakeSourceControl`]
#[derive(Debug, Clone)]
pub struct FakeChange {
    pub request: ChangeRequest,
    pub status: ChangeStatus,
    pub labels: Vec<String>,
    pub comments: Vec<String>,
}

#[derive(Debug)]
pub struct FakeSourceControl {
    commits: Mutex<Vec<CommitInfo>>,
    changes: Mutex<BTreeMap<ChangeId, FakeChange>>,
    initial_checks: Mutex<CheckState>,
    history_latency: Mutex<Duration>,
    merge_methods: Mutex<Vec<MergeMethod>>,
    next_id: AtomicU64,
    failures: Failures,
    create_calls: AtomicUsize,
    merge_calls: AtomicUsize,
    close_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl Default for FakeSourceControl {
    fn default() -> Self {
        Self {
            commits: Mutex::new(Vec::new()),
            changes: Mutex::new(BTreeMap::new()),
            initial_checks: Mutex::new(CheckState::Pending),
            history_latency: Mutex::new(Duration::ZERO),
            merge_methods: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures: Failures::default(),
            create_calls: AtomicUsize::new(0),
            merge_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeSourceControl {
    /// Branch history, newest first
    pub fn set_commits(&self, commits: Vec<CommitInfo>) {
        *self.commits.lock() = commits;
    }

    /// Check state new changes start with
    pub fn set_initial_checks(&self, checks: CheckState) {
        *self.initial_checks.lock() = checks;
    }

    /// Delay every history listing by `latency`
    pub fn set_history_latency(&self, latency: Duration) {
        *self.history_latency.lock() = latency;
    }

    /// Seed an existing change, e.g. one persisted before a restart
    pub fn insert_change(&self, change: ChangeRef, request: ChangeRequest, status: ChangeStatus) {
        self.next_id.fetch_max(change.id.0 + 1, Ordering::SeqCst);
        self.changes.lock().insert(
            change.id,
            FakeChange {
                labels: request.labels.clone(),
                request,
                status,
                comments: Vec::new(),
            },
        );
    }

    pub fn set_checks(&self, id: ChangeId, checks: CheckState) {
        self.update(id, |c| c.status.checks = checks);
    }

    pub fn set_state(&self, id: ChangeId, state: ChangeState) {
        self.update(id, |c| c.status.state = state);
    }

    pub fn approve(&self, id: ChangeId) {
        self.update(id, |c| c.status.approved = true);
    }

    fn update(&self, id: ChangeId, f: impl FnOnce(&mut FakeChange)) {
        if let Some(change) = self.changes.lock().get_mut(&id) {
            f(change);
        }
    }

    pub fn fail_next(&self, operation: &'static str, err: CollaboratorError) {
        self.failures.push(operation, err);
    }

    #[must_use]
    pub fn change(&self, id: ChangeId) -> Option<FakeChange> {
        self.changes.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn changes(&self) -> Vec<(ChangeId, FakeChange)> {
        self.changes.lock().iter().map(|(id, c)| (*id, c.clone())).collect()
    }

    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    /// Method passed to every merge call, in call order
    #[must_use]
    pub fn merge_methods(&self) -> Vec<MergeMethod> {
        self.merge_methods.lock().clone()
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn with_change<T>(&self, id: ChangeId, f: impl FnOnce(&mut FakeChange) -> T) -> Result<T, CollaboratorError> {
        self.changes
            .lock()
            .get_mut(&id)
            .map(f)
            .ok_or_else(|| CollaboratorError::NotFound(format!("change {id}")))
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn list_ancestor_commits(
        &self,
        _repo: &str,
        _branch: &str,
        from: &str,
        limit: usize,
    ) -> Result<Vec<CommitInfo>, CollaboratorError> {
        self.failures.take("list_ancestor_commits")?;
        let latency = *self.history_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let commits = self.commits.lock();
        let start = commits.iter().position(|c| c.revision == from).unwrap_or(0);
        Ok(commits.iter().skip(start).take(limit).cloned().collect())
    }

    async fn get_check_status(&self, _repo: &str, change: ChangeId) -> Result<ChangeStatus, CollaboratorError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.take("get_check_status")?;
        self.with_change(change, |c| c.status)
    }

    async fn create_change(&self, request: &ChangeRequest) -> Result<ChangeRef, CollaboratorError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.take("create_change")?;
        let id = ChangeId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let status = ChangeStatus {
            checks: *self.initial_checks.lock(),
            mergeable: true,
            state: ChangeState::Open,
            approved: false,
        };
        self.changes.lock().insert(
            id,
            FakeChange {
                request: request.clone(),
                status,
                labels: request.labels.clone(),
                comments: Vec::new(),
            },
        );
        Ok(ChangeRef {
            id,
            head_branch: request.head_branch.clone(),
            url: Some(format!("https://scm.test/{}/pull/{}", request.repo, id.0)),
        })
    }

    async fn merge_change(
        &self,
        _repo: &str,
        change: ChangeId,
        method: MergeMethod,
    ) -> Result<MergeOutcome, CollaboratorError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.merge_methods.lock().push(method);
        self.failures.take("merge_change")?;
        self.with_change(change, |c| match c.status.state {
            ChangeState::Merged => Ok(MergeOutcome::AlreadyMerged),
            ChangeState::Closed => Err(CollaboratorError::Validation("change is closed".into())),
            ChangeState::Open => {
                c.status.state = ChangeState::Merged;
                Ok(MergeOutcome::Merged)
            }
        })?
    }

    async fn close_change(&self, _repo: &str, change: ChangeId, comment: &str) -> Result<(), CollaboratorError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.take("close_change")?;
        self.with_change(change, |c| {
            c.status.state = ChangeState::Closed;
            c.comments.push(comment.to_string());
        })
    }

    async fn comment_on_change(&self, _repo: &str, change: ChangeId, body: &str) -> Result<(), CollaboratorError> {
        self.failures.take("comment_on_change")?;
        self.with_change(change, |c| c.comments.push(body.to_string()))
    }

    async fn add_labels(&self, _repo: &str, change: ChangeId, labels: Vec<String>) -> Result<(), CollaboratorError> {
        self.failures.take("add_labels")?;
        self.with_change(change, |c| {
            for label in labels {
                if !c.labels.contains(&label) {
                    c.labels.push(label);
                }
            }
        })
    }

    async fn list_open_changes(
        &self,
        repo: &str,
        branch: &str,
        label: &str,
    ) -> Result<Vec<ChangeSummary>, CollaboratorError> {
        self.failures.take("list_open_changes")?;
        Ok(self
            .changes
            .lock()
            .iter()
            .filter(|(_, c)| {
                c.status.state == ChangeState::Open
                    && c.request.repo == repo
                    && c.request.base_branch == branch
                    && c.labels.iter().any(|l| l == label)
            })
            .map(|(id, c)| ChangeSummary {
                id: *id,
                head_branch: c.request.head_branch.clone(),
                labels: c.labels.clone(),
                url: None,
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct FakeUptime {
    by_revision: Mutex<HashMap<String, f64>>,
    failures: Failures,
}

impl FakeUptime {
    pub fn set(&self, revision: &str, percent: f64) {
        self.by_revision.lock().insert(revision.to_string(), percent);
    }

    pub fn fail_next(&self, err: CollaboratorError) {
        self.failures.push("query_uptime", err);
    }
}

#[async_trait]
impl UptimeSource for FakeUptime {
    async fn query_uptime(
        &self,
        _app: &str,
        revision: &str,
        _window: Duration,
    ) -> Result<Option<f64>, CollaboratorError> {
        self.failures.take("query_uptime")?;
        Ok(self.by_revision.lock().get(revision).copied())
    }
}

/// All four fakes plus the [`Collaborators`] built from them
#[derive(Debug, Default, Clone)]
pub struct Harness {
    pub health: Arc<FakeHealth>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub source_control: Arc<FakeSourceControl>,
    pub uptime: Arc<FakeUptime>,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::clone(&self.health) as Arc<dyn HealthSource>,
            Arc::clone(&self.orchestrator) as Arc<dyn Orchestrator>,
            Arc::clone(&self.source_control) as Arc<dyn SourceControl>,
            Arc::clone(&self.uptime) as Arc<dyn UptimeSource>,
        )
    }

    /// `app` degraded at `revision` with 1 of 3 replicas available
    pub fn degrade(&self, app: &AppTarget, revision: &str) {
        self.health.set(&app.name, HealthStatus::Degraded, revision);
        self.orchestrator.set_replicas(app, 1, 3);
    }

    /// `app` healthy with every replica available
    pub fn restore(&self, app: &AppTarget) {
        self.health.set_status(&app.name, HealthStatus::Healthy);
        self.orchestrator.set_replicas(app, 3, 3);
    }

    /// History `ccc` (current), `bbb` (failing checks), `aaa` (stable)
    pub fn standard_history(&self, now: DateTime<Utc>) {
        self.source_control.set_commits(vec![
            commit("ccc", now - ChronoDuration::hours(1), CheckState::Success),
            commit("bbb", now - ChronoDuration::hours(5), CheckState::Failure),
            commit("aaa", now - ChronoDuration::days(2), CheckState::Success),
        ]);
        self.uptime.set("aaa", 99.8);
    }
}

fn target(name: &str, environment: Environment) -> AppTarget {
    AppTarget {
        name: name.to_string(),
        environment,
        repo: format!("org/{name}"),
        branch: "main".to_string(),
        namespace: "apps".to_string(),
        workload: name.to_string(),
    }
}

#[must_use]
pub fn staging_app() -> AppTarget {
    target("checkout", Environment::Staging)
}

#[must_use]
pub fn production_app() -> AppTarget {
    target("payments", Environment::Production)
}

#[must_use]
pub fn commit(revision: &str, date: DateTime<Utc>, checks: CheckState) -> CommitInfo {
    CommitInfo {
        revision: revision.to_string(),
        message: format!("change {revision}"),
        author: "dev@example.com".to_string(),
        date,
        checks,
    }
}

/// 40-hex-character revision
#[must_use]
pub fn random_revision() -> String {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let b = uuid::Uuid::new_v4().simple().to_string();
    format!("{a}{b}")[..40].to_string()
}

/// Defaults with a 30s recovery window and no retry delay
#[must_use]
pub fn test_config(apps: Vec<AppTarget>) -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_apps(apps)
        .with_recovery_window(Duration::from_secs(30));
    config.retry_base_delay_ms = 0;
    config
}
