//! Collaborator ports
//!
//! Typed interfaces to the four external systems the engine consumes:
//! - Deployment-health source (aggregate health and synced revision)
//! - Container orchestrator (replica counts)
//! - Source-control host (history, proposals, checks, merges)
//! - Historical uptime source
//!
//! Implementations never retry internally; the engine applies
//! [`RetryPolicy`](crate::retry::RetryPolicy) around every call.

use crate::error::CollaboratorError;
use crate::types::{ChangeId, ChangeRef, HealthStatus, ReplicaStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Aggregate health of an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub detail: String,
    /// Revision currently synced to the cluster
    pub revision: Option<String>,
}

/// Aggregate state of checks on a commit or change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
}

/// Lifecycle state of a proposed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    Open,
    Merged,
    Closed,
}

/// Check status of a proposed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub checks: CheckState,
    /// No conflicts and branch policy satisfied
    pub mergeable: bool,
    pub state: ChangeState,
    /// An approving review is present
    pub approved: bool,
}

/// One ancestor commit on the target branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub revision: String,
    pub message: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub checks: CheckState,
}

/// Everything needed to open a rollback proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub repo: String,
    pub base_branch: String,
    pub head_branch: String,
    pub target_revision: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// An open change as listed by the source-control host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub id: ChangeId,
    pub head_branch: String,
    pub labels: Vec<String>,
    pub url: Option<String>,
}

impl ChangeSummary {
    /// Carries `label`
    #[inline]
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Reference usable as an attempt's `change_ref`
    #[must_use]
    pub fn to_ref(&self) -> ChangeRef {
        ChangeRef {
            id: self.id,
            head_branch: self.head_branch.clone(),
            url: self.url.clone(),
        }
    }
}

/// Result of a merge call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    /// Change was merged by an earlier call; treated as success
    AlreadyMerged,
}

/// How the source-control host combines a proposal into its base branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment-health source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn get_health(&self, app: &str) -> Result<HealthReport, CollaboratorError>;
}

/// Container orchestrator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_replica_status(&self, namespace: &str, name: &str) -> Result<ReplicaStatus, CollaboratorError>;
}

/// Source-control host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Ancestors of `from` on `branch`, newest first, at most `limit`
    async fn list_ancestor_commits(
        &self,
        repo: &str,
        branch: &str,
        from: &str,
        limit: usize,
    ) -> Result<Vec<CommitInfo>, CollaboratorError>;

    async fn get_check_status(&self, repo: &str, change: ChangeId) -> Result<ChangeStatus, CollaboratorError>;

    async fn create_change(&self, request: &ChangeRequest) -> Result<ChangeRef, CollaboratorError>;

    /// Merge with `method`; a change merged earlier reports `AlreadyMerged`
    async fn merge_change(
        &self,
        repo: &str,
        change: ChangeId,
        method: MergeMethod,
    ) -> Result<MergeOutcome, CollaboratorError>;

    async fn close_change(&self, repo: &str, change: ChangeId, comment: &str) -> Result<(), CollaboratorError>;

    async fn comment_on_change(&self, repo: &str, change: ChangeId, body: &str) -> Result<(), CollaboratorError>;

    async fn add_labels(&self, repo: &str, change: ChangeId, labels: Vec<String>) -> Result<(), CollaboratorError>;

    /// Open changes against `branch` carrying `label`
    async fn list_open_changes(
        &self,
        repo: &str,
        branch: &str,
        label: &str,
    ) -> Result<Vec<ChangeSummary>, CollaboratorError>;
}

/// Historical uptime source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UptimeSource: Send + Sync {
    /// Uptime percent of `revision` while it was live; `None` when unavailable
    async fn query_uptime(
        &self,
        app: &str,
        revision: &str,
        window: Duration,
    ) -> Result<Option<f64>, CollaboratorError>;
}

/// Handles to every collaborator
#[derive(Clone)]
pub struct Collaborators {
    pub health: Arc<dyn HealthSource>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub source_control: Arc<dyn SourceControl>,
    pub uptime: Arc<dyn UptimeSource>,
}

impl Collaborators {
    #[must_use]
    pub fn new(
        health: Arc<dyn HealthSource>,
        orchestrator: Arc<dyn Orchestrator>,
        source_control: Arc<dyn SourceControl>,
        uptime: Arc<dyn UptimeSource>,
    ) -> Self {
        Self {
            health,
            orchestrator,
            source_control,
            uptime,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
