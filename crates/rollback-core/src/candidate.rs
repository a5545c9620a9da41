//! Candidate resolution
//!
//! Walks the ancestors of the current revision, newest first, and returns
//! the first commit that:
//! 1. is a strict ancestor of the current revision
//! 2. had successful checks
//! 3. kept uptime at or above the threshold while live, or, when the uptime
//!    source is unavailable, falls back to (2) alone
//!
//! The walk is bounded by commit count, commit age and a time budget.

use crate::config::EngineConfig;
use crate::error::{CallError, CollaboratorError};
use crate::ports::{CheckState, CommitInfo, Collaborators};
use crate::retry::RetryPolicy;
use crate::telemetry;
use crate::types::{AppTarget, Candidate, Clock};
use std::sync::Arc;

/// Outcome of a candidate search
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Candidate),
    /// Search window exhausted
    NotFound { examined: usize },
    /// Time budget elapsed first
    TimedOut,
}

/// Finds a stable rollback target in commit history
#[derive(Debug, Clone)]
pub struct CandidateResolver {
    collaborators: Collaborators,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl CandidateResolver {
    #[must_use]
    pub fn new(collaborators: Collaborators, config: Arc<EngineConfig>, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            collaborators,
            config,
            retry,
            clock,
        }
    }

    /// Search under the configured time budget
    pub async fn resolve(&self, app: &AppTarget, current_revision: &str) -> Result<Resolution, CallError> {
        let budget = self.config.candidate_search_budget();
        match tokio::time::timeout(budget, self.search(app, current_revision)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(app = %app.name, ?budget, "candidate search exceeded its time budget");
                Ok(Resolution::TimedOut)
            }
        }
    }

    async fn search(&self, app: &AppTarget, current_revision: &str) -> Result<Resolution, CallError> {
        let sc = &self.collaborators.source_control;
        let limit = self.config.history_max_commits;
        let commits = self
            .retry
            .call("list_ancestor_commits", || {
                sc.list_ancestor_commits(&app.repo, &app.branch, current_revision, limit)
            })
            .await?;

        let oldest = self.clock.now() - self.config.history_max_age();
        let mut examined = 0;
        for commit in commits.iter().take(limit).filter(|c| c.date >= oldest) {
            examined += 1;
            if commit.revision == current_revision {
                continue;
            }
            if commit.checks != CheckState::Success {
                tracing::debug!(app = %app.name, revision = %commit.revision, checks = ?commit.checks, "candidate rejected: checks");
                continue;
            }
            match self.uptime(app, commit).await? {
                Some(percent) if percent >= self.config.uptime_threshold_percent => {
                    tracing::info!(app = %app.name, revision = %commit.revision, uptime = percent, "candidate resolved");
                    return Ok(Resolution::Found(candidate(commit, Some(percent), false)));
                }
                Some(percent) => {
                    tracing::debug!(app = %app.name, revision = %commit.revision, uptime = percent, "candidate rejected: uptime");
                }
                None => {
                    tracing::warn!(
                        app = %app.name,
                        revision = %commit.revision,
                        "uptime unavailable; accepting candidate on checks alone"
                    );
                    telemetry::record_uptime_fallback(&app.name, "candidate");
                    return Ok(Resolution::Found(candidate(commit, None, true)));
                }
            }
        }

        tracing::warn!(app = %app.name, examined, "no acceptable candidate in search window");
        Ok(Resolution::NotFound { examined })
    }

    /// Uptime of a commit; `None` when the source is unavailable
    async fn uptime(&self, app: &AppTarget, commit: &CommitInfo) -> Result<Option<f64>, CallError> {
        let window = self.config.uptime_window();
        let uptime = &self.collaborators.uptime;
        match self
            .retry
            .call("query_uptime", || uptime.query_uptime(&app.name, &commit.revision, window))
            .await
        {
            Ok(percent) => Ok(percent),
            Err(e) if matches!(e.source, CollaboratorError::PermissionDenied(_)) => Err(e),
            Err(e) => {
                tracing::warn!(app = %app.name, revision = %commit.revision, error = %e, "uptime query failed");
                Ok(None)
            }
        }
    }
}

fn candidate(commit: &CommitInfo, upstream_uptime_percent: Option<f64>, uptime_fallback: bool) -> Candidate {
    Candidate {
        revision: commit.revision.clone(),
        commit_message: commit.message.clone(),
        commit_author: commit.author.clone(),
        commit_date: commit.date,
        upstream_uptime_percent,
        ci_passed: commit.checks == CheckState::Success,
        uptime_fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MockHealthSource, MockOrchestrator, MockSourceControl, MockUptimeSource};
    use crate::types::{Environment, TokioClock};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn app() -> AppTarget {
        AppTarget {
            name: "checkout".to_string(),
            environment: Environment::Staging,
            repo: "acme/deploy".to_string(),
            branch: "main".to_string(),
            namespace: "shop".to_string(),
            workload: "checkout".to_string(),
        }
    }

    fn commit(revision: &str, hours_ago: i64, checks: CheckState) -> CommitInfo {
        CommitInfo {
            revision: revision.to_string(),
            message: format!("deploy {revision}"),
            author: "dev".to_string(),
            date: now() - ChronoDuration::hours(hours_ago),
            checks,
        }
    }

    fn resolver(sc: MockSourceControl, uptime: MockUptimeSource) -> CandidateResolver {
        let collaborators = Collaborators::new(
            Arc::new(MockHealthSource::new()),
            Arc::new(MockOrchestrator::new()),
            Arc::new(sc),
            Arc::new(uptime),
        );
        CandidateResolver::new(
            collaborators,
            Arc::new(EngineConfig::default()),
            RetryPolicy::default(),
            Arc::new(TokioClock::starting_at(now())),
        )
    }

    fn history() -> Vec<CommitInfo> {
        vec![
            commit("ddd", 1, CheckState::Success),
            commit("ccc", 2, CheckState::Failure),
            commit("bbb", 3, CheckState::Success),
            commit("aaa", 4, CheckState::Success),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn picks_newest_stable_ancestor() {
        let mut sc = MockSourceControl::new();
        sc.expect_list_ancestor_commits()
            .withf(|repo, branch, from, limit| repo == "acme/deploy" && branch == "main" && from == "ddd" && *limit == 50)
            .returning(|_, _, _, _| Ok(history()));
        let mut uptime = MockUptimeSource::new();
        uptime
            .expect_query_uptime()
            .withf(|_, rev, _| rev == "bbb")
            .returning(|_, _, _| Ok(Some(95.0)));
        uptime
            .expect_query_uptime()
            .withf(|_, rev, _| rev == "aaa")
            .returning(|_, _, _| Ok(Some(99.8)));

        let resolver = resolver(sc, uptime);
        let first = resolver.resolve(&app(), "ddd").await.unwrap();
        let second = resolver.resolve(&app(), "ddd").await.unwrap();
        let Resolution::Found(found) = &first else {
            panic!("expected a candidate, got {first:?}");
        };
        assert_eq!(found.revision, "aaa");
        assert!(!found.uptime_fallback);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_checks_when_uptime_unavailable() {
        let mut sc = MockSourceControl::new();
        sc.expect_list_ancestor_commits().returning(|_, _, _, _| Ok(history()));
        let mut uptime = MockUptimeSource::new();
        uptime
            .expect_query_uptime()
            .withf(|app, rev, window| app == "checkout" && rev == "bbb" && *window == Duration::from_secs(24 * 3600))
            .returning(|_, _, _| Err(CollaboratorError::NotFound("no data".into())));

        let found = resolver(sc, uptime).resolve(&app(), "ddd").await.unwrap();
        let Resolution::Found(candidate) = found else {
            panic!("expected fallback candidate");
        };
        assert_eq!(candidate.revision, "bbb");
        assert!(candidate.uptime_fallback);
        assert_eq!(candidate.upstream_uptime_percent, None);
    }

    #[tokio::test(start_paused = true)]
    async fn old_commits_are_outside_the_window() {
        let mut sc = MockSourceControl::new();
        sc.expect_list_ancestor_commits()
            .returning(|_, _, _, _| Ok(vec![commit("ddd", 1, CheckState::Success), commit("old", 24 * 31, CheckState::Success)]));
        let uptime = MockUptimeSource::new();

        let result = resolver(sc, uptime).resolve(&app(), "ddd").await.unwrap();
        assert_eq!(result, Resolution::NotFound { examined: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn permission_error_propagates() {
        let mut sc = MockSourceControl::new();
        sc.expect_list_ancestor_commits()
            .returning(|_, _, _, _| Err(CollaboratorError::PermissionDenied("403".into())));
        let err = resolver(sc, MockUptimeSource::new()).resolve(&app(), "ddd").await.unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_budget_times_out() {
        let mut sc = MockSourceControl::new();
        sc.expect_list_ancestor_commits()
            .returning(|_, _, _, _| Err(CollaboratorError::Transient("slow".into())));
        let mut config = EngineConfig::default();
        config.candidate_search_budget_secs = 5;
        let collaborators = Collaborators::new(
            Arc::new(MockHealthSource::new()),
            Arc::new(MockOrchestrator::new()),
            Arc::new(sc),
            Arc::new(MockUptimeSource::new()),
        );
        let resolver = CandidateResolver::new(
            collaborators,
            Arc::new(config),
            RetryPolicy::default(),
            Arc::new(TokioClock::starting_at(now())),
        );
        assert_eq!(resolver.resolve(&app(), "ddd").await.unwrap(), Resolution::TimedOut);
    }
}
