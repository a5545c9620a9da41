//! Engine configuration
//!
//! One immutable value built once at startup (usually from TOML) and handed
//! to every component constructor.

use crate::error::ConfigError;
use crate::ports::MergeMethod;
use crate::types::AppTarget;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Health polling interval
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Candidate search time budget
    #[serde(default = "defaults::candidate_search_budget_secs")]
    pub candidate_search_budget_secs: u64,
    /// Bound on waiting for checks on a proposal
    #[serde(default = "defaults::check_wait_secs")]
    pub check_wait_secs: u64,
    /// Bound on waiting for production approval
    #[serde(default = "defaults::approval_wait_secs")]
    pub approval_wait_secs: u64,
    /// Bound on post-merge health confirmation
    #[serde(default = "defaults::health_confirmation_secs")]
    pub health_confirmation_secs: u64,
    /// Continuous healthy time required to confirm a rollback
    #[serde(default = "defaults::confirmation_window_secs")]
    pub confirmation_window_secs: u64,
    /// Continuous healthy time that counts as independent recovery.
    /// Deliberately without a serde default.
    pub recovery_window_secs: u64,
    /// Commits examined by the candidate search
    #[serde(default = "defaults::history_max_commits")]
    pub history_max_commits: usize,
    /// Oldest commit age examined by the candidate search
    #[serde(default = "defaults::history_max_age_days")]
    pub history_max_age_days: u64,
    /// Minimum historical uptime of a candidate
    #[serde(default = "defaults::uptime_threshold_percent")]
    pub uptime_threshold_percent: f64,
    /// Window of the historical uptime query
    #[serde(default = "defaults::uptime_window_hours")]
    pub uptime_window_hours: u64,
    /// Age after which a recovered attempt is force-aborted
    #[serde(default = "defaults::stale_after_hours")]
    pub stale_after_hours: u64,
    /// Retention of completed and retired attempts
    #[serde(default = "defaults::retention_completed_days")]
    pub retention_completed_days: u64,
    /// Retention of aborted attempts
    #[serde(default = "defaults::retention_aborted_days")]
    pub retention_aborted_days: u64,
    /// Retries of a transient collaborator failure
    #[serde(default = "defaults::retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// First backoff delay, doubled per retry
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Label carried by every rollback proposal
    #[serde(default = "defaults::rollback_label")]
    pub rollback_label: String,
    /// Label requesting human approval
    #[serde(default = "defaults::approval_label")]
    pub approval_label: String,
    /// Merge method used for rollback proposals
    #[serde(default)]
    pub merge_method: MergeMethod,
    /// Monitored applications
    #[serde(default)]
    pub apps: Vec<AppTarget>,
}

mod defaults {
    pub(super) fn poll_interval_secs() -> u64 {
        10
    }
    pub(super) fn candidate_search_budget_secs() -> u64 {
        120
    }
    pub(super) fn check_wait_secs() -> u64 {
        300
    }
    pub(super) fn approval_wait_secs() -> u64 {
        3600
    }
    pub(super) fn health_confirmation_secs() -> u64 {
        600
    }
    pub(super) fn confirmation_window_secs() -> u64 {
        60
    }
    pub(super) fn history_max_commits() -> usize {
        50
    }
    pub(super) fn history_max_age_days() -> u64 {
        30
    }
    pub(super) fn uptime_threshold_percent() -> f64 {
        99.0
    }
    pub(super) fn uptime_window_hours() -> u64 {
        24
    }
    pub(super) fn stale_after_hours() -> u64 {
        24
    }
    pub(super) fn retention_completed_days() -> u64 {
        7
    }
    pub(super) fn retention_aborted_days() -> u64 {
        30
    }
    pub(super) fn retry_max_attempts() -> u32 {
        3
    }
    pub(super) fn retry_base_delay_ms() -> u64 {
        1000
    }
    pub(super) fn rollback_label() -> String {
        "auto-rollback".to_string()
    }
    pub(super) fn approval_label() -> String {
        "needs-human-approval".to_string()
    }
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// With monitored apps
    #[inline]
    #[must_use]
    pub fn with_apps(mut self, apps: Vec<AppTarget>) -> Self {
        self.apps = apps;
        self
    }

    /// With recovery window
    #[inline]
    #[must_use]
    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window_secs = window.as_secs();
        self
    }

    /// Reject configurations the engine cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("candidate_search_budget_secs", self.candidate_search_budget_secs),
            ("check_wait_secs", self.check_wait_secs),
            ("approval_wait_secs", self.approval_wait_secs),
            ("health_confirmation_secs", self.health_confirmation_secs),
            ("recovery_window_secs", self.recovery_window_secs),
            ("stale_after_hours", self.stale_after_hours),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.history_max_commits == 0 {
            return Err(ConfigError::Invalid("history_max_commits must be greater than zero".into()));
        }
        if !(0.0..=100.0).contains(&self.uptime_threshold_percent) {
            return Err(ConfigError::Invalid("uptime_threshold_percent must be within 0..=100".into()));
        }
        if self.confirmation_window_secs > self.health_confirmation_secs {
            return Err(ConfigError::Invalid(
                "confirmation_window_secs cannot exceed health_confirmation_secs".into(),
            ));
        }
        if self.rollback_label.trim().is_empty() {
            return Err(ConfigError::Invalid("rollback_label must not be empty".into()));
        }
        let mut keys: Vec<String> = self.apps.iter().map(AppTarget::key).collect();
        keys.sort();
        if let Some(dup) = keys.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(format!("app {} configured twice", dup[0])));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[inline]
    #[must_use]
    pub fn candidate_search_budget(&self) -> Duration {
        Duration::from_secs(self.candidate_search_budget_secs)
    }

    #[inline]
    #[must_use]
    pub fn check_wait(&self) -> Duration {
        Duration::from_secs(self.check_wait_secs)
    }

    #[inline]
    #[must_use]
    pub fn approval_wait(&self) -> Duration {
        Duration::from_secs(self.approval_wait_secs)
    }

    #[inline]
    #[must_use]
    pub fn health_confirmation(&self) -> Duration {
        Duration::from_secs(self.health_confirmation_secs)
    }

    #[inline]
    #[must_use]
    pub fn confirmation_window(&self) -> Duration {
        Duration::from_secs(self.confirmation_window_secs)
    }

    #[inline]
    #[must_use]
    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }

    #[inline]
    #[must_use]
    pub fn history_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::try_from(self.history_max_age_days).unwrap_or(i64::MAX / 86_400_000))
    }

    #[inline]
    #[must_use]
    pub fn uptime_window(&self) -> Duration {
        Duration::from_secs(self.uptime_window_hours * 3600)
    }

    #[inline]
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.stale_after_hours).unwrap_or(i64::MAX / 3_600_000))
    }

    #[inline]
    #[must_use]
    pub fn retention_completed(&self) -> chrono::Duration {
        chrono::Duration::days(i64::try_from(self.retention_completed_days).unwrap_or(0))
    }

    #[inline]
    #[must_use]
    pub fn retention_aborted(&self) -> chrono::Duration {
        chrono::Duration::days(i64::try_from(self.retention_aborted_days).unwrap_or(0))
    }

    #[inline]
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for EngineConfig {
    /// Defaults for embedding and tests. The recovery window mirrors the
    /// 3-sample persistence window at the default poll interval.
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::poll_interval_secs(),
            candidate_search_budget_secs: defaults::candidate_search_budget_secs(),
            check_wait_secs: defaults::check_wait_secs(),
            approval_wait_secs: defaults::approval_wait_secs(),
            health_confirmation_secs: defaults::health_confirmation_secs(),
            confirmation_window_secs: defaults::confirmation_window_secs(),
            recovery_window_secs: defaults::poll_interval_secs() * crate::types::SAMPLE_WINDOW as u64,
            history_max_commits: defaults::history_max_commits(),
            history_max_age_days: defaults::history_max_age_days(),
            uptime_threshold_percent: defaults::uptime_threshold_percent(),
            uptime_window_hours: defaults::uptime_window_hours(),
            stale_after_hours: defaults::stale_after_hours(),
            retention_completed_days: defaults::retention_completed_days(),
            retention_aborted_days: defaults::retention_aborted_days(),
            retry_max_attempts: defaults::retry_max_attempts(),
            retry_base_delay_ms: defaults::retry_base_delay_ms(),
            rollback_label: defaults::rollback_label(),
            approval_label: defaults::approval_label(),
            merge_method: MergeMethod::default(),
            apps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;

    const SAMPLE: &str = r#"
        recovery_window_secs = 45
        check_wait_secs = 200

        [[apps]]
        name = "checkout"
        environment = "staging"
        repo = "acme/deploy"
        branch = "main"
        namespace = "shop"
        workload = "checkout"
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.recovery_window(), Duration::from_secs(45));
        assert_eq!(config.check_wait(), Duration::from_secs(200));
        assert_eq!(config.candidate_search_budget(), Duration::from_secs(120));
        assert_eq!(config.approval_wait(), Duration::from_secs(3600));
        assert_eq!(config.apps.len(), 1);
        assert_eq!(config.apps[0].environment, Environment::Staging);
        assert_eq!(config.merge_method, MergeMethod::Squash);
    }

    #[test]
    fn parses_merge_method() {
        let config = EngineConfig::from_toml_str("recovery_window_secs = 30\nmerge_method = \"rebase\"").unwrap();
        assert_eq!(config.merge_method, MergeMethod::Rebase);
        assert!(EngineConfig::from_toml_str("recovery_window_secs = 30\nmerge_method = \"octopus\"").is_err());
    }

    #[test]
    fn recovery_window_is_required_in_toml() {
        let err = EngineConfig::from_toml_str("check_wait_secs = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_zero_bounds() {
        let err = EngineConfig::from_toml_str("recovery_window_secs = 30\ncheck_wait_secs = 0").unwrap_err();
        assert!(err.to_string().contains("check_wait_secs"));
    }

    #[test]
    fn rejects_duplicate_apps() {
        let doubled = format!("{SAMPLE}\n{}", &SAMPLE[SAMPLE.find("[[apps]]").unwrap()..]);
        assert!(EngineConfig::from_toml_str(&doubled).is_err());
    }

    #[test]
    fn default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn bundled_example_config_is_valid() {
        let config = EngineConfig::from_toml_str(include_str!("../../../config/rollback.example.toml")).unwrap();
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.recovery_window(), Duration::from_secs(60));
        assert_eq!(config.merge_method, MergeMethod::Squash);
    }
}
