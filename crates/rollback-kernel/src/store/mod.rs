//! Durable snapshots of rollback attempts
//!
//! Every attempt is addressable by correlation id. Writes are last-write-wins
//! per key with a strictly increasing `updated_at`; a write carrying an older
//! or equal timestamp than the stored record is rejected as stale.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollback_core::{CorrelationId, EngineConfig, FsmState, RollbackAttempt, StoreError};
use std::fmt;

/// How long finished attempts are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: chrono::Duration,
    pub aborted: chrono::Duration,
    pub retired: chrono::Duration,
}

impl RetentionPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            completed: config.retention_completed(),
            aborted: config.retention_aborted(),
            retired: config.retention_completed(),
        }
    }

    /// Attempt is finished and older than its retention
    #[must_use]
    pub fn is_expired(&self, attempt: &RollbackAttempt, now: DateTime<Utc>) -> bool {
        let keep = match attempt.fsm_state {
            FsmState::RollbackComplete => self.completed,
            FsmState::Abort => self.aborted,
            _ if attempt.retired => self.retired,
            _ => return false,
        };
        now - attempt.updated_at > keep
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Keyed store of attempt snapshots
#[async_trait]
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Insert or replace; rejects writes not newer than the stored record
    async fn put(&self, attempt: &RollbackAttempt) -> Result<(), StoreError>;

    async fn get(&self, id: CorrelationId) -> Result<Option<RollbackAttempt>, StoreError>;

    /// Every stored attempt, oldest first
    async fn list(&self) -> Result<Vec<RollbackAttempt>, StoreError>;

    async fn remove(&self, id: CorrelationId) -> Result<bool, StoreError>;

    /// Attempts that still need a worker
    async fn list_in_flight(&self) -> Result<Vec<RollbackAttempt>, StoreError> {
        Ok(self.list().await?.into_iter().filter(RollbackAttempt::is_in_flight).collect())
    }

    /// In-flight attempts plus any attempt with unfinished actions
    async fn list_recoverable(&self) -> Result<Vec<RollbackAttempt>, StoreError> {
        Ok(self.list().await?.into_iter().filter(RollbackAttempt::needs_recovery).collect())
    }

    /// Highest event sequence applied by any stored attempt
    async fn max_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.list().await?.iter().map(RollbackAttempt::max_sequence).max().unwrap_or(0))
    }

    /// Delete finished attempts past retention, returning their ids
    async fn purge_expired(&self, now: DateTime<Utc>, policy: &RetentionPolicy) -> Result<Vec<CorrelationId>, StoreError> {
        let mut purged = Vec::new();
        for attempt in self.list().await? {
            if policy.is_expired(&attempt, now) && self.remove(attempt.correlation_id).await? {
                tracing::info!(
                    correlation_id = %attempt.correlation_id,
                    state = %attempt.fsm_state,
                    "purged attempt past retention"
                );
                purged.push(attempt.correlation_id);
            }
        }
        Ok(purged)
    }
}

/// Reject a write that is not newer than what is stored
pub(crate) fn check_fresh(existing: Option<&RollbackAttempt>, incoming: &RollbackAttempt) -> Result<(), StoreError> {
    match existing {
        Some(current) if current.updated_at >= incoming.updated_at => {
            tracing::warn!(
                correlation_id = %incoming.correlation_id,
                stored = %current.updated_at,
                incoming = %incoming.updated_at,
                "rejecting stale attempt write"
            );
            Err(StoreError::Stale(incoming.correlation_id))
        }
        _ => Ok(()),
    }
}
