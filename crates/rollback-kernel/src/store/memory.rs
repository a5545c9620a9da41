use super::{check_fresh, StateStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rollback_core::{CorrelationId, RollbackAttempt, StoreError};

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    attempts: DashMap<CorrelationId, RollbackAttempt>,
}

impl MemoryStateStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, attempt: &RollbackAttempt) -> Result<(), StoreError> {
        match self.attempts.entry(attempt.correlation_id) {
            Entry::Occupied(mut stored) => {
                check_fresh(Some(stored.get()), attempt)?;
                stored.insert(attempt.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(attempt.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, id: CorrelationId) -> Result<Option<RollbackAttempt>, StoreError> {
        Ok(self.attempts.get(&id).map(|a| a.clone()))
    }

    async fn list(&self) -> Result<Vec<RollbackAttempt>, StoreError> {
        let mut all: Vec<_> = self.attempts.iter().map(|a| a.value().clone()).collect();
        all.sort_by_key(|a| (a.created_at, a.correlation_id));
        Ok(all)
    }

    async fn remove(&self, id: CorrelationId) -> Result<bool, StoreError> {
        Ok(self.attempts.remove(&id).is_some())
    }
}
