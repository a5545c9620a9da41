use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use rollback_core::{
    AbortReason, Action, CorrelationId, EventKey, EventKind, FsmState, RollbackAttempt, SampleWindow, StoreError,
};
use rollback_kernel::{FileStateStore, MemoryStateStore, RetentionPolicy, StateStore};
use rollback_test_utils::{production_app, staging_app};
use tempfile::TempDir;

fn attempt(state: FsmState, created_ago: ChronoDuration) -> RollbackAttempt {
    let created = Utc::now() - created_ago;
    let mut attempt = RollbackAttempt::new(CorrelationId::new(), staging_app(), "ccc", SampleWindow::new(), created);
    attempt.enter(state, created + ChronoDuration::seconds(1));
    attempt
}

fn stores() -> (TempDir, Vec<Box<dyn StateStore>>) {
    let dir = TempDir::new().unwrap();
    let file = FileStateStore::open(dir.path().join("state")).unwrap();
    (dir, vec![Box::new(MemoryStateStore::new()), Box::new(file)])
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let (_dir, stores) = stores();
    for store in stores {
        let mut a = attempt(FsmState::ChangeProposed, ChronoDuration::minutes(5));
        a.applied_events.insert(EventKey {
            kind: EventKind::ChangeCreated,
            sequence: 12,
        });
        store.put(&a).await.unwrap();

        let loaded = store.get(a.correlation_id).await.unwrap().unwrap();
        assert_eq!(loaded.fsm_state, FsmState::ChangeProposed);
        assert_eq!(loaded.applied_events, a.applied_events);
        assert_eq!(loaded.updated_at, a.updated_at);
        assert!(store.get(CorrelationId::new()).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let (_dir, stores) = stores();
    for store in stores {
        let mut a = attempt(FsmState::DegradationDetected, ChronoDuration::minutes(5));
        store.put(&a).await.unwrap();
        let stale = a.clone();

        a.enter(FsmState::CandidateResolved, Utc::now());
        store.put(&a).await.unwrap();

        let err = store.put(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Stale(id) if id == a.correlation_id));
        // Same timestamp is not newer either
        assert!(store.put(&a).await.is_err());
        let current = store.get(a.correlation_id).await.unwrap().unwrap();
        assert_eq!(current.fsm_state, FsmState::CandidateResolved);
    }
}

#[tokio::test]
async fn test_list_in_flight_and_max_sequence() {
    let (_dir, stores) = stores();
    for store in stores {
        let mut live = attempt(FsmState::ChangeProposed, ChronoDuration::hours(3));
        live.applied_events.insert(EventKey {
            kind: EventKind::CiResult,
            sequence: 77,
        });
        let done = attempt(FsmState::RollbackComplete, ChronoDuration::hours(2));
        let mut retired = attempt(FsmState::Idle, ChronoDuration::hours(1));
        retired.retired = true;
        for a in [&live, &done, &retired] {
            store.put(a).await.unwrap();
        }

        let all = store.list().await.unwrap();
        assert_eq!(
            all.iter().map(|a| a.correlation_id).collect::<Vec<_>>(),
            vec![live.correlation_id, done.correlation_id, retired.correlation_id]
        );
        let in_flight = store.list_in_flight().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].correlation_id, live.correlation_id);
        assert_eq!(store.max_sequence().await.unwrap(), 77);
    }
}

#[tokio::test]
async fn test_recoverable_includes_unfinished_actions() {
    let (_dir, stores) = stores();
    for store in stores {
        let live = attempt(FsmState::Merged, ChronoDuration::hours(3));
        let mut escalating = attempt(FsmState::Abort, ChronoDuration::hours(2));
        escalating.pending_actions = vec![
            Action::CancelWaits,
            Action::Escalate {
                reason: AbortReason::ChecksTimedOut,
            },
        ];
        let escalated = attempt(FsmState::Abort, ChronoDuration::minutes(90));
        let mut closing = attempt(FsmState::Idle, ChronoDuration::hours(1));
        closing.pending_actions = vec![Action::Retire];
        for a in [&live, &escalating, &escalated, &closing] {
            store.put(a).await.unwrap();
        }

        let ids: Vec<_> = store
            .list_recoverable()
            .await
            .unwrap()
            .iter()
            .map(|a| a.correlation_id)
            .collect();
        assert_eq!(ids, vec![live.correlation_id, escalating.correlation_id, closing.correlation_id]);
        assert_eq!(store.list_in_flight().await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_purge_respects_retention() {
    let (_dir, stores) = stores();
    let now = Utc::now();
    for store in stores {
        let old_complete = attempt(FsmState::RollbackComplete, ChronoDuration::days(8));
        let recent_complete = attempt(FsmState::RollbackComplete, ChronoDuration::days(2));
        let mut old_abort = attempt(FsmState::Abort, ChronoDuration::days(31));
        old_abort.abort_reason = Some(AbortReason::ChecksFailed);
        let recent_abort = attempt(FsmState::Abort, ChronoDuration::days(10));
        let old_live = attempt(FsmState::ChangeProposed, ChronoDuration::days(40));
        for a in [&old_complete, &recent_complete, &old_abort, &recent_abort, &old_live] {
            store.put(a).await.unwrap();
        }

        let mut purged = store.purge_expired(now, &RetentionPolicy::default()).await.unwrap();
        purged.sort();
        let mut expected = vec![old_complete.correlation_id, old_abort.correlation_id];
        expected.sort();
        assert_eq!(purged, expected);
        assert_eq!(store.list().await.unwrap().len(), 3);
        assert!(store.get(old_live.correlation_id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_file_store_survives_reopen_and_skips_garbage() {
    let dir = TempDir::new().unwrap();
    let a = {
        let store = FileStateStore::open(dir.path()).unwrap();
        let mut a = attempt(FsmState::AwaitingMergeDecision, ChronoDuration::minutes(10));
        a.app = production_app();
        store.put(&a).await.unwrap();
        a
    };
    std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let reopened = FileStateStore::open(dir.path()).unwrap();
    let all = reopened.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].correlation_id, a.correlation_id);
    assert_eq!(all[0].app, production_app());

    assert!(reopened.remove(a.correlation_id).await.unwrap());
    assert!(!reopened.remove(a.correlation_id).await.unwrap());
    assert!(reopened.list().await.unwrap().is_empty());
}
