//! Lock ordering, wait-die back-off, and lock release across batch outcomes.

mod common;

use common::*;
use sobek::{
    BatchRowSource, CoordinatorState, EnlistConfig, EnlistItem, EnlistOperation, GridError,
    LockOwner, LockRequest, LockTable, Result, RowSource,
};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

fn owner(tx_version: u64) -> LockOwner {
    LockOwner { tx_version, node: 1 }
}

fn lock(key: &str, tx_version: u64, timeout_ms: u64) -> LockRequest {
    LockRequest {
        key: key.to_string(),
        owner: owner(tx_version),
        timeout_ms,
    }
}

#[tokio::test]
async fn release_is_idempotent_and_frees_the_key() {
    let table = Arc::new(LockTable::new());

    let handle = table.acquire(lock("k", 1, 100)).await.unwrap();
    assert_eq!(table.held_by(owner(1)), 1);
    handle.release();
    handle.release();
    assert_eq!(table.held_by(owner(1)), 0);
    assert_eq!(table.outstanding(), 0);

    // Another transaction can take the key immediately.
    let handle = table.acquire(lock("k", 2, 100)).await.unwrap();
    assert_eq!(table.held_by(owner(2)), 1);
    drop(handle);
    assert_eq!(table.outstanding(), 0);
}

#[tokio::test]
async fn reacquiring_a_held_key_is_granted() {
    let table = Arc::new(LockTable::new());

    let first = table.acquire(lock("k", 1, 100)).await.unwrap();
    let second = table.acquire(lock("k", 1, 100)).await.unwrap();
    assert_eq!(table.held_by(owner(1)), 1);

    drop(first);
    // Still held until the last handle goes.
    assert_eq!(table.held_by(owner(1)), 1);
    drop(second);
    assert_eq!(table.held_by(owner(1)), 0);
}

#[tokio::test]
async fn younger_transaction_backs_off_an_older_holder() {
    let table = Arc::new(LockTable::new());

    let _held = table.acquire(lock("k", 1, 100)).await.unwrap();
    let err = table.acquire(lock("k", 2, 100)).await.unwrap_err();
    assert_eq!(err, GridError::LockDeadlockAvoided("k".to_string()));
    assert_eq!(table.held_by(owner(2)), 0);
}

#[tokio::test]
async fn older_transaction_waits_for_a_younger_holder() {
    let table = Arc::new(LockTable::new());

    let held = table.acquire(lock("k", 2, 100)).await.unwrap();
    let waiter = {
        let table = Arc::clone(&table);
        tokio::spawn(async move { table.acquire(lock("k", 1, 5_000)).await })
    };

    sleep(Duration::from_millis(50)).await;
    drop(held);

    let handle = waiter.await.unwrap().unwrap();
    assert_eq!(handle.owner(), owner(1));
    assert_eq!(table.held_by(owner(1)), 1);
}

#[tokio::test]
async fn waiting_times_out_and_withdraws_the_waiter() {
    let table = Arc::new(LockTable::new());

    let held = table.acquire(lock("k", 2, 100)).await.unwrap();
    let err = table.acquire(lock("k", 1, 50)).await.unwrap_err();
    assert_eq!(err, GridError::LockTimeout("k".to_string()));
    assert_eq!(table.held_by(owner(1)), 0);

    // The withdrawn waiter never receives the lock on release.
    drop(held);
    assert_eq!(table.outstanding(), 0);
}

#[tokio::test]
async fn handoff_turns_away_waiters_younger_than_the_new_holder() {
    let table = Arc::new(LockTable::new());

    let held = table.acquire(lock("k", 5, 1_000)).await.unwrap();
    let oldest = {
        let table = Arc::clone(&table);
        tokio::spawn(async move { table.acquire(lock("k", 3, 5_000)).await })
    };
    sleep(Duration::from_millis(50)).await;
    let middle = {
        let table = Arc::clone(&table);
        tokio::spawn(async move { table.acquire(lock("k", 4, 5_000)).await })
    };
    sleep(Duration::from_millis(50)).await;

    drop(held);

    // tx3 takes the hand-off; tx4 would then be waiting on the younger tx3,
    // so it is turned away instead of stalling until its timeout.
    let handle = oldest.await.unwrap().unwrap();
    assert_eq!(handle.owner(), owner(3));
    let err = middle.await.unwrap().unwrap_err();
    assert_eq!(err, GridError::LockDeadlockAvoided("k".to_string()));
    assert_eq!(table.held_by(owner(3)), 1);
    assert_eq!(table.outstanding(), 1);
}

#[tokio::test]
async fn equal_versions_from_different_nodes_are_distinct_holders() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1, 2], 1, vec![]);
    let near = node(&nodes, 1);
    let far = node(&nodes, 2);

    // Each node's clock assigns version 1 to its first transaction, so the
    // versions collide; the coordinating node must keep them apart.
    let near_tx = near.begin_transaction();
    let far_tx = far.begin_transaction();
    assert_eq!(near_tx.version(), far_tx.version());

    let held = near
        .locks()
        .acquire(lock("nv-a", near_tx.version(), 1_000))
        .await
        .unwrap();

    let source = BatchRowSource::new(
        EnlistOperation::Upsert,
        vec![EnlistItem::upsert("nv-a", row(1, "intruder"))],
        false,
    );
    let mut coordinator = far.enlist(far_tx, source, EnlistConfig::default()).unwrap();

    // Same version, higher node id: the far transaction is the younger of
    // the two and backs off rather than slipping into the reentrancy grant.
    let result = coordinator.run().await.unwrap();
    assert!(!result.success);
    assert_eq!(
        result.outcomes["nv-a"].error,
        Some(GridError::LockDeadlockAvoided("nv-a".to_string()))
    );
    assert!(near.store().read_latest("nv-a").is_none());
    assert_eq!(near.locks().held_by(held.owner()), 1);
}

#[tokio::test]
async fn per_key_lock_failure_leaves_siblings_applied() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    // An older transaction pins one of the batch's keys, so the younger
    // batch backs off that key and applies the rest.
    let blocker = near.begin_transaction();
    let _held = near
        .locks()
        .acquire(lock("l-b", blocker.version(), 1_000))
        .await
        .unwrap();

    let items = vec![
        EnlistItem::upsert("l-a", row(1, "a")),
        EnlistItem::upsert("l-b", row(2, "b")),
        EnlistItem::upsert("l-c", row(3, "c")),
    ];
    let source = BatchRowSource::new(EnlistOperation::Upsert, items, false);
    let tx = near.begin_transaction();
    let batch_version = tx.version();
    let mut coordinator = near.enlist(tx, source, EnlistConfig::default()).unwrap();

    let result = coordinator.run().await.unwrap();
    assert!(!result.success);
    assert!(result.outcomes["l-a"].success);
    assert!(result.outcomes["l-c"].success);
    let failed = &result.outcomes["l-b"];
    assert!(!failed.success);
    assert_eq!(
        failed.error,
        Some(GridError::LockDeadlockAvoided("l-b".to_string()))
    );

    assert_eq!(value_of(&near.store().read_latest("l-a").unwrap()), "a");
    assert!(near.store().read_latest("l-b").is_none());
    assert_eq!(value_of(&near.store().read_latest("l-c").unwrap()), "c");

    // The batch holds nothing once it completed; the blocker keeps its key.
    assert_eq!(near.locks().held_by(owner(batch_version)), 0);
    assert_eq!(near.locks().held_by(owner(blocker.version())), 1);
}

#[tokio::test]
async fn atomic_batch_aborts_on_a_single_lock_failure() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    let blocker = near.begin_transaction();
    let _held = near
        .locks()
        .acquire(lock("at-b", blocker.version(), 1_000))
        .await
        .unwrap();

    let items = vec![
        EnlistItem::upsert("at-a", row(1, "a")),
        EnlistItem::upsert("at-b", row(2, "b")),
        EnlistItem::upsert("at-c", row(3, "c")),
    ];
    let source = BatchRowSource::new(EnlistOperation::Upsert, items, false);
    let cfg = EnlistConfig {
        atomic: true,
        ..EnlistConfig::default()
    };
    let tx = near.begin_transaction();
    let batch_version = tx.version();
    let mut coordinator = near.enlist(tx, source, cfg).unwrap();

    let err = coordinator.run().await.unwrap_err();
    assert_eq!(err, GridError::LockDeadlockAvoided("at-b".to_string()));
    assert_eq!(coordinator.state(), CoordinatorState::Failed);

    // Nothing applied, nothing still held by the batch.
    assert!(near.store().read_latest("at-a").is_none());
    assert!(near.store().read_latest("at-b").is_none());
    assert!(near.store().read_latest("at-c").is_none());
    assert_eq!(near.locks().held_by(owner(batch_version)), 0);
}

#[tokio::test]
async fn batch_waits_out_a_younger_holder_and_completes() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    // The batch transaction is older than the blocker, so it queues for the
    // contended key instead of backing off.
    let tx = near.begin_transaction();
    let blocker = near.begin_transaction();
    let held = near
        .locks()
        .acquire(lock("wq-a", blocker.version(), 1_000))
        .await
        .unwrap();

    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        drop(held);
    });

    let source = BatchRowSource::new(
        EnlistOperation::Upsert,
        vec![EnlistItem::upsert("wq-a", row(1, "won"))],
        false,
    );
    let mut coordinator = near.enlist(tx, source, EnlistConfig::default()).unwrap();

    let result = coordinator.run().await.unwrap();
    assert!(result.success);
    assert_eq!(value_of(&near.store().read_latest("wq-a").unwrap()), "won");
    assert_eq!(near.locks().outstanding(), 0);
}

#[tokio::test]
async fn concurrent_batches_on_disjoint_keys_both_complete() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    let tx_a = near.begin_transaction();
    let source_a = BatchRowSource::new(
        EnlistOperation::Upsert,
        (0..20)
            .map(|i| EnlistItem::upsert(format!("ca-{i}"), row(i, "a")))
            .collect(),
        false,
    );
    let mut first = near.enlist(tx_a, source_a, EnlistConfig::default()).unwrap();

    let tx_b = near.begin_transaction();
    let source_b = BatchRowSource::new(
        EnlistOperation::Upsert,
        (0..20)
            .map(|i| EnlistItem::upsert(format!("cb-{i}"), row(i, "b")))
            .collect(),
        false,
    );
    let mut second = near.enlist(tx_b, source_b, EnlistConfig::default()).unwrap();

    let (first_result, second_result) = tokio::join!(first.run(), second.run());
    assert!(first_result.unwrap().success);
    assert!(second_result.unwrap().success);
    assert_eq!(near.locks().outstanding(), 0);
    assert_eq!(near.store().len(), 40);
}

#[tokio::test]
async fn randomized_contention_never_deadlocks() {
    use rand::seq::SliceRandom;

    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    let keys: Vec<String> = (0..30).map(|i| format!("rn-{i}")).collect();
    let mut rng = rand::rng();

    let mut pick = |label: &str| {
        let mut picked = keys.clone();
        picked.shuffle(&mut rng);
        picked.truncate(20);
        BatchRowSource::new(
            EnlistOperation::Upsert,
            picked
                .into_iter()
                .map(|key| EnlistItem::upsert(key, row(0, label)))
                .collect(),
            false,
        )
    };
    let source_a = pick("a");
    let source_b = pick("b");

    let tx_a = near.begin_transaction();
    let mut first = near.enlist(tx_a, source_a, EnlistConfig::default()).unwrap();
    let tx_b = near.begin_transaction();
    let mut second = near.enlist(tx_b, source_b, EnlistConfig::default()).unwrap();

    // Overlapping key sets in arbitrary order: wait-die guarantees both
    // batches terminate, with contended keys failing per key at worst.
    let (first_result, second_result) = tokio::join!(first.run(), second.run());
    let first_result = first_result.unwrap();
    let second_result = second_result.unwrap();
    assert_eq!(first_result.entries(), 20);
    assert_eq!(second_result.entries(), 20);
    for result in [&first_result, &second_result] {
        for (key, outcome) in &result.outcomes {
            if !outcome.success {
                assert!(
                    matches!(
                        outcome.error,
                        Some(GridError::LockDeadlockAvoided(_))
                            | Some(GridError::LockTimeout(_))
                            | None
                    ),
                    "unexpected failure for {key}: {:?}",
                    outcome.error
                );
            }
        }
    }
    assert_eq!(near.locks().outstanding(), 0);
}

/// Yields one item, then stalls until cancelled.
struct OneThenStall {
    yielded: bool,
}

impl RowSource for OneThenStall {
    fn operation(&self) -> EnlistOperation {
        EnlistOperation::Upsert
    }

    fn needs_previous(&self) -> bool {
        false
    }

    async fn next_item(&mut self) -> Result<Option<EnlistItem>> {
        if self.yielded {
            futures::future::pending::<()>().await;
        }
        self.yielded = true;
        Ok(Some(EnlistItem::upsert("cn-a", row(1, "v"))))
    }
}

#[tokio::test]
async fn cancellation_releases_every_held_lock() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    let tx = near.begin_transaction();
    let cfg = EnlistConfig {
        max_in_flight: 1,
        ..EnlistConfig::default()
    };
    let mut coordinator = near
        .enlist(tx, OneThenStall { yielded: false }, cfg)
        .unwrap();
    let cancel = coordinator.cancel_handle();

    let driver = tokio::spawn(async move {
        let outcome = coordinator.run().await;
        (outcome, coordinator.state())
    });

    sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let (outcome, state) = driver.await.unwrap();
    assert_eq!(outcome.unwrap_err(), GridError::Cancelled);
    assert_eq!(state, CoordinatorState::Cancelled);
    assert_eq!(near.locks().outstanding(), 0);

    // The window dispatched before cancellation was already applied.
    assert_eq!(value_of(&near.store().read_latest("cn-a").unwrap()), "v");
}

#[tokio::test]
async fn cancel_is_idempotent_from_any_state() {
    let (nodes, _affinity, _transport) = setup_cluster(&[1], 1, vec![]);
    let near = node(&nodes, 1);

    let source = BatchRowSource::new(EnlistOperation::Upsert, vec![], false);
    let tx = near.begin_transaction();
    let coordinator = near.enlist(tx, source, EnlistConfig::default()).unwrap();

    let cancel = coordinator.cancel_handle();
    cancel.cancel();
    cancel.cancel();
    assert!(cancel.is_cancelled());
}
