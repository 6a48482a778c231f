
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use fixtures::*;
use txwriter::{
    ConfirmationRecord, KvPersistence, PersistenceError, PersistenceOptions, ReceiptRecord,
    SortDirection, TransactionHistoryRecord, TransactionPersistence, TransactionStatus,
    TransactionUpdate, TxHistoryAction,
};

fn kv_options() -> PersistenceOptions {
    PersistenceOptions {
        compression_interval: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_concurrent_inserts_assign_sequential_nonces() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(
        KvPersistence::open(dir.path().join("txwriter.redb"), kv_options()).unwrap(),
    );
    let chain = ChainStub::new(100);

    let mut tasks = Vec::new();
    for i in 0..5 {
        let persistence = persistence.clone();
        let callback = chain.callback();
        tasks.push(tokio::spawn(async move {
            persistence
                .insert_transaction_with_next_nonce(new_tx(&format!("tx-{i}"), signer(1)), callback)
                .await
                .expect("insert failed")
                .nonce
                .unwrap()
        }));
    }
    let mut nonces = Vec::new();
    for task in tasks {
        nonces.push(task.await.unwrap());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, vec![100, 101, 102, 103, 104]);
    assert_eq!(chain.calls(), 1);

    let listed = persistence
        .list_transactions_by_nonce(signer(1), None, 10, SortDirection::Ascending)
        .await
        .unwrap();
    assert_eq!(listed.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_restart_reconciles_against_local_store() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txwriter.redb");

    let chain = ChainStub::new(100);
    {
        let persistence = KvPersistence::open(&path, kv_options()).unwrap();
        for i in 0..3 {
            persistence
                .insert_transaction_with_next_nonce(
                    new_tx(&format!("old-{i}"), signer(2)),
                    chain.callback(),
                )
                .await
                .unwrap();
        }
        // Rows 100..=102 are durable; the process "crashes" here
    }

    let persistence = KvPersistence::open(&path, kv_options()).unwrap();
    chain.set_next(101);
    let tx = persistence
        .insert_transaction_with_next_nonce(new_tx("new-1", signer(2)), chain.callback())
        .await
        .unwrap();
    assert_eq!(tx.nonce, Some(103), "local max + 1 beats the chain's view");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_duplicate_id_conflicts_without_spending_a_nonce() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let persistence = KvPersistence::open(dir.path().join("txwriter.redb"), kv_options()).unwrap();
    let chain = ChainStub::new(100);

    let tx = persistence
        .insert_transaction_with_next_nonce(new_tx("x", signer(3)), chain.callback())
        .await
        .unwrap();
    assert_eq!(tx.nonce, Some(100));

    let err = persistence
        .insert_transaction_with_next_nonce(new_tx("x", signer(3)), chain.callback())
        .await
        .unwrap_err();
    assert!(
        matches!(err, PersistenceError::DuplicateTransactionId(_)),
        "{err}"
    );

    let tx = persistence
        .insert_transaction_with_next_nonce(new_tx("y", signer(3)), chain.callback())
        .await
        .unwrap();
    assert_eq!(tx.nonce, Some(101));
    assert_eq!(chain.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_callback_failure_releases_the_signer_slot() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let persistence = KvPersistence::open(dir.path().join("txwriter.redb"), kv_options()).unwrap();

    let err = persistence
        .insert_transaction_with_next_nonce(new_tx("a", signer(4)), ChainStub::failing_callback())
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::NonceCallback(_)), "{err}");

    // A leaked slot would make this second insert hang forever
    let chain = ChainStub::new(7);
    let tx = tokio::time::timeout(
        Duration::from_secs(5),
        persistence.insert_transaction_with_next_nonce(new_tx("b", signer(4)), chain.callback()),
    )
    .await
    .expect("signer slot was not released")
    .unwrap();
    assert_eq!(tx.nonce, Some(7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_lifecycle_roundtrip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let persistence = KvPersistence::open(dir.path().join("txwriter.redb"), kv_options()).unwrap();
    let chain = ChainStub::new(0);

    persistence
        .insert_transaction_with_next_nonce(new_tx("t1", signer(5)), chain.callback())
        .await
        .unwrap();

    let history = persistence.list_history("t1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, TxHistoryAction::NonceAssigned);

    persistence
        .update_transaction(
            "t1",
            TransactionUpdate::with_status(TransactionStatus::Succeeded),
        )
        .await
        .flush()
        .await
        .unwrap();
    let stored = persistence.get_transaction_by_id("t1").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Succeeded);
    let completion = persistence
        .get_transaction_completion("t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.status, TransactionStatus::Succeeded);

    persistence
        .set_transaction_receipt("t1", ReceiptRecord::new("t1", 42, B256::repeat_byte(1)))
        .await
        .flush()
        .await
        .unwrap();
    let receipt = persistence
        .get_transaction_receipt("t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.block_number, 42);

    persistence
        .add_confirmation(
            "t1",
            ConfirmationRecord::new("t1", 1, B256::repeat_byte(2), B256::repeat_byte(3)),
            false,
        )
        .await
        .flush()
        .await
        .unwrap();
    persistence
        .add_confirmation(
            "t1",
            ConfirmationRecord::new("t1", 2, B256::repeat_byte(4), B256::repeat_byte(2)),
            true,
        )
        .await
        .flush()
        .await
        .unwrap();
    let confirmations = persistence.list_confirmations("t1").await.unwrap();
    assert_eq!(confirmations.len(), 1, "reset replaced the earlier record");
    assert_eq!(confirmations[0].block_number, 2);

    persistence.delete_transaction("t1").await.flush().await.unwrap();
    assert!(persistence.get_transaction_by_id("t1").await.unwrap().is_none());
    assert!(persistence
        .get_transaction_receipt("t1")
        .await
        .unwrap()
        .is_none());
    assert!(persistence.list_confirmations("t1").await.unwrap().is_empty());
    assert!(persistence.list_history("t1").await.unwrap().is_empty());

    persistence.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_history_compaction_folds_repeated_actions() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let options = PersistenceOptions {
        compression_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let persistence = KvPersistence::open(dir.path().join("txwriter.redb"), options).unwrap();
    let chain = ChainStub::new(0);

    persistence
        .insert_transaction_with_next_nonce(new_tx("t1", signer(6)), chain.callback())
        .await
        .unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        persistence
            .add_history_event(TransactionHistoryRecord::new("t1", TxHistoryAction::Submitted))
            .await
            .flush()
            .await
            .unwrap();
    }

    let history = persistence.list_history("t1").await.unwrap();
    assert_eq!(history.len(), 2);
    let submitted = history
        .iter()
        .find(|record| record.action == TxHistoryAction::Submitted)
        .expect("submitted entry folded away");
    assert_eq!(submitted.count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kv_lists_transactions_in_nonce_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let persistence = KvPersistence::open(dir.path().join("txwriter.redb"), kv_options()).unwrap();
    let chain = ChainStub::new(10);

    for i in 0..4 {
        persistence
            .insert_transaction_with_next_nonce(new_tx(&format!("t{i}"), signer(7)), chain.callback())
            .await
            .unwrap();
    }

    let ascending = persistence
        .list_transactions_by_nonce(signer(7), None, 10, SortDirection::Ascending)
        .await
        .unwrap();
    assert_eq!(
        ascending.iter().map(|tx| tx.nonce.unwrap()).collect::<Vec<_>>(),
        vec![10, 11, 12, 13]
    );

    let newest = persistence
        .list_transactions_by_nonce(signer(7), None, 2, SortDirection::Descending)
        .await
        .unwrap();
    assert_eq!(
        newest.iter().map(|tx| tx.nonce.unwrap()).collect::<Vec<_>>(),
        vec![13, 12]
    );

    let above = persistence
        .list_transactions_by_nonce(signer(7), Some(11), 10, SortDirection::Ascending)
        .await
        .unwrap();
    assert_eq!(
        above.iter().map(|tx| tx.nonce.unwrap()).collect::<Vec<_>>(),
        vec![12, 13]
    );

    let below = persistence
        .list_transactions_by_nonce(signer(7), Some(12), 10, SortDirection::Descending)
        .await
        .unwrap();
    assert_eq!(
        below.iter().map(|tx| tx.nonce.unwrap()).collect::<Vec<_>>(),
        vec![11, 10]
    );
}
