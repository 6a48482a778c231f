
use std::sync::Arc;

use alloy::primitives::B256;
use fixtures::*;
use txwriter::{
    ConfirmationRecord, PersistenceError, ReceiptRecord, SortDirection, SqlPersistence,
    TransactionPersistence, TransactionStatus, TransactionUpdate, TxHistoryAction,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_inserts_assign_sequential_nonces() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txwriter.db");
    let persistence = Arc::new(
        SqlPersistence::connect(path.to_str().unwrap(), test_options())
            .await
            .unwrap(),
    );
    let chain = ChainStub::new(100);

    let mut tasks = Vec::new();
    for i in 0..3 {
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
    assert_eq!(nonces, vec![100, 101, 102]);
    assert_eq!(chain.calls(), 1);

    let listed = persistence
        .list_transactions_by_nonce(signer(1), None, 10, SortDirection::Ascending)
        .await
        .unwrap();
    assert_eq!(listed.len(), 3);

    persistence.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_lifecycle_roundtrip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txwriter.db");
    let persistence = SqlPersistence::connect(path.to_str().unwrap(), test_options())
        .await
        .unwrap();
    let chain = ChainStub::new(100);

    let tx = persistence
        .insert_transaction_with_next_nonce(new_tx("t1", signer(2)), chain.callback())
        .await
        .unwrap();
    assert_eq!(tx.nonce, Some(100));

    let history = persistence.list_history("t1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, TxHistoryAction::NonceAssigned);

    // Duplicate submission conflicts and spends nothing
    let err = persistence
        .insert_transaction_with_next_nonce(new_tx("t1", signer(2)), chain.callback())
        .await
        .unwrap_err();
    assert!(
        matches!(err, PersistenceError::DuplicateTransactionId(_)),
        "{err}"
    );
    let tx2 = persistence
        .insert_transaction_with_next_nonce(new_tx("t2", signer(2)), chain.callback())
        .await
        .unwrap();
    assert_eq!(tx2.nonce, Some(101));

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
        .set_transaction_receipt("t1", ReceiptRecord::new("t1", 9, B256::repeat_byte(1)))
        .await
        .flush()
        .await
        .unwrap();
    let receipt = persistence
        .get_transaction_receipt("t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.block_number, 9);

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
    assert_eq!(confirmations.len(), 1);
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
async fn sqlite_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txwriter.db");
    let chain = ChainStub::new(50);

    {
        let persistence = SqlPersistence::connect(path.to_str().unwrap(), test_options())
            .await
            .unwrap();
        for i in 0..3 {
            persistence
                .insert_transaction_with_next_nonce(
                    new_tx(&format!("old-{i}"), signer(3)),
                    chain.callback(),
                )
                .await
                .unwrap();
        }
        persistence.stop().await;
    }

    let persistence = SqlPersistence::connect(path.to_str().unwrap(), test_options())
        .await
        .unwrap();
    chain.set_next(51);
    let tx = persistence
        .insert_transaction_with_next_nonce(new_tx("new-1", signer(3)), chain.callback())
        .await
        .unwrap();
    assert_eq!(tx.nonce, Some(53), "local max + 1 beats the chain's view");

    persistence.stop().await;
}
