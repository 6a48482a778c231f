
use std::sync::Arc;
use std::time::Duration;

use fixtures::*;
use txwriter::{PersistenceError, SortDirection, TransactionStore, TransactionWriter};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_assign_sequential_nonces() {
    init_tracing();
    let store = MockStore::new();
    let writer = Arc::new(TransactionWriter::new(store.as_dyn(), &test_options()));
    let chain = ChainStub::new(100);

    let mut tasks = Vec::new();
    for i in 0..3 {
        let writer = writer.clone();
        let callback = chain.callback();
        tasks.push(tokio::spawn(async move {
            insert_via(&writer, new_tx(&format!("tx-{i}"), signer(1)), callback)
                .await
                .expect("insert failed")
        }));
    }
    let mut nonces = Vec::new();
    for task in tasks {
        nonces.push(task.await.unwrap());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, vec![100, 101, 102]);
    assert_eq!(chain.calls(), 1, "one reconciliation pays for the group");

    let listed = store
        .list_transactions_by_nonce(signer(1), None, 10, SortDirection::Ascending)
        .await
        .unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(
        listed.iter().map(|tx| tx.nonce.unwrap()).collect::<Vec<_>>(),
        vec![100, 101, 102]
    );

    // The cache now answers directly
    let next = insert_via(&writer, new_tx("tx-3", signer(1)), chain.callback())
        .await
        .unwrap();
    assert_eq!(next, 103);
    assert_eq!(chain.calls(), 1);

    writer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_reconciles_against_local_store() {
    init_tracing();
    let store = MockStore::new();
    // Rows persisted by a previous process, nonces up to 105
    for nonce in 100..=105u64 {
        let mut tx = new_tx(&format!("old-{nonce}"), signer(2));
        tx.nonce = Some(nonce);
        store.seed_transaction(tx);
    }
    let writer = TransactionWriter::new(store.as_dyn(), &test_options());

    // Chain still reports an older pending nonce
    let chain = ChainStub::new(101);
    let nonce = insert_via(&writer, new_tx("new-1", signer(2)), chain.callback())
        .await
        .unwrap();
    assert_eq!(nonce, 106, "local max + 1 beats the chain's view");
    assert_eq!(chain.calls(), 1);

    writer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_cache_overrides_chain_view() {
    init_tracing();
    let store = MockStore::new();
    let writer = TransactionWriter::new(store.as_dyn(), &test_options());
    let chain = ChainStub::new(110);

    let first = insert_via(&writer, new_tx("a", signer(3)), chain.callback())
        .await
        .unwrap();
    assert_eq!(first, 110);

    // A stuck mempool now reports an older nonce; the fresh cache wins
    // without another chain query.
    chain.set_next(100);
    let second = insert_via(&writer, new_tx("b", signer(3)), chain.callback())
        .await
        .unwrap();
    assert_eq!(second, 111);
    assert_eq!(chain.calls(), 1);

    writer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_cache_still_guards_in_flight_nonces() {
    init_tracing();
    let store = MockStore::new();
    let options = txwriter::PersistenceOptions {
        nonce_state_timeout: Duration::from_millis(1),
        ..test_options()
    };
    let writer = TransactionWriter::new(store.as_dyn(), &options);
    let chain = ChainStub::new(100);

    let first = insert_via(&writer, new_tx("a", signer(4)), chain.callback())
        .await
        .unwrap();
    assert_eq!(first, 100);

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Cache expired, chain went backwards: the expired entry and the store
    // both hold the line at 101.
    chain.set_next(90);
    let second = insert_via(&writer, new_tx("b", signer(4)), chain.callback())
        .await
        .unwrap();
    assert_eq!(second, 101);
    assert_eq!(chain.calls(), 2, "expiry forces a re-query");

    writer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_failure_fails_the_batch_without_spending_a_nonce() {
    init_tracing();
    let store = MockStore::new();
    let writer = TransactionWriter::new(store.as_dyn(), &test_options());

    // On the batch path the callback failure is batch-wide: the op receives
    // the same generic error as any other batch failure.
    let err = insert_via(&writer, new_tx("a", signer(5)), ChainStub::failing_callback())
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::Persistence(_)), "{err}");

    // Nothing was persisted and no nonce was consumed
    assert!(store.get_transaction("a").await.unwrap().is_none());
    let chain = ChainStub::new(100);
    let nonce = insert_via(&writer, new_tx("b", signer(5)), chain.callback())
        .await
        .unwrap();
    assert_eq!(nonce, 100);

    writer.stop().await;
}
