
use std::time::Duration;

use fixtures::*;
use txwriter::{
    PersistenceError, TransactionOperation, TransactionStatus, TransactionUpdate,
    TransactionWriter,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_drains_queued_operations() {
    init_tracing();
    let store = MockStore::new();
    let writer = TransactionWriter::new(store.as_dyn(), &test_options());
    let chain = ChainStub::new(0);

    insert_via(&writer, new_tx("t1", signer(1)), chain.callback())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let (op, handle) = TransactionOperation::update(
            "t1",
            TransactionUpdate::with_status(TransactionStatus::Pending),
        );
        writer.queue(op).await;
        handles.push(handle);
    }

    writer.stop().await;

    // Every queued operation reached a terminal state; nothing hangs
    for handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(5), handle.flush())
            .await
            .expect("completion channel left un-signalled");
        match result {
            Ok(_) | Err(PersistenceError::ShuttingDown) => {}
            Err(other) => panic!("unexpected error after shutdown: {other}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enqueue_after_stop_reports_shutting_down() {
    init_tracing();
    let store = MockStore::new();
    let writer = TransactionWriter::new(store.as_dyn(), &test_options());
    writer.stop().await;

    let (op, handle) = TransactionOperation::update(
        "t1",
        TransactionUpdate::with_status(TransactionStatus::Pending),
    );
    writer.queue(op).await;
    let err = handle.flush().await.unwrap_err();
    assert!(matches!(err, PersistenceError::ShuttingDown), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent() {
    init_tracing();
    let store = MockStore::new();
    let writer = TransactionWriter::new(store.as_dyn(), &test_options());
    writer.stop().await;
    writer.stop().await;
}
