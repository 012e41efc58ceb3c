//! End-to-end mutation scenarios against the in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

use common::{ids, sorted, FaultyTransport, StaticConnector};
use queuekeeper::batch::BulkCoordinator;
use queuekeeper::connections::ConnectionRegistry;
use queuekeeper::error::{BrokerError, Error};
use queuekeeper::messaging::{MessageManager, MutationEngine};
use queuekeeper::transport::{InMemoryTransport, Transport};
use queuekeeper::types::{
    BrokerKind, BulkConfig, EncodedBody, EngineConfig, ManagerConfig, RawMessage,
    RegisterConnectionRequest,
};

fn engine_config() -> EngineConfig {
    EngineConfig::default().without_delays()
}

fn broker_with(queue: &str, message_ids: &[&str]) -> Arc<InMemoryTransport> {
    let broker = Arc::new(InMemoryTransport::new());
    broker.seed_with_ids(queue, message_ids);
    broker
}

fn faulty(broker: &Arc<InMemoryTransport>) -> Arc<FaultyTransport> {
    Arc::new(FaultyTransport::new(broker.clone()))
}

fn coordinator(transport: Arc<dyn Transport>) -> BulkCoordinator {
    let engine = Arc::new(MutationEngine::new(transport, engine_config()));
    BulkCoordinator::new(engine, BulkConfig::default().without_delays())
}

#[tokio::test]
async fn delete_removes_only_the_target() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let engine = MutationEngine::new(broker.clone(), engine_config());

    assert_ok!(engine.delete_one("orders", "b").await);

    assert_eq!(sorted(broker.ids("orders")), vec!["a", "c"]);
    assert!(!broker.bodies("orders").contains(&b"body-b".to_vec()));
    let queues = broker.list_queues().await.unwrap();
    assert_eq!(queues.len(), 1);
}

#[tokio::test]
async fn kept_messages_come_back_unchanged() {
    let broker = Arc::new(InMemoryTransport::new());
    broker.seed(
        "orders",
        [
            RawMessage::new("body-a")
                .with_property("message_id", "a")
                .with_property("timestamp", 1_700_000_000)
                .with_property("correlation_id", "corr-1")
                .with_property("priority", 7)
                .with_property("expiration", "60000")
                .with_header("tenant", "acme"),
            RawMessage::new("body-b").with_property("message_id", "b"),
        ],
    );
    let before = broker.snapshot("orders")[0].clone();
    let engine = MutationEngine::new(broker.clone(), engine_config());
    let enqueued_before = engine.peek("orders", 1).await.unwrap()[0].enqueued_at;

    assert_ok!(engine.delete_one("orders", "b").await);

    let after = broker.snapshot("orders");
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].properties, before.properties);
    assert_eq!(after[0].headers, before.headers);
    assert_eq!(after[0].body, before.body);

    let peeked = engine.peek("orders", 1).await.unwrap();
    assert_eq!(peeked[0].enqueued_at, enqueued_before);
}

#[tokio::test]
async fn bulk_move_splits_queue() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let coordinator = coordinator(broker.clone());

    let result = coordinator
        .bulk_move("orders", "archive", &["a".to_string(), "c".to_string()])
        .await
        .unwrap();

    assert_eq!(result.success_count, 2);
    assert_eq!(result.fail_count, 0);
    assert_eq!(broker.ids("orders"), vec!["b"]);
    assert_eq!(sorted(broker.ids("archive")), vec!["a", "c"]);
}

#[tokio::test]
async fn failing_chunk_leaves_its_messages_in_source() {
    let all = ids("m", 2500);
    let broker = Arc::new(InMemoryTransport::new());
    broker.seed_with_ids("orders", &all[..]);

    // Chunk 1 needs one drain; chunk 2 gets calls 2, 3 and 4 (one attempt
    // plus two retries) and every one of them fails.
    let transport = faulty(&broker);
    transport.fail_drain_calls([2, 3, 4]);

    let result = coordinator(transport.clone())
        .bulk_delete("orders", &all)
        .await
        .unwrap();

    assert_eq!(result.failed_chunks.len(), 1);
    assert_eq!(result.failed_chunks[0].index, 1);
    assert!(result.fail_count >= 1000);
    assert_eq!(result.success_count, 1500);

    let remaining = sorted(broker.ids("orders"));
    assert_eq!(remaining, sorted(all[1000..2000].to_vec()));
}

#[tokio::test]
async fn purge_empties_queue() {
    let broker = Arc::new(InMemoryTransport::new());
    broker.seed_with_ids("orders", &ids("p", 50));
    let engine = MutationEngine::new(broker.clone(), engine_config());

    let result = engine.purge("orders").await.unwrap();

    assert_eq!(result.removed_count, 50);
    assert_eq!(broker.queue_depth("orders").await.unwrap(), Some(0));
}

#[tokio::test]
async fn no_message_is_lost_across_mixed_operations() {
    let broker = Arc::new(InMemoryTransport::new());
    broker.seed(
        "orders",
        (0..30).map(|i| RawMessage::new(format!("payload-{}", i % 7))),
    );
    let before: Vec<Vec<u8>> = broker.bodies("orders");
    let engine = MutationEngine::new(broker.clone(), engine_config().with_drain_batch_size(8));

    let peeked = engine.peek("orders", 30).await.unwrap();
    let doomed = peeked[4].id.clone();
    let doomed_body = peeked[4].body.as_bytes().to_vec();
    engine.delete_one("orders", &doomed).await.unwrap();

    // Derived ids depend on position, so read them again after the delete.
    let peeked = engine.peek("orders", 30).await.unwrap();
    let moved = vec![peeked[10].id.clone(), peeked[25].id.clone()];
    let outcome = engine.move_many("orders", "archive", &moved).await.unwrap();
    assert_eq!(outcome.affected.len(), 2);
    assert_eq!(broker.depth("archive"), 2);

    let mut after: Vec<Vec<u8>> = broker.bodies("orders");
    after.extend(broker.bodies("archive"));
    after.push(doomed_body);
    after.sort();
    let mut expected = before;
    expected.sort();
    assert_eq!(after, expected);
}

#[tokio::test]
async fn failed_target_publish_restores_target_to_source() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    transport.fail_publishes(
        "archive",
        usize::MAX,
        BrokerError::PublishRejected {
            queue: "archive".to_string(),
            reason: "unroutable".to_string(),
        },
    );
    let engine = MutationEngine::new(transport.clone(), engine_config());

    let err = engine.move_one("orders", "archive", "b").await.unwrap_err();

    assert!(matches!(err, Error::Broker(BrokerError::PublishRejected { .. })));
    assert_eq!(sorted(broker.ids("orders")), vec!["a", "b", "c"]);
    assert!(broker.ids("archive").is_empty());
}

#[tokio::test]
async fn crash_before_target_publish_keeps_target_in_source() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    transport.panic_on_publish_to("archive");
    let engine = MutationEngine::new(transport.clone(), engine_config());

    let err = engine.move_one("orders", "archive", "b").await.unwrap_err();

    assert!(matches!(err, Error::Interrupted(_)));
    let remaining = broker.ids("orders");
    assert!(remaining.contains(&"b".to_string()));
    assert!(remaining.contains(&"a".to_string()));
    assert!(remaining.contains(&"c".to_string()));
    assert!(broker.ids("archive").is_empty());
}

#[tokio::test]
async fn keep_republish_failure_reports_data_loss() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    transport.fail_publishes(
        "orders",
        usize::MAX,
        BrokerError::PublishRejected {
            queue: "orders".to_string(),
            reason: "queue deleted".to_string(),
        },
    );
    let engine = MutationEngine::new(transport.clone(), engine_config());

    let err = engine.delete_one("orders", "b").await.unwrap_err();

    match err {
        Error::DataLossRisk { queue, lost } => {
            assert_eq!(queue, "orders");
            let lost_ids = sorted(lost.iter().map(|m| m.id.clone()).collect());
            assert_eq!(lost_ids, vec!["a", "c"]);
            assert!(lost.iter().all(|m| m.body.starts_with(b"body-")));
        }
        other => panic!("expected DataLossRisk, got {other:?}"),
    }
}

#[tokio::test]
async fn data_loss_is_not_retried_by_coordinator() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    transport.fail_publishes(
        "orders",
        usize::MAX,
        BrokerError::PublishRejected {
            queue: "orders".to_string(),
            reason: "queue deleted".to_string(),
        },
    );

    let result = coordinator(transport.clone())
        .bulk_delete("orders", &["b".to_string()])
        .await;

    assert!(matches!(result, Err(Error::DataLossRisk { .. })));
    assert_eq!(transport.drain_call_count(), 1);
}

#[tokio::test]
async fn receipt_timeout_is_retried_with_fresh_receipt() {
    let broker = broker_with("orders", &["a", "b"]);
    let transport = faulty(&broker);
    transport.fail_publishes(
        "orders",
        1,
        BrokerError::ReceiptTimeout {
            queue: "orders".to_string(),
            receipt: uuid::Uuid::nil(),
        },
    );
    let engine = MutationEngine::new(transport.clone(), engine_config());

    assert_ok!(engine.delete_one("orders", "b").await);

    assert_eq!(broker.ids("orders"), vec!["a"]);
    let receipts = transport.receipts();
    assert_eq!(receipts.len(), 2);
    assert_ne!(receipts[0], receipts[1]);
}

#[tokio::test]
async fn lost_receipt_may_duplicate_but_never_drops() {
    let broker = broker_with("orders", &["a", "b"]);
    let transport = faulty(&broker);
    transport.lose_receipts("orders", 1);
    let engine = MutationEngine::new(transport.clone(), engine_config());

    assert_ok!(engine.delete_one("orders", "b").await);

    assert_eq!(broker.ids("orders"), vec!["a", "a"]);
}

#[tokio::test]
async fn abort_policy_surfaces_ambiguous_id() {
    let broker = broker_with("orders", &["x", "dup", "dup"]);
    let config = engine_config().with_duplicate_policy(queuekeeper::types::DuplicatePolicy::Abort);
    let engine = MutationEngine::new(broker.clone(), config);

    let err = engine.delete_one("orders", "dup").await.unwrap_err();

    assert!(matches!(err, Error::AmbiguousId { count: 2, .. }));
    assert_eq!(sorted(broker.ids("orders")), vec!["dup", "dup", "x"]);
}

#[tokio::test]
async fn import_reports_each_body() {
    let broker = Arc::new(InMemoryTransport::new());
    let engine = MutationEngine::new(broker.clone(), engine_config());

    let bodies = vec![
        EncodedBody {
            encoding: "string".to_string(),
            payload: "{\"order\":1}".to_string(),
        },
        EncodedBody {
            encoding: "base64".to_string(),
            payload: "%%% not base64".to_string(),
        },
        EncodedBody {
            encoding: "base64".to_string(),
            payload: "AAEC".to_string(),
        },
    ];

    let result = engine.import_encoded("orders", &bodies).await;

    assert_eq!(result.success_count, 2);
    assert_eq!(result.fail_count, 1);
    assert_eq!(result.failures[0].index, 1);
    assert_eq!(
        broker.bodies("orders"),
        vec![b"{\"order\":1}".to_vec(), vec![0, 1, 2]]
    );
}

#[tokio::test]
async fn export_without_browse_requeues_everything() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = Arc::new(FaultyTransport::new(broker.clone()).without_browse());
    let engine = MutationEngine::new(transport.clone(), engine_config());

    let exported = engine
        .export_messages("orders", &["c".to_string(), "a".to_string()])
        .await
        .unwrap();

    let exported_ids = sorted(exported.iter().map(|m| m.id.clone()).collect());
    assert_eq!(exported_ids, vec!["a", "c"]);
    assert!(transport.drain_call_count() >= 1);
    assert_eq!(sorted(broker.ids("orders")), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn export_with_browse_never_drains() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    let engine = MutationEngine::new(transport.clone(), engine_config());

    let exported = engine.export_messages("orders", &[]).await.unwrap();

    assert_eq!(exported.len(), 3);
    assert_eq!(transport.drain_call_count(), 0);
}

#[tokio::test]
async fn interleaved_engine_calls_corrupt_results() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    let (drained_tx, drained_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    transport.gate_first_drain(drained_tx, release_rx);

    let engine = Arc::new(MutationEngine::new(transport.clone(), engine_config()));
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_one("orders", "b").await })
    };
    drained_rx.await.unwrap();

    // The first operation holds every message in memory, so a second one on
    // the same queue cannot see "c" although it was never removed.
    let second = engine.delete_one("orders", "c").await;
    assert!(matches!(second, Err(Error::NotFound { .. })));

    release_tx.send(()).unwrap();
    assert_ok!(first.await.unwrap());
    assert_eq!(sorted(broker.ids("orders")), vec!["a", "c"]);
}

async fn managed(transport: Arc<FaultyTransport>) -> (Arc<MessageManager>, uuid::Uuid) {
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(StaticConnector(transport)),
        Duration::from_secs(1),
    ));
    let config = ManagerConfig {
        engine: engine_config(),
        bulk: BulkConfig::default().without_delays(),
        ..ManagerConfig::default()
    };
    let manager = Arc::new(MessageManager::new(registry, config));
    let connection_id = manager
        .register_connection(RegisterConnectionRequest {
            name: "test".to_string(),
            broker_kind: BrokerKind::Memory,
            endpoint: "memory://test;memory://test".to_string(),
        })
        .await
        .unwrap()
        .id;
    (manager, connection_id)
}

#[tokio::test]
async fn manager_serializes_operations_per_queue() {
    let broker = broker_with("orders", &["a", "b", "c"]);
    let transport = faulty(&broker);
    let (drained_tx, drained_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    transport.gate_first_drain(drained_tx, release_rx);
    let (manager, connection_id) = managed(transport.clone()).await;

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.delete_message(connection_id, "orders", "b").await })
    };
    drained_rx.await.unwrap();

    let mut second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.delete_message(connection_id, "orders", "c").await })
    };
    assert_err!(tokio::time::timeout(Duration::from_millis(50), &mut second).await);

    release_tx.send(()).unwrap();
    assert_ok!(first.await.unwrap());
    assert_ok!(second.await.unwrap());
    assert_eq!(broker.ids("orders"), vec!["a"]);
}

#[tokio::test]
async fn move_does_not_wait_for_target_queue_lock() {
    let broker = broker_with("orders", &["a", "b"]);
    broker.seed_with_ids("archive", &["x", "y"]);
    let transport = faulty(&broker);
    let (drained_tx, drained_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    transport.gate_first_drain(drained_tx, release_rx);
    let (manager, connection_id) = managed(transport.clone()).await;

    let holder = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.delete_message(connection_id, "archive", "x").await })
    };
    drained_rx.await.unwrap();

    let moved = tokio::time::timeout(
        Duration::from_secs(1),
        manager.move_message(connection_id, "orders", "archive", "a"),
    )
    .await;
    assert_ok!(assert_ok!(moved));

    release_tx.send(()).unwrap();
    assert_ok!(holder.await.unwrap());
    assert_eq!(broker.ids("orders"), vec!["b"]);
    assert_eq!(sorted(broker.ids("archive")), vec!["a", "y"]);
}

#[tokio::test]
async fn unknown_queue_is_reported() {
    let broker = Arc::new(InMemoryTransport::new());
    let engine = MutationEngine::new(broker.clone(), engine_config());

    let err = engine.delete_one("missing", "a").await.unwrap_err();
    assert!(matches!(err, Error::Broker(BrokerError::QueueNotFound(_))));
}
