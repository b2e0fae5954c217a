use std::time::Duration;

use groupmsg_core::db::{IRawDatabaseExt as _, IReadDatabaseTransactionOpsTyped as _};
use groupmsg_core::runtime::{Instant, sleep, timeout};
use groupmsg_logging::LOG_TEST;
use groupmsg_queue::proto::{Content, DataMessage};
use groupmsg_queue::{
    DrainState, DrainTrigger, EnqueueError, GroupMessageProcessor, GroupsError, JobId,
    QueueConfig, QueueEvent,
};
use groupmsg_rocksdb::RocksDb;
use groupmsg_testing::db::FlakyCommitDatabase;
use groupmsg_testing::fixtures::{address, group_id};
use groupmsg_testing::mock::{DeliveredMessageKey, FakeGroupChange, GatewayCall};
use groupmsg_testing::{Fixtures, GroupMessage, test_config};
use prost::Message as _;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::info;

const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

async fn next_event(events: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
    let event = timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("queue event in time")
        .expect("event channel open");
    info!(target: LOG_TEST, ?event, "Queue event");
    event
}

/// Skip events until the next committed batch
async fn next_batch(events: &mut broadcast::Receiver<QueueEvent>) -> (Vec<JobId>, usize) {
    loop {
        if let QueueEvent::BatchCompleted { jobs, remaining } = next_event(events).await {
            return (jobs, remaining);
        }
    }
}

async fn next_retry(events: &mut broadcast::Receiver<QueueEvent>) -> Duration {
    loop {
        match next_event(events).await {
            QueueEvent::RetryScheduled { delay } => return delay,
            QueueEvent::BatchCompleted { jobs, .. } => {
                panic!("expected a retry, got a batch of {jobs:?}")
            }
            _ => {}
        }
    }
}

async fn wait_for_drained(events: &mut broadcast::Receiver<QueueEvent>) {
    while next_event(events).await != QueueEvent::Drained {}
}

/// Start a processor that holds off until [`resume`] is called, so jobs can
/// be queued up front
fn start_paused_host(fixtures: &Fixtures, config: QueueConfig) -> GroupMessageProcessor {
    fixtures.host.set_registered(false);
    fixtures.start(config)
}

fn resume(fixtures: &Fixtures, processor: &GroupMessageProcessor) {
    fixtures.host.set_registered(true);
    processor.trigger(DrainTrigger::RegistrationStateChanged);
}

fn signed_change(revision: u32) -> Vec<u8> {
    FakeGroupChange {
        revision,
        add_members: vec![],
        signed: true,
    }
    .to_bytes()
}

#[test_log::test(tokio::test(start_paused = true))]
async fn stops_before_first_job_that_needs_an_update() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 5, &["alice"]);
    fixtures.service_group(1, 7, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("alice", 1, 5).with_body("A"),
                GroupMessage::new("alice", 1, 4).with_body("B"),
                GroupMessage::new("alice", 1, 7).with_body("C"),
                GroupMessage::new("alice", 1, 5).with_body("D"),
            ],
        )
        .await;
    let [a, b, c, d] = ids[..] else {
        panic!("four jobs enqueued");
    };
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (vec![a, b], 2));
    assert_eq!(fixtures.sink.delivered_jobs(), vec![a, b]);

    // C goes through the update path on its own
    assert_eq!(next_batch(&mut events).await, (vec![c], 1));
    assert_eq!(fixtures.gateway.calls(), vec![GatewayCall::Refresh { revision: 7 }]);

    assert_eq!(next_batch(&mut events).await, (vec![d], 0));
    wait_for_drained(&mut events).await;

    assert_eq!(fixtures.sink.delivered_jobs(), vec![a, b, c, d]);
    assert_eq!(fixtures.notifier.count(), 0);
    assert!(!processor.has_pending_jobs().await);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn contiguous_embedded_change_is_applied_to_a_lone_job() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("alice", 1, 2).with_group_change(signed_change(2)),
                GroupMessage::new("alice", 1, 2),
            ],
        )
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (vec![ids[0]], 1));
    assert_eq!(
        fixtures.gateway.calls(),
        vec![
            GatewayCall::VerifyChange,
            GatewayCall::ApplyChange { revision: 2 }
        ]
    );
    assert_eq!(fixtures.gateway.local_revision(&group_id(1)), Some(2));

    // the group is current now, so the second job needs no update
    assert_eq!(next_batch(&mut events).await, (vec![ids[1]], 0));
    assert_eq!(fixtures.gateway.calls().len(), 2);
    assert_eq!(fixtures.sink.delivered_jobs(), ids);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn revision_gap_is_resolved_by_the_service() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.service_group(1, 3, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[GroupMessage::new("alice", 1, 3).with_group_change(signed_change(3))],
        )
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids.clone(), 0));
    assert_eq!(
        fixtures.gateway.calls(),
        vec![GatewayCall::Refresh { revision: 3 }]
    );
    assert_eq!(fixtures.gateway.local_revision(&group_id(1)), Some(3));
    assert_eq!(fixtures.sink.delivered_jobs(), ids);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn badly_signed_embedded_change_falls_back_to_the_service() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.service_group(1, 2, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let unsigned = FakeGroupChange {
        revision: 2,
        add_members: vec![],
        signed: false,
    }
    .to_bytes();
    let ids = fixtures
        .enqueue(
            &processor,
            &[GroupMessage::new("alice", 1, 2).with_group_change(unsigned)],
        )
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids.clone(), 0));
    assert_eq!(
        fixtures.gateway.calls(),
        vec![
            GatewayCall::VerifyChange,
            GatewayCall::Refresh { revision: 2 }
        ]
    );
    assert_eq!(fixtures.sink.delivered_jobs(), ids);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn retry_delay_doubles_and_resets_after_success() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.service_group(1, 2, &["alice"]);
    fixtures
        .gateway
        .fail_next_refresh(GroupsError::Network("offline".into()));
    fixtures
        .gateway
        .fail_next_refresh(GroupsError::HttpStatus { status: 503 });
    fixtures.gateway.fail_next_refresh(GroupsError::Timeout);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let first = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 2)])
        .await;
    let started = Instant::now();
    resume(&fixtures, &processor);

    assert_eq!(next_retry(&mut events).await, Duration::from_secs(1));
    assert_eq!(processor.drain_state(), DrainState::Idle);
    assert_eq!(next_retry(&mut events).await, Duration::from_secs(2));
    assert_eq!(next_retry(&mut events).await, Duration::from_secs(4));
    assert_eq!(next_batch(&mut events).await, (first.clone(), 0));
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(fixtures.sink.delivered_jobs(), first);

    fixtures.gateway.fail_next_refresh(GroupsError::Timeout);
    let second = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 3)])
        .await;

    assert_eq!(next_retry(&mut events).await, Duration::from_secs(1));
    assert_eq!(next_batch(&mut events).await, (second, 0));
    assert_eq!(fixtures.sink.delivered().len(), 2);
    assert_eq!(fixtures.notifier.count(), 0);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn trigger_during_backoff_drains_right_away() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.service_group(1, 2, &["alice"]);
    fixtures
        .gateway
        .fail_next_refresh(GroupsError::Network("offline".into()));
    let config = QueueConfig {
        retry_base_delay: Duration::from_secs(3600),
        retry_max_delay: Duration::from_secs(7200),
        ..test_config()
    };
    let processor = start_paused_host(&fixtures, config);
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 2)])
        .await;
    resume(&fixtures, &processor);
    assert_eq!(next_retry(&mut events).await, Duration::from_secs(3600));

    let before = Instant::now();
    processor.trigger(DrainTrigger::ConnectivityChanged);
    assert_eq!(next_batch(&mut events).await, (ids, 0));
    assert!(before.elapsed() < Duration::from_secs(3600));
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn trigger_during_failed_update_waits_for_backoff() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.service_group(1, 2, &["alice"]);
    fixtures
        .gateway
        .fail_next_refresh(GroupsError::Network("offline".into()));
    fixtures.gateway.fail_next_refresh(GroupsError::Timeout);
    let config = QueueConfig {
        retry_base_delay: Duration::from_secs(3600),
        retry_max_delay: Duration::from_secs(7200),
        ..test_config()
    };
    let processor = start_paused_host(&fixtures, config);
    fixtures
        .gateway
        .trigger_during_refresh(DrainTrigger::ConnectivityChanged, processor.clone());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 2)])
        .await;
    resume(&fixtures, &processor);
    assert_eq!(next_retry(&mut events).await, Duration::from_secs(3600));

    sleep(Duration::from_secs(3500)).await;
    assert_eq!(fixtures.gateway.calls().len(), 1);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    sleep(Duration::from_secs(200)).await;
    assert_eq!(fixtures.gateway.calls().len(), 2);
    assert_eq!(next_retry(&mut events).await, Duration::from_secs(7200));

    sleep(Duration::from_secs(7000)).await;
    assert_eq!(fixtures.gateway.calls().len(), 2);

    sleep(Duration::from_secs(300)).await;
    assert_eq!(next_batch(&mut events).await, (ids, 0));
    assert_eq!(fixtures.gateway.calls().len(), 3);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn blocked_sender_is_dropped_without_update_delivery_or_notification() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice", "mallory"]);
    fixtures.blocking.block_address(address("mallory"));
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("mallory", 1, 1),
                // would need an update if it were not blocked
                GroupMessage::new("mallory", 1, 5).with_group_change(signed_change(5)),
                GroupMessage::new("alice", 1, 1),
            ],
        )
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids.clone(), 0));
    assert_eq!(fixtures.sink.delivered_jobs(), vec![ids[2]]);
    assert_eq!(fixtures.notifier.count(), 0);
    assert!(fixtures.gateway.calls().is_empty());
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn blocked_group_is_dropped_silently() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.blocking.block_group(group_id(1));
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 9)])
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids, 0));
    assert!(fixtures.sink.delivered().is_empty());
    assert_eq!(fixtures.notifier.count(), 0);
    assert!(fixtures.gateway.calls().is_empty());
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn background_batches_hold_a_single_job() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let messages = (0..10)
        .map(|n| GroupMessage::new("alice", 1, 1).with_body(format!("message {n}")))
        .collect::<Vec<_>>();
    let ids = fixtures.enqueue(&processor, &messages).await;
    processor.trigger(DrainTrigger::EnteredBackground);
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (vec![ids[0]], 9));
    assert_eq!(fixtures.sink.delivered().len(), 1);

    processor.trigger(DrainTrigger::EnteredForeground);
    assert_eq!(next_batch(&mut events).await, (ids[1..].to_vec(), 0));
    assert_eq!(fixtures.sink.delivered_jobs(), ids);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn entering_background_mid_batch_stops_after_current_job() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    fixtures.sink.enter_background_after(2, processor.clone());
    let mut events = processor.subscribe();

    let messages = (0..5)
        .map(|n| GroupMessage::new("alice", 1, 1).with_body(format!("message {n}")))
        .collect::<Vec<_>>();
    let ids = fixtures.enqueue(&processor, &messages).await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids[..2].to_vec(), 3));
    assert_eq!(next_batch(&mut events).await, (vec![ids[2]], 2));
    assert_eq!(next_batch(&mut events).await, (vec![ids[3]], 1));
    assert_eq!(next_batch(&mut events).await, (vec![ids[4]], 0));
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn unreadable_jobs_and_failed_deliveries_notify() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice", "carol"]);
    fixtures.sink.fail_deliveries_from("carol");
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let mut dbtx = fixtures.db.begin_write_transaction().await;
    let garbage = processor
        .enqueue_job(&mut dbtx, vec![0xff; 3], None, group_id(1), false)
        .await;
    let bad_key = GroupMessage::new("alice", 1, 1).with_master_key(vec![1; 7]);
    let bad_key = processor
        .enqueue_job(
            &mut dbtx,
            bad_key.envelope_bytes(),
            Some(bad_key.plaintext_bytes()),
            group_id(1),
            false,
        )
        .await;
    dbtx.commit_tx().await;
    let [carol, alice] = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("carol", 1, 1),
                GroupMessage::new("alice", 1, 1),
            ],
        )
        .await[..]
    else {
        panic!("two jobs enqueued");
    };
    resume(&fixtures, &processor);

    assert_eq!(
        next_batch(&mut events).await,
        (vec![garbage, bad_key, carol, alice], 0)
    );
    assert_eq!(fixtures.notifier.count(), 3);
    assert_eq!(fixtures.sink.delivered_jobs(), vec![alice]);

    // the failed delivery's writes were rolled back
    let mut dbtx = fixtures.db.begin_read_transaction().await;
    assert!(dbtx.get_value(&DeliveredMessageKey(alice)).await.is_some());
    assert!(dbtx.get_value(&DeliveredMessageKey(carol)).await.is_none());
    drop(dbtx);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn membership_and_missing_revision_discards_are_silent() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("eve", 1, 1),
                GroupMessage::new("alice", 1, 1).without_revision(),
                GroupMessage::new("alice", 1, 1).via_sync(),
            ],
        )
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids.clone(), 0));
    assert_eq!(fixtures.sink.delivered_jobs(), vec![ids[2]]);
    assert_eq!(fixtures.notifier.count(), 0);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn permanent_update_failure_drops_job_silently() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures
        .gateway
        .fail_next_refresh(GroupsError::HttpStatus { status: 403 });
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("alice", 1, 4),
                GroupMessage::new("alice", 1, 1),
            ],
        )
        .await;
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (vec![ids[0]], 1));
    assert!(fixtures.sink.delivered().is_empty());
    assert_eq!(next_batch(&mut events).await, (vec![ids[1]], 0));
    assert_eq!(fixtures.sink.delivered_jobs(), vec![ids[1]]);
    assert_eq!(fixtures.notifier.count(), 0);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn enqueue_rejects_what_cannot_be_queued() {
    let fixtures = Fixtures::new();
    let processor = start_paused_host(&fixtures, test_config());
    let message = GroupMessage::new("alice", 1, 1);
    let mut dbtx = fixtures.db.begin_write_transaction().await;

    assert!(matches!(
        processor
            .enqueue(
                &mut dbtx,
                &[],
                Some(message.plaintext_bytes().as_slice()),
                false
            )
            .await,
        Err(EnqueueError::EmptyEnvelope)
    ));
    assert!(matches!(
        processor
            .enqueue(
                &mut dbtx,
                &[0xffu8; 3],
                Some(message.plaintext_bytes().as_slice()),
                false
            )
            .await,
        Err(EnqueueError::MalformedEnvelope(_))
    ));

    let not_a_group_message = Content {
        data_message: Some(DataMessage {
            body: Some("hi".into()),
            group_v2: None,
        }),
        sync_message: None,
    }
    .encode_to_vec();
    assert!(matches!(
        processor
            .enqueue(
                &mut dbtx,
                &message.envelope_bytes(),
                Some(not_a_group_message.as_slice()),
                false
            )
            .await,
        Err(EnqueueError::NotAGroupMessage)
    ));
    assert!(matches!(
        processor
            .enqueue(&mut dbtx, &message.envelope_bytes(), None, false)
            .await,
        Err(EnqueueError::NotAGroupMessage)
    ));

    let bad_key = message.clone().with_master_key(vec![1; 7]);
    assert!(matches!(
        processor
            .enqueue(
                &mut dbtx,
                &bad_key.envelope_bytes(),
                Some(bad_key.plaintext_bytes().as_slice()),
                false
            )
            .await,
        Err(EnqueueError::InvalidGroupContext(_))
    ));

    let id = processor
        .enqueue(
            &mut dbtx,
            &message.envelope_bytes(),
            Some(message.plaintext_bytes().as_slice()),
            true,
        )
        .await
        .expect("valid message");
    assert!(id.is_some());

    // nothing is visible until the caller commits
    assert!(!processor.has_pending_jobs().await);
    dbtx.commit_tx().await;
    assert!(processor.has_pending_jobs().await);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn disabled_queue_drops_messages() {
    let fixtures = Fixtures::new();
    let processor = fixtures.start(QueueConfig {
        enabled: false,
        ..test_config()
    });
    let message = GroupMessage::new("alice", 1, 1);

    let mut dbtx = fixtures.db.begin_write_transaction().await;
    let id = processor
        .enqueue(
            &mut dbtx,
            &message.envelope_bytes(),
            Some(message.plaintext_bytes().as_slice()),
            false,
        )
        .await
        .expect("dropping is not an error");
    dbtx.commit_tx().await;

    assert_eq!(id, None);
    assert!(!processor.has_pending_jobs().await);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn host_that_is_not_ready_keeps_jobs_queued() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    fixtures.host.set_should_process(false);
    let processor = fixtures.start(test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 1)])
        .await;
    processor.trigger(DrainTrigger::SocketStateChanged);
    sleep(Duration::from_secs(60)).await;

    assert!(processor.has_pending_jobs().await);
    assert!(fixtures.sink.delivered().is_empty());
    assert_eq!(processor.drain_state(), DrainState::Idle);

    fixtures.host.set_should_process(true);
    processor.trigger(DrainTrigger::ConnectivityChanged);
    assert_eq!(next_batch(&mut events).await, (ids, 0));
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn concurrent_triggers_never_overlap_drains() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    let processor = fixtures.start(QueueConfig {
        batch_size: 3,
        ..test_config()
    });
    let mut events = processor.subscribe();

    let mut ids = vec![];
    for n in 0..20 {
        let message = GroupMessage::new("alice", 1, 1).with_body(format!("message {n}"));
        ids.extend(fixtures.enqueue(&processor, &[message]).await);
        for trigger in [
            DrainTrigger::ConnectivityChanged,
            DrainTrigger::SocketStateChanged,
            DrainTrigger::RegistrationStateChanged,
        ] {
            processor.trigger(trigger);
        }
        tokio::task::yield_now().await;
    }

    loop {
        let (_, remaining) = next_batch(&mut events).await;
        if remaining == 0 && fixtures.sink.delivered().len() == ids.len() {
            break;
        }
    }
    wait_for_drained(&mut events).await;

    assert_eq!(fixtures.sink.delivered_jobs(), ids);
    assert_eq!(fixtures.sink.max_concurrent_deliveries(), 1);
    assert_eq!(processor.drain_state(), DrainState::Idle);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn queued_jobs_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");

    let ids = {
        let fixtures =
            Fixtures::with_db(RocksDb::open(&path).expect("open db").into_database());
        let processor = start_paused_host(&fixtures, test_config());
        let ids = fixtures
            .enqueue(
                &processor,
                &[
                    GroupMessage::new("alice", 1, 1),
                    GroupMessage::new("alice", 1, 1),
                    GroupMessage::new("alice", 1, 1),
                ],
            )
            .await;
        drop(processor);
        fixtures.shutdown().await;
        ids
    };

    let fixtures = Fixtures::with_db(RocksDb::open(&path).expect("reopen db").into_database());
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();
    assert!(processor.has_pending_jobs().await);

    resume(&fixtures, &processor);
    assert_eq!(next_batch(&mut events).await, (ids.clone(), 0));
    assert_eq!(fixtures.sink.delivered_jobs(), ids);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn drained_is_broadcast_once_backlog_is_clear() {
    let fixtures = Fixtures::new();
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("alice", 1, 1),
                GroupMessage::new("alice", 1, 1),
            ],
        )
        .await;
    resume(&fixtures, &processor);

    assert!(matches!(
        next_event(&mut events).await,
        QueueEvent::BatchCompleted { remaining: 0, .. }
    ));
    assert_eq!(next_event(&mut events).await, QueueEvent::Drained);
    assert!(!processor.has_pending_jobs().await);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn conflicting_batch_commit_is_rerun() {
    let raw = FlakyCommitDatabase::new();
    let faults = raw.faults();
    let fixtures = Fixtures::with_db(raw.into_database());
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(
            &processor,
            &[
                GroupMessage::new("alice", 1, 1),
                GroupMessage::new("alice", 1, 1),
            ],
        )
        .await;
    faults.fail_next(2);
    resume(&fixtures, &processor);

    assert_eq!(next_batch(&mut events).await, (ids.clone(), 0));
    wait_for_drained(&mut events).await;
    assert_eq!(faults.failed(), 2);
    assert_eq!(processor.drain_state(), DrainState::Idle);
    assert!(!processor.has_pending_jobs().await);

    let mut dbtx = fixtures.db.begin_read_transaction().await;
    for id in ids {
        assert!(dbtx.get_value(&DeliveredMessageKey(id)).await.is_some());
    }
    drop(dbtx);
    fixtures.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn queue_halts_when_batch_never_commits() {
    let raw = FlakyCommitDatabase::new();
    let faults = raw.faults();
    let fixtures = Fixtures::with_db(raw.into_database());
    fixtures.local_group(1, 1, &["alice"]);
    let processor = start_paused_host(&fixtures, test_config());
    let mut events = processor.subscribe();

    let ids = fixtures
        .enqueue(&processor, &[GroupMessage::new("alice", 1, 1)])
        .await;
    faults.fail_all();
    resume(&fixtures, &processor);

    assert_eq!(next_event(&mut events).await, QueueEvent::Halted);
    assert_eq!(processor.drain_state(), DrainState::Halted);
    assert_eq!(faults.failed(), 5);
    assert!(processor.has_pending_jobs().await);

    let mut dbtx = fixtures.db.begin_read_transaction().await;
    assert!(dbtx.get_value(&DeliveredMessageKey(ids[0])).await.is_none());
    drop(dbtx);

    // a halted queue ignores further triggers
    processor.trigger(DrainTrigger::ConnectivityChanged);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(faults.failed(), 5);
    assert_eq!(processor.drain_state(), DrainState::Halted);
    fixtures.shutdown().await;
}
