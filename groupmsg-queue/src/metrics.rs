use std::sync::LazyLock;

use groupmsg_metrics::prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry,
};
use groupmsg_metrics::{
    Histogram, IntCounter, IntCounterVec, REGISTRY, histogram_opts, opts,
};

pub(crate) static QUEUE_JOBS_ENQUEUED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!("queue_jobs_enqueued_total", "Group messages added to the queue"),
        REGISTRY
    )
    .unwrap()
});
pub(crate) static QUEUE_JOBS_DELIVERED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!(
            "queue_jobs_delivered_total",
            "Group messages handed to the delivery sink successfully"
        ),
        REGISTRY
    )
    .unwrap()
});
pub(crate) static QUEUE_JOBS_DISCARDED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        opts!(
            "queue_jobs_discarded_total",
            "Group messages dropped without delivery"
        ),
        &["reason"],
        REGISTRY
    )
    .unwrap()
});
pub(crate) static QUEUE_CORRUPTED_NOTIFICATIONS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| {
        register_int_counter_with_registry!(
            opts!(
                "queue_corrupted_message_notifications_total",
                "Corrupted message notifications raised"
            ),
            REGISTRY
        )
        .unwrap()
    });
pub(crate) static QUEUE_GROUP_UPDATE_OUTCOMES_TOTAL: LazyLock<IntCounterVec> =
    LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            opts!(
                "queue_group_update_outcomes_total",
                "Outcomes of group state reconciliation"
            ),
            &["outcome"],
            REGISTRY
        )
        .unwrap()
    });
pub(crate) static QUEUE_RETRY_WAITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!(
            "queue_retry_waits_total",
            "Drains that ended waiting to retry a group update"
        ),
        REGISTRY
    )
    .unwrap()
});
pub(crate) static QUEUE_BATCH_JOBS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram_with_registry!(
        histogram_opts!(
            "queue_batch_jobs",
            "Jobs completed per committed batch",
            vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]
        ),
        REGISTRY
    )
    .unwrap()
});
