use reliable_task_queue::keys::{parse_waiting_entry, StagingKey};
use reliable_task_queue::{
    Clock, ManualClock, MemoryStore, QueueKeys, Store, TaskId, TaskQueue, TaskQueueConfig,
    TaskRecord,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const START_MS: i64 = 1_700_000_000_000;

struct Harness {
    queue: TaskQueue,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn harness(config: TaskQueueConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let queue = TaskQueue::with_store_and_clock(config, store.clone(), clock.clone()).unwrap();
    Harness { queue, store, clock }
}

/// Every id referenced by the pending list, the staging keys and the waiting
/// list of a queue, with duplicates preserved.
async fn referenced_ids(h: &Harness, queue_id: &str) -> Vec<String> {
    let keys = QueueKeys::new(queue_id);
    let mut ids = h.store.list_snapshot(&keys.pending).unwrap();
    for staging in h.store.scan_keys("tempq::*").await.unwrap() {
        if StagingKey::parse(&staging).map(|s| s.queue_id) == Some(queue_id.to_string()) {
            ids.extend(h.store.list_snapshot(&staging).unwrap());
        }
    }
    for entry in h.store.list_snapshot(&keys.waiting).unwrap() {
        let (_, id) = parse_waiting_entry(&entry).unwrap();
        // Waiting entries of resolved tasks linger until the sweep drops them
        if h.store.hget(&keys.hash, &id.to_string()).await.unwrap().is_some() {
            ids.push(id.to_string());
        }
    }
    ids
}

async fn assert_single_ownership(h: &Harness, queue_id: &str) {
    let ids = referenced_ids(h, queue_id).await;
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "id referenced twice: {ids:?}");
}

#[tokio::test]
async fn put_get_ack_scenario() {
    let h = harness(TaskQueueConfig::default());

    let a = h.queue.put_task("Q", TaskRecord::new(json!({"payload": "x"}))).await.unwrap();
    let task = h.queue.get_task("Q").await.unwrap().unwrap();
    assert_eq!(task.id, a);

    assert!(h.queue.ack_task("Q", &a).await.unwrap());
    assert!(!h.queue.ack_task("Q", &a).await.unwrap());

    let info = h.queue.queue_info("Q").await.unwrap();
    assert_eq!(info.pending, 0);
    assert_eq!(info.outstanding, 0);
    assert_eq!(info.waiting, 0);
}

#[tokio::test]
async fn duplicate_acks_never_push_counter_below_zero() {
    let h = harness(TaskQueueConfig::default());
    let a = h.queue.put_task("Q", TaskRecord::new(json!(1))).await.unwrap();
    h.queue.get_task("Q").await.unwrap();

    for _ in 0..3 {
        h.queue.ack_task("Q", &a).await.unwrap();
    }
    assert_eq!(h.store.get_int("wn::Q").await.unwrap(), 0);
    assert!(!h.queue.ack_task("Q", &TaskId::new_v4()).await.unwrap());
    assert_eq!(h.store.get_int("wn::Q").await.unwrap(), 0);
}

#[tokio::test]
async fn nack_until_dead_letter_scenario() {
    let h = harness(TaskQueueConfig {
        max_retry: 1,
        ..Default::default()
    });

    h.queue.put_task("Q", TaskRecord::new(json!("x"))).await.unwrap();
    let a = h.queue.get_task("Q").await.unwrap().unwrap();
    assert_eq!(a.meta.retry, 0);
    assert!(h.queue.nack_task("Q", &a.id).await.unwrap());

    let b = h.queue.get_task("Q").await.unwrap().unwrap();
    assert_ne!(b.id, a.id);
    assert_eq!(b.meta.retry, 1);
    assert!(h.queue.nack_task("Q", &b.id).await.unwrap());

    let info = h.queue.queue_info("Q").await.unwrap();
    assert_eq!(info.dead_lettered, 1);
    assert_eq!(info.outstanding, 0);
    assert_eq!(h.store.hget("qh::Q", &a.id.to_string()).await.unwrap(), None);
    assert_eq!(h.store.hget("qh::Q", &b.id.to_string()).await.unwrap(), None);

    let dead = h.queue.dead_letters("Q", 5).await.unwrap();
    assert_eq!(dead[0].id, b.id);
    assert_eq!(dead[0].meta.retry, 1);
}

#[tokio::test]
async fn expired_reservation_reappears_with_incremented_retry() {
    let h = harness(TaskQueueConfig::default());
    h.queue.put_task("Q", TaskRecord::new(json!("x"))).await.unwrap();
    let reserved = h.queue.get_task("Q").await.unwrap().unwrap();

    h.clock.advance(h.queue.config().visibility_timeout + Duration::from_millis(1));
    let report = h.queue.sweep_timeouts("Q").await.unwrap().unwrap();
    assert_eq!(report.redelivered, 1);

    let pending = h.store.list_snapshot("q::Q").unwrap();
    assert_eq!(pending.len(), 1);
    let redelivered = h.queue.get_task("Q").await.unwrap().unwrap();
    assert_eq!(redelivered.id.to_string(), pending[0]);
    assert_ne!(redelivered.id, reserved.id);
    assert_eq!(redelivered.meta.retry, reserved.meta.retry + 1);
    assert_eq!(redelivered.meta.created_at, reserved.meta.created_at);
}

#[tokio::test]
async fn timeout_sweep_handles_every_expired_entry() {
    let h = harness(TaskQueueConfig {
        max_retry: 2,
        ..Default::default()
    });
    const N: usize = 5;

    for i in 0..N {
        h.queue.put_task("Q", TaskRecord::new(json!(i))).await.unwrap();
    }
    // One exhausted task among them
    let exhausted = TaskRecord::new(json!("last")).with_max_retry(0);
    h.queue.put_task("Q", exhausted).await.unwrap();
    for _ in 0..=N {
        h.queue.get_task("Q").await.unwrap().unwrap();
        h.clock.advance(Duration::from_millis(10));
    }

    h.clock.advance(Duration::from_secs(31));
    let report = h.queue.sweep_timeouts("Q").await.unwrap().unwrap();
    assert_eq!(report.redelivered, N as u64);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.discarded, 0);

    let info = h.queue.queue_info("Q").await.unwrap();
    assert_eq!(h.store.llen("wq::Q").await.unwrap(), 0);
    assert_eq!(info.pending, N as u64);
    assert_eq!(info.dead_lettered, 1);
    assert_eq!(info.waiting, 0);
}

#[tokio::test]
async fn abandoned_task_is_never_lost() {
    let h = harness(TaskQueueConfig {
        max_retry: 3,
        ..Default::default()
    });
    h.queue.put_task("Q", TaskRecord::new(json!("work"))).await.unwrap();

    let mut retries = Vec::new();
    // A worker that always reserves and then disappears
    while let Some(task) = h.queue.get_task("Q").await.unwrap() {
        retries.push(task.meta.retry);
        assert_single_ownership(&h, "Q").await;
        h.clock.advance(Duration::from_secs(31));
        h.queue.sweep_timeouts("Q").await.unwrap();
    }

    assert_eq!(retries, vec![0, 1, 2, 3]);
    assert!(retries.windows(2).all(|w| w[1] > w[0]));
    let info = h.queue.queue_info("Q").await.unwrap();
    assert_eq!(info.dead_lettered, 1);
    assert_eq!(info.outstanding, 0);
}

#[tokio::test]
async fn crashed_dequeue_is_healed_by_staging_sweep() {
    let h = harness(TaskQueueConfig::default());
    let keys = QueueKeys::new("Q");
    let id = h.queue.put_task("Q", TaskRecord::new(json!("x"))).await.unwrap();

    let staging = keys.staging(h.clock.now_ms());
    h.store.rpoplpush(&keys.pending, &staging).await.unwrap();
    assert_single_ownership(&h, "Q").await;
    assert_eq!(h.queue.get_task("Q").await.unwrap(), None);

    h.clock.advance(h.queue.config().staging_staleness);
    let report = h.queue.sweep_staging().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_single_ownership(&h, "Q").await;

    let task = h.queue.get_task("Q").await.unwrap().unwrap();
    assert_eq!(task.id, id);
    assert!(h.queue.ack_task("Q", &id).await.unwrap());
}

#[tokio::test]
async fn reporting_triggers_sweeps_when_enabled() {
    let h = harness(TaskQueueConfig {
        sweep_on_report: true,
        ..Default::default()
    });
    h.queue.put_task("Q", TaskRecord::new(json!("x"))).await.unwrap();
    h.queue.get_task("Q").await.unwrap();

    h.clock.advance(Duration::from_secs(31));
    let infos = h.queue.queues_info().await.unwrap();
    assert_eq!(infos["Q"].pending, 1);
    assert_eq!(infos["Q"].waiting, 0);
}

#[tokio::test]
async fn reporting_is_read_only_by_default() {
    let h = harness(TaskQueueConfig::default());
    h.queue.put_task("Q", TaskRecord::new(json!("x"))).await.unwrap();
    h.queue.get_task("Q").await.unwrap();

    h.clock.advance(Duration::from_secs(31));
    let infos = h.queue.queues_info().await.unwrap();
    assert_eq!(infos["Q"].pending, 0);
    assert_eq!(infos["Q"].waiting, 1);
}

#[tokio::test]
async fn concurrent_consumers_never_share_a_task() {
    let h = Arc::new(harness(TaskQueueConfig::default()));
    for i in 0..50 {
        h.queue.put_task("Q", TaskRecord::new(json!(i))).await.unwrap();
    }

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let h = h.clone();
        consumers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(task) = h.queue.get_task("Q").await.unwrap() {
                assert!(h.queue.ack_task("Q", &task.id).await.unwrap());
                seen.push(task.id);
            }
            seen
        }));
    }

    let mut all = HashSet::new();
    for consumer in consumers {
        for id in consumer.await.unwrap() {
            assert!(all.insert(id));
        }
    }
    assert_eq!(all.len(), 50);
    assert_eq!(h.queue.queue_info("Q").await.unwrap().waiting, 0);
}
