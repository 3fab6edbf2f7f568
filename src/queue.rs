//! Reliable queue backend: put / get / ack / nack / reject.
//!
//! A task id moves between the pending list, a one-shot staging key and the
//! waiting list, while its record stays in the task hash until it is acked,
//! replaced by a redelivery or dead-lettered. Presence in the hash is the only
//! "still outstanding" signal. Multi-step writes are sent as non-transactional
//! batches; every crash window is marked with the sweep that heals it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{TaskError, TaskResult};
use crate::keys::{self, QueueKeys, QUEUE_STATE_PREFIXES};
use crate::maintenance::SweepSchedule;
use crate::store::{Command, RedisStore, Store};
use crate::task::{TaskId, TaskMeta, TaskRecord};

/// Configuration for the task queue
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Retry budget for tasks that do not carry their own
    pub max_retry: u32,
    /// How long a reservation may stay unresolved before it is redelivered
    pub visibility_timeout: Duration,
    /// Expiry of the advisory locks taken by the sweeps
    pub lock_ttl: Duration,
    /// Age after which a staging key is considered left behind by a crashed dequeue
    pub staging_staleness: Duration,
    /// Minimum spacing between timeout sweeps
    pub timeout_sweep_interval: Duration,
    /// Minimum spacing between staging sweeps
    pub staging_sweep_interval: Duration,
    /// Also run due sweeps when queue statistics are requested
    pub sweep_on_report: bool,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_retry: 3,
            visibility_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(10),
            staging_staleness: Duration::from_secs(60),
            timeout_sweep_interval: Duration::from_secs(1),
            staging_sweep_interval: Duration::from_secs(10),
            sweep_on_report: false,
        }
    }
}

impl TaskQueueConfig {
    /// Reject settings the sweeps cannot work with.
    ///
    /// The staging staleness must not be shorter than the lock TTL, and both
    /// must exceed the round trip of the reserve bookkeeping batch, otherwise
    /// a live dequeue could have its staging key recovered from under it.
    pub fn validate(&self) -> TaskResult<()> {
        let durations = [
            ("visibility_timeout", self.visibility_timeout),
            ("lock_ttl", self.lock_ttl),
            ("staging_staleness", self.staging_staleness),
            ("timeout_sweep_interval", self.timeout_sweep_interval),
            ("staging_sweep_interval", self.staging_sweep_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(TaskError::config(format!("{name} must be greater than zero")));
            }
        }
        if self.staging_staleness < self.lock_ttl {
            return Err(TaskError::config(format!(
                "staging_staleness ({:?}) must not be shorter than lock_ttl ({:?})",
                self.staging_staleness, self.lock_ttl
            )));
        }
        Ok(())
    }
}

/// What the task hash holds for an id
#[derive(Debug)]
pub(crate) enum Stored {
    Record(TaskRecord),
    Missing,
    /// The entry did not decode and was moved to the dead-letter list
    Quarantined,
}

/// Point-in-time statistics for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Ids waiting in the pending list
    pub pending: u64,
    /// Records in the task hash (pending or reserved)
    pub outstanding: u64,
    /// Records in the dead-letter list
    pub dead_lettered: u64,
    /// Outstanding reservations according to the counter. Reporting only:
    /// resolving never-reserved ids lowers it, and negative values read as 0.
    pub waiting: u64,
}

/// Reliable task queue over a shared key-value store
#[derive(Debug)]
pub struct TaskQueue {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: TaskQueueConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) schedule: SweepSchedule,
}

impl TaskQueue {
    /// Create a new task queue connected to Redis
    pub async fn new(config: TaskQueueConfig) -> TaskResult<Self> {
        let store = RedisStore::connect(&config.redis_url).await?;
        Self::with_store(config, Arc::new(store))
    }

    /// Create a new task queue with default configuration
    pub async fn new_default() -> TaskResult<Self> {
        Self::new(TaskQueueConfig::default()).await
    }

    /// Create a task queue over an existing store
    pub fn with_store(config: TaskQueueConfig, store: Arc<dyn Store>) -> TaskResult<Self> {
        Self::with_store_and_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_store_and_clock(
        config: TaskQueueConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> TaskResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock,
            schedule: SweepSchedule::default(),
        })
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Enqueue a task under a freshly generated id with `retry = 0`
    pub async fn put_task(&self, queue_id: &str, task: TaskRecord) -> TaskResult<TaskId> {
        let keys = QueueKeys::new(queue_id);
        let record = TaskRecord {
            id: TaskId::new_v4(),
            meta: TaskMeta {
                retry: 0,
                max_retry: Some(task.max_retry(self.config.max_retry)),
                created_at: task.meta.created_at,
            },
            payload: task.payload,
        };

        // Hash first: an id in the pending list always has a record behind it.
        self.store
            .batch(vec![
                Command::hset(&keys.hash, record.id.to_string(), record.encode()?),
                Command::lpush(&keys.pending, record.id.to_string()),
            ])
            .await?;

        debug!("Put task {} on queue {}", record.id, queue_id);
        Ok(record.id)
    }

    /// Reserve the oldest pending task, or `None` when nothing is deliverable
    pub async fn get_task(&self, queue_id: &str) -> TaskResult<Option<TaskRecord>> {
        let keys = QueueKeys::new(queue_id);

        loop {
            let now_ms = self.clock.now_ms();
            let staging = keys.staging(now_ms);

            let Some(raw_id) = self.store.rpoplpush(&keys.pending, &staging).await? else {
                return Ok(None);
            };

            // Crash window: until the batch below lands, the id is referenced only
            // by the staging key. The staging sweep pushes it back to pending.
            let Ok(id) = raw_id.parse::<TaskId>() else {
                warn!("Dropping malformed id {:?} from queue {}", raw_id, queue_id);
                self.store.del(&staging).await?;
                continue;
            };

            self.store
                .batch(vec![
                    Command::lpush(&keys.waiting, keys::waiting_entry(now_ms, &id)),
                    Command::del(&staging),
                    Command::incr_by(&keys.counter, 1),
                ])
                .await?;

            match self.lookup(&keys, &id).await? {
                Stored::Record(record) => {
                    debug!("Reserved task {} from queue {}", id, queue_id);
                    return Ok(Some(record));
                }
                Stored::Missing => {
                    // Resolved while still pending; the timeout sweep discards
                    // the orphaned waiting entry.
                    warn!("Pending task {} on queue {} has no record", id, queue_id);
                    self.store.incr_by(&keys.counter, -1).await?;
                }
                // Already dead-lettered and uncounted; try the next id
                Stored::Quarantined => {}
            }
        }
    }

    /// Mark a task as done. Returns `false` if the id is no longer outstanding.
    ///
    /// The reservation counter is decremented whenever a record is removed,
    /// so resolving an id that was never reserved makes the `waiting` figure
    /// of [`QueueInfo`] undercount until the counter catches up.
    pub async fn ack_task(&self, queue_id: &str, id: &TaskId) -> TaskResult<bool> {
        let keys = QueueKeys::new(queue_id);

        // The hash delete decides the winner; only it may touch the counter.
        if !self.store.hdel(&keys.hash, &id.to_string()).await? {
            debug!("Ack for unknown task {} on queue {}", id, queue_id);
            return Ok(false);
        }
        self.store.incr_by(&keys.counter, -1).await?;

        debug!("Acked task {} on queue {}", id, queue_id);
        Ok(true)
    }

    /// Report a failed attempt: redeliver under a new id, or dead-letter once
    /// the retry budget is spent. Decrements the reservation counter like
    /// [`TaskQueue::ack_task`].
    pub async fn nack_task(&self, queue_id: &str, id: &TaskId) -> TaskResult<bool> {
        let keys = QueueKeys::new(queue_id);
        match self.lookup(&keys, id).await? {
            Stored::Record(record) => self.retry_or_dead_letter(&keys, record).await,
            Stored::Quarantined => Ok(true),
            Stored::Missing => {
                debug!("Nack for unknown task {} on queue {}", id, queue_id);
                Ok(false)
            }
        }
    }

    /// Move a task straight to the dead-letter list. Decrements the
    /// reservation counter like [`TaskQueue::ack_task`].
    pub async fn reject_task(&self, queue_id: &str, id: &TaskId) -> TaskResult<bool> {
        let keys = QueueKeys::new(queue_id);
        match self.lookup(&keys, id).await? {
            Stored::Record(record) => self.dead_letter(&keys, &record).await,
            Stored::Quarantined => Ok(true),
            Stored::Missing => {
                debug!("Reject for unknown task {} on queue {}", id, queue_id);
                Ok(false)
            }
        }
    }

    /// Statistics for one queue
    pub async fn queue_info(&self, queue_id: &str) -> TaskResult<QueueInfo> {
        if self.config.sweep_on_report {
            self.run_due_sweeps().await?;
        }
        self.read_queue_info(queue_id).await
    }

    /// Statistics for every known queue
    pub async fn queues_info(&self) -> TaskResult<BTreeMap<String, QueueInfo>> {
        if self.config.sweep_on_report {
            self.run_due_sweeps().await?;
        }

        let mut infos = BTreeMap::new();
        for queue_id in self.list_queues().await? {
            let info = self.read_queue_info(&queue_id).await?;
            infos.insert(queue_id, info);
        }
        Ok(infos)
    }

    /// Queue ids that currently hold any state
    pub async fn list_queues(&self) -> TaskResult<Vec<String>> {
        let mut queues = BTreeSet::new();
        for prefix in QUEUE_STATE_PREFIXES {
            for key in self.store.scan_keys(&keys::prefix_pattern(prefix)).await? {
                if let Some(queue_id) = keys::queue_id_from_key(prefix, &key) {
                    queues.insert(queue_id.to_string());
                }
            }
        }
        Ok(queues.into_iter().collect())
    }

    /// Most recently dead-lettered records, newest first
    pub async fn dead_letters(&self, queue_id: &str, limit: usize) -> TaskResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = QueueKeys::new(queue_id);
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        self.store
            .lrange(&keys.dead_letter, 0, stop)
            .await?
            .iter()
            .map(|data| TaskRecord::decode(data))
            .collect()
    }

    /// Re-enqueue the oldest dead-lettered record with a fresh retry budget
    pub async fn replay_dead_letter(&self, queue_id: &str) -> TaskResult<Option<TaskId>> {
        let keys = QueueKeys::new(queue_id);
        let Some(data) = self.store.rpop(&keys.dead_letter).await? else {
            return Ok(None);
        };

        // Crash window: a process dying here loses this record from the
        // dead-letter list; replay is an operator action and is not swept.
        let replayed = match TaskRecord::decode(&data) {
            Ok(record) => self.put_task(queue_id, record).await,
            Err(e) => Err(e),
        };

        match replayed {
            Ok(id) => {
                info!("Replayed dead-lettered task on queue {} as {}", queue_id, id);
                Ok(Some(id))
            }
            Err(e) => {
                self.store.lpush(&keys.dead_letter, &data).await?;
                Err(e)
            }
        }
    }

    pub(crate) async fn read_queue_info(&self, queue_id: &str) -> TaskResult<QueueInfo> {
        let keys = QueueKeys::new(queue_id);
        let waiting = self.store.get_int(&keys.counter).await?;
        Ok(QueueInfo {
            pending: self.store.llen(&keys.pending).await?,
            outstanding: self.store.hlen(&keys.hash).await?,
            dead_lettered: self.store.llen(&keys.dead_letter).await?,
            waiting: u64::try_from(waiting).unwrap_or(0),
        })
    }

    /// Fetch a record. One that no longer decodes is moved, raw, to the
    /// dead-letter list so it cannot wedge the queue.
    pub(crate) async fn lookup(&self, keys: &QueueKeys, id: &TaskId) -> TaskResult<Stored> {
        let Some(data) = self.store.hget(&keys.hash, &id.to_string()).await? else {
            return Ok(Stored::Missing);
        };
        match TaskRecord::decode(&data) {
            Ok(record) => Ok(Stored::Record(record)),
            Err(e) => {
                warn!(
                    "Dead-lettering undecodable task {} on queue {}: {}",
                    id, keys.queue_id, e
                );
                if !self.store.hdel(&keys.hash, &id.to_string()).await? {
                    return Ok(Stored::Missing);
                }
                self.store
                    .batch(vec![
                        Command::incr_by(&keys.counter, -1),
                        Command::lpush(&keys.dead_letter, data),
                    ])
                    .await?;
                Ok(Stored::Quarantined)
            }
        }
    }

    /// Shared by nack and the timeout sweep
    pub(crate) async fn retry_or_dead_letter(
        &self,
        keys: &QueueKeys,
        record: TaskRecord,
    ) -> TaskResult<bool> {
        if record.is_exhausted(self.config.max_retry) {
            info!(
                "Task {} on queue {} exhausted {} retries",
                record.id, keys.queue_id, record.meta.retry
            );
            return self.dead_letter(keys, &record).await;
        }

        if !self.store.hdel(&keys.hash, &record.id.to_string()).await? {
            return Ok(false);
        }

        // Crash window: the old id is gone but the redelivery is not yet stored.
        // This is the one step that can lose a task; the batch is sent in a
        // single write to keep it as short as possible.
        let next = record.redelivery();
        self.store
            .batch(vec![
                Command::incr_by(&keys.counter, -1),
                Command::hset(&keys.hash, next.id.to_string(), next.encode()?),
                Command::lpush(&keys.pending, next.id.to_string()),
            ])
            .await?;

        debug!(
            "Requeued task {} on queue {} as {} (retry {})",
            record.id, keys.queue_id, next.id, next.meta.retry
        );
        Ok(true)
    }

    pub(crate) async fn dead_letter(&self, keys: &QueueKeys, record: &TaskRecord) -> TaskResult<bool> {
        if !self.store.hdel(&keys.hash, &record.id.to_string()).await? {
            return Ok(false);
        }

        // The full record goes to the dead-letter list since the hash entry is gone.
        self.store
            .batch(vec![
                Command::incr_by(&keys.counter, -1),
                Command::lpush(&keys.dead_letter, record.encode()?),
            ])
            .await?;

        info!("Dead-lettered task {} on queue {}", record.id, keys.queue_id);
        Ok(true)
    }
}
