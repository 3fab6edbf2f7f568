//! Self-healing sweeps.
//!
//! Two idempotent, lock-guarded procedures keep the queue consistent after
//! partial failures:
//!
//! - the timeout sweep redelivers or dead-letters reservations whose
//!   visibility timeout has passed;
//! - the staging sweep pushes ids stranded in staging keys by a crashed
//!   dequeue back onto their pending list.
//!
//! [`MaintenanceRunner`] drives both on a timer, rate limited by
//! [`SweepSchedule`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::duration_ms;
use crate::error::TaskResult;
use crate::keys::{self, QueueKeys, StagingKey};
use crate::queue::{Stored, TaskQueue};

const NEVER: i64 = i64::MIN;

/// Outcome of timeout sweeps over one or more queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSweepReport {
    /// Expired reservations put back on the pending list under a new id
    pub redelivered: u64,
    /// Expired reservations whose retry budget was spent
    pub dead_lettered: u64,
    /// Waiting entries dropped because their task was already resolved
    pub discarded: u64,
}

impl TimeoutSweepReport {
    fn merge(&mut self, other: TimeoutSweepReport) {
        self.redelivered += other.redelivered;
        self.dead_lettered += other.dead_lettered;
        self.discarded += other.discarded;
    }
}

/// Outcome of one staging sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSweepReport {
    /// Stranded ids pushed back onto their pending list
    pub recovered: u64,
    /// Stale staging keys deleted
    pub removed: u64,
}

/// What [`TaskQueue::run_due_sweeps`] did; `None` means the sweep was not due
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub timeouts: Option<TimeoutSweepReport>,
    pub staging: Option<StagingSweepReport>,
}

/// Independent rate limits for the two sweeps, in clock milliseconds
#[derive(Debug)]
pub struct SweepSchedule {
    last_timeout_sweep: AtomicI64,
    last_staging_sweep: AtomicI64,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            last_timeout_sweep: AtomicI64::new(NEVER),
            last_staging_sweep: AtomicI64::new(NEVER),
        }
    }
}

impl SweepSchedule {
    /// Claim a run if `interval` has elapsed since the last one. At most one
    /// caller in this process wins each slot.
    fn claim(last_run: &AtomicI64, interval: Duration, now_ms: i64) -> bool {
        let previous = last_run.load(Ordering::Acquire);
        if previous != NEVER && now_ms.saturating_sub(previous) < duration_ms(interval) {
            return false;
        }
        last_run
            .compare_exchange(previous, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn claim_timeout_sweep(&self, interval: Duration, now_ms: i64) -> bool {
        Self::claim(&self.last_timeout_sweep, interval, now_ms)
    }

    pub fn claim_staging_sweep(&self, interval: Duration, now_ms: i64) -> bool {
        Self::claim(&self.last_staging_sweep, interval, now_ms)
    }
}

impl TaskQueue {
    /// Run whichever sweeps are due according to their intervals.
    ///
    /// A failing queue is logged and skipped; it never holds back the other
    /// queues or the staging sweep.
    pub async fn run_due_sweeps(&self) -> TaskResult<MaintenanceReport> {
        let now_ms = self.clock.now_ms();
        let mut report = MaintenanceReport::default();

        if self
            .schedule
            .claim_timeout_sweep(self.config.timeout_sweep_interval, now_ms)
        {
            report.timeouts = Some(self.sweep_all_timeouts().await);
        }

        if self
            .schedule
            .claim_staging_sweep(self.config.staging_sweep_interval, now_ms)
        {
            report.staging = Some(self.sweep_staging().await?);
        }

        Ok(report)
    }

    async fn sweep_all_timeouts(&self) -> TimeoutSweepReport {
        let mut total = TimeoutSweepReport::default();
        let queues = match self.list_queues().await {
            Ok(queues) => queues,
            Err(e) => {
                error!("Timeout sweep could not list queues: {}", e);
                return total;
            }
        };

        for queue_id in queues {
            match self.sweep_timeouts(&queue_id).await {
                Ok(Some(queue_report)) => total.merge(queue_report),
                Ok(None) => {}
                Err(e) => error!("Timeout sweep of queue {} failed: {}", queue_id, e),
            }
        }
        total
    }

    /// Release a sweep lock only if `token` still owns it
    async fn release_lock(&self, lock: &str, token: &str) -> TaskResult<()> {
        if !self.store.del_if_eq(lock, token).await? {
            warn!("Sweep lock {} expired before it was released", lock);
        }
        Ok(())
    }

    /// Reclaim expired reservations of one queue.
    ///
    /// Returns `None` when another sweeper holds the queue's lock.
    pub async fn sweep_timeouts(&self, queue_id: &str) -> TaskResult<Option<TimeoutSweepReport>> {
        let keys = QueueKeys::new(queue_id);
        let token = Uuid::new_v4().to_string();

        if !self
            .store
            .set_nx_px(&keys.lock, &token, self.config.lock_ttl)
            .await?
        {
            debug!("Timeout sweep of queue {} already in progress", queue_id);
            return Ok(None);
        }

        let outcome = self.drain_expired(&keys).await;
        let released = self.release_lock(&keys.lock, &token).await;
        let report = outcome?;
        released?;

        if report != TimeoutSweepReport::default() {
            info!(
                "Timeout sweep of queue {}: {} redelivered, {} dead-lettered, {} discarded",
                queue_id, report.redelivered, report.dead_lettered, report.discarded
            );
        }
        Ok(Some(report))
    }

    /// Walk the waiting list from its tail (the oldest reservation) until a
    /// reservation that has not expired yet.
    async fn drain_expired(&self, keys: &QueueKeys) -> TaskResult<TimeoutSweepReport> {
        let now_ms = self.clock.now_ms();
        let timeout_ms = duration_ms(self.config.visibility_timeout);
        let mut report = TimeoutSweepReport::default();

        while let Some(entry) = self.store.lindex(&keys.waiting, -1).await? {
            match keys::parse_waiting_entry(&entry) {
                None => {
                    warn!("Discarding malformed waiting entry {:?} on queue {}", entry, keys.queue_id);
                    report.discarded += 1;
                }
                Some((reserved_ms, _)) if reserved_ms.saturating_add(timeout_ms) > now_ms => break,
                Some((_, id)) => match self.lookup(keys, &id).await? {
                    Stored::Missing => report.discarded += 1,
                    Stored::Quarantined => report.dead_lettered += 1,
                    Stored::Record(record) => {
                        let exhausted = record.is_exhausted(self.config.max_retry);
                        if !self.retry_or_dead_letter(keys, record).await? {
                            report.discarded += 1;
                        } else if exhausted {
                            report.dead_lettered += 1;
                        } else {
                            report.redelivered += 1;
                        }
                    }
                },
            }

            // Crash window: the task was already rerouted under a new id, so a
            // re-run only finds the old id missing and discards the entry.
            self.remove_waiting_entry(keys, &entry).await?;
        }

        Ok(report)
    }

    /// Remove exactly `entry` from the waiting list, searching from the tail.
    ///
    /// Returns `false` when an overlapping sweeper already removed it, so a
    /// late sweeper can never take a different, live reservation with it.
    pub(crate) async fn remove_waiting_entry(&self, keys: &QueueKeys, entry: &str) -> TaskResult<bool> {
        Ok(self.store.lrem(&keys.waiting, -1, entry).await? > 0)
    }

    /// Return ids stranded in stale staging keys to their pending lists
    pub async fn sweep_staging(&self) -> TaskResult<StagingSweepReport> {
        let now_ms = self.clock.now_ms();
        let staleness_ms = duration_ms(self.config.staging_staleness);
        let mut report = StagingSweepReport::default();

        for key in self.store.scan_keys(&keys::staging_pattern()).await? {
            let Some(staging) = StagingKey::parse(&key) else {
                warn!("Ignoring unrecognised staging key {}", key);
                continue;
            };
            if now_ms.saturating_sub(staging.created_ms) < staleness_ms {
                continue;
            }

            let queue_keys = QueueKeys::new(&staging.queue_id);
            match self.recover_stale_key(&key, &queue_keys, &staging.suffix).await {
                Ok(Some(recovered)) => {
                    if recovered {
                        report.recovered += 1;
                    }
                    report.removed += 1;
                }
                Ok(None) => {}
                Err(e) => error!("Recovery of staging key {} failed: {}", key, e),
            }
        }

        if report.removed > 0 {
            info!(
                "Staging sweep: {} ids recovered from {} stale keys",
                report.recovered, report.removed
            );
        }
        Ok(report)
    }

    /// Recover one stale staging key under its own lock. `None` when another
    /// sweeper holds the lock.
    async fn recover_stale_key(
        &self,
        key: &str,
        queue_keys: &QueueKeys,
        suffix: &str,
    ) -> TaskResult<Option<bool>> {
        let lock = queue_keys.lock_for(suffix);
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .set_nx_px(&lock, &token, self.config.lock_ttl)
            .await?
        {
            return Ok(None);
        }

        let outcome = self.recover_staging(key, queue_keys).await;
        let released = self.release_lock(&lock, &token).await;
        let recovered = outcome?;
        released?;
        Ok(Some(recovered))
    }

    async fn recover_staging(&self, key: &str, queue_keys: &QueueKeys) -> TaskResult<bool> {
        // Atomic move: the id is never in both the staging key and the pending list.
        let recovered = self.store.rpoplpush(key, &queue_keys.pending).await?;
        if let Some(id) = &recovered {
            warn!(
                "Recovered task {} stranded by an interrupted dequeue on queue {}",
                id, queue_keys.queue_id
            );
        }
        self.store.del(key).await?;
        Ok(recovered.is_some())
    }
}

/// Background task running due sweeps on a timer
pub struct MaintenanceRunner {
    queue: Arc<TaskQueue>,
    shutdown_signal: Arc<RwLock<bool>>,
}

impl MaintenanceRunner {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            shutdown_signal: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the sweep loop; it ticks at the shorter of the two sweep intervals
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let config = queue.config();
        let period = config
            .timeout_sweep_interval
            .min(config.staging_sweep_interval);

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                interval.tick().await;

                if *shutdown_signal.read().await {
                    break;
                }

                if let Err(e) = queue.run_due_sweeps().await {
                    error!("Maintenance sweep failed: {}", e);
                }
            }

            debug!("Maintenance runner stopped");
        })
    }

    /// Signal the sweep loop to stop after its current tick
    pub async fn signal_shutdown(&self) {
        let mut shutdown = self.shutdown_signal.write().await;
        *shutdown = true;
    }
}
