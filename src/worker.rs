//! Worker that reserves tasks and resolves them through handlers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::maintenance::MaintenanceRunner;
use crate::queue::TaskQueue;
use crate::task::{TaskId, TaskRecord};

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier
    pub worker_id: WorkerId,
    /// Queues this worker will process
    pub queues: Vec<String>,
    /// Maximum number of concurrent tasks
    pub max_concurrent_tasks: usize,
    /// Polling interval for new tasks in milliseconds
    pub polling_interval_ms: u64,
    /// Handler timeout in seconds; a timed out task is nacked
    pub task_timeout: u64,
    /// Run the maintenance sweeps alongside the worker loop
    pub run_maintenance: bool,
    /// Worker shutdown grace period in seconds
    pub shutdown_grace_period: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            queues: vec!["default".to_string()],
            max_concurrent_tasks: 4,
            polling_interval_ms: 1000,
            task_timeout: 300, // 5 minutes
            run_maintenance: true,
            shutdown_grace_period: 30,
        }
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_acked: u64,
    pub tasks_nacked: u64,
    pub tasks_rejected: u64,
    pub average_execution_time_ms: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// How a handler failure is resolved.
///
/// Recoverable errors nack the task (retry until the budget is spent),
/// anything else rejects it straight to the dead-letter list.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> TaskResult<()>;
}

/// Registry of handlers keyed by queue id
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    /// Register the handler for a queue, replacing any previous one
    pub async fn register<H>(&self, queue_id: String, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(queue_id, Arc::new(handler));
    }

    async fn find_handler(&self, queue_id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(queue_id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Ack,
    Nack,
    Reject,
}

/// Worker for processing tasks from the queue
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    handlers: Arc<TaskHandlerRegistry>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown_signal: Arc<RwLock<bool>>,
    active_tasks: Arc<RwLock<HashMap<TaskId, tokio::task::JoinHandle<()>>>>,
}

impl Worker {
    /// Create a new worker with the given configuration
    pub fn new(config: WorkerConfig, queue: Arc<TaskQueue>) -> Self {
        let stats = WorkerStats {
            started_at: chrono::Utc::now(),
            ..Default::default()
        };

        Self {
            config,
            queue,
            handlers: Arc::new(TaskHandlerRegistry::default()),
            stats: Arc::new(Mutex::new(stats)),
            shutdown_signal: Arc::new(RwLock::new(false)),
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register the handler for one queue
    pub async fn register_handler<H>(&self, queue_id: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.handlers.register(queue_id.into(), handler).await;
    }

    /// Run until [`Worker::signal_shutdown`] is called
    pub async fn start(&self) -> TaskResult<()> {
        if self.config.max_concurrent_tasks == 0 || self.config.polling_interval_ms == 0 {
            return Err(TaskError::config(
                "max_concurrent_tasks and polling_interval_ms must be greater than zero",
            ));
        }

        info!("Starting worker {} for queues: {:?}", self.config.worker_id, self.config.queues);

        let maintenance = self
            .config
            .run_maintenance
            .then(|| MaintenanceRunner::new(self.queue.clone()));
        let maintenance_task = maintenance.as_ref().map(MaintenanceRunner::spawn);

        let worker_task = self.start_worker_loop();
        let loop_result = worker_task.await.map_err(|e| {
            error!("Worker loop aborted: {}", e);
            TaskError::worker(format!("worker loop aborted: {e}"))
        });

        if let (Some(runner), Some(task)) = (maintenance, maintenance_task) {
            runner.signal_shutdown().await;
            task.abort();
        }

        self.shutdown().await?;
        loop_result
    }

    fn start_worker_loop(&self) -> tokio::task::JoinHandle<()> {
        let config = self.config.clone();
        let queue = self.queue.clone();
        let handlers = self.handlers.clone();
        let stats = self.stats.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let active_tasks = self.active_tasks.clone();

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_millis(config.polling_interval_ms));

            loop {
                interval.tick().await;

                if *shutdown_signal.read().await {
                    break;
                }

                Self::cleanup_completed_tasks(&active_tasks).await;

                for queue_id in &config.queues {
                    if active_tasks.read().await.len() >= config.max_concurrent_tasks {
                        break;
                    }

                    let Some(handler) = handlers.find_handler(queue_id).await else {
                        continue;
                    };

                    let task = match queue.get_task(queue_id).await {
                        Ok(Some(task)) => task,
                        Ok(None) => continue,
                        Err(e) => {
                            error!("Failed to reserve task from queue {}: {}", queue_id, e);
                            continue;
                        }
                    };
                    debug!("Got task {} from queue {}", task.id, queue_id);

                    let task_id = task.id;
                    let handle = Self::spawn_task_execution(
                        queue_id.clone(),
                        task,
                        handler,
                        queue.clone(),
                        stats.clone(),
                        config.task_timeout,
                    );
                    active_tasks.write().await.insert(task_id, handle);
                }
            }

            info!("Worker loop shutting down");
        })
    }

    fn spawn_task_execution(
        queue_id: String,
        task: TaskRecord,
        handler: Arc<dyn TaskHandler>,
        queue: Arc<TaskQueue>,
        stats: Arc<Mutex<WorkerStats>>,
        task_timeout: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let start_time = std::time::Instant::now();

            let outcome = tokio::time::timeout(Duration::from_secs(task_timeout), handler.handle(&task))
                .await
                .unwrap_or_else(|_| Err(TaskError::timeout("handle")));

            let execution_duration = start_time.elapsed();

            let resolution = match &outcome {
                Ok(()) => Resolution::Ack,
                Err(e) if e.is_recoverable() => {
                    warn!("Task {} on queue {} failed: {}", task.id, queue_id, e);
                    Resolution::Nack
                }
                Err(e) => {
                    error!("Task {} on queue {} failed permanently: {}", task.id, queue_id, e);
                    Resolution::Reject
                }
            };

            let resolved = match resolution {
                Resolution::Ack => queue.ack_task(&queue_id, &task.id).await,
                Resolution::Nack => queue.nack_task(&queue_id, &task.id).await,
                Resolution::Reject => queue.reject_task(&queue_id, &task.id).await,
            };

            match resolved {
                Ok(true) => debug!("Resolved task {} as {:?} in {:?}", task.id, resolution, execution_duration),
                // The reservation expired and the task was already rerouted
                Ok(false) => warn!("Task {} on queue {} was no longer outstanding", task.id, queue_id),
                Err(e) => error!("Failed to resolve task {}: {}", task.id, e),
            }

            let mut stats = stats.lock().await;
            stats.tasks_processed += 1;
            let processed = stats.tasks_processed as f64;
            stats.average_execution_time_ms = (stats.average_execution_time_ms * (processed - 1.0)
                + execution_duration.as_millis() as f64)
                / processed;
            match resolution {
                Resolution::Ack => stats.tasks_acked += 1,
                Resolution::Nack => stats.tasks_nacked += 1,
                Resolution::Reject => stats.tasks_rejected += 1,
            }
        })
    }

    async fn cleanup_completed_tasks(
        active_tasks: &Arc<RwLock<HashMap<TaskId, tokio::task::JoinHandle<()>>>>,
    ) {
        active_tasks
            .write()
            .await
            .retain(|_, handle| !handle.is_finished());
    }

    /// Get worker statistics
    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Signal worker to shutdown
    pub async fn signal_shutdown(&self) {
        let mut shutdown = self.shutdown_signal.write().await;
        *shutdown = true;
    }

    /// Wait for in-flight handlers, then abort the rest. Aborted tasks stay
    /// reserved and come back through the timeout sweep.
    async fn shutdown(&self) -> TaskResult<()> {
        info!("Shutting down worker {}", self.config.worker_id);

        self.signal_shutdown().await;

        let start = std::time::Instant::now();
        let grace_period = Duration::from_secs(self.config.shutdown_grace_period);

        while start.elapsed() < grace_period {
            Self::cleanup_completed_tasks(&self.active_tasks).await;
            let active_count = self.active_tasks.read().await.len();
            if active_count == 0 {
                break;
            }

            debug!("Waiting for {} active tasks to complete", active_count);
            sleep(Duration::from_millis(50)).await;
        }

        let active_tasks = self.active_tasks.read().await;
        for (task_id, handle) in active_tasks.iter() {
            warn!("Force stopping task {}", task_id);
            handle.abort();
        }

        info!("Worker {} shut down complete", self.config.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueInfo, TaskQueueConfig};
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Outcome;

    #[async_trait::async_trait]
    impl TaskHandler for Outcome {
        async fn handle(&self, task: &TaskRecord) -> TaskResult<()> {
            match task.payload.as_str() {
                Some("ok") => Ok(()),
                Some("retry") => Err(TaskError::task_execution("try again")),
                _ => Err(TaskError::config("unprocessable")),
            }
        }
    }

    async fn wait_for(queue: &TaskQueue, queue_id: &str, expected: QueueInfo) {
        let poll = async {
            loop {
                if queue.queue_info(queue_id).await.unwrap() == expected {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("queue never reached the expected state");
    }

    #[tokio::test]
    async fn worker_resolves_tasks_by_handler_outcome() {
        let queue = Arc::new(
            TaskQueue::with_store(
                TaskQueueConfig {
                    max_retry: 1,
                    ..Default::default()
                },
                Arc::new(MemoryStore::new()),
            )
            .unwrap(),
        );
        for payload in ["ok", "retry", "broken"] {
            queue.put_task("jobs", TaskRecord::new(json!(payload))).await.unwrap();
        }

        let worker = Arc::new(Worker::new(
            WorkerConfig {
                queues: vec!["jobs".to_string()],
                polling_interval_ms: 5,
                run_maintenance: false,
                shutdown_grace_period: 1,
                ..Default::default()
            },
            queue.clone(),
        ));
        worker.register_handler("jobs", Outcome).await;

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.start().await })
        };

        // "retry" fails twice: once nacked, then dead-lettered at max_retry = 1
        wait_for(
            &queue,
            "jobs",
            QueueInfo {
                pending: 0,
                outstanding: 0,
                dead_lettered: 2,
                waiting: 0,
            },
        )
        .await;

        worker.signal_shutdown().await;
        tokio_test::assert_ok!(running.await.unwrap());

        let stats = worker.get_stats().await;
        assert_eq!(stats.tasks_processed, 4);
        assert_eq!(stats.tasks_acked, 1);
        assert_eq!(stats.tasks_nacked, 2);
        assert_eq!(stats.tasks_rejected, 1);
    }

    #[tokio::test]
    async fn worker_rejects_zero_concurrency() {
        let queue = Arc::new(
            TaskQueue::with_store(TaskQueueConfig::default(), Arc::new(MemoryStore::new())).unwrap(),
        );
        let worker = Worker::new(
            WorkerConfig {
                max_concurrent_tasks: 0,
                ..Default::default()
            },
            queue,
        );
        assert!(matches!(worker.start().await, Err(TaskError::Config { .. })));
    }
}
