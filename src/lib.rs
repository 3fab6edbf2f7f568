//! # Reliable Task Queue
//!
//! A reserve / acknowledge / negative-acknowledge task queue built on the list,
//! hash and counter primitives of a shared key-value store such as Redis.
//!
//! ## Features
//!
//! - At-least-once delivery with visibility timeouts
//! - Retry budgets with automatic dead-lettering
//! - A fresh task id per delivery attempt, so recovery never needs transactions
//! - Lock-guarded sweeps that heal expired reservations and interrupted dequeues
//! - Redis and in-memory stores
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reliable_task_queue::{TaskQueue, TaskRecord};
//! use serde_json::json;
//!
//! # async fn run() -> reliable_task_queue::TaskResult<()> {
//! let queue = TaskQueue::new_default().await?;
//! queue.put_task("emails", TaskRecord::new(json!({"to": "a@example.com"}))).await?;
//!
//! if let Some(task) = queue.get_task("emails").await? {
//!     // ... do the work ...
//!     queue.ack_task("emails", &task.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod clock;
pub mod error;
pub mod keys;
pub mod maintenance;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use client::TaskClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{TaskError, TaskResult};
pub use keys::QueueKeys;
pub use maintenance::{MaintenanceReport, MaintenanceRunner, StagingSweepReport, TimeoutSweepReport};
pub use queue::{QueueInfo, TaskQueue, TaskQueueConfig};
pub use store::{Command, MemoryStore, RedisStore, Store};
pub use task::{TaskId, TaskMeta, TaskRecord};
pub use worker::{TaskHandler, Worker, WorkerConfig, WorkerStats};

/// Version of the reliable task queue library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
