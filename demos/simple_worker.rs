//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Submit typed tasks to two queues
//! 2. Register a handler per queue
//! 3. Run a worker that acks, retries or dead-letters each task
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example simple_worker

use reliable_task_queue::{
    TaskClient, TaskError, TaskHandler, TaskQueue, TaskQueueConfig, TaskRecord, TaskResult,
    Worker, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// Adds two numbers
#[derive(Debug, Serialize, Deserialize)]
struct AddTask {
    a: i32,
    b: i32,
}

/// Transforms a message; empty messages cannot be processed
#[derive(Debug, Serialize, Deserialize)]
struct MessageTask {
    message: String,
    uppercase: bool,
}

struct AddTaskHandler;

#[async_trait::async_trait]
impl TaskHandler for AddTaskHandler {
    async fn handle(&self, task: &TaskRecord) -> TaskResult<()> {
        let add: AddTask = task.payload_as()?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Odd first attempts fail to show redelivery under a new id
        if add.a % 2 == 1 && task.meta.retry == 0 {
            return Err(TaskError::task_execution("flaky adder"));
        }

        info!("Adding {} + {} = {} (attempt {})", add.a, add.b, add.a + add.b, task.meta.retry);
        Ok(())
    }
}

struct MessageTaskHandler;

#[async_trait::async_trait]
impl TaskHandler for MessageTaskHandler {
    async fn handle(&self, task: &TaskRecord) -> TaskResult<()> {
        let msg: MessageTask = task.payload_as()?;
        if msg.message.is_empty() {
            return Err(TaskError::Internal(anyhow::anyhow!("empty message")));
        }

        let result = if msg.uppercase {
            msg.message.to_uppercase()
        } else {
            msg.message.to_lowercase()
        };
        info!("Processed message: '{}' -> '{}'", msg.message, result);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting simple worker example");

    let queue_config = TaskQueueConfig {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        visibility_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let queue = Arc::new(TaskQueue::new(queue_config).await?);
    let client = TaskClient::from_queue(queue.clone());

    info!("Submitting test tasks...");
    for i in 0..5 {
        let task_id = client.submit("math", &AddTask { a: i, b: i * 2 }).await?;
        info!("Submitted AddTask {}: {}", i, task_id);
    }
    for (message, uppercase) in [("Hello World", true), ("", false), ("Distributed Tasks", true)] {
        let task = MessageTask {
            message: message.to_string(),
            uppercase,
        };
        let task_id = client.submit_with_max_retry("messages", &task, 1).await?;
        info!("Submitted MessageTask '{}': {}", message, task_id);
    }

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            queues: vec!["math".to_string(), "messages".to_string()],
            max_concurrent_tasks: 2,
            polling_interval_ms: 200,
            ..Default::default()
        },
        queue.clone(),
    ));
    worker.register_handler("math", AddTaskHandler).await;
    worker.register_handler("messages", MessageTaskHandler).await;

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.start().await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    worker.signal_shutdown().await;
    running.await??;

    for (queue_id, info) in client.queues_info().await? {
        info!("{}: {:?}", queue_id, info);
    }
    for dead in client.dead_letters("messages", 10).await? {
        info!("Dead letter {}: {}", dead.id, dead.payload);
    }
    info!("Worker stats: {:?}", worker.get_stats().await);

    Ok(())
}
