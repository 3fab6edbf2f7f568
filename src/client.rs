//! Client interface for submitting typed tasks

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::TaskResult;
use crate::queue::{QueueInfo, TaskQueue, TaskQueueConfig};
use crate::task::{TaskId, TaskRecord};

/// Producer-side handle on a [`TaskQueue`]
#[derive(Debug, Clone)]
pub struct TaskClient {
    queue: Arc<TaskQueue>,
}

impl TaskClient {
    /// Create a new task client connected to Redis
    pub async fn new(config: TaskQueueConfig) -> TaskResult<Self> {
        let queue = Arc::new(TaskQueue::new(config).await?);
        Ok(Self { queue })
    }

    /// Create a task client from an existing queue
    pub fn from_queue(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    /// Submit a payload with the queue's default retry budget
    pub async fn submit<T: Serialize>(&self, queue_id: &str, payload: &T) -> TaskResult<TaskId> {
        self.queue
            .put_task(queue_id, TaskRecord::from_payload(payload)?)
            .await
    }

    /// Submit a payload with its own retry budget
    pub async fn submit_with_max_retry<T: Serialize>(
        &self,
        queue_id: &str,
        payload: &T,
        max_retry: u32,
    ) -> TaskResult<TaskId> {
        let record = TaskRecord::from_payload(payload)?.with_max_retry(max_retry);
        self.queue.put_task(queue_id, record).await
    }

    pub async fn queue_info(&self, queue_id: &str) -> TaskResult<QueueInfo> {
        self.queue.queue_info(queue_id).await
    }

    pub async fn queues_info(&self) -> TaskResult<BTreeMap<String, QueueInfo>> {
        self.queue.queues_info().await
    }

    /// Inspect the most recent dead letters of a queue
    pub async fn dead_letters(&self, queue_id: &str, limit: usize) -> TaskResult<Vec<TaskRecord>> {
        self.queue.dead_letters(queue_id, limit).await
    }

    /// Get access to the underlying queue for advanced operations
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Resize {
        width: u32,
        height: u32,
    }

    #[tokio::test]
    async fn submitted_payloads_decode_on_delivery() {
        let queue =
            TaskQueue::with_store(TaskQueueConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let client = TaskClient::from_queue(Arc::new(queue));

        let id = client
            .submit_with_max_retry("images", &Resize { width: 64, height: 32 }, 9)
            .await
            .unwrap();
        assert_eq!(client.queue_info("images").await.unwrap().pending, 1);

        let task = client.queue().get_task("images").await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.meta.max_retry, Some(9));
        assert_eq!(
            task.payload_as::<Resize>().unwrap(),
            Resize { width: 64, height: 32 }
        );
    }
}
