//! Task records and retry metadata

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskResult;

/// Identifier of one delivery attempt of a task.
///
/// A fresh id is generated every time a task is redelivered, so an id is
/// never reserved twice.
pub type TaskId = Uuid;

/// Retry bookkeeping carried alongside the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMeta {
    /// Delivery attempts that have already failed
    pub retry: u32,
    /// Per-task retry budget; the queue default applies when unset
    pub max_retry: Option<u32>,
    /// When the logical task was first submitted
    pub created_at: DateTime<Utc>,
}

impl Default for TaskMeta {
    fn default() -> Self {
        Self {
            retry: 0,
            max_retry: None,
            created_at: Utc::now(),
        }
    }
}

/// The unit of work stored in a queue's task hash
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Caller-defined payload, opaque to the queue
    pub payload: serde_json::Value,
    pub meta: TaskMeta,
}

impl TaskRecord {
    /// Create a record around an already-encoded payload
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new_v4(),
            payload,
            meta: TaskMeta::default(),
        }
    }

    /// Create a record from any serializable payload
    pub fn from_payload<T: Serialize>(payload: &T) -> TaskResult<Self> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    /// Override the queue's default retry budget for this task
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.meta.max_retry = Some(max_retry);
        self
    }

    /// Decode the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> TaskResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Retry budget, falling back to `default_max_retry`
    pub fn max_retry(&self, default_max_retry: u32) -> u32 {
        self.meta.max_retry.unwrap_or(default_max_retry)
    }

    /// Whether another failure should dead-letter instead of retry
    pub fn is_exhausted(&self, default_max_retry: u32) -> bool {
        self.meta.retry >= self.max_retry(default_max_retry)
    }

    /// The next delivery attempt: new id, one more retry, same payload
    pub fn redelivery(&self) -> Self {
        Self {
            id: TaskId::new_v4(),
            payload: self.payload.clone(),
            meta: TaskMeta {
                retry: self.meta.retry + 1,
                ..self.meta.clone()
            },
        }
    }

    pub(crate) fn encode(&self) -> TaskResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn decode(data: &str) -> TaskResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Email {
        to: String,
    }

    #[test]
    fn redelivery_changes_identity_and_bumps_retry() {
        let record = TaskRecord::new(json!({"x": 1})).with_max_retry(5);
        let next = record.redelivery();

        assert_ne!(next.id, record.id);
        assert_eq!(next.meta.retry, 1);
        assert_eq!(next.meta.max_retry, Some(5));
        assert_eq!(next.meta.created_at, record.meta.created_at);
        assert_eq!(next.payload, record.payload);
    }

    #[test]
    fn exhaustion_uses_override_before_default() {
        let mut record = TaskRecord::new(json!(null));
        record.meta.retry = 2;
        assert!(!record.is_exhausted(3));
        assert!(record.is_exhausted(2));

        let record = record.with_max_retry(4);
        assert!(!record.is_exhausted(1));
    }

    #[test]
    fn typed_payloads_decode() {
        let record = TaskRecord::from_payload(&Email {
            to: "a@example.com".to_string(),
        })
        .unwrap();
        let decoded = TaskRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(
            decoded.payload_as::<Email>().unwrap(),
            Email {
                to: "a@example.com".to_string()
            }
        );
        assert!(decoded.payload_as::<u64>().is_err());
    }
}
