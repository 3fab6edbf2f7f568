//! Key-value store abstraction.
//!
//! The queue needs only single-key atomic primitives, one atomic list move and
//! a pipelined batch. Batches are NOT transactions: commands are sent together
//! but any prefix of them may have been applied when an error is returned.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::TaskResult;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A write sent as part of a pipelined batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LPush { key: String, value: String },
    HSet { key: String, field: String, value: String },
    Del { key: String },
    IncrBy { key: String, delta: i64 },
}

impl Command {
    pub fn lpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::LPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn incr_by(key: impl Into<String>, delta: i64) -> Self {
        Self::IncrBy {
            key: key.into(),
            delta,
        }
    }
}

/// Shared store backing every queue.
///
/// List operations follow Redis semantics: `lpush` inserts at the head,
/// `rpop` removes from the tail, negative indices count from the tail.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    async fn lpush(&self, key: &str, value: &str) -> TaskResult<()>;

    /// Atomically pop the tail of `source` and push it onto the head of `destination`
    async fn rpoplpush(&self, source: &str, destination: &str) -> TaskResult<Option<String>>;

    async fn lindex(&self, key: &str, index: i64) -> TaskResult<Option<String>>;

    async fn rpop(&self, key: &str) -> TaskResult<Option<String>>;

    async fn llen(&self, key: &str) -> TaskResult<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> TaskResult<Vec<String>>;

    /// Returns whether the key existed
    async fn del(&self, key: &str) -> TaskResult<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> TaskResult<()>;

    async fn hget(&self, key: &str, field: &str) -> TaskResult<Option<String>>;

    /// Returns whether the field was present
    async fn hdel(&self, key: &str, field: &str) -> TaskResult<bool>;

    async fn hlen(&self, key: &str) -> TaskResult<u64>;

    async fn incr_by(&self, key: &str, delta: i64) -> TaskResult<i64>;

    /// Integer value of a counter, zero when absent
    async fn get_int(&self, key: &str) -> TaskResult<i64>;

    /// Set `key` only if absent, expiring after `ttl`. Returns whether it was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> TaskResult<bool>;

    /// Delete `key` only while it still holds `value`. Returns whether it was deleted.
    async fn del_if_eq(&self, key: &str, value: &str) -> TaskResult<bool>;

    /// Remove up to `|count|` occurrences of `value`; a negative count scans from the tail
    async fn lrem(&self, key: &str, count: i64, value: &str) -> TaskResult<u64>;

    /// Keys matching a glob of the form `prefix*`
    async fn scan_keys(&self, pattern: &str) -> TaskResult<Vec<String>>;

    /// Send commands as one pipelined group without transactional guarantees
    async fn batch(&self, commands: Vec<Command>) -> TaskResult<()>;
}
