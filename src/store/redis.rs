//! Redis-backed store

use async_trait::async_trait;
use redis::aio::Connection;
use redis::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::{Command, Store};
use crate::error::{TaskError, TaskResult};

const SCAN_BATCH: usize = 500;

/// Compare-and-delete: only the holder of a lock may release it
const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Store speaking to a Redis server
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Open a client and verify the server answers `PING`
    pub async fn connect(redis_url: &str) -> TaskResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| TaskError::queue_operation("connect", e.to_string()))?;

        let mut conn = client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::queue_operation("connect", e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("ping", e.to_string()))?;

        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client })
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::queue_operation("get_connection", e.to_string()))
    }

    async fn query<T: redis::FromRedisValue + Send>(
        &self,
        operation: &str,
        cmd: &mut redis::Cmd,
    ) -> TaskResult<T> {
        let mut conn = self.get_connection().await?;
        let reply = cmd.query_async::<_, T>(&mut conn).await;
        if let Err(e) = &reply {
            debug!("Redis {} failed: {}", operation, e);
        }
        Ok(reply?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> TaskResult<()> {
        self.query::<u64>("lpush", redis::cmd("LPUSH").arg(key).arg(value))
            .await?;
        Ok(())
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> TaskResult<Option<String>> {
        self.query(
            "rpoplpush",
            redis::cmd("RPOPLPUSH").arg(source).arg(destination),
        )
        .await
    }

    async fn lindex(&self, key: &str, index: i64) -> TaskResult<Option<String>> {
        self.query("lindex", redis::cmd("LINDEX").arg(key).arg(index))
            .await
    }

    async fn rpop(&self, key: &str) -> TaskResult<Option<String>> {
        self.query("rpop", redis::cmd("RPOP").arg(key)).await
    }

    async fn llen(&self, key: &str) -> TaskResult<u64> {
        self.query("llen", redis::cmd("LLEN").arg(key)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> TaskResult<Vec<String>> {
        self.query(
            "lrange",
            redis::cmd("LRANGE").arg(key).arg(start).arg(stop),
        )
        .await
    }

    async fn del(&self, key: &str) -> TaskResult<bool> {
        let removed: u64 = self.query("del", redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> TaskResult<()> {
        self.query::<u64>("hset", redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> TaskResult<Option<String>> {
        self.query("hget", redis::cmd("HGET").arg(key).arg(field))
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> TaskResult<bool> {
        let removed: u64 = self
            .query("hdel", redis::cmd("HDEL").arg(key).arg(field))
            .await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> TaskResult<u64> {
        self.query("hlen", redis::cmd("HLEN").arg(key)).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> TaskResult<i64> {
        self.query("incrby", redis::cmd("INCRBY").arg(key).arg(delta))
            .await
    }

    async fn get_int(&self, key: &str) -> TaskResult<i64> {
        let value: Option<i64> = self.query("get", redis::cmd("GET").arg(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> TaskResult<bool> {
        let reply: Option<String> = self
            .query(
                "set_nx",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis().max(1) as u64),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> TaskResult<bool> {
        let removed: u64 = self
            .query(
                "del_if_eq",
                redis::cmd("EVAL")
                    .arg(DEL_IF_EQ_SCRIPT)
                    .arg(1)
                    .arg(key)
                    .arg(value),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> TaskResult<u64> {
        self.query("lrem", redis::cmd("LREM").arg(key).arg(count).arg(value))
            .await
    }

    async fn scan_keys(&self, pattern: &str) -> TaskResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn batch(&self, commands: Vec<Command>) -> TaskResult<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for command in &commands {
            match command {
                Command::LPush { key, value } => pipe.cmd("LPUSH").arg(key).arg(value).ignore(),
                Command::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore()
                }
                Command::Del { key } => pipe.cmd("DEL").arg(key).ignore(),
                Command::IncrBy { key, delta } => pipe.cmd("INCRBY").arg(key).arg(*delta).ignore(),
            };
        }

        let mut conn = self.get_connection().await?;
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!("Sent batch of {} commands", commands.len());
        Ok(())
    }
}
