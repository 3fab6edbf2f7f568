//! In-process store with Redis list/hash/counter semantics.
//!
//! Intended for tests and local development. Lock expiry is evaluated
//! against the injected [`Clock`], so TTL behaviour can be driven manually.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Command, Store};
use crate::clock::{duration_ms, Clock, SystemClock};
use crate::error::{TaskError, TaskResult};

#[derive(Debug, Clone)]
enum Value {
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Int(i64),
    Expiring { value: String, expires_at_ms: i64 },
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Value>,
}

impl MemoryState {
    fn purge_expired(&mut self, key: &str, now_ms: i64) {
        if let Some(Value::Expiring { expires_at_ms, .. }) = self.entries.get(key) {
            if *expires_at_ms <= now_ms {
                self.entries.remove(key);
            }
        }
    }

    fn list(&self, key: &str, operation: &str) -> TaskResult<Option<&VecDeque<String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(wrong_type(operation, key)),
        }
    }

    fn list_mut(&mut self, key: &str, operation: &str) -> TaskResult<&mut VecDeque<String>> {
        let value = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match value {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(operation, key)),
        }
    }

    fn hash(&self, key: &str, operation: &str) -> TaskResult<Option<&HashMap<String, String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(wrong_type(operation, key)),
        }
    }

    /// Drop empty containers, as Redis does
    fn remove_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn lpush(&mut self, key: &str, value: &str) -> TaskResult<()> {
        self.list_mut(key, "lpush")?.push_front(value.to_string());
        Ok(())
    }

    fn rpop(&mut self, key: &str) -> TaskResult<Option<String>> {
        if self.list(key, "rpop")?.is_none() {
            return Ok(None);
        }
        let value = self.list_mut(key, "rpop")?.pop_back();
        self.remove_if_empty(key);
        Ok(value)
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> TaskResult<()> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type("hset", key)),
        }
    }

    fn del(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> TaskResult<i64> {
        let entry = self.entries.entry(key.to_string()).or_insert(Value::Int(0));
        match entry {
            Value::Int(current) => {
                *current += delta;
                Ok(*current)
            }
            _ => Err(wrong_type("incrby", key)),
        }
    }
}

fn wrong_type(operation: &str, key: &str) -> TaskError {
    TaskError::queue_operation(
        operation,
        format!("WRONGTYPE operation against key {key} holding the wrong kind of value"),
    )
}

/// Resolve a Redis-style index against a list of `len` elements
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Store kept entirely in process memory
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose key expiry follows `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    fn state(&self) -> TaskResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TaskError::queue_operation("memory_store", "state lock poisoned"))
    }

    /// Every list element under `key`, head first
    pub fn list_snapshot(&self, key: &str) -> TaskResult<Vec<String>> {
        let state = self.state()?;
        Ok(state
            .list(key, "list_snapshot")?
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> TaskResult<()> {
        self.state()?.lpush(key, value)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> TaskResult<Option<String>> {
        let mut state = self.state()?;
        // Fail before mutating if the destination has the wrong type
        if let Some(existing) = state.entries.get(destination) {
            if !matches!(existing, Value::List(_)) {
                return Err(wrong_type("rpoplpush", destination));
            }
        }
        match state.rpop(source)? {
            Some(value) => {
                state.lpush(destination, &value)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn lindex(&self, key: &str, index: i64) -> TaskResult<Option<String>> {
        let state = self.state()?;
        Ok(state.list(key, "lindex")?.and_then(|list| {
            resolve_index(index, list.len()).and_then(|i| list.get(i).cloned())
        }))
    }

    async fn rpop(&self, key: &str) -> TaskResult<Option<String>> {
        self.state()?.rpop(key)
    }

    async fn llen(&self, key: &str) -> TaskResult<u64> {
        let state = self.state()?;
        Ok(state.list(key, "llen")?.map_or(0, |list| list.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> TaskResult<Vec<String>> {
        let state = self.state()?;
        let Some(list) = state.list(key, "lrange")? else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn del(&self, key: &str) -> TaskResult<bool> {
        let now_ms = self.clock.now_ms();
        let mut state = self.state()?;
        state.purge_expired(key, now_ms);
        Ok(state.del(key))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> TaskResult<()> {
        self.state()?.hset(key, field, value)
    }

    async fn hget(&self, key: &str, field: &str) -> TaskResult<Option<String>> {
        let state = self.state()?;
        Ok(state
            .hash(key, "hget")?
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> TaskResult<bool> {
        let mut state = self.state()?;
        let removed = match state.entries.get_mut(key) {
            None => false,
            Some(Value::Hash(hash)) => hash.remove(field).is_some(),
            Some(_) => return Err(wrong_type("hdel", key)),
        };
        state.remove_if_empty(key);
        Ok(removed)
    }

    async fn hlen(&self, key: &str) -> TaskResult<u64> {
        let state = self.state()?;
        Ok(state.hash(key, "hlen")?.map_or(0, |hash| hash.len() as u64))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> TaskResult<i64> {
        self.state()?.incr_by(key, delta)
    }

    async fn get_int(&self, key: &str) -> TaskResult<i64> {
        let state = self.state()?;
        match state.entries.get(key) {
            None => Ok(0),
            Some(Value::Int(value)) => Ok(*value),
            Some(_) => Err(wrong_type("get", key)),
        }
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> TaskResult<bool> {
        let now_ms = self.clock.now_ms();
        let mut state = self.state()?;
        state.purge_expired(key, now_ms);
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Value::Expiring {
                value: value.to_string(),
                expires_at_ms: now_ms.saturating_add(duration_ms(ttl).max(1)),
            },
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> TaskResult<bool> {
        let now_ms = self.clock.now_ms();
        let mut state = self.state()?;
        state.purge_expired(key, now_ms);
        let owned = matches!(
            state.entries.get(key),
            Some(Value::Expiring { value: current, .. }) if current == value
        );
        if owned {
            state.del(key);
        }
        Ok(owned)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> TaskResult<u64> {
        let mut state = self.state()?;
        if state.list(key, "lrem")?.is_none() {
            return Ok(0);
        }
        let list = state.list_mut(key, "lrem")?;
        let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
        let mut removed = 0;
        if count < 0 {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        } else {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        }
        state.remove_if_empty(key);
        Ok(removed as u64)
    }

    async fn scan_keys(&self, pattern: &str) -> TaskResult<Vec<String>> {
        let now_ms = self.clock.now_ms();
        let state = self.state()?;
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, value)| {
                let live = match value {
                    Value::Expiring { expires_at_ms, .. } => *expires_at_ms > now_ms,
                    _ => true,
                };
                live && matches_pattern(pattern, key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn batch(&self, commands: Vec<Command>) -> TaskResult<()> {
        let now_ms = self.clock.now_ms();
        let mut state = self.state()?;
        for command in commands {
            match command {
                Command::LPush { key, value } => state.lpush(&key, &value)?,
                Command::HSet { key, field, value } => state.hset(&key, &field, &value)?,
                Command::Del { key } => {
                    state.purge_expired(&key, now_ms);
                    state.del(&key);
                }
                Command::IncrBy { key, delta } => {
                    state.incr_by(&key, delta)?;
                }
            }
        }
        Ok(())
    }
}
