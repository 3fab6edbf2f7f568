//! Store key naming for a single queue.
//!
//! Every key a queue touches is derived from its id:
//!
//! | key                        | type    | contents                              |
//! |----------------------------|---------|---------------------------------------|
//! | `q::Q`                     | list    | pending task ids                      |
//! | `wq::Q`                    | list    | `"<ms>::<id>"` reservation entries     |
//! | `qh::Q`                    | hash    | task id -> serialized record          |
//! | `dlq::Q`                   | list    | serialized dead-lettered records      |
//! | `wn::Q`                    | counter | outstanding reservations              |
//! | `ql::Q[::uniq]`            | string  | advisory sweep lock                   |
//! | `tempq::Q::<ms>::<uuid>`   | list    | single-entry staging for one dequeue  |

use uuid::Uuid;

use crate::task::TaskId;

pub(crate) const SEPARATOR: &str = "::";

const PENDING_PREFIX: &str = "q";
const WAITING_PREFIX: &str = "wq";
const HASH_PREFIX: &str = "qh";
const DEAD_LETTER_PREFIX: &str = "dlq";
const COUNTER_PREFIX: &str = "wn";
const LOCK_PREFIX: &str = "ql";
const STAGING_PREFIX: &str = "tempq";

/// Key prefixes that hold per-queue state, used to discover queue ids.
pub(crate) const QUEUE_STATE_PREFIXES: [&str; 4] =
    [PENDING_PREFIX, WAITING_PREFIX, HASH_PREFIX, DEAD_LETTER_PREFIX];

/// All store keys belonging to one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue_id: String,
    pub pending: String,
    pub waiting: String,
    pub hash: String,
    pub dead_letter: String,
    pub counter: String,
    pub lock: String,
}

impl QueueKeys {
    pub fn new(queue_id: impl Into<String>) -> Self {
        let queue_id = queue_id.into();
        Self {
            pending: key(PENDING_PREFIX, &queue_id),
            waiting: key(WAITING_PREFIX, &queue_id),
            hash: key(HASH_PREFIX, &queue_id),
            dead_letter: key(DEAD_LETTER_PREFIX, &queue_id),
            counter: key(COUNTER_PREFIX, &queue_id),
            lock: key(LOCK_PREFIX, &queue_id),
            queue_id,
        }
    }

    /// Lock key scoped to one extra discriminator, e.g. a staging key's suffix.
    pub fn lock_for(&self, uniq: &str) -> String {
        format!("{}{SEPARATOR}{uniq}", self.lock)
    }

    /// Fresh staging key for a dequeue attempt started at `now_ms`.
    pub fn staging(&self, now_ms: i64) -> String {
        format!(
            "{STAGING_PREFIX}{SEPARATOR}{}{SEPARATOR}{now_ms}{SEPARATOR}{}",
            self.queue_id,
            Uuid::new_v4()
        )
    }
}

fn key(prefix: &str, queue_id: &str) -> String {
    format!("{prefix}{SEPARATOR}{queue_id}")
}

/// Glob pattern matching every key with the given prefix.
pub(crate) fn prefix_pattern(prefix: &str) -> String {
    format!("{prefix}{SEPARATOR}*")
}

/// Glob pattern matching every staging key of every queue.
pub fn staging_pattern() -> String {
    prefix_pattern(STAGING_PREFIX)
}

/// Extract the queue id from a per-queue state key such as `qh::Q`.
pub(crate) fn queue_id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix(SEPARATOR)
        .filter(|queue_id| !queue_id.is_empty())
}

/// Decoded `tempq::Q::<ms>::<uuid>` staging key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingKey {
    pub queue_id: String,
    pub created_ms: i64,
    pub suffix: String,
}

impl StagingKey {
    /// Parse a staging key. Splits from the right so queue ids may contain `::`.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(STAGING_PREFIX)?.strip_prefix(SEPARATOR)?;
        let mut parts = rest.rsplitn(3, SEPARATOR);
        let suffix = parts.next()?;
        let created_ms = parts.next()?.parse().ok()?;
        let queue_id = parts.next()?;
        if queue_id.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(Self {
            queue_id: queue_id.to_string(),
            created_ms,
            suffix: suffix.to_string(),
        })
    }
}

/// Encode a reservation entry for the waiting list.
pub fn waiting_entry(reserved_ms: i64, id: &TaskId) -> String {
    format!("{reserved_ms}{SEPARATOR}{id}")
}

/// Decode a `"<ms>::<id>"` reservation entry.
pub fn parse_waiting_entry(entry: &str) -> Option<(i64, TaskId)> {
    let (reserved_ms, id) = entry.split_once(SEPARATOR)?;
    Some((reserved_ms.parse().ok()?, id.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_follow_naming_scheme() {
        let keys = QueueKeys::new("emails");
        assert_eq!(keys.pending, "q::emails");
        assert_eq!(keys.waiting, "wq::emails");
        assert_eq!(keys.hash, "qh::emails");
        assert_eq!(keys.dead_letter, "dlq::emails");
        assert_eq!(keys.counter, "wn::emails");
        assert_eq!(keys.lock, "ql::emails");
        assert_eq!(keys.lock_for("abc"), "ql::emails::abc");
    }

    #[test]
    fn staging_keys_are_unique_and_parse_back() {
        let keys = QueueKeys::new("billing::eu");
        let a = keys.staging(1_700_000_000_123);
        let b = keys.staging(1_700_000_000_123);
        assert_ne!(a, b);
        assert!(a.starts_with("tempq::billing::eu::1700000000123::"));

        let parsed = StagingKey::parse(&a).unwrap();
        assert_eq!(parsed.queue_id, "billing::eu");
        assert_eq!(parsed.created_ms, 1_700_000_000_123);
        assert!(a.ends_with(&parsed.suffix));
    }

    #[test]
    fn malformed_staging_keys_are_rejected() {
        assert_eq!(StagingKey::parse("tempq::onlyqueue"), None);
        assert_eq!(StagingKey::parse("tempq::q::notanumber::abc"), None);
        assert_eq!(StagingKey::parse("q::emails"), None);
    }

    #[test]
    fn waiting_entries_round_trip() {
        let id = TaskId::new_v4();
        let entry = waiting_entry(42, &id);
        assert_eq!(entry, format!("42::{id}"));
        assert_eq!(parse_waiting_entry(&entry), Some((42, id)));
        assert_eq!(parse_waiting_entry("garbage"), None);
    }

    #[test]
    fn queue_ids_are_recovered_from_state_keys() {
        assert_eq!(queue_id_from_key("qh", "qh::emails"), Some("emails"));
        assert_eq!(queue_id_from_key("q", "qh::emails"), None);
        assert_eq!(queue_id_from_key("q", "q::"), None);
    }
}
