//! Replies received for outstanding calls, waiting to be collected.

use crate::protocol::{RemoteError, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What the peer answered for a call.
pub type ReplyOutcome = Result<Value, RemoteError>;

#[derive(Debug)]
struct PendingEntry {
    outcome: ReplyOutcome,
    received_at: Instant,
}

/// Replies keyed by request id.
///
/// Waiters do not register ahead of time: an entry appears when the reply
/// arrives and is removed by the waiter that collects it. Entries nobody
/// collects expire after `ttl`.
#[derive(Debug)]
pub struct PendingResults {
    entries: HashMap<RequestId, PendingEntry>,
    ttl: Duration,
}

impl PendingResults {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Store the outcome for `id`. A second outcome for the same id replaces
    /// the first.
    pub fn insert(&mut self, id: RequestId, outcome: ReplyOutcome) {
        self.insert_at(id, outcome, Instant::now());
    }

    /// Remove and return the outcome for `id`, if it has arrived.
    pub fn take(&mut self, id: &RequestId) -> Option<ReplyOutcome> {
        self.entries.remove(id).map(|entry| entry.outcome)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_at(&mut self, id: RequestId, outcome: ReplyOutcome, now: Instant) {
        self.purge_expired(now);
        let previous = self.entries.insert(
            id.clone(),
            PendingEntry {
                outcome,
                received_at: now,
            },
        );
        if previous.is_some() {
            tracing::debug!(%id, "replaced uncollected reply");
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.received_at) <= ttl);
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::debug!(purged, "dropped expired replies nobody collected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn take_consumes_entry() {
        let mut pending = PendingResults::new(Duration::from_secs(60));
        pending.insert("a".into(), Ok(json!(1)));

        assert!(pending.contains(&"a".into()));
        assert_eq!(pending.take(&"a".into()), Some(Ok(json!(1))));
        assert_eq!(pending.take(&"a".into()), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn last_write_wins() {
        let mut pending = PendingResults::new(Duration::from_secs(60));
        pending.insert("a".into(), Ok(json!(1)));
        pending.insert("a".into(), Err(RemoteError(json!("late failure"))));

        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending.take(&"a".into()),
            Some(Err(RemoteError(json!("late failure"))))
        );
    }

    #[test]
    fn uncollected_entries_expire_on_insert() {
        let mut pending = PendingResults::new(Duration::from_secs(10));
        let start = Instant::now();
        pending.insert_at("old".into(), Ok(json!(null)), start);
        pending.insert_at("fresh".into(), Ok(json!(2)), start + Duration::from_secs(5));
        pending.insert_at("new".into(), Ok(json!(3)), start + Duration::from_secs(11));

        assert!(!pending.contains(&"old".into()));
        assert!(pending.contains(&"fresh".into()));
        assert!(pending.contains(&"new".into()));
    }
}
