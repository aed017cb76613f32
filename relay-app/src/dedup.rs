//! Distributed event deduplication.
//!
//! The atomic `SET NX EX` on `event:<id>` is the only cross-process mutual
//! exclusion in the relay: whoever stores the marker owns the event.

use crate::kv::KvStore;
use relay_channels::EventId;
use std::sync::Arc;
use std::time::Duration;

const PROCESSED_MARKER: &str = "processed";

#[derive(Debug, Clone)]
pub struct DedupPolicy {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_attempts: 3,
            retry_interval: Duration::from_millis(100),
        }
    }
}

pub fn event_key(event_id: &EventId) -> String {
    format!("event:{event_id}")
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn KvStore>,
    policy: DedupPolicy,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn KvStore>, policy: DedupPolicy) -> Self {
        Self { store, policy }
    }

    /// `true` only when this call stored the marker. Anything else (already
    /// claimed, retries exhausted, unrecoverable store error) means the caller
    /// must not process the event.
    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %event_id))]
    pub async fn claim(&self, event_id: &EventId) -> bool {
        let key = event_key(event_id);
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self
                .store
                .set_nx_ex(&key, PROCESSED_MARKER, self.policy.ttl)
                .await
            {
                Ok(true) => {
                    tracing::info!(%event_id, attempt, "event claimed");
                    return true;
                }
                Ok(false) => {
                    tracing::debug!(%event_id, attempt, max_attempts, "dedup key already present");
                }
                Err(e) if e.is_connection() => {
                    tracing::error!(%event_id, attempt, max_attempts, error = %e, "kv connection error during dedup");
                }
                Err(e) => {
                    tracing::error!(%event_id, attempt, error = %e, "dedup aborted on kv error");
                    return false;
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_interval).await;
            }
        }

        tracing::warn!(%event_id, "event already processed or dedup unavailable; skipping");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::testing::FlakyStore;
    use crate::kv::{KvError, MemoryStore};
    use tokio::time::Instant;

    fn dedup(store: Arc<dyn KvStore>) -> Deduplicator {
        Deduplicator::new(store, DedupPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn second_claim_is_rejected_until_ttl_elapses() {
        let dedup = dedup(Arc::new(MemoryStore::new()));
        let id = EventId::from("e1");

        assert!(dedup.claim(&id).await);
        assert!(!dedup.claim(&id).await);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(dedup.claim(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_claim_retries_with_backoff() {
        let store = Arc::new(FlakyStore::new());
        let dedup = dedup(store.clone());
        let id = EventId::from("e2");
        assert!(dedup.claim(&id).await);

        let started = Instant::now();
        assert!(!dedup.claim(&id).await);
        assert_eq!(store.set_nx_calls(), 1 + 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_are_retried() {
        let store = Arc::new(FlakyStore::new());
        store.push_failure(KvError::Connection("refused".to_string()));
        store.push_failure(KvError::Connection("refused".to_string()));
        let dedup = dedup(store.clone());

        assert!(dedup.claim(&EventId::from("e3")).await);
        assert_eq!(store.set_nx_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_connection_retries_fail_closed() {
        let store = Arc::new(FlakyStore::new());
        for _ in 0..3 {
            store.push_failure(KvError::Connection("refused".to_string()));
        }
        let dedup = dedup(store.clone());

        assert!(!dedup.claim(&EventId::from("e4")).await);
        assert_eq!(store.set_nx_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn command_error_aborts_without_retry() {
        let store = Arc::new(FlakyStore::new());
        store.push_failure(KvError::Command("WRONGTYPE".to_string()));
        let dedup = dedup(store.clone());

        let started = Instant::now();
        assert!(!dedup.claim(&EventId::from("e5")).await);
        assert_eq!(store.set_nx_calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn key_format() {
        assert_eq!(event_key(&EventId::from("abc")), "event:abc");
    }
}
