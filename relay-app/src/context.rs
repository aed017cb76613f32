//! Per-user conversation context kept in the KV store.

use crate::kv::{KvError, KvResult, KvStore};
use relay_channels::OpenId;
use relay_llm::ChatMessage;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ENTRIES: usize = 10;
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(86_400);

pub fn context_key(user_id: &OpenId) -> String {
    format!("context:{user_id}")
}

#[derive(Clone)]
pub struct ContextManager {
    store: Arc<dyn KvStore>,
    max_entries: usize,
    ttl: Duration,
}

impl ContextManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_CONTEXT_TTL,
        }
    }

    /// Stored history for `user_id`. Missing, malformed or unreadable data all
    /// load as an empty history.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
    pub async fn load(&self, user_id: &OpenId) -> Vec<ChatMessage> {
        let raw = match self.store.get(&context_key(user_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!(%user_id, error = %e, "failed to load context");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<ChatMessage>>(&raw) {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(%user_id, error = %e, "stored context is malformed; starting fresh");
                Vec::new()
            }
        }
    }

    /// Records the user's turn on top of `prior` and persists the newest
    /// `max_entries` entries.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
    pub async fn append_and_save(
        &self,
        user_id: &OpenId,
        prior: &[ChatMessage],
        user_msg: &str,
    ) -> KvResult<()> {
        let mut history = prior.to_vec();
        history.push(ChatMessage::user(user_msg));
        if history.len() > self.max_entries {
            history.drain(..history.len() - self.max_entries);
        }

        let encoded = serde_json::to_string(&history)
            .map_err(|e| KvError::Command(format!("encode context: {e}")))?;
        self.store
            .set_ex(&context_key(user_id), &encoded, self.ttl)
            .await?;
        tracing::debug!(%user_id, entries = history.len(), "context saved");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
    pub async fn clear(&self, user_id: &OpenId) -> KvResult<()> {
        self.store.delete(&context_key(user_id)).await
    }
}
