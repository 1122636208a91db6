//! Short-term conversation cache.
//!
//! Per-session redis list with a TTL; the durable conversation store is
//! the source of truth and the cache is only an optimization. A cache
//! that cannot be read yields empty history, never an error.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, HistoryMessage};
use crate::store::ConversationStore;

/// Durable messages pulled when the cache is empty.
const DURABLE_FALLBACK_MESSAGES: usize = 10;

/// Redis-backed recency cache for chat sessions.
#[derive(Clone)]
pub struct SessionCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl SessionCache {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::TransientExternal(format!("redis: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::TransientExternal(format!("redis: {e}")))?;
        Ok(Self { conn, ttl_secs })
    }

    /// New session key for a user.
    pub fn new_session_key(user_id: i64) -> String {
        format!("chat:{}:{}", user_id, Uuid::new_v4())
    }

    /// Append a message and refresh the TTL.
    pub async fn push(&self, session_key: &str, message: &HistoryMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(message)?;
        let _: () = conn
            .rpush(session_key, encoded)
            .await
            .map_err(|e| Error::TransientExternal(format!("redis: {e}")))?;
        let _: () = conn
            .expire(session_key, self.ttl_secs as i64)
            .await
            .map_err(|e| Error::TransientExternal(format!("redis: {e}")))?;
        Ok(())
    }

    /// Last `last_n` messages. Fails open: an unreachable cache means
    /// empty history.
    pub async fn history(&self, session_key: &str, last_n: usize) -> Vec<HistoryMessage> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = match conn.lrange(session_key, -(last_n as isize), -1).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "session cache unreachable, continuing with empty history");
                return Vec::new();
            }
        };
        raw.iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub async fn clear(&self, session_key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(session_key)
            .await
            .map_err(|e| Error::TransientExternal(format!("redis: {e}")))?;
        Ok(())
    }

    pub async fn exists(&self, session_key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(session_key)
            .await
            .map_err(|e| Error::TransientExternal(format!("redis: {e}")))
    }
}

/// History for the generator: the cache is preferred; when it comes
/// back empty, fall back to the most recent durable messages in
/// chronological order.
pub async fn load_history(
    cache: Option<&SessionCache>,
    conversations: &dyn ConversationStore,
    session_key: &str,
    conversation_id: Option<i64>,
    last_n: usize,
) -> Vec<HistoryMessage> {
    if let Some(cache) = cache {
        let cached = cache.history(session_key, last_n).await;
        if !cached.is_empty() {
            return cached;
        }
    }

    let Some(conversation_id) = conversation_id else {
        return Vec::new();
    };
    match conversations
        .recent_messages(conversation_id, DURABLE_FALLBACK_MESSAGES)
        .await
    {
        Ok(messages) => messages.iter().map(history_from_message).collect(),
        Err(err) => {
            warn!(error = %err, "durable history fallback failed");
            Vec::new()
        }
    }
}

fn history_from_message(message: &ChatMessage) -> HistoryMessage {
    HistoryMessage {
        role: message.role,
        content: message.content.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::store::MemoryConversationStore;

    #[test]
    fn session_keys_are_user_scoped_and_unique() {
        let a = SessionCache::new_session_key(7);
        let b = SessionCache::new_session_key(7);
        assert!(a.starts_with("chat:7:"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn durable_fallback_is_chronological() {
        let store = MemoryConversationStore::new();
        let conversation = store.create_conversation(1, "t", None).await.unwrap();
        for i in 0..12 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append_message(conversation.id, role, &format!("m{i}"), None, None)
                .await
                .unwrap();
        }

        let history = load_history(None, &store, "sess", Some(conversation.id), 5).await;
        // Most recent ten, oldest first.
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().unwrap().content, "m2");
        assert_eq!(history.last().unwrap().content, "m11");
    }

    #[tokio::test]
    async fn missing_conversation_yields_empty_history() {
        let store = MemoryConversationStore::new();
        let history = load_history(None, &store, "sess", None, 5).await;
        assert!(history.is_empty());
    }
}
