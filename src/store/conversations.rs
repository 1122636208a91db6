//! Durable conversation store contract.
//!
//! Conversations own their messages; deleting a conversation cascades.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, Conversation, Role};

/// Operations on durable chat history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        user_id: i64,
        title: &str,
        group_id: Option<i64>,
    ) -> Result<Conversation>;

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>>;

    /// Append a message; bumps the conversation's `updated_at`.
    async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        sources_json: Option<String>,
        intent: Option<String>,
    ) -> Result<ChatMessage>;

    /// The most recent `limit` messages in chronological order.
    async fn recent_messages(&self, conversation_id: i64, limit: usize)
        -> Result<Vec<ChatMessage>>;

    /// Delete a conversation and, cascading, its messages.
    async fn delete_conversation(&self, id: i64) -> Result<()>;
}

/// In-memory conversation store.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_conversation_id: i64,
    next_message_id: i64,
    conversations: HashMap<i64, Conversation>,
    messages: Vec<ChatMessage>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(
        &self,
        user_id: i64,
        title: &str,
        group_id: Option<i64>,
    ) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_conversation_id += 1;
        let now = Utc::now();
        let conversation = Conversation {
            id: inner.next_conversation_id,
            user_id,
            title: title.to_string(),
            group_id,
            created_at: now,
            updated_at: now,
        };
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        Ok(self.inner.lock().unwrap().conversations.get(&id).cloned())
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        sources_json: Option<String>,
        intent: Option<String>,
    ) -> Result<ChatMessage> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(Error::DataConsistency(format!(
                "conversation {conversation_id} not found"
            )));
        }
        inner.next_message_id += 1;
        let message = ChatMessage {
            id: inner.next_message_id,
            conversation_id,
            role,
            content: content.to_string(),
            sources_json,
            intent,
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        if let Some(conversation) = inner.conversations.get_mut(&conversation_id) {
            conversation.updated_at = message.created_at;
        }
        Ok(message)
    }

    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<ChatMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Message ids are monotonic, so they give a stable chronology.
        messages.sort_by_key(|m| m.id);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn delete_conversation(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.conversations.remove(&id);
        inner.messages.retain(|m| m.conversation_id != id);
        Ok(())
    }
}
