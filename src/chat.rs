//! Conversational surface over the agent: session cache, durable
//! conversation persistence, and history merging.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{Agent, AgentOutcome, QueryContext};
use crate::error::{Error, Result};
use crate::generate::{GroupProfile, ProviderChoice};
use crate::models::{HistoryMessage, Role};
use crate::session::{load_history, SessionCache};
use crate::store::ConversationStore;

/// Cached turns offered to the agent.
const HISTORY_TURNS: usize = 5;
/// Conversation titles derive from the first message.
const TITLE_CHARS: usize = 50;

/// An incoming chat turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<i64>,
    pub group_id: Option<i64>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// The completed turn.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub outcome: AgentOutcome,
    pub session_id: String,
    pub conversation_id: i64,
}

/// Chat orchestration: resolves history, runs the agent, and persists
/// both sides of the turn.
pub struct ChatService {
    agent: Arc<Agent>,
    cache: Option<SessionCache>,
    conversations: Arc<dyn ConversationStore>,
}

impl ChatService {
    pub fn new(
        agent: Arc<Agent>,
        cache: Option<SessionCache>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            agent,
            cache,
            conversations,
        }
    }

    pub async fn chat(
        &self,
        request: &ChatRequest,
        user_id: i64,
        user_email: Option<String>,
        group_ids: Vec<i64>,
        profile: GroupProfile,
    ) -> Result<ChatTurn> {
        if let Some(group) = request.group_id {
            if !group_ids.contains(&group) {
                return Err(Error::AccessDenied(format!(
                    "user {user_id} is not a member of group {group}"
                )));
            }
        }

        let conversation_id = match request.conversation_id {
            Some(id) => {
                let conversation = self
                    .conversations
                    .get_conversation(id)
                    .await?
                    .ok_or_else(|| Error::InputInvalid(format!("conversation {id} not found")))?;
                if conversation.user_id != user_id {
                    return Err(Error::AccessDenied(
                        "conversation belongs to another user".into(),
                    ));
                }
                id
            }
            None => {
                let title: String = if request.message.chars().count() > TITLE_CHARS {
                    format!(
                        "{}...",
                        request.message.chars().take(TITLE_CHARS).collect::<String>()
                    )
                } else {
                    request.message.clone()
                };
                self.conversations
                    .create_conversation(user_id, &title, request.group_id)
                    .await?
                    .id
            }
        };

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| SessionCache::new_session_key(user_id));

        let history = load_history(
            self.cache.as_ref(),
            self.conversations.as_ref(),
            &session_id,
            request.conversation_id,
            HISTORY_TURNS,
        )
        .await;

        let provider_override = request
            .provider
            .as_deref()
            .and_then(crate::generate::Provider::parse)
            .map(|provider| ProviderChoice {
                provider,
                model: request.model.clone(),
            });

        let ctx = QueryContext {
            session_id: session_id.clone(),
            user_id: Some(user_id),
            user_email,
            group_id: request.group_id,
            group_ids,
            profile,
            history,
            provider_override,
            strict_filters: false,
        };

        let outcome = self.agent.run(&request.message, &ctx).await;

        // Cache writes are best-effort; the durable store is the source
        // of truth.
        if let Some(cache) = &self.cache {
            let user_turn = HistoryMessage::user(&request.message);
            let assistant_turn = HistoryMessage::assistant(&outcome.answer);
            if let Err(err) = cache.push(&session_id, &user_turn).await {
                warn!(error = %err, "session cache write failed");
            } else if let Err(err) = cache.push(&session_id, &assistant_turn).await {
                warn!(error = %err, "session cache write failed");
            }
        }

        self.conversations
            .append_message(conversation_id, Role::User, &request.message, None, None)
            .await?;
        let sources_json = if outcome.sources.is_empty() {
            None
        } else {
            serde_json::to_string(&outcome.sources).ok()
        };
        self.conversations
            .append_message(
                conversation_id,
                Role::Assistant,
                &outcome.answer,
                sources_json,
                Some(outcome.intent.clone()),
            )
            .await?;

        Ok(ChatTurn {
            outcome,
            session_id,
            conversation_id,
        })
    }
}
