use serde::Serialize;

use crate::models::chat::{ConversationId, Message};

/// Complete conversation state stored in memory
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,

    /// System messages first, then user/assistant turns in arrival order
    pub messages: Vec<Message>,

    pub created_at: u64,

    /// Refreshed on every append (drives TTL expiry and population eviction)
    pub updated_at: u64,

    /// Store-wide activity sequence, breaks ties between equal timestamps
    #[serde(skip)]
    pub(crate) activity_seq: u64,
}

impl Conversation {
    pub(crate) fn new(id: ConversationId, now_ms: u64, activity_seq: u64) -> Self {
        Self {
            id,
            messages: Vec::new(),
            created_at: now_ms,
            updated_at: now_ms,
            activity_seq,
        }
    }

    pub(crate) fn touch(&mut self, now_ms: u64, activity_seq: u64) {
        self.updated_at = now_ms;
        self.activity_seq = activity_seq;
    }

    /// Expired once idle for strictly longer than `ttl_ms`
    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.updated_at) > ttl_ms
    }

    pub fn total_tokens(&self) -> usize {
        self.messages.iter().map(Message::token_estimate).sum()
    }

    pub fn non_system_tokens(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_system())
            .map(Message::token_estimate)
            .sum()
    }
}

/// Store statistics for monitoring
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub total_conversations: usize,
    pub max_conversations: usize,
    pub max_context_tokens: usize,
}
