use serde::{Deserialize, Serialize};

use crate::utils::token_estimator::estimate_tokens;

pub type ConversationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn stored in a conversation.
///
/// Fields are private: once a message is stored its token estimate never
/// changes, the store can only drop whole messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    role: Role,
    content: String,
    timestamp: u64,
    token_estimate: usize,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, timestamp_ms: u64) -> Self {
        let content = content.into();
        let token_estimate = estimate_tokens(&content);
        Self {
            role,
            content,
            timestamp: timestamp_ms,
            token_estimate,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

// ===== UPSTREAM (OpenAI-compatible) MODELS =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn from_history(history: &[Message]) -> Self {
        Self::new(history.iter().map(ChatMessage::from).collect())
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Smallest useful request, used by the health probe
    pub fn probe() -> Self {
        Self::new(vec![ChatMessage::user("ping")])
            .max_tokens(5)
            .temperature(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

// ===== HTTP API MODELS =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatApiRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatApiResponse {
    pub conversation_id: ConversationId,
    pub message: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct TranscriptionResponse {
    pub text: String,
}
