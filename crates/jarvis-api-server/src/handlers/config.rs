use axum::{extract::State, Json};
use serde::Serialize;

use crate::config::Settings;
use crate::state::AppState;

const PROVIDER: &str = "groq";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAiConfig {
    provider: &'static str,
    model: String,
    transcription_model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicConversationConfig {
    max_context_tokens: usize,
    max_conversations: usize,
    ttl_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicRateLimitConfig {
    enabled: bool,
    window_ms: u64,
    max_requests: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSecurityConfig {
    authentication: bool,
    max_prompt_chars: usize,
}

/// Settings with every credential left out
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicConfig {
    ai: PublicAiConfig,
    conversation: PublicConversationConfig,
    rate_limiting: PublicRateLimitConfig,
    security: PublicSecurityConfig,
}

impl From<&Settings> for PublicConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            ai: PublicAiConfig {
                provider: PROVIDER,
                model: settings.llm.model.clone(),
                transcription_model: settings.llm.transcription_model.clone(),
                max_tokens: settings.llm.max_tokens,
                temperature: settings.llm.temperature,
            },
            conversation: PublicConversationConfig {
                max_context_tokens: settings.conversation.max_context_tokens,
                max_conversations: settings.conversation.max_conversations,
                ttl_secs: settings.conversation.ttl_secs,
            },
            rate_limiting: PublicRateLimitConfig {
                enabled: settings.rate_limit.enabled,
                window_ms: settings.rate_limit.global.window_ms,
                max_requests: settings.rate_limit.global.max_requests,
            },
            security: PublicSecurityConfig {
                authentication: settings.security.authentication_enabled(),
                max_prompt_chars: settings.security.max_prompt_chars,
            },
        }
    }
}

/// GET /api/config
pub async fn current_config_handler(State(state): State<AppState>) -> Json<PublicConfig> {
    Json(PublicConfig::from(state.settings.as_ref()))
}

/// GET /api/config/defaults
pub async fn default_config_handler() -> Json<PublicConfig> {
    Json(PublicConfig::from(&Settings::default()))
}
