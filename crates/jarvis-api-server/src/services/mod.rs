pub mod ai_gateway;
pub mod chat_client;
pub mod conversation;
pub mod llm_service;
pub mod rate_limiter;

pub use ai_gateway::{AiGateway, CircuitState, ClientHealth};
pub use chat_client::{ChatClient, TextStream};
pub use conversation::ConversationStore;
pub use llm_service::LlmService;
pub use rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterStats};
