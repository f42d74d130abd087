pub mod settings;

pub use settings::{
    ConfigSource, ConversationConfig, GatewayConfig, LlmConfig, RateLimitConfig,
    RateLimitSettings, SecurityConfig, ServerConfig, Settings,
};
