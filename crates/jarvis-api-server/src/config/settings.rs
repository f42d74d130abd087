use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are JARVIS, an intelligent and helpful AI assistant. \
Provide clear, concise, and accurate responses. Be professional yet friendly.";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub conversation: ConversationConfig,
    pub gateway: GatewayConfig,
    pub rate_limit: RateLimitSettings,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub transcribe_body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            body_limit_bytes: 10 * 1024 * 1024,
            transcribe_body_limit_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub transcription_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_language: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            model: "llama-3.3-70b-versatile".to_string(),
            transcription_model: "whisper-large-v3".to_string(),
            transcription_language: Some("en".to_string()),
            max_tokens: 1024,
            temperature: 0.7,
            timeout_seconds: 30,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("GROQ_API_KEY is not set (llm.api_key)"))
    }
}

/// Floor for `conversation.min_retained_messages`: the latest exchange
/// always survives trimming.
pub const MIN_RETAINED_MESSAGES: usize = 2;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_context_tokens: usize,
    pub max_conversations: usize,
    /// Non-system messages that survive trimming regardless of budget
    pub min_retained_messages: usize,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            max_conversations: 100,
            min_retained_messages: MIN_RETAINED_MESSAGES,
            ttl_secs: 60 * 60,
            cleanup_interval_secs: 5 * 60,
        }
    }
}

impl ConversationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Attempts per call, including the first one
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_delay_ms: u64,
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    pub cooldown_ms: u64,
    pub health_check_interval_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            max_failures: 3,
            cooldown_ms: 60_000,
            health_check_interval_secs: 5 * 60,
            attempt_timeout_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    pub block_duration_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 60,
            block_duration_ms: 300_000,
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub global: RateLimitConfig,
    pub chat: RateLimitConfig,
    pub transcribe: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            global: RateLimitConfig::default(),
            chat: RateLimitConfig::default().with_max_requests(30),
            transcribe: RateLimitConfig::default().with_max_requests(20),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_prompt_chars: usize,
    /// Bearer key required on `/api` routes; authentication is off when unset
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 10_000,
            api_key: None,
        }
    }
}

impl SecurityConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|key| !key.is_empty())
    }

    pub fn authentication_enabled(&self) -> bool {
        self.api_key().is_some()
    }
}

/// One layer of configuration. Later layers override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Optional TOML file; missing files are skipped
    File(PathBuf),
    /// `{prefix}_SECTION__KEY` variables
    Environment { prefix: String },
}

impl Settings {
    /// Load from the default source chain, after reading `.env`.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut settings = Self::load_from(&Self::default_sources())?;
        if settings.llm.api_key.is_none() {
            settings.llm.api_key = std::env::var("GROQ_API_KEY").ok();
        }
        if settings.security.api_key.is_none() {
            settings.security.api_key = std::env::var("API_KEY").ok();
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Lowest to highest priority: built-in defaults, `config/default.toml`,
    /// `config/{APP_ENV}.toml`, `.jarvisrc.toml`, `APP_*` environment.
    pub fn default_sources() -> Vec<ConfigSource> {
        let env_name = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        vec![
            ConfigSource::File(PathBuf::from("config/default.toml")),
            ConfigSource::File(PathBuf::from(format!("config/{}.toml", env_name))),
            ConfigSource::File(PathBuf::from(".jarvisrc.toml")),
            ConfigSource::Environment {
                prefix: "APP".to_string(),
            },
        ]
    }

    /// Merge `sources` in order on top of the defaults.
    pub fn load_from(sources: &[ConfigSource]) -> Result<Self> {
        let mut builder = Config::builder();

        for source in sources {
            builder = match source {
                ConfigSource::File(path) => builder.add_source(
                    File::from(path.as_path())
                        .format(FileFormat::Toml)
                        .required(false),
                ),
                ConfigSource::Environment { prefix } => builder.add_source(
                    Environment::with_prefix(prefix)
                        .prefix_separator("_")
                        .separator("__")
                        .try_parsing(true),
                ),
            };
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.llm.model.trim().is_empty() {
            errors.push("AI model is required".to_string());
        }
        if !(1..=100_000).contains(&self.llm.max_tokens) {
            errors.push("Max tokens must be between 1 and 100000".to_string());
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            errors.push("Temperature must be between 0 and 2".to_string());
        }
        if self.server.port == 0 {
            errors.push("Server port must be between 1 and 65535".to_string());
        }
        if self.gateway.max_retries == 0 {
            errors.push("Gateway max_retries must be at least 1".to_string());
        }
        if self.gateway.max_failures == 0 {
            errors.push("Gateway max_failures must be at least 1".to_string());
        }
        if self.conversation.max_conversations == 0 {
            errors.push("max_conversations must be at least 1".to_string());
        }
        if self.conversation.min_retained_messages < MIN_RETAINED_MESSAGES {
            errors.push(format!(
                "min_retained_messages must be at least {}",
                MIN_RETAINED_MESSAGES
            ));
        }

        if self.rate_limit.enabled {
            for (name, limit) in [
                ("global", &self.rate_limit.global),
                ("chat", &self.rate_limit.chat),
                ("transcribe", &self.rate_limit.transcribe),
            ] {
                if limit.max_requests < 1 {
                    errors.push(format!("Rate limit '{}': max requests must be at least 1", name));
                }
                if limit.window_ms < 1000 {
                    errors.push(format!("Rate limit '{}': window must be at least 1000ms", name));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration: {}", errors.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.conversation.max_context_tokens, 8000);
        assert_eq!(settings.conversation.max_conversations, 100);
        assert_eq!(settings.conversation.ttl(), Duration::from_secs(3600));
        assert_eq!(settings.gateway.max_retries, 3);
        assert_eq!(settings.gateway.cooldown_ms, 60_000);
        assert_eq!(settings.rate_limit.global, RateLimitConfig::default());
        assert_eq!(settings.rate_limit.chat.max_requests, 30);
        assert_eq!(settings.rate_limit.transcribe.max_requests, 20);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_later_sources_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_toml(
            &dir,
            "default.toml",
            "[llm]\nmodel = \"base-model\"\nmax_tokens = 512\n\n[server]\nport = 9000\n",
        );
        let local = write_toml(&dir, "local.toml", "[llm]\nmodel = \"local-model\"\n");

        let settings = Settings::load_from(&[
            ConfigSource::File(base),
            ConfigSource::File(local),
            ConfigSource::File(dir.path().join("missing.toml")),
        ])
        .unwrap();

        assert_eq!(settings.llm.model, "local-model");
        // Untouched keys from the lower layer survive the merge
        assert_eq!(settings.llm.max_tokens, 512);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.llm.temperature, 0.7);
    }

    #[test]
    fn test_environment_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_toml(&dir, "default.toml", "[rate_limit.chat]\nmax_requests = 10\n");

        std::env::set_var("JARVISTEST_RATE_LIMIT__CHAT__MAX_REQUESTS", "15");
        std::env::set_var("JARVISTEST_GATEWAY__COOLDOWN_MS", "1234");

        let settings = Settings::load_from(&[
            ConfigSource::File(base),
            ConfigSource::Environment {
                prefix: "JARVISTEST".to_string(),
            },
        ])
        .unwrap();

        std::env::remove_var("JARVISTEST_RATE_LIMIT__CHAT__MAX_REQUESTS");
        std::env::remove_var("JARVISTEST_GATEWAY__COOLDOWN_MS");

        assert_eq!(settings.rate_limit.chat.max_requests, 15);
        assert_eq!(settings.rate_limit.chat.window_ms, 60_000);
        assert_eq!(settings.gateway.cooldown_ms, 1234);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut settings = Settings::default();
        settings.llm.temperature = 3.0;
        settings.rate_limit.chat.window_ms = 10;

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("Temperature"));
        assert!(err.contains("'chat'"));
    }

    #[test]
    fn test_retained_message_floor() {
        let mut settings = Settings::default();
        settings.conversation.min_retained_messages = 1;

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("min_retained_messages"));

        settings.conversation.min_retained_messages = 4;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_blank_security_key_disables_authentication() {
        let mut security = SecurityConfig::default();
        assert!(!security.authentication_enabled());

        security.api_key = Some("   ".to_string());
        assert!(!security.authentication_enabled());

        security.api_key = Some(" jarvis-key ".to_string());
        assert_eq!(security.api_key(), Some("jarvis-key"));
    }

    #[test]
    fn test_api_key_required() {
        let mut llm = LlmConfig::default();
        assert!(llm.api_key().is_err());

        llm.api_key = Some("gsk_test".to_string());
        assert_eq!(llm.api_key().unwrap(), "gsk_test");
    }
}
