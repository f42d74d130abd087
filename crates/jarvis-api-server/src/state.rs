use std::sync::Arc;

use crate::config::Settings;
use crate::services::{AiGateway, ChatClient, ConversationStore, RateLimiter};
use crate::utils::{PeriodicTask, SharedClock, Sleeper};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub conversations: Arc<ConversationStore>,
    pub gateway: Arc<AiGateway>,
    pub global_limiter: Arc<RateLimiter>,
    pub chat_limiter: Arc<RateLimiter>,
    pub transcribe_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire every core component from settings. The upstream client, clock
    /// and sleeper are injected so tests can replace them.
    pub fn new(
        settings: Settings,
        client: Arc<dyn ChatClient>,
        clock: SharedClock,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let limits = &settings.rate_limit;

        let conversations = Arc::new(ConversationStore::new(
            settings.conversation.clone(),
            clock.clone(),
        ));
        let gateway = Arc::new(AiGateway::new(
            client,
            settings.gateway.clone(),
            clock.clone(),
            sleeper,
        ));
        let global_limiter = Arc::new(RateLimiter::new("api-rate-limit", limits.global, clock.clone()));
        let chat_limiter = Arc::new(RateLimiter::new("chat-rate-limit", limits.chat, clock.clone()));
        let transcribe_limiter = Arc::new(RateLimiter::new(
            "transcribe-rate-limit",
            limits.transcribe,
            clock,
        ));

        Self {
            settings: Arc::new(settings),
            conversations,
            gateway,
            global_limiter,
            chat_limiter,
            transcribe_limiter,
        }
    }

    /// Spawn the sweeps and the health probe. The caller owns the handles
    /// and stops them on shutdown.
    pub fn start_background_tasks(&self) -> Vec<PeriodicTask> {
        let mut tasks = vec![
            self.conversations.start_cleanup(),
            self.gateway.start_health_checks(),
        ];
        if self.settings.rate_limit.enabled {
            tasks.push(self.global_limiter.start_cleanup());
            tasks.push(self.chat_limiter.start_cleanup());
            tasks.push(self.transcribe_limiter.start_cleanup());
        }
        tasks
    }
}
