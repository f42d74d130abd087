use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ConversationConfig;
use crate::models::chat::{ConversationId, Message, Role};
use crate::utils::error::CoreError;
use crate::utils::{PeriodicTask, SharedClock};

use super::types::{Conversation, ConversationStats};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Thread-safe in-memory conversation store
///
/// DashMap shards give each conversation its own write lock, so appends to
/// one conversation are serialized without blocking the others.
pub struct ConversationStore {
    conversations: DashMap<ConversationId, Conversation>,
    config: ConversationConfig,
    clock: SharedClock,
    activity: AtomicU64,
}

impl ConversationStore {
    pub fn new(config: ConversationConfig, clock: SharedClock) -> Self {
        info!(
            max_conversations = config.max_conversations,
            max_context_tokens = config.max_context_tokens,
            ttl_secs = config.ttl_secs,
            "Initializing conversation store"
        );
        Self {
            conversations: DashMap::new(),
            config,
            clock,
            activity: AtomicU64::new(0),
        }
    }

    /// Create a conversation, optionally seeded with a system prompt.
    /// Evicts the least recently updated conversations beyond the cap.
    pub fn create(&self, system_prompt: Option<&str>) -> ConversationId {
        let now = self.clock.now_ms();
        let id = self.generate_id(now);

        let mut conversation = Conversation::new(id.clone(), now, self.next_activity());
        if let Some(prompt) = system_prompt {
            conversation
                .messages
                .push(Message::new(Role::System, prompt, now));
        }

        self.conversations.insert(id.clone(), conversation);
        self.enforce_max_conversations();

        debug!(conversation_id = %id, "Conversation created");
        id
    }

    /// Append a message, refresh `updated_at` and trim to the token budget.
    pub fn add_message(&self, id: &str, role: Role, content: &str) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        let activity = self.next_activity();

        let mut entry = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        entry.messages.push(Message::new(role, content, now));
        entry.touch(now, activity);

        let removed = trim_context(
            &mut entry.messages,
            self.config.max_context_tokens,
            self.config.min_retained_messages,
        );
        if removed > 0 {
            debug!(
                conversation_id = %id,
                removed,
                remaining_messages = entry.messages.len(),
                "Trimmed messages from context"
            );
        }

        Ok(())
    }

    /// Take back the latest message if it is a `role` turn with `content`.
    /// Messages trimmed when it was appended are not restored.
    /// Returns whether a message was removed
    pub fn retract_last(&self, id: &str, role: Role, content: &str) -> bool {
        let Some(mut entry) = self.conversations.get_mut(id) else {
            return false;
        };

        let matches = entry
            .messages
            .last()
            .is_some_and(|last| last.role() == role && last.content() == content);
        if matches {
            entry.messages.pop();
            debug!(conversation_id = %id, role = ?role, "Retracted last message");
        }
        matches
    }

    /// Copy of the conversation's messages, system messages first
    pub fn get_messages(&self, id: &str) -> Result<Vec<Message>, CoreError> {
        self.conversations
            .get(id)
            .map(|entry| entry.messages.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conversations.contains_key(id)
    }

    pub fn delete(&self, id: &str) -> bool {
        self.conversations.remove(id).is_some()
    }

    pub fn clear_all(&self) {
        self.conversations.clear();
        info!("All conversations cleared");
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Remove conversations idle for longer than the TTL.
    /// Returns number of conversations removed
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let ttl_ms = self.config.ttl().as_millis() as u64;

        let start_len = self.conversations.len();
        self.conversations
            .retain(|_, conversation| !conversation.is_expired(now, ttl_ms));
        let removed = start_len.saturating_sub(self.conversations.len());

        if removed > 0 {
            info!(count = removed, "Cleaned up expired conversations");
        }
        removed
    }

    pub fn stats(&self) -> ConversationStats {
        ConversationStats {
            total_conversations: self.len(),
            max_conversations: self.config.max_conversations,
            max_context_tokens: self.config.max_context_tokens,
        }
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `cleanup_interval`
    pub fn start_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let store = Arc::clone(self);
        PeriodicTask::spawn(
            "conversation-cleanup",
            self.config.cleanup_interval(),
            move || {
                let store = store.clone();
                async move {
                    store.cleanup_expired();
                }
            },
        )
    }

    fn enforce_max_conversations(&self) -> usize {
        let max = self.config.max_conversations;
        if self.conversations.len() <= max {
            return 0;
        }

        let mut by_age: Vec<(u64, u64, ConversationId)> = self
            .conversations
            .iter()
            .map(|entry| (entry.updated_at, entry.activity_seq, entry.key().clone()))
            .collect();
        by_age.sort_unstable();

        let excess = by_age.len().saturating_sub(max);
        for (_, _, id) in by_age.into_iter().take(excess) {
            self.conversations.remove(&id);
            debug!(conversation_id = %id, "Removed old conversation");
        }
        excess
    }

    fn next_activity(&self) -> u64 {
        self.activity.fetch_add(1, Ordering::Relaxed)
    }

    fn generate_id(&self, now_ms: u64) -> ConversationId {
        let mut rng = rand::rng();
        loop {
            let suffix: String = (0..ID_SUFFIX_LEN)
                .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
                .collect();
            let id = format!("conv_{}_{}", now_ms, suffix);
            if !self.conversations.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Drop the oldest non-system messages while the total estimate is over
/// `max_tokens`, never going below `min_retained` non-system messages.
/// System messages are kept and regrouped as a prefix.
/// Returns number of messages removed
pub(crate) fn trim_context(
    messages: &mut Vec<Message>,
    max_tokens: usize,
    min_retained: usize,
) -> usize {
    let (system, others): (Vec<Message>, Vec<Message>) =
        std::mem::take(messages).into_iter().partition(Message::is_system);

    let mut total: usize = system
        .iter()
        .chain(others.iter())
        .map(Message::token_estimate)
        .sum();

    let mut others = VecDeque::from(others);
    let mut removed = 0;
    while total > max_tokens && others.len() > min_retained {
        match others.pop_front() {
            Some(oldest) => {
                total -= oldest.token_estimate();
                removed += 1;
            }
            None => break,
        }
    }

    messages.extend(system);
    messages.extend(others);
    removed
}
