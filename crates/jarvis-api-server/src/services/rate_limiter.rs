use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;
use crate::utils::error::CoreError;
use crate::utils::{PeriodicTask, SharedClock};

/// Per-identifier sliding window state
#[derive(Debug, Clone, Default)]
struct RateLimitEntry {
    /// Accepted request timestamps (ms), oldest first
    requests: VecDeque<u64>,
    blocked: bool,
    blocked_until: Option<u64>,
}

impl RateLimitEntry {
    fn compact(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.requests.front() {
            if now.saturating_sub(oldest) < window_ms {
                break;
            }
            self.requests.pop_front();
        }
    }
}

/// Quota left after an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitQuota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed(RateLimitQuota),
    Denied { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub fn into_result(self) -> Result<RateLimitQuota, CoreError> {
        match self {
            Self::Allowed(quota) => Ok(quota),
            Self::Denied { retry_after_secs } => {
                Err(CoreError::RateLimitExceeded { retry_after_secs })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub total_tracked: usize,
    pub blocked: usize,
}

/// Sliding window rate limiter with temporary blocking
///
/// Exceeding `max_requests` inside `window_ms` blocks the identifier for
/// `block_duration_ms`; every request during the block is denied regardless
/// of the window.
pub struct RateLimiter {
    name: &'static str,
    entries: DashMap<String, RateLimitEntry>,
    config: RateLimitConfig,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig, clock: SharedClock) -> Self {
        info!(
            limiter = name,
            window_ms = config.window_ms,
            max_requests = config.max_requests,
            block_duration_ms = config.block_duration_ms,
            "Initializing rate limiter"
        );
        Self {
            name,
            entries: DashMap::new(),
            config,
            clock,
        }
    }

    /// Record a request for `identifier` and decide whether it may proceed
    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let window_ms = self.config.window_ms;
        let max_requests = self.config.max_requests as usize;

        // Entry guard holds the shard lock for the whole read-modify-write
        let mut entry = self.entries.entry(identifier.to_string()).or_default();

        if entry.blocked {
            match entry.blocked_until {
                Some(until) if now < until => {
                    return RateLimitDecision::Denied {
                        retry_after_secs: (until - now).div_ceil(1000),
                    };
                }
                _ => {
                    entry.blocked = false;
                    entry.blocked_until = None;
                    entry.requests.clear();
                    debug!(limiter = self.name, identifier, "Rate limit block expired");
                }
            }
        }

        entry.compact(now, window_ms);

        if entry.requests.len() >= max_requests {
            let block = self.config.block_duration_ms;
            entry.blocked = true;
            entry.blocked_until = Some(now + block);

            warn!(
                limiter = self.name,
                identifier,
                requests = entry.requests.len(),
                blocked_until = now + block,
                "Rate limit exceeded"
            );

            return RateLimitDecision::Denied {
                retry_after_secs: block.div_ceil(1000),
            };
        }

        entry.requests.push_back(now);

        RateLimitDecision::Allowed(RateLimitQuota {
            limit: self.config.max_requests,
            remaining: max_requests.saturating_sub(entry.requests.len()) as u32,
            reset_at_ms: now + window_ms,
        })
    }

    /// Drop identifiers with no in-window requests that are not blocked.
    /// Blocks that have already run out count as unblocked.
    /// Returns number of identifiers removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let window_ms = self.config.window_ms;

        let start_len = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.compact(now, window_ms);
            let still_blocked = entry.blocked && entry.blocked_until.is_some_and(|t| now < t);
            !entry.requests.is_empty() || still_blocked
        });
        let removed = start_len.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(limiter = self.name, count = removed, "Cleaned up rate limit entries");
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_tracked: self.entries.len(),
            blocked: self.entries.iter().filter(|e| e.blocked).count(),
        }
    }

    /// Run [`cleanup`](Self::cleanup) once per window
    pub fn start_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let limiter = Arc::clone(self);
        PeriodicTask::spawn(self.name, self.config.window(), move || {
            let limiter = limiter.clone();
            async move {
                limiter.cleanup();
            }
        })
    }
}
