use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::models::chat::ChatRequest;
use crate::services::chat_client::{ChatClient, TextStream};
use crate::utils::error::CoreError;
use crate::utils::{PeriodicTask, SharedClock, Sleeper};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until the cooldown elapses
    Open,
    /// Cooldown elapsed, the next call is a trial
    HalfOpen,
}

/// Health of the upstream client as seen by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub circuit_reset_at: Option<u64>,
    pub last_check: u64,
    pub last_error: Option<String>,
}

impl ClientHealth {
    fn new(now_ms: u64) -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            circuit_reset_at: None,
            last_check: now_ms,
            last_error: None,
        }
    }

    fn reset(&mut self) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
        self.circuit_reset_at = None;
    }
}

/// Retry and circuit breaking around the upstream [`ChatClient`].
///
/// Health state sits behind a `parking_lot::Mutex` that is never held
/// across an `.await`, so the live request path and the health probe can
/// update it concurrently.
pub struct AiGateway {
    client: Arc<dyn ChatClient>,
    config: GatewayConfig,
    health: Mutex<ClientHealth>,
    clock: SharedClock,
    sleeper: Arc<dyn Sleeper>,
}

impl AiGateway {
    pub fn new(
        client: Arc<dyn ChatClient>,
        config: GatewayConfig,
        clock: SharedClock,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        info!(
            max_retries = config.max_retries,
            max_failures = config.max_failures,
            cooldown_ms = config.cooldown_ms,
            "AI gateway initialized"
        );
        let health = Mutex::new(ClientHealth::new(clock.now_ms()));
        Self {
            client,
            config,
            health,
            clock,
            sleeper,
        }
    }

    /// Return the client, or fail fast while the circuit is open.
    /// Once the cooldown has elapsed the health record is reset and the
    /// caller's call becomes the trial.
    fn acquire_client(&self) -> Result<Arc<dyn ChatClient>, CoreError> {
        let now = self.clock.now_ms();
        let mut health = self.health.lock();

        if !health.is_healthy {
            match health.circuit_reset_at {
                Some(reset_at) if now > reset_at => {
                    info!("Circuit breaker reset, attempting recovery");
                    health.reset();
                }
                reset_at => {
                    let remaining_ms = reset_at.map_or(self.config.cooldown_ms, |t| t.saturating_sub(now));
                    return Err(CoreError::ServiceUnavailable {
                        retry_after_secs: remaining_ms.div_ceil(1000).max(1),
                    });
                }
            }
        }

        Ok(Arc::clone(&self.client))
    }

    /// Run `operation` with up to `max_retries` attempts and exponential
    /// backoff. Each attempt is bounded by `attempt_timeout`; a timeout counts
    /// as a failure. Non-retryable errors are returned immediately.
    pub async fn execute_with_retry<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, CoreError>
    where
        F: FnMut(Arc<dyn ChatClient>) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let client = self.acquire_client()?;
        let max_retries = self.config.max_retries.max(1);
        let attempt_timeout = self.config.attempt_timeout();

        let mut attempt = 1;
        loop {
            debug!(operation = label, attempt, max_retries, "Calling upstream");

            let outcome = match tokio::time::timeout(attempt_timeout, operation(Arc::clone(&client))).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout(attempt_timeout)),
            };

            match outcome {
                Ok(value) => {
                    self.record_success();
                    debug!(operation = label, attempt, "Upstream call succeeded");
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    warn!(operation = label, attempt, error = %err, "Upstream call rejected, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    error!(
                        operation = label,
                        attempt,
                        max_retries,
                        error = %err,
                        "Upstream call failed"
                    );
                    self.record_failure(&err);

                    if attempt >= max_retries {
                        return Err(err);
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(operation = label, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Bound every chunk of an established stream by `attempt_timeout`.
    /// A stalled or failed stream counts as a failure; the wrapped stream
    /// ends after its first error.
    pub fn supervise_stream(self: &Arc<Self>, mut chunks: TextStream) -> TextStream {
        let gateway = Arc::clone(self);
        let idle_timeout = self.config.attempt_timeout();

        Box::pin(async_stream::stream! {
            loop {
                let item = match tokio::time::timeout(idle_timeout, chunks.next()).await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(_) => Err(CoreError::Timeout(idle_timeout)),
                };

                match item {
                    Ok(chunk) => yield Ok(chunk),
                    Err(err) => {
                        if err.is_retryable() {
                            error!(error = %err, "Upstream stream failed mid-response");
                            gateway.record_failure(&err);
                        }
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(20);
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(factor))
    }

    fn record_success(&self) {
        let mut health = self.health.lock();
        if health.consecutive_failures > 0 || !health.is_healthy {
            info!("AI service recovered");
        }
        health.reset();
    }

    fn record_failure(&self, err: &CoreError) {
        let now = self.clock.now_ms();
        let mut health = self.health.lock();

        health.consecutive_failures += 1;
        health.last_error = Some(err.to_string());

        if health.consecutive_failures >= self.config.max_failures {
            health.is_healthy = false;
            health.circuit_reset_at = Some(now + self.config.cooldown_ms);
            error!(
                consecutive_failures = health.consecutive_failures,
                reset_at = now + self.config.cooldown_ms,
                "Circuit breaker opened due to consecutive failures"
            );
        }
    }

    /// Issue a minimal chat call outside the circuit and fold the outcome
    /// into the health record. Returns whether the probe succeeded
    pub async fn probe_health(&self) -> bool {
        let attempt_timeout = self.config.attempt_timeout();
        let result = match tokio::time::timeout(attempt_timeout, self.client.chat(ChatRequest::probe())).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(attempt_timeout)),
        };

        let healthy = match result {
            Ok(_) => {
                self.record_success();
                true
            }
            Err(err) => {
                warn!(error = %err, "Health check failed");
                self.record_failure(&err);
                false
            }
        };

        self.health.lock().last_check = self.clock.now_ms();
        healthy
    }

    /// Snapshot of the health record
    pub fn health(&self) -> ClientHealth {
        self.health.lock().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.lock().is_healthy
    }

    pub fn circuit_state(&self) -> CircuitState {
        let now = self.clock.now_ms();
        let health = self.health.lock();
        if health.is_healthy {
            CircuitState::Closed
        } else if health.circuit_reset_at.is_some_and(|t| now > t) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Run [`probe_health`](Self::probe_health) every `health_check_interval`
    pub fn start_health_checks(self: &Arc<Self>) -> PeriodicTask {
        let gateway = Arc::clone(self);
        PeriodicTask::spawn(
            "ai-health-check",
            self.config.health_check_interval(),
            move || {
                let gateway = gateway.clone();
                async move {
                    gateway.probe_health().await;
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ChatCompletion, TokenUsage};
    use crate::services::chat_client::{MockChatClient, TextStream};
    use crate::utils::{ManualClock, RecordingSleeper};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn completion(content: &str) -> ChatCompletion {
        ChatCompletion {
            content: content.to_string(),
            model: "test-model".to_string(),
            usage: TokenUsage::default(),
        }
    }

    fn upstream_error() -> CoreError {
        CoreError::Upstream("LLM API error: 500".to_string())
    }

    struct Harness {
        gateway: AiGateway,
        clock: ManualClock,
        sleeper: RecordingSleeper,
    }

    fn harness(client: impl ChatClient + 'static, config: GatewayConfig) -> Harness {
        let clock = ManualClock::new(1_000_000);
        let sleeper = RecordingSleeper::advancing(clock.clone());
        let gateway = AiGateway::new(
            Arc::new(client),
            config,
            Arc::new(clock.clone()),
            Arc::new(sleeper.clone()),
        );
        Harness {
            gateway,
            clock,
            sleeper,
        }
    }

    fn single_attempt() -> GatewayConfig {
        GatewayConfig {
            max_retries: 1,
            ..GatewayConfig::default()
        }
    }

    async fn chat(gateway: &AiGateway) -> Result<ChatCompletion, CoreError> {
        gateway
            .execute_with_retry("chat", |client| async move {
                client.chat(ChatRequest::probe()).await
            })
            .await
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let mut mock = MockChatClient::new();
        mock.expect_chat().times(1).returning(|_| Ok(completion("pong")));
        let h = harness(mock, GatewayConfig::default());

        let result = chat(&h.gateway).await.unwrap();

        assert_eq!(result.content, "pong");
        assert_eq!(h.gateway.circuit_state(), CircuitState::Closed);
        assert!(h.sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_retries_with_exponential_backoff() {
        let mut mock = MockChatClient::new();
        mock.expect_chat().times(3).returning(|_| Err(upstream_error()));
        let h = harness(mock, GatewayConfig::default());

        let result = chat(&h.gateway).await;

        assert_eq!(result, Err(upstream_error()));
        assert_eq!(
            h.sleeper.delays(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        let health = h.gateway.health();
        assert_eq!(health.consecutive_failures, 3);
        assert!(!health.is_healthy);
        assert_eq!(health.last_error, Some(upstream_error().to_string()));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockChatClient::new();
        mock.expect_chat().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(upstream_error())
            } else {
                Ok(completion("ok"))
            }
        });
        let h = harness(mock, GatewayConfig::default());

        assert!(chat(&h.gateway).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.gateway.health().consecutive_failures, 0);
        assert!(h.gateway.is_healthy());
    }

    #[tokio::test]
    async fn test_circuit_opens_and_self_heals() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockChatClient::new();
        mock.expect_chat().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(upstream_error())
            } else {
                Ok(completion("back"))
            }
        });
        let h = harness(mock, single_attempt());

        for _ in 0..3 {
            assert_eq!(chat(&h.gateway).await, Err(upstream_error()));
        }
        assert_eq!(h.gateway.circuit_state(), CircuitState::Open);

        // Fails fast without touching the client
        assert_eq!(
            chat(&h.gateway).await,
            Err(CoreError::ServiceUnavailable { retry_after_secs: 60 })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        h.clock.advance(Duration::from_millis(60_001));
        assert_eq!(h.gateway.circuit_state(), CircuitState::HalfOpen);

        let result = chat(&h.gateway).await.unwrap();
        assert_eq!(result.content, "back");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.gateway.circuit_state(), CircuitState::Closed);
        assert_eq!(h.gateway.health().circuit_reset_at, None);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_circuit() {
        let mut mock = MockChatClient::new();
        mock.expect_chat().times(4).returning(|_| Err(upstream_error()));
        let h = harness(mock, single_attempt());

        for _ in 0..3 {
            let _ = chat(&h.gateway).await;
        }
        h.clock.advance(Duration::from_millis(60_001));

        // Trial resets the counter, so one failure is not enough to re-open
        assert_eq!(chat(&h.gateway).await, Err(upstream_error()));
        assert_eq!(h.gateway.circuit_state(), CircuitState::Closed);
        assert_eq!(h.gateway.health().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_retry_after_counts_down() {
        let mut mock = MockChatClient::new();
        mock.expect_chat().times(3).returning(|_| Err(upstream_error()));
        let h = harness(mock, single_attempt());
        for _ in 0..3 {
            let _ = chat(&h.gateway).await;
        }

        h.clock.advance(Duration::from_millis(45_500));
        assert_eq!(
            chat(&h.gateway).await,
            Err(CoreError::ServiceUnavailable { retry_after_secs: 15 })
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let mut mock = MockChatClient::new();
        mock.expect_chat()
            .times(1)
            .returning(|_| Err(CoreError::InvalidInput("empty".to_string())));
        let h = harness(mock, GatewayConfig::default());

        let result = chat(&h.gateway).await;

        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
        assert!(h.sleeper.delays().is_empty());
        assert_eq!(h.gateway.health().consecutive_failures, 0);
    }

    struct HangingClient;

    #[async_trait]
    impl ChatClient for HangingClient {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatCompletion, CoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(completion("too late"))
        }

        async fn chat_stream(&self, _request: ChatRequest) -> Result<TextStream, CoreError> {
            Err(upstream_error())
        }

        async fn transcribe(&self, _audio: Bytes, _file_name: String) -> Result<String, CoreError> {
            Err(upstream_error())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let h = harness(HangingClient, single_attempt());

        let result = chat(&h.gateway).await;

        assert_eq!(result, Err(CoreError::Timeout(Duration::from_secs(30))));
        assert_eq!(h.gateway.health().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_times_out_and_counts_as_failure() {
        let h = harness(MockChatClient::new(), single_attempt());
        let gateway = Arc::new(h.gateway);

        let upstream = futures::stream::iter(vec![Ok("Good ".to_string())])
            .chain(futures::stream::pending());
        let mut chunks = gateway.supervise_stream(Box::pin(upstream) as TextStream);

        assert_eq!(chunks.next().await, Some(Ok("Good ".to_string())));
        assert_eq!(
            chunks.next().await,
            Some(Err(CoreError::Timeout(Duration::from_secs(30))))
        );
        assert_eq!(chunks.next().await, None);

        let health = gateway.health();
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stream_errors_reach_the_breaker() {
        let config = GatewayConfig {
            max_failures: 1,
            ..single_attempt()
        };
        let h = harness(MockChatClient::new(), config);
        let gateway = Arc::new(h.gateway);

        let upstream = futures::stream::iter(vec![
            Ok("partial".to_string()),
            Err(upstream_error()),
            Ok("never seen".to_string()),
        ]);
        let collected: Vec<_> = gateway
            .supervise_stream(Box::pin(upstream) as TextStream)
            .collect()
            .await;

        assert_eq!(collected, vec![Ok("partial".to_string()), Err(upstream_error())]);
        assert_eq!(gateway.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_completed_stream_leaves_health_untouched() {
        let h = harness(MockChatClient::new(), single_attempt());
        let gateway = Arc::new(h.gateway);

        let upstream = futures::stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let collected: Vec<_> = gateway
            .supervise_stream(Box::pin(upstream) as TextStream)
            .collect()
            .await;

        assert_eq!(collected.len(), 2);
        assert_eq!(gateway.health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_probe_failures_open_circuit_with_reset_time() {
        let mut mock = MockChatClient::new();
        mock.expect_chat()
            .withf(|request| *request == ChatRequest::probe())
            .times(3)
            .returning(|_| Err(upstream_error()));
        let h = harness(mock, GatewayConfig::default());

        for _ in 0..3 {
            assert!(!h.gateway.probe_health().await);
        }

        let health = h.gateway.health();
        assert!(!health.is_healthy);
        assert_eq!(health.circuit_reset_at, Some(1_000_000 + 60_000));
        assert_eq!(h.gateway.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_probe_success_resets_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockChatClient::new();
        mock.expect_chat().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(upstream_error())
            } else {
                Ok(completion("pong"))
            }
        });
        let h = harness(mock, single_attempt());
        for _ in 0..3 {
            let _ = chat(&h.gateway).await;
        }
        assert!(!h.gateway.is_healthy());

        h.clock.advance(Duration::from_secs(10));
        assert!(h.gateway.probe_health().await);

        let health = h.gateway.health();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_check, 1_010_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_task_probes_periodically() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockChatClient::new();
        mock.expect_chat().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(completion("pong"))
        });
        let h = harness(mock, GatewayConfig::default());
        let gateway = Arc::new(h.gateway);

        let task = gateway.start_health_checks();
        tokio::time::sleep(Duration::from_secs(5 * 60 * 2 + 1)).await;
        task.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
