use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;

use crate::services::conversation::ConversationStats;
use crate::services::{CircuitState, ClientHealth, RateLimiterStats};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    timestamp: String,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    status: String,
    circuit: CircuitState,
}

/// Not ready while the circuit is open; a half-open circuit accepts a trial
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let circuit = state.gateway.circuit_state();
    let (status, label) = match circuit {
        CircuitState::Open => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        CircuitState::Closed | CircuitState::HalfOpen => (StatusCode::OK, "ready"),
    };

    (
        status,
        Json(ReadinessResponse {
            status: label.to_string(),
            circuit,
        }),
    )
}

#[derive(Serialize)]
pub struct RateLimitStatsResponse {
    global: RateLimiterStats,
    chat: RateLimiterStats,
    transcribe: RateLimiterStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    conversations: ConversationStats,
    rate_limits: RateLimitStatsResponse,
    ai_client: ClientHealth,
    circuit: CircuitState,
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        conversations: state.conversations.stats(),
        rate_limits: RateLimitStatsResponse {
            global: state.global_limiter.stats(),
            chat: state.chat_limiter.stats(),
            transcribe: state.transcribe_limiter.stats(),
        },
        ai_client: state.gateway.health(),
        circuit: state.gateway.circuit_state(),
    })
}
