use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use std::sync::Arc;

use crate::handlers::{chat, code, config, health, transcribe};
use crate::security::{api_key_middleware, rate_limit_middleware};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let server = &state.settings.server;
    let limits_enabled = state.settings.rate_limit.enabled;

    let mut chat_routes = Router::new()
        .route("/api/chat", post(chat::chat_handler))
        .route(
            "/api/chat/{id}",
            get(chat::history_handler).delete(chat::delete_handler),
        );

    let mut transcribe_routes = Router::new()
        .route("/api/transcribe", post(transcribe::transcribe_handler))
        .layer(DefaultBodyLimit::max(server.transcribe_body_limit_bytes));

    if limits_enabled {
        chat_routes = chat_routes.route_layer(middleware::from_fn_with_state(
            state.chat_limiter.clone(),
            rate_limit_middleware,
        ));
        transcribe_routes = transcribe_routes.route_layer(middleware::from_fn_with_state(
            state.transcribe_limiter.clone(),
            rate_limit_middleware,
        ));
    }

    let code_routes = Router::new()
        .route("/api/code/generate", post(code::generate_handler))
        .route("/api/code/explain", post(code::explain_handler))
        .route("/api/code/refactor", post(code::refactor_handler))
        .route("/api/code/review", post(code::review_handler));

    let mut api_routes = Router::new()
        .route("/api/stats", get(health::stats_handler))
        .route("/api/config", get(config::current_config_handler))
        .route("/api/config/defaults", get(config::default_config_handler))
        .merge(chat_routes)
        .merge(transcribe_routes)
        .merge(code_routes);

    // Inside the global limiter, so unauthenticated callers still use up their quota
    if let Some(api_key) = state.settings.security.api_key() {
        api_routes = api_routes.route_layer(middleware::from_fn_with_state(
            Arc::<str>::from(api_key),
            api_key_middleware,
        ));
    }

    if limits_enabled {
        api_routes = api_routes.route_layer(middleware::from_fn_with_state(
            state.global_limiter.clone(),
            rate_limit_middleware,
        ));
    }

    // Public routes (no rate limiting)
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(server.body_limit_bytes))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(false)))
        .with_state(state)
}
