use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use chrono::{SecondsFormat, TimeZone, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::services::rate_limiter::{RateLimitQuota, RateLimiter};
use crate::utils::error::ApiError;

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Identify the caller: first `x-forwarded-for` hop, then `x-real-ip`,
/// then the peer address
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let ip = forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    format!("ip:{}", ip)
}

/// Admission control for a route group, backed by its own [`RateLimiter`]
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identifier = client_identifier(request.headers(), peer);

    let quota = limiter.check(&identifier).into_result()?;
    debug!(identifier = %identifier, remaining = quota.remaining, "Request admitted");

    let mut response = next.run(request).await;
    insert_quota_headers(response.headers_mut(), &quota);
    Ok(response)
}

fn insert_quota_headers(headers: &mut HeaderMap, quota: &RateLimitQuota) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));

    let reset = Utc
        .timestamp_millis_opt(quota.reset_at_ms as i64)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true));
    if let Some(value) = reset.and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(X_RATELIMIT_RESET, value);
    }
}
