//! Caller-facing gates: master-key check and per-client rate limiting.
//!
//! Both run as `axum` middleware through `from_fn_with_state`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::admin::error_envelope;
use crate::server::AppState;

/// Paths never rate limited.
const EXEMPT_PATHS: &[&str] = &["/health", "/health/live", "/health/ready", "/v1/models"];

/// Prune idle clients once the table grows past this many keys.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after_secs: u64 },
}

/// Sliding-window limiter: at most `limit` requests per client within any
/// `window`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// Record a request from `key` at `now` unless it would exceed the limit.
    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let Ok(mut hits) = self.hits.lock() else {
            return RateDecision::Allowed {
                remaining: self.limit,
            };
        };

        if hits.len() > SWEEP_THRESHOLD {
            let window = self.window;
            hits.retain(|_, times| {
                times
                    .back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < window)
            });
        }

        let times = hits.entry(key.to_string()).or_default();
        while times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            times.pop_front();
        }

        if times.len() >= self.limit {
            let wait = times
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default();
            let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return RateDecision::Limited { retry_after_secs };
        }

        times.push_back(now);
        RateDecision::Allowed {
            remaining: self.limit - times.len(),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Identify the caller for rate limiting: `key:<first 16 chars of the
/// bearer token>`, else `ip:<first X-Forwarded-For hop>`, else `unknown`.
pub fn client_key(headers: &HeaderMap) -> String {
    if let Some(token) = bearer_token(headers) {
        let prefix: String = token.chars().take(16).collect();
        return format!("key:{prefix}");
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map_or_else(|| "unknown".to_string(), |ip| format!("ip:{ip}"))
}

/// Reject completion requests that do not carry the master key, when one is
/// configured. Anthropic clients may send it as `x-api-key` instead.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let presented = bearer_token(req.headers()).or_else(|| {
        req.headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    });

    if presented == Some(expected) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "Rejected request with invalid API key");
    error_envelope(StatusCode::FORBIDDEN, "AUTH_ERROR", "Invalid API Key", None)
}

pub async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return next.run(req).await;
    };
    if EXEMPT_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let key = client_key(req.headers());
    let limit = HeaderValue::from(limiter.limit());

    match limiter.check(&key) {
        RateDecision::Limited { retry_after_secs } => {
            tracing::warn!(client = %key, retry_after_secs, "Rate limit exceeded");
            let mut response = error_envelope(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT",
                "Too many requests, retry later",
                Some(serde_json::json!({ "retry_after": retry_after_secs })),
            );
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            headers.insert("x-ratelimit-limit", limit);
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            response
        }
        RateDecision::Allowed { remaining } => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", limit);
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
    }
}
