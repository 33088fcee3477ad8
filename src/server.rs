use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::accounts::AccountPool;
use crate::admin;
use crate::config::GatewayConfig;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::error::GatewayError;
use crate::gate::{self, RateLimiter};
use crate::logging::CallLog;
use crate::models;
use crate::translate::aggregate::{anthropic_message, collect, openai_completion};
use crate::translate::anthropic_stream::{to_frame, AnthropicEncoder};
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::openai_stream::OpenAiEncoder;
use crate::translate::openai_types::{ChatCompletionRequest, ChatErrorResponse};
use crate::translate::request::{from_anthropic, from_openai, ChatRequest};
use crate::translate::SseFrame;
use crate::upstream::Upstream;

pub struct AppState {
    pub config: GatewayConfig,
    /// Master key callers must present; `None` disables the check.
    pub api_key: Option<String>,
    pub pool: Arc<AccountPool>,
    pub dispatcher: Dispatcher,
    pub call_log: CallLog,
    pub rate_limiter: Option<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        pool: Arc<AccountPool>,
        upstream: Arc<dyn Upstream>,
        call_log: CallLog,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            pool.clone(),
            upstream,
            call_log.clone(),
            config.dispatch.max_attempts,
        );
        let rate_limiter = config.rate_limit.enabled.then(|| {
            RateLimiter::new(
                config.rate_limit.requests,
                Duration::from_secs(config.rate_limit.window_secs),
            )
        });

        Self {
            api_key: config.effective_api_key(),
            config,
            pool,
            dispatcher,
            call_log,
            rate_limiter,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let completions = Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            gate::require_api_key,
        ));

    Router::new()
        .merge(completions)
        .merge(admin::router())
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/health/live", get(handle_live))
        .route("/health/ready", get(handle_ready))
        .layer(middleware::from_fn_with_state(state.clone(), gate::rate_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error rendering, one per dialect
// ---------------------------------------------------------------------------

fn status_of(err: &GatewayError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn openai_error(err: &GatewayError) -> Response {
    let status = status_of(err);
    let (error_type, code) = match status {
        StatusCode::BAD_REQUEST => ("invalid_request_error", None),
        StatusCode::SERVICE_UNAVAILABLE => ("service_unavailable", Some("no_available_account")),
        _ => ("api_error", None),
    };
    (
        status,
        Json(ChatErrorResponse::new(error_type, code, err.to_string())),
    )
        .into_response()
}

fn anthropic_error(err: &GatewayError) -> Response {
    let status = status_of(err);
    let body = match status {
        StatusCode::BAD_REQUEST => ErrorResponse::invalid_request(err.to_string()),
        StatusCode::NOT_FOUND => ErrorResponse::not_found(err.to_string()),
        StatusCode::SERVICE_UNAVAILABLE => ErrorResponse::overloaded(err.to_string()),
        _ => ErrorResponse::api_error(err.to_string()),
    };
    (status, Json(body)).into_response()
}

fn sse_event(frame: SseFrame) -> Event {
    let event = Event::default().data(frame.data);
    match frame.event {
        Some(name) => event.event(name),
        None => event,
    }
}

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

async fn run(state: &AppState, request: &ChatRequest) -> Result<Dispatched, GatewayError> {
    tracing::info!(
        model = %request.model,
        requested = %request.requested_model,
        stream = request.stream,
        messages = request.messages.len(),
        "Dispatching request"
    );
    state.dispatcher.dispatch(request).await
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let parsed: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse chat completion request");
            return openai_error(&GatewayError::invalid_request(format!(
                "Invalid request body: {e}"
            )));
        }
    };
    let request = match from_openai(parsed, &state.config.upstream.default_model) {
        Ok(r) => r,
        Err(e) => return openai_error(&e),
    };
    let dispatched = match run(&state, &request).await {
        Ok(d) => d,
        Err(e) => return openai_error(&e),
    };

    if request.stream {
        let mut encoder = OpenAiEncoder::new(&request.requested_model);
        let mut deltas = dispatched.deltas;
        let account = dispatched.account_name;

        let events = async_stream::stream! {
            while let Some(delta) = deltas.next().await {
                for frame in encoder.encode(&delta) {
                    yield Ok::<Event, Infallible>(sse_event(frame));
                }
                if encoder.is_finished() {
                    break;
                }
            }
            for frame in encoder.finish() {
                yield Ok(sse_event(frame));
            }
            tracing::debug!(%account, "OpenAI stream completed");
        };

        return Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    let collected = collect(dispatched.deltas).await;
    Json(openai_completion(
        &collected,
        &request.requested_model,
        request.input_tokens(),
    ))
    .into_response()
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let parsed: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse messages request");
            return anthropic_error(&GatewayError::invalid_request(format!(
                "Invalid request body: {e}"
            )));
        }
    };
    let request = match from_anthropic(parsed, &state.config.models) {
        Ok(r) => r,
        Err(e) => return anthropic_error(&e),
    };
    let dispatched = match run(&state, &request).await {
        Ok(d) => d,
        Err(e) => return anthropic_error(&e),
    };

    if request.stream {
        let mut encoder = AnthropicEncoder::new(&request.requested_model, request.input_tokens());
        let mut deltas = dispatched.deltas;
        let account = dispatched.account_name;

        let events = async_stream::stream! {
            while let Some(delta) = deltas.next().await {
                for event in encoder.process(&delta) {
                    yield Ok::<Event, Infallible>(sse_event(to_frame(&event)));
                }
                if encoder.is_finished() {
                    break;
                }
            }
            for event in encoder.finish() {
                yield Ok(sse_event(to_frame(&event)));
            }
            tracing::debug!(%account, "Anthropic stream completed");
        };

        return Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    let collected = collect(dispatched.deltas).await;
    Json(anthropic_message(
        &collected,
        &request.requested_model,
        request.input_tokens(),
    ))
    .into_response()
}

// ---------------------------------------------------------------------------
// Models and health
// ---------------------------------------------------------------------------

async fn handle_models() -> Json<models::ModelList> {
    Json(models::model_list())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = match state.pool.store().stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read account stats");
            Default::default()
        }
    };

    let status = if stats.active_accounts > 0 {
        "healthy"
    } else if stats.total_accounts > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(serde_json::json!({
        "status": status,
        "uptime": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": {
            "active": stats.active_accounts,
            "total": stats.total_accounts,
        },
        "config": {
            "rate_limit_enabled": state.rate_limiter.is_some(),
            "load_balance_strategy": state.pool.strategy().as_str(),
        },
    }))
}

async fn handle_live() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive" }))
}

async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    let ready = state
        .pool
        .store()
        .list_active()
        .await
        .is_ok_and(|active| !active.is_empty());

    if ready {
        Json(serde_json::json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready" })),
        )
            .into_response()
    }
}
