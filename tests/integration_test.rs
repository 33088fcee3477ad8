use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zai_gateway::accounts::{AccountStore, NewAccount, TokenSource};
use zai_gateway::config::GatewayConfig;
use zai_gateway::logging::CallStatus;
use zai_gateway::upstream::Sleeper;
use zai_gateway::{build_router, AccountPool, AppState, CallLog, LocalAccountStore, UpstreamClient};

// ────────────────────────────────────────────────────────────────
// Fake upstream
// ────────────────────────────────────────────────────────────────

/// Token behaviors: `good*` works, `expired*` gets 401, `flaky*` gets 502,
/// `refused*` creates fine but is refused a stream with 403, `slow*` streams
/// `p0`..`p5` 300 ms apart, `broken*` sends one fragment then drops the body.
#[derive(Default)]
struct FakeUpstream {
    create_tokens: Mutex<Vec<String>>,
    create_models: Mutex<Vec<String>>,
    stream_chat_ids: Mutex<Vec<String>>,
    user_agents: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn create_tokens(&self) -> Vec<String> {
        self.create_tokens.lock().unwrap().clone()
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

async fn fake_create(
    State(fake): State<Arc<FakeUpstream>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let token = bearer(&headers);
    fake.create_tokens.lock().unwrap().push(token.clone());
    fake.create_models
        .lock()
        .unwrap()
        .push(body["chat"]["models"][0].as_str().unwrap_or_default().to_string());
    if let Some(ua) = headers.get("user-agent").and_then(|v| v.to_str().ok()) {
        fake.user_agents.lock().unwrap().push(ua.to_string());
    }

    if token.starts_with("expired") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if token.starts_with("flaky") {
        return StatusCode::BAD_GATEWAY.into_response();
    }
    Json(serde_json::json!({ "id": format!("chat-{token}") })).into_response()
}

async fn fake_stream(
    State(fake): State<Arc<FakeUpstream>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    fake.stream_chat_ids
        .lock()
        .unwrap()
        .push(body["chat_id"].as_str().unwrap_or_default().to_string());

    let token = bearer(&headers);
    if token.starts_with("refused") {
        return StatusCode::FORBIDDEN.into_response();
    }
    if token.starts_with("slow") {
        let body = async_stream::stream! {
            for i in 0..6 {
                tokio::time::sleep(Duration::from_millis(300)).await;
                yield Ok::<_, std::io::Error>(format!("data: {{\"content\":\"p{i}\"}}\n\n"));
            }
            yield Ok("data: [DONE]\n\n".to_string());
        };
        return event_stream(Body::from_stream(body));
    }
    if token.starts_with("broken") {
        let body = async_stream::stream! {
            yield Ok::<_, std::io::Error>("data: {\"content\":\"partial\"}\n\n".to_string());
            tokio::time::sleep(Duration::from_millis(50)).await;
            yield Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        };
        return event_stream(Body::from_stream(body));
    }

    let sse = concat!(
        ": upstream comment\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {not json}\n\n",
        "data: [DONE]\n\n",
    );
    event_stream(Body::from(sse))
}

fn event_stream(body: Body) -> Response {
    ([("content-type", "text/event-stream")], body).into_response()
}

async fn spawn_fake_upstream() -> (SocketAddr, Arc<FakeUpstream>) {
    let fake = Arc::new(FakeUpstream::default());
    let app = Router::new()
        .route("/api/v1/chats/new", post(fake_create))
        .route("/api/chat/completions", post(fake_stream))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, fake)
}

// ────────────────────────────────────────────────────────────────
// Gateway harness
// ────────────────────────────────────────────────────────────────

struct NoSleep;

#[async_trait::async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

struct Harness {
    base: String,
    fake: Arc<FakeUpstream>,
    state: Arc<AppState>,
    client: reqwest::Client,
}

/// `accounts` are `(name, token, active)`.
async fn spawn_gateway(
    accounts: &[(&str, &str, bool)],
    tweak: impl FnOnce(&mut GatewayConfig),
) -> Harness {
    let (upstream_addr, fake) = spawn_fake_upstream().await;

    let mut config = GatewayConfig::default();
    config.upstream.base_url = format!("http://{upstream_addr}");
    config.upstream.retry_delay_ms = 0;
    tweak(&mut config);

    let store = Arc::new(LocalAccountStore::in_memory(config.pool.token_valid_hours));
    for (name, token, active) in accounts {
        let created = store
            .insert(NewAccount {
                name: (*name).to_string(),
                token: (*token).to_string(),
                token_source: TokenSource::Manual,
            })
            .await
            .unwrap();
        if !active {
            store.set_active(created.id, false).await.unwrap();
        }
    }

    let pool = Arc::new(AccountPool::new(store, config.pool.strategy));
    let upstream = UpstreamClient::new(&config.upstream)
        .unwrap()
        .with_sleeper(Arc::new(NoSleep));
    let state = Arc::new(AppState::new(
        config,
        pool,
        Arc::new(upstream),
        CallLog::in_memory(),
    ));

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        base: format!("http://{addr}"),
        fake,
        state,
        client: reqwest::Client::new(),
    }
}

impl Harness {
    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }
}

fn chat_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "gpt-5-2025-08-07",
        "stream": stream,
        "messages": [{"role": "user", "content": "hello"}],
    })
}

fn messages_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "claude-3-5-sonnet-latest",
        "max_tokens": 64,
        "stream": stream,
        "system": "be brief",
        "messages": [{"role": "user", "content": "hello"}],
    })
}

/// `data:` payloads of an SSE body, in order.
fn data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|d| d.trim().to_string())
        .collect()
}

fn event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("event:"))
        .map(|e| e.trim().to_string())
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Completions
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_openai_stream_framing() {
    let h = spawn_gateway(&[("a", "good-a", true)], |_| {}).await;

    let resp = h.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    let data = data_lines(&body);
    assert_eq!(data.len(), 3, "unexpected frames: {body}");

    let first: serde_json::Value = serde_json::from_str(&data[0]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["model"], "gpt-5-2025-08-07");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hi");

    let last: serde_json::Value = serde_json::from_str(&data[1]).unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(data[2], "[DONE]");

    assert_eq!(
        *h.fake.stream_chat_ids.lock().unwrap(),
        vec!["chat-good-a".to_string()]
    );
    assert!(h.fake.user_agents.lock().unwrap()[0].contains("Chrome"));
}

#[tokio::test]
async fn test_anthropic_stream_event_order() {
    let h = spawn_gateway(&[("a", "good-a", true)], |_| {}).await;

    let resp = h.post("/v1/messages", messages_body(true)).await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();

    assert_eq!(
        event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );

    let data = data_lines(&body);
    let start: serde_json::Value = serde_json::from_str(&data[0]).unwrap();
    assert_eq!(start["message"]["model"], "claude-3-5-sonnet-latest");
    let delta: serde_json::Value = serde_json::from_str(&data[2]).unwrap();
    assert_eq!(delta["delta"]["text"], "Hi");

    // the alias was resolved before reaching the upstream
    assert_eq!(
        *h.fake.create_models.lock().unwrap(),
        vec!["claude-sonnet-4-5-20250929".to_string()]
    );
}

#[tokio::test]
async fn test_non_streaming_responses() {
    let h = spawn_gateway(&[("a", "good-a", true)], |_| {}).await;

    let resp = h.post("/v1/messages", messages_body(false)).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "Hi");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["output_tokens"], 1);

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi");
}

#[tokio::test]
async fn test_create_502s_are_retried_then_fail() {
    let h = spawn_gateway(&[("a", "flaky-a", true)], |c| {
        c.upstream.max_retries = 3;
        c.dispatch.max_attempts = 1;
    })
    .await;

    let resp = h.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 503);
    assert_eq!(h.fake.create_tokens().len(), 3);
}

#[tokio::test]
async fn test_rejected_credential_fails_over_without_retry() {
    let h = spawn_gateway(
        &[("a", "expired-a", true), ("b", "good-b", true)],
        |c| c.upstream.max_retries = 3,
    )
    .await;

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        h.fake.create_tokens(),
        vec!["expired-a".to_string(), "good-b".to_string()]
    );

    let logs = h.state.call_log.recent(10);
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].account_name, "b");
    assert_eq!(logs[1].account_name, "a");
}

#[tokio::test]
async fn test_stream_refusal_moves_to_next_account() {
    let h = spawn_gateway(&[("a", "refused-a", true), ("b", "good-b", true)], |_| {}).await;

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(h.fake.stream_chat_ids.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_stream_outlasting_timeout_is_not_cut_off() {
    let h = spawn_gateway(&[("a", "slow-a", true)], |c| c.upstream.timeout_secs = 1).await;

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "p0p1p2p3p4p5");
}

#[tokio::test]
async fn test_broken_body_is_logged_as_error() {
    let h = spawn_gateway(&[("a", "broken-a", true)], |_| {}).await;

    let resp = h.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("partial"));
    assert!(body.contains("Error: "));
    assert_eq!(data_lines(&body).last().map(String::as_str), Some("[DONE]"));

    let logs = h.state.call_log.recent(10);
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].status, CallStatus::Error);
    assert_eq!(logs[0].account_name, "a");
    assert_eq!(logs[1].status, CallStatus::Success);

    // a broken reply does not take the account out of rotation
    let account = h.state.pool.store().get(1).await.unwrap().unwrap();
    assert!(account.is_active);
}

#[tokio::test]
async fn test_no_accounts_is_service_unavailable() {
    let h = spawn_gateway(&[], |_| {}).await;

    let resp = h.post("/v1/chat/completions", chat_body(true)).await;
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"]["message"].is_string());

    let resp = h.post("/v1/messages", messages_body(true)).await;
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "overloaded_error");

    assert!(h.fake.create_tokens().is_empty());
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let h = spawn_gateway(&[("a", "good-a", true)], |_| {}).await;

    let resp = h
        .post("/v1/chat/completions", serde_json::json!({ "messages": [] }))
        .await;
    assert_eq!(resp.status(), 400);

    let resp = h
        .client
        .post(format!("{}/v1/messages", h.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    assert!(h.fake.create_tokens().is_empty());
}

// ────────────────────────────────────────────────────────────────
// Gates
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_master_key_required_when_configured() {
    let h = spawn_gateway(&[("a", "good-a", true)], |c| {
        c.api_key = Some("secret".to_string());
    })
    .await;

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 403);

    let resp = h
        .client
        .post(format!("{}/v1/chat/completions", h.base))
        .bearer_auth("secret")
        .json(&chat_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .post(format!("{}/v1/messages", h.base))
        .header("x-api-key", "secret")
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // models and health stay open
    assert_eq!(h.get("/v1/models").await.status(), 200);
    assert_eq!(h.get("/health").await.status(), 200);
}

#[tokio::test]
async fn test_rate_limit() {
    let h = spawn_gateway(&[("a", "good-a", true)], |c| {
        c.rate_limit.enabled = true;
        c.rate_limit.requests = 1;
        c.rate_limit.window_secs = 60;
    })
    .await;

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-ratelimit-limit"], "1");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");

    let resp = h.post("/v1/chat/completions", chat_body(false)).await;
    assert_eq!(resp.status(), 429);
    assert!(resp.headers().contains_key("retry-after"));
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "RATE_LIMIT");

    for _ in 0..3 {
        assert_eq!(h.get("/health").await.status(), 200);
    }
}

// ────────────────────────────────────────────────────────────────
// Health, models and admin
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reflects_accounts() {
    let h = spawn_gateway(&[("a", "good-a", false)], |_| {}).await;

    let body: serde_json::Value = h.get("/health").await.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["accounts"]["total"], 1);
    assert_eq!(body["config"]["load_balance_strategy"], "round_robin");

    assert_eq!(h.get("/health/live").await.status(), 200);
    assert_eq!(h.get("/health/ready").await.status(), 503);
}

#[tokio::test]
async fn test_models_listing() {
    let h = spawn_gateway(&[], |_| {}).await;

    let body: serde_json::Value = h.get("/v1/models").await.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"gpt-5-2025-08-07"));
}

#[tokio::test]
async fn test_admin_account_lifecycle() {
    let h = spawn_gateway(&[], |_| {}).await;

    let resp = h
        .post(
            "/api/accounts",
            serde_json::json!({ "name": "main", "token": "good-0123456789" }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["token"], "good-012...");
    let id = body["data"]["id"].as_u64().unwrap();

    // duplicate names are refused
    let resp = h
        .post(
            "/api/accounts",
            serde_json::json!({ "name": "main", "token": "other" }),
        )
        .await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    assert_eq!(h.post("/v1/chat/completions", chat_body(false)).await.status(), 200);

    let stats: serde_json::Value = h.get("/api/stats").await.json().await.unwrap();
    assert_eq!(stats["total_calls"], 1);
    assert_eq!(stats["active_accounts"], 1);

    let logs: serde_json::Value = h.get("/api/logs?limit=5").await.json().await.unwrap();
    assert_eq!(logs["data"][0]["status"], "SUCCESS");

    let resp = h
        .post(&format!("/api/accounts/{id}/toggle"), serde_json::json!({}))
        .await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["is_active"], false);
    assert_eq!(h.post("/v1/chat/completions", chat_body(false)).await.status(), 503);

    let resp = h
        .client
        .put(format!("{}/api/accounts/{id}/token", h.base))
        .json(&serde_json::json!({ "token": "good-refreshed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["is_active"], true);
    assert!(body["data"]["last_refresh_at"].is_string());

    let resp = h
        .client
        .delete(format!("{}/api/accounts/{id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = h
        .client
        .delete(format!("{}/api/accounts/{id}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = h
        .client
        .delete(format!("{}/api/logs", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(h.state.call_log.recent(10).is_empty());
}
