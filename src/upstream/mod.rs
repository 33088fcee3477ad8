//! Client for the upstream chat service.
//!
//! Every completion is two HTTP calls under one credential: create a
//! conversation seeded with the caller's latest message, then stream the
//! reply for that conversation. The reply body is normalized into a
//! [`Reply`] (see [`stream`]).

mod retry;
mod stream;
mod wire;

pub use retry::{send_with_retry, HasStatus, RetryPolicy, Sleeper, TokioSleeper};
pub use stream::{
    extract_content, normalize, parse_line, Delta, DeltaStream, LineEvent, Reply, FINISH_STOP,
};
pub use wire::{
    create_chat_request, prompt_variables, stream_completion_request, CreateChatRequest,
    CreateChatResponse, SeedIds, StreamCompletionRequest,
};

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ORIGIN, REFERER, USER_AGENT};
use reqwest::StatusCode;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::accounts::Credential;
use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use crate::models;
use crate::translate::request::ChatRequest;

const CREATE_PATH: &str = "/api/v1/chats/new";
const STREAM_PATH: &str = "/api/chat/completions";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Upstream-assigned id of a freshly created conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHandle {
    pub id: String,
    pub model: String,
}

/// The seam the dispatcher calls through.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Run one completion under `credential`.
    ///
    /// `Ok(None)` means the upstream rejected the credential (401 on create).
    /// Errors are transport or protocol failures for this credential.
    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<Option<Reply>>;
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    timezone: String,
    language: String,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    connections: Arc<Semaphore>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .read_timeout(config.timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .default_headers(browser_headers(&base_url)?)
            .build()?;

        Ok(Self {
            http,
            base_url,
            timezone: config.timezone.clone(),
            language: config.language.clone(),
            retry: RetryPolicy::new(config.max_retries, config.retry_delay()),
            sleeper: Arc::new(TokioSleeper),
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    /// Replace the sleeper used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
    }

    /// Phase one. `Ok(None)` when the token is rejected.
    pub async fn create_conversation(
        &self,
        request: &ChatRequest,
        token: &str,
    ) -> Result<Option<ConversationHandle>> {
        let body = create_chat_request(
            &SeedIds::random(),
            request.latest_content(),
            &request.model,
            models::display_name(&request.model),
            chrono::Utc::now().timestamp(),
        );

        let response = send_with_retry(&self.retry, self.sleeper.as_ref(), "create", || {
            let pending = self.post(CREATE_PATH, token).json(&body);
            async move { pending.send().await.map_err(GatewayError::from_transport) }
        })
        .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(model = %request.model, "Upstream rejected credential");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreateChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::upstream(format!("Invalid create response: {e}")))?;
        if created.id.is_empty() {
            return Err(GatewayError::upstream("Create response carried no conversation id"));
        }

        tracing::debug!(chat_id = %created.id, model = %request.model, "Conversation created");
        Ok(Some(ConversationHandle {
            id: created.id,
            model: request.model.clone(),
        }))
    }

    /// Phase two. The returned stream owns the response body.
    pub async fn open_stream(
        &self,
        handle: &ConversationHandle,
        request: &ChatRequest,
        token: &str,
    ) -> Result<Reply> {
        let variables = prompt_variables(chrono::Local::now(), &self.timezone, &self.language);
        let body = stream_completion_request(
            &handle.id,
            &handle.model,
            request.latest_content(),
            variables,
        );

        let response = send_with_retry(&self.retry, self.sleeper.as_ref(), "stream", || {
            let pending = self.post(STREAM_PATH, token).json(&body);
            async move { pending.send().await.map_err(GatewayError::from_transport) }
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                chat_id = %handle.id,
                "Stream request refused"
            );
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(normalize(response.bytes_stream()))
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<Option<Reply>> {
        let permit = self
            .connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::other("upstream connection limiter closed"))?;

        let Some(handle) = self.create_conversation(request, &credential.token).await? else {
            return Ok(None);
        };
        let reply = self.open_stream(&handle, request, &credential.token).await?;
        Ok(Some(Reply {
            deltas: hold_permit(reply.deltas, permit),
            interrupted: reply.interrupted,
        }))
    }
}

/// Keep `permit` until the stream is drained or dropped.
fn hold_permit(deltas: DeltaStream, permit: OwnedSemaphorePermit) -> DeltaStream {
    Box::pin(async_stream::stream! {
        let _permit = permit;
        let mut deltas = deltas;
        while let Some(delta) = deltas.next().await {
            yield delta;
        }
    })
}

fn browser_headers(base_url: &str) -> Result<HeaderMap> {
    let origin = HeaderValue::from_str(base_url)
        .map_err(|e| GatewayError::config(format!("Invalid upstream base_url: {e}")))?;
    let referer = HeaderValue::from_str(&format!("{base_url}/"))
        .map_err(|e| GatewayError::config(format!("Invalid upstream base_url: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ORIGIN, origin);
    headers.insert(REFERER, referer);
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    Ok(headers)
}
