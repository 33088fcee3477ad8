//! Administrative API: account management, call logs and stats.
//!
//! Responses use one envelope: `{success: true, message, data?}` on success,
//! `{success: false, error: {code, message, details?}}` on failure.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accounts::{AccountId, Credential, NewAccount, TokenSource};
use crate::error::GatewayError;
use crate::server::AppState;

const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
struct Success<T: Serialize> {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn success<T: Serialize>(message: &str, data: Option<T>) -> Response {
    Json(Success {
        success: true,
        message: message.to_string(),
        data,
    })
    .into_response()
}

pub fn error_envelope(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> Response {
    let mut error = serde_json::json!({ "code": code, "message": message.into() });
    if let Some(details) = details {
        error["details"] = details;
    }
    (
        status,
        Json(serde_json::json!({ "success": false, "error": error })),
    )
        .into_response()
}

fn admin_error(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = match status {
        StatusCode::BAD_REQUEST => "VALIDATION_ERROR",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
        _ => "ERROR",
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "Admin request failed");
    }
    error_envelope(status, code, err.to_string(), None)
}

/// Account as shown to administrators: the token is masked.
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub id: AccountId,
    pub name: String,
    pub token: String,
    pub token_source: TokenSource,
    pub is_active: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
}

impl From<&Credential> for AccountView {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            token: c.masked_token(),
            token_source: c.token_source,
            is_active: c.is_active,
            is_expired: c.is_expired_at(Utc::now()),
            created_at: c.created_at,
            expires_at: c.expires_at,
            last_used_at: c.last_used_at,
            last_refresh_at: c.last_refresh_at,
            total_calls: c.total_calls,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenUpdate {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/accounts", get(list_accounts).post(add_account))
        .route("/api/accounts/:id", axum::routing::delete(delete_account))
        .route("/api/accounts/:id/toggle", post(toggle_account))
        .route("/api/accounts/:id/token", put(replace_token))
        .route("/api/logs", get(recent_logs).delete(clear_logs))
        .route("/api/stats", get(stats))
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> Response {
    match state.pool.store().list_all().await {
        Ok(accounts) => {
            let views: Vec<AccountView> = accounts.iter().map(AccountView::from).collect();
            success("ok", Some(views))
        }
        Err(e) => admin_error(&e),
    }
}

async fn add_account(
    State(state): State<Arc<AppState>>,
    Json(account): Json<NewAccount>,
) -> Response {
    match state.pool.store().insert(account).await {
        Ok(created) => success("account added", Some(AccountView::from(&created))),
        Err(e) => admin_error(&e),
    }
}

async fn toggle_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
) -> Response {
    let store = state.pool.store();
    let account = match store.get(id).await {
        Ok(Some(account)) => account,
        Ok(None) => return admin_error(&GatewayError::AccountNotFound(id)),
        Err(e) => return admin_error(&e),
    };

    let is_active = !account.is_active;
    match store.set_active(id, is_active).await {
        Ok(()) => {
            tracing::info!(account_id = id, is_active, "Account toggled");
            success(
                "account updated",
                Some(serde_json::json!({ "id": id, "is_active": is_active })),
            )
        }
        Err(e) => admin_error(&e),
    }
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
) -> Response {
    match state.pool.store().delete(id).await {
        Ok(()) => success::<()>("account deleted", None),
        Err(e) => admin_error(&e),
    }
}

async fn replace_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AccountId>,
    Json(update): Json<TokenUpdate>,
) -> Response {
    let token = update.token.trim().to_string();
    if token.is_empty() {
        return admin_error(&GatewayError::invalid_request("token must not be empty"));
    }

    let store = state.pool.store();
    if let Err(e) = store.replace_token(id, token, update.expires_at).await {
        return admin_error(&e);
    }
    match store.get(id).await {
        Ok(Some(account)) => success("token refreshed", Some(AccountView::from(&account))),
        Ok(None) => admin_error(&GatewayError::AccountNotFound(id)),
        Err(e) => admin_error(&e),
    }
}

async fn recent_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    success("ok", Some(state.call_log.recent(limit)))
}

async fn clear_logs(State(state): State<Arc<AppState>>) -> Response {
    match state.call_log.clear() {
        Ok(()) => success::<()>("logs cleared", None),
        Err(e) => admin_error(&GatewayError::Io(e)),
    }
}

async fn stats(State(state): State<Arc<AppState>>) -> Response {
    match state.pool.store().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => admin_error(&e),
    }
}
