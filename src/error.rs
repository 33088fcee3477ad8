//! Error types for the gateway.

use thiserror::Error;

use crate::accounts::AccountId;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// Connect failures and timeouts. The only transport errors worth retrying.
    #[error("Transient upstream error: {message}")]
    Transient { message: String },

    #[error("Upstream request failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("No available account")]
    NoAvailableAccount,

    #[error("All accounts failed ({attempts} attempts)")]
    AllAttemptsFailed { attempts: u32 },

    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Classify a reqwest failure: connect errors and timeouts are transient,
    /// everything else is surfaced as-is.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::transient(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether this error means the caller should come back later rather than
    /// fix their request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableAccount | Self::AllAttemptsFailed { .. }
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::AccountNotFound(_) => 404,
            Self::NoAvailableAccount | Self::AllAttemptsFailed { .. } => 503,
            Self::Upstream { .. }
            | Self::UpstreamStatus { .. }
            | Self::Transient { .. }
            | Self::RetriesExhausted { .. }
            | Self::Http(_) => 502,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
