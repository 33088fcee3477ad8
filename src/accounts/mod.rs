//! Upstream accounts: credential records, the store they live in, and the
//! pool that hands them out to the dispatcher.

mod pool;
mod store;

pub use pool::{AccountPool, SelectionStrategy};
pub use store::{AccountStore, LocalAccountStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = u64;

/// How an account's token was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    #[default]
    Manual,
    Browser,
}

/// One upstream account and the bearer token that authorizes calls on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: AccountId,
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub token_source: TokenSource,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_refresh_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_calls: u64,
}

fn default_active() -> bool {
    true
}

/// Input for creating an account through the admin API.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAccount {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub token_source: TokenSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    pub total_accounts: usize,
    pub active_accounts: usize,
    pub inactive_accounts: usize,
    pub total_calls: u64,
}

impl Credential {
    /// Token with everything but the first few characters masked, for logs and
    /// admin listings.
    pub fn masked_token(&self) -> String {
        let visible: String = self.token.chars().take(8).collect();
        format!("{visible}...")
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
pub(crate) fn test_credential(id: AccountId, total_calls: u64, is_active: bool) -> Credential {
    Credential {
        id,
        name: format!("account-{id}"),
        token: format!("token-{id}"),
        token_source: TokenSource::Manual,
        is_active,
        created_at: Utc::now(),
        expires_at: None,
        last_used_at: None,
        last_refresh_at: None,
        total_calls,
    }
}
