use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{AccountId, AccountStats, Credential, NewAccount};
use crate::error::{GatewayError, Result};

/// Keyed record store backing the account pool.
///
/// The pool only needs the first four operations; the rest serve the admin
/// API and the token refresher.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Active accounts, ascending by id.
    async fn list_active(&self) -> Result<Vec<Credential>>;

    async fn get(&self, id: AccountId) -> Result<Option<Credential>>;

    /// Bump `total_calls` and stamp `last_used_at`.
    async fn record_usage(&self, id: AccountId, at: DateTime<Utc>) -> Result<()>;

    /// Install a refreshed token. Reactivates the account.
    async fn replace_token(
        &self,
        id: AccountId,
        token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// All accounts, ascending by id.
    async fn list_all(&self) -> Result<Vec<Credential>>;

    async fn insert(&self, account: NewAccount) -> Result<Credential>;

    async fn set_active(&self, id: AccountId, active: bool) -> Result<()>;

    async fn delete(&self, id: AccountId) -> Result<()>;

    async fn stats(&self) -> Result<AccountStats> {
        let all = self.list_all().await?;
        let active_accounts = all.iter().filter(|a| a.is_active).count();
        Ok(AccountStats {
            total_accounts: all.len(),
            active_accounts,
            inactive_accounts: all.len() - active_accounts,
            total_calls: all.iter().map(|a| a.total_calls).sum(),
        })
    }
}

/// In-memory account store, optionally mirrored to a JSON file after every
/// mutation.
pub struct LocalAccountStore {
    accounts: RwLock<Vec<Credential>>,
    file_path: Option<PathBuf>,
    token_valid_for: Duration,
}

impl LocalAccountStore {
    pub fn in_memory(token_valid_hours: i64) -> Self {
        Self::with_accounts(Vec::new(), token_valid_hours)
    }

    pub fn with_accounts(mut accounts: Vec<Credential>, token_valid_hours: i64) -> Self {
        accounts.sort_by_key(|a| a.id);
        Self {
            accounts: RwLock::new(accounts),
            file_path: None,
            token_valid_for: Duration::hours(token_valid_hours),
        }
    }

    /// Open (or create on first write) a JSON-backed store.
    pub fn open(path: impl AsRef<Path>, token_valid_hours: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let accounts = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };

        let mut store = Self::with_accounts(accounts, token_valid_hours);
        store.file_path = Some(path);
        Ok(store)
    }

    async fn persist(&self, accounts: &[Credential]) -> Result<()> {
        let Some(ref path) = self.file_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(accounts)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn update<F>(&self, id: AccountId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Credential) + Send,
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(GatewayError::AccountNotFound(id))?;
        f(account);
        self.persist(&accounts).await
    }
}

#[async_trait]
impl AccountStore for LocalAccountStore {
    async fn list_active(&self) -> Result<Vec<Credential>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.iter().filter(|a| a.is_active).cloned().collect())
    }

    async fn get(&self, id: AccountId) -> Result<Option<Credential>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn record_usage(&self, id: AccountId, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |account| {
            account.total_calls += 1;
            account.last_used_at = Some(at);
        })
        .await
    }

    async fn replace_token(
        &self,
        id: AccountId,
        token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = expires_at.unwrap_or(now + self.token_valid_for);
        self.update(id, move |account| {
            account.token = token;
            account.expires_at = Some(expires_at);
            account.last_refresh_at = Some(now);
            account.is_active = true;
        })
        .await?;
        tracing::info!(account_id = id, "Token replaced");
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Credential>> {
        Ok(self.accounts.read().await.clone())
    }

    async fn insert(&self, account: NewAccount) -> Result<Credential> {
        let name = account.name.trim().to_string();
        if name.is_empty() {
            return Err(GatewayError::invalid_request("account name must not be empty"));
        }
        if account.token.trim().is_empty() {
            return Err(GatewayError::invalid_request("account token must not be empty"));
        }

        let mut accounts = self.accounts.write().await;
        if accounts.iter().any(|a| a.name == name) {
            return Err(GatewayError::invalid_request(format!(
                "account name '{name}' already exists"
            )));
        }

        let now = Utc::now();
        let credential = Credential {
            id: accounts.iter().map(|a| a.id).max().unwrap_or(0) + 1,
            name,
            token: account.token.trim().to_string(),
            token_source: account.token_source,
            is_active: true,
            created_at: now,
            expires_at: Some(now + self.token_valid_for),
            last_used_at: None,
            last_refresh_at: None,
            total_calls: 0,
        };
        accounts.push(credential.clone());
        self.persist(&accounts).await?;

        tracing::info!(account_id = credential.id, name = %credential.name, "Account created");
        Ok(credential)
    }

    async fn set_active(&self, id: AccountId, active: bool) -> Result<()> {
        self.update(id, |account| account.is_active = active).await?;
        tracing::info!(account_id = id, active, "Account activation changed");
        Ok(())
    }

    async fn delete(&self, id: AccountId) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let before = accounts.len();
        accounts.retain(|a| a.id != id);
        if accounts.len() == before {
            return Err(GatewayError::AccountNotFound(id));
        }
        self.persist(&accounts).await?;
        tracing::info!(account_id = id, "Account deleted");
        Ok(())
    }
}
