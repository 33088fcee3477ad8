use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{AccountId, AccountStore, Credential};
use crate::error::{GatewayError, Result};

/// How the pool picks the next account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::Random => "random",
            SelectionStrategy::LeastUsed => "least_used",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "random" => Ok(SelectionStrategy::Random),
            "least_used" => Ok(SelectionStrategy::LeastUsed),
            other => Err(GatewayError::config(format!(
                "Unknown selection strategy '{other}'. Expected round_robin, random or least_used"
            ))),
        }
    }
}

/// Hands out active accounts under a selection strategy.
///
/// Every selection runs under one async mutex so that concurrent dispatches
/// observe and advance the round-robin cursor one at a time.
pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    strategy: SelectionStrategy,
    cursor: Mutex<Option<AccountId>>,
}

impl AccountPool {
    pub fn new(store: Arc<dyn AccountStore>, strategy: SelectionStrategy) -> Self {
        Self {
            store,
            strategy,
            cursor: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Pick the next usable account under the pool's strategy.
    /// `None` means the active set is empty.
    pub async fn select(&self) -> Result<Option<Credential>> {
        self.select_with(self.strategy).await
    }

    pub async fn select_with(&self, strategy: SelectionStrategy) -> Result<Option<Credential>> {
        let mut cursor = self.cursor.lock().await;
        let active = self.store.list_active().await?;

        let picked = match strategy {
            SelectionStrategy::RoundRobin => {
                let index = pick_round_robin(&active, *cursor);
                if let Some(i) = index {
                    *cursor = Some(active[i].id);
                }
                index
            }
            SelectionStrategy::Random => pick_random(&active),
            SelectionStrategy::LeastUsed => pick_least_used(&active),
        };

        let credential = picked.map(|i| active[i].clone());
        match credential {
            Some(ref c) => tracing::debug!(account_id = c.id, %strategy, "Account selected"),
            None => tracing::warn!(%strategy, "No active account to select"),
        }
        Ok(credential)
    }

    pub async fn record_success(&self, id: AccountId) -> Result<()> {
        let _cursor = self.cursor.lock().await;
        self.store.record_usage(id, Utc::now()).await
    }

    /// Failures carry no persisted penalty: deactivation is left to whoever
    /// manages the account's token.
    pub fn record_failure(&self, id: AccountId, reason: &str) {
        tracing::warn!(account_id = id, reason, "Account attempt failed");
    }
}

/// First active id strictly above the cursor, wrapping to the smallest.
/// `active` must be ascending by id.
fn pick_round_robin(active: &[Credential], cursor: Option<AccountId>) -> Option<usize> {
    if active.is_empty() {
        return None;
    }
    let next = cursor.and_then(|last| active.iter().position(|a| a.id > last));
    Some(next.unwrap_or(0))
}

fn pick_random(active: &[Credential]) -> Option<usize> {
    if active.is_empty() {
        return None;
    }
    Some(rand::thread_rng().gen_range(0..active.len()))
}

/// Smallest `total_calls`, ties going to the smallest id.
fn pick_least_used(active: &[Credential]) -> Option<usize> {
    active
        .iter()
        .enumerate()
        .min_by_key(|(_, a)| (a.total_calls, a.id))
        .map(|(i, _)| i)
}
