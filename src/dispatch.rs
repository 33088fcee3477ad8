//! Dispatch loop: pick an account, call the upstream, fail over on rejection.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::accounts::{AccountId, AccountPool};
use crate::error::{GatewayError, Result};
use crate::logging::{CallLog, CallRecord, CallStatus};
use crate::translate::request::ChatRequest;
use crate::upstream::{DeltaStream, Reply, Upstream};

/// A completion that is under way: the upstream accepted the credential and
/// the reply is streaming.
pub struct Dispatched {
    pub deltas: DeltaStream,
    pub account_id: AccountId,
    pub account_name: String,
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatched")
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .finish_non_exhaustive()
    }
}

pub struct Dispatcher {
    pool: Arc<AccountPool>,
    upstream: Arc<dyn Upstream>,
    call_log: CallLog,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<AccountPool>,
        upstream: Arc<dyn Upstream>,
        call_log: CallLog,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            upstream,
            call_log,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    /// Run `request` against up to `max_attempts` selected accounts.
    ///
    /// Usage is recorded and a success entry logged before the stream is
    /// returned. A rejected credential or failed call logs an error entry and
    /// moves on to the next selection. A reply that breaks off mid-stream
    /// adds an error entry too, without touching the account.
    pub async fn dispatch(&self, request: &ChatRequest) -> Result<Dispatched> {
        for attempt in 1..=self.max_attempts {
            let Some(credential) = self.pool.select().await? else {
                tracing::warn!(attempt, "No account available for dispatch");
                return Err(GatewayError::NoAvailableAccount);
            };

            let started = Instant::now();
            let outcome = self.upstream.complete(request, &credential).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let failure = match outcome {
                Ok(Some(reply)) => {
                    if let Err(e) = self.pool.record_success(credential.id).await {
                        tracing::warn!(
                            account_id = credential.id,
                            error = %e,
                            "Failed to record usage"
                        );
                    }
                    self.call_log.record(
                        &credential.name,
                        &request.model,
                        CallStatus::Success,
                        elapsed_ms,
                    );
                    tracing::info!(
                        account = %credential.name,
                        model = %request.model,
                        attempt,
                        elapsed_ms,
                        "Dispatch succeeded"
                    );
                    return Ok(Dispatched {
                        deltas: self.watch(reply, &credential.name, &request.model, started),
                        account_id: credential.id,
                        account_name: credential.name,
                    });
                }
                Ok(None) => "credential rejected by upstream".to_string(),
                Err(e) => e.to_string(),
            };

            self.call_log.log(
                CallRecord::new(&credential.name, &request.model, CallStatus::Error, elapsed_ms)
                    .with_message(failure.clone()),
            );
            self.pool.record_failure(credential.id, &failure);
        }

        Err(GatewayError::AllAttemptsFailed {
            attempts: self.max_attempts,
        })
    }

    /// Pass the reply's deltas through, logging an interruption as soon as
    /// the upstream reports one.
    fn watch(&self, reply: Reply, account: &str, model: &str, started: Instant) -> DeltaStream {
        let call_log = self.call_log.clone();
        let account = account.to_string();
        let model = model.to_string();
        let Reply {
            mut deltas,
            interrupted,
        } = reply;

        Box::pin(async_stream::stream! {
            let mut interrupted = Some(interrupted);
            while let Some(delta) = deltas.next().await {
                if let Some(reason) = interrupted.as_mut().and_then(|rx| rx.try_recv().ok()) {
                    interrupted = None;
                    let elapsed_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(%account, %model, %reason, "Upstream reply interrupted");
                    call_log.log(
                        CallRecord::new(&account, &model, CallStatus::Error, elapsed_ms)
                            .with_message(format!("interrupted mid-stream: {reason}")),
                    );
                }
                yield delta;
            }
        })
    }
}
