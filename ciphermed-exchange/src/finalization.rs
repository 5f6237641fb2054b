use std::time::Duration;

use ciphermed_ledger::{
    accounts::ComputationStatus, ComputationClient, ComputationOffset, Signature,
};
use tracing::instrument;

use crate::error::{ExchangeError, Result};

/// How long to wait for a computation, and how often to look.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalizationPolicy {
    timeout: Duration,
    poll_interval: Duration,
}

impl FinalizationPolicy {
    #[must_use]
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Confirmation that a queued computation reached its finalized state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizationReceipt {
    pub offset: ComputationOffset,
    /// Signature of the callback transaction that finalized the computation
    pub signature: Signature,
    /// Number of computation account reads it took
    pub polls: u32,
}

/// Waits for a queued computation to be finalized by the cluster.
pub struct FinalizationAwaiter {
    client: ComputationClient,
    policy: FinalizationPolicy,
}

impl FinalizationAwaiter {
    #[must_use]
    pub const fn new(client: ComputationClient, policy: FinalizationPolicy) -> Self {
        Self { client, policy }
    }

    /// Polls the computation account until it is finalized or failed.
    ///
    /// Read errors and a not-yet-created account are retried until the
    /// policy's timeout.
    ///
    /// # Errors
    ///
    /// Returns `ExchangeError::ComputationFailed` if the cluster reports a
    /// failure and `ExchangeError::FinalizationTimeout` if the timeout elapses.
    #[instrument(level = "info", skip_all, fields(offset = %offset))]
    pub async fn await_finalization(&self, offset: ComputationOffset) -> Result<FinalizationReceipt> {
        let mut polls = 0u32;
        let outcome = tokio::time::timeout(self.policy.timeout, async {
            loop {
                polls += 1;
                match self.client.computation_account(offset).await {
                    Ok(Some(account)) => match account.status {
                        ComputationStatus::Finalized { signature } => {
                            return Ok(signature);
                        }
                        ComputationStatus::Failed { reason } => {
                            return Err(ExchangeError::ComputationFailed { offset, reason });
                        }
                        status => {
                            tracing::trace!(
                                target = "ciphermed-exchange-finalization",
                                event = "computation_pending",
                                status = ?status,
                                "Computation not finalized yet"
                            );
                        }
                    },
                    Ok(None) => {
                        tracing::trace!(
                            target = "ciphermed-exchange-finalization",
                            event = "computation_account_missing",
                            "Computation account not created yet"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            target = "ciphermed-exchange-finalization",
                            event = "computation_account_read_error",
                            error = %e,
                            "Failed to read computation account, retrying"
                        );
                    }
                }
                tokio::time::sleep(self.policy.poll_interval).await;
            }
        })
        .await;

        match outcome {
            Ok(Ok(signature)) => {
                tracing::info!(
                    target = "ciphermed-exchange-finalization",
                    event = "computation_finalized",
                    signature = %signature,
                    polls = polls,
                    "Computation finalized"
                );
                Ok(FinalizationReceipt {
                    offset,
                    signature,
                    polls,
                })
            }
            Ok(Err(e)) => {
                tracing::error!(
                    target = "ciphermed-exchange-finalization",
                    event = "computation_failed",
                    error = %e,
                    "Computation failed"
                );
                Err(e)
            }
            Err(_) => {
                tracing::error!(
                    target = "ciphermed-exchange-finalization",
                    event = "finalization_timeout",
                    polls = polls,
                    "Computation not finalized in time"
                );
                Err(ExchangeError::FinalizationTimeout {
                    offset,
                    timeout: self.policy.timeout,
                    polls,
                })
            }
        }
    }
}
