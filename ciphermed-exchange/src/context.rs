use std::sync::Arc;

use ciphermed_ledger::{Address, ComputationClient, EventBus, LedgerService};

use crate::{
    config::{ConfigError, ExchangeConfig},
    finalization::{FinalizationAwaiter, FinalizationPolicy},
    resolver::{PublicKeyResolver, RetryPolicy},
};

/// Everything an exchange needs from its environment, passed explicitly
/// rather than read from process-wide state.
#[derive(Clone)]
pub struct ProtocolContext {
    ledger: Arc<dyn LedgerService>,
    events: Arc<dyn EventBus>,
    config: ExchangeConfig,
    cluster_offset: u32,
}

impl ProtocolContext {
    /// Builds a context, resolving the cluster offset from the configuration
    /// or the `CIPHERMED_CLUSTER_OFFSET` environment variable.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no valid cluster offset is available.
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        events: Arc<dyn EventBus>,
        config: ExchangeConfig,
    ) -> Result<Self, ConfigError> {
        let cluster_offset = config.resolve_cluster_offset()?;
        Ok(Self {
            ledger,
            events,
            config,
            cluster_offset,
        })
    }

    #[must_use]
    pub fn ledger(&self) -> Arc<dyn LedgerService> {
        Arc::clone(&self.ledger)
    }

    #[must_use]
    pub fn events(&self) -> Arc<dyn EventBus> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub const fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    #[must_use]
    pub const fn cluster_offset(&self) -> u32 {
        self.cluster_offset
    }

    /// A computation client submitting on behalf of `payer`.
    #[must_use]
    pub fn computation_client(&self, payer: Address) -> ComputationClient {
        ComputationClient::new(
            self.ledger(),
            self.config.program_id(),
            self.cluster_offset,
            payer,
        )
        .with_commitment(self.config.commitment())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.key_resolution_max_attempts(),
            self.config.key_resolution_delay(),
            self.config.key_resolution_backoff(),
        )
    }

    #[must_use]
    pub fn public_key_resolver(&self) -> PublicKeyResolver {
        PublicKeyResolver::new(self.ledger(), self.config.commitment(), self.retry_policy())
    }

    #[must_use]
    pub fn finalization_awaiter(&self, client: ComputationClient) -> FinalizationAwaiter {
        FinalizationAwaiter::new(
            client,
            FinalizationPolicy::new(
                self.config.finalization_timeout(),
                self.config.finalization_poll_interval(),
            ),
        )
    }
}
