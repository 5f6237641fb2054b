use std::{sync::Arc, time::Duration};

use ciphermed_ledger::{
    accounts::{MxeAccount, X25519_PUBLIC_KEY_SIZE},
    pda,
    types::{from_cbor, ProgramId},
    Address, Commitment, LedgerService,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{ExchangeError, Result};

/// Longest delay an exponential policy sleeps between two attempts
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(30);

/// How the delay grows between attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// The same delay after every failed attempt
    #[default]
    Fixed,
    /// The delay doubles after every failed attempt, up to [`MAX_BACKOFF_DELAY`]
    Exponential,
}

/// Bounds a retry loop: how many attempts, and how long to wait between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(20, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// A policy making at least one attempt: a `max_attempts` of `0` is
    /// raised to `1`. Configuration rejects `0` before a policy is built
    /// from it.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff,
        }
    }

    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, delay, Backoff::Fixed)
    }

    #[must_use]
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self::new(max_attempts, initial_delay, Backoff::Exponential)
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay
                    .checked_mul(factor)
                    .map_or(MAX_BACKOFF_DELAY, |delay| delay.min(MAX_BACKOFF_DELAY))
            }
        }
    }
}

/// Looks up the cluster's X25519 public key, which may not be published yet
/// when a program has just been deployed.
pub struct PublicKeyResolver {
    ledger: Arc<dyn LedgerService>,
    commitment: Commitment,
    policy: RetryPolicy,
}

impl PublicKeyResolver {
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerService>, commitment: Commitment, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            commitment,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reads the program's MXE account until it carries a public key.
    ///
    /// Every failure (read error, missing or undecodable account, key not yet
    /// published) is retried. There is no sleep after the last attempt.
    ///
    /// # Errors
    ///
    /// Returns `ExchangeError::KeyUnavailable` once the policy's attempts are
    /// exhausted, carrying the last failure.
    #[instrument(level = "info", skip_all, fields(program_id = %program_id))]
    pub async fn resolve_public_key(
        &self,
        program_id: &ProgramId,
    ) -> Result<[u8; X25519_PUBLIC_KEY_SIZE]> {
        let address = pda::mxe_address(program_id);
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            match self.fetch_once(&address).await {
                Ok(public_key) => {
                    tracing::info!(
                        target = "ciphermed-exchange-resolver",
                        event = "mxe_public_key_resolved",
                        attempt = attempt,
                        "Resolved MXE public key"
                    );
                    return Ok(public_key);
                }
                Err(reason) => {
                    tracing::warn!(
                        target = "ciphermed-exchange-resolver",
                        event = "mxe_public_key_unavailable",
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts,
                        reason = %reason,
                        "MXE public key not available yet"
                    );
                    last_error = reason;
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }
        Err(ExchangeError::KeyUnavailable {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    async fn fetch_once(
        &self,
        address: &Address,
    ) -> std::result::Result<[u8; X25519_PUBLIC_KEY_SIZE], String> {
        let state = self
            .ledger
            .get_account_state(address, self.commitment)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "MXE account does not exist".to_string())?;
        let account: MxeAccount =
            from_cbor(&state).map_err(|e| format!("MXE account does not decode: {e}"))?;
        match account.x25519_public_key {
            Some(key) if key != [0; X25519_PUBLIC_KEY_SIZE] => Ok(key),
            _ => Err("MXE public key not published".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use ciphermed_ledger::{
        types::{to_cbor, Instruction},
        LedgerError, Signature,
    };
    use tokio::time::Instant;

    /// Publishes the MXE key on the `publish_on`-th read.
    struct SlowMxeLedger {
        reads: AtomicU32,
        publish_on: u32,
        key: [u8; 32],
        read_at: Mutex<Vec<Instant>>,
    }

    impl SlowMxeLedger {
        fn new(publish_on: u32) -> Self {
            Self {
                reads: AtomicU32::new(0),
                publish_on,
                key: [9; 32],
                read_at: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LedgerService for SlowMxeLedger {
        async fn submit_transaction(
            &self,
            _instructions: Vec<Instruction>,
            _signers: &[Address],
        ) -> std::result::Result<Signature, LedgerError> {
            Err(LedgerError::Rejected("read only".to_string()))
        }

        async fn get_account_state(
            &self,
            _address: &Address,
            _commitment: Commitment,
        ) -> std::result::Result<Option<Vec<u8>>, LedgerError> {
            self.read_at.lock().unwrap().push(Instant::now());
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            match read {
                1 => Err(LedgerError::Unavailable("connection refused".to_string())),
                2 => Ok(None),
                n if n < self.publish_on => Ok(Some(to_cbor(&MxeAccount::default()).unwrap())),
                _ => Ok(Some(
                    to_cbor(&MxeAccount {
                        x25519_public_key: Some(self.key),
                        cluster_offset: Some(1),
                    })
                    .unwrap(),
                )),
            }
        }
    }

    fn resolver(ledger: Arc<SlowMxeLedger>, policy: RetryPolicy) -> PublicKeyResolver {
        PublicKeyResolver::new(ledger, Commitment::Confirmed, policy)
    }

    #[test]
    fn test_policy_delays() {
        let fixed = RetryPolicy::default();
        assert_eq!(fixed.max_attempts(), 20);
        assert_eq!(fixed.delay_after(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_after(19), Duration::from_millis(500));

        let exponential = RetryPolicy::exponential(10, Duration::from_millis(100));
        assert_eq!(exponential.delay_after(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_after(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_after(4), Duration::from_millis(800));
        assert_eq!(exponential.delay_after(40), MAX_BACKOFF_DELAY);

        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_once_published() {
        let ledger = Arc::new(SlowMxeLedger::new(5));
        let start = Instant::now();
        let key = resolver(ledger.clone(), RetryPolicy::default())
            .resolve_public_key(&Address::from_label("program"))
            .await
            .unwrap();
        assert_eq!(key, [9; 32]);
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(4 * 500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let ledger = Arc::new(SlowMxeLedger::new(u32::MAX));
        let start = Instant::now();
        let result = resolver(ledger.clone(), RetryPolicy::fixed(4, Duration::from_millis(500)))
            .resolve_public_key(&Address::from_label("program"))
            .await;

        assert!(matches!(
            result,
            Err(ExchangeError::KeyUnavailable { attempts: 4, ref last_error })
                if last_error.contains("not published")
        ));
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 4);
        // three sleeps between four attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_millis(3 * 500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_spacing() {
        let ledger = Arc::new(SlowMxeLedger::new(4));
        resolver(
            ledger.clone(),
            RetryPolicy::exponential(10, Duration::from_millis(100)),
        )
        .resolve_public_key(&Address::from_label("program"))
        .await
        .unwrap();

        let read_at = ledger.read_at.lock().unwrap();
        let gaps: Vec<Duration> = read_at.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }
}
