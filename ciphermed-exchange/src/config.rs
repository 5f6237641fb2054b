use std::{path::Path, time::Duration};

use ciphermed_ledger::{types::ProgramId, Commitment};
use config::Config as RustConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::Backoff;

/// Environment variable consulted when no cluster offset is configured.
pub const CLUSTER_OFFSET_ENV_VAR: &str = "CIPHERMED_CLUSTER_OFFSET";

const DEFAULT_KEY_RESOLUTION_MAX_ATTEMPTS: u32 = 20;
const DEFAULT_KEY_RESOLUTION_DELAY_MS: u64 = 500;
const DEFAULT_FINALIZATION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_FINALIZATION_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RESULT_TIMEOUT_MS: u64 = 120_000;

/// Configuration for a record exchange client.
///
/// Loaded from the `[ciphermed]` section of a TOML file, with every key
/// overridable from the environment as `CIPHERMED__<KEY>`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExchangeConfig {
    /// The medical record program
    program_id: ProgramId,

    /// Cluster the computations are queued on. Falls back to
    /// `CIPHERMED_CLUSTER_OFFSET` when unset.
    #[serde(default)]
    cluster_offset: Option<u32>,

    /// Commitment level for account reads
    #[serde(default)]
    commitment: Commitment,

    /// Number of reads of the MXE account before giving up on its public key
    #[serde(default = "default_key_resolution_max_attempts")]
    key_resolution_max_attempts: u32,

    /// Delay between MXE account reads, in milliseconds
    #[serde(default = "default_key_resolution_delay_ms")]
    key_resolution_delay_ms: u64,

    #[serde(default)]
    key_resolution_backoff: Backoff,

    /// Upper bound on waiting for a queued computation, in milliseconds
    #[serde(default = "default_finalization_timeout_ms")]
    finalization_timeout_ms: u64,

    /// Delay between computation account reads, in milliseconds
    #[serde(default = "default_finalization_poll_interval_ms")]
    finalization_poll_interval_ms: u64,

    /// Upper bound on waiting for the result event, in milliseconds
    #[serde(default = "default_result_timeout_ms")]
    result_timeout_ms: u64,
}

const fn default_key_resolution_max_attempts() -> u32 {
    DEFAULT_KEY_RESOLUTION_MAX_ATTEMPTS
}

const fn default_key_resolution_delay_ms() -> u64 {
    DEFAULT_KEY_RESOLUTION_DELAY_MS
}

const fn default_finalization_timeout_ms() -> u64 {
    DEFAULT_FINALIZATION_TIMEOUT_MS
}

const fn default_finalization_poll_interval_ms() -> u64 {
    DEFAULT_FINALIZATION_POLL_INTERVAL_MS
}

const fn default_result_timeout_ms() -> u64 {
    DEFAULT_RESULT_TIMEOUT_MS
}

impl ExchangeConfig {
    #[must_use]
    pub const fn program_id(&self) -> ProgramId {
        self.program_id
    }

    /// The configured cluster offset, without the environment fallback.
    #[must_use]
    pub const fn cluster_offset(&self) -> Option<u32> {
        self.cluster_offset
    }

    /// Resolves the cluster offset: the configured value, or else the
    /// `CIPHERMED_CLUSTER_OFFSET` environment variable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingClusterOffset` when neither is set and
    /// `ConfigError::InvalidClusterOffset` when the variable is not a `u32`.
    pub fn resolve_cluster_offset(&self) -> Result<u32, ConfigError> {
        if let Some(offset) = self.cluster_offset {
            return Ok(offset);
        }
        let value = std::env::var(CLUSTER_OFFSET_ENV_VAR)
            .map_err(|_| ConfigError::MissingClusterOffset)?;
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidClusterOffset(value))
    }

    #[must_use]
    pub const fn commitment(&self) -> Commitment {
        self.commitment
    }

    #[must_use]
    pub const fn key_resolution_max_attempts(&self) -> u32 {
        self.key_resolution_max_attempts
    }

    #[must_use]
    pub const fn key_resolution_delay(&self) -> Duration {
        Duration::from_millis(self.key_resolution_delay_ms)
    }

    #[must_use]
    pub const fn key_resolution_backoff(&self) -> Backoff {
        self.key_resolution_backoff
    }

    #[must_use]
    pub const fn finalization_timeout(&self) -> Duration {
        Duration::from_millis(self.finalization_timeout_ms)
    }

    #[must_use]
    pub const fn finalization_poll_interval(&self) -> Duration {
        Duration::from_millis(self.finalization_poll_interval_ms)
    }

    #[must_use]
    pub const fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    /// Loads the `[ciphermed]` section of a configuration file, applying
    /// `CIPHERMED__*` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` if the file cannot be read or a value does
    /// not deserialize.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let path = config_file_path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| ConfigError::InvalidPath(path.display().to_string()))?;
        let builder = RustConfig::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("CIPHERMED")
                    .keep_prefix(true)
                    .separator("__"),
            );
        let config = builder.build()?;
        let config = config.get::<Self>("ciphermed")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that deserialize fine but cannot drive an exchange.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if key resolution is configured
    /// with zero attempts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_resolution_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "key_resolution_max_attempts",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Builder pattern implementation for creating `ExchangeConfig` instances.
///
/// Only the program id is required; every other value falls back to the
/// same default a configuration file would get.
#[derive(Default)]
pub struct Builder {
    program_id: Option<ProgramId>,
    cluster_offset: Option<u32>,
    commitment: Option<Commitment>,
    key_resolution_max_attempts: Option<u32>,
    key_resolution_delay: Option<Duration>,
    key_resolution_backoff: Option<Backoff>,
    finalization_timeout: Option<Duration>,
    finalization_poll_interval: Option<Duration>,
    result_timeout: Option<Duration>,
}

impl Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            program_id: None,
            cluster_offset: None,
            commitment: None,
            key_resolution_max_attempts: None,
            key_resolution_delay: None,
            key_resolution_backoff: None,
            finalization_timeout: None,
            finalization_poll_interval: None,
            result_timeout: None,
        }
    }

    #[must_use]
    pub const fn program_id(mut self, program_id: ProgramId) -> Self {
        self.program_id = Some(program_id);
        self
    }

    #[must_use]
    pub const fn cluster_offset(mut self, cluster_offset: Option<u32>) -> Self {
        self.cluster_offset = cluster_offset;
        self
    }

    #[must_use]
    pub const fn commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = Some(commitment);
        self
    }

    #[must_use]
    pub const fn key_resolution_max_attempts(mut self, attempts: u32) -> Self {
        self.key_resolution_max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub const fn key_resolution_delay(mut self, delay: Duration) -> Self {
        self.key_resolution_delay = Some(delay);
        self
    }

    #[must_use]
    pub const fn key_resolution_backoff(mut self, backoff: Backoff) -> Self {
        self.key_resolution_backoff = Some(backoff);
        self
    }

    #[must_use]
    pub const fn finalization_timeout(mut self, timeout: Duration) -> Self {
        self.finalization_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn finalization_poll_interval(mut self, interval: Duration) -> Self {
        self.finalization_poll_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` if no program id was set and
    /// `ConfigError::InvalidValue` if a value fails [`ExchangeConfig::validate`].
    pub fn build(self) -> Result<ExchangeConfig, ConfigError> {
        let millis = |duration: Option<Duration>, default: u64| {
            duration.map_or(default, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        };
        let config = ExchangeConfig {
            program_id: self
                .program_id
                .ok_or(ConfigError::MissingField("program_id"))?,
            cluster_offset: self.cluster_offset,
            commitment: self.commitment.unwrap_or_default(),
            key_resolution_max_attempts: self
                .key_resolution_max_attempts
                .unwrap_or(DEFAULT_KEY_RESOLUTION_MAX_ATTEMPTS),
            key_resolution_delay_ms: millis(
                self.key_resolution_delay,
                DEFAULT_KEY_RESOLUTION_DELAY_MS,
            ),
            key_resolution_backoff: self.key_resolution_backoff.unwrap_or_default(),
            finalization_timeout_ms: millis(
                self.finalization_timeout,
                DEFAULT_FINALIZATION_TIMEOUT_MS,
            ),
            finalization_poll_interval_ms: millis(
                self.finalization_poll_interval,
                DEFAULT_FINALIZATION_POLL_INTERVAL_MS,
            ),
            result_timeout_ms: millis(self.result_timeout, DEFAULT_RESULT_TIMEOUT_MS),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: `{0}`")]
    Load(#[from] config::ConfigError),
    #[error("Configuration path is not valid UTF-8: `{0}`")]
    InvalidPath(String),
    #[error("Missing required configuration value `{0}`")]
    MissingField(&'static str),
    #[error("Invalid configuration value `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("No cluster offset configured and `{CLUSTER_OFFSET_ENV_VAR}` is not set")]
    MissingClusterOffset,
    #[error("`{CLUSTER_OFFSET_ENV_VAR}` is not a valid cluster offset: `{0}`")]
    InvalidClusterOffset(String),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ciphermed_ledger::Address;
    use serial_test::serial;

    use super::*;

    fn program_id() -> Address {
        Address::new([0x8d; 32])
    }

    #[test]
    fn test_builder_defaults() {
        let config = Builder::new().program_id(program_id()).build().unwrap();
        assert_eq!(config.key_resolution_max_attempts(), 20);
        assert_eq!(config.key_resolution_delay(), Duration::from_millis(500));
        assert_eq!(config.key_resolution_backoff(), Backoff::Fixed);
        assert_eq!(config.commitment(), Commitment::Confirmed);
        assert_eq!(config.result_timeout(), Duration::from_secs(120));
        assert_eq!(config.cluster_offset(), None);
    }

    #[test]
    fn test_builder_requires_program_id() {
        assert!(matches!(
            Builder::new().build(),
            Err(ConfigError::MissingField("program_id"))
        ));
    }

    #[test]
    fn test_rejects_zero_key_resolution_attempts() {
        let result = Builder::new()
            .program_id(program_id())
            .key_resolution_max_attempts(0)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                field: "key_resolution_max_attempts",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn test_from_file_path_rejects_zero_attempts() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[ciphermed]\nprogram_id = \"0x{}\"\nkey_resolution_max_attempts = 0\n",
            "8d".repeat(32)
        )
        .unwrap();

        assert!(matches!(
            ExchangeConfig::from_file_path(file.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_serializes_to_toml() {
        let config = Builder::new()
            .program_id(program_id())
            .cluster_offset(Some(7))
            .commitment(Commitment::Finalized)
            .key_resolution_max_attempts(5)
            .key_resolution_delay(Duration::from_millis(250))
            .finalization_timeout(Duration::from_secs(30))
            .finalization_poll_interval(Duration::from_millis(100))
            .result_timeout(Duration::from_secs(45))
            .build()
            .unwrap();

        let toml_str = toml::to_string(&config).unwrap();
        let should_be_toml_str = format!(
            "program_id = \"0x{}\"\ncluster_offset = 7\ncommitment = \"finalized\"\nkey_resolution_max_attempts = 5\nkey_resolution_delay_ms = 250\nkey_resolution_backoff = \"fixed\"\nfinalization_timeout_ms = 30000\nfinalization_poll_interval_ms = 100\nresult_timeout_ms = 45000\n",
            "8d".repeat(32)
        );
        assert_eq!(toml_str, should_be_toml_str);
    }

    #[test]
    #[serial]
    fn test_cluster_offset_falls_back_to_env() {
        let config = Builder::new().program_id(program_id()).build().unwrap();

        std::env::remove_var(CLUSTER_OFFSET_ENV_VAR);
        assert!(matches!(
            config.resolve_cluster_offset(),
            Err(ConfigError::MissingClusterOffset)
        ));

        std::env::set_var(CLUSTER_OFFSET_ENV_VAR, "1116522165");
        assert_eq!(config.resolve_cluster_offset().unwrap(), 1_116_522_165);

        std::env::set_var(CLUSTER_OFFSET_ENV_VAR, "not-a-number");
        assert!(matches!(
            config.resolve_cluster_offset(),
            Err(ConfigError::InvalidClusterOffset(_))
        ));
        std::env::remove_var(CLUSTER_OFFSET_ENV_VAR);

        let explicit = Builder::new()
            .program_id(program_id())
            .cluster_offset(Some(3))
            .build()
            .unwrap();
        assert_eq!(explicit.resolve_cluster_offset().unwrap(), 3);
    }

    #[test]
    #[serial]
    fn test_from_file_path_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[ciphermed]\nprogram_id = \"0x{}\"\ncluster_offset = 11\nresult_timeout_ms = 5000\n",
            "8d".repeat(32)
        )
        .unwrap();

        std::env::set_var("CIPHERMED__KEY_RESOLUTION_MAX_ATTEMPTS", "3");
        let config = ExchangeConfig::from_file_path(file.path()).unwrap();
        std::env::remove_var("CIPHERMED__KEY_RESOLUTION_MAX_ATTEMPTS");

        assert_eq!(config.program_id(), program_id());
        assert_eq!(config.cluster_offset(), Some(11));
        assert_eq!(config.result_timeout(), Duration::from_secs(5));
        assert_eq!(config.key_resolution_max_attempts(), 3);
        assert_eq!(config.finalization_poll_interval(), Duration::from_millis(500));
    }
}
