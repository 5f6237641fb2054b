use std::{fmt, time::Duration};

use ciphermed_confidential::{EncryptionError, KeyManagementError, RecordError};
use ciphermed_ledger::{
    events::EventParseError, ComputationClientError, ComputationOffset,
};
use thiserror::Error;

use crate::result_channel::ResultChannelError;

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// The step of an exchange an error was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    KeyResolution,
    Initialization,
    Encryption,
    Storage,
    Submission,
    Finalization,
    ResultDelivery,
    Decryption,
}

impl Phase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::KeyResolution => "key_resolution",
            Self::Initialization => "initialization",
            Self::Encryption => "encryption",
            Self::Storage => "storage",
            Self::Submission => "submission",
            Self::Finalization => "finalization",
            Self::ResultDelivery => "result_delivery",
            Self::Decryption => "decryption",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a record exchange.
///
/// Cryptographic and schema errors are final; only key resolution and
/// finalization polling retry internally, and both report how often they did.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("[{phase}] Invalid key: `{source}`")]
    InvalidKey {
        phase: Phase,
        #[source]
        source: KeyManagementError,
    },
    #[error("[{phase}] Invalid input: {reason}")]
    InvalidInput { phase: Phase, reason: String },
    #[error("[decryption] Authentication failed for field `{field}` (block {index})")]
    AuthenticationFailure { field: &'static str, index: usize },
    #[error("[decryption] Corrupt data: {reason}")]
    CorruptData { reason: String },
    #[error("[key_resolution] Public key unavailable after {attempts} attempts, last error: {last_error}")]
    KeyUnavailable { attempts: u32, last_error: String },
    #[error("[{phase}] Instruction `{instruction}` rejected: {reason}")]
    SubmissionRejected {
        phase: Phase,
        instruction: &'static str,
        reason: String,
    },
    #[error("[finalization] Computation {offset} not finalized within {timeout:?} ({polls} polls)")]
    FinalizationTimeout {
        offset: ComputationOffset,
        timeout: Duration,
        polls: u32,
    },
    #[error("[finalization] Computation {offset} failed: {reason}")]
    ComputationFailed {
        offset: ComputationOffset,
        reason: String,
    },
    #[error("[result_delivery] No result received within {timeout:?}")]
    ResultTimeout { timeout: Duration },
    #[error("[result_delivery] Result channel closed before a result arrived")]
    ResultChannelClosed,
    #[error("[result_delivery] Result channel used out of order: `{0}`")]
    ResultChannelMisuse(#[source] ResultChannelError),
    #[error("[{phase}] Ledger error: {reason}")]
    Ledger { phase: Phase, reason: String },
    #[error("[result_delivery] Malformed result event: `{0}`")]
    MalformedEvent(#[from] EventParseError),
    #[error("[decryption] Decrypted fields do not form a record: `{0}`")]
    InvalidRecord(#[from] RecordError),
}

impl ExchangeError {
    /// The phase the error was raised in.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::InvalidKey { phase, .. }
            | Self::InvalidInput { phase, .. }
            | Self::SubmissionRejected { phase, .. }
            | Self::Ledger { phase, .. } => *phase,
            Self::KeyUnavailable { .. } => Phase::KeyResolution,
            Self::FinalizationTimeout { .. } | Self::ComputationFailed { .. } => {
                Phase::Finalization
            }
            Self::ResultTimeout { .. }
            | Self::ResultChannelClosed
            | Self::ResultChannelMisuse(_)
            | Self::MalformedEvent(_) => Phase::ResultDelivery,
            Self::AuthenticationFailure { .. }
            | Self::CorruptData { .. }
            | Self::InvalidRecord(_) => Phase::Decryption,
        }
    }

    pub(crate) const fn invalid_key(phase: Phase, source: KeyManagementError) -> Self {
        Self::InvalidKey { phase, source }
    }

    /// Maps a cipher error raised while encrypting or decrypting.
    pub(crate) fn cipher(phase: Phase, error: EncryptionError) -> Self {
        match error {
            EncryptionError::AuthenticationFailure { field, index } => {
                Self::AuthenticationFailure { field, index }
            }
            EncryptionError::CorruptData(reason) => Self::CorruptData { reason },
            EncryptionError::InvalidInput(e) => Self::InvalidInput {
                phase,
                reason: e.to_string(),
            },
            e @ (EncryptionError::EncryptionFailed(_) | EncryptionError::KeyExpansionFailed(_)) => {
                if phase == Phase::Decryption {
                    Self::CorruptData {
                        reason: e.to_string(),
                    }
                } else {
                    Self::InvalidInput {
                        phase,
                        reason: e.to_string(),
                    }
                }
            }
        }
    }

    /// Maps a submission or account read error.
    pub(crate) fn client(phase: Phase, error: ComputationClientError) -> Self {
        match error {
            ComputationClientError::SubmissionRejected {
                instruction,
                reason,
            } => Self::SubmissionRejected {
                phase,
                instruction,
                reason,
            },
            e @ (ComputationClientError::Ledger(_) | ComputationClientError::Codec(_)) => {
                Self::Ledger {
                    phase,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub(crate) fn result_channel(error: ResultChannelError) -> Self {
        match error {
            ResultChannelError::Timeout(timeout) => Self::ResultTimeout { timeout },
            ResultChannelError::Closed => Self::ResultChannelClosed,
            e @ (ResultChannelError::AlreadyConsumed
            | ResultChannelError::NotSubscribed
            | ResultChannelError::AlreadySubscribed) => Self::ResultChannelMisuse(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciphermed_confidential::SchemaError;
    use ciphermed_ledger::LedgerError;

    #[test]
    fn test_message_names_phase() {
        let error = ExchangeError::SubmissionRejected {
            phase: Phase::Submission,
            instruction: "private_record_lookup",
            reason: "offset in use".to_string(),
        };
        assert_eq!(error.phase(), Phase::Submission);
        assert!(error.to_string().starts_with("[submission]"));

        let error = ExchangeError::KeyUnavailable {
            attempts: 20,
            last_error: "not published".to_string(),
        };
        assert_eq!(error.phase(), Phase::KeyResolution);
        assert!(error.to_string().contains("20 attempts"));
    }

    #[test]
    fn test_cipher_errors_keep_their_kind() {
        let error = ExchangeError::cipher(
            Phase::Decryption,
            EncryptionError::AuthenticationFailure {
                field: "age",
                index: 1,
            },
        );
        assert!(matches!(
            error,
            ExchangeError::AuthenticationFailure { field: "age", .. }
        ));

        let error = ExchangeError::cipher(
            Phase::Encryption,
            EncryptionError::InvalidInput(SchemaError::FieldCount {
                schema: "patient_record",
                expected: 11,
                actual: 3,
            }),
        );
        assert_eq!(error.phase(), Phase::Encryption);
        assert!(matches!(error, ExchangeError::InvalidInput { .. }));
    }

    #[test]
    fn test_client_errors_take_caller_phase() {
        let error = ExchangeError::client(
            Phase::Storage,
            ComputationClientError::Ledger(LedgerError::Unavailable("down".to_string())),
        );
        assert_eq!(error.phase(), Phase::Storage);
        assert!(matches!(error, ExchangeError::Ledger { .. }));
    }

    #[test]
    fn test_result_timeout_maps_to_phase() {
        let error =
            ExchangeError::result_channel(ResultChannelError::Timeout(Duration::from_secs(1)));
        assert_eq!(error.phase(), Phase::ResultDelivery);
        assert!(matches!(error, ExchangeError::ResultTimeout { .. }));
    }

    #[test]
    fn test_result_channel_errors_stay_distinct() {
        assert!(matches!(
            ExchangeError::result_channel(ResultChannelError::Closed),
            ExchangeError::ResultChannelClosed
        ));

        let error = ExchangeError::result_channel(ResultChannelError::AlreadyConsumed);
        assert!(matches!(
            error,
            ExchangeError::ResultChannelMisuse(ResultChannelError::AlreadyConsumed)
        ));
        assert_eq!(error.phase(), Phase::ResultDelivery);
        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), ResultChannelError::AlreadyConsumed.to_string());

        assert!(matches!(
            ExchangeError::result_channel(ResultChannelError::NotSubscribed),
            ExchangeError::ResultChannelMisuse(ResultChannelError::NotSubscribed)
        ));
        assert!(matches!(
            ExchangeError::result_channel(ResultChannelError::AlreadySubscribed),
            ExchangeError::ResultChannelMisuse(ResultChannelError::AlreadySubscribed)
        ));
    }
}
