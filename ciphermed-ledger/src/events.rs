use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::{
    accounts::{CIPHERTEXT_SIZE, NONCE_SIZE},
    types::{from_cbor, to_cbor, Address, CodecError, ComputationOffset},
};

pub type Result<T> = std::result::Result<T, EventParseError>;

/// Number of encrypted fields carried by a record lookup result
pub const RECORD_LOOKUP_FIELD_COUNT: usize = 11;

/// Number of allergy ciphertexts in a record lookup result
const ALLERGY_FIELD_COUNT: usize = 5;

/// Identifies the events emitted by the medical record program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum LedgerEventIdentifier {
    /// Emitted when an owner stores their encrypted record.
    PatientDataStoredEvent,
    /// Emitted when a computation is accepted into the cluster mempool.
    ComputationQueuedEvent,
    /// Emitted by the cluster callback once a stored record has been
    /// re-encrypted for the requested receiver.
    ReceivedPrivateRecordLookupEvent,
}

impl LedgerEventIdentifier {
    /// The event name as it appears on the event bus.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PatientDataStoredEvent => "PatientDataStoredEvent",
            Self::ComputationQueuedEvent => "ComputationQueuedEvent",
            Self::ReceivedPrivateRecordLookupEvent => "ReceivedPrivateRecordLookupEvent",
        }
    }
}

impl FromStr for LedgerEventIdentifier {
    type Err = EventParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PatientDataStoredEvent" => Ok(Self::PatientDataStoredEvent),
            "ComputationQueuedEvent" => Ok(Self::ComputationQueuedEvent),
            "ReceivedPrivateRecordLookupEvent" => Ok(Self::ReceivedPrivateRecordLookupEvent),
            _ => Err(EventParseError::UnknownEvent(s.to_string())),
        }
    }
}

impl std::fmt::Display for LedgerEventIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw event as delivered by the event bus: its name and CBOR payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub name: String,
    pub data: Vec<u8>,
}

impl LedgerEvent {
    /// Encodes `payload` under the given event name.
    ///
    /// # Errors
    ///
    /// Returns `EventParseError::Codec` if the payload cannot be encoded.
    pub fn new<T: Serialize>(identifier: LedgerEventIdentifier, payload: &T) -> Result<Self> {
        Ok(Self {
            name: identifier.as_str().to_string(),
            data: to_cbor(payload)?,
        })
    }

    /// Parses the event name.
    ///
    /// # Errors
    ///
    /// Returns `EventParseError::UnknownEvent` for names this program does not emit.
    pub fn identifier(&self) -> Result<LedgerEventIdentifier> {
        self.name.parse()
    }
}

/// Payload of [`LedgerEventIdentifier::PatientDataStoredEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientDataStoredEvent {
    pub owner: Address,
    pub account: Address,
}

/// Payload of [`LedgerEventIdentifier::ComputationQueuedEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationQueuedEvent {
    pub offset: ComputationOffset,
    pub computation_account: Address,
}

/// Payload of [`LedgerEventIdentifier::ReceivedPrivateRecordLookupEvent`].
///
/// The event carries no computation offset: it is matched to its request by
/// the single listener that was subscribed when the request was queued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedPrivateRecordLookupEvent {
    /// Nonce the cluster encrypted the output under
    pub nonce: [u8; NONCE_SIZE],
    pub patient_id: [u8; CIPHERTEXT_SIZE],
    pub age: [u8; CIPHERTEXT_SIZE],
    pub gender: [u8; CIPHERTEXT_SIZE],
    pub blood_type: [u8; CIPHERTEXT_SIZE],
    pub weight: [u8; CIPHERTEXT_SIZE],
    pub height: [u8; CIPHERTEXT_SIZE],
    pub allergies: [[u8; CIPHERTEXT_SIZE]; ALLERGY_FIELD_COUNT],
}

impl ReceivedPrivateRecordLookupEvent {
    /// Builds the event from record-ordered ciphertexts.
    ///
    /// # Errors
    ///
    /// Returns `EventParseError::FieldCount` unless exactly
    /// [`RECORD_LOOKUP_FIELD_COUNT`] ciphertexts are given.
    pub fn from_ciphertexts(
        nonce: [u8; NONCE_SIZE],
        ciphertexts: &[[u8; CIPHERTEXT_SIZE]],
    ) -> Result<Self> {
        let [patient_id, age, gender, blood_type, weight, height, a0, a1, a2, a3, a4] =
            <[[u8; CIPHERTEXT_SIZE]; RECORD_LOOKUP_FIELD_COUNT]>::try_from(ciphertexts).map_err(
                |_| EventParseError::FieldCount {
                    expected: RECORD_LOOKUP_FIELD_COUNT,
                    actual: ciphertexts.len(),
                },
            )?;
        Ok(Self {
            nonce,
            patient_id,
            age,
            gender,
            blood_type,
            weight,
            height,
            allergies: [a0, a1, a2, a3, a4],
        })
    }

    /// The ciphertexts in record field order.
    #[must_use]
    pub fn ciphertexts(&self) -> Vec<[u8; CIPHERTEXT_SIZE]> {
        let mut ciphertexts = vec![
            self.patient_id,
            self.age,
            self.gender,
            self.blood_type,
            self.weight,
            self.height,
        ];
        ciphertexts.extend_from_slice(&self.allergies);
        ciphertexts
    }
}

impl TryFrom<&LedgerEvent> for ReceivedPrivateRecordLookupEvent {
    type Error = EventParseError;

    fn try_from(event: &LedgerEvent) -> Result<Self> {
        let identifier = event.identifier()?;
        if identifier != LedgerEventIdentifier::ReceivedPrivateRecordLookupEvent {
            return Err(EventParseError::UnexpectedEvent {
                expected: LedgerEventIdentifier::ReceivedPrivateRecordLookupEvent,
                actual: identifier,
            });
        }
        Ok(from_cbor(&event.data)?)
    }
}

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("Unknown event: `{0}`")]
    UnknownEvent(String),
    #[error("Expected event `{expected}`, got `{actual}`")]
    UnexpectedEvent {
        expected: LedgerEventIdentifier,
        actual: LedgerEventIdentifier,
    },
    #[error("Expected {expected} ciphertexts, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("Malformed event payload: `{0}`")]
    Codec(#[from] CodecError),
}
