//! On-ledger account layouts and the record program's instruction set.
//!
//! Every account payload and instruction body is CBOR encoded with
//! [`crate::types::to_cbor`].

use serde::{Deserialize, Serialize};

use crate::types::{Address, ComputationOffset, Signature};

/// Size of an encrypted field as stored on the ledger
pub const CIPHERTEXT_SIZE: usize = 32;

/// Size of a serialized X25519 public key
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of a cipher nonce
pub const NONCE_SIZE: usize = 16;

/// The execution environment account of a program, carrying the cluster's
/// long-lived X25519 public key once it has been published.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxeAccount {
    pub x25519_public_key: Option<[u8; X25519_PUBLIC_KEY_SIZE]>,
    pub cluster_offset: Option<u32>,
}

/// A registered computation definition (circuit).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationDefinitionAccount {
    pub name: String,
    pub offset: u32,
    /// Whether the circuit has been finalized and may be queued against
    pub finalized: bool,
}

/// Lifecycle of a queued computation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputationStatus {
    Queued,
    Executing,
    Finalized { signature: Signature },
    Failed { reason: String },
}

impl ComputationStatus {
    /// Returns `true` once the computation can no longer change state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized { .. } | Self::Failed { .. })
    }
}

/// The account tracking one queued computation, addressed by its offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationAccount {
    pub offset: ComputationOffset,
    pub definition_offset: u32,
    pub status: ComputationStatus,
}

/// Encrypted patient fields stored by their owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientDataAccount {
    pub owner: Address,
    pub ciphertexts: Vec<[u8; CIPHERTEXT_SIZE]>,
}

/// Instructions understood by the medical record program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordProgramInstruction {
    /// Creates the payer's encrypted patient record account
    StorePatientData {
        ciphertexts: Vec<[u8; CIPHERTEXT_SIZE]>,
    },
    /// Registers the computation definition; fails if it already exists
    InitComputationDefinition { name: String, offset: u32 },
    /// Marks a registered computation definition as ready to be queued
    FinalizeComputationDefinition { offset: u32 },
    /// Queues a re-encryption of the stored record towards `receiver`
    PrivateRecordLookup {
        computation_offset: ComputationOffset,
        receiver: [u8; X25519_PUBLIC_KEY_SIZE],
        receiver_nonce: [u8; NONCE_SIZE],
        sender_public_key: [u8; X25519_PUBLIC_KEY_SIZE],
        nonce: [u8; NONCE_SIZE],
    },
}

impl RecordProgramInstruction {
    /// Short name used in logs and rejection messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StorePatientData { .. } => "store_patient_data",
            Self::InitComputationDefinition { .. } => "init_computation_definition",
            Self::FinalizeComputationDefinition { .. } => "finalize_computation_definition",
            Self::PrivateRecordLookup { .. } => "private_record_lookup",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{from_cbor, to_cbor};

    #[test]
    fn test_terminal_statuses() {
        assert!(!ComputationStatus::Queued.is_terminal());
        assert!(!ComputationStatus::Executing.is_terminal());
        assert!(ComputationStatus::Finalized {
            signature: Signature::new("abc")
        }
        .is_terminal());
        assert!(ComputationStatus::Failed {
            reason: "aborted".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_instruction_encoding() {
        let instruction = RecordProgramInstruction::PrivateRecordLookup {
            computation_offset: ComputationOffset::new(42),
            receiver: [1; 32],
            receiver_nonce: [2; 16],
            sender_public_key: [3; 32],
            nonce: [4; 16],
        };
        let bytes = to_cbor(&instruction).unwrap();
        assert_eq!(
            from_cbor::<RecordProgramInstruction>(&bytes).unwrap(),
            instruction
        );
        assert_eq!(instruction.name(), "private_record_lookup");
    }

    #[test]
    fn test_unpublished_mxe_account_decodes() {
        let bytes = to_cbor(&MxeAccount::default()).unwrap();
        let account: MxeAccount = from_cbor(&bytes).unwrap();
        assert!(account.x25519_public_key.is_none());
    }
}
