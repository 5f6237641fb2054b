use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::{
    accounts::{
        ComputationAccount, ComputationDefinitionAccount, RecordProgramInstruction,
        CIPHERTEXT_SIZE, NONCE_SIZE, X25519_PUBLIC_KEY_SIZE,
    },
    ledger::{LedgerError, LedgerService},
    pda,
    types::{
        from_cbor, to_cbor, AccountMeta, Address, CodecError, Commitment, ComputationOffset,
        Instruction, ProgramId, Signature,
    },
};

pub type Result<T> = std::result::Result<T, ComputationClientError>;

/// Arguments of a private record lookup: who the output is for and how the
/// stored record was encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateRecordLookupRequest {
    pub offset: ComputationOffset,
    /// X25519 public key the cluster re-encrypts the record towards
    pub receiver_public_key: [u8; X25519_PUBLIC_KEY_SIZE],
    /// Nonce the cluster encrypts the output under
    pub receiver_nonce: [u8; NONCE_SIZE],
    /// Public half of the key pair the stored record was encrypted with
    pub sender_public_key: [u8; X25519_PUBLIC_KEY_SIZE],
    /// Nonce the stored record was encrypted under
    pub sender_nonce: [u8; NONCE_SIZE],
}

/// Proof that a computation was accepted into the cluster mempool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub offset: ComputationOffset,
    pub signature: Signature,
    pub computation_address: Address,
}

/// Builds and submits the medical record program's instructions.
///
/// Rejections are reported, never retried: re-submitting a queued
/// computation with a fresh offset is the caller's decision.
#[derive(Clone)]
pub struct ComputationClient {
    ledger: Arc<dyn LedgerService>,
    program_id: ProgramId,
    cluster_offset: u32,
    payer: Address,
    commitment: Commitment,
}

impl ComputationClient {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        program_id: ProgramId,
        cluster_offset: u32,
        payer: Address,
    ) -> Self {
        Self {
            ledger,
            program_id,
            cluster_offset,
            payer,
            commitment: Commitment::default(),
        }
    }

    /// Sets the commitment level used for account reads.
    #[must_use]
    pub const fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }

    #[must_use]
    pub const fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    #[must_use]
    pub const fn cluster_offset(&self) -> u32 {
        self.cluster_offset
    }

    #[must_use]
    pub const fn payer(&self) -> &Address {
        &self.payer
    }

    /// Address of the payer's encrypted record.
    #[must_use]
    pub fn record_address(&self) -> Address {
        pda::patient_data_address(&self.program_id, &self.payer)
    }

    /// Address of the computation account tracking `offset`.
    #[must_use]
    pub fn computation_address(&self, offset: ComputationOffset) -> Address {
        pda::computation_address(self.cluster_offset, offset)
    }

    /// Address of the lookup circuit's definition account.
    #[must_use]
    pub fn computation_definition_address(&self) -> Address {
        pda::computation_definition_address(&self.program_id, Self::definition_offset())
    }

    fn definition_offset() -> u32 {
        pda::computation_definition_offset(pda::PRIVATE_RECORD_LOOKUP)
    }

    /// Stores the encrypted record in a new record account owned by the payer.
    ///
    /// # Errors
    ///
    /// Returns `ComputationClientError::SubmissionRejected` if the payer
    /// already stored a record or the ledger refuses the transaction.
    #[instrument(level = "info", skip_all, fields(payer = %self.payer))]
    pub async fn store_record(&self, ciphertexts: Vec<[u8; CIPHERTEXT_SIZE]>) -> Result<Signature> {
        let accounts = vec![
            AccountMeta::writable(self.payer, true),
            AccountMeta::writable(self.record_address(), false),
        ];
        let instruction = RecordProgramInstruction::StorePatientData { ciphertexts };
        self.submit(&instruction, accounts).await
    }

    /// Registers the lookup circuit. The ledger rejects this when the
    /// definition already exists.
    ///
    /// # Errors
    ///
    /// Returns `ComputationClientError::SubmissionRejected` if the definition
    /// is already initialized or the ledger refuses the transaction.
    #[instrument(level = "info", skip_all, fields(payer = %self.payer))]
    pub async fn init_computation_definition(&self) -> Result<Signature> {
        let accounts = vec![
            AccountMeta::writable(self.payer, true),
            AccountMeta::writable(pda::mxe_address(&self.program_id), false),
            AccountMeta::writable(self.computation_definition_address(), false),
        ];
        let instruction = RecordProgramInstruction::InitComputationDefinition {
            name: pda::PRIVATE_RECORD_LOOKUP.to_string(),
            offset: Self::definition_offset(),
        };
        self.submit(&instruction, accounts).await
    }

    /// Marks the uploaded circuit as ready to be queued against.
    ///
    /// # Errors
    ///
    /// Returns `ComputationClientError::SubmissionRejected` if the definition
    /// does not exist.
    #[instrument(level = "info", skip_all, fields(payer = %self.payer))]
    pub async fn finalize_computation_definition(&self) -> Result<Signature> {
        let accounts = vec![
            AccountMeta::writable(self.payer, true),
            AccountMeta::writable(self.computation_definition_address(), false),
        ];
        let instruction = RecordProgramInstruction::FinalizeComputationDefinition {
            offset: Self::definition_offset(),
        };
        self.submit(&instruction, accounts).await
    }

    /// Reads the lookup circuit's definition account.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger is unavailable or the account does not decode.
    pub async fn computation_definition(&self) -> Result<Option<ComputationDefinitionAccount>> {
        self.read_account(&self.computation_definition_address())
            .await
    }

    /// Initializes and finalizes the lookup circuit only where needed, so it
    /// can be called before every exchange. Returns `true` if anything was
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns an error if a read fails or a needed submission is rejected.
    #[instrument(level = "info", skip_all, fields(payer = %self.payer))]
    pub async fn ensure_computation_definition(&self) -> Result<bool> {
        match self.computation_definition().await? {
            Some(definition) if definition.finalized => {
                tracing::debug!(
                    target = "ciphermed-ledger-client",
                    event = "computation_definition_ready",
                    offset = definition.offset,
                    "Computation definition already initialized and finalized"
                );
                Ok(false)
            }
            Some(_) => {
                self.finalize_computation_definition().await?;
                Ok(true)
            }
            None => {
                self.init_computation_definition().await?;
                self.finalize_computation_definition().await?;
                Ok(true)
            }
        }
    }

    /// Queues a re-encryption of the payer's stored record towards the
    /// receiver key.
    ///
    /// # Errors
    ///
    /// Returns `ComputationClientError::SubmissionRejected` if the ledger
    /// refuses the computation (e.g. offset already used or circuit not
    /// finalized).
    #[instrument(level = "info", skip_all, fields(payer = %self.payer, offset = %request.offset))]
    pub async fn queue_computation(
        &self,
        request: &PrivateRecordLookupRequest,
    ) -> Result<SubmissionReceipt> {
        let computation_address = self.computation_address(request.offset);
        let accounts = vec![
            AccountMeta::writable(self.payer, true),
            AccountMeta::writable(pda::sign_pda_address(&self.program_id), false),
            AccountMeta::readonly(pda::mxe_address(&self.program_id)),
            AccountMeta::writable(pda::mempool_address(self.cluster_offset), false),
            AccountMeta::writable(pda::executing_pool_address(self.cluster_offset), false),
            AccountMeta::writable(computation_address, false),
            AccountMeta::readonly(self.computation_definition_address()),
            AccountMeta::writable(pda::cluster_address(self.cluster_offset), false),
            AccountMeta::readonly(self.record_address()),
        ];
        let instruction = RecordProgramInstruction::PrivateRecordLookup {
            computation_offset: request.offset,
            receiver: request.receiver_public_key,
            receiver_nonce: request.receiver_nonce,
            sender_public_key: request.sender_public_key,
            nonce: request.sender_nonce,
        };
        let signature = self.submit(&instruction, accounts).await?;
        Ok(SubmissionReceipt {
            offset: request.offset,
            signature,
            computation_address,
        })
    }

    /// Reads the computation account tracking `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger is unavailable or the account does not decode.
    pub async fn computation_account(
        &self,
        offset: ComputationOffset,
    ) -> Result<Option<ComputationAccount>> {
        self.read_account(&self.computation_address(offset)).await
    }

    async fn read_account<T: serde::de::DeserializeOwned>(
        &self,
        address: &Address,
    ) -> Result<Option<T>> {
        match self
            .ledger
            .get_account_state(address, self.commitment)
            .await?
        {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn submit(
        &self,
        instruction: &RecordProgramInstruction,
        accounts: Vec<AccountMeta>,
    ) -> Result<Signature> {
        let name = instruction.name();
        let instruction = Instruction {
            program_id: self.program_id,
            accounts,
            data: to_cbor(instruction)?,
        };
        match self
            .ledger
            .submit_transaction(vec![instruction], &[self.payer])
            .await
        {
            Ok(signature) => {
                tracing::info!(
                    target = "ciphermed-ledger-client",
                    event = "transaction_submitted",
                    instruction = name,
                    signature = %signature,
                    "Transaction submitted successfully"
                );
                Ok(signature)
            }
            Err(LedgerError::Rejected(reason)) => {
                tracing::error!(
                    target = "ciphermed-ledger-client",
                    event = "transaction_rejected",
                    instruction = name,
                    reason = %reason,
                    "Transaction rejected by the ledger"
                );
                Err(ComputationClientError::SubmissionRejected {
                    instruction: name,
                    reason,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ComputationClientError {
    #[error("Instruction `{instruction}` rejected: {reason}")]
    SubmissionRejected {
        instruction: &'static str,
        reason: String,
    },
    #[error("Ledger error: `{0}`")]
    Ledger(#[from] LedgerError),
    #[error("Codec error: `{0}`")]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Records submitted transactions and answers reads from a fixed account.
    #[derive(Default)]
    struct RecordingLedger {
        submitted: Mutex<Vec<Instruction>>,
        definition: Mutex<Option<ComputationDefinitionAccount>>,
        reject_with: Option<String>,
    }

    #[async_trait]
    impl LedgerService for RecordingLedger {
        async fn submit_transaction(
            &self,
            instructions: Vec<Instruction>,
            _signers: &[Address],
        ) -> std::result::Result<Signature, LedgerError> {
            if let Some(reason) = &self.reject_with {
                return Err(LedgerError::Rejected(reason.clone()));
            }
            let mut submitted = self.submitted.lock().unwrap();
            submitted.extend(instructions);
            Ok(Signature::new(format!("sig-{}", submitted.len())))
        }

        async fn get_account_state(
            &self,
            _address: &Address,
            _commitment: Commitment,
        ) -> std::result::Result<Option<Vec<u8>>, LedgerError> {
            let definition = self.definition.lock().unwrap().clone();
            Ok(definition.map(|d| to_cbor(&d).unwrap()))
        }
    }

    fn client(ledger: Arc<RecordingLedger>) -> ComputationClient {
        ComputationClient::new(
            ledger,
            Address::from_label("program"),
            3,
            Address::from_label("payer"),
        )
    }

    fn decode(instruction: &Instruction) -> RecordProgramInstruction {
        from_cbor(&instruction.data).unwrap()
    }

    #[tokio::test]
    async fn test_queue_computation_derives_accounts_from_offset() {
        let ledger = Arc::new(RecordingLedger::default());
        let client = client(ledger.clone());
        let request = PrivateRecordLookupRequest {
            offset: ComputationOffset::new(99),
            receiver_public_key: [1; 32],
            receiver_nonce: [2; 16],
            sender_public_key: [3; 32],
            sender_nonce: [4; 16],
        };
        let receipt = client.queue_computation(&request).await.unwrap();
        assert_eq!(receipt.offset, request.offset);
        assert_eq!(
            receipt.computation_address,
            pda::computation_address(3, ComputationOffset::new(99))
        );

        let submitted = ledger.submitted.lock().unwrap();
        let instruction = &submitted[0];
        assert!(instruction.accounts[0].is_signer);
        assert!(instruction
            .accounts
            .iter()
            .any(|meta| meta.address == receipt.computation_address && meta.is_writable));
        assert!(matches!(
            decode(instruction),
            RecordProgramInstruction::PrivateRecordLookup { receiver, nonce, .. }
                if receiver == [1; 32] && nonce == [4; 16]
        ));
    }

    #[tokio::test]
    async fn test_rejection_names_instruction() {
        let ledger = Arc::new(RecordingLedger {
            reject_with: Some("already initialized".to_string()),
            ..Default::default()
        });
        let result = client(ledger).init_computation_definition().await;
        assert!(matches!(
            result,
            Err(ComputationClientError::SubmissionRejected {
                instruction: "init_computation_definition",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_ensure_initializes_missing_definition() {
        let ledger = Arc::new(RecordingLedger::default());
        assert!(client(ledger.clone())
            .ensure_computation_definition()
            .await
            .unwrap());
        let submitted = ledger.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert!(matches!(
            decode(&submitted[0]),
            RecordProgramInstruction::InitComputationDefinition { .. }
        ));
        assert!(matches!(
            decode(&submitted[1]),
            RecordProgramInstruction::FinalizeComputationDefinition { .. }
        ));
    }

    #[tokio::test]
    async fn test_ensure_skips_finalized_definition() {
        let ledger = Arc::new(RecordingLedger::default());
        *ledger.definition.lock().unwrap() = Some(ComputationDefinitionAccount {
            name: pda::PRIVATE_RECORD_LOOKUP.to_string(),
            offset: pda::computation_definition_offset(pda::PRIVATE_RECORD_LOOKUP),
            finalized: true,
        });
        assert!(!client(ledger.clone())
            .ensure_computation_definition()
            .await
            .unwrap());
        assert!(ledger.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_finalizes_pending_definition() {
        let ledger = Arc::new(RecordingLedger::default());
        *ledger.definition.lock().unwrap() = Some(ComputationDefinitionAccount {
            name: pda::PRIVATE_RECORD_LOOKUP.to_string(),
            offset: pda::computation_definition_offset(pda::PRIVATE_RECORD_LOOKUP),
            finalized: false,
        });
        client(ledger.clone())
            .ensure_computation_definition()
            .await
            .unwrap();
        let submitted = ledger.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert!(matches!(
            decode(&submitted[0]),
            RecordProgramInstruction::FinalizeComputationDefinition { .. }
        ));
    }
}
