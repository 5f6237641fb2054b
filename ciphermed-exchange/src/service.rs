use ciphermed_confidential::{
    generate_key_pair, CiphertextBlock, Nonce, PatientRecord, RecordCipher,
};
use ciphermed_ledger::{
    Address, ComputationOffset, LedgerEventIdentifier, PrivateRecordLookupRequest,
    ReceivedPrivateRecordLookupEvent, Signature,
};
use tracing::instrument;

use crate::{
    context::ProtocolContext,
    error::{ExchangeError, Phase, Result},
    finalization::FinalizationReceipt,
    result_channel::PendingResult,
};

/// What a completed exchange produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub offset: ComputationOffset,
    pub store_signature: Signature,
    pub queue_signature: Signature,
    pub finalization: FinalizationReceipt,
    /// The record as decrypted by the receiving party
    pub record: PatientRecord,
}

/// Runs the confidential record exchange against a ledger and its cluster.
///
/// The sender encrypts a record for the cluster and stores it; the cluster
/// re-encrypts it for a fresh receiver key, and the receiver decrypts the
/// copy delivered by the result event.
pub struct RecordExchange {
    context: ProtocolContext,
}

impl RecordExchange {
    #[must_use]
    pub const fn new(context: ProtocolContext) -> Self {
        Self { context }
    }

    #[must_use]
    pub const fn context(&self) -> &ProtocolContext {
        &self.context
    }

    /// Makes sure the lookup circuit is registered and finalized, submitting
    /// only what is missing. Returns `true` if anything was submitted.
    ///
    /// # Errors
    ///
    /// Returns an `ExchangeError` in the `initialization` phase if a read or
    /// submission fails.
    #[instrument(level = "info", skip_all, fields(payer = %payer))]
    pub async fn ensure_definition(&self, payer: Address) -> Result<bool> {
        self.context
            .computation_client(payer)
            .ensure_computation_definition()
            .await
            .map_err(|e| ExchangeError::client(Phase::Initialization, e))
    }

    /// Stores `record` encrypted for the cluster, queues its re-encryption
    /// towards a fresh receiver key and decrypts the result.
    ///
    /// The result listener is registered before the computation is queued
    /// and removed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns an `ExchangeError` naming the phase that failed.
    #[instrument(level = "info", skip_all, fields(payer = %payer))]
    pub async fn exchange(&self, payer: Address, record: &PatientRecord) -> Result<ExchangeOutcome> {
        let program_id = self.context.config().program_id();
        let mxe_public_key = self
            .context
            .public_key_resolver()
            .resolve_public_key(&program_id)
            .await?;

        let sender = generate_key_pair();
        let sender_secret = sender
            .shared_secret(&mxe_public_key)
            .map_err(|e| ExchangeError::invalid_key(Phase::Encryption, e))?;
        let sender_nonce = Nonce::random();
        let blocks = RecordCipher::new(&sender_secret, PatientRecord::SCHEMA)
            .encrypt(&record.to_fields(), &sender_nonce)
            .map_err(|e| ExchangeError::cipher(Phase::Encryption, e))?;

        let client = self.context.computation_client(payer);
        let store_signature = client
            .store_record(blocks.iter().map(|block| block.to_bytes()).collect())
            .await
            .map_err(|e| ExchangeError::client(Phase::Storage, e))?;

        let receiver = generate_key_pair();
        let receiver_nonce = Nonce::random();

        let mut pending = PendingResult::new(
            self.context.events(),
            LedgerEventIdentifier::ReceivedPrivateRecordLookupEvent,
        );
        pending.subscribe().map_err(ExchangeError::result_channel)?;

        let request = PrivateRecordLookupRequest {
            offset: ComputationOffset::random(),
            receiver_public_key: receiver.public_bytes(),
            receiver_nonce: receiver_nonce.to_bytes(),
            sender_public_key: sender.public_bytes(),
            sender_nonce: sender_nonce.to_bytes(),
        };
        let receipt = client
            .queue_computation(&request)
            .await
            .map_err(|e| ExchangeError::client(Phase::Submission, e))?;
        tracing::info!(
            target = "ciphermed-exchange-service",
            event = "computation_queued",
            offset = %receipt.offset,
            signature = %receipt.signature,
            "Queued private record lookup"
        );

        let awaiter = self.context.finalization_awaiter(client);
        let result_timeout = self.context.config().result_timeout();
        let (finalization, event) = tokio::try_join!(
            awaiter.await_finalization(receipt.offset),
            async {
                pending
                    .recv_timeout(result_timeout)
                    .await
                    .map_err(ExchangeError::result_channel)
            }
        )?;

        let event = ReceivedPrivateRecordLookupEvent::try_from(&event)?;
        let blocks: Vec<CiphertextBlock> = event
            .ciphertexts()
            .into_iter()
            .map(CiphertextBlock::from_bytes)
            .collect();
        let receiver_secret = receiver
            .shared_secret(&mxe_public_key)
            .map_err(|e| ExchangeError::invalid_key(Phase::Decryption, e))?;
        let fields = RecordCipher::new(&receiver_secret, PatientRecord::SCHEMA)
            .decrypt(&blocks, &Nonce::from_bytes(event.nonce))
            .map_err(|e| ExchangeError::cipher(Phase::Decryption, e))?;
        let record = PatientRecord::from_fields(&fields)?;

        tracing::info!(
            target = "ciphermed-exchange-service",
            event = "record_received",
            offset = %receipt.offset,
            polls = finalization.polls,
            "Decrypted re-encrypted record"
        );
        Ok(ExchangeOutcome {
            offset: receipt.offset,
            store_signature,
            queue_signature: receipt.signature,
            finalization,
            record,
        })
    }
}
