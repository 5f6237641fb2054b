use ciphermed_confidential::{
    CiphertextBlock, EncryptionError, KeyManagementError, KeyPair, Nonce, PatientRecord,
    RecordCipher,
};
use ciphermed_ledger::{
    accounts::{CIPHERTEXT_SIZE, NONCE_SIZE, X25519_PUBLIC_KEY_SIZE},
    events::{EventParseError, ReceivedPrivateRecordLookupEvent},
    ComputationOffset,
};
use thiserror::Error;

/// What the simulated cluster does with a queued computation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClusterBehavior {
    /// Execute the lookup, emit the result and finalize the computation
    #[default]
    Finalize,
    /// Mark the computation failed with the given reason, without a result
    Fail(String),
    /// Never execute: the computation stays queued
    Stall,
}

/// A private record lookup waiting for execution.
#[derive(Clone, Debug)]
pub struct LookupJob {
    pub offset: ComputationOffset,
    pub sender_public_key: [u8; X25519_PUBLIC_KEY_SIZE],
    pub sender_nonce: [u8; NONCE_SIZE],
    pub receiver_public_key: [u8; X25519_PUBLIC_KEY_SIZE],
    pub receiver_nonce: [u8; NONCE_SIZE],
    /// The stored record at the time the job was queued
    pub stored: Vec<[u8; CIPHERTEXT_SIZE]>,
}

/// Stands in for the computation cluster: holds the MXE key pair and performs
/// the lookup by decrypting the stored record and re-encrypting it for the
/// receiver. It is a functional model only; nothing here is secret-shared.
pub struct SimulatedCluster {
    keypair: KeyPair,
    behavior: ClusterBehavior,
    tamper_output: bool,
}

impl SimulatedCluster {
    #[must_use]
    pub const fn new(keypair: KeyPair, behavior: ClusterBehavior, tamper_output: bool) -> Self {
        Self {
            keypair,
            behavior,
            tamper_output,
        }
    }

    /// The MXE public key published on the ledger.
    #[must_use]
    pub fn public_key(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        self.keypair.public_bytes()
    }

    #[must_use]
    pub const fn behavior(&self) -> &ClusterBehavior {
        &self.behavior
    }

    /// Re-encrypts the stored record from the sender's key to the receiver's.
    ///
    /// # Errors
    ///
    /// Returns a `ClusterError` if either public key is invalid or the stored
    /// ciphertexts do not decrypt under the sender's key and nonce.
    pub fn execute(&self, job: &LookupJob) -> Result<ReceivedPrivateRecordLookupEvent, ClusterError> {
        let sender_secret = self.keypair.shared_secret(&job.sender_public_key)?;
        let stored: Vec<CiphertextBlock> = job
            .stored
            .iter()
            .copied()
            .map(CiphertextBlock::from_bytes)
            .collect();
        let fields = RecordCipher::new(&sender_secret, PatientRecord::SCHEMA)
            .decrypt(&stored, &Nonce::from_bytes(job.sender_nonce))?;

        let receiver_secret = self.keypair.shared_secret(&job.receiver_public_key)?;
        let mut output = RecordCipher::new(&receiver_secret, PatientRecord::SCHEMA)
            .encrypt(&fields, &Nonce::from_bytes(job.receiver_nonce))?;
        if self.tamper_output {
            if let Some(block) = output.get_mut(1) {
                block.as_mut_bytes()[0] ^= 0x01;
            }
        }
        let ciphertexts: Vec<[u8; CIPHERTEXT_SIZE]> =
            output.into_iter().map(CiphertextBlock::to_bytes).collect();
        Ok(ReceivedPrivateRecordLookupEvent::from_ciphertexts(
            job.receiver_nonce,
            &ciphertexts,
        )?)
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Invalid party key: `{0}`")]
    Key(#[from] KeyManagementError),
    #[error("Stored record does not decrypt: `{0}`")]
    Cipher(#[from] EncryptionError),
    #[error("Failed to build result event: `{0}`")]
    Event(#[from] EventParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciphermed_confidential::generate_key_pair;

    fn record() -> Vec<u128> {
        vec![430, 70, 1, 1, 75, 175, 1, 0, 0, 1, 1]
    }

    fn job(cluster: &SimulatedCluster, sender: &KeyPair, receiver: &KeyPair) -> LookupJob {
        let sender_nonce = Nonce::random();
        let secret = sender.shared_secret(&cluster.public_key()).unwrap();
        let stored = RecordCipher::new(&secret, PatientRecord::SCHEMA)
            .encrypt(&record(), &sender_nonce)
            .unwrap()
            .into_iter()
            .map(CiphertextBlock::to_bytes)
            .collect();
        LookupJob {
            offset: ComputationOffset::new(1),
            sender_public_key: sender.public_bytes(),
            sender_nonce: sender_nonce.to_bytes(),
            receiver_public_key: receiver.public_bytes(),
            receiver_nonce: Nonce::random().to_bytes(),
            stored,
        }
    }

    fn open(
        event: &ReceivedPrivateRecordLookupEvent,
        cluster: &SimulatedCluster,
        receiver: &KeyPair,
    ) -> Result<Vec<u128>, EncryptionError> {
        let secret = receiver.shared_secret(&cluster.public_key()).unwrap();
        let blocks: Vec<CiphertextBlock> = event
            .ciphertexts()
            .into_iter()
            .map(CiphertextBlock::from_bytes)
            .collect();
        RecordCipher::new(&secret, PatientRecord::SCHEMA)
            .decrypt(&blocks, &Nonce::from_bytes(event.nonce))
    }

    #[test]
    fn test_reencrypts_for_receiver() {
        let cluster = SimulatedCluster::new(generate_key_pair(), ClusterBehavior::Finalize, false);
        let (sender, receiver) = (generate_key_pair(), generate_key_pair());
        let job = job(&cluster, &sender, &receiver);

        let event = cluster.execute(&job).unwrap();
        assert_eq!(event.nonce, job.receiver_nonce);
        assert_eq!(open(&event, &cluster, &receiver).unwrap(), record());
        // the sender cannot read the receiver's copy
        assert!(open(&event, &cluster, &sender).is_err());
    }

    #[test]
    fn test_tampered_output_fails_authentication() {
        let cluster = SimulatedCluster::new(generate_key_pair(), ClusterBehavior::Finalize, true);
        let (sender, receiver) = (generate_key_pair(), generate_key_pair());
        let event = cluster.execute(&job(&cluster, &sender, &receiver)).unwrap();
        assert!(matches!(
            open(&event, &cluster, &receiver),
            Err(EncryptionError::AuthenticationFailure { field: "age", index: 1 })
        ));
    }

    #[test]
    fn test_rejects_record_from_other_key() {
        let cluster = SimulatedCluster::new(generate_key_pair(), ClusterBehavior::Finalize, false);
        let other = SimulatedCluster::new(generate_key_pair(), ClusterBehavior::Finalize, false);
        let (sender, receiver) = (generate_key_pair(), generate_key_pair());
        let job = job(&other, &sender, &receiver);
        assert!(matches!(cluster.execute(&job), Err(ClusterError::Cipher(_))));
    }
}
