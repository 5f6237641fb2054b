use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, Error as AesError, KeyInit,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::SharedSecret;

use crate::schema::{RecordSchema, SchemaError};

/// Size of the per-exchange nonce, in bytes
pub const NONCE_BYTE_SIZE: usize = 16;

/// Size of one encrypted record field, in bytes
pub const CIPHERTEXT_BLOCK_SIZE: usize = 32;

/// Size of the AES-GCM nonce used for a single field
const FIELD_NONCE_BYTE_SIZE: usize = 12;

/// Size of the little-endian plaintext carrier for a single field
const FIELD_PLAINTEXT_SIZE: usize = 16;

/// HKDF info string binding derived keys to this cipher
const KEY_DERIVATION_INFO: &[u8] = b"ciphermed/record-cipher/v1";

type Result<T> = std::result::Result<T, EncryptionError>;

/// A 16-byte nonce, unique per encryption under a given shared secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_BYTE_SIZE]);

impl Nonce {
    /// Draws a fresh nonce from the operating system's RNG.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_BYTE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_BYTE_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_BYTE_SIZE] {
        &self.0
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; NONCE_BYTE_SIZE] {
        self.0
    }
}

/// One encrypted record field: the sealed 16-byte little-endian value followed by
/// its 16-byte authentication tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextBlock([u8; CIPHERTEXT_BLOCK_SIZE]);

impl CiphertextBlock {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CIPHERTEXT_BLOCK_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CIPHERTEXT_BLOCK_SIZE] {
        &self.0
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; CIPHERTEXT_BLOCK_SIZE] {
        self.0
    }

    /// Mutable access to the raw bytes, mostly useful to simulate tampering.
    pub fn as_mut_bytes(&mut self) -> &mut [u8; CIPHERTEXT_BLOCK_SIZE] {
        &mut self.0
    }
}

/// Encrypts and decrypts records of a fixed schema under one shared secret.
///
/// For every call, a symmetric key is derived with HKDF-SHA256 using the nonce as
/// salt and the shared secret as input keying material. Each field is then sealed
/// with AES-256-GCM, using its position as the GCM nonce and its name as
/// associated data, so blocks cannot be reordered or moved between fields.
///
/// Encryption is deterministic given the same record, nonce and secret. Callers
/// must therefore never reuse a nonce with the same secret.
pub struct RecordCipher {
    /// Raw bytes of the X25519 shared secret
    shared_secret: [u8; 32],
    /// The schema both sides agreed on
    schema: RecordSchema,
}

impl RecordCipher {
    /// Constructor
    #[must_use]
    pub fn new(shared_secret: &SharedSecret, schema: RecordSchema) -> Self {
        Self {
            shared_secret: shared_secret.to_bytes(),
            schema,
        }
    }

    /// The schema this cipher encrypts against.
    #[must_use]
    pub const fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Encrypts a record, producing one block per field.
    ///
    /// # Errors
    ///
    /// Returns `EncryptionError::InvalidInput` if the record does not match the
    /// schema (field count or a value wider than its field), and
    /// `EncryptionError::KeyExpansionFailed` or `EncryptionError::EncryptionFailed`
    /// if the underlying primitives fail.
    pub fn encrypt(&self, record: &[u128], nonce: &Nonce) -> Result<Vec<CiphertextBlock>> {
        self.schema.check(record)?;
        let cipher = self.field_cipher(nonce)?;
        self.schema
            .fields()
            .iter()
            .zip(record)
            .enumerate()
            .map(|(index, (field, value))| -> Result<CiphertextBlock> {
                let sealed = cipher
                    .encrypt(
                        &field_nonce(index).into(),
                        Payload {
                            msg: &value.to_le_bytes(),
                            aad: field.name().as_bytes(),
                        },
                    )
                    .map_err(EncryptionError::EncryptionFailed)?;
                let bytes: [u8; CIPHERTEXT_BLOCK_SIZE] =
                    sealed.try_into().map_err(|sealed: Vec<u8>| {
                        EncryptionError::CorruptData(format!(
                            "sealed field `{}` has {} bytes",
                            field.name(),
                            sealed.len()
                        ))
                    })?;
                Ok(CiphertextBlock(bytes))
            })
            .collect()
    }

    /// Decrypts the blocks produced by [`RecordCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// - `EncryptionError::CorruptData` if the block count does not match the schema,
    ///   or a decrypted value does not fit its field
    /// - `EncryptionError::AuthenticationFailure` if a block fails authentication, which
    ///   happens for tampered blocks as well as for a wrong nonce or shared secret
    pub fn decrypt(&self, blocks: &[CiphertextBlock], nonce: &Nonce) -> Result<Vec<u128>> {
        if blocks.len() != self.schema.len() {
            return Err(EncryptionError::CorruptData(format!(
                "schema `{}` expects {} blocks, got {}",
                self.schema.name(),
                self.schema.len(),
                blocks.len()
            )));
        }
        let cipher = self.field_cipher(nonce)?;
        self.schema
            .fields()
            .iter()
            .zip(blocks)
            .enumerate()
            .map(|(index, (field, block))| -> Result<u128> {
                let plaintext = cipher
                    .decrypt(
                        &field_nonce(index).into(),
                        Payload {
                            msg: block.as_bytes(),
                            aad: field.name().as_bytes(),
                        },
                    )
                    .map_err(|_| EncryptionError::AuthenticationFailure {
                        field: field.name(),
                        index,
                    })?;
                let bytes: [u8; FIELD_PLAINTEXT_SIZE] =
                    plaintext.try_into().map_err(|plaintext: Vec<u8>| {
                        EncryptionError::CorruptData(format!(
                            "field `{}` decrypted to {} bytes",
                            field.name(),
                            plaintext.len()
                        ))
                    })?;
                let value = u128::from_le_bytes(bytes);
                if !field.kind().admits(value) {
                    return Err(EncryptionError::CorruptData(format!(
                        "field `{}` decrypted to {value}, wider than {} bits",
                        field.name(),
                        field.kind().bits()
                    )));
                }
                Ok(value)
            })
            .collect()
    }

    /// Derives the AES-256-GCM instance for one (secret, nonce) pair.
    fn field_cipher(&self, nonce: &Nonce) -> Result<Aes256Gcm> {
        let hkdf = Hkdf::<Sha256>::new(Some(nonce.as_bytes()), &self.shared_secret);
        let mut symmetric_key = [0u8; 32];
        hkdf.expand(KEY_DERIVATION_INFO, &mut symmetric_key)
            .map_err(EncryptionError::KeyExpansionFailed)?;
        Ok(Aes256Gcm::new(&symmetric_key.into()))
    }
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.shared_secret.fill(0);
    }
}

/// The GCM nonce for the field at `index`.
fn field_nonce(index: usize) -> [u8; FIELD_NONCE_BYTE_SIZE] {
    let mut nonce = [0u8; FIELD_NONCE_BYTE_SIZE];
    nonce[4..].copy_from_slice(&(index as u64).to_be_bytes());
    nonce
}

/// Errors that can occur during record encryption/decryption
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Invalid input: `{0}`")]
    InvalidInput(#[from] SchemaError),
    #[error("Authentication failed for field `{field}` (block {index})")]
    AuthenticationFailure { field: &'static str, index: usize },
    #[error("Corrupt data: `{0}`")]
    CorruptData(String),
    #[error("Failed to encrypt plaintext, with error: `{0}`")]
    EncryptionFailed(AesError),
    #[error("Failed to expand key, with error: `{0}`")]
    KeyExpansionFailed(hkdf::InvalidLength),
}
