use std::{fmt, str::FromStr};

use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a ledger address, in bytes
pub const ADDRESS_BYTE_SIZE: usize = 32;

/// A 32-byte ledger address, identifying either an account or a program.
///
/// Serialized as a `0x`-prefixed hex string in every format, so addresses read
/// the same in configuration files and account payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_BYTE_SIZE]);

/// Programs are addressed like any other account.
pub type ProgramId = Address;

impl Address {
    #[must_use]
    pub const fn new(bytes: [u8; ADDRESS_BYTE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives a well-known address from a human readable label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        Self(Sha256::digest(label.as_bytes()).into())
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ADDRESS_BYTE_SIZE] {
        &self.0
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; ADDRESS_BYTE_SIZE] {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits)?;
        let bytes: [u8; ADDRESS_BYTE_SIZE] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| AddressParseError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AddressParseError {
    #[error("Invalid hex address: `{0}`")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Address must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Caller-chosen identifier of one in-flight computation.
///
/// The offset names the computation account on the ledger and is the only
/// correlation handle between a submission and its finalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputationOffset(u64);

impl ComputationOffset {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Draws 8 random bytes and reads them as a little-endian `u64`.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(u64::from_le_bytes(bytes))
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for ComputationOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction signature returned by the ledger, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    #[must_use]
    pub fn new(signature: impl Into<String>) -> Self {
        Self(signature.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confirmation level requested for ledger reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "confirmed" => Ok(Self::Confirmed),
            "finalized" => Ok(Self::Finalized),
            _ => Err(format!("unknown commitment level `{s}`")),
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processed => f.write_str("processed"),
            Self::Confirmed => f.write_str("confirmed"),
            Self::Finalized => f.write_str("finalized"),
        }
    }
}

/// An account referenced by an instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMeta {
    pub address: Address,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    /// A writable account
    #[must_use]
    pub const fn writable(address: Address, is_signer: bool) -> Self {
        Self {
            address,
            is_signer,
            is_writable: true,
        }
    }

    /// A read-only, non-signing account
    #[must_use]
    pub const fn readonly(address: Address) -> Self {
        Self {
            address,
            is_signer: false,
            is_writable: false,
        }
    }
}

/// A single ledger instruction: a program, the accounts it touches, and opaque data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub program_id: ProgramId,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

/// Encodes a value as CBOR, the encoding used for instruction data, account
/// state and event payloads.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)?;
    Ok(bytes)
}

/// Decodes a CBOR value produced by [`to_cbor`].
///
/// # Errors
///
/// Returns `CodecError::Decode` if the bytes are not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(ciborium::from_reader(bytes)?)
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode CBOR: `{0}`")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("Failed to decode CBOR: `{0}`")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}
