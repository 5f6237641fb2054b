//! Deterministic address derivation.
//!
//! Addresses are `sha256(seed_0 || … || seed_n || program_id || "ProgramDerivedAddress")`,
//! so both the client and the ledger compute the same accounts from the same
//! seeds without any round trip.

use std::sync::LazyLock;

use sha2::{Digest, Sha256};

use crate::types::{Address, ComputationOffset, ProgramId};

/// Marker appended to every derivation
const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

pub const MXE_ACCOUNT_SEED: &[u8] = b"MXEAccount";
pub const MEMPOOL_SEED: &[u8] = b"Mempool";
pub const EXECUTING_POOL_SEED: &[u8] = b"Execpool";
pub const COMPUTATION_ACCOUNT_SEED: &[u8] = b"ComputationAccount";
pub const CLUSTER_SEED: &[u8] = b"Cluster";
pub const COMPUTATION_DEFINITION_SEED: &[u8] = b"ComputationDefinitionAccount";
pub const SIGN_PDA_SEED: &[u8] = b"SignerAccount";
pub const PATIENT_DATA_SEED: &[u8] = b"patient_data";

/// Name of the circuit that re-encrypts a stored record for a receiver
pub const PRIVATE_RECORD_LOOKUP: &str = "private_record_lookup";

/// The program owning the cluster-side accounts (MXE, mempools, computations)
pub static COMPUTATION_PROGRAM_ID: LazyLock<ProgramId> =
    LazyLock::new(|| Address::from_label("ciphermed/computation-program"));

/// Derives an address from seeds under a program.
#[must_use]
pub fn derive_address(seeds: &[&[u8]], program_id: &ProgramId) -> Address {
    let mut hasher = Sha256::new();
    for seed in seeds {
        hasher.update(seed);
    }
    hasher.update(program_id.as_bytes());
    hasher.update(PDA_MARKER);
    Address::new(hasher.finalize().into())
}

/// Offset of a computation definition: the first four bytes of
/// `sha256(name)`, read little-endian.
#[must_use]
pub fn computation_definition_offset(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[must_use]
pub fn mxe_address(program_id: &ProgramId) -> Address {
    derive_address(
        &[MXE_ACCOUNT_SEED, program_id.as_bytes()],
        &COMPUTATION_PROGRAM_ID,
    )
}

#[must_use]
pub fn mempool_address(cluster_offset: u32) -> Address {
    derive_address(
        &[MEMPOOL_SEED, &cluster_offset.to_le_bytes()],
        &COMPUTATION_PROGRAM_ID,
    )
}

#[must_use]
pub fn executing_pool_address(cluster_offset: u32) -> Address {
    derive_address(
        &[EXECUTING_POOL_SEED, &cluster_offset.to_le_bytes()],
        &COMPUTATION_PROGRAM_ID,
    )
}

#[must_use]
pub fn computation_address(cluster_offset: u32, offset: ComputationOffset) -> Address {
    derive_address(
        &[
            COMPUTATION_ACCOUNT_SEED,
            &cluster_offset.to_le_bytes(),
            &offset.to_le_bytes(),
        ],
        &COMPUTATION_PROGRAM_ID,
    )
}

#[must_use]
pub fn cluster_address(cluster_offset: u32) -> Address {
    derive_address(
        &[CLUSTER_SEED, &cluster_offset.to_le_bytes()],
        &COMPUTATION_PROGRAM_ID,
    )
}

#[must_use]
pub fn computation_definition_address(program_id: &ProgramId, definition_offset: u32) -> Address {
    derive_address(
        &[
            COMPUTATION_DEFINITION_SEED,
            program_id.as_bytes(),
            &definition_offset.to_le_bytes(),
        ],
        &COMPUTATION_PROGRAM_ID,
    )
}

#[must_use]
pub fn sign_pda_address(program_id: &ProgramId) -> Address {
    derive_address(&[SIGN_PDA_SEED], program_id)
}

#[must_use]
pub fn patient_data_address(program_id: &ProgramId, owner: &Address) -> Address {
    derive_address(&[PATIENT_DATA_SEED, owner.as_bytes()], program_id)
}
