#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod encryption;
pub mod key_management;
pub mod schema;
pub mod types;

pub use encryption::{CiphertextBlock, EncryptionError, Nonce, RecordCipher};
pub use key_management::{derive_shared_secret, generate_key_pair, KeyManagementError, KeyPair};
pub use schema::{FieldKind, FieldSpec, RecordSchema, SchemaError};
pub use types::{PatientRecord, RecordError};
