pub mod accounts;
pub mod client;
pub mod events;
pub mod ledger;
pub mod pda;
pub mod types;

pub use client::{
    ComputationClient, ComputationClientError, PrivateRecordLookupRequest, SubmissionReceipt,
};
pub use events::{LedgerEvent, LedgerEventIdentifier, ReceivedPrivateRecordLookupEvent};
pub use ledger::{EventBus, LedgerError, LedgerService, ListenerId};
pub use types::{Address, Commitment, ComputationOffset, Signature};
