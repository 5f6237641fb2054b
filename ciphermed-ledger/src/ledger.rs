use async_trait::async_trait;
use thiserror::Error;

use crate::{
    events::LedgerEvent,
    types::{Address, Commitment, Instruction, Signature},
};

/// The ledger a client submits transactions to and reads accounts from.
///
/// Implementations must be safe to share between the tasks of one exchange.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Submits the instructions as one atomic transaction signed by `signers`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Rejected` if any instruction fails, in which case
    /// none of them take effect.
    async fn submit_transaction(
        &self,
        instructions: Vec<Instruction>,
        signers: &[Address],
    ) -> Result<Signature, LedgerError>;

    /// Reads the raw state of an account, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Unavailable` if the ledger cannot be reached.
    async fn get_account_state(
        &self,
        address: &Address,
        commitment: Commitment,
    ) -> Result<Option<Vec<u8>>, LedgerError>;
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Publishes program events to registered listeners.
///
/// Delivery is at most once and in emission order for each listener. A
/// listener whose channel is full or closed misses the event.
pub trait EventBus: Send + Sync {
    /// Registers `sender` for every event named `event_name`.
    fn add_listener(&self, event_name: &str, sender: flume::Sender<LedgerEvent>) -> ListenerId;

    /// Unregisters a listener, returning `false` if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}
