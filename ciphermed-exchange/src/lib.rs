#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod finalization;
pub mod resolver;
pub mod result_channel;
pub mod service;

pub use config::{ConfigError, ExchangeConfig};
pub use context::ProtocolContext;
pub use error::{ExchangeError, Phase};
pub use finalization::{FinalizationAwaiter, FinalizationPolicy, FinalizationReceipt};
pub use resolver::{Backoff, PublicKeyResolver, RetryPolicy};
pub use result_channel::{ChannelState, PendingResult, ResultChannelError};
pub use service::{ExchangeOutcome, RecordExchange};
