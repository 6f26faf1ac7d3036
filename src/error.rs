//! Failure kinds surfaced by the launch and mint workflows.

use thiserror::Error;

use crate::storage::StoreError;

/// Every workflow failure, one variant per distinguishable kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("pinning service unavailable: {0}")]
    PinningUnavailable(String),
    #[error("pinning service rejected the upload: {0}")]
    PinningRejected(String),
    #[error("event {0} not found")]
    EventNotFound(String),
    #[error("event {0} is already launched or a launch is in progress")]
    AlreadyLaunched(String),
    #[error("event configuration invalid: {0}")]
    ConfigurationInvalid(String),
    #[error("all {max_supply} items of event {event_id} have been minted")]
    NoCapacity { event_id: String, max_supply: u32 },
    #[error("index {index} is not available: {reason}")]
    IndexUnavailable { index: u32, reason: String },
    #[error("wallet rejected the transaction: {0}")]
    WalletRejected(String),
    #[error("chain error: {0}")]
    ChainError(String),
    #[error("timed out during {0}")]
    Timeout(String),
    #[error("mint of index {index} timed out and its outcome could not be confirmed: {detail}")]
    OutcomeUnknown { index: u32, detail: String },
    #[error("index {index} was recorded by a concurrent mint (transaction {transaction})")]
    IndexConflict { index: u32, transaction: String },
    #[error("registry write failed: {0}")]
    RegistryWriteFailed(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Stable machine-readable code for API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::PinningUnavailable(_) => "pinning_unavailable",
            Error::PinningRejected(_) => "pinning_rejected",
            Error::EventNotFound(_) => "event_not_found",
            Error::AlreadyLaunched(_) => "already_launched",
            Error::ConfigurationInvalid(_) => "configuration_invalid",
            Error::NoCapacity { .. } => "no_capacity",
            Error::IndexUnavailable { .. } => "index_unavailable",
            Error::WalletRejected(_) => "wallet_rejected",
            Error::ChainError(_) => "chain_error",
            Error::Timeout(_) => "timeout",
            Error::OutcomeUnknown { .. } => "outcome_unknown",
            Error::IndexConflict { .. } => "index_conflict",
            Error::RegistryWriteFailed(_) => "registry_write_failed",
            Error::Store(_) => "store_error",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
