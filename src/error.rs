//! Error types for bridge transfers

use crate::chain::Chain;
use crate::coordination::{FailureReason, TransitionError};

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Request rejected before any record exists
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Source and destination chains must be different (both are {chain})")]
    SameChain { chain: Chain },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Errors surfaced by a ledger submission client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid transfer parameters: {0}")]
    InvalidParameters(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Contract reverted: {0}")]
    ContractReverted(String),

    #[error("Timeout after {waited:?} waiting for confirmation of {tx_hash}")]
    Timeout { tx_hash: String, waited: Duration },

    #[error("Receipt unavailable for {tx_hash}: {message}")]
    ReceiptUnavailable { tx_hash: String, message: String },
}

impl LedgerError {
    /// True when the ledger effect may have happened even though we report failure
    pub fn outcome_ambiguous(&self) -> bool {
        matches!(
            self,
            LedgerError::Network(_)
                | LedgerError::Timeout { .. }
                | LedgerError::ReceiptUnavailable { .. }
        )
    }

    /// Category persisted on the failed record
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            LedgerError::Configuration(_) => FailureReason::Configuration,
            LedgerError::InvalidParameters(_) => FailureReason::InvalidParameters,
            LedgerError::Network(_) => FailureReason::Network,
            LedgerError::InsufficientFunds(_) => FailureReason::InsufficientFunds,
            LedgerError::ContractReverted(_) => FailureReason::ContractReverted,
            LedgerError::Timeout { .. } => FailureReason::Timeout,
            LedgerError::ReceiptUnavailable { .. } => FailureReason::ReceiptUnavailable,
        }
    }
}

/// Transfer record store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transfer {transfer_id} already exists")]
    DuplicateKey { transfer_id: Uuid },

    #[error("Transfer {transfer_id} not found")]
    NotFound { transfer_id: Uuid },

    #[error("Invalid update of transfer {transfer_id}: {source}")]
    InvalidTransition {
        transfer_id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error("Transfer {transfer_id} kept changing under concurrent writers")]
    Conflict { transfer_id: Uuid },

    #[error("Corrupt row for transfer {transfer_id}: {message}")]
    Corrupt { transfer_id: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error reported by the orchestrator to its caller
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer request rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transfer {transfer_id} failed: {source}")]
    Ledger {
        transfer_id: Uuid,
        #[source]
        source: LedgerError,
    },

    #[error("Transfer {transfer_id} cancelled before submission completed")]
    Cancelled { transfer_id: Uuid },

    #[error("Transfer store error: {0}")]
    Store(#[from] StoreError),
}

impl TransferError {
    /// Transfer id, when a record was created for the attempt
    pub fn transfer_id(&self) -> Option<Uuid> {
        match self {
            TransferError::Validation(_) => None,
            TransferError::Ledger { transfer_id, .. } => Some(*transfer_id),
            TransferError::Cancelled { transfer_id } => Some(*transfer_id),
            TransferError::Store(StoreError::DuplicateKey { transfer_id })
            | TransferError::Store(StoreError::NotFound { transfer_id })
            | TransferError::Store(StoreError::InvalidTransition { transfer_id, .. })
            | TransferError::Store(StoreError::Conflict { transfer_id }) => Some(*transfer_id),
            TransferError::Store(_) => None,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferError::Validation(_) => 2,
            _ => 1,
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for orchestrated transfers
pub type TransferResult<T> = Result<T, TransferError>;
