//! Error types for the ledger

use crate::types::{Paise, WalletId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Amount is zero, negative or not representable in paise
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Spendable balance does not cover the request
    #[error("Insufficient funds in wallet {wallet_id}: requested {requested}, spendable {available}")]
    InsufficientFunds {
        /// Wallet that was short
        wallet_id: WalletId,
        /// Amount requested
        requested: Paise,
        /// Spendable balance at the time of the check
        available: Paise,
    },

    /// Wallet is in recovery mode and the operation moves funds outward
    #[error("Wallet {0} is in recovery mode")]
    RecoveryModeRestricted(WalletId),

    /// Double-entry legs do not balance (programming error)
    #[error("Unbalanced entry: {0}")]
    UnbalancedEntry(String),

    /// Attempt to overwrite or restage an append-only record
    #[error("Immutability violation: {0}")]
    ImmutabilityViolation(String),

    /// Idempotency key already consumed by a different request
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    /// Entry or posting pair was already countered
    #[error("Already reversed: {0}")]
    AlreadyReversed(String),

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Ledger entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Fund lock not found
    #[error("Fund lock not found: {0}")]
    LockNotFound(String),

    /// Fund lock is not active
    #[error("Invalid lock state: {0}")]
    InvalidLockState(String),

    /// Posting pair not found
    #[error("Posting not found: {0}")]
    PostingNotFound(String),

    /// Row lock could not be acquired in time
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Invariant violation (balance arithmetic, hash chain, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Expected business outcome, returned to the caller rather than alerted on
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            Error::InvalidAmount(_)
                | Error::InsufficientFunds { .. }
                | Error::RecoveryModeRestricted(_)
                | Error::AlreadyReversed(_)
                | Error::DuplicateIdempotencyKey(_)
        )
    }

    /// The invariant layer itself is broken; the enclosing write must halt
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::UnbalancedEntry(_) | Error::ImmutabilityViolation(_) | Error::InvariantViolation(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
