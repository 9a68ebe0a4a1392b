//! Error types for settlement engine

use ledger_core::{Paise, ProductId};
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Not enough unallocated inventory for the product
    #[error("Insufficient inventory for product {product_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Product requested
        product_id: ProductId,
        /// Value requested
        requested: Paise,
        /// Value available across all lots
        available: Paise,
    },

    /// A saga step failed (compensation was triggered)
    #[error("Saga step {step} ({operation}) failed: {reason}")]
    SagaStepFailure {
        /// Step number (1-based)
        step: u32,
        /// Operation key
        operation: String,
        /// Failure reason
        reason: String,
    },

    /// A compensation failed; the saga needs manual resolution
    #[error("Compensation of step {step} ({operation}) failed: {reason}")]
    CompensationFailure {
        /// Step number (1-based)
        step: u32,
        /// Operation key
        operation: String,
        /// Failure reason
        reason: String,
    },

    /// A step did not finish within its timeout
    #[error("Step {operation} timed out after {timeout_ms}ms")]
    StepTimeout {
        /// Operation key
        operation: String,
        /// Timeout applied
        timeout_ms: u64,
    },

    /// No handler registered for an operation key
    #[error("Unknown saga operation: {0}")]
    UnknownOperation(String),

    /// Saga is not in a state that allows the request
    #[error("Invalid saga state: {0}")]
    InvalidSagaState(String),

    /// Record is not in a state that allows the request
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Step metadata missing or malformed
    #[error("Invalid step input: {0}")]
    InvalidInput(String),

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Saga runner is not accepting work
    #[error("Saga runner unavailable: {0}")]
    RunnerUnavailable(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Not-found helper
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Expected business outcome, returned to the caller rather than alerted on
    pub fn is_business_outcome(&self) -> bool {
        match self {
            Error::Ledger(e) => e.is_business_outcome(),
            Error::InsufficientInventory { .. } => true,
            _ => false,
        }
    }

    /// The invariant layer itself is broken
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Ledger(e) if e.is_structural())
    }

    /// Short machine-readable reason code for collaborators
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Ledger(e) => match e {
                ledger_core::Error::InvalidAmount(_) => "invalid_amount",
                ledger_core::Error::InsufficientFunds { .. } => "insufficient_funds",
                ledger_core::Error::RecoveryModeRestricted(_) => "recovery_mode",
                ledger_core::Error::DuplicateIdempotencyKey(_) => "duplicate_idempotency_key",
                ledger_core::Error::AlreadyReversed(_) => "already_reversed",
                ledger_core::Error::UnbalancedEntry(_) => "unbalanced_entry",
                ledger_core::Error::ImmutabilityViolation(_) => "immutability_violation",
                ledger_core::Error::LockTimeout(_) => "lock_timeout",
                _ => "ledger_error",
            },
            Error::InsufficientInventory { .. } => "insufficient_inventory",
            Error::SagaStepFailure { .. } => "saga_step_failure",
            Error::CompensationFailure { .. } => "compensation_failure",
            Error::StepTimeout { .. } => "step_timeout",
            Error::NotFound { .. } => "not_found",
            Error::InvalidState(_) | Error::InvalidSagaState(_) => "invalid_state",
            Error::InvalidInput(_) => "invalid_input",
            _ => "internal_error",
        }
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
