//! ShareLedger Ledger Core
//!
//! Wallet accounting and double-entry bookkeeping over an append-only store.
//!
//! # Architecture
//!
//! - **Append-only store**: ledger facts live in append-only RocksDB column
//!   families; the storage API refuses overwrites and has no delete
//! - **Row locks**: keyed async mutexes taken in canonical order
//! - **Atomic batches**: an entry and the wallet row it changes land together
//! - **Hash chain**: each wallet's entries are chained with SHA-256
//!
//! # Invariants
//!
//! - Money is integer paise; no floating point
//! - `balance_after = balance_before ± amount` for every entry
//! - Wallet balance equals the `balance_after` of its newest entry
//! - Every posting pair has one debit and one credit of equal amount

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod locks;
pub mod wallet;
pub mod double_entry;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use config::Config;
pub use double_entry::{
    Account, AdminLedgerEntry, CapitalEvent, DoubleEntryLedger, Leg, PostingPair, TrialBalance,
};
pub use error::{Error, Result};
pub use locks::{RowGuard, RowLocks};
pub use metrics::Metrics;
pub use storage::{Storage, Table, WriteSet};
pub use types::{
    AllocationId, BalanceView, BonusId, BulkPurchaseId, CampaignUsageId, Direction, EntryId,
    EntryKind, EntryReversal, FundLock, LedgerEntry, LockId, LockStatus, PairId, Paise, PaymentId,
    PostingRequest, ProductId, ReceivableId, Reference, Referenced, SagaId, UserId, Wallet,
    WalletId, WithdrawalId,
};
pub use wallet::{HistoryCursor, HistoryRange, LedgerHistory, WalletAccounting, WalletAudit, WalletTxn};
