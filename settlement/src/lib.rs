//! ShareLedger Settlement
//!
//! Payment settlement, FIFO inventory allocation, reversals and withdrawals
//! on top of `ledger-core`.
//!
//! # Architecture
//!
//! Every multi-step money movement runs as a saga:
//!
//! 1. **Plan**: the saga and its ordered step operations are persisted
//! 2. **Execute**: steps run one at a time under a per-saga lock, each with a timeout
//! 3. **Compensate**: on failure, completed steps are undone in reverse order
//! 4. **Escalate**: a compensation that fails parks the saga for an operator
//!
//! # Inventory
//!
//! Bulk purchase lots are consumed oldest first. Lot rows are locked in
//! FIFO order so concurrent allocations cannot oversell a product.
//!
//! # Recovery mode
//!
//! A reversal that exceeds the spendable balance debits what it can and
//! opens a receivable for the rest. The wallet then rejects withdrawals,
//! purchases and bonuses until later deposits clear the receivable.
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, PaymentRequest, SettlementEngine};
//! use ledger_core::{Paise, UserId};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let engine = SettlementEngine::new(Config::default()).await?;
//!
//!     let user = UserId::new();
//!     let saga_id = engine
//!         .request_payment(PaymentRequest::top_up(user, Paise::new(100_000)))
//!         .await?;
//!     let saga = engine.wait_for_saga(saga_id, Duration::from_secs(5)).await?;
//!     println!("saga {} is {:?}", saga_id, saga.status);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod tables;
pub mod error;
pub mod config;
pub mod metrics;
pub mod allocator;
pub mod reversal;
pub mod withdrawal;
pub mod saga;
pub mod runner;
pub mod engine;

// Re-exports
pub use config::Config;
pub use engine::SettlementEngine;
pub use error::{Error, Result};
pub use types::*;
