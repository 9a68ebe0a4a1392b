//! Settlement tables
//!
//! Registered on the shared ledger store so that an allocation, a wallet
//! debit and a saga step commit in one atomic batch.
//!
//! - `lots` - Bulk purchases (key: lot_id)
//! - `lots_by_product` - product || created_at || lot_id (FIFO order)
//! - `allocations` / `allocation_sources` / `deallocations` - inventory traceability
//! - `receivables` / `receivables_by_wallet` - chargeback shortfalls
//! - `withdrawals` / `withdrawal_keys` - payout requests
//! - `sagas` / `saga_steps` / `saga_keys` - saga execution state

use ledger_core::storage::compose_key;
use ledger_core::{BulkPurchaseId, ProductId, Table};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Lot rows (value_remaining changes)
pub const LOTS: Table = Table::mutable("lots");
/// FIFO index of lots per product
pub const LOTS_BY_PRODUCT: Table = Table::append_only("lots_by_product");
/// Allocation rows (status changes on deallocation)
pub const ALLOCATIONS: Table = Table::mutable("allocations");
/// allocation_id || position -> source lot and value
pub const ALLOCATION_SOURCES: Table = Table::append_only("allocation_sources");
/// Allocation idempotency key -> allocation_id
pub const ALLOCATION_KEYS: Table = Table::append_only("allocation_keys");
/// user_id || allocation_id
pub const ALLOCATIONS_BY_USER: Table = Table::append_only("allocations_by_user");
/// reference || allocation_id
pub const ALLOCATIONS_BY_REFERENCE: Table = Table::append_only("allocations_by_reference");
/// allocation_id -> deallocation record
pub const DEALLOCATIONS: Table = Table::append_only("deallocations");
/// Receivable rows (paid/status change)
pub const RECEIVABLES: Table = Table::mutable("receivables");
/// wallet_id || receivable_id
pub const RECEIVABLES_BY_WALLET: Table = Table::append_only("receivables_by_wallet");
/// Withdrawal rows (status changes)
pub const WITHDRAWALS: Table = Table::mutable("withdrawals");
/// Withdrawal idempotency key -> withdrawal_id
pub const WITHDRAWAL_KEYS: Table = Table::append_only("withdrawal_keys");
/// Saga execution rows
pub const SAGAS: Table = Table::mutable("sagas");
/// saga_id || step_number -> step row
pub const SAGA_STEPS: Table = Table::mutable("saga_steps");
/// Saga deduplication key -> saga_id
pub const SAGA_KEYS: Table = Table::append_only("saga_keys");

/// Every settlement table
pub const SETTLEMENT_TABLES: &[Table] = &[
    LOTS,
    LOTS_BY_PRODUCT,
    ALLOCATIONS,
    ALLOCATION_SOURCES,
    ALLOCATION_KEYS,
    ALLOCATIONS_BY_USER,
    ALLOCATIONS_BY_REFERENCE,
    DEALLOCATIONS,
    RECEIVABLES,
    RECEIVABLES_BY_WALLET,
    WITHDRAWALS,
    WITHDRAWAL_KEYS,
    SAGAS,
    SAGA_STEPS,
    SAGA_KEYS,
];

/// FIFO key of a lot: product || created_at (ns, big-endian) || lot
///
/// Fails for times outside the nanosecond range (years 1677 to 2262).
pub fn lot_order_key(
    product_id: &ProductId,
    created_at: DateTime<Utc>,
    lot_id: &BulkPurchaseId,
) -> Result<Vec<u8>> {
    let nanos = created_at.timestamp_nanos_opt().ok_or_else(|| {
        Error::InvalidInput(format!("lot time {} is outside the orderable range", created_at))
    })?;
    // Offset keeps pre-epoch timestamps ordered as unsigned bytes
    let offset = (nanos as i128 - i64::MIN as i128) as u64;
    Ok(compose_key(&[
        product_id.as_bytes(),
        &offset.to_be_bytes(),
        lot_id.as_bytes(),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_lot_order_key_sorts_by_time() {
        let product = ProductId::new();
        let now = Utc::now();
        let older =
            lot_order_key(&product, now - Duration::days(1), &BulkPurchaseId::new()).unwrap();
        let newer = lot_order_key(&product, now, &BulkPurchaseId::new()).unwrap();
        assert!(older < newer);
        assert!(older.starts_with(product.as_bytes()));

        let pre_epoch = Utc.with_ymd_and_hms(1950, 6, 1, 0, 0, 0).unwrap();
        let earliest = lot_order_key(&product, pre_epoch, &BulkPurchaseId::new()).unwrap();
        assert!(earliest < older);
    }

    #[test]
    fn test_lot_order_key_rejects_unorderable_times() {
        let product = ProductId::new();
        let far_future = Utc.with_ymd_and_hms(2400, 1, 1, 0, 0, 0).unwrap();
        let result = lot_order_key(&product, far_future, &BulkPurchaseId::new());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
