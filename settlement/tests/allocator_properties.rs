//! Property-based tests for inventory conservation
//!
//! Random sequences of allocations and deallocations over a handful of lots
//! must keep, for every lot, received == remaining + allocated + lost, and
//! must never allocate more than was available.

use chrono::{Duration, Utc};
use ledger_core::{DoubleEntryLedger, Metrics, Paise, ProductId, RowLocks, Storage, UserId};
use prometheus::Registry;
use proptest::prelude::*;
use settlement::{
    allocator::FifoAllocator,
    config::{AllocatorConfig, Config},
    metrics::SettlementMetrics,
    tables, AllocationRequest, AllocationStatus, DeallocationMode, Error, NewLot,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    allocator: FifoAllocator,
    ledger: Arc<DoubleEntryLedger>,
    _temp_dir: TempDir,
}

fn create_harness(config: AllocatorConfig) -> Harness {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut settings = Config::default();
    settings.ledger.data_dir = temp_dir.path().to_path_buf();
    settings.ledger.rocksdb.sync_writes = false; // Tests don't need durable fsync

    let registry = Arc::new(Registry::new());
    let storage = Arc::new(Storage::open(&settings.ledger, tables::SETTLEMENT_TABLES).unwrap());
    let locks = Arc::new(RowLocks::new(settings.ledger.locking.lock_timeout_ms));
    let ledger = Arc::new(DoubleEntryLedger::new(
        storage.clone(),
        Metrics::with_registry(registry.clone()).unwrap(),
    ));
    let metrics = SettlementMetrics::with_registry(&registry).unwrap();
    let allocator = FifoAllocator::new(storage, locks, ledger.clone(), metrics, config);

    Harness {
        allocator,
        ledger,
        _temp_dir: temp_dir,
    }
}

#[derive(Debug, Clone)]
enum InventoryOp {
    Allocate(i64),
    Compensate(usize),
    Reverse(usize),
}

fn inventory_op_strategy() -> impl Strategy<Value = InventoryOp> {
    prop_oneof![
        3 => (1i64..2_500).prop_map(InventoryOp::Allocate),
        1 => any::<usize>().prop_map(InventoryOp::Compensate),
        1 => any::<usize>().prop_map(InventoryOp::Reverse),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: lots conserve value under any allocate/deallocate sequence
    #[test]
    fn prop_lot_value_is_conserved(
        lots in prop::collection::vec(1i64..3_000, 1..5),
        ops in prop::collection::vec(inventory_op_strategy(), 1..30),
        return_to_exhausted_lots in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let harness = create_harness(AllocatorConfig { return_to_exhausted_lots });
            let product = ProductId::new();
            let start = Utc::now() - Duration::days(30);
            for (day, value) in lots.iter().enumerate() {
                harness
                    .allocator
                    .record_lot(
                        NewLot::new(product, Paise::new(*value))
                            .received_at(start + Duration::days(day as i64)),
                    )
                    .unwrap();
            }

            let mut allocations = Vec::new();
            for op in ops {
                match op {
                    InventoryOp::Allocate(value) => {
                        let available = harness.allocator.available(product).unwrap();
                        let request = AllocationRequest::new(product, UserId::new(), Paise::new(value));
                        match harness.allocator.allocate(request).await {
                            Ok(result) => {
                                prop_assert!(Paise::new(value) <= available);
                                let taken = Paise::sum(result.sources.iter().map(|s| s.value_taken)).unwrap();
                                prop_assert_eq!(taken, Paise::new(value));
                                allocations.push(result.allocation.allocation_id);
                            }
                            Err(Error::InsufficientInventory { available: reported, .. }) => {
                                prop_assert!(Paise::new(value) > available);
                                prop_assert_eq!(reported, available);
                            }
                            Err(e) => prop_assert!(false, "unexpected error: {}", e),
                        }
                    }
                    InventoryOp::Compensate(pick) | InventoryOp::Reverse(pick) => {
                        if allocations.is_empty() {
                            continue;
                        }
                        let mode = if matches!(op, InventoryOp::Compensate(_)) {
                            DeallocationMode::Compensation
                        } else {
                            DeallocationMode::Reversal
                        };
                        let id = allocations.swap_remove(pick % allocations.len());
                        let record = harness.allocator.deallocate(id, mode, "property").await.unwrap();
                        let undone = record.returned.checked_add(record.loss).unwrap();
                        let held = harness.allocator.allocation(id).unwrap();
                        prop_assert_eq!(undone, held.value);
                        prop_assert_ne!(held.status, AllocationStatus::Active);
                    }
                }

                for audit in harness.allocator.verify_inventory().unwrap() {
                    prop_assert!(audit.is_conserved(), "lot not conserved: {:?}", audit);
                    prop_assert!(!audit.remaining.is_negative());
                }
            }

            let audits = harness.allocator.verify_inventory().unwrap();
            let remaining = Paise::sum(audits.iter().map(|a| a.remaining)).unwrap();
            prop_assert_eq!(harness.allocator.available(product).unwrap(), remaining);
            prop_assert!(harness.ledger.trial_balance().unwrap().is_balanced());
            Ok(())
        })?;
    }
}
