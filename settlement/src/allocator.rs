//! FIFO inventory allocator
//!
//! Lots of a product are consumed oldest-first. Each candidate lot is
//! row-locked in FIFO order before its `value_remaining` is read, so two
//! allocations against the same product serialize on the lots they contend
//! for. An allocation either takes the full requested value or writes
//! nothing.
//!
//! Every allocation records which lots it drew from. Undoing an allocation
//! returns value to those same lots; in reversal mode, value belonging to an
//! exhausted lot is booked as an inventory loss instead.

use crate::{
    config::AllocatorConfig,
    metrics::SettlementMetrics,
    tables,
    types::*,
    Error, Result,
};
use chrono::Utc;
use ledger_core::storage::compose_key;
use ledger_core::{
    AllocationId, BulkPurchaseId, CapitalEvent, DoubleEntryLedger, Paise, ProductId, Reference,
    RowGuard, RowLocks, Storage, UserId, WriteSet,
};
use std::collections::HashMap;
use std::sync::Arc;

fn lot_row_key(lot_id: &BulkPurchaseId) -> String {
    RowLocks::key("lot", lot_id)
}

fn source_key(allocation_id: &AllocationId, position: u32) -> Vec<u8> {
    compose_key(&[allocation_id.as_bytes(), &position.to_be_bytes()])
}

/// Per-lot conservation check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotAudit {
    /// Lot
    pub bulk_purchase_id: BulkPurchaseId,
    /// Value received into inventory
    pub received: Paise,
    /// Still unallocated
    pub remaining: Paise,
    /// Held by active allocations
    pub allocated: Paise,
    /// Written off as inventory loss
    pub lost: Paise,
}

impl LotAudit {
    /// received == remaining + allocated + lost
    pub fn is_conserved(&self) -> bool {
        self.received.value()
            == self.remaining.value() + self.allocated.value() + self.lost.value()
    }
}

/// FIFO allocator over bulk purchase lots
#[derive(Debug)]
pub struct FifoAllocator {
    storage: Arc<Storage>,
    locks: Arc<RowLocks>,
    ledger: Arc<DoubleEntryLedger>,
    metrics: SettlementMetrics,
    config: AllocatorConfig,
}

impl FifoAllocator {
    /// Create over the shared store, lock table and double-entry ledger
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<RowLocks>,
        ledger: Arc<DoubleEntryLedger>,
        metrics: SettlementMetrics,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            storage,
            locks,
            ledger,
            metrics,
            config,
        }
    }

    /// Record a bulk purchase and its cash payment
    pub fn record_lot(&self, new_lot: NewLot) -> Result<BulkPurchase> {
        new_lot.face_value_purchased.ensure_positive()?;
        new_lot.total_value_received.ensure_positive()?;
        if new_lot.actual_cost_paid.is_negative() {
            return Err(ledger_core::Error::InvalidAmount(format!(
                "lot cost must not be negative, got {}",
                new_lot.actual_cost_paid
            ))
            .into());
        }

        let bulk_purchase_id = BulkPurchaseId::new();
        let created_at = new_lot.received_at.unwrap_or_else(Utc::now);
        let order_key = tables::lot_order_key(&new_lot.product_id, created_at, &bulk_purchase_id)?;

        let mut lot = BulkPurchase {
            bulk_purchase_id,
            product_id: new_lot.product_id,
            face_value_purchased: new_lot.face_value_purchased,
            total_value_received: new_lot.total_value_received,
            value_remaining: new_lot.total_value_received,
            actual_cost_paid: new_lot.actual_cost_paid,
            seller: new_lot.seller,
            created_at,
            payment_pair: None,
        };

        let mut writes = WriteSet::new();
        if lot.actual_cost_paid.is_positive() {
            let pair = self.ledger.stage(
                &mut writes,
                CapitalEvent::BulkPurchasePayment,
                lot.actual_cost_paid,
                Reference::BulkPurchase(lot.bulk_purchase_id),
                &lot.seller,
            )?;
            lot.payment_pair = Some(pair.pair_id);
        }

        writes.insert(tables::LOTS, lot.bulk_purchase_id.as_bytes(), &lot)?;
        writes.insert(tables::LOTS_BY_PRODUCT, order_key, &lot.bulk_purchase_id)?;
        self.storage.commit(writes)?;

        tracing::info!(
            bulk_purchase_id = %lot.bulk_purchase_id,
            product_id = %lot.product_id,
            value = lot.total_value_received.value(),
            cost = lot.actual_cost_paid.value(),
            "Bulk purchase recorded"
        );

        Ok(lot)
    }

    /// Allocate `request.value` from the product's lots, oldest first
    pub async fn allocate(&self, request: AllocationRequest) -> Result<AllocationResult> {
        request.value.ensure_positive()?;

        let _key_guard = match &request.idempotency_key {
            Some(key) => Some(self.locks.lock(RowLocks::key("allocation_key", key)).await?),
            None => None,
        };
        if let Some(key) = &request.idempotency_key {
            if let Some(result) = self.replay(key, &request)? {
                return Ok(result);
            }
        }

        // Exhausted lots stay candidates: a compensation may refill them
        // before their lock is ours
        let candidates: Vec<BulkPurchaseId> = self
            .lots(request.product_id)?
            .into_iter()
            .map(|lot| lot.bulk_purchase_id)
            .collect();

        // Lock in FIFO order and read each lot only once it is held
        let mut guards: Vec<RowGuard> = Vec::new();
        let mut takes: Vec<(BulkPurchase, Paise)> = Vec::new();
        let mut outstanding = request.value;
        for lot_id in candidates {
            if outstanding.is_zero() {
                break;
            }
            guards.push(self.locks.lock(lot_row_key(&lot_id)).await?);
            let lot = self.lot(lot_id)?;
            if !lot.value_remaining.is_positive() {
                continue;
            }
            let take = outstanding.min(lot.value_remaining);
            outstanding = outstanding.checked_sub(take)?;
            takes.push((lot, take));
        }

        if outstanding.is_positive() {
            let available = request.value.checked_sub(outstanding)?;
            self.metrics.inventory_shortfalls.inc();
            tracing::warn!(
                product_id = %request.product_id,
                requested = request.value.value(),
                available = available.value(),
                "Allocation refused: insufficient inventory"
            );
            return Err(Error::InsufficientInventory {
                product_id: request.product_id,
                requested: request.value,
                available,
            });
        }

        let allocation = Allocation {
            allocation_id: AllocationId::new(),
            product_id: request.product_id,
            user_id: request.user_id,
            value: request.value,
            reference: request.reference,
            status: AllocationStatus::Active,
            idempotency_key: request.idempotency_key.clone(),
            created_at: Utc::now(),
        };

        let mut writes = WriteSet::new();
        let mut sources = Vec::with_capacity(takes.len());
        for (position, (mut lot, take)) in takes.into_iter().enumerate() {
            lot.value_remaining = lot.value_remaining.checked_sub(take)?;
            if lot.value_remaining.is_negative() {
                return Err(ledger_core::Error::InvariantViolation(format!(
                    "lot {} would go below zero",
                    lot.bulk_purchase_id
                ))
                .into());
            }
            writes.upsert(tables::LOTS, lot.bulk_purchase_id.as_bytes(), &lot)?;

            let source = AllocationSource {
                allocation_id: allocation.allocation_id,
                bulk_purchase_id: lot.bulk_purchase_id,
                value_taken: take,
                position: position as u32,
            };
            writes.insert(
                tables::ALLOCATION_SOURCES,
                source_key(&allocation.allocation_id, source.position),
                &source,
            )?;
            sources.push(source);
        }

        self.stage_allocation(&mut writes, &allocation)?;
        self.storage.commit(writes)?;
        drop(guards);

        self.metrics.allocations.inc();
        tracing::info!(
            allocation_id = %allocation.allocation_id,
            product_id = %allocation.product_id,
            user_id = %allocation.user_id,
            value = allocation.value.value(),
            lots = sources.len(),
            "Inventory allocated"
        );

        Ok(AllocationResult {
            allocation,
            sources,
            replayed: false,
        })
    }

    fn stage_allocation(&self, writes: &mut WriteSet, allocation: &Allocation) -> Result<()> {
        let id = allocation.allocation_id;
        writes.upsert(tables::ALLOCATIONS, id.as_bytes(), allocation)?;
        writes.insert(
            tables::ALLOCATIONS_BY_USER,
            compose_key(&[allocation.user_id.as_bytes(), id.as_bytes()]),
            &id,
        )?;
        if let Some(reference) = &allocation.reference {
            writes.insert(
                tables::ALLOCATIONS_BY_REFERENCE,
                compose_key(&[&reference.key_bytes(), id.as_bytes()]),
                &id,
            )?;
        }
        if let Some(key) = &allocation.idempotency_key {
            writes.insert(tables::ALLOCATION_KEYS, key.as_bytes(), &id)?;
        }
        Ok(())
    }

    fn replay(&self, key: &str, request: &AllocationRequest) -> Result<Option<AllocationResult>> {
        let Some(allocation_id) = self
            .storage
            .get::<AllocationId>(tables::ALLOCATION_KEYS, key.as_bytes())?
        else {
            return Ok(None);
        };

        let allocation = self.allocation(allocation_id)?;
        if allocation.product_id != request.product_id
            || allocation.user_id != request.user_id
            || allocation.value != request.value
        {
            return Err(ledger_core::Error::DuplicateIdempotencyKey(key.to_string()).into());
        }

        tracing::debug!(
            allocation_id = %allocation_id,
            idempotency_key = key,
            "Replayed allocation"
        );
        Ok(Some(AllocationResult {
            sources: self.sources(allocation_id)?,
            allocation,
            replayed: true,
        }))
    }

    /// Undo an allocation; repeating the call returns the first record
    pub async fn deallocate(
        &self,
        allocation_id: AllocationId,
        mode: DeallocationMode,
        reason: &str,
    ) -> Result<Deallocation> {
        let _allocation_guard = self
            .locks
            .lock(RowLocks::key("allocation", allocation_id))
            .await?;

        if let Some(existing) = self.deallocation(allocation_id)? {
            return Ok(existing);
        }

        let mut allocation = self.allocation(allocation_id)?;
        if allocation.status != AllocationStatus::Active {
            return Err(Error::InvalidState(format!(
                "allocation {} is {:?} without a deallocation record",
                allocation_id, allocation.status
            )));
        }

        // Sources are stored in FIFO position order, matching allocate's lock order
        let sources = self.sources(allocation_id)?;
        let mut guards = Vec::with_capacity(sources.len());
        for source in &sources {
            guards.push(self.locks.lock(lot_row_key(&source.bulk_purchase_id)).await?);
        }

        let mut writes = WriteSet::new();
        let mut lots: HashMap<BulkPurchaseId, BulkPurchase> = HashMap::new();
        let mut lines = Vec::with_capacity(sources.len());
        let mut returned = Paise::ZERO;
        let mut loss = Paise::ZERO;

        for source in &sources {
            let lot = match lots.remove(&source.bulk_purchase_id) {
                Some(lot) => lot,
                None => self.lot(source.bulk_purchase_id)?,
            };
            let give_back = match mode {
                DeallocationMode::Compensation => true,
                DeallocationMode::Reversal => {
                    lot.value_remaining.is_positive() || self.config.return_to_exhausted_lots
                }
            };

            let mut lot = lot;
            if give_back {
                lot.value_remaining = lot.value_remaining.checked_add(source.value_taken)?;
                if lot.value_remaining > lot.total_value_received {
                    return Err(ledger_core::Error::InvariantViolation(format!(
                        "lot {} would exceed its received value",
                        lot.bulk_purchase_id
                    ))
                    .into());
                }
                returned = returned.checked_add(source.value_taken)?;
            } else {
                loss = loss.checked_add(source.value_taken)?;
            }

            lines.push(DeallocationLine {
                bulk_purchase_id: source.bulk_purchase_id,
                value: source.value_taken,
                returned: give_back,
            });
            lots.insert(lot.bulk_purchase_id, lot);
        }

        for lot in lots.values() {
            writes.upsert(tables::LOTS, lot.bulk_purchase_id.as_bytes(), lot)?;
        }

        let loss_pair = if loss.is_positive() {
            let pair = self.ledger.stage(
                &mut writes,
                CapitalEvent::InventoryLoss,
                loss,
                Reference::Allocation(allocation_id),
                reason,
            )?;
            Some(pair.pair_id)
        } else {
            None
        };

        allocation.status = AllocationStatus::Reversed;
        writes.upsert(tables::ALLOCATIONS, allocation_id.as_bytes(), &allocation)?;

        let record = Deallocation {
            allocation_id,
            mode,
            lines,
            returned,
            loss,
            loss_pair,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        writes.insert(tables::DEALLOCATIONS, allocation_id.as_bytes(), &record)?;
        self.storage.commit(writes)?;
        drop(guards);

        tracing::info!(
            allocation_id = %allocation_id,
            mode = ?mode,
            returned = returned.value(),
            loss = loss.value(),
            "Allocation undone"
        );

        Ok(record)
    }

    // ===== Reads =====

    /// Load a lot
    pub fn lot(&self, lot_id: BulkPurchaseId) -> Result<BulkPurchase> {
        self.storage
            .get(tables::LOTS, lot_id.as_bytes())?
            .ok_or_else(|| Error::not_found("bulk purchase", lot_id))
    }

    /// Lots of a product in FIFO order
    pub fn lots(&self, product_id: ProductId) -> Result<Vec<BulkPurchase>> {
        self.storage
            .scan_prefix::<BulkPurchaseId>(tables::LOTS_BY_PRODUCT, product_id.as_bytes())?
            .into_iter()
            .map(|(_, lot_id)| self.lot(lot_id))
            .collect()
    }

    /// Unallocated value of a product
    pub fn available(&self, product_id: ProductId) -> Result<Paise> {
        Ok(Paise::sum(
            self.lots(product_id)?
                .into_iter()
                .map(|lot| lot.value_remaining),
        )?)
    }

    /// Load an allocation
    pub fn allocation(&self, allocation_id: AllocationId) -> Result<Allocation> {
        self.storage
            .get(tables::ALLOCATIONS, allocation_id.as_bytes())?
            .ok_or_else(|| Error::not_found("allocation", allocation_id))
    }

    /// Source lots of an allocation in FIFO order
    pub fn sources(&self, allocation_id: AllocationId) -> Result<Vec<AllocationSource>> {
        Ok(self
            .storage
            .scan_prefix::<AllocationSource>(tables::ALLOCATION_SOURCES, allocation_id.as_bytes())?
            .into_iter()
            .map(|(_, source)| source)
            .collect())
    }

    /// Deallocation record, if the allocation was undone
    pub fn deallocation(&self, allocation_id: AllocationId) -> Result<Option<Deallocation>> {
        Ok(self
            .storage
            .get(tables::DEALLOCATIONS, allocation_id.as_bytes())?)
    }

    /// Allocations made for `reference`
    pub fn allocations_for(&self, reference: &Reference) -> Result<Vec<Allocation>> {
        self.storage
            .scan_prefix::<AllocationId>(tables::ALLOCATIONS_BY_REFERENCE, &reference.key_bytes())?
            .into_iter()
            .map(|(_, id)| self.allocation(id))
            .collect()
    }

    /// Allocations held by a user
    pub fn allocations_for_user(&self, user_id: UserId) -> Result<Vec<Allocation>> {
        self.storage
            .scan_prefix::<AllocationId>(tables::ALLOCATIONS_BY_USER, user_id.as_bytes())?
            .into_iter()
            .map(|(_, id)| self.allocation(id))
            .collect()
    }

    /// Conservation check of every lot
    pub fn verify_inventory(&self) -> Result<Vec<LotAudit>> {
        let mut audits: HashMap<BulkPurchaseId, LotAudit> = self
            .storage
            .scan_all::<BulkPurchase>(tables::LOTS)?
            .into_iter()
            .map(|(_, lot)| {
                (
                    lot.bulk_purchase_id,
                    LotAudit {
                        bulk_purchase_id: lot.bulk_purchase_id,
                        received: lot.total_value_received,
                        remaining: lot.value_remaining,
                        allocated: Paise::ZERO,
                        lost: Paise::ZERO,
                    },
                )
            })
            .collect();

        let mut active: HashMap<AllocationId, bool> = HashMap::new();
        for (_, allocation) in self.storage.scan_all::<Allocation>(tables::ALLOCATIONS)? {
            active.insert(
                allocation.allocation_id,
                allocation.status == AllocationStatus::Active,
            );
        }

        for (_, source) in self
            .storage
            .scan_all::<AllocationSource>(tables::ALLOCATION_SOURCES)?
        {
            if active.get(&source.allocation_id).copied().unwrap_or(false) {
                if let Some(audit) = audits.get_mut(&source.bulk_purchase_id) {
                    audit.allocated = audit.allocated.checked_add(source.value_taken)?;
                }
            }
        }

        for (_, record) in self.storage.scan_all::<Deallocation>(tables::DEALLOCATIONS)? {
            for line in record.lines.iter().filter(|line| !line.returned) {
                if let Some(audit) = audits.get_mut(&line.bulk_purchase_id) {
                    audit.lost = audit.lost.checked_add(line.value)?;
                }
            }
        }

        let mut audits: Vec<LotAudit> = audits.into_values().collect();
        audits.sort_by_key(|audit| audit.bulk_purchase_id);
        Ok(audits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use chrono::Duration;
    use ledger_core::{Account, Metrics, Referenced};
    use prometheus::Registry;
    use tempfile::TempDir;

    struct Fixture {
        allocator: Arc<FifoAllocator>,
        ledger: Arc<DoubleEntryLedger>,
        _temp_dir: TempDir,
    }

    fn fixture(config: AllocatorConfig) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = Config::default();
        settings.ledger.data_dir = temp_dir.path().to_path_buf();
        settings.ledger.rocksdb.sync_writes = false;

        let registry = Arc::new(Registry::new());
        let storage = Arc::new(Storage::open(&settings.ledger, tables::SETTLEMENT_TABLES).unwrap());
        let locks = Arc::new(RowLocks::new(1_000));
        let ledger = Arc::new(DoubleEntryLedger::new(
            storage.clone(),
            Metrics::with_registry(registry.clone()).unwrap(),
        ));
        let metrics = SettlementMetrics::with_registry(&registry).unwrap();
        let allocator = Arc::new(FifoAllocator::new(storage, locks, ledger.clone(), metrics, config));
        Fixture {
            allocator,
            ledger,
            _temp_dir: temp_dir,
        }
    }

    fn two_lots(allocator: &FifoAllocator, product: ProductId) -> (BulkPurchase, BulkPurchase) {
        let now = Utc::now();
        // Recorded newest first to prove ordering comes from created_at
        let day2 = allocator
            .record_lot(NewLot::new(product, Paise::new(1_000)).received_at(now - Duration::days(1)))
            .unwrap();
        let day1 = allocator
            .record_lot(NewLot::new(product, Paise::new(1_000)).received_at(now - Duration::days(2)))
            .unwrap();
        (day1, day2)
    }

    #[tokio::test]
    async fn test_fifo_consumes_oldest_lot_first() {
        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        let (day1, day2) = two_lots(&f.allocator, product);

        let result = f
            .allocator
            .allocate(AllocationRequest::new(product, UserId::new(), Paise::new(1_500)))
            .await
            .unwrap();

        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.sources[0].bulk_purchase_id, day1.bulk_purchase_id);
        assert_eq!(result.sources[0].value_taken, Paise::new(1_000));
        assert_eq!(result.sources[1].bulk_purchase_id, day2.bulk_purchase_id);
        assert_eq!(result.sources[1].value_taken, Paise::new(500));

        assert_eq!(f.allocator.lot(day1.bulk_purchase_id).unwrap().value_remaining, Paise::ZERO);
        assert_eq!(
            f.allocator.lot(day2.bulk_purchase_id).unwrap().value_remaining,
            Paise::new(500)
        );
    }

    #[tokio::test]
    async fn test_shortfall_allocates_nothing() {
        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        two_lots(&f.allocator, product);

        let result = f
            .allocator
            .allocate(AllocationRequest::new(product, UserId::new(), Paise::new(2_001)))
            .await;
        match result {
            Err(Error::InsufficientInventory { available, .. }) => {
                assert_eq!(available, Paise::new(2_000))
            }
            other => panic!("expected InsufficientInventory, got {:?}", other),
        }
        assert_eq!(f.allocator.available(product).unwrap(), Paise::new(2_000));
    }

    #[tokio::test]
    async fn test_idempotency_key_does_not_double_consume() {
        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        two_lots(&f.allocator, product);
        let user = UserId::new();

        let request =
            AllocationRequest::new(product, user, Paise::new(700)).with_idempotency_key("order-1");
        let first = f.allocator.allocate(request.clone()).await.unwrap();
        let second = f.allocator.allocate(request).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.allocation.allocation_id, second.allocation.allocation_id);
        assert_eq!(f.allocator.available(product).unwrap(), Paise::new(1_300));

        let conflicting =
            AllocationRequest::new(product, user, Paise::new(800)).with_idempotency_key("order-1");
        let result = f.allocator.allocate(conflicting).await;
        assert!(matches!(
            result,
            Err(Error::Ledger(ledger_core::Error::DuplicateIdempotencyKey(_)))
        ));
    }

    #[tokio::test]
    async fn test_compensation_returns_value_to_same_lots() {
        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        let (day1, day2) = two_lots(&f.allocator, product);

        let result = f
            .allocator
            .allocate(AllocationRequest::new(product, UserId::new(), Paise::new(1_500)))
            .await
            .unwrap();
        let id = result.allocation.allocation_id;

        let record = f
            .allocator
            .deallocate(id, DeallocationMode::Compensation, "saga compensation")
            .await
            .unwrap();
        assert_eq!(record.returned, Paise::new(1_500));
        assert_eq!(record.loss, Paise::ZERO);
        assert_eq!(f.allocator.lot(day1.bulk_purchase_id).unwrap().value_remaining, Paise::new(1_000));
        assert_eq!(f.allocator.lot(day2.bulk_purchase_id).unwrap().value_remaining, Paise::new(1_000));

        // Second call returns the same record
        let again = f
            .allocator
            .deallocate(id, DeallocationMode::Compensation, "again")
            .await
            .unwrap();
        assert_eq!(again, record);
        assert!(f.allocator.verify_inventory().unwrap().iter().all(LotAudit::is_conserved));
    }

    #[tokio::test]
    async fn test_lot_refilled_while_waiting_is_still_consumed_first() {
        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        let (day1, day2) = two_lots(&f.allocator, product);

        let first = f
            .allocator
            .allocate(AllocationRequest::new(product, UserId::new(), Paise::new(1_000)))
            .await
            .unwrap();
        assert_eq!(f.allocator.lot(day1.bulk_purchase_id).unwrap().value_remaining, Paise::ZERO);

        // Hold the exhausted lot so the compensation queues ahead of the allocation
        let held = f.allocator.locks.lock(lot_row_key(&day1.bulk_purchase_id)).await.unwrap();
        let compensation = {
            let allocator = f.allocator.clone();
            let id = first.allocation.allocation_id;
            tokio::spawn(async move {
                allocator
                    .deallocate(id, DeallocationMode::Compensation, "saga compensation")
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let allocation = {
            let allocator = f.allocator.clone();
            tokio::spawn(async move {
                allocator
                    .allocate(AllocationRequest::new(product, UserId::new(), Paise::new(300)))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        drop(held);

        compensation.await.unwrap().unwrap();
        let result = allocation.await.unwrap().unwrap();
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].bulk_purchase_id, day1.bulk_purchase_id);
        assert_eq!(f.allocator.lot(day1.bulk_purchase_id).unwrap().value_remaining, Paise::new(700));
        assert_eq!(f.allocator.lot(day2.bulk_purchase_id).unwrap().value_remaining, Paise::new(1_000));
        assert!(f.allocator.verify_inventory().unwrap().iter().all(LotAudit::is_conserved));
    }

    #[tokio::test]
    async fn test_reversal_books_exhausted_lot_as_loss() {
        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        let (day1, day2) = two_lots(&f.allocator, product);

        let result = f
            .allocator
            .allocate(AllocationRequest::new(product, UserId::new(), Paise::new(1_500)))
            .await
            .unwrap();

        let record = f
            .allocator
            .deallocate(result.allocation.allocation_id, DeallocationMode::Reversal, "chargeback")
            .await
            .unwrap();

        // day1 was exhausted; day2 still held inventory
        assert_eq!(record.loss, Paise::new(1_000));
        assert_eq!(record.returned, Paise::new(500));
        assert!(record.loss_pair.is_some());
        assert_eq!(f.allocator.lot(day1.bulk_purchase_id).unwrap().value_remaining, Paise::ZERO);
        assert_eq!(f.allocator.lot(day2.bulk_purchase_id).unwrap().value_remaining, Paise::new(1_000));

        assert_eq!(f.ledger.account_balance(Account::Expenses).unwrap(), Paise::new(1_000));
        assert!(f.ledger.trial_balance().unwrap().is_balanced());
        assert!(f.allocator.verify_inventory().unwrap().iter().all(LotAudit::is_conserved));
    }

    #[test]
    fn test_record_lot_posts_purchase_payment() {
        let f = fixture(AllocatorConfig::default());
        let lot = f
            .allocator
            .record_lot(
                NewLot::new(ProductId::new(), Paise::new(10_000))
                    .with_cost(Paise::new(9_000))
                    .with_seller("Early employee"),
            )
            .unwrap();

        let pairs = f.ledger.pairs_for_reference(&lot.reference()).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].debit.account, Account::InventoryExpense);
        assert_eq!(pairs[0].credit.account, Account::Cash);
        assert_eq!(pairs[0].amount(), Paise::new(9_000));
    }

    #[test]
    fn test_record_lot_rejects_unorderable_purchase_time() {
        use chrono::TimeZone;

        let f = fixture(AllocatorConfig::default());
        let product = ProductId::new();
        let far_future = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();

        let result = f
            .allocator
            .record_lot(NewLot::new(product, Paise::new(1_000)).received_at(far_future));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(f.allocator.lots(product).unwrap().is_empty());
        assert!(f.ledger.trial_balance().unwrap().is_balanced());
    }
}
