//! Main settlement engine
//!
//! Wires wallet accounting, the double-entry ledger, the FIFO allocator, the
//! reversal and withdrawal managers and the saga orchestrator over one
//! RocksDB store, and exposes the operations callers use.

use crate::{
    allocator::FifoAllocator,
    config::Config,
    metrics::SettlementMetrics,
    reversal::ReversalManager,
    runner::SagaRunner,
    saga::{
        steps::{self, StepServices},
        SagaExecution, SagaOrchestrator, SagaStatus, SagaStep, StepRegistry,
    },
    tables,
    types::*,
    withdrawal::WithdrawalManager,
    Error, Result,
};
use chrono::Utc;
use ledger_core::{
    AllocationId, BalanceView, CapitalEvent, DoubleEntryLedger, EntryKind, EntryReversal,
    HistoryRange, LedgerEntry, LedgerHistory, Paise, PaymentId, PostingRequest, ProductId,
    ReceivableId, Reference, RowLocks, SagaId, Storage, UserId, WalletAccounting, WalletId,
    WithdrawalId,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Settlement engine
#[derive(Debug)]
pub struct SettlementEngine {
    storage: Arc<Storage>,
    wallets: Arc<WalletAccounting>,
    ledger: Arc<DoubleEntryLedger>,
    allocator: Arc<FifoAllocator>,
    reversals: Arc<ReversalManager>,
    withdrawals: Arc<WithdrawalManager>,
    orchestrator: Arc<SagaOrchestrator>,
    runner: SagaRunner,
    registry: Arc<Registry>,
    metrics: SettlementMetrics,
    config: Config,
}

impl SettlementEngine {
    /// Open the store, build every component and start the saga workers
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(Registry::new());
        let ledger_metrics = ledger_core::Metrics::with_registry(registry.clone())?;
        let metrics = SettlementMetrics::with_registry(&registry)?;

        let storage = Arc::new(Storage::open(&config.ledger, tables::SETTLEMENT_TABLES)?);
        let locks = Arc::new(RowLocks::new(config.ledger.locking.lock_timeout_ms));

        let wallets = Arc::new(WalletAccounting::new(
            storage.clone(),
            locks.clone(),
            ledger_metrics.clone(),
            config.ledger.wallet.clone(),
        ));
        let ledger = Arc::new(DoubleEntryLedger::new(storage.clone(), ledger_metrics));
        let allocator = Arc::new(FifoAllocator::new(
            storage.clone(),
            locks.clone(),
            ledger.clone(),
            metrics.clone(),
            config.allocator.clone(),
        ));
        let reversals = Arc::new(ReversalManager::new(
            wallets.clone(),
            ledger.clone(),
            metrics.clone(),
            config.receivables.clone(),
        ));
        let withdrawals = Arc::new(WithdrawalManager::new(
            wallets.clone(),
            ledger.clone(),
            config.withdrawal.clone(),
        ));

        let mut step_registry = StepRegistry::new();
        steps::register_defaults(
            &mut step_registry,
            &StepServices {
                storage: storage.clone(),
                wallets: wallets.clone(),
                ledger: ledger.clone(),
                allocator: allocator.clone(),
                reversals: reversals.clone(),
                withdrawals: withdrawals.clone(),
            },
        );
        let orchestrator = Arc::new(SagaOrchestrator::new(
            storage.clone(),
            locks,
            step_registry,
            metrics.clone(),
            config.saga.clone(),
        ));
        let runner = SagaRunner::start(
            orchestrator.clone(),
            config.saga.workers,
            config.saga.queue_capacity,
        );

        let engine = Self {
            storage,
            wallets,
            ledger,
            allocator,
            reversals,
            withdrawals,
            orchestrator,
            runner,
            registry,
            metrics,
            config,
        };

        if engine.config.saga.recover_on_start {
            engine.recover_sagas().await?;
        }

        tracing::info!(
            service = %engine.config.service_name,
            version = %engine.config.service_version,
            data_dir = %engine.config.ledger.data_dir.display(),
            "Settlement engine started"
        );
        Ok(engine)
    }

    // ===== Payments =====

    /// Settle a confirmed payment through a saga
    ///
    /// Deduplicated by payment id: repeating a request returns the saga of
    /// the first one. The saga runs in the background; poll `saga` or use
    /// `wait_for_saga`.
    pub async fn request_payment(&self, request: PaymentRequest) -> Result<SagaId> {
        request.amount.ensure_positive()?;
        if let Some(bonus) = request.bonus {
            bonus.ensure_positive()?;
        }

        let wallet = self.wallets.open_wallet(request.user_id).await?;
        let (saga_type, metadata, plan) = steps::payment_saga(&request, wallet.wallet_id);
        let key = format!("payment:{}", request.payment_id);
        let (saga, created) = self
            .orchestrator
            .begin_with_key(&key, saga_type, metadata, plan)
            .await?;

        if created {
            self.runner.submit(saga.saga_id).await?;
            tracing::info!(
                payment_id = %request.payment_id,
                saga_id = %saga.saga_id,
                amount = request.amount.value(),
                saga_type = saga_type,
                "Payment accepted"
            );
        } else {
            tracing::debug!(payment_id = %request.payment_id, saga_id = %saga.saga_id, "Payment replayed");
        }
        Ok(saga.saga_id)
    }

    /// Current saga state
    pub fn saga(&self, saga_id: SagaId) -> Result<SagaExecution> {
        self.orchestrator.saga(saga_id)
    }

    /// Step records of a saga
    pub fn saga_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        self.orchestrator.steps(saga_id)
    }

    /// Poll until the saga stops moving or `timeout` passes; returns the
    /// latest state either way
    pub async fn wait_for_saga(&self, saga_id: SagaId, timeout: Duration) -> Result<SagaExecution> {
        let settled = |saga: &SagaExecution| {
            saga.is_terminal() || (saga.status == SagaStatus::Failed && saga.requires_manual_resolution)
        };

        let poll = async {
            loop {
                let saga = self.saga(saga_id)?;
                if settled(&saga) {
                    return Ok::<_, Error>(saga);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => self.saga(saga_id),
        }
    }

    // ===== Withdrawals =====

    /// Lock funds for a payout
    pub async fn request_withdrawal(
        &self,
        user_id: UserId,
        amount: Paise,
        bank_details: BankDetails,
        idempotency_key: &str,
    ) -> Result<WithdrawalId> {
        let withdrawal = self
            .withdrawals
            .request(user_id, amount, bank_details, idempotency_key)
            .await?;
        Ok(withdrawal.withdrawal_id)
    }

    /// Pay out a pending withdrawal through the payout saga
    pub async fn complete_withdrawal(
        &self,
        withdrawal_id: WithdrawalId,
        payout_reference: &str,
    ) -> Result<SagaExecution> {
        self.withdrawals.withdrawal(withdrawal_id)?;

        let (saga_type, metadata, plan) = steps::payout_saga(withdrawal_id, payout_reference);
        let key = format!("withdrawal:{}", withdrawal_id);
        let (saga, _) = self
            .orchestrator
            .begin_with_key(&key, saga_type, metadata, plan)
            .await?;
        self.runner.run_and_wait(saga.saga_id).await
    }

    /// Refuse a pending withdrawal
    pub async fn reject_withdrawal(
        &self,
        withdrawal_id: WithdrawalId,
        admin: &str,
        reason: &str,
    ) -> Result<Withdrawal> {
        self.withdrawals.reject(withdrawal_id, admin, reason).await
    }

    /// Cancel a pending withdrawal on the user's behalf
    pub async fn cancel_withdrawal(&self, withdrawal_id: WithdrawalId, user_id: UserId) -> Result<Withdrawal> {
        self.withdrawals.cancel(withdrawal_id, user_id).await
    }

    /// Load a withdrawal
    pub fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<Withdrawal> {
        self.withdrawals.withdrawal(withdrawal_id)
    }

    /// Expire withdrawals whose fund lock outlived its lifetime
    pub async fn expire_stale_withdrawals(&self) -> Result<usize> {
        Ok(self.withdrawals.expire_stale(Utc::now()).await?.len())
    }

    // ===== Inventory =====

    /// Record a bulk purchase lot
    pub fn record_bulk_purchase(&self, lot: NewLot) -> Result<BulkPurchase> {
        self.allocator.record_lot(lot)
    }

    /// Allocate inventory directly (outside a payment saga)
    pub async fn request_allocation(
        &self,
        product_id: ProductId,
        user_id: UserId,
        face_value: Paise,
        idempotency_key: &str,
    ) -> Result<AllocationResult> {
        let mut request = AllocationRequest::new(product_id, user_id, face_value);
        if !idempotency_key.is_empty() {
            request = request.with_idempotency_key(idempotency_key);
        }
        self.allocator.allocate(request).await
    }

    /// Unallocated value of a product
    pub fn available_inventory(&self, product_id: ProductId) -> Result<Paise> {
        self.allocator.available(product_id)
    }

    /// Load an allocation
    pub fn allocation(&self, allocation_id: AllocationId) -> Result<Allocation> {
        self.allocator.allocation(allocation_id)
    }

    // ===== Reversals =====

    /// Record a refund or chargeback of a settled payment
    ///
    /// A full reversal first returns any shares bought with the payment.
    /// Returns the receivable opened for what the wallet could not cover.
    /// Repeating the same request returns the first outcome; a different
    /// reversal of an already reversed payment fails with `AlreadyReversed`.
    pub async fn report_reversal(
        &self,
        payment_id: PaymentId,
        amount: Option<Paise>,
        source: ReversalSource,
        reason: &str,
    ) -> Result<Option<ReceivableId>> {
        let payment = Reference::Payment(payment_id);
        let deposit = self
            .wallets
            .entries_for_reference(&payment)?
            .into_iter()
            .find(|entry| entry.kind == EntryKind::Deposit)
            .ok_or_else(|| Error::not_found("payment", payment_id))?;

        let _guard = self
            .wallets
            .row_locks()
            .lock(RowLocks::key("payment_reversal", payment_id))
            .await?;

        let requested = amount.unwrap_or(deposit.amount);
        if let Some(link) = self.wallets.entry_reversal(deposit.entry_id)? {
            return self.replay_reversal(&link, payment_id, requested, source);
        }

        let full = requested >= deposit.amount;
        if full {
            for allocation in self.allocator.allocations_for(&payment)? {
                if allocation.status != AllocationStatus::Active {
                    continue;
                }
                self.allocator
                    .deallocate(allocation.allocation_id, DeallocationMode::Reversal, reason)
                    .await?;
                self.reversals
                    .refund_share_purchase(&allocation, payment_id, reason)
                    .await?;
            }
        }

        let outcome = self.reversals.reverse(&deposit, source, reason, amount).await?;
        Ok(outcome.receivable.map(|r| r.receivable_id))
    }

    // A recorded reversal answers only the request that produced it
    fn replay_reversal(
        &self,
        link: &EntryReversal,
        payment_id: PaymentId,
        requested: Paise,
        source: ReversalSource,
    ) -> Result<Option<ReceivableId>> {
        let mut recorded = Paise::ZERO;
        let mut recorded_source = None;
        if let Some(entry_id) = link.reversing_entry {
            let debit = self.wallets.entry(entry_id)?;
            recorded = recorded.checked_add(debit.amount)?;
            recorded_source = [ReversalSource::Refund, ReversalSource::Chargeback]
                .into_iter()
                .find(|candidate| candidate.entry_kind() == debit.kind);
        }
        if let Some(receivable_id) = link.receivable_id {
            let receivable = self.reversals.receivable(receivable_id)?;
            recorded = recorded.checked_add(receivable.amount)?;
            recorded_source = Some(receivable.source_type);
        }

        if recorded == requested && recorded_source == Some(source) {
            tracing::debug!(payment_id = %payment_id, "Reversal replayed");
            return Ok(link.receivable_id);
        }

        tracing::warn!(
            payment_id = %payment_id,
            recorded = recorded.value(),
            requested = requested.value(),
            "Reversal refused: payment already reversed"
        );
        Err(ledger_core::Error::AlreadyReversed(format!(
            "payment {} was already reversed for {} ({})",
            payment_id,
            recorded,
            recorded_source.map_or_else(|| "unknown".to_string(), |s| s.to_string())
        ))
        .into())
    }

    /// Record a receivable payment collected outside the wallet
    pub async fn settle_receivable(&self, receivable_id: ReceivableId, amount: Paise) -> Result<ChargebackReceivable> {
        self.reversals.settle(receivable_id, amount).await
    }

    /// Write a receivable off
    pub async fn write_off_receivable(
        &self,
        receivable_id: ReceivableId,
        admin: &str,
        reason: &str,
    ) -> Result<ChargebackReceivable> {
        self.reversals.write_off(receivable_id, admin, reason).await
    }

    /// Take a user's wallet out of recovery mode
    pub async fn exit_recovery_mode(&self, user_id: UserId, admin: &str) -> Result<()> {
        let wallet_id = self.wallet_id(user_id)?;
        self.reversals.exit_recovery_mode(wallet_id, admin).await
    }

    /// Receivables of a user, oldest first
    pub fn receivables(&self, user_id: UserId) -> Result<Vec<ChargebackReceivable>> {
        let wallet_id = self.wallet_id(user_id)?;
        self.reversals.receivables_for_wallet(wallet_id)
    }

    // ===== Wallets =====

    /// Balance of a user's wallet
    pub fn get_balance(&self, user_id: UserId) -> Result<BalanceView> {
        let wallet_id = self.wallet_id(user_id)?;
        Ok(self.wallets.balance(wallet_id)?)
    }

    /// Lazy, paginated entry history of a user's wallet
    pub fn get_ledger_history(&self, user_id: UserId, range: HistoryRange) -> Result<LedgerHistory> {
        let wallet_id = self.wallet_id(user_id)?;
        Ok(self.wallets.history(wallet_id, range)?)
    }

    /// Credit a referral bonus to both users in one atomic write
    ///
    /// A user in recovery mode gets nothing. Repeating the bonus id returns
    /// the entries of the first grant.
    pub async fn grant_referral_bonus(&self, bonus: ReferralBonus) -> Result<Vec<LedgerEntry>> {
        bonus.referrer_amount.ensure_positive()?;
        bonus.referee_amount.ensure_positive()?;
        if bonus.referrer == bonus.referee {
            return Err(Error::InvalidInput("referrer and referee must differ".into()));
        }

        let referrer = self.wallets.open_wallet(bonus.referrer).await?;
        let referee = self.wallets.open_wallet(bonus.referee).await?;
        let reference = Reference::Bonus(bonus.bonus_id);

        let mut txn = self
            .wallets
            .begin(&[referrer.wallet_id, referee.wallet_id])
            .await?;
        let existing = self.wallets.entries_for_reference(&reference)?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let grants = [
            (referrer.wallet_id, bonus.referrer_amount, "referrer"),
            (referee.wallet_id, bonus.referee_amount, "referee"),
        ];
        let mut total = Paise::ZERO;
        for (wallet_id, amount, role) in grants {
            if txn.wallet(wallet_id)?.recovery_mode {
                tracing::info!(wallet_id = %wallet_id, bonus_id = %bonus.bonus_id, "Referral bonus withheld in recovery mode");
                continue;
            }
            let request = PostingRequest::new(amount, EntryKind::BonusCredit, reference)
                .with_description(format!("Referral bonus ({})", role))
                .with_transaction_id(derived_id(bonus.bonus_id.as_uuid(), role));
            txn.credit(wallet_id, request)?;
            total = total.checked_add(amount)?;
        }

        if total.is_positive() {
            self.ledger.stage(
                txn.writes(),
                CapitalEvent::CampaignDiscount,
                total,
                reference,
                "referral bonus",
            )?;
        }
        let entries = txn.commit()?;

        tracing::info!(bonus_id = %bonus.bonus_id, total = total.value(), "Referral bonus granted");
        Ok(entries)
    }

    fn wallet_id(&self, user_id: UserId) -> Result<WalletId> {
        Ok(self
            .wallets
            .wallet_for_user(user_id)?
            .ok_or_else(|| ledger_core::Error::WalletNotFound(format!("user {}", user_id)))?
            .wallet_id)
    }

    // ===== Sagas =====

    /// Failed sagas waiting for an operator
    pub fn manual_resolution_queue(&self) -> Result<Vec<SagaExecution>> {
        self.orchestrator.manual_resolution_queue()
    }

    /// Close a saga parked for manual resolution
    pub async fn resolve_saga(&self, saga_id: SagaId, admin: &str, note: &str) -> Result<SagaExecution> {
        self.orchestrator.resolve_manually(saga_id, admin, note).await
    }

    /// Queue every unfinished saga for the workers
    pub async fn recover_sagas(&self) -> Result<usize> {
        let pending = self.orchestrator.pending()?;
        for saga in &pending {
            self.runner.submit(saga.saga_id).await?;
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Queued unfinished sagas");
        }
        Ok(pending.len())
    }

    // ===== Operations =====

    /// Replay every wallet chain, check the trial balance and lot conservation
    pub fn verify_invariants(&self) -> Result<InvariantReport> {
        let mut report = InvariantReport::default();

        for wallet in self.wallets.wallets()? {
            match self.wallets.verify_wallet(wallet.wallet_id) {
                Ok(audit) => {
                    report.wallets_verified += 1;
                    report.entries_verified += audit.entries;
                }
                Err(e) => report.violations.push(e.to_string()),
            }
        }

        let trial = self.ledger.trial_balance()?;
        report.trial_balance_ok = trial.is_balanced();
        if !report.trial_balance_ok {
            report.violations.push(format!(
                "trial balance: debits {} != credits {}",
                trial.total_debits, trial.total_credits
            ));
        }

        for audit in self.allocator.verify_inventory()? {
            report.lots_verified += 1;
            if !audit.is_conserved() {
                report.violations.push(format!(
                    "lot {}: received {} != remaining {} + allocated {} + lost {}",
                    audit.bulk_purchase_id, audit.received, audit.remaining, audit.allocated, audit.lost
                ));
            }
        }

        if report.is_clean() {
            tracing::info!(
                wallets = report.wallets_verified,
                entries = report.entries_verified,
                lots = report.lots_verified,
                "Invariants verified"
            );
        } else {
            tracing::error!(violations = report.violations.len(), "Invariant violations found");
        }
        Ok(report)
    }

    /// Prometheus text exposition of every metric
    pub fn metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Other(e.to_string()))
    }

    /// Settlement metrics
    pub fn settlement_metrics(&self) -> &SettlementMetrics {
        &self.metrics
    }

    /// Wallet accounting
    pub fn wallets(&self) -> &Arc<WalletAccounting> {
        &self.wallets
    }

    /// Double-entry ledger
    pub fn ledger(&self) -> &Arc<DoubleEntryLedger> {
        &self.ledger
    }

    /// Inventory allocator
    pub fn allocator(&self) -> &Arc<FifoAllocator> {
        &self.allocator
    }

    /// Saga orchestrator
    pub fn orchestrator(&self) -> &Arc<SagaOrchestrator> {
        &self.orchestrator
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the saga workers and flush the store
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down settlement engine");
        self.runner.shutdown().await;
        self.storage.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine(temp_dir: &tempfile::TempDir) -> SettlementEngine {
        let mut config = Config::default();
        config.ledger.data_dir = temp_dir.path().join("ledger");
        config.ledger.rocksdb.sync_writes = false;
        SettlementEngine::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir).await;
        assert!(engine.verify_invariants().unwrap().is_clean());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_balance() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir).await;
        let err = engine.get_balance(UserId::new()).unwrap_err();
        assert!(matches!(err, Error::Ledger(ledger_core::Error::WalletNotFound(_))));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir).await;
        let text = engine.metrics().unwrap();
        assert!(text.contains("settlement_sagas_started_total"));
        assert!(text.contains("ledger_entries_total"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_referral_bonus_is_granted_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir).await;
        let bonus = ReferralBonus {
            bonus_id: ledger_core::BonusId::new(),
            referrer: UserId::new(),
            referrer_amount: Paise::new(5_000),
            referee: UserId::new(),
            referee_amount: Paise::new(2_500),
        };

        let first = engine.grant_referral_bonus(bonus).await.unwrap();
        let again = engine.grant_referral_bonus(bonus).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(again.len(), 2);
        assert_eq!(engine.get_balance(bonus.referrer).unwrap().spendable, Paise::new(5_000));
        assert_eq!(engine.get_balance(bonus.referee).unwrap().spendable, Paise::new(2_500));
        assert!(engine.verify_invariants().unwrap().is_clean());
        engine.shutdown().await.unwrap();
    }
}
