//! Settlement step handlers
//!
//! | Key | Forward | Compensation |
//! |-----|---------|--------------|
//! | `payment.credit_wallet.v1` | deposit (applied to receivables first) | counter-entry |
//! | `inventory.allocate.v1` | FIFO allocation | return value to lots |
//! | `wallet.debit_share_purchase.v1` | share purchase debit | counter-entry |
//! | `bonus.credit.v1` | bonus credit + discount posting | counter-entry + reversing pair |
//! | `ledger.record_payment.v1` | receipt (+ delivery) postings | reversing pairs |
//! | `withdrawal.consume_lock.v1` | lock into withdrawal debit | credit back, mark failed |
//! | `ledger.record_payout.v1` | payout posting, complete | reversing pair |

use super::registry::{output_field, Step, StepContext, StepRegistry};
use crate::{
    allocator::FifoAllocator, reversal::ReversalManager, types::*, withdrawal::WithdrawalManager,
    Result,
};
use async_trait::async_trait;
use ledger_core::{
    Account, AllocationId, BonusId, CapitalEvent, DoubleEntryLedger, EntryId, EntryKind, PairId,
    PaymentId, PostingRequest, ProductId, Reference, Storage, UserId, WalletAccounting, WalletId,
    WithdrawalId, WriteSet,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `payment.credit_wallet.v1`
pub const CREDIT_WALLET: &str = "payment.credit_wallet.v1";
/// `inventory.allocate.v1`
pub const ALLOCATE_INVENTORY: &str = "inventory.allocate.v1";
/// `wallet.debit_share_purchase.v1`
pub const DEBIT_SHARE_PURCHASE: &str = "wallet.debit_share_purchase.v1";
/// `bonus.credit.v1`
pub const CREDIT_BONUS: &str = "bonus.credit.v1";
/// `ledger.record_payment.v1`
pub const RECORD_PAYMENT: &str = "ledger.record_payment.v1";
/// `withdrawal.consume_lock.v1`
pub const CONSUME_WITHDRAWAL_LOCK: &str = "withdrawal.consume_lock.v1";
/// `ledger.record_payout.v1`
pub const RECORD_PAYOUT: &str = "ledger.record_payout.v1";

/// Saga type of a wallet top-up
pub const PAYMENT_TOP_UP: &str = "payment.top_up";
/// Saga type of a share purchase
pub const PAYMENT_SHARE_PURCHASE: &str = "payment.share_purchase";
/// Saga type of a withdrawal payout
pub const WITHDRAWAL_PAYOUT: &str = "withdrawal.payout";

/// Components the step handlers act on
#[derive(Debug, Clone)]
pub struct StepServices {
    /// Shared store
    pub storage: Arc<Storage>,
    /// Wallet accounting
    pub wallets: Arc<WalletAccounting>,
    /// Double-entry ledger
    pub ledger: Arc<DoubleEntryLedger>,
    /// Inventory allocator
    pub allocator: Arc<FifoAllocator>,
    /// Reversals and receivables
    pub reversals: Arc<ReversalManager>,
    /// Withdrawals
    pub withdrawals: Arc<WithdrawalManager>,
}

/// Register every settlement step
pub fn register_defaults(registry: &mut StepRegistry, services: &StepServices) {
    registry.register(Arc::new(CreditWallet {
        reversals: services.reversals.clone(),
        wallets: services.wallets.clone(),
    }));
    registry.register(Arc::new(AllocateInventory {
        allocator: services.allocator.clone(),
    }));
    registry.register(Arc::new(DebitSharePurchase {
        wallets: services.wallets.clone(),
    }));
    registry.register(Arc::new(CreditBonus {
        wallets: services.wallets.clone(),
        ledger: services.ledger.clone(),
    }));
    registry.register(Arc::new(RecordPayment {
        storage: services.storage.clone(),
        ledger: services.ledger.clone(),
    }));
    registry.register(Arc::new(ConsumeWithdrawalLock {
        withdrawals: services.withdrawals.clone(),
    }));
    registry.register(Arc::new(RecordPayout {
        withdrawals: services.withdrawals.clone(),
    }));
}

/// Saga type, metadata and plan of a payment
pub fn payment_saga(
    request: &PaymentRequest,
    wallet_id: WalletId,
) -> (&'static str, BTreeMap<String, String>, Vec<String>) {
    let mut metadata = BTreeMap::new();
    metadata.insert("payment_id".to_string(), request.payment_id.to_string());
    metadata.insert("user_id".to_string(), request.user_id.to_string());
    metadata.insert("wallet_id".to_string(), wallet_id.to_string());
    metadata.insert("amount".to_string(), request.amount.value().to_string());

    let mut plan = vec![CREDIT_WALLET.to_string()];
    let saga_type = match request.purpose {
        PaymentPurpose::WalletTopUp => PAYMENT_TOP_UP,
        PaymentPurpose::SharePurchase { product_id } => {
            metadata.insert("product_id".to_string(), product_id.to_string());
            plan.push(ALLOCATE_INVENTORY.to_string());
            plan.push(DEBIT_SHARE_PURCHASE.to_string());
            PAYMENT_SHARE_PURCHASE
        }
    };
    if let Some(bonus) = request.bonus {
        metadata.insert("bonus".to_string(), bonus.value().to_string());
        plan.push(CREDIT_BONUS.to_string());
    }
    plan.push(RECORD_PAYMENT.to_string());

    (saga_type, metadata, plan)
}

/// Saga type, metadata and plan of a withdrawal payout
pub fn payout_saga(
    withdrawal_id: WithdrawalId,
    payout_reference: &str,
) -> (&'static str, BTreeMap<String, String>, Vec<String>) {
    let mut metadata = BTreeMap::new();
    metadata.insert("withdrawal_id".to_string(), withdrawal_id.to_string());
    metadata.insert("payout_reference".to_string(), payout_reference.to_string());
    (
        WITHDRAWAL_PAYOUT,
        metadata,
        vec![
            CONSUME_WITHDRAWAL_LOCK.to_string(),
            RECORD_PAYOUT.to_string(),
        ],
    )
}

fn compensation_reason(ctx: &StepContext) -> String {
    format!("saga {} compensated", ctx.saga_id)
}

/// Credit the payment to the wallet
#[derive(Debug)]
pub struct CreditWallet {
    reversals: Arc<ReversalManager>,
    wallets: Arc<WalletAccounting>,
}

#[async_trait]
impl Step for CreditWallet {
    fn operation(&self) -> &'static str {
        CREDIT_WALLET
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let wallet_id: WalletId = ctx.param("wallet_id")?;
        let payment_id: PaymentId = ctx.param("payment_id")?;
        let amount = ctx.paise_param("amount")?;

        // Keyed on the payment, not the saga: a payment is credited once
        let request = PostingRequest::new(amount, EntryKind::Deposit, Reference::Payment(payment_id))
            .with_description(format!("Payment {}", payment_id))
            .with_transaction_id(derived_id(payment_id.as_uuid(), "deposit"));
        let outcome = self.reversals.deposit(wallet_id, request).await?;

        let recovered: i64 = outcome
            .recoveries
            .iter()
            .map(|(_, entry)| entry.amount.value())
            .sum();
        Ok(json!({
            "entry_id": outcome.deposit.entry_id.to_string(),
            "recovered": recovered,
        }))
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<()> {
        let entry_id: EntryId = output_field(output, "entry_id")?;
        self.wallets
            .reverse_entry(entry_id, ctx.derived_id("compensate"), &compensation_reason(ctx))
            .await?;
        Ok(())
    }
}

/// Allocate inventory for the purchase
#[derive(Debug)]
pub struct AllocateInventory {
    allocator: Arc<FifoAllocator>,
}

#[async_trait]
impl Step for AllocateInventory {
    fn operation(&self) -> &'static str {
        ALLOCATE_INVENTORY
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let product_id: ProductId = ctx.param("product_id")?;
        let user_id: UserId = ctx.param("user_id")?;
        let payment_id: PaymentId = ctx.param("payment_id")?;
        let value = ctx.paise_param("amount")?;

        let request = AllocationRequest::new(product_id, user_id, value)
            .with_idempotency_key(ctx.correlation_id().to_string())
            .for_reference(Reference::Payment(payment_id));
        let result = self.allocator.allocate(request).await?;

        Ok(json!({
            "allocation_id": result.allocation.allocation_id.to_string(),
            "lots": result.sources.len(),
        }))
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<()> {
        let allocation_id: AllocationId = output_field(output, "allocation_id")?;
        self.allocator
            .deallocate(
                allocation_id,
                DeallocationMode::Compensation,
                &compensation_reason(ctx),
            )
            .await?;
        Ok(())
    }
}

/// Debit the wallet for the allocated shares
#[derive(Debug)]
pub struct DebitSharePurchase {
    wallets: Arc<WalletAccounting>,
}

#[async_trait]
impl Step for DebitSharePurchase {
    fn operation(&self) -> &'static str {
        DEBIT_SHARE_PURCHASE
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let wallet_id: WalletId = ctx.param("wallet_id")?;
        let amount = ctx.paise_param("amount")?;
        let allocation_id: AllocationId = output_field(ctx.output(ALLOCATE_INVENTORY)?, "allocation_id")?;

        let request = PostingRequest::new(
            amount,
            EntryKind::SharePurchase,
            Reference::Allocation(allocation_id),
        )
        .with_description(format!("Share purchase {}", allocation_id))
        .with_transaction_id(ctx.correlation_id());
        let entry = self.wallets.debit(wallet_id, request).await?;

        Ok(json!({ "entry_id": entry.entry_id.to_string() }))
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<()> {
        let entry_id: EntryId = output_field(output, "entry_id")?;
        self.wallets
            .reverse_entry(entry_id, ctx.derived_id("compensate"), &compensation_reason(ctx))
            .await?;
        Ok(())
    }
}

/// Credit the promotional bonus and book it as a campaign discount
///
/// Skipped when the payment carries no bonus or the wallet is in recovery
/// mode, where bonus accrual is blocked.
#[derive(Debug)]
pub struct CreditBonus {
    wallets: Arc<WalletAccounting>,
    ledger: Arc<DoubleEntryLedger>,
}

#[async_trait]
impl Step for CreditBonus {
    fn operation(&self) -> &'static str {
        CREDIT_BONUS
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let bonus = match ctx.optional_param::<i64>("bonus")? {
            Some(paise) if paise > 0 => ledger_core::Paise::new(paise),
            _ => return Ok(json!({ "skipped": "no_bonus" })),
        };
        let wallet_id: WalletId = ctx.param("wallet_id")?;
        let bonus_id = BonusId::from_uuid(ctx.derived_id("bonus"));
        let reference = Reference::Bonus(bonus_id);

        let mut txn = self.wallets.begin(&[wallet_id]).await?;
        if let Some(existing) = self.wallets.entry_by_transaction(ctx.correlation_id())? {
            let pair = self
                .ledger
                .pairs_for_reference(&reference)?
                .into_iter()
                .find(|pair| pair.debit.reverses.is_none());
            return Ok(json!({
                "entry_id": existing.entry_id.to_string(),
                "pair_id": pair.map(|p| p.pair_id.to_string()),
            }));
        }
        if txn.wallet(wallet_id)?.recovery_mode {
            tracing::info!(wallet_id = %wallet_id, saga_id = %ctx.saga_id, "Bonus skipped in recovery mode");
            return Ok(json!({ "skipped": "recovery_mode" }));
        }

        let request = PostingRequest::new(bonus, EntryKind::BonusCredit, reference)
            .with_description("Payment bonus")
            .with_transaction_id(ctx.correlation_id());
        let entry = txn.credit(wallet_id, request)?;
        let pair = self.ledger.stage(
            txn.writes(),
            CapitalEvent::CampaignDiscount,
            bonus,
            reference,
            "payment bonus",
        )?;
        txn.commit()?;

        Ok(json!({
            "entry_id": entry.entry_id.to_string(),
            "pair_id": pair.pair_id.to_string(),
        }))
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<()> {
        if output.get("skipped").is_some() {
            return Ok(());
        }
        let entry_id: EntryId = output_field(output, "entry_id")?;
        let entry = self.wallets.entry(entry_id)?;
        let reason = compensation_reason(ctx);

        let mut txn = self.wallets.begin(&[entry.wallet_id]).await?;
        if !self.wallets.is_reversed(entry_id)? {
            txn.reverse_entry(&entry, ctx.derived_id("compensate"), &reason)?;
        }
        if let Ok(pair_id) = output_field::<PairId>(output, "pair_id") {
            if self.ledger.reversed_by(pair_id)?.is_none() {
                self.ledger.stage_reversal(txn.writes(), pair_id, &reason)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

/// Book the cash receipt (and share delivery) on the general ledger
#[derive(Debug)]
pub struct RecordPayment {
    storage: Arc<Storage>,
    ledger: Arc<DoubleEntryLedger>,
}

#[async_trait]
impl Step for RecordPayment {
    fn operation(&self) -> &'static str {
        RECORD_PAYMENT
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let payment_id: PaymentId = ctx.param("payment_id")?;
        let amount = ctx.paise_param("amount")?;
        let reference = Reference::Payment(payment_id);

        let live: Vec<_> = self
            .ledger
            .pairs_for_reference(&reference)?
            .into_iter()
            .filter(|pair| pair.debit.reverses.is_none())
            .collect();
        let mut receipt = None;
        let mut delivery = None;
        for pair in live {
            if self.ledger.reversed_by(pair.pair_id)?.is_some() {
                continue;
            }
            match (pair.debit.account, pair.credit.account) {
                (Account::Cash, Account::Liabilities) => receipt = Some(pair.pair_id),
                (Account::Liabilities, Account::Revenue) => delivery = Some(pair.pair_id),
                _ => {}
            }
        }

        if receipt.is_none() {
            let mut writes = WriteSet::new();
            receipt = Some(
                self.ledger
                    .stage(
                        &mut writes,
                        CapitalEvent::InvestorPaymentReceipt,
                        amount,
                        reference,
                        "",
                    )?
                    .pair_id,
            );
            if ctx.metadata.contains_key("product_id") && delivery.is_none() {
                delivery = Some(
                    self.ledger
                        .stage(&mut writes, CapitalEvent::ShareDelivery, amount, reference, "")?
                        .pair_id,
                );
            }
            self.storage.commit(writes)?;
        }

        Ok(json!({
            "receipt_pair": receipt.map(|id| id.to_string()),
            "delivery_pair": delivery.map(|id| id.to_string()),
        }))
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<()> {
        let reason = compensation_reason(ctx);
        let mut writes = WriteSet::new();
        for field in ["delivery_pair", "receipt_pair"] {
            if let Ok(pair_id) = output_field::<PairId>(output, field) {
                if self.ledger.reversed_by(pair_id)?.is_none() {
                    self.ledger.stage_reversal(&mut writes, pair_id, &reason)?;
                }
            }
        }
        if !writes.is_empty() {
            self.storage.commit(writes)?;
        }
        Ok(())
    }
}

/// Turn the withdrawal's fund lock into the wallet debit
#[derive(Debug)]
pub struct ConsumeWithdrawalLock {
    withdrawals: Arc<WithdrawalManager>,
}

#[async_trait]
impl Step for ConsumeWithdrawalLock {
    fn operation(&self) -> &'static str {
        CONSUME_WITHDRAWAL_LOCK
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let withdrawal_id: WithdrawalId = ctx.param("withdrawal_id")?;
        let entry = self
            .withdrawals
            .consume(withdrawal_id, ctx.correlation_id())
            .await?;
        Ok(json!({ "entry_id": entry.entry_id.to_string() }))
    }

    async fn compensate(&self, ctx: &StepContext, _output: &Value) -> Result<()> {
        let withdrawal_id: WithdrawalId = ctx.param("withdrawal_id")?;
        self.withdrawals
            .restore(withdrawal_id, ctx.derived_id("compensate"), &compensation_reason(ctx))
            .await?;
        Ok(())
    }
}

/// Book the payout and complete the withdrawal
#[derive(Debug)]
pub struct RecordPayout {
    withdrawals: Arc<WithdrawalManager>,
}

#[async_trait]
impl Step for RecordPayout {
    fn operation(&self) -> &'static str {
        RECORD_PAYOUT
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        let withdrawal_id: WithdrawalId = ctx.param("withdrawal_id")?;
        let payout_reference: String = ctx.param("payout_reference")?;
        let withdrawal = self
            .withdrawals
            .record_payout(withdrawal_id, &payout_reference)
            .await?;
        Ok(json!({ "pair_id": withdrawal.payout_pair.map(|id| id.to_string()) }))
    }

    async fn compensate(&self, ctx: &StepContext, _output: &Value) -> Result<()> {
        let withdrawal_id: WithdrawalId = ctx.param("withdrawal_id")?;
        self.withdrawals
            .revert_payout(withdrawal_id, &compensation_reason(ctx))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Paise;

    #[test]
    fn test_share_purchase_plan_with_bonus() {
        let request = PaymentRequest::share_purchase(UserId::new(), Paise::new(10_000), ProductId::new())
            .with_bonus(Paise::new(500));
        let (saga_type, metadata, plan) = payment_saga(&request, WalletId::new());

        assert_eq!(saga_type, PAYMENT_SHARE_PURCHASE);
        assert_eq!(
            plan,
            vec![
                CREDIT_WALLET,
                ALLOCATE_INVENTORY,
                DEBIT_SHARE_PURCHASE,
                CREDIT_BONUS,
                RECORD_PAYMENT
            ]
        );
        assert_eq!(metadata["amount"], "10000");
        assert_eq!(metadata["bonus"], "500");
    }

    #[test]
    fn test_top_up_plan() {
        let request = PaymentRequest::top_up(UserId::new(), Paise::new(10_000));
        let (saga_type, metadata, plan) = payment_saga(&request, WalletId::new());

        assert_eq!(saga_type, PAYMENT_TOP_UP);
        assert_eq!(plan, vec![CREDIT_WALLET, RECORD_PAYMENT]);
        assert!(!metadata.contains_key("product_id"));
    }
}
