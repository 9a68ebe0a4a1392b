//! Reversals and chargeback receivables
//!
//! A refund or chargeback that arrives after the funds were spent debits what
//! the wallet can still cover. The shortfall becomes a [`ChargebackReceivable`]
//! and the wallet enters recovery mode, which blocks withdrawals, share
//! purchases and bonus accrual. Deposits stay allowed and are applied to open
//! receivables, oldest first, before they add to the spendable balance.

use crate::{config::ReceivableConfig, metrics::SettlementMetrics, tables, types::*, Error, Result};
use chrono::Utc;
use ledger_core::storage::compose_key;
use ledger_core::{
    Account, CapitalEvent, DoubleEntryLedger, EntryKind, EntryReversal, LedgerEntry, Paise,
    PaymentId, PostingRequest, ReceivableId, Reference, Referenced, WalletAccounting, WalletId,
    WalletTxn,
};
use std::sync::Arc;

/// Reversal and receivable manager
#[derive(Debug)]
pub struct ReversalManager {
    wallets: Arc<WalletAccounting>,
    ledger: Arc<DoubleEntryLedger>,
    metrics: SettlementMetrics,
    config: ReceivableConfig,
}

impl ReversalManager {
    /// Create over shared wallet accounting and double-entry ledger
    pub fn new(
        wallets: Arc<WalletAccounting>,
        ledger: Arc<DoubleEntryLedger>,
        metrics: SettlementMetrics,
        config: ReceivableConfig,
    ) -> Self {
        Self {
            wallets,
            ledger,
            metrics,
            config,
        }
    }

    /// Reverse `amount` of a credit entry (all of it when `None`)
    ///
    /// Debits what the wallet can cover and opens a receivable for the rest,
    /// in one atomic write together with the reversal link and the refund
    /// payout posting.
    pub async fn reverse(
        &self,
        original: &LedgerEntry,
        source: ReversalSource,
        reason: &str,
        amount: Option<Paise>,
    ) -> Result<ReversalOutcome> {
        let amount = amount.unwrap_or(original.amount).ensure_positive()?;
        if amount > original.amount {
            return Err(ledger_core::Error::InvalidAmount(format!(
                "reversal of {} exceeds entry {} amount {}",
                amount, original.entry_id, original.amount
            ))
            .into());
        }
        if !original.kind.is_credit() {
            return Err(Error::InvalidState(format!(
                "entry {} is a {} and cannot be charged back",
                original.entry_id, original.kind
            )));
        }

        let wallet_id = original.wallet_id;
        let mut txn = self.wallets.begin(&[wallet_id]).await?;
        txn.ensure_not_reversed(original.entry_id)?;

        let spendable = txn.wallet(wallet_id)?.spendable().max(Paise::ZERO);
        let covered = amount.min(spendable);
        let shortfall = amount.checked_sub(covered)?;

        let debit = if covered.is_positive() {
            let request = PostingRequest::new(covered, source.entry_kind(), original.reference)
                .with_description(format!("{}: {}", source, reason))
                .with_transaction_id(derived_id(original.entry_id.as_uuid(), "reversal"))
                .pairing(original.entry_id);
            Some(txn.post(wallet_id, request)?)
        } else {
            None
        };

        let receivable = if shortfall.is_positive() {
            let receivable = ChargebackReceivable {
                receivable_id: ReceivableId::new(),
                user_id: txn.wallet(wallet_id)?.user_id,
                wallet_id,
                payment_id: match original.reference {
                    Reference::Payment(payment_id) => Some(payment_id),
                    _ => None,
                },
                original_entry: original.entry_id,
                amount: shortfall,
                paid: Paise::ZERO,
                status: ReceivableStatus::Pending,
                source_type: source,
                reason: reason.to_string(),
                created_at: Utc::now(),
                settled_at: None,
                written_off_by: None,
                write_off_reason: None,
            };
            txn.add_receivable(wallet_id, shortfall)?;
            txn.writes().insert(
                tables::RECEIVABLES,
                receivable.receivable_id.as_bytes(),
                &receivable,
            )?;
            txn.writes().insert(
                tables::RECEIVABLES_BY_WALLET,
                compose_key(&[wallet_id.as_bytes(), receivable.receivable_id.as_bytes()]),
                &receivable.receivable_id,
            )?;
            Some(receivable)
        } else {
            None
        };

        txn.record_reversal(EntryReversal {
            original_entry: original.entry_id,
            reversing_entry: debit.as_ref().map(|entry| entry.entry_id),
            receivable_id: receivable.as_ref().map(|r| r.receivable_id),
            reason: format!("{}: {}", source, reason),
            created_at: Utc::now(),
        })?;

        let payout = self.ledger.stage(
            txn.writes(),
            CapitalEvent::RefundPayout,
            amount,
            original.reference,
            reason,
        )?;
        txn.commit()?;

        if let Some(receivable) = &receivable {
            self.metrics.receivables_opened.inc();
            tracing::warn!(
                wallet_id = %wallet_id,
                receivable_id = %receivable.receivable_id,
                shortfall = shortfall.value(),
                source = %source,
                "Reversal exceeded spendable funds; wallet in recovery mode"
            );
        }
        tracing::info!(
            wallet_id = %wallet_id,
            original_entry = %original.entry_id,
            amount = amount.value(),
            covered = covered.value(),
            source = %source,
            "Reversal recorded"
        );

        Ok(ReversalOutcome {
            debit,
            receivable,
            payout_pair: payout.pair_id,
        })
    }

    /// Return a reversed allocation's purchase price to the wallet
    ///
    /// Credits the share-purchase debit back and nets out the share delivery
    /// posted for `payment`. Safe to repeat.
    pub async fn refund_share_purchase(
        &self,
        allocation: &Allocation,
        payment: PaymentId,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        let purchase = self
            .wallets
            .entries_for_reference(&allocation.reference())?
            .into_iter()
            .find(|entry| entry.kind == EntryKind::SharePurchase);
        let Some(purchase) = purchase else {
            return Ok(None);
        };

        let mut txn = self.wallets.begin(&[purchase.wallet_id]).await?;
        if self.wallets.is_reversed(purchase.entry_id)? {
            return Ok(None);
        }

        let request = PostingRequest::new(
            purchase.amount,
            EntryKind::AllocationReversalCredit,
            purchase.reference,
        )
        .with_description(format!("Allocation reversed: {}", reason))
        .with_transaction_id(derived_id(purchase.entry_id.as_uuid(), "allocation_reversal"))
        .pairing(purchase.entry_id);
        let credit = txn.post(purchase.wallet_id, request)?;
        txn.record_reversal(EntryReversal {
            original_entry: purchase.entry_id,
            reversing_entry: Some(credit.entry_id),
            receivable_id: None,
            reason: reason.to_string(),
            created_at: credit.created_at,
        })?;

        for pair in self.ledger.pairs_for_reference(&Reference::Payment(payment))? {
            let is_delivery = pair.debit.account == Account::Liabilities
                && pair.credit.account == Account::Revenue
                && pair.debit.reverses.is_none();
            if is_delivery && self.ledger.reversed_by(pair.pair_id)?.is_none() {
                self.ledger.stage_reversal(txn.writes(), pair.pair_id, reason)?;
            }
        }
        txn.commit()?;

        tracing::info!(
            allocation_id = %allocation.allocation_id,
            entry_id = %credit.entry_id,
            amount = credit.amount.value(),
            "Share purchase refunded to wallet"
        );
        Ok(Some(credit))
    }

    /// Credit a deposit and apply it to open receivables, oldest first
    pub async fn deposit(&self, wallet_id: WalletId, request: PostingRequest) -> Result<DepositOutcome> {
        if !request.kind.is_credit() {
            return Err(Error::InvalidInput(format!(
                "{} is not a deposit kind",
                request.kind
            )));
        }
        let mut txn = self.wallets.begin(&[wallet_id]).await?;
        if let Some(existing) = self.wallets.entry_by_transaction(request.transaction_id)? {
            return Ok(DepositOutcome {
                deposit: existing,
                recoveries: Vec::new(),
                replayed: true,
            });
        }
        let deposit = txn.credit(wallet_id, request)?;

        let mut remaining = deposit.amount;
        let mut recoveries = Vec::new();
        for mut receivable in self.open_receivables(wallet_id)? {
            if !remaining.is_positive() {
                break;
            }
            let applied = remaining.min(receivable.balance());
            let recovery = PostingRequest::new(
                applied,
                EntryKind::ReceivableRecovery,
                Reference::Receivable(receivable.receivable_id),
            )
            .with_description(format!("Recovery from deposit {}", deposit.entry_id))
            .with_transaction_id(derived_id(
                deposit.transaction_id,
                &receivable.receivable_id.to_string(),
            ));
            let entry = txn.post(wallet_id, recovery)?;
            self.apply_payment(&mut txn, &mut receivable, applied)?;

            remaining = remaining.checked_sub(applied)?;
            recoveries.push((receivable.receivable_id, entry));
        }

        if !recoveries.is_empty() {
            self.clear_recovery_if_settled(&mut txn, wallet_id)?;
        }
        txn.commit()?;

        let recovered = Paise::sum(recoveries.iter().map(|(_, entry)| entry.amount))?;
        if recovered.is_positive() {
            self.metrics.recovered_paise.inc_by(recovered.value() as u64);
            tracing::info!(
                wallet_id = %wallet_id,
                deposit = deposit.amount.value(),
                recovered = recovered.value(),
                "Deposit applied to receivables"
            );
        }

        Ok(DepositOutcome {
            deposit,
            recoveries,
            replayed: false,
        })
    }

    /// Record a payment against a receivable collected outside the wallet
    pub async fn settle(&self, receivable_id: ReceivableId, amount: Paise) -> Result<ChargebackReceivable> {
        amount.ensure_positive()?;
        let wallet_id = self.receivable(receivable_id)?.wallet_id;

        let mut txn = self.wallets.begin(&[wallet_id]).await?;
        let mut receivable = self.receivable(receivable_id)?;
        if !receivable.status.is_open() {
            return Err(Error::InvalidState(format!(
                "receivable {} is {:?}",
                receivable_id, receivable.status
            )));
        }
        if amount > receivable.balance() {
            return Err(ledger_core::Error::InvalidAmount(format!(
                "payment {} exceeds receivable balance {}",
                amount,
                receivable.balance()
            ))
            .into());
        }

        self.apply_payment(&mut txn, &mut receivable, amount)?;
        self.clear_recovery_if_settled(&mut txn, wallet_id)?;
        txn.commit()?;

        self.metrics.recovered_paise.inc_by(amount.value() as u64);
        tracing::info!(
            receivable_id = %receivable_id,
            paid = amount.value(),
            balance = receivable.balance().value(),
            "Receivable payment recorded"
        );
        Ok(receivable)
    }

    /// Abandon a receivable
    ///
    /// Recovery mode stays on unless `write_off_clears_recovery` is set and
    /// nothing else is open.
    pub async fn write_off(
        &self,
        receivable_id: ReceivableId,
        admin: &str,
        reason: &str,
    ) -> Result<ChargebackReceivable> {
        let wallet_id = self.receivable(receivable_id)?.wallet_id;

        let mut txn = self.wallets.begin(&[wallet_id]).await?;
        let mut receivable = self.receivable(receivable_id)?;
        if !receivable.status.is_open() {
            return Err(Error::InvalidState(format!(
                "receivable {} is {:?}",
                receivable_id, receivable.status
            )));
        }

        txn.reduce_receivable(wallet_id, receivable.balance())?;
        receivable.status = ReceivableStatus::WrittenOff;
        receivable.written_off_by = Some(admin.to_string());
        receivable.write_off_reason = Some(reason.to_string());
        txn.writes()
            .upsert(tables::RECEIVABLES, receivable_id.as_bytes(), &receivable)?;

        if self.config.write_off_clears_recovery {
            self.clear_recovery_if_settled(&mut txn, wallet_id)?;
        }
        txn.commit()?;

        tracing::warn!(
            receivable_id = %receivable_id,
            admin = admin,
            written_off = receivable.balance().value(),
            "Receivable written off"
        );
        Ok(receivable)
    }

    /// Take a wallet out of recovery mode by operator decision
    pub async fn exit_recovery_mode(&self, wallet_id: WalletId, admin: &str) -> Result<()> {
        let mut txn = self.wallets.begin(&[wallet_id]).await?;
        let open = self.open_receivables(wallet_id)?;
        if !open.is_empty() {
            return Err(Error::InvalidState(format!(
                "wallet {} still has {} open receivable(s)",
                wallet_id,
                open.len()
            )));
        }
        if !txn.wallet(wallet_id)?.recovery_mode {
            return Ok(());
        }

        txn.set_recovery_mode(wallet_id, false)?;
        txn.commit()?;
        tracing::info!(wallet_id = %wallet_id, admin = admin, "Recovery mode cleared");
        Ok(())
    }

    fn apply_payment(
        &self,
        txn: &mut WalletTxn<'_>,
        receivable: &mut ChargebackReceivable,
        amount: Paise,
    ) -> Result<()> {
        receivable.paid = receivable.paid.checked_add(amount)?;
        if receivable.balance().is_zero() {
            receivable.status = ReceivableStatus::Settled;
            receivable.settled_at = Some(Utc::now());
        } else {
            receivable.status = ReceivableStatus::Partial;
        }

        txn.reduce_receivable(receivable.wallet_id, amount)?;
        txn.writes().upsert(
            tables::RECEIVABLES,
            receivable.receivable_id.as_bytes(),
            &*receivable,
        )?;
        Ok(())
    }

    // The wallet's receivable balance is the sum of its open receivables
    fn clear_recovery_if_settled(&self, txn: &mut WalletTxn<'_>, wallet_id: WalletId) -> Result<()> {
        let wallet = txn.wallet(wallet_id)?;
        if wallet.recovery_mode && wallet.receivable_balance.is_zero() {
            txn.set_recovery_mode(wallet_id, false)?;
            tracing::info!(wallet_id = %wallet_id, "Receivables settled; recovery mode cleared");
        }
        Ok(())
    }

    // ===== Reads =====

    /// Load a receivable
    pub fn receivable(&self, receivable_id: ReceivableId) -> Result<ChargebackReceivable> {
        self.wallets
            .storage()
            .get(tables::RECEIVABLES, receivable_id.as_bytes())?
            .ok_or_else(|| Error::not_found("receivable", receivable_id))
    }

    /// Every receivable of a wallet, oldest first
    pub fn receivables_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<ChargebackReceivable>> {
        self.wallets
            .storage()
            .scan_prefix::<ReceivableId>(tables::RECEIVABLES_BY_WALLET, wallet_id.as_bytes())?
            .into_iter()
            .map(|(_, id)| self.receivable(id))
            .collect()
    }

    /// Open receivables of a wallet, oldest first
    pub fn open_receivables(&self, wallet_id: WalletId) -> Result<Vec<ChargebackReceivable>> {
        Ok(self
            .receivables_for_wallet(wallet_id)?
            .into_iter()
            .filter(|r| r.status.is_open())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use ledger_core::{Metrics, RowLocks, Storage, UserId};
    use prometheus::Registry;
    use tempfile::TempDir;

    struct Fixture {
        manager: ReversalManager,
        wallets: Arc<WalletAccounting>,
        ledger: Arc<DoubleEntryLedger>,
        _temp_dir: TempDir,
    }

    fn fixture(config: ReceivableConfig) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = Config::default();
        settings.ledger.data_dir = temp_dir.path().to_path_buf();
        settings.ledger.rocksdb.sync_writes = false;

        let registry = Arc::new(Registry::new());
        let metrics = Metrics::with_registry(registry.clone()).unwrap();
        let storage = Arc::new(Storage::open(&settings.ledger, tables::SETTLEMENT_TABLES).unwrap());
        let wallets = Arc::new(WalletAccounting::new(
            storage.clone(),
            Arc::new(RowLocks::new(1_000)),
            metrics.clone(),
            settings.ledger.wallet.clone(),
        ));
        let ledger = Arc::new(DoubleEntryLedger::new(storage, metrics));
        let manager = ReversalManager::new(
            wallets.clone(),
            ledger.clone(),
            SettlementMetrics::with_registry(&registry).unwrap(),
            config,
        );
        Fixture {
            manager,
            wallets,
            ledger,
            _temp_dir: temp_dir,
        }
    }

    fn deposit_request(amount: i64) -> PostingRequest {
        PostingRequest::new(
            Paise::new(amount),
            EntryKind::Deposit,
            Reference::Payment(PaymentId::new()),
        )
    }

    // 500 deposited, 300 spent: 200 spendable
    async fn partly_spent(f: &Fixture) -> (WalletId, LedgerEntry) {
        let wallet = f.wallets.open_wallet(UserId::new()).await.unwrap();
        let outcome = f
            .manager
            .deposit(wallet.wallet_id, deposit_request(500))
            .await
            .unwrap();
        f.wallets
            .debit(
                wallet.wallet_id,
                PostingRequest::new(
                    Paise::new(300),
                    EntryKind::SharePurchase,
                    Reference::Allocation(ledger_core::AllocationId::new()),
                ),
            )
            .await
            .unwrap();
        (wallet.wallet_id, outcome.deposit)
    }

    #[tokio::test]
    async fn test_shortfall_opens_receivable_and_deposit_recovers_it() {
        let f = fixture(ReceivableConfig::default());
        let (wallet_id, original) = partly_spent(&f).await;

        let outcome = f
            .manager
            .reverse(&original, ReversalSource::Chargeback, "card dispute", None)
            .await
            .unwrap();
        assert_eq!(outcome.debit.as_ref().unwrap().amount, Paise::new(200));
        let receivable = outcome.receivable.unwrap();
        assert_eq!(receivable.amount, Paise::new(300));

        let balance = f.wallets.balance(wallet_id).unwrap();
        assert_eq!(balance.spendable, Paise::ZERO);
        assert_eq!(balance.receivable, Paise::new(300));
        assert!(balance.recovery_mode);

        let recovered = f
            .manager
            .deposit(wallet_id, deposit_request(300))
            .await
            .unwrap();
        assert_eq!(recovered.recoveries.len(), 1);
        assert_eq!(recovered.recoveries[0].1.amount, Paise::new(300));

        let balance = f.wallets.balance(wallet_id).unwrap();
        assert_eq!(balance.spendable, Paise::ZERO);
        assert_eq!(balance.receivable, Paise::ZERO);
        assert!(!balance.recovery_mode);

        let settled = f.manager.receivable(receivable.receivable_id).unwrap();
        assert_eq!(settled.status, ReceivableStatus::Settled);
        assert!(settled.settled_at.is_some());
        assert!(f.ledger.trial_balance().unwrap().is_balanced());
    }

    #[tokio::test]
    async fn test_entry_is_reversed_once() {
        let f = fixture(ReceivableConfig::default());
        let (_, original) = partly_spent(&f).await;

        f.manager
            .reverse(&original, ReversalSource::Refund, "customer request", Some(Paise::new(100)))
            .await
            .unwrap();
        let err = f
            .manager
            .reverse(&original, ReversalSource::Refund, "customer request", Some(Paise::new(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(ledger_core::Error::AlreadyReversed(_))));
    }

    #[tokio::test]
    async fn test_partial_deposit_leaves_recovery_on() {
        let f = fixture(ReceivableConfig::default());
        let (wallet_id, original) = partly_spent(&f).await;
        let receivable = f
            .manager
            .reverse(&original, ReversalSource::Chargeback, "dispute", None)
            .await
            .unwrap()
            .receivable
            .unwrap();

        f.manager.deposit(wallet_id, deposit_request(100)).await.unwrap();

        let partial = f.manager.receivable(receivable.receivable_id).unwrap();
        assert_eq!(partial.status, ReceivableStatus::Partial);
        assert_eq!(partial.balance(), Paise::new(200));
        assert!(f.wallets.balance(wallet_id).unwrap().recovery_mode);

        let settled = f
            .manager
            .settle(receivable.receivable_id, Paise::new(200))
            .await
            .unwrap();
        assert_eq!(settled.status, ReceivableStatus::Settled);
        assert!(!f.wallets.balance(wallet_id).unwrap().recovery_mode);
    }

    #[tokio::test]
    async fn test_write_off_keeps_recovery_until_operator_exit() {
        let f = fixture(ReceivableConfig::default());
        let (wallet_id, original) = partly_spent(&f).await;
        let receivable = f
            .manager
            .reverse(&original, ReversalSource::Chargeback, "dispute", None)
            .await
            .unwrap()
            .receivable
            .unwrap();

        assert!(f.manager.exit_recovery_mode(wallet_id, "ops").await.is_err());

        let written_off = f
            .manager
            .write_off(receivable.receivable_id, "ops", "uncollectable")
            .await
            .unwrap();
        assert_eq!(written_off.status, ReceivableStatus::WrittenOff);
        assert!(f.wallets.balance(wallet_id).unwrap().recovery_mode);

        f.manager.exit_recovery_mode(wallet_id, "ops").await.unwrap();
        assert!(!f.wallets.balance(wallet_id).unwrap().recovery_mode);
    }

    #[tokio::test]
    async fn test_write_off_clears_recovery_when_configured() {
        let f = fixture(ReceivableConfig {
            write_off_clears_recovery: true,
        });
        let (wallet_id, original) = partly_spent(&f).await;
        let receivable = f
            .manager
            .reverse(&original, ReversalSource::Chargeback, "dispute", None)
            .await
            .unwrap()
            .receivable
            .unwrap();

        f.manager
            .write_off(receivable.receivable_id, "ops", "uncollectable")
            .await
            .unwrap();
        assert!(!f.wallets.balance(wallet_id).unwrap().recovery_mode);
    }

    #[tokio::test]
    async fn test_deposit_replay_does_not_recover_twice() {
        let f = fixture(ReceivableConfig::default());
        let (wallet_id, original) = partly_spent(&f).await;
        f.manager
            .reverse(&original, ReversalSource::Chargeback, "dispute", None)
            .await
            .unwrap();

        let request = deposit_request(100);
        f.manager.deposit(wallet_id, request.clone()).await.unwrap();
        let replay = f.manager.deposit(wallet_id, request).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(f.wallets.balance(wallet_id).unwrap().receivable, Paise::new(200));
    }
}
