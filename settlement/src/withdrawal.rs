//! Withdrawals
//!
//! A request locks the amount on the wallet and records the withdrawal in the
//! same batch. The payout saga later consumes the lock into a `Withdrawal`
//! debit and books the cash leaving the operator account. Every mutation of a
//! withdrawal row happens under its wallet's row lock.

use crate::{config::WithdrawalConfig, tables, types::*, Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::storage::compose_key;
use ledger_core::{
    CapitalEvent, DoubleEntryLedger, EntryKind, LedgerEntry, LockStatus, Paise, PostingRequest,
    Referenced, RowLocks, UserId, WalletAccounting, WithdrawalId,
};
use std::sync::Arc;
use uuid::Uuid;

fn key_row(user_id: &UserId, idempotency_key: &str) -> Vec<u8> {
    compose_key(&[user_id.as_bytes(), idempotency_key.as_bytes()])
}

/// Withdrawal manager
#[derive(Debug)]
pub struct WithdrawalManager {
    wallets: Arc<WalletAccounting>,
    ledger: Arc<DoubleEntryLedger>,
    config: WithdrawalConfig,
}

impl WithdrawalManager {
    /// Create over shared wallet accounting and double-entry ledger
    pub fn new(
        wallets: Arc<WalletAccounting>,
        ledger: Arc<DoubleEntryLedger>,
        config: WithdrawalConfig,
    ) -> Self {
        Self {
            wallets,
            ledger,
            config,
        }
    }

    /// Lock funds for a payout
    ///
    /// The idempotency key is checked before anything is written; repeating
    /// it with the same amount returns the original withdrawal.
    pub async fn request(
        &self,
        user_id: UserId,
        amount: Paise,
        bank_details: BankDetails,
        idempotency_key: &str,
    ) -> Result<Withdrawal> {
        amount.ensure_positive()?;
        if amount.value() < self.config.min_amount_paise {
            return Err(ledger_core::Error::InvalidAmount(format!(
                "withdrawal {} is below the minimum of {} paise",
                amount, self.config.min_amount_paise
            ))
            .into());
        }
        if idempotency_key.trim().is_empty() {
            return Err(Error::InvalidInput("idempotency key must not be empty".into()));
        }

        let _key_guard = self
            .wallets
            .row_locks()
            .lock(RowLocks::key("withdrawal_key", idempotency_key))
            .await?;

        let key = key_row(&user_id, idempotency_key);
        if let Some(existing_id) = self
            .wallets
            .storage()
            .get::<WithdrawalId>(tables::WITHDRAWAL_KEYS, &key)?
        {
            let existing = self.withdrawal(existing_id)?;
            if existing.amount != amount {
                return Err(ledger_core::Error::DuplicateIdempotencyKey(idempotency_key.into()).into());
            }
            tracing::debug!(
                withdrawal_id = %existing.withdrawal_id,
                "Withdrawal request replayed"
            );
            return Ok(existing);
        }

        let wallet = self
            .wallets
            .wallet_for_user(user_id)?
            .ok_or_else(|| ledger_core::Error::WalletNotFound(format!("user {}", user_id)))?;

        let mut txn = self.wallets.begin(&[wallet.wallet_id]).await?;
        if txn.wallet(wallet.wallet_id)?.recovery_mode {
            tracing::warn!(
                wallet_id = %wallet.wallet_id,
                amount = amount.value(),
                "Withdrawal refused in recovery mode"
            );
            return Err(ledger_core::Error::RecoveryModeRestricted(wallet.wallet_id).into());
        }

        let now = Utc::now();
        let withdrawal_id = WithdrawalId::new();
        let lock = txn.lock_funds(
            wallet.wallet_id,
            amount,
            ledger_core::Reference::Withdrawal(withdrawal_id),
            "withdrawal",
            self.wallets.lock_expiry(now),
        )?;

        let withdrawal = Withdrawal {
            withdrawal_id,
            user_id,
            wallet_id: wallet.wallet_id,
            amount,
            bank_details,
            idempotency_key: idempotency_key.to_string(),
            lock_id: lock.lock_id,
            status: WithdrawalStatus::Pending,
            payout_reference: None,
            entry_id: None,
            payout_pair: None,
            note: None,
            created_at: now,
            updated_at: now,
        };
        txn.writes()
            .insert(tables::WITHDRAWALS, withdrawal_id.as_bytes(), &withdrawal)?;
        txn.writes()
            .insert(tables::WITHDRAWAL_KEYS, &key, &withdrawal_id)?;
        txn.commit()?;

        tracing::info!(
            withdrawal_id = %withdrawal_id,
            wallet_id = %wallet.wallet_id,
            amount = amount.value(),
            "Withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Turn the lock into the wallet debit
    pub async fn consume(&self, withdrawal_id: WithdrawalId, transaction_id: Uuid) -> Result<LedgerEntry> {
        let wallet_id = self.withdrawal(withdrawal_id)?.wallet_id;
        let mut txn = self.wallets.begin(&[wallet_id]).await?;

        let mut withdrawal = self.withdrawal(withdrawal_id)?;
        if let Some(entry_id) = withdrawal.entry_id {
            return Ok(self.wallets.entry(entry_id)?);
        }
        ensure_pending(&withdrawal)?;

        let request = PostingRequest::new(withdrawal.amount, EntryKind::Withdrawal, withdrawal.reference())
            .with_description(format!("Withdrawal to {}", withdrawal.bank_details.account_holder))
            .with_transaction_id(transaction_id);
        let entry = txn.consume_lock(withdrawal.lock_id, request)?;

        withdrawal.entry_id = Some(entry.entry_id);
        withdrawal.updated_at = entry.created_at;
        txn.writes()
            .upsert(tables::WITHDRAWALS, withdrawal_id.as_bytes(), &withdrawal)?;
        txn.commit()?;

        Ok(entry)
    }

    /// Undo `consume`: credit the debit back and mark the withdrawal failed
    pub async fn restore(&self, withdrawal_id: WithdrawalId, transaction_id: Uuid, reason: &str) -> Result<Withdrawal> {
        let wallet_id = self.withdrawal(withdrawal_id)?.wallet_id;
        let mut txn = self.wallets.begin(&[wallet_id]).await?;

        let mut withdrawal = self.withdrawal(withdrawal_id)?;
        if withdrawal.status == WithdrawalStatus::Failed {
            return Ok(withdrawal);
        }
        match withdrawal.entry_id {
            Some(entry_id) if !self.wallets.is_reversed(entry_id)? => {
                let entry = self.wallets.entry(entry_id)?;
                txn.reverse_entry(&entry, transaction_id, reason)?;
            }
            Some(_) => {}
            None => {
                if self.wallets.fund_lock(withdrawal.lock_id)?.status == LockStatus::Active {
                    txn.release_lock(withdrawal.lock_id)?;
                }
            }
        }

        withdrawal.status = WithdrawalStatus::Failed;
        withdrawal.note = Some(reason.to_string());
        withdrawal.updated_at = Utc::now();
        txn.writes()
            .upsert(tables::WITHDRAWALS, withdrawal_id.as_bytes(), &withdrawal)?;
        txn.commit()?;

        tracing::warn!(withdrawal_id = %withdrawal_id, reason = reason, "Withdrawal failed and restored");
        Ok(withdrawal)
    }

    /// Book the payout and complete the withdrawal
    pub async fn record_payout(&self, withdrawal_id: WithdrawalId, payout_reference: &str) -> Result<Withdrawal> {
        let wallet_id = self.withdrawal(withdrawal_id)?.wallet_id;
        let mut txn = self.wallets.begin(&[wallet_id]).await?;

        let mut withdrawal = self.withdrawal(withdrawal_id)?;
        if withdrawal.status == WithdrawalStatus::Completed {
            return Ok(withdrawal);
        }
        ensure_pending(&withdrawal)?;
        if withdrawal.entry_id.is_none() {
            return Err(Error::InvalidState(format!(
                "withdrawal {} has not been debited",
                withdrawal_id
            )));
        }

        let pair = self.ledger.stage(
            txn.writes(),
            CapitalEvent::WithdrawalPayout,
            withdrawal.amount,
            withdrawal.reference(),
            payout_reference,
        )?;
        withdrawal.status = WithdrawalStatus::Completed;
        withdrawal.payout_reference = Some(payout_reference.to_string());
        withdrawal.payout_pair = Some(pair.pair_id);
        withdrawal.updated_at = Utc::now();
        txn.writes()
            .upsert(tables::WITHDRAWALS, withdrawal_id.as_bytes(), &withdrawal)?;
        txn.commit()?;

        tracing::info!(
            withdrawal_id = %withdrawal_id,
            amount = withdrawal.amount.value(),
            payout_reference = payout_reference,
            "Withdrawal paid out"
        );
        Ok(withdrawal)
    }

    /// Undo `record_payout`: net out the payout pair and return to pending
    pub async fn revert_payout(&self, withdrawal_id: WithdrawalId, reason: &str) -> Result<Withdrawal> {
        let wallet_id = self.withdrawal(withdrawal_id)?.wallet_id;
        let mut txn = self.wallets.begin(&[wallet_id]).await?;

        let mut withdrawal = self.withdrawal(withdrawal_id)?;
        let Some(pair_id) = withdrawal.payout_pair else {
            return Ok(withdrawal);
        };
        if self.ledger.reversed_by(pair_id)?.is_none() {
            self.ledger.stage_reversal(txn.writes(), pair_id, reason)?;
        }

        withdrawal.status = WithdrawalStatus::Pending;
        withdrawal.payout_reference = None;
        withdrawal.payout_pair = None;
        withdrawal.updated_at = Utc::now();
        txn.writes()
            .upsert(tables::WITHDRAWALS, withdrawal_id.as_bytes(), &withdrawal)?;
        txn.commit()?;
        Ok(withdrawal)
    }

    /// Refuse a pending withdrawal and release its funds
    pub async fn reject(&self, withdrawal_id: WithdrawalId, admin: &str, reason: &str) -> Result<Withdrawal> {
        let withdrawal = self
            .close(withdrawal_id, WithdrawalStatus::Rejected, format!("{}: {}", admin, reason), None)
            .await?;
        tracing::warn!(withdrawal_id = %withdrawal_id, admin = admin, reason = reason, "Withdrawal rejected");
        Ok(withdrawal)
    }

    /// Withdraw a pending request on the user's behalf
    pub async fn cancel(&self, withdrawal_id: WithdrawalId, user_id: UserId) -> Result<Withdrawal> {
        let withdrawal = self
            .close(withdrawal_id, WithdrawalStatus::Cancelled, "cancelled by user".into(), Some(user_id))
            .await?;
        tracing::info!(withdrawal_id = %withdrawal_id, "Withdrawal cancelled");
        Ok(withdrawal)
    }

    async fn close(
        &self,
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        note: String,
        owner: Option<UserId>,
    ) -> Result<Withdrawal> {
        let wallet_id = self.withdrawal(withdrawal_id)?.wallet_id;
        let mut txn = self.wallets.begin(&[wallet_id]).await?;

        let mut withdrawal = self.withdrawal(withdrawal_id)?;
        if owner.map(|user| user != withdrawal.user_id).unwrap_or(false) {
            return Err(Error::not_found("withdrawal", withdrawal_id));
        }
        ensure_pending(&withdrawal)?;
        if withdrawal.entry_id.is_some() {
            return Err(Error::InvalidState(format!(
                "withdrawal {} is already being paid out",
                withdrawal_id
            )));
        }

        txn.release_lock(withdrawal.lock_id)?;
        withdrawal.status = status;
        withdrawal.note = Some(note);
        withdrawal.updated_at = Utc::now();
        txn.writes()
            .upsert(tables::WITHDRAWALS, withdrawal_id.as_bytes(), &withdrawal)?;
        txn.commit()?;
        Ok(withdrawal)
    }

    /// Expire pending withdrawals whose lock lifetime has passed
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Withdrawal>> {
        let candidates: Vec<Withdrawal> = self
            .wallets
            .storage()
            .scan_all::<Withdrawal>(tables::WITHDRAWALS)?
            .into_iter()
            .map(|(_, w)| w)
            .filter(|w| w.status == WithdrawalStatus::Pending && w.entry_id.is_none())
            .collect();

        let mut expired = Vec::new();
        for candidate in candidates {
            let mut txn = self.wallets.begin(&[candidate.wallet_id]).await?;
            let mut withdrawal = self.withdrawal(candidate.withdrawal_id)?;
            if withdrawal.status != WithdrawalStatus::Pending || withdrawal.entry_id.is_some() {
                continue;
            }
            if txn.expire_lock(withdrawal.lock_id, now)?.is_none() {
                continue;
            }

            withdrawal.status = WithdrawalStatus::Expired;
            withdrawal.note = Some("fund lock expired".into());
            withdrawal.updated_at = now;
            txn.writes().upsert(
                tables::WITHDRAWALS,
                withdrawal.withdrawal_id.as_bytes(),
                &withdrawal,
            )?;
            txn.commit()?;
            expired.push(withdrawal);
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired stale withdrawals");
        }
        Ok(expired)
    }

    /// Load a withdrawal
    pub fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<Withdrawal> {
        self.wallets
            .storage()
            .get(tables::WITHDRAWALS, withdrawal_id.as_bytes())?
            .ok_or_else(|| Error::not_found("withdrawal", withdrawal_id))
    }
}

fn ensure_pending(withdrawal: &Withdrawal) -> Result<()> {
    if withdrawal.status != WithdrawalStatus::Pending {
        return Err(Error::InvalidState(format!(
            "withdrawal {} is {:?}",
            withdrawal.withdrawal_id, withdrawal.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use chrono::Duration;
    use ledger_core::{Metrics, PaymentId, Reference, Storage, WalletId};
    use prometheus::Registry;
    use tempfile::TempDir;

    struct Fixture {
        manager: WithdrawalManager,
        wallets: Arc<WalletAccounting>,
        ledger: Arc<DoubleEntryLedger>,
        _temp_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = Config::default();
        settings.ledger.data_dir = temp_dir.path().to_path_buf();
        settings.ledger.rocksdb.sync_writes = false;
        settings.ledger.wallet.fund_lock_ttl_secs = 3600;

        let registry = Arc::new(Registry::new());
        let metrics = Metrics::with_registry(registry).unwrap();
        let storage = Arc::new(Storage::open(&settings.ledger, tables::SETTLEMENT_TABLES).unwrap());
        let wallets = Arc::new(WalletAccounting::new(
            storage.clone(),
            Arc::new(RowLocks::new(1_000)),
            metrics.clone(),
            settings.ledger.wallet.clone(),
        ));
        let ledger = Arc::new(DoubleEntryLedger::new(storage, metrics));
        let manager = WithdrawalManager::new(wallets.clone(), ledger.clone(), settings.withdrawal);
        Fixture {
            manager,
            wallets,
            ledger,
            _temp_dir: temp_dir,
        }
    }

    fn bank() -> BankDetails {
        BankDetails {
            account_holder: "A. Investor".into(),
            account_number: "000123456789".into(),
            ifsc: "HDFC0000001".into(),
        }
    }

    async fn funded(wallets: &WalletAccounting, amount: i64) -> (UserId, WalletId) {
        let user = UserId::new();
        let wallet = wallets.open_wallet(user).await.unwrap();
        wallets
            .credit(
                wallet.wallet_id,
                PostingRequest::new(
                    Paise::new(amount),
                    EntryKind::Deposit,
                    Reference::Payment(PaymentId::new()),
                ),
            )
            .await
            .unwrap();
        (user, wallet.wallet_id)
    }

    #[tokio::test]
    async fn test_request_locks_funds_and_replays_key() {
        let f = fixture();
        let (user, wallet_id) = funded(&f.wallets, 10_000).await;

        let first = f.manager.request(user, Paise::new(4_000), bank(), "wd-1").await.unwrap();
        let again = f.manager.request(user, Paise::new(4_000), bank(), "wd-1").await.unwrap();
        assert_eq!(first.withdrawal_id, again.withdrawal_id);

        let balance = f.wallets.balance(wallet_id).unwrap();
        assert_eq!(balance.locked, Paise::new(4_000));
        assert_eq!(balance.spendable, Paise::new(6_000));
    }

    #[tokio::test]
    async fn test_reused_key_with_other_amount_is_rejected() {
        let f = fixture();
        let (user, _) = funded(&f.wallets, 10_000).await;

        f.manager.request(user, Paise::new(4_000), bank(), "wd-1").await.unwrap();
        let err = f
            .manager
            .request(user, Paise::new(5_000), bank(), "wd-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(ledger_core::Error::DuplicateIdempotencyKey(_))
        ));
    }

    #[tokio::test]
    async fn test_recovery_mode_blocks_request() {
        let f = fixture();
        let (user, wallet_id) = funded(&f.wallets, 10_000).await;

        let mut txn = f.wallets.begin(&[wallet_id]).await.unwrap();
        txn.add_receivable(wallet_id, Paise::new(300)).unwrap();
        txn.commit().unwrap();

        let err = f
            .manager
            .request(user, Paise::new(1_000), bank(), "wd-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(ledger_core::Error::RecoveryModeRestricted(_))
        ));
        assert_eq!(f.wallets.balance(wallet_id).unwrap().locked, Paise::ZERO);
    }

    #[tokio::test]
    async fn test_below_minimum_is_rejected() {
        let f = fixture();
        let (user, _) = funded(&f.wallets, 10_000).await;
        assert!(f.manager.request(user, Paise::new(99), bank(), "wd-1").await.is_err());
    }

    #[tokio::test]
    async fn test_payout_debits_wallet_and_posts_cash() {
        let f = fixture();
        let (user, wallet_id) = funded(&f.wallets, 10_000).await;
        let withdrawal = f.manager.request(user, Paise::new(4_000), bank(), "wd-1").await.unwrap();

        let entry = f
            .manager
            .consume(withdrawal.withdrawal_id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(entry.kind, EntryKind::Withdrawal);

        let done = f
            .manager
            .record_payout(withdrawal.withdrawal_id, "UTR-1")
            .await
            .unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);

        let balance = f.wallets.balance(wallet_id).unwrap();
        assert_eq!(balance.spendable, Paise::new(6_000));
        assert_eq!(balance.locked, Paise::ZERO);
        assert!(f.ledger.trial_balance().unwrap().is_balanced());
    }

    #[tokio::test]
    async fn test_restore_credits_consumed_amount_back() {
        let f = fixture();
        let (user, wallet_id) = funded(&f.wallets, 10_000).await;
        let withdrawal = f.manager.request(user, Paise::new(4_000), bank(), "wd-1").await.unwrap();
        f.manager
            .consume(withdrawal.withdrawal_id, Uuid::new_v4())
            .await
            .unwrap();

        let failed = f
            .manager
            .restore(withdrawal.withdrawal_id, Uuid::new_v4(), "bank rejected")
            .await
            .unwrap();
        assert_eq!(failed.status, WithdrawalStatus::Failed);
        assert_eq!(f.wallets.balance(wallet_id).unwrap().spendable, Paise::new(10_000));
    }

    #[tokio::test]
    async fn test_reject_and_cancel_release_lock() {
        let f = fixture();
        let (user, wallet_id) = funded(&f.wallets, 10_000).await;
        let first = f.manager.request(user, Paise::new(1_000), bank(), "wd-1").await.unwrap();
        let second = f.manager.request(user, Paise::new(2_000), bank(), "wd-2").await.unwrap();

        f.manager.reject(first.withdrawal_id, "ops", "kyc").await.unwrap();
        f.manager.cancel(second.withdrawal_id, user).await.unwrap();

        let balance = f.wallets.balance(wallet_id).unwrap();
        assert_eq!(balance.locked, Paise::ZERO);
        assert_eq!(balance.spendable, Paise::new(10_000));
        assert!(f.manager.cancel(second.withdrawal_id, user).await.is_err());
    }

    #[tokio::test]
    async fn test_expire_stale_releases_old_locks() {
        let f = fixture();
        let (user, wallet_id) = funded(&f.wallets, 10_000).await;
        let withdrawal = f.manager.request(user, Paise::new(1_000), bank(), "wd-1").await.unwrap();

        assert!(f.manager.expire_stale(Utc::now()).await.unwrap().is_empty());

        let expired = f
            .manager
            .expire_stale(Utc::now() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].withdrawal_id, withdrawal.withdrawal_id);
        assert_eq!(expired[0].status, WithdrawalStatus::Expired);
        assert_eq!(f.wallets.balance(wallet_id).unwrap().locked, Paise::ZERO);
    }
}
