//! Wallet accounting
//!
//! Every balance change is an append-only [`LedgerEntry`] written in the same
//! atomic batch as the updated [`Wallet`] row. Callers either use the
//! single-shot helpers (`credit`, `debit`, `lock`, ...) or open a
//! [`WalletTxn`] when several wallets or extra rows must commit together.
//!
//! # Locking
//!
//! A transaction row-locks every wallet it touches up front, in ascending
//! wallet-id order, and holds the locks until it is committed or dropped.
//! Balances are read only after the locks are held.

use crate::{
    config::WalletConfig,
    error::{Error, Result},
    locks::{RowGuard, RowLocks},
    metrics::Metrics,
    storage::{compose_key, tables, Storage, WriteSet},
    types::*,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Where an entry lives in `wallet_entries`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct EntryLocation {
    wallet_id: WalletId,
    sequence: u64,
}

fn entry_key(wallet_id: &WalletId, sequence: u64) -> Vec<u8> {
    compose_key(&[wallet_id.as_bytes(), &sequence.to_be_bytes()])
}

fn wallet_row_key(wallet_id: &WalletId) -> String {
    RowLocks::key("wallet", wallet_id)
}

/// Replay summary of one wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAudit {
    /// Wallet audited
    pub wallet_id: WalletId,
    /// Entries replayed
    pub entries: u64,
    /// Balance reached by replay (equals the wallet row)
    pub balance: Paise,
}

/// Wallet accounting service
#[derive(Debug)]
pub struct WalletAccounting {
    storage: Arc<Storage>,
    locks: Arc<RowLocks>,
    metrics: Metrics,
    config: WalletConfig,
}

impl WalletAccounting {
    /// Create over a shared store and lock table
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<RowLocks>,
        metrics: Metrics,
        config: WalletConfig,
    ) -> Self {
        Self {
            storage,
            locks,
            metrics,
            config,
        }
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Shared row lock table
    pub fn row_locks(&self) -> &Arc<RowLocks> {
        &self.locks
    }

    /// Ledger metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ===== Wallets =====

    /// Open the user's wallet, creating it on first use
    pub async fn open_wallet(&self, user_id: UserId) -> Result<Wallet> {
        let _guard = self.locks.lock(RowLocks::key("user", user_id)).await?;

        if let Some(wallet) = self.wallet_for_user(user_id)? {
            return Ok(wallet);
        }

        let wallet = Wallet::new(user_id);
        let mut writes = WriteSet::new();
        writes.insert(tables::WALLETS_BY_USER, user_id.as_bytes(), &wallet.wallet_id)?;
        writes.upsert(tables::WALLETS, wallet.wallet_id.as_bytes(), &wallet)?;
        self.storage.commit(writes)?;

        tracing::info!(
            wallet_id = %wallet.wallet_id,
            user_id = %user_id,
            "Wallet opened"
        );

        Ok(wallet)
    }

    /// Wallet owned by `user_id`, if any
    pub fn wallet_for_user(&self, user_id: UserId) -> Result<Option<Wallet>> {
        match self
            .storage
            .get::<WalletId>(tables::WALLETS_BY_USER, user_id.as_bytes())?
        {
            Some(wallet_id) => Ok(Some(self.get_wallet(wallet_id)?)),
            None => Ok(None),
        }
    }

    /// Load a wallet row
    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.storage
            .get(tables::WALLETS, wallet_id.as_bytes())?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))
    }

    /// Read-only balance snapshot
    pub fn balance(&self, wallet_id: WalletId) -> Result<BalanceView> {
        Ok(BalanceView::from(&self.get_wallet(wallet_id)?))
    }

    /// Every wallet row
    pub fn wallets(&self) -> Result<Vec<Wallet>> {
        Ok(self
            .storage
            .scan_all::<Wallet>(tables::WALLETS)?
            .into_iter()
            .map(|(_, wallet)| wallet)
            .collect())
    }

    // ===== Transactions =====

    /// Open a transaction over `wallet_ids`, locking them in ascending order
    pub async fn begin(&self, wallet_ids: &[WalletId]) -> Result<WalletTxn<'_>> {
        let ids: BTreeSet<WalletId> = wallet_ids.iter().copied().collect();
        let guards = self
            .locks
            .lock_all(ids.iter().map(wallet_row_key))
            .await
            .map_err(|e| self.reject(e))?;

        let mut wallets = BTreeMap::new();
        for wallet_id in ids {
            wallets.insert(wallet_id, self.get_wallet(wallet_id)?);
        }

        Ok(WalletTxn {
            accounting: self,
            _guards: guards,
            wallets,
            touched: BTreeSet::new(),
            entries: Vec::new(),
            writes: WriteSet::new(),
            pending_transactions: HashSet::new(),
            pending_reversals: HashSet::new(),
        })
    }

    /// Credit a wallet
    pub async fn credit(&self, wallet_id: WalletId, request: PostingRequest) -> Result<LedgerEntry> {
        let mut txn = self.begin(&[wallet_id]).await?;
        let entry = txn.credit(wallet_id, request)?;
        txn.commit()?;
        Ok(entry)
    }

    /// Debit a wallet's spendable balance
    pub async fn debit(&self, wallet_id: WalletId, request: PostingRequest) -> Result<LedgerEntry> {
        let mut txn = self.begin(&[wallet_id]).await?;
        let entry = txn.debit(wallet_id, request)?;
        txn.commit()?;
        Ok(entry)
    }

    /// Credit several wallets in one atomic batch
    pub async fn credit_many(
        &self,
        credits: Vec<(WalletId, PostingRequest)>,
    ) -> Result<Vec<LedgerEntry>> {
        let wallet_ids: Vec<WalletId> = credits.iter().map(|(id, _)| *id).collect();
        let mut txn = self.begin(&wallet_ids).await?;
        let mut entries = Vec::with_capacity(credits.len());
        for (wallet_id, request) in credits {
            entries.push(txn.credit(wallet_id, request)?);
        }
        txn.commit()?;
        Ok(entries)
    }

    /// Reserve funds for `lockable` with the configured lifetime
    pub async fn lock(
        &self,
        wallet_id: WalletId,
        amount: Paise,
        lockable: Reference,
        reason: &str,
    ) -> Result<FundLock> {
        let expires_at = self.lock_expiry(Utc::now());
        let mut txn = self.begin(&[wallet_id]).await?;
        let lock = txn.lock_funds(wallet_id, amount, lockable, reason, expires_at)?;
        txn.commit()?;
        Ok(lock)
    }

    /// Return locked funds to spendable
    pub async fn release(&self, lock_id: LockId) -> Result<FundLock> {
        let wallet_id = self.fund_lock(lock_id)?.wallet_id;
        let mut txn = self.begin(&[wallet_id]).await?;
        let lock = txn.release_lock(lock_id)?;
        txn.commit()?;
        Ok(lock)
    }

    /// Finalize a lock into a debit of the locked amount
    pub async fn consume(&self, lock_id: LockId, request: PostingRequest) -> Result<LedgerEntry> {
        let wallet_id = self.fund_lock(lock_id)?.wallet_id;
        let mut txn = self.begin(&[wallet_id]).await?;
        let entry = txn.consume_lock(lock_id, request)?;
        txn.commit()?;
        Ok(entry)
    }

    /// Expire every active lock whose `expires_at` is at or before `now`
    pub async fn expire_locks(&self, now: DateTime<Utc>) -> Result<Vec<FundLock>> {
        let candidates: Vec<FundLock> = self
            .storage
            .scan_all::<FundLock>(tables::FUND_LOCKS)?
            .into_iter()
            .map(|(_, lock)| lock)
            .filter(|lock| lock.status == LockStatus::Active && is_expired(lock, now))
            .collect();

        let mut expired = Vec::new();
        for candidate in candidates {
            let mut txn = self.begin(&[candidate.wallet_id]).await?;
            if let Some(lock) = txn.expire_lock(candidate.lock_id, now)? {
                txn.commit()?;
                expired.push(lock);
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired fund locks");
        }
        Ok(expired)
    }

    /// Post the paired counter-entry of `entry_id`
    ///
    /// Reusing `transaction_id` returns the counter-entry already written.
    pub async fn reverse_entry(
        &self,
        entry_id: EntryId,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<LedgerEntry> {
        if let Some(existing) = self.entry_by_transaction(transaction_id)? {
            return Ok(existing);
        }

        let original = self.entry(entry_id)?;
        let mut txn = self.begin(&[original.wallet_id]).await?;
        let entry = txn.reverse_entry(&original, transaction_id, reason)?;
        txn.commit()?;
        Ok(entry)
    }

    /// Expiry of a lock taken at `now` under the configured TTL
    pub fn lock_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.config.fund_lock_ttl_secs {
            0 => None,
            secs => Some(now + Duration::seconds(secs as i64)),
        }
    }

    fn reject(&self, error: Error) -> Error {
        self.metrics.record_error(&error);
        if error.is_structural() {
            tracing::error!(error = %error, "Ledger write halted");
        } else {
            tracing::warn!(error = %error, "Ledger request rejected");
        }
        error
    }

    // ===== Entries =====

    /// Load an entry by id
    pub fn entry(&self, entry_id: EntryId) -> Result<LedgerEntry> {
        let location: EntryLocation = self
            .storage
            .get(tables::ENTRY_INDEX, entry_id.as_bytes())?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;

        self.storage
            .get(
                tables::WALLET_ENTRIES,
                &entry_key(&location.wallet_id, location.sequence),
            )?
            .ok_or_else(|| {
                Error::InvariantViolation(format!("entry {} indexed but missing", entry_id))
            })
    }

    /// Entry written under `transaction_id`, if any
    pub fn entry_by_transaction(&self, transaction_id: Uuid) -> Result<Option<LedgerEntry>> {
        match self
            .storage
            .get::<EntryId>(tables::TRANSACTION_INDEX, transaction_id.as_bytes())?
        {
            Some(entry_id) => Ok(Some(self.entry(entry_id)?)),
            None => Ok(None),
        }
    }

    /// Reversal link of an entry, if it was countered
    pub fn entry_reversal(&self, entry_id: EntryId) -> Result<Option<EntryReversal>> {
        self.storage
            .get(tables::ENTRY_REVERSALS, entry_id.as_bytes())
    }

    /// Whether an entry was countered
    pub fn is_reversed(&self, entry_id: EntryId) -> Result<bool> {
        self.storage
            .contains(tables::ENTRY_REVERSALS, entry_id.as_bytes())
    }

    /// Entries written for `reference`, in id (time) order
    pub fn entries_for_reference(&self, reference: &Reference) -> Result<Vec<LedgerEntry>> {
        self.storage
            .scan_prefix::<EntryId>(tables::ENTRIES_BY_REFERENCE, &reference.key_bytes())?
            .into_iter()
            .map(|(_, entry_id)| self.entry(entry_id))
            .collect()
    }

    /// Set the archive flag of an entry (the entry itself is untouched)
    pub fn set_archived(&self, entry_id: EntryId, archived: bool) -> Result<()> {
        // Entry must exist
        self.entry(entry_id)?;

        let mut writes = WriteSet::new();
        writes.upsert(tables::ARCHIVE_FLAGS, entry_id.as_bytes(), &archived)?;
        self.storage.commit(writes)
    }

    /// Archive flag of an entry
    pub fn is_archived(&self, entry_id: EntryId) -> Result<bool> {
        Ok(self
            .storage
            .get::<bool>(tables::ARCHIVE_FLAGS, entry_id.as_bytes())?
            .unwrap_or(false))
    }

    // ===== Locks =====

    /// Load a fund lock
    pub fn fund_lock(&self, lock_id: LockId) -> Result<FundLock> {
        self.storage
            .get(tables::FUND_LOCKS, lock_id.as_bytes())?
            .ok_or_else(|| Error::LockNotFound(lock_id.to_string()))
    }

    /// All locks ever taken on a wallet
    pub fn locks_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<FundLock>> {
        self.storage
            .scan_prefix::<LockId>(tables::FUND_LOCKS_BY_WALLET, wallet_id.as_bytes())?
            .into_iter()
            .map(|(_, lock_id)| self.fund_lock(lock_id))
            .collect()
    }

    // ===== History & verification =====

    /// Lazy paginated history of a wallet
    pub fn history(&self, wallet_id: WalletId, range: HistoryRange) -> Result<LedgerHistory> {
        // Fail fast on unknown wallets
        self.get_wallet(wallet_id)?;
        let cursor = HistoryCursor {
            wallet_id,
            next_sequence: 1,
        };
        Ok(self.resume_history(cursor, range))
    }

    /// Continue a history from a saved cursor
    pub fn resume_history(&self, cursor: HistoryCursor, range: HistoryRange) -> LedgerHistory {
        let page_size = range
            .page_size
            .unwrap_or(self.config.history_page_size)
            .max(1);
        LedgerHistory {
            storage: self.storage.clone(),
            wallet_id: cursor.wallet_id,
            range,
            page_size,
            next_sequence: cursor.next_sequence.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Replay a wallet's entry chain against its row
    pub fn verify_wallet(&self, wallet_id: WalletId) -> Result<WalletAudit> {
        let wallet = self.get_wallet(wallet_id)?;
        let violation = |msg: String| {
            let error = Error::InvariantViolation(format!("wallet {}: {}", wallet_id, msg));
            self.reject(error)
        };

        let mut expected_sequence = 1u64;
        let mut running = Paise::ZERO;
        let mut prev_hash = [0u8; 32];

        for (_, entry) in self
            .storage
            .scan_prefix::<LedgerEntry>(tables::WALLET_ENTRIES, wallet_id.as_bytes())?
        {
            if entry.sequence != expected_sequence {
                return Err(violation(format!(
                    "sequence gap: expected {}, found {}",
                    expected_sequence, entry.sequence
                )));
            }
            if entry.balance_before != running {
                return Err(violation(format!(
                    "entry {} starts at {} but previous ended at {}",
                    entry.entry_id, entry.balance_before, running
                )));
            }
            if !entry.is_arithmetically_consistent() {
                return Err(violation(format!(
                    "entry {} arithmetic inconsistent",
                    entry.entry_id
                )));
            }
            if entry.prev_hash != prev_hash || entry.compute_hash() != entry.hash {
                return Err(violation(format!("hash chain broken at entry {}", entry.entry_id)));
            }

            running = entry.balance_after;
            prev_hash = entry.hash;
            expected_sequence += 1;
        }

        if running != wallet.balance || wallet.last_sequence != expected_sequence - 1 {
            return Err(violation(format!(
                "row balance {} (seq {}) disagrees with replay {} (seq {})",
                wallet.balance,
                wallet.last_sequence,
                running,
                expected_sequence - 1
            )));
        }

        let active_locked = Paise::sum(
            self.locks_for_wallet(wallet_id)?
                .into_iter()
                .filter(|lock| lock.status == LockStatus::Active)
                .map(|lock| lock.amount),
        )?;
        if active_locked != wallet.locked_balance {
            return Err(violation(format!(
                "locked balance {} but active locks total {}",
                wallet.locked_balance, active_locked
            )));
        }

        wallet.check_invariants()?;

        Ok(WalletAudit {
            wallet_id,
            entries: expected_sequence - 1,
            balance: running,
        })
    }
}

fn is_expired(lock: &FundLock, now: DateTime<Utc>) -> bool {
    lock.expires_at.map(|at| at <= now).unwrap_or(false)
}

/// Atomic multi-row wallet write
///
/// Holds the row locks of its wallets until committed or dropped. Dropping
/// without `commit` writes nothing.
#[derive(Debug)]
pub struct WalletTxn<'a> {
    accounting: &'a WalletAccounting,
    _guards: Vec<RowGuard>,
    wallets: BTreeMap<WalletId, Wallet>,
    touched: BTreeSet<WalletId>,
    entries: Vec<LedgerEntry>,
    writes: WriteSet,
    pending_transactions: HashSet<Uuid>,
    pending_reversals: HashSet<EntryId>,
}

impl<'a> WalletTxn<'a> {
    /// Current (uncommitted) state of a locked wallet
    pub fn wallet(&self, wallet_id: WalletId) -> Result<&Wallet> {
        self.wallets.get(&wallet_id).ok_or_else(|| {
            Error::InvariantViolation(format!("wallet {} not locked by this transaction", wallet_id))
        })
    }

    fn wallet_mut(&mut self, wallet_id: WalletId) -> Result<&mut Wallet> {
        let wallet = self.wallets.get_mut(&wallet_id).ok_or_else(|| {
            Error::InvariantViolation(format!("wallet {} not locked by this transaction", wallet_id))
        })?;
        self.touched.insert(wallet_id);
        Ok(wallet)
    }

    /// Extra rows to commit with the wallet changes
    pub fn writes(&mut self) -> &mut WriteSet {
        &mut self.writes
    }

    /// Entries staged so far
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Stage a credit
    pub fn credit(&mut self, wallet_id: WalletId, request: PostingRequest) -> Result<LedgerEntry> {
        if !request.kind.is_credit() {
            return Err(Error::Other(format!("{} is not a credit kind", request.kind)));
        }
        self.post(wallet_id, request)
    }

    /// Stage a debit of spendable funds
    pub fn debit(&mut self, wallet_id: WalletId, request: PostingRequest) -> Result<LedgerEntry> {
        if request.kind.is_credit() {
            return Err(Error::Other(format!("{} is not a debit kind", request.kind)));
        }
        self.post(wallet_id, request)
    }

    /// Stage an entry of any kind
    pub fn post(&mut self, wallet_id: WalletId, request: PostingRequest) -> Result<LedgerEntry> {
        self.post_inner(wallet_id, request)
            .map_err(|e| self.accounting.reject(e))
    }

    fn post_inner(&mut self, wallet_id: WalletId, request: PostingRequest) -> Result<LedgerEntry> {
        request.amount.ensure_positive()?;

        if let Some(existing) = self.replayed(wallet_id, &request)? {
            return Ok(existing);
        }

        let wallet = self.wallet(wallet_id)?;
        if wallet.recovery_mode && !request.kind.allowed_in_recovery() {
            return Err(Error::RecoveryModeRestricted(wallet_id));
        }

        let direction = request.kind.direction();
        if direction == Direction::Debit && request.amount > wallet.spendable() {
            return Err(Error::InsufficientFunds {
                wallet_id,
                requested: request.amount,
                available: wallet.spendable(),
            });
        }

        let balance_before = wallet.balance;
        let balance_after = match direction {
            Direction::Credit => balance_before.checked_add(request.amount)?,
            Direction::Debit => balance_before.checked_sub(request.amount)?,
        };

        let mut entry = LedgerEntry {
            entry_id: EntryId::new(),
            transaction_id: request.transaction_id,
            wallet_id,
            sequence: wallet.last_sequence + 1,
            kind: request.kind,
            amount: request.amount,
            balance_before,
            balance_after,
            reference: request.reference,
            paired_entry: request.paired_entry,
            description: request.description,
            created_at: Utc::now(),
            prev_hash: wallet.last_hash,
            hash: [0u8; 32],
        };
        entry.hash = entry.compute_hash();

        if !entry.is_arithmetically_consistent() {
            return Err(Error::InvariantViolation(format!(
                "entry {} arithmetic inconsistent",
                entry.entry_id
            )));
        }

        let wallet = self.wallet_mut(wallet_id)?;
        wallet.balance = balance_after;
        wallet.last_sequence = entry.sequence;
        wallet.last_hash = entry.hash;
        wallet.updated_at = entry.created_at;
        wallet.check_invariants()?;

        let location = EntryLocation {
            wallet_id,
            sequence: entry.sequence,
        };
        self.writes.insert(
            tables::WALLET_ENTRIES,
            entry_key(&wallet_id, entry.sequence),
            &entry,
        )?;
        self.writes
            .insert(tables::ENTRY_INDEX, entry.entry_id.as_bytes(), &location)?;
        self.writes.insert(
            tables::TRANSACTION_INDEX,
            entry.transaction_id.as_bytes(),
            &entry.entry_id,
        )?;
        self.writes.insert(
            tables::ENTRIES_BY_REFERENCE,
            compose_key(&[&entry.reference.key_bytes(), entry.entry_id.as_bytes()]),
            &entry.entry_id,
        )?;

        self.pending_transactions.insert(entry.transaction_id);
        self.entries.push(entry.clone());

        tracing::info!(
            wallet_id = %wallet_id,
            entry_id = %entry.entry_id,
            kind = %entry.kind,
            amount = entry.amount.value(),
            balance_after = entry.balance_after.value(),
            reference = %entry.reference,
            "Ledger entry staged"
        );

        Ok(entry)
    }

    // An already-used transaction id returns its entry when the request matches
    fn replayed(&self, wallet_id: WalletId, request: &PostingRequest) -> Result<Option<LedgerEntry>> {
        if self.pending_transactions.contains(&request.transaction_id) {
            return Err(Error::DuplicateIdempotencyKey(request.transaction_id.to_string()));
        }

        match self
            .accounting
            .entry_by_transaction(request.transaction_id)?
        {
            Some(existing)
                if existing.wallet_id == wallet_id
                    && existing.kind == request.kind
                    && existing.amount == request.amount =>
            {
                tracing::debug!(
                    transaction_id = %request.transaction_id,
                    entry_id = %existing.entry_id,
                    "Replayed transaction returns prior entry"
                );
                Ok(Some(existing))
            }
            Some(_) => Err(Error::DuplicateIdempotencyKey(
                request.transaction_id.to_string(),
            )),
            None => Ok(None),
        }
    }

    /// Stage the paired counter-entry of `original` and its reversal link
    pub fn reverse_entry(
        &mut self,
        original: &LedgerEntry,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<LedgerEntry> {
        let request = PostingRequest::new(
            original.amount,
            original.kind.counter_kind(),
            original.reference,
        )
        .with_description(format!("Reversal of {}: {}", original.entry_id, reason))
        .with_transaction_id(transaction_id)
        .pairing(original.entry_id);

        self.ensure_not_reversed(original.entry_id)?;
        let entry = self.post(original.wallet_id, request)?;
        self.record_reversal(EntryReversal {
            original_entry: original.entry_id,
            reversing_entry: Some(entry.entry_id),
            receivable_id: None,
            reason: reason.to_string(),
            created_at: entry.created_at,
        })?;
        Ok(entry)
    }

    /// Fail with `AlreadyReversed` if the entry was countered before
    pub fn ensure_not_reversed(&self, entry_id: EntryId) -> Result<()> {
        if self.pending_reversals.contains(&entry_id) || self.accounting.is_reversed(entry_id)? {
            return Err(Error::AlreadyReversed(format!("entry {}", entry_id)));
        }
        Ok(())
    }

    /// Stage a reversal link
    pub fn record_reversal(&mut self, link: EntryReversal) -> Result<()> {
        self.ensure_not_reversed(link.original_entry)?;
        self.writes
            .insert(tables::ENTRY_REVERSALS, link.original_entry.as_bytes(), &link)?;
        self.pending_reversals.insert(link.original_entry);
        Ok(())
    }

    /// Stage a new fund lock
    pub fn lock_funds(
        &mut self,
        wallet_id: WalletId,
        amount: Paise,
        lockable: Reference,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<FundLock> {
        amount
            .ensure_positive()
            .map_err(|e| self.accounting.reject(e))?;

        let wallet = self.wallet(wallet_id)?;
        if amount > wallet.spendable() {
            return Err(self.accounting.reject(Error::InsufficientFunds {
                wallet_id,
                requested: amount,
                available: wallet.spendable(),
            }));
        }

        let now = Utc::now();
        let lock = FundLock {
            lock_id: LockId::new(),
            wallet_id,
            lockable,
            amount,
            reason: reason.to_string(),
            status: LockStatus::Active,
            created_at: now,
            expires_at,
            resolved_at: None,
        };

        let wallet = self.wallet_mut(wallet_id)?;
        wallet.locked_balance = wallet.locked_balance.checked_add(amount)?;
        wallet.updated_at = now;
        wallet.check_invariants()?;

        self.writes
            .upsert(tables::FUND_LOCKS, lock.lock_id.as_bytes(), &lock)?;
        self.writes.insert(
            tables::FUND_LOCKS_BY_WALLET,
            compose_key(&[wallet_id.as_bytes(), lock.lock_id.as_bytes()]),
            &lock.lock_id,
        )?;

        tracing::info!(
            wallet_id = %wallet_id,
            lock_id = %lock.lock_id,
            amount = amount.value(),
            lockable = %lockable,
            "Funds locked"
        );

        Ok(lock)
    }

    fn active_lock(&self, lock_id: LockId) -> Result<FundLock> {
        let lock = self.accounting.fund_lock(lock_id)?;
        self.wallet(lock.wallet_id)?;
        if lock.status != LockStatus::Active {
            return Err(Error::InvalidLockState(format!(
                "lock {} is {:?}",
                lock_id, lock.status
            )));
        }
        Ok(lock)
    }

    fn resolve_lock(&mut self, mut lock: FundLock, status: LockStatus, at: DateTime<Utc>) -> Result<FundLock> {
        let wallet = self.wallet_mut(lock.wallet_id)?;
        wallet.locked_balance = wallet.locked_balance.checked_sub(lock.amount)?;
        wallet.updated_at = at;

        lock.status = status;
        lock.resolved_at = Some(at);
        self.writes
            .upsert(tables::FUND_LOCKS, lock.lock_id.as_bytes(), &lock)?;
        Ok(lock)
    }

    /// Stage the release of an active lock
    pub fn release_lock(&mut self, lock_id: LockId) -> Result<FundLock> {
        let lock = self.active_lock(lock_id)?;
        let lock = self.resolve_lock(lock, LockStatus::Released, Utc::now())?;
        tracing::info!(lock_id = %lock_id, amount = lock.amount.value(), "Funds released");
        Ok(lock)
    }

    /// Stage expiry of a lock; `None` if it is no longer active or not yet due
    pub fn expire_lock(&mut self, lock_id: LockId, now: DateTime<Utc>) -> Result<Option<FundLock>> {
        let lock = self.accounting.fund_lock(lock_id)?;
        if lock.status != LockStatus::Active || !is_expired(&lock, now) {
            return Ok(None);
        }
        self.resolve_lock(lock, LockStatus::Expired, now).map(Some)
    }

    /// Stage a debit of exactly the locked amount and mark the lock consumed
    pub fn consume_lock(&mut self, lock_id: LockId, request: PostingRequest) -> Result<LedgerEntry> {
        if let Some(existing) = self.accounting.entry_by_transaction(request.transaction_id)? {
            return Ok(existing);
        }

        let lock = self
            .active_lock(lock_id)
            .map_err(|e| self.accounting.reject(e))?;
        if request.amount != lock.amount || request.kind.is_credit() {
            return Err(self.accounting.reject(Error::InvalidAmount(format!(
                "lock {} holds {}, consume requested {} {}",
                lock_id, lock.amount, request.kind, request.amount
            ))));
        }

        let wallet = self.wallet(lock.wallet_id)?;
        if wallet.recovery_mode && !request.kind.allowed_in_recovery() {
            return Err(self
                .accounting
                .reject(Error::RecoveryModeRestricted(lock.wallet_id)));
        }

        let wallet_id = lock.wallet_id;
        self.resolve_lock(lock, LockStatus::Consumed, Utc::now())?;
        self.post(wallet_id, request)
    }

    /// Open a receivable on the wallet and enter recovery mode
    pub fn add_receivable(&mut self, wallet_id: WalletId, amount: Paise) -> Result<()> {
        amount.ensure_positive()?;
        let wallet = self.wallet_mut(wallet_id)?;
        wallet.receivable_balance = wallet.receivable_balance.checked_add(amount)?;
        wallet.recovery_mode = true;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    /// Reduce the outstanding receivable balance
    pub fn reduce_receivable(&mut self, wallet_id: WalletId, amount: Paise) -> Result<()> {
        let wallet = self.wallet_mut(wallet_id)?;
        let remaining = wallet.receivable_balance.checked_sub(amount)?;
        if remaining.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "wallet {} receivable would drop below zero",
                wallet_id
            )));
        }
        wallet.receivable_balance = remaining;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    /// Set or clear recovery mode
    pub fn set_recovery_mode(&mut self, wallet_id: WalletId, recovery_mode: bool) -> Result<()> {
        let wallet = self.wallet_mut(wallet_id)?;
        wallet.recovery_mode = recovery_mode;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    /// Write wallet rows, entries and extra rows in one atomic batch
    pub fn commit(mut self) -> Result<Vec<LedgerEntry>> {
        let start = Instant::now();

        for wallet_id in &self.touched {
            let wallet = self.wallets.get(wallet_id).ok_or_else(|| {
                Error::InvariantViolation(format!("touched wallet {} not loaded", wallet_id))
            })?;
            wallet
                .check_invariants()
                .map_err(|e| self.accounting.reject(e))?;
            self.writes
                .upsert(tables::WALLETS, wallet_id.as_bytes(), wallet)?;
        }

        let writes = std::mem::take(&mut self.writes);
        self.accounting
            .storage
            .commit(writes)
            .map_err(|e| self.accounting.reject(e))?;

        let metrics = &self.accounting.metrics;
        metrics.record_commit_duration(start.elapsed().as_secs_f64());
        metrics.record_entries(self.entries.len());

        Ok(std::mem::take(&mut self.entries))
    }
}

/// Date window and page size of a history read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRange {
    /// Earliest `created_at` (inclusive)
    pub from: Option<DateTime<Utc>>,
    /// Latest `created_at` (inclusive)
    pub to: Option<DateTime<Utc>>,
    /// Entries fetched per storage read
    pub page_size: Option<usize>,
}

impl HistoryRange {
    /// Unbounded range
    pub fn all() -> Self {
        Self::default()
    }

    /// Entries between `from` and `to`
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            page_size: None,
        }
    }

    /// Set page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Resumable position in a wallet history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    /// Wallet being read
    pub wallet_id: WalletId,
    /// Next sequence number to return
    pub next_sequence: u64,
}

/// Lazy, paginated, restartable wallet history in sequence order
pub struct LedgerHistory {
    storage: Arc<Storage>,
    wallet_id: WalletId,
    range: HistoryRange,
    page_size: usize,
    next_sequence: u64,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl std::fmt::Debug for LedgerHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHistory")
            .field("wallet_id", &self.wallet_id)
            .field("next_sequence", &self.next_sequence)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl LedgerHistory {
    /// Position of the next entry this history would return
    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor {
            wallet_id: self.wallet_id,
            next_sequence: self
                .buffer
                .front()
                .map(|entry| entry.sequence)
                .unwrap_or(self.next_sequence),
        }
    }

    /// Up to one page of entries
    pub fn next_page(&mut self) -> Result<Vec<LedgerEntry>> {
        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size {
            match self.next() {
                Some(entry) => page.push(entry?),
                None => break,
            }
        }
        Ok(page)
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let rows = self.storage.scan_prefix_from::<LedgerEntry>(
                tables::WALLET_ENTRIES,
                self.wallet_id.as_bytes(),
                &entry_key(&self.wallet_id, self.next_sequence),
                self.page_size,
            )?;
            if rows.len() < self.page_size {
                self.exhausted = true;
            }

            for (_, entry) in rows {
                self.next_sequence = entry.sequence + 1;
                if self.range.from.map_or(false, |from| entry.created_at < from) {
                    continue;
                }
                if self.range.to.map_or(false, |to| entry.created_at > to) {
                    self.exhausted = true;
                    break;
                }
                self.buffer.push_back(entry);
            }
        }
        Ok(())
    }
}

impl Iterator for LedgerHistory {
    type Item = Result<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    fn accounting() -> (WalletAccounting, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        config.locking.lock_timeout_ms = 500;

        let storage = Arc::new(Storage::open(&config, &[]).unwrap());
        let locks = Arc::new(RowLocks::new(config.locking.lock_timeout_ms));
        let wallets = WalletAccounting::new(storage, locks, Metrics::new().unwrap(), config.wallet);
        (wallets, temp_dir)
    }

    fn deposit(amount: i64) -> PostingRequest {
        PostingRequest::new(
            Paise::new(amount),
            EntryKind::Deposit,
            Reference::Payment(PaymentId::new()),
        )
    }

    fn purchase(amount: i64) -> PostingRequest {
        PostingRequest::new(
            Paise::new(amount),
            EntryKind::SharePurchase,
            Reference::Allocation(AllocationId::new()),
        )
    }

    #[tokio::test]
    async fn test_open_wallet_is_idempotent() {
        let (wallets, _temp) = accounting();
        let user = UserId::new();
        let first = wallets.open_wallet(user).await.unwrap();
        let second = wallets.open_wallet(user).await.unwrap();
        assert_eq!(first.wallet_id, second.wallet_id);
    }

    #[tokio::test]
    async fn test_credit_and_debit() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();

        let credit = wallets.credit(wallet.wallet_id, deposit(1_000)).await.unwrap();
        assert_eq!(credit.balance_before, Paise::ZERO);
        assert_eq!(credit.balance_after, Paise::new(1_000));
        assert_eq!(credit.sequence, 1);

        let debit = wallets.debit(wallet.wallet_id, purchase(300)).await.unwrap();
        assert_eq!(debit.balance_before, Paise::new(1_000));
        assert_eq!(debit.balance_after, Paise::new(700));
        assert_eq!(debit.prev_hash, credit.hash);

        let view = wallets.balance(wallet.wallet_id).unwrap();
        assert_eq!(view.spendable, Paise::new(700));
        assert_eq!(wallets.verify_wallet(wallet.wallet_id).unwrap().entries, 2);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();

        let result = wallets.credit(wallet.wallet_id, deposit(0)).await;
        assert!(matches!(result, Err(Error::InvalidAmount(_))));
        let result = wallets.credit(wallet.wallet_id, deposit(-5)).await;
        assert!(matches!(result, Err(Error::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_debit_beyond_spendable_fails() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        wallets.credit(wallet.wallet_id, deposit(500)).await.unwrap();

        let result = wallets.debit(wallet.wallet_id, purchase(501)).await;
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));

        // Nothing written
        let row = wallets.get_wallet(wallet.wallet_id).unwrap();
        assert_eq!(row.balance, Paise::new(500));
        assert_eq!(row.last_sequence, 1);
    }

    #[tokio::test]
    async fn test_transaction_id_replay_returns_prior_entry() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        let request = deposit(250);

        let first = wallets.credit(wallet.wallet_id, request.clone()).await.unwrap();
        let second = wallets.credit(wallet.wallet_id, request).await.unwrap();

        assert_eq!(first.entry_id, second.entry_id);
        assert_eq!(wallets.get_wallet(wallet.wallet_id).unwrap().balance, Paise::new(250));
    }

    #[tokio::test]
    async fn test_lock_release_and_consume() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        wallets.credit(wallet.wallet_id, deposit(1_000)).await.unwrap();

        let withdrawal = Reference::Withdrawal(WithdrawalId::new());
        let lock = wallets
            .lock(wallet.wallet_id, Paise::new(600), withdrawal, "withdrawal")
            .await
            .unwrap();

        let view = wallets.balance(wallet.wallet_id).unwrap();
        assert_eq!(view.spendable, Paise::new(400));
        assert_eq!(view.locked, Paise::new(600));

        // Locked funds cannot be spent
        let result = wallets.debit(wallet.wallet_id, purchase(500)).await;
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));

        let entry = wallets
            .consume(
                lock.lock_id,
                PostingRequest::new(Paise::new(600), EntryKind::Withdrawal, withdrawal),
            )
            .await
            .unwrap();
        assert_eq!(entry.balance_after, Paise::new(400));

        let view = wallets.balance(wallet.wallet_id).unwrap();
        assert_eq!(view.locked, Paise::ZERO);
        assert_eq!(view.spendable, Paise::new(400));

        let result = wallets.release(lock.lock_id).await;
        assert!(matches!(result, Err(Error::InvalidLockState(_))));
        wallets.verify_wallet(wallet.wallet_id).unwrap();
    }

    #[tokio::test]
    async fn test_expire_locks() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        wallets.credit(wallet.wallet_id, deposit(1_000)).await.unwrap();

        let lock = wallets
            .lock(
                wallet.wallet_id,
                Paise::new(100),
                Reference::Withdrawal(WithdrawalId::new()),
                "withdrawal",
            )
            .await
            .unwrap();

        assert!(wallets.expire_locks(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + Duration::days(30);
        let expired = wallets.expire_locks(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(wallets.fund_lock(lock.lock_id).unwrap().status, LockStatus::Expired);
        assert_eq!(wallets.balance(wallet.wallet_id).unwrap().locked, Paise::ZERO);
    }

    #[tokio::test]
    async fn test_recovery_mode_blocks_outbound() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        wallets.credit(wallet.wallet_id, deposit(1_000)).await.unwrap();

        let mut txn = wallets.begin(&[wallet.wallet_id]).await.unwrap();
        txn.add_receivable(wallet.wallet_id, Paise::new(200)).unwrap();
        txn.commit().unwrap();

        let result = wallets.debit(wallet.wallet_id, purchase(100)).await;
        assert!(matches!(result, Err(Error::RecoveryModeRestricted(_))));

        // Deposits stay allowed
        wallets.credit(wallet.wallet_id, deposit(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reverse_entry_once() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        let credit = wallets.credit(wallet.wallet_id, deposit(800)).await.unwrap();

        let reversal = wallets
            .reverse_entry(credit.entry_id, Uuid::new_v4(), "compensation")
            .await
            .unwrap();
        assert_eq!(reversal.kind, EntryKind::ReversalDebit);
        assert_eq!(reversal.paired_entry, Some(credit.entry_id));
        assert_eq!(reversal.balance_after, Paise::ZERO);
        assert!(wallets.is_reversed(credit.entry_id).unwrap());

        let again = wallets
            .reverse_entry(credit.entry_id, Uuid::new_v4(), "again")
            .await;
        assert!(matches!(again, Err(Error::AlreadyReversed(_))));
    }

    #[tokio::test]
    async fn test_credit_many_is_atomic() {
        let (wallets, _temp) = accounting();
        let a = wallets.open_wallet(UserId::new()).await.unwrap();
        let b = wallets.open_wallet(UserId::new()).await.unwrap();

        let bonus = Reference::Bonus(BonusId::new());
        let entries = wallets
            .credit_many(vec![
                (a.wallet_id, PostingRequest::new(Paise::new(100), EntryKind::BonusCredit, bonus)),
                (b.wallet_id, PostingRequest::new(Paise::new(50), EntryKind::BonusCredit, bonus)),
            ])
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(wallets.entries_for_reference(&bonus).unwrap().len(), 2);

        // A zero leg aborts the whole batch
        let result = wallets
            .credit_many(vec![
                (a.wallet_id, PostingRequest::new(Paise::new(100), EntryKind::BonusCredit, bonus)),
                (b.wallet_id, PostingRequest::new(Paise::ZERO, EntryKind::BonusCredit, bonus)),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(wallets.get_wallet(a.wallet_id).unwrap().balance, Paise::new(100));
    }

    #[tokio::test]
    async fn test_history_pages_and_resumes() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        for amount in 1..=7 {
            wallets.credit(wallet.wallet_id, deposit(amount * 10)).await.unwrap();
        }

        let mut history = wallets
            .history(wallet.wallet_id, HistoryRange::all().with_page_size(3))
            .unwrap();
        let first = history.next_page().unwrap();
        assert_eq!(first.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);

        let cursor = history.cursor();
        assert_eq!(cursor.next_sequence, 4);

        let resumed: Vec<LedgerEntry> = wallets
            .resume_history(cursor, HistoryRange::all().with_page_size(3))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(resumed.len(), 4);
        assert_eq!(resumed[0].sequence, 4);
    }

    #[tokio::test]
    async fn test_archive_flag_leaves_entry_unchanged() {
        let (wallets, _temp) = accounting();
        let wallet = wallets.open_wallet(UserId::new()).await.unwrap();
        let entry = wallets.credit(wallet.wallet_id, deposit(10)).await.unwrap();

        wallets.set_archived(entry.entry_id, true).unwrap();
        assert!(wallets.is_archived(entry.entry_id).unwrap());
        assert_eq!(wallets.entry(entry.entry_id).unwrap(), entry);
        wallets.verify_wallet(wallet.wallet_id).unwrap();
    }
}
