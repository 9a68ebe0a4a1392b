//! Double-entry ledger for operator capital flows
//!
//! Every capital event posts exactly two rows, one debit and one credit of the
//! same amount, linked by a shared `entry_pair_id`. Rows are never changed; a
//! mistaken pair is netted out by a reversing pair with swapped directions.
//!
//! Account balances and the trial balance are computed from the rows alone.

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    storage::{compose_key, tables, Storage, WriteSet},
    types::{Direction, EntryId, PairId, Paise, Reference},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// General-ledger account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Account {
    /// Operator bank balance
    Cash,
    /// Shares bought in bulk and held for allocation
    InventoryExpense,
    /// Amounts owed to investors
    Liabilities,
    /// Earned on share delivery
    Revenue,
    /// Discounts, losses and other costs
    Expenses,
}

impl Account {
    /// Every account
    pub const ALL: [Account; 5] = [
        Account::Cash,
        Account::InventoryExpense,
        Account::Liabilities,
        Account::Revenue,
        Account::Expenses,
    ];

    /// Side on which the account normally carries its balance
    pub fn normal_balance(&self) -> Direction {
        match self {
            Account::Cash | Account::InventoryExpense | Account::Expenses => Direction::Debit,
            Account::Liabilities | Account::Revenue => Direction::Credit,
        }
    }

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Account::Cash => "cash",
            Account::InventoryExpense => "inventory_expense",
            Account::Liabilities => "liabilities",
            Account::Revenue => "revenue",
            Account::Expenses => "expenses",
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a posting pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminLedgerEntry {
    /// Row id
    pub entry_id: EntryId,
    /// Pair this row belongs to
    pub entry_pair_id: PairId,
    /// The other row of the pair
    pub counter_entry_id: EntryId,
    /// Account posted
    pub account: Account,
    /// Debit or credit
    pub direction: Direction,
    /// Amount (always positive)
    pub amount: Paise,
    /// Capital event reference
    pub reference: Reference,
    /// Pair netted out by this one
    pub reverses: Option<PairId>,
    /// Free-form description
    pub description: String,
    /// Recorded at
    pub created_at: DateTime<Utc>,
}

/// Balanced debit/credit pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingPair {
    /// Pair id
    pub pair_id: PairId,
    /// Debit row
    pub debit: AdminLedgerEntry,
    /// Credit row
    pub credit: AdminLedgerEntry,
}

impl PostingPair {
    /// Amount moved
    pub fn amount(&self) -> Paise {
        self.debit.amount
    }
}

/// One side of a proposed posting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    /// Account
    pub account: Account,
    /// Direction
    pub direction: Direction,
    /// Amount
    pub amount: Paise,
}

impl Leg {
    /// Debit leg
    pub fn debit(account: Account, amount: Paise) -> Self {
        Self {
            account,
            direction: Direction::Debit,
            amount,
        }
    }

    /// Credit leg
    pub fn credit(account: Account, amount: Paise) -> Self {
        Self {
            account,
            direction: Direction::Credit,
            amount,
        }
    }
}

/// Operator capital event with a fixed debit/credit account mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapitalEvent {
    /// Operator pays a seller for a bulk lot
    BulkPurchasePayment,
    /// Investor money received
    InvestorPaymentReceipt,
    /// Discount granted through a campaign becomes owed value
    CampaignDiscount,
    /// Wallet funds paid out to a bank account
    WithdrawalPayout,
    /// Deposit refunded to its source
    RefundPayout,
    /// Allocated shares delivered against investor money
    ShareDelivery,
    /// Inventory that can no longer be returned to a lot
    InventoryLoss,
}

impl CapitalEvent {
    /// (debit account, credit account)
    pub fn accounts(&self) -> (Account, Account) {
        match self {
            CapitalEvent::BulkPurchasePayment => (Account::InventoryExpense, Account::Cash),
            CapitalEvent::InvestorPaymentReceipt => (Account::Cash, Account::Liabilities),
            CapitalEvent::CampaignDiscount => (Account::Expenses, Account::Liabilities),
            CapitalEvent::WithdrawalPayout | CapitalEvent::RefundPayout => {
                (Account::Liabilities, Account::Cash)
            }
            CapitalEvent::ShareDelivery => (Account::Liabilities, Account::Revenue),
            CapitalEvent::InventoryLoss => (Account::Expenses, Account::InventoryExpense),
        }
    }

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            CapitalEvent::BulkPurchasePayment => "bulk_purchase_payment",
            CapitalEvent::InvestorPaymentReceipt => "investor_payment_receipt",
            CapitalEvent::CampaignDiscount => "campaign_discount",
            CapitalEvent::WithdrawalPayout => "withdrawal_payout",
            CapitalEvent::RefundPayout => "refund_payout",
            CapitalEvent::ShareDelivery => "share_delivery",
            CapitalEvent::InventoryLoss => "inventory_loss",
        }
    }

    /// The two legs of this event
    pub fn legs(&self, amount: Paise) -> [Leg; 2] {
        let (debit, credit) = self.accounts();
        [Leg::debit(debit, amount), Leg::credit(credit, amount)]
    }
}

/// Debit and credit totals of one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountTotals {
    /// Sum of debit rows
    pub debits: Paise,
    /// Sum of credit rows
    pub credits: Paise,
}

impl AccountTotals {
    /// Balance signed by the account's normal side
    pub fn balance(&self, account: Account) -> Result<Paise> {
        match account.normal_balance() {
            Direction::Debit => self.debits.checked_sub(self.credits),
            Direction::Credit => self.credits.checked_sub(self.debits),
        }
    }

    fn add(&mut self, direction: Direction, amount: Paise) -> Result<()> {
        match direction {
            Direction::Debit => self.debits = self.debits.checked_add(amount)?,
            Direction::Credit => self.credits = self.credits.checked_add(amount)?,
        }
        Ok(())
    }
}

/// Per-account totals over all rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialBalance {
    /// Totals per account
    pub accounts: BTreeMap<Account, AccountTotals>,
    /// Sum of all debits
    pub total_debits: Paise,
    /// Sum of all credits
    pub total_credits: Paise,
}

impl TrialBalance {
    /// Debits equal credits
    pub fn is_balanced(&self) -> bool {
        self.total_debits == self.total_credits
    }
}

fn posting_key(pair_id: &PairId, direction: Direction) -> Vec<u8> {
    let leg = match direction {
        Direction::Debit => 0u8,
        Direction::Credit => 1u8,
    };
    compose_key(&[pair_id.as_bytes(), &[leg]])
}

/// Double-entry ledger
#[derive(Debug)]
pub struct DoubleEntryLedger {
    storage: Arc<Storage>,
    metrics: Metrics,
}

impl DoubleEntryLedger {
    /// Create over a shared store
    pub fn new(storage: Arc<Storage>, metrics: Metrics) -> Self {
        Self { storage, metrics }
    }

    /// Post a capital event
    pub fn post(
        &self,
        event: CapitalEvent,
        amount: Paise,
        reference: Reference,
        description: &str,
    ) -> Result<PostingPair> {
        let mut writes = WriteSet::new();
        let pair = self.stage(&mut writes, event, amount, reference, description)?;
        self.storage.commit(writes)?;
        Ok(pair)
    }

    /// Stage a capital event into a caller's write set
    pub fn stage(
        &self,
        writes: &mut WriteSet,
        event: CapitalEvent,
        amount: Paise,
        reference: Reference,
        description: &str,
    ) -> Result<PostingPair> {
        let description = if description.is_empty() {
            event.as_str().to_string()
        } else {
            format!("{}: {}", event.as_str(), description)
        };
        self.stage_legs(writes, reference, &event.legs(amount), &description, None)
    }

    /// Post explicit legs (exactly one debit and one credit)
    pub fn post_legs(
        &self,
        reference: Reference,
        legs: &[Leg],
        description: &str,
    ) -> Result<PostingPair> {
        let mut writes = WriteSet::new();
        let pair = self.stage_legs(&mut writes, reference, legs, description, None)?;
        self.storage.commit(writes)?;
        Ok(pair)
    }

    fn stage_legs(
        &self,
        writes: &mut WriteSet,
        reference: Reference,
        legs: &[Leg],
        description: &str,
        reverses: Option<PairId>,
    ) -> Result<PostingPair> {
        let (debit_leg, credit_leg) = match legs {
            [a, b] if a.direction == Direction::Debit && b.direction == Direction::Credit => (a, b),
            [a, b] if a.direction == Direction::Credit && b.direction == Direction::Debit => (b, a),
            _ => {
                return Err(self.unbalanced(format!(
                    "{}: expected one debit and one credit leg, got {:?}",
                    reference, legs
                )))
            }
        };

        if !debit_leg.amount.is_positive() || debit_leg.amount != credit_leg.amount {
            return Err(self.unbalanced(format!(
                "{}: debit {} != credit {}",
                reference, debit_leg.amount, credit_leg.amount
            )));
        }
        if debit_leg.account == credit_leg.account {
            return Err(self.unbalanced(format!(
                "{}: both legs post to {}",
                reference, debit_leg.account
            )));
        }

        let pair_id = PairId::new();
        let debit_id = EntryId::new();
        let credit_id = EntryId::new();
        let created_at = Utc::now();

        let row = |entry_id, counter_entry_id, leg: &Leg| AdminLedgerEntry {
            entry_id,
            entry_pair_id: pair_id,
            counter_entry_id,
            account: leg.account,
            direction: leg.direction,
            amount: leg.amount,
            reference,
            reverses,
            description: description.to_string(),
            created_at,
        };
        let debit = row(debit_id, credit_id, debit_leg);
        let credit = row(credit_id, debit_id, credit_leg);

        writes.insert(tables::POSTINGS, posting_key(&pair_id, Direction::Debit), &debit)?;
        writes.insert(tables::POSTINGS, posting_key(&pair_id, Direction::Credit), &credit)?;
        writes.insert(
            tables::POSTINGS_BY_REFERENCE,
            compose_key(&[&reference.key_bytes(), pair_id.as_bytes()]),
            &pair_id,
        )?;

        self.metrics.record_posting();
        tracing::info!(
            pair_id = %pair_id,
            debit = %debit.account,
            credit = %credit.account,
            amount = debit.amount.value(),
            reference = %reference,
            "Posting pair staged"
        );

        Ok(PostingPair {
            pair_id,
            debit,
            credit,
        })
    }

    fn unbalanced(&self, message: String) -> Error {
        let error = Error::UnbalancedEntry(message);
        self.metrics.record_error(&error);
        tracing::error!(error = %error, "Posting rejected");
        error
    }

    /// Post the pair that nets `pair_id` to zero
    pub fn reverse_pair(&self, pair_id: PairId, reason: &str) -> Result<PostingPair> {
        let mut writes = WriteSet::new();
        let pair = self.stage_reversal(&mut writes, pair_id, reason)?;
        self.storage.commit(writes)?;
        Ok(pair)
    }

    /// Stage a reversing pair into a caller's write set
    pub fn stage_reversal(
        &self,
        writes: &mut WriteSet,
        pair_id: PairId,
        reason: &str,
    ) -> Result<PostingPair> {
        let original = self.pair(pair_id)?;
        if self
            .storage
            .contains(tables::POSTING_REVERSALS, pair_id.as_bytes())?
        {
            return Err(Error::AlreadyReversed(format!("posting pair {}", pair_id)));
        }

        let amount = original.amount();
        let legs = [
            Leg::debit(original.credit.account, amount),
            Leg::credit(original.debit.account, amount),
        ];
        let reversal = self.stage_legs(
            writes,
            original.debit.reference,
            &legs,
            &format!("Reversal of {}: {}", pair_id, reason),
            Some(pair_id),
        )?;
        writes.insert(tables::POSTING_REVERSALS, pair_id.as_bytes(), &reversal.pair_id)?;

        Ok(reversal)
    }

    /// Load a pair
    pub fn pair(&self, pair_id: PairId) -> Result<PostingPair> {
        let load = |direction| -> Result<AdminLedgerEntry> {
            self.storage
                .get(tables::POSTINGS, &posting_key(&pair_id, direction))?
                .ok_or_else(|| Error::PostingNotFound(pair_id.to_string()))
        };
        Ok(PostingPair {
            pair_id,
            debit: load(Direction::Debit)?,
            credit: load(Direction::Credit)?,
        })
    }

    /// Pair that reversed `pair_id`, if any
    pub fn reversed_by(&self, pair_id: PairId) -> Result<Option<PairId>> {
        self.storage
            .get(tables::POSTING_REVERSALS, pair_id.as_bytes())
    }

    /// Pairs posted for a reference, in posting order
    pub fn pairs_for_reference(&self, reference: &Reference) -> Result<Vec<PostingPair>> {
        self.storage
            .scan_prefix::<PairId>(tables::POSTINGS_BY_REFERENCE, &reference.key_bytes())?
            .into_iter()
            .map(|(_, pair_id)| self.pair(pair_id))
            .collect()
    }

    /// Totals per account over every row
    pub fn trial_balance(&self) -> Result<TrialBalance> {
        let mut trial = TrialBalance::default();
        for account in Account::ALL {
            trial.accounts.insert(account, AccountTotals::default());
        }

        for (_, row) in self.storage.scan_all::<AdminLedgerEntry>(tables::POSTINGS)? {
            trial
                .accounts
                .entry(row.account)
                .or_default()
                .add(row.direction, row.amount)?;
            match row.direction {
                Direction::Debit => trial.total_debits = trial.total_debits.checked_add(row.amount)?,
                Direction::Credit => {
                    trial.total_credits = trial.total_credits.checked_add(row.amount)?
                }
            }
        }

        Ok(trial)
    }

    /// Balance of one account, signed by its normal side
    pub fn account_balance(&self, account: Account) -> Result<Paise> {
        let trial = self.trial_balance()?;
        trial
            .accounts
            .get(&account)
            .copied()
            .unwrap_or_default()
            .balance(account)
    }

    /// Debits equal credits for `reference`
    pub fn verify_reference(&self, reference: &Reference) -> Result<()> {
        let mut totals = AccountTotals::default();
        for pair in self.pairs_for_reference(reference)? {
            totals.add(pair.debit.direction, pair.debit.amount)?;
            totals.add(pair.credit.direction, pair.credit.amount)?;
        }

        if totals.debits != totals.credits {
            return Err(self.unbalanced(format!(
                "{}: debits {} != credits {}",
                reference, totals.debits, totals.credits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BulkPurchaseId, PaymentId};
    use crate::Config;
    use tempfile::TempDir;

    fn ledger() -> (DoubleEntryLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let storage = Arc::new(Storage::open(&config, &[]).unwrap());
        (DoubleEntryLedger::new(storage, Metrics::new().unwrap()), temp_dir)
    }

    #[test]
    fn test_post_capital_event() {
        let (ledger, _temp) = ledger();
        let reference = Reference::BulkPurchase(BulkPurchaseId::new());

        let pair = ledger
            .post(CapitalEvent::BulkPurchasePayment, Paise::new(100_000), reference, "lot 1")
            .unwrap();

        assert_eq!(pair.debit.account, Account::InventoryExpense);
        assert_eq!(pair.credit.account, Account::Cash);
        assert_eq!(pair.debit.counter_entry_id, pair.credit.entry_id);
        assert_eq!(pair.credit.counter_entry_id, pair.debit.entry_id);
        assert_eq!(ledger.pair(pair.pair_id).unwrap(), pair);

        assert_eq!(
            ledger.account_balance(Account::InventoryExpense).unwrap(),
            Paise::new(100_000)
        );
        assert_eq!(ledger.account_balance(Account::Cash).unwrap(), Paise::new(-100_000));
        assert!(ledger.trial_balance().unwrap().is_balanced());
        ledger.verify_reference(&reference).unwrap();
    }

    #[test]
    fn test_post_legs_rejects_unbalanced() {
        let (ledger, _temp) = ledger();
        let reference = Reference::Payment(PaymentId::new());

        let mismatched = [
            Leg::debit(Account::Cash, Paise::new(100)),
            Leg::credit(Account::Liabilities, Paise::new(99)),
        ];
        assert!(matches!(
            ledger.post_legs(reference, &mismatched, ""),
            Err(Error::UnbalancedEntry(_))
        ));

        let two_debits = [
            Leg::debit(Account::Cash, Paise::new(100)),
            Leg::debit(Account::Expenses, Paise::new(100)),
        ];
        assert!(matches!(
            ledger.post_legs(reference, &two_debits, ""),
            Err(Error::UnbalancedEntry(_))
        ));

        let same_account = [
            Leg::debit(Account::Cash, Paise::new(100)),
            Leg::credit(Account::Cash, Paise::new(100)),
        ];
        assert!(matches!(
            ledger.post_legs(reference, &same_account, ""),
            Err(Error::UnbalancedEntry(_))
        ));

        let zero = CapitalEvent::InvestorPaymentReceipt.legs(Paise::ZERO);
        assert!(matches!(
            ledger.post_legs(reference, &zero, ""),
            Err(Error::UnbalancedEntry(_))
        ));

        assert!(ledger.pairs_for_reference(&reference).unwrap().is_empty());
    }

    #[test]
    fn test_reverse_pair_nets_to_zero_once() {
        let (ledger, _temp) = ledger();
        let reference = Reference::Payment(PaymentId::new());

        let pair = ledger
            .post(CapitalEvent::InvestorPaymentReceipt, Paise::new(5_000), reference, "")
            .unwrap();
        let reversal = ledger.reverse_pair(pair.pair_id, "payment failed").unwrap();

        assert_eq!(reversal.debit.account, Account::Liabilities);
        assert_eq!(reversal.credit.account, Account::Cash);
        assert_eq!(reversal.debit.reverses, Some(pair.pair_id));
        assert_eq!(ledger.reversed_by(pair.pair_id).unwrap(), Some(reversal.pair_id));

        assert_eq!(ledger.account_balance(Account::Cash).unwrap(), Paise::ZERO);
        assert_eq!(ledger.account_balance(Account::Liabilities).unwrap(), Paise::ZERO);
        ledger.verify_reference(&reference).unwrap();

        assert!(matches!(
            ledger.reverse_pair(pair.pair_id, "again"),
            Err(Error::AlreadyReversed(_))
        ));
    }

    #[test]
    fn test_event_account_mapping() {
        assert_eq!(
            CapitalEvent::ShareDelivery.accounts(),
            (Account::Liabilities, Account::Revenue)
        );
        assert_eq!(
            CapitalEvent::InventoryLoss.accounts(),
            (Account::Expenses, Account::InventoryExpense)
        );
        assert_eq!(
            CapitalEvent::CampaignDiscount.accounts(),
            (Account::Expenses, Account::Liabilities)
        );
    }
}
