//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (integer paise for money, never floats)

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Amount of money in paise (1/100 rupee)
///
/// The only monetary representation in the core. Rupee values only appear at
/// the boundary through [`Paise::from_rupees`] and [`Paise::to_rupees`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Paise(i64);

impl Paise {
    /// Zero paise
    pub const ZERO: Paise = Paise(0);

    /// Create from a raw paise count
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw paise count
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Strictly greater than zero
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Exactly zero
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Strictly less than zero
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Reject zero and negative amounts
    pub fn ensure_positive(self) -> Result<Self> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(Error::InvalidAmount(format!(
                "amount must be positive, got {} paise",
                self.0
            )))
        }
    }

    /// Overflow-checked addition
    pub fn checked_add(self, other: Paise) -> Result<Paise> {
        self.0
            .checked_add(other.0)
            .map(Paise)
            .ok_or_else(|| Error::InvariantViolation(format!("overflow adding {} + {}", self, other)))
    }

    /// Overflow-checked subtraction
    pub fn checked_sub(self, other: Paise) -> Result<Paise> {
        self.0
            .checked_sub(other.0)
            .map(Paise)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("overflow subtracting {} - {}", self, other))
            })
    }

    /// Overflow-checked sum
    pub fn sum<I: IntoIterator<Item = Paise>>(amounts: I) -> Result<Paise> {
        amounts
            .into_iter()
            .try_fold(Paise::ZERO, |acc, amount| acc.checked_add(amount))
    }

    /// Convert a rupee amount, rejecting fractional paise
    pub fn from_rupees(rupees: Decimal) -> Result<Self> {
        let scaled = rupees
            .checked_mul(Decimal::from(100))
            .ok_or_else(|| Error::InvalidAmount(format!("{} rupees out of range", rupees)))?;

        if !scaled.fract().is_zero() {
            return Err(Error::InvalidAmount(format!(
                "{} rupees is not a whole number of paise",
                rupees
            )));
        }

        scaled
            .to_i64()
            .map(Paise)
            .ok_or_else(|| Error::InvalidAmount(format!("{} rupees out of range", rupees)))
    }

    /// Convert to rupees (exact, two decimal places)
    pub fn to_rupees(self) -> Decimal {
        Decimal::new(self.0, 2)
    }
}

impl fmt::Display for Paise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INR {}", self.to_rupees())
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered id (UUIDv7)
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Key bytes for storage
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Platform user
    UserId
);
define_id!(
    /// User wallet
    WalletId
);
define_id!(
    /// Wallet ledger entry
    EntryId
);
define_id!(
    /// Fund lock (reservation)
    LockId
);
define_id!(
    /// Incoming investor payment
    PaymentId
);
define_id!(
    /// Withdrawal request
    WithdrawalId
);
define_id!(
    /// Bonus grant
    BonusId
);
define_id!(
    /// Campaign (discount/referral) usage
    CampaignUsageId
);
define_id!(
    /// Bulk purchase (inventory lot)
    BulkPurchaseId
);
define_id!(
    /// Investor-facing share allocation
    AllocationId
);
define_id!(
    /// Pre-IPO product (company share class)
    ProductId
);
define_id!(
    /// Chargeback/refund receivable
    ReceivableId
);
define_id!(
    /// Saga execution
    SagaId
);
define_id!(
    /// Double-entry posting pair
    PairId
);

/// What a balance-affecting row refers to
///
/// Replaces stringly-typed `reference_type` / `reference_id` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reference {
    /// Investor payment
    Payment(PaymentId),
    /// Withdrawal request
    Withdrawal(WithdrawalId),
    /// Bonus grant
    Bonus(BonusId),
    /// Campaign usage (discount, referral)
    CampaignUsage(CampaignUsageId),
    /// Operator bulk purchase
    BulkPurchase(BulkPurchaseId),
    /// Share allocation
    Allocation(AllocationId),
    /// Chargeback receivable
    Receivable(ReceivableId),
    /// Saga execution
    Saga(SagaId),
    /// Manual adjustment
    Adjustment(Uuid),
}

impl Reference {
    /// Stable kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Reference::Payment(_) => "payment",
            Reference::Withdrawal(_) => "withdrawal",
            Reference::Bonus(_) => "bonus",
            Reference::CampaignUsage(_) => "campaign_usage",
            Reference::BulkPurchase(_) => "bulk_purchase",
            Reference::Allocation(_) => "allocation",
            Reference::Receivable(_) => "receivable",
            Reference::Saga(_) => "saga",
            Reference::Adjustment(_) => "adjustment",
        }
    }

    /// Referenced id
    pub fn id(&self) -> Uuid {
        match self {
            Reference::Payment(id) => id.as_uuid(),
            Reference::Withdrawal(id) => id.as_uuid(),
            Reference::Bonus(id) => id.as_uuid(),
            Reference::CampaignUsage(id) => id.as_uuid(),
            Reference::BulkPurchase(id) => id.as_uuid(),
            Reference::Allocation(id) => id.as_uuid(),
            Reference::Receivable(id) => id.as_uuid(),
            Reference::Saga(id) => id.as_uuid(),
            Reference::Adjustment(id) => *id,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Reference::Payment(_) => 1,
            Reference::Withdrawal(_) => 2,
            Reference::Bonus(_) => 3,
            Reference::CampaignUsage(_) => 4,
            Reference::BulkPurchase(_) => 5,
            Reference::Allocation(_) => 6,
            Reference::Receivable(_) => 7,
            Reference::Saga(_) => 8,
            Reference::Adjustment(_) => 9,
        }
    }

    /// Index key prefix: tag || id
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.push(self.tag());
        key.extend_from_slice(self.id().as_bytes());
        key
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Capability of a record that can be the target of a ledger row
pub trait Referenced {
    /// Typed reference to this record
    fn reference(&self) -> Reference;
}

/// Debit or credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Debit
    Debit,
    /// Credit
    Credit,
}

impl Direction {
    /// Opposite direction
    pub fn opposite(self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wallet entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Funds deposited by the user (credit)
    Deposit,
    /// Promotional or referral bonus (credit)
    BonusCredit,
    /// Refund of an investment back to the wallet (credit)
    RefundCredit,
    /// Value returned when an allocation is reversed (credit)
    AllocationReversalCredit,
    /// Counter-entry of an earlier debit (credit)
    ReversalCredit,
    /// Operator adjustment (credit)
    AdminCredit,
    /// Payout to the user's bank (debit)
    Withdrawal,
    /// Payment for allocated shares (debit)
    SharePurchase,
    /// Card/bank chargeback of an earlier deposit (debit)
    Chargeback,
    /// Refund of an earlier deposit to its source (debit)
    Refund,
    /// Deposit applied to an open receivable (debit)
    ReceivableRecovery,
    /// Counter-entry of an earlier credit (debit)
    ReversalDebit,
    /// Operator adjustment (debit)
    AdminDebit,
}

impl EntryKind {
    /// Effect on the wallet balance
    pub fn direction(&self) -> Direction {
        match self {
            EntryKind::Deposit
            | EntryKind::BonusCredit
            | EntryKind::RefundCredit
            | EntryKind::AllocationReversalCredit
            | EntryKind::ReversalCredit
            | EntryKind::AdminCredit => Direction::Credit,
            EntryKind::Withdrawal
            | EntryKind::SharePurchase
            | EntryKind::Chargeback
            | EntryKind::Refund
            | EntryKind::ReceivableRecovery
            | EntryKind::ReversalDebit
            | EntryKind::AdminDebit => Direction::Debit,
        }
    }

    /// Credit kind
    pub fn is_credit(&self) -> bool {
        self.direction() == Direction::Credit
    }

    /// Whether the kind may be posted while the wallet is in recovery mode
    ///
    /// Recovery mode blocks withdrawals, share purchases and bonus accrual.
    /// Counter-entries and receivable recovery stay allowed.
    pub fn allowed_in_recovery(&self) -> bool {
        !matches!(
            self,
            EntryKind::BonusCredit
                | EntryKind::Withdrawal
                | EntryKind::SharePurchase
                | EntryKind::AdminDebit
        )
    }

    /// Kind of the counter-entry that nets this one to zero
    pub fn counter_kind(&self) -> EntryKind {
        if self.is_credit() {
            EntryKind::ReversalDebit
        } else {
            EntryKind::ReversalCredit
        }
    }

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::BonusCredit => "bonus_credit",
            EntryKind::RefundCredit => "refund_credit",
            EntryKind::AllocationReversalCredit => "allocation_reversal_credit",
            EntryKind::ReversalCredit => "reversal_credit",
            EntryKind::AdminCredit => "admin_credit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::SharePurchase => "share_purchase",
            EntryKind::Chargeback => "chargeback",
            EntryKind::Refund => "refund",
            EntryKind::ReceivableRecovery => "receivable_recovery",
            EntryKind::ReversalDebit => "reversal_debit",
            EntryKind::AdminDebit => "admin_debit",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a wallet balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id
    pub entry_id: EntryId,

    /// Stable correlation id, usable as an external receipt reference
    pub transaction_id: Uuid,

    /// Wallet this entry belongs to
    pub wallet_id: WalletId,

    /// Per-wallet sequence number, gap-free from 1
    pub sequence: u64,

    /// Credit or debit kind
    pub kind: EntryKind,

    /// Amount moved (always positive)
    pub amount: Paise,

    /// Book balance before this entry
    pub balance_before: Paise,

    /// Book balance after this entry
    pub balance_after: Paise,

    /// What caused the change
    pub reference: Reference,

    /// Original entry this one counters, if it is a reversal
    pub paired_entry: Option<EntryId>,

    /// Free-form description
    pub description: String,

    /// Recorded at
    pub created_at: DateTime<Utc>,

    /// Hash of the previous entry in this wallet (zeros for the first)
    pub prev_hash: [u8; 32],

    /// Hash of this entry's recorded fact
    pub hash: [u8; 32],
}

impl LedgerEntry {
    /// Check `after = before ± amount` for the entry's direction
    pub fn is_arithmetically_consistent(&self) -> bool {
        let expected = match self.kind.direction() {
            Direction::Credit => self.balance_before.value().checked_add(self.amount.value()),
            Direction::Debit => self.balance_before.value().checked_sub(self.amount.value()),
        };
        self.amount.is_positive() && expected == Some(self.balance_after.value())
    }

    /// Compute the hash over every recorded field except `hash` itself
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.entry_id.as_bytes());
        hasher.update(self.transaction_id.as_bytes());
        hasher.update(self.wallet_id.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.amount.value().to_be_bytes());
        hasher.update(self.balance_before.value().to_be_bytes());
        hasher.update(self.balance_after.value().to_be_bytes());
        hasher.update(self.reference.key_bytes());
        match self.paired_entry {
            Some(paired) => hasher.update(paired.as_bytes()),
            None => hasher.update([0u8; 16]),
        }
        hasher.update(self.description.as_bytes());
        hasher.update(self.created_at.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        hasher.update(self.prev_hash);

        hasher.finalize().into()
    }
}

/// User wallet
///
/// `balance` is the book balance and always equals the `balance_after` of the
/// newest entry. Locked funds stay in `balance`; spendable funds are
/// `balance - locked_balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet id
    pub wallet_id: WalletId,

    /// Owner
    pub user_id: UserId,

    /// Book balance
    pub balance: Paise,

    /// Reserved for pending withdrawals
    pub locked_balance: Paise,

    /// Outstanding chargeback/refund receivables
    pub receivable_balance: Paise,

    /// Outbound movement blocked while a receivable is open
    pub recovery_mode: bool,

    /// Sequence of the newest entry (0 when empty)
    pub last_sequence: u64,

    /// Hash of the newest entry (zeros when empty)
    pub last_hash: [u8; 32],

    /// Created at
    pub created_at: DateTime<Utc>,

    /// Last modified
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Create an empty wallet
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            wallet_id: WalletId::new(),
            user_id,
            balance: Paise::ZERO,
            locked_balance: Paise::ZERO,
            receivable_balance: Paise::ZERO,
            recovery_mode: false,
            last_sequence: 0,
            last_hash: [0u8; 32],
            created_at: now,
            updated_at: now,
        }
    }

    /// Funds available for debits and new locks
    pub fn spendable(&self) -> Paise {
        Paise::new(self.balance.value() - self.locked_balance.value())
    }

    /// Row-level invariants
    pub fn check_invariants(&self) -> Result<()> {
        if self.balance.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "wallet {} balance negative: {}",
                self.wallet_id, self.balance
            )));
        }
        if self.locked_balance.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "wallet {} locked balance negative: {}",
                self.wallet_id, self.locked_balance
            )));
        }
        if self.locked_balance > self.balance {
            return Err(Error::InvariantViolation(format!(
                "wallet {} locked {} exceeds balance {}",
                self.wallet_id, self.locked_balance, self.balance
            )));
        }
        if self.receivable_balance.is_negative() {
            return Err(Error::InvariantViolation(format!(
                "wallet {} receivable balance negative",
                self.wallet_id
            )));
        }
        Ok(())
    }
}

/// Read-only balance snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Wallet id
    pub wallet_id: WalletId,
    /// Spendable funds
    pub spendable: Paise,
    /// Reserved funds
    pub locked: Paise,
    /// Recovery mode flag
    pub recovery_mode: bool,
    /// Outstanding receivables
    pub receivable: Paise,
}

impl From<&Wallet> for BalanceView {
    fn from(wallet: &Wallet) -> Self {
        Self {
            wallet_id: wallet.wallet_id,
            spendable: wallet.spendable(),
            locked: wallet.locked_balance,
            recovery_mode: wallet.recovery_mode,
            receivable: wallet.receivable_balance,
        }
    }
}

/// Fund lock status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Funds reserved
    Active,
    /// Returned to spendable
    Released,
    /// Finalized into a debit
    Consumed,
    /// Returned to spendable after its TTL
    Expired,
}

/// Reservation of wallet funds without a balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundLock {
    /// Lock id
    pub lock_id: LockId,
    /// Wallet holding the funds
    pub wallet_id: WalletId,
    /// Record the funds are reserved for
    pub lockable: Reference,
    /// Reserved amount
    pub amount: Paise,
    /// Why the funds are reserved
    pub reason: String,
    /// Current status
    pub status: LockStatus,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Automatic expiry, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// Released/consumed/expired at
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Referenced for FundLock {
    fn reference(&self) -> Reference {
        self.lockable
    }
}

/// Append-only link from an entry to the row that countered it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReversal {
    /// Entry that was countered
    pub original_entry: EntryId,
    /// Counter-entry, absent when nothing could be debited
    pub reversing_entry: Option<EntryId>,
    /// Receivable holding the uncollected part
    pub receivable_id: Option<ReceivableId>,
    /// Why the entry was countered
    pub reason: String,
    /// Recorded at
    pub created_at: DateTime<Utc>,
}

/// Parameters of a single credit or debit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingRequest {
    /// Amount to move
    pub amount: Paise,
    /// Entry kind (determines direction)
    pub kind: EntryKind,
    /// What caused the change
    pub reference: Reference,
    /// Free-form description
    pub description: String,
    /// Idempotency/correlation id; reposting it returns the prior entry
    pub transaction_id: Uuid,
    /// Entry being countered, for reversals
    pub paired_entry: Option<EntryId>,
}

impl PostingRequest {
    /// New request with a fresh transaction id
    pub fn new(amount: Paise, kind: EntryKind, reference: Reference) -> Self {
        Self {
            amount,
            kind,
            reference,
            description: String::new(),
            transaction_id: Uuid::now_v7(),
            paired_entry: None,
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a caller-chosen transaction id
    pub fn with_transaction_id(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Mark as counter-entry of `entry`
    pub fn pairing(mut self, entry: EntryId) -> Self {
        self.paired_entry = Some(entry);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paise_rupee_conversion() {
        assert_eq!(
            Paise::from_rupees(Decimal::new(12345, 2)).unwrap(),
            Paise::new(12345)
        );
        assert_eq!(Paise::new(150).to_rupees(), Decimal::new(150, 2));
        assert!(Paise::from_rupees(Decimal::new(1001, 3)).is_err());
    }

    #[test]
    fn test_paise_checked_arithmetic() {
        assert_eq!(
            Paise::new(100).checked_sub(Paise::new(30)).unwrap(),
            Paise::new(70)
        );
        assert!(Paise::new(i64::MAX).checked_add(Paise::new(1)).is_err());
        assert!(Paise::ZERO.ensure_positive().is_err());
        assert_eq!(
            Paise::sum([Paise::new(1), Paise::new(2), Paise::new(3)]).unwrap(),
            Paise::new(6)
        );
    }

    #[test]
    fn test_entry_kind_directions() {
        assert!(EntryKind::Deposit.is_credit());
        assert!(!EntryKind::Chargeback.is_credit());
        assert_eq!(EntryKind::Deposit.counter_kind(), EntryKind::ReversalDebit);
        assert_eq!(EntryKind::SharePurchase.counter_kind(), EntryKind::ReversalCredit);
        assert!(!EntryKind::Withdrawal.allowed_in_recovery());
        assert!(!EntryKind::BonusCredit.allowed_in_recovery());
        assert!(EntryKind::Deposit.allowed_in_recovery());
        assert!(EntryKind::ReceivableRecovery.allowed_in_recovery());
    }

    #[test]
    fn test_reference_key_bytes_distinguish_kinds() {
        let id = Uuid::now_v7();
        let payment = Reference::Payment(PaymentId::from_uuid(id));
        let bonus = Reference::Bonus(BonusId::from_uuid(id));
        assert_ne!(payment.key_bytes(), bonus.key_bytes());
        assert_eq!(payment.id(), bonus.id());
        assert_eq!(payment.to_string(), format!("payment:{}", id));
    }

    #[test]
    fn test_wallet_spendable_and_invariants() {
        let mut wallet = Wallet::new(UserId::new());
        wallet.balance = Paise::new(1000);
        wallet.locked_balance = Paise::new(400);
        assert_eq!(wallet.spendable(), Paise::new(600));
        assert!(wallet.check_invariants().is_ok());

        wallet.locked_balance = Paise::new(1200);
        assert!(wallet.check_invariants().is_err());
    }
}
