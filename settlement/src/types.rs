//! Core types for settlement

use chrono::{DateTime, Utc};
use ledger_core::{
    AllocationId, BulkPurchaseId, EntryId, EntryKind, LedgerEntry, LockId, PairId, Paise,
    PaymentId, ProductId, ReceivableId, Reference, Referenced, UserId, WalletId, WithdrawalId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Deterministic child id of `parent` (UUIDv5), stable across replays
pub fn derived_id(parent: Uuid, label: &str) -> Uuid {
    Uuid::new_v5(&parent, label.as_bytes())
}

/// Inventory lot bought in bulk by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPurchase {
    /// Lot id
    pub bulk_purchase_id: BulkPurchaseId,
    /// Product (company share class)
    pub product_id: ProductId,
    /// Face value bought
    pub face_value_purchased: Paise,
    /// Value received into inventory (allocatable)
    pub total_value_received: Paise,
    /// Value not yet allocated
    pub value_remaining: Paise,
    /// Cash paid to the seller
    pub actual_cost_paid: Paise,
    /// Seller name
    pub seller: String,
    /// FIFO ordering key
    pub created_at: DateTime<Utc>,
    /// Double-entry pair of the purchase payment
    pub payment_pair: Option<PairId>,
}

impl Referenced for BulkPurchase {
    fn reference(&self) -> Reference {
        Reference::BulkPurchase(self.bulk_purchase_id)
    }
}

/// Operator request to record a lot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLot {
    /// Product
    pub product_id: ProductId,
    /// Face value bought
    pub face_value_purchased: Paise,
    /// Value received into inventory
    pub total_value_received: Paise,
    /// Cash paid
    pub actual_cost_paid: Paise,
    /// Seller name
    pub seller: String,
    /// Purchase time; defaults to now
    pub received_at: Option<DateTime<Utc>>,
}

impl NewLot {
    /// Lot whose face value, received value and cost are all `value`
    pub fn new(product_id: ProductId, value: Paise) -> Self {
        Self {
            product_id,
            face_value_purchased: value,
            total_value_received: value,
            actual_cost_paid: value,
            seller: String::new(),
            received_at: None,
        }
    }

    /// Set cash paid
    pub fn with_cost(mut self, actual_cost_paid: Paise) -> Self {
        self.actual_cost_paid = actual_cost_paid;
        self
    }

    /// Set seller
    pub fn with_seller(mut self, seller: impl Into<String>) -> Self {
        self.seller = seller.into();
        self
    }

    /// Set purchase time
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }
}

/// Allocation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    /// Inventory held by the investor
    Active,
    /// Inventory returned (or written off)
    Reversed,
}

/// Investor-facing allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation id
    pub allocation_id: AllocationId,
    /// Product
    pub product_id: ProductId,
    /// Investor
    pub user_id: UserId,
    /// Value allocated
    pub value: Paise,
    /// What the allocation was made for
    pub reference: Option<Reference>,
    /// Status
    pub status: AllocationStatus,
    /// Idempotency key of the request
    pub idempotency_key: Option<String>,
    /// Allocated at
    pub created_at: DateTime<Utc>,
}

impl Referenced for Allocation {
    fn reference(&self) -> Reference {
        Reference::Allocation(self.allocation_id)
    }
}

/// Traceability row: value taken from one lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSource {
    /// Allocation
    pub allocation_id: AllocationId,
    /// Source lot
    pub bulk_purchase_id: BulkPurchaseId,
    /// Value taken
    pub value_taken: Paise,
    /// Position in FIFO order (0-based)
    pub position: u32,
}

/// Allocation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Product
    pub product_id: ProductId,
    /// Investor
    pub user_id: UserId,
    /// Value requested
    pub value: Paise,
    /// What the allocation is for
    pub reference: Option<Reference>,
    /// Repeating a key returns the original allocation
    pub idempotency_key: Option<String>,
}

impl AllocationRequest {
    /// New request without idempotency key
    pub fn new(product_id: ProductId, user_id: UserId, value: Paise) -> Self {
        Self {
            product_id,
            user_id,
            value,
            reference: None,
            idempotency_key: None,
        }
    }

    /// Set idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set reference
    pub fn for_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Allocation with its source lots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResult {
    /// Allocation
    pub allocation: Allocation,
    /// Lots consumed, oldest first
    pub sources: Vec<AllocationSource>,
    /// Returned from an earlier request with the same idempotency key
    pub replayed: bool,
}

/// Why an allocation is being undone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeallocationMode {
    /// Saga compensation: value always goes back to its lots
    Compensation,
    /// Chargeback/refund: exhausted lots record the value as a loss
    Reversal,
}

/// Value returned to, or lost from, one lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeallocationLine {
    /// Lot
    pub bulk_purchase_id: BulkPurchaseId,
    /// Value
    pub value: Paise,
    /// Returned to the lot (false = recorded as loss)
    pub returned: bool,
}

/// Append-only record of an undone allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deallocation {
    /// Allocation undone
    pub allocation_id: AllocationId,
    /// Mode
    pub mode: DeallocationMode,
    /// Per-lot outcome
    pub lines: Vec<DeallocationLine>,
    /// Total value returned to lots
    pub returned: Paise,
    /// Total value recorded as inventory loss
    pub loss: Paise,
    /// Double-entry pair of the loss
    pub loss_pair: Option<PairId>,
    /// Reason
    pub reason: String,
    /// Recorded at
    pub created_at: DateTime<Utc>,
}

/// Origin of a reversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReversalSource {
    /// Operator-initiated refund to the payment source
    Refund,
    /// Card/bank chargeback
    Chargeback,
}

impl ReversalSource {
    /// Wallet entry kind of the reversal debit
    pub fn entry_kind(&self) -> EntryKind {
        match self {
            ReversalSource::Refund => EntryKind::Refund,
            ReversalSource::Chargeback => EntryKind::Chargeback,
        }
    }
}

impl fmt::Display for ReversalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReversalSource::Refund => f.write_str("refund"),
            ReversalSource::Chargeback => f.write_str("chargeback"),
        }
    }
}

/// Receivable status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceivableStatus {
    /// Nothing recovered yet
    Pending,
    /// Partially recovered
    Partial,
    /// Fully recovered
    Settled,
    /// Abandoned by an administrator
    WrittenOff,
}

impl ReceivableStatus {
    /// Still owed
    pub fn is_open(&self) -> bool {
        matches!(self, ReceivableStatus::Pending | ReceivableStatus::Partial)
    }
}

/// Shortfall of a reversal that the wallet could not cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargebackReceivable {
    /// Receivable id
    pub receivable_id: ReceivableId,
    /// Debtor
    pub user_id: UserId,
    /// Wallet in recovery mode
    pub wallet_id: WalletId,
    /// Payment that was reversed
    pub payment_id: Option<PaymentId>,
    /// Entry that was reversed
    pub original_entry: EntryId,
    /// Amount owed
    pub amount: Paise,
    /// Amount recovered so far
    pub paid: Paise,
    /// Status
    pub status: ReceivableStatus,
    /// Refund or chargeback
    pub source_type: ReversalSource,
    /// Reason
    pub reason: String,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Fully recovered at
    pub settled_at: Option<DateTime<Utc>>,
    /// Administrator who wrote it off
    pub written_off_by: Option<String>,
    /// Write-off reason
    pub write_off_reason: Option<String>,
}

impl ChargebackReceivable {
    /// Outstanding balance (amount - paid)
    pub fn balance(&self) -> Paise {
        Paise::new(self.amount.value() - self.paid.value())
    }
}

impl Referenced for ChargebackReceivable {
    fn reference(&self) -> Reference {
        Reference::Receivable(self.receivable_id)
    }
}

/// Result of a reversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversalOutcome {
    /// Debit of what the wallet could cover
    pub debit: Option<LedgerEntry>,
    /// Receivable for the shortfall
    pub receivable: Option<ChargebackReceivable>,
    /// Refund payout posting
    pub payout_pair: PairId,
}

/// Deposit credited and applied to open receivables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositOutcome {
    /// Deposit credit
    pub deposit: LedgerEntry,
    /// Recovery debits, per receivable
    pub recoveries: Vec<(ReceivableId, LedgerEntry)>,
    /// Returned from an earlier posting with the same transaction id
    pub replayed: bool,
}

/// Bank account for payouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    /// Account holder
    pub account_holder: String,
    /// Account number
    pub account_number: String,
    /// IFSC code
    pub ifsc: String,
}

/// Withdrawal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    /// Funds locked, awaiting payout
    Pending,
    /// Paid out
    Completed,
    /// Refused by an operator
    Rejected,
    /// Withdrawn by the user
    Cancelled,
    /// Lock expired before payout
    Expired,
    /// Payout was compensated
    Failed,
}

/// Withdrawal request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Withdrawal id
    pub withdrawal_id: WithdrawalId,
    /// Requesting user
    pub user_id: UserId,
    /// Wallet debited
    pub wallet_id: WalletId,
    /// Amount
    pub amount: Paise,
    /// Destination
    pub bank_details: BankDetails,
    /// Caller's idempotency key
    pub idempotency_key: String,
    /// Fund lock holding the amount
    pub lock_id: LockId,
    /// Status
    pub status: WithdrawalStatus,
    /// Bank payout reference
    pub payout_reference: Option<String>,
    /// Wallet debit written on payout
    pub entry_id: Option<EntryId>,
    /// Payout posting pair
    pub payout_pair: Option<PairId>,
    /// Rejection/cancellation/failure note
    pub note: Option<String>,
    /// Requested at
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Referenced for Withdrawal {
    fn reference(&self) -> Reference {
        Reference::Withdrawal(self.withdrawal_id)
    }
}

/// What an incoming payment pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentPurpose {
    /// Wallet top-up only
    WalletTopUp,
    /// Top-up immediately spent on shares of `product_id`
    SharePurchase {
        /// Product bought
        product_id: ProductId,
    },
}

/// Confirmed investor payment to settle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Payment id (deduplication key)
    pub payment_id: PaymentId,
    /// Paying user
    pub user_id: UserId,
    /// Amount received
    pub amount: Paise,
    /// Purpose
    pub purpose: PaymentPurpose,
    /// Promotional bonus earned by the payment
    pub bonus: Option<Paise>,
}

impl PaymentRequest {
    /// Top-up request
    pub fn top_up(user_id: UserId, amount: Paise) -> Self {
        Self {
            payment_id: PaymentId::new(),
            user_id,
            amount,
            purpose: PaymentPurpose::WalletTopUp,
            bonus: None,
        }
    }

    /// Share purchase request
    pub fn share_purchase(user_id: UserId, amount: Paise, product_id: ProductId) -> Self {
        Self {
            payment_id: PaymentId::new(),
            user_id,
            amount,
            purpose: PaymentPurpose::SharePurchase { product_id },
            bonus: None,
        }
    }

    /// Attach a bonus
    pub fn with_bonus(mut self, bonus: Paise) -> Self {
        self.bonus = Some(bonus);
        self
    }
}

/// Referral bonus paid to two users at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferralBonus {
    /// Bonus id (deduplication key)
    pub bonus_id: ledger_core::BonusId,
    /// Referring user
    pub referrer: UserId,
    /// Referrer's bonus
    pub referrer_amount: Paise,
    /// Referred user
    pub referee: UserId,
    /// Referee's bonus
    pub referee_amount: Paise,
}

/// Result of an invariant sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvariantReport {
    /// Wallets whose entry chain was replayed
    pub wallets_verified: usize,
    /// Entries replayed
    pub entries_verified: u64,
    /// Lots checked
    pub lots_verified: usize,
    /// Trial balance debits == credits
    pub trial_balance_ok: bool,
    /// Violations found
    pub violations: Vec<String>,
}

impl InvariantReport {
    /// No violations
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.trial_balance_ok
    }
}
