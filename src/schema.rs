//! Domain model shared by the scorer, the orchestrator and the store boundary.
//!
//! Documents and transactions arrive from extraction services with loose,
//! optional fields; they are normalized into these required shapes once at
//! ingestion so the scoring path never has to re-apply fallbacks.

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[schemars(description = "Money the business owes: matched against outgoing (debit) transactions")]
    Bill,
    #[schemars(description = "Money owed to the business: matched against incoming (credit) transactions")]
    Invoice,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bill => "bill",
            Self::Invoice => "invoice",
        }
    }

    /// The transaction direction a document of this type is expected to pair with.
    pub fn expected_direction(&self) -> Direction {
        match self {
            Self::Bill => Direction::Debit,
            Self::Invoice => Direction::Credit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[schemars(description = "Money out of the bank account")]
    Debit,
    #[schemars(description = "Money into the bank account")]
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
    Overpaid,
}

impl PaymentStatus {
    /// Derive the status from the remaining balance against the total.
    /// Remaining within a cent of zero counts as paid; more than a cent
    /// negative is an overpayment (storage clamps the balance to zero).
    pub fn from_remaining(remaining: f64, total: f64) -> Self {
        if remaining < -0.01 {
            Self::Overpaid
        } else if remaining <= 0.01 {
            Self::Paid
        } else if remaining < total - 0.01 {
            Self::Partial
        } else {
            Self::Unpaid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Unmatched,
    Suggested,
    Matched,
    Categorized,
}

/// A bill or invoice with payments applied against it.
///
/// Invariant: `amount_remaining` stays in `[0, total]` except transiently
/// during an overpayment, where it may dip below zero before storage clamps
/// it back to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub doc_type: DocumentType,
    pub document_number: String,
    pub counterparty_name: String,
    pub document_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub total: f64,
    pub amount_paid: f64,
    pub amount_remaining: f64,
    pub currency: String,
    pub payment_status: PaymentStatus,
}

/// One bank ledger line. `amount` is the absolute magnitude; the sign lives
/// in `direction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub owner_id: String,
    pub account_id: String,
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub direction: Direction,
    pub currency: String,
    pub status: TransactionStatus,
    pub matched_document_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[schemars(description = "Amounts agree to the cent")]
    Exact,
    #[schemars(description = "Transaction covers part of the document balance")]
    Partial,
    #[schemars(description = "Amount matches after deducting a known processor fee")]
    FeeAdjusted,
    #[schemars(description = "Amount matches after currency conversion")]
    FxConverted,
    #[schemars(description = "Several transactions combine to cover one document")]
    Split,
    #[schemars(description = "No amount-level relationship found")]
    None,
}

/// Per-signal breakdown attached to every candidate so the reasoning tier
/// and the UI can see why a score came out the way it did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchSignals {
    pub reference_score: f64,
    pub amount_score: f64,
    pub identity_score: f64,
    pub time_score: f64,
    pub context_adjustment: f64,
    pub direction_penalty: f64,
    pub fx_rate_used: Option<f64>,
    pub converted_amount: Option<f64>,
    pub days_from_document: Option<i64>,
    pub days_from_due: Option<i64>,
}

/// Scored (transaction, document) pair. Lives for one reconciliation pass;
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub transaction_id: String,
    pub document_id: String,
    /// Raw signal accumulator, typically 0-130. Unbounded above.
    pub score: f64,
    /// Normalized 0-100.
    pub confidence: u8,
    pub match_type: MatchType,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub signals: MatchSignals,
}

/// Learned per-vendor payment behaviour. Created on the first confirmed
/// match for a counterparty and updated on every one after that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorPattern {
    pub owner_id: String,
    pub vendor_name: String,
    pub aliases: Vec<String>,
    /// Top transaction-description keywords by frequency, capped at 15.
    pub keywords: Vec<String>,
    pub avg_delay_days: f64,
    pub min_delay_days: i64,
    pub max_delay_days: i64,
    pub match_count: u32,
    pub confidence: f64,
    pub preferred_processor: Option<String>,
    pub last_matched_at: DateTime<Utc>,
}

/// Write-once audit record of a confirmed match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchHistory {
    pub id: String,
    pub owner_id: String,
    pub transaction_id: String,
    pub document_id: String,
    pub transaction_amount: f64,
    pub transaction_currency: String,
    pub allocated_amount: f64,
    pub document_currency: String,
    pub transaction_date: NaiveDate,
    pub document_date: NaiveDate,
    pub delay_days: i64,
    pub match_type: MatchType,
    pub manual: bool,
    pub confidence: u8,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    AutoConfirmed,
    PaymentMatch,
    BankFee,
    Transfer,
    NoMatch,
    NeedsReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    QuickScan,
    AiMatching,
    DeepInvestigation,
}

/// Outcome for a single input transaction. Every transaction handed to the
/// orchestrator gets exactly one of these, even when nothing matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMatch {
    pub transaction_id: String,
    pub document_id: Option<String>,
    pub resolution: Resolution,
    pub confidence: u8,
    pub match_type: MatchType,
    pub reasons: Vec<String>,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileStep {
    pub name: String,
    pub processed: usize,
    pub resolved: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub total_transactions: usize,
    pub auto_confirmed: usize,
    pub ai_matched: usize,
    pub deep_matched: usize,
    pub non_payment: usize,
    pub no_match: usize,
    pub needs_review: usize,
    pub stopped_early: bool,
    pub estimated_remaining: usize,
}

/// Result of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub run_id: String,
    pub steps: Vec<ReconcileStep>,
    pub matches: Vec<TransactionMatch>,
    pub stats: ReconcileStats,
    pub patterns_learned: usize,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_status_thresholds() {
        assert_eq!(PaymentStatus::from_remaining(100.0, 100.0), PaymentStatus::Unpaid);
        assert_eq!(PaymentStatus::from_remaining(40.0, 100.0), PaymentStatus::Partial);
        assert_eq!(PaymentStatus::from_remaining(0.005, 100.0), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::from_remaining(0.0, 100.0), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::from_remaining(-0.5, 100.0), PaymentStatus::Overpaid);
    }

    #[test]
    fn test_expected_direction() {
        assert_eq!(DocumentType::Bill.expected_direction(), Direction::Debit);
        assert_eq!(DocumentType::Invoice.expected_direction(), Direction::Credit);
    }
}
