//! Wire types for the external reasoning service.
//!
//! The schemars descriptions double as the response schema handed to the
//! model, so they are written for the model as much as for the reader.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::MatchType;

/// Computational effort requested from the reasoning service: low effort for
/// batched triage, high effort for one-item deep investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffortLevel {
    Low,
    High,
}

/// One transaction as presented to the model, with its pre-computed rule
/// candidates so the model starts from the scorer's shortlist.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransactionContext {
    pub transaction_id: String,
    pub date: chrono::NaiveDate,
    pub description: String,
    pub amount: f64,
    pub direction: String,
    pub currency: String,
    #[schemars(description = "Rule-based candidates, best first, with confidence and reasons")]
    pub rule_candidates: Vec<CandidateContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CandidateContext {
    pub document_id: String,
    pub confidence: u8,
    pub match_type: MatchType,
    pub reasons: Vec<String>,
}

/// One open document the model may match against.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DocumentContext {
    pub document_id: String,
    pub doc_type: String,
    pub document_number: String,
    pub counterparty_name: String,
    pub document_date: chrono::NaiveDate,
    pub due_date: Option<chrono::NaiveDate>,
    pub amount_remaining: f64,
    pub currency: String,
}

/// Learned vendor behaviour supplied as matching context.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PatternContext {
    pub vendor_name: String,
    pub avg_delay_days: f64,
    pub keywords: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReasoningRequest {
    pub transactions: Vec<TransactionContext>,
    pub documents: Vec<DocumentContext>,
    pub patterns: Vec<PatternContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    #[schemars(description = "The transaction pays (part of) one of the documents")]
    PaymentMatch,
    #[schemars(description = "A bank or processor fee, not tied to any document")]
    BankFee,
    #[schemars(description = "An internal transfer between own accounts")]
    Transfer,
    #[schemars(description = "Confidently unrelated to every open document")]
    NoMatch,
    #[schemars(description = "Cannot be decided with the given context; a human should look")]
    NeedsReview,
}

/// Per-transaction verdict from the reasoning service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReasoningOutcome {
    pub transaction_id: String,
    pub classification: Classification,
    #[serde(default)]
    #[schemars(description = "Matched document id, required for payment_match")]
    pub document_id: Option<String>,
    #[serde(default)]
    #[schemars(description = "All involved document ids when one transaction covers several")]
    pub document_ids: Vec<String>,
    #[schemars(description = "0-100")]
    pub confidence: u8,
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub match_type: Option<MatchType>,
}

impl ReasoningOutcome {
    /// Fallback verdict when the model output is missing or unusable.
    pub fn needs_review(transaction_id: &str, reason: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            classification: Classification::NeedsReview,
            document_id: None,
            document_ids: Vec::new(),
            confidence: 0,
            reasoning: vec![reason.into()],
            match_type: None,
        }
    }
}

/// Response schema root handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReasoningResponse {
    pub outcomes: Vec<ReasoningOutcome>,
}

/// The external reasoning call. Implementations must degrade malformed
/// output to `needs_review` outcomes rather than propagate a parse failure;
/// transport errors may surface as `Err` and are absorbed per batch by the
/// orchestrator.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn analyze(
        &self,
        request: &ReasoningRequest,
        effort: EffortLevel,
    ) -> Result<Vec<ReasoningOutcome>>;
}
