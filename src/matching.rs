//! Aggregates the four signals into a single ranked candidate, and generates
//! filtered candidate lists for a transaction or a document.

use crate::currency;
use crate::schema::{
    Direction, Document, MatchCandidate, MatchSignals, MatchType, Transaction, TransactionStatus,
};
use crate::scoring;

/// Confidence gate below which a candidate is not worth surfacing.
pub const MIN_CANDIDATE_CONFIDENCE: u8 = 40;

/// The raw score that maps to confidence 100. Scores can exceed it; the
/// confidence is clamped.
const MAX_EXPECTED_SCORE: f64 = 130.0;

/// Penalty applied when the transaction direction disagrees with the
/// document type. Mismatches are kept as candidates because data-entry
/// errors and refunds are legitimate, but they must rank well below an
/// otherwise identical same-direction pair.
const DIRECTION_PENALTY: f64 = 20.0;

pub fn confidence_from_score(score: f64) -> u8 {
    (score / MAX_EXPECTED_SCORE * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Score one (transaction, document) pair. `batch_amounts`, when supplied,
/// is a consistent snapshot of all same-direction amounts in the batch and
/// feeds the duplicate-amount context signal.
pub fn calculate_match(
    tx: &Transaction,
    doc: &Document,
    batch_amounts: Option<&[f64]>,
) -> MatchCandidate {
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();
    let mut signals = MatchSignals::default();

    let expected = doc.doc_type.expected_direction();
    if tx.direction != expected {
        signals.direction_penalty = -DIRECTION_PENALTY;
        warnings.push(format!(
            "direction mismatch: {} transaction against {} (expected {})",
            tx.direction.as_str(),
            doc.doc_type.as_str(),
            expected.as_str()
        ));
    }

    let reference = scoring::score_reference(&tx.description, &doc.document_number);
    signals.reference_score = reference.score;
    if let Some(reason) = &reference.reason {
        reasons.push(reason.clone());
    }

    let amount = scoring::score_amount(tx.amount, &tx.currency, doc.amount_remaining, &doc.currency);
    signals.amount_score = amount.score;
    signals.fx_rate_used = amount.fx_rate_used;
    signals.converted_amount = amount.converted_amount;
    reasons.push(amount.reason.clone());

    let identity = scoring::score_identity(&tx.description, &doc.counterparty_name);
    signals.identity_score = identity.score;
    if let Some(reason) = &identity.reason {
        reasons.push(reason.clone());
    }

    let time = scoring::score_time(tx.date, doc.document_date, doc.due_date);
    signals.time_score = time.score;
    signals.days_from_document = Some(time.days_from_document);
    signals.days_from_due = time.days_from_due;
    reasons.push(time.reason.clone());

    signals.context_adjustment = context_adjustment(tx, doc, &reference, batch_amounts, &mut reasons);

    let score = signals.reference_score
        + signals.amount_score
        + signals.identity_score
        + signals.time_score
        + signals.context_adjustment
        + signals.direction_penalty;

    let match_type = match amount.match_type {
        MatchType::Exact | MatchType::FxConverted | MatchType::FeeAdjusted => amount.match_type,
        _ => MatchType::Partial,
    };

    MatchCandidate {
        transaction_id: tx.id.clone(),
        document_id: doc.id.clone(),
        score,
        confidence: confidence_from_score(score),
        match_type,
        reasons,
        warnings,
        signals,
    }
}

/// Contextual adjustments that depend on more than the pair itself:
/// recurring identical amounts in the batch make an amount signal less
/// trustworthy, and a reference hit makes a cross-currency guess safer.
fn context_adjustment(
    tx: &Transaction,
    doc: &Document,
    reference: &scoring::ReferenceScore,
    batch_amounts: Option<&[f64]>,
    reasons: &mut Vec<String>,
) -> f64 {
    let mut adjustment = 0.0;

    if let Some(amounts) = batch_amounts {
        let occurrences = amounts
            .iter()
            .filter(|a| (**a - tx.amount).abs() < 0.01)
            .count();
        if occurrences == 1 {
            adjustment += 5.0;
            reasons.push("amount is unique within the batch".to_string());
        } else if occurrences > 3 {
            adjustment -= 5.0;
            reasons.push(format!("amount recurs {} times in the batch", occurrences));
        }
    }

    if !currency::currencies_equivalent(&tx.currency, &doc.currency) && reference.score >= 20.0 {
        adjustment += 5.0;
        reasons.push("reference match backs the cross-currency candidate".to_string());
    }

    adjustment
}

/// Rank the direction-appropriate open documents for one transaction.
/// Ties on confidence break by ascending document id so the ordering does
/// not depend on store query order.
pub fn find_matches_for_transaction(
    tx: &Transaction,
    documents: &[Document],
    batch_amounts: Option<&[f64]>,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = documents
        .iter()
        .filter(|d| d.doc_type.expected_direction() == tx.direction && d.amount_remaining > 0.0)
        .map(|d| calculate_match(tx, d, batch_amounts))
        .filter(|c| c.confidence >= MIN_CANDIDATE_CONFIDENCE)
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    candidates
}

/// Symmetric search: rank candidate transactions for one document,
/// excluding transactions that are already matched.
pub fn find_matches_for_document(
    doc: &Document,
    transactions: &[Transaction],
    batch_amounts: Option<&[f64]>,
) -> Vec<MatchCandidate> {
    let expected = doc.doc_type.expected_direction();
    let mut candidates: Vec<MatchCandidate> = transactions
        .iter()
        .filter(|t| t.direction == expected && t.status != TransactionStatus::Matched)
        .map(|t| calculate_match(t, doc, batch_amounts))
        .filter(|c| c.confidence >= MIN_CANDIDATE_CONFIDENCE)
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
    candidates
}

/// Same-direction amounts snapshot used for the duplicate-amount signal.
/// Taken once before scoring begins so every pair sees the same view.
pub fn direction_amounts(transactions: &[Transaction], direction: Direction) -> Vec<f64> {
    transactions
        .iter()
        .filter(|t| t.direction == direction)
        .map(|t| t.amount)
        .collect()
}
