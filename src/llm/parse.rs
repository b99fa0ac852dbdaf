//! Tolerant parsing of model output into per-transaction verdicts.

use std::collections::HashMap;

use crate::llm::types::{ReasoningOutcome, ReasoningResponse};

/// Strip code fences and prose around the first JSON value in the output.
/// Whichever bracket opens first decides whether the value is an object or
/// an array.
pub fn clean_json_output(raw: &str) -> String {
    let obj = raw.find('{');
    let arr = raw.find('[');
    let slice = match (obj, arr) {
        (Some(o), Some(a)) if a < o => Some((a, raw.rfind(']').unwrap_or(a))),
        (Some(o), _) => Some((o, raw.rfind('}').unwrap_or(o))),
        (None, Some(a)) => Some((a, raw.rfind(']').unwrap_or(a))),
        (None, None) => None,
    };
    if let Some((start, end)) = slice {
        if start < end {
            return raw[start..=end].to_string();
        }
    }
    raw.trim().to_string()
}

/// Parse model output into exactly one outcome per expected transaction id.
///
/// Accepts either the schema root (`{"outcomes": [...]}`) or a bare array.
/// Anything unusable, and any transaction the model skipped, becomes a
/// `needs_review` outcome carrying the failure reason; this function never
/// fails.
pub fn parse_outcomes(raw: &str, expected_ids: &[String]) -> Vec<ReasoningOutcome> {
    let cleaned = clean_json_output(raw);

    let parsed: std::result::Result<Vec<ReasoningOutcome>, String> =
        serde_json::from_str::<ReasoningResponse>(&cleaned)
            .map(|r| r.outcomes)
            .or_else(|_| serde_json::from_str::<Vec<ReasoningOutcome>>(&cleaned))
            .map_err(|e| e.to_string());

    match parsed {
        Ok(outcomes) => {
            let mut by_id: HashMap<String, ReasoningOutcome> = outcomes
                .into_iter()
                .map(|o| (o.transaction_id.clone(), o))
                .collect();
            expected_ids
                .iter()
                .map(|id| {
                    by_id.remove(id).unwrap_or_else(|| {
                        ReasoningOutcome::needs_review(id, "model returned no verdict for this transaction")
                    })
                })
                .collect()
        }
        Err(e) => expected_ids
            .iter()
            .map(|id| {
                ReasoningOutcome::needs_review(id, format!("malformed model output: {}", e))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::Classification;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parses_schema_root_with_fences() {
        let raw = r#"Here you go:
```json
{"outcomes": [{"transaction_id": "t1", "classification": "payment_match",
  "document_id": "d1", "confidence": 85, "reasoning": ["ref matches"],
  "match_type": "exact"}]}
```"#;
        let outcomes = parse_outcomes(raw, &ids(&["t1"]));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].classification, Classification::PaymentMatch);
        assert_eq!(outcomes[0].confidence, 85);
    }

    #[test]
    fn test_missing_transaction_becomes_needs_review() {
        let raw = r#"{"outcomes": [{"transaction_id": "t1", "classification": "no_match", "confidence": 70}]}"#;
        let outcomes = parse_outcomes(raw, &ids(&["t1", "t2"]));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].classification, Classification::NoMatch);
        assert_eq!(outcomes[1].classification, Classification::NeedsReview);
        assert!(outcomes[1].reasoning[0].contains("no verdict"));
    }

    #[test]
    fn test_garbage_degrades_without_error() {
        let outcomes = parse_outcomes("the model rambled with no json at all", &ids(&["t1", "t2"]));
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.classification == Classification::NeedsReview));
        assert!(outcomes[0].reasoning[0].contains("malformed"));
    }

    #[test]
    fn test_bare_array_accepted() {
        let raw = r#"[{"transaction_id": "t1", "classification": "bank_fee", "confidence": 90}]"#;
        let outcomes = parse_outcomes(raw, &ids(&["t1"]));
        assert_eq!(outcomes[0].classification, Classification::BankFee);
    }
}
