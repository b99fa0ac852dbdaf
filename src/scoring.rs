//! The four independent match signals: reference, amount/FX, counterparty
//! identity, and time proximity.
//!
//! Every scorer is a pure function returning a bounded score plus the details
//! needed to explain it. The constants are empirical weights, not derived
//! from a formula; what matters is the ordering (exact > reference > fuzzy >
//! partial > nothing) and that degraded paths return low scores instead of
//! failing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::currency;
use crate::schema::MatchType;
use crate::similarity::string_similarity;

/// Generic business/banking terms that carry no identity signal on their own.
pub(crate) const STOPWORDS: &[&str] = &[
    "the", "and", "for", "from", "inc", "llc", "ltd", "limited", "corp",
    "corporation", "company", "group", "holdings", "services", "service",
    "pty", "gmbh", "plc", "bank", "payment", "pmt", "transfer", "card",
    "pos", "online", "intl", "international",
];

// ---------------------------------------------------------------------------
// Reference scorer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ReferenceScore {
    pub score: f64,
    pub matched_reference: Option<String>,
    pub reason: Option<String>,
}

static REFERENCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)inv[-.#]?(\d+)").unwrap(),
        Regex::new(r"(?i)invoice[-.#]?(\d+)").unwrap(),
        Regex::new(r"#(\d{4,})").unwrap(),
        Regex::new(r"\b(\d{6,})\b").unwrap(),
    ]
});

fn normalize_reference(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Look for the document number inside the transaction free text. The four
/// rules (full containment, suffix containment, extracted-token exact,
/// extracted-token overlap) are all evaluated and the strongest one wins.
pub fn score_reference(description: &str, document_number: &str) -> ReferenceScore {
    let norm_desc = normalize_reference(description);
    let norm_doc = normalize_reference(document_number);
    let digits_doc: String = norm_doc.chars().filter(|c| c.is_ascii_digit()).collect();

    if norm_doc.is_empty() || norm_desc.is_empty() {
        return ReferenceScore::default();
    }

    let mut best = ReferenceScore::default();

    if norm_desc.contains(&norm_doc) {
        best = ReferenceScore {
            score: 40.0,
            matched_reference: Some(document_number.to_string()),
            reason: Some(format!("description contains document number {}", document_number)),
        };
    }

    if best.score < 25.0 && norm_doc.len() >= 6 {
        let suffix = &norm_doc[norm_doc.len() - 6..];
        if norm_desc.contains(suffix) {
            best = ReferenceScore {
                score: 25.0,
                matched_reference: Some(suffix.to_string()),
                reason: Some(format!(
                    "description contains document number suffix ..{}",
                    suffix
                )),
            };
        }
    }

    if best.score >= 40.0 {
        return best;
    }

    // Pull candidate reference tokens out of the raw text and compare each
    // against the document number (digit-only comparison covers numbers that
    // carry an alphabetic prefix like INV-).
    for pattern in REFERENCE_PATTERNS.iter() {
        for caps in pattern.captures_iter(description) {
            let Some(token) = caps.get(1) else { continue };
            let token = normalize_reference(token.as_str());
            if token.is_empty() {
                continue;
            }
            let exact = token == norm_doc || (!digits_doc.is_empty() && token == digits_doc);
            let overlap = token.contains(&norm_doc)
                || norm_doc.contains(&token)
                || (digits_doc.len() >= 4
                    && (token.contains(&digits_doc) || digits_doc.contains(&token)));
            let (score, label) = if exact {
                (35.0, "matches")
            } else if overlap {
                (20.0, "partially matches")
            } else {
                continue;
            };
            if score > best.score {
                best = ReferenceScore {
                    score,
                    matched_reference: Some(token.clone()),
                    reason: Some(format!(
                        "extracted reference {} {} document number {}",
                        token, label, document_number
                    )),
                };
            }
        }
    }

    best
}

// ---------------------------------------------------------------------------
// Amount / FX scorer
// ---------------------------------------------------------------------------

/// Known processor fee formulas as (name, percentage rate, fixed fee).
/// A transaction equal to `remaining * (1 - rate) - fixed` is the document
/// amount net of that processor's cut.
const PROCESSOR_FEES: &[(&str, f64, f64)] = &[
    ("stripe", 0.029, 0.30),
    ("paypal", 0.0349, 0.49),
    ("square", 0.026, 0.10),
    ("gocardless", 0.01, 0.25),
];

#[derive(Debug, Clone)]
pub struct AmountScore {
    pub score: f64,
    pub match_type: MatchType,
    pub difference: f64,
    pub difference_pct: f64,
    pub fx_rate_used: Option<f64>,
    pub converted_amount: Option<f64>,
    pub reason: String,
}

impl AmountScore {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            match_type: MatchType::None,
            difference: 0.0,
            difference_pct: 0.0,
            fx_rate_used: None,
            converted_amount: None,
            reason: reason.into(),
        }
    }
}

fn fee_formula_match(amount: f64, remaining: f64) -> Option<&'static str> {
    let tolerance = (remaining * 0.001).max(0.02);
    PROCESSOR_FEES
        .iter()
        .find(|(_, rate, fixed)| {
            let expected = remaining * (1.0 - rate) - fixed;
            (amount - expected).abs() <= tolerance
        })
        .map(|(name, _, _)| *name)
}

/// Partial-payment bands shared by the same-currency and FX paths.
/// `amount` is already in the document's currency.
fn partial_bands(amount: f64, remaining: f64) -> Option<(f64, String)> {
    let ratio = amount / remaining;
    if ratio > 1.0 && ratio <= 1.10 {
        return Some((
            15.0,
            format!("overpayment: transaction is {:.1}% of remaining", ratio * 100.0),
        ));
    }
    if (0.5..=0.95).contains(&ratio) {
        for fraction in [0.5, 1.0 / 3.0, 0.25, 0.2] {
            if (ratio - fraction).abs() < 0.02 {
                return Some((
                    20.0,
                    format!(
                        "partial payment close to a clean fraction ({:.0}%)",
                        fraction * 100.0
                    ),
                ));
            }
        }
        return Some((
            12.0,
            format!("partial payment covering {:.1}% of remaining", ratio * 100.0),
        ));
    }
    if (0.1..0.5).contains(&ratio) {
        return Some((
            8.0,
            format!("small partial payment ({:.1}% of remaining)", ratio * 100.0),
        ));
    }
    None
}

/// Compare the absolute transaction amount against the document's remaining
/// balance, converting currencies when needed. A missing FX path degrades to
/// a fixed low score with a reason, never an error.
pub fn score_amount(
    tx_amount: f64,
    tx_currency: &str,
    remaining: f64,
    doc_currency: &str,
) -> AmountScore {
    let amount = tx_amount.abs();
    if remaining <= 0.0 {
        return AmountScore::none("document has no remaining balance");
    }

    if currency::currencies_equivalent(tx_currency, doc_currency) {
        return score_same_currency(amount, remaining);
    }

    match currency::rate(tx_currency, doc_currency) {
        Some(rate) => score_converted(amount * rate, rate, remaining),
        None => AmountScore {
            score: 5.0,
            match_type: MatchType::None,
            difference: (amount - remaining).abs(),
            difference_pct: 0.0,
            fx_rate_used: None,
            converted_amount: None,
            reason: format!("no FX rate available from {} to {}", tx_currency, doc_currency),
        },
    }
}

fn score_same_currency(amount: f64, remaining: f64) -> AmountScore {
    let difference = (amount - remaining).abs();
    let difference_pct = difference / remaining * 100.0;

    // The fee check runs before the generic tolerance bands: a processor-fee
    // hit is a more specific explanation than "within 5%".
    let (score, match_type, reason) = if difference < 0.01 {
        (35.0, MatchType::Exact, "amounts match exactly".to_string())
    } else if difference_pct < 0.5 {
        (
            32.0,
            MatchType::Exact,
            format!("amounts within {:.2}%", difference_pct),
        )
    } else if let Some(processor) = fee_formula_match(amount, remaining) {
        (
            30.0,
            MatchType::FeeAdjusted,
            format!("amount matches {} fee formula", processor),
        )
    } else if difference_pct < 5.0 {
        (
            20.0,
            MatchType::Partial,
            format!("amounts within {:.1}%", difference_pct),
        )
    } else if let Some((score, reason)) = partial_bands(amount, remaining) {
        (score, MatchType::Partial, reason)
    } else {
        (0.0, MatchType::None, "amounts unrelated".to_string())
    };

    AmountScore {
        score,
        match_type,
        difference,
        difference_pct,
        fx_rate_used: None,
        converted_amount: None,
        reason,
    }
}

fn score_converted(converted: f64, rate: f64, remaining: f64) -> AmountScore {
    let difference = (converted - remaining).abs();
    let difference_pct = difference / remaining * 100.0;

    // The FX path carries a penalty against same-currency scores and wider
    // tolerance bands, since the fallback rates are approximate.
    let (score, match_type, reason) = if difference < 0.01 {
        (
            32.0,
            MatchType::FxConverted,
            format!("converted amount {:.2} matches exactly (rate {:.4})", converted, rate),
        )
    } else if difference_pct < 2.0 {
        (
            28.0,
            MatchType::FxConverted,
            format!(
                "converted amount {:.2} within {:.2}% (rate {:.4})",
                converted, difference_pct, rate
            ),
        )
    } else if let Some(processor) = fee_formula_match(converted, remaining) {
        (
            26.0,
            MatchType::FeeAdjusted,
            format!("converted amount matches {} fee formula", processor),
        )
    } else if difference_pct < 5.0 {
        (
            22.0,
            MatchType::FxConverted,
            format!(
                "converted amount {:.2} within {:.1}% (rate {:.4})",
                converted, difference_pct, rate
            ),
        )
    } else if difference_pct < 10.0 {
        (
            15.0,
            MatchType::FxConverted,
            format!(
                "converted amount {:.2} within {:.1}% (rate {:.4})",
                converted, difference_pct, rate
            ),
        )
    } else if let Some((score, reason)) = partial_bands(converted, remaining) {
        (score, MatchType::Partial, format!("{} (after conversion)", reason))
    } else {
        (0.0, MatchType::None, "amounts unrelated after conversion".to_string())
    };

    AmountScore {
        score,
        match_type,
        difference,
        difference_pct,
        fx_rate_used: Some(rate),
        converted_amount: Some(converted),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Identity scorer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IdentityScore {
    pub score: f64,
    pub matched_words: f64,
    pub total_words: usize,
    pub reason: Option<String>,
}

fn significant_words(name: &str) -> Vec<String> {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .map(|w| w.to_lowercase())
        .collect()
}

/// Look for the counterparty name, or its significant words, in the
/// transaction text. Fuzzy word hits (>= 0.85 similarity) count 0.8 of a
/// verbatim hit.
pub fn score_identity(description: &str, counterparty_name: &str) -> IdentityScore {
    let desc = description.to_lowercase();
    let name = counterparty_name.trim().to_lowercase();
    if name.is_empty() || desc.is_empty() {
        return IdentityScore::default();
    }

    if desc.contains(&name) {
        return IdentityScore {
            score: 25.0,
            matched_words: 0.0,
            total_words: 0,
            reason: Some(format!("description contains \"{}\"", counterparty_name.trim())),
        };
    }

    let words = significant_words(&name);
    if !words.is_empty() {
        let desc_tokens: Vec<String> = desc
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect();

        let mut credit = 0.0;
        for word in &words {
            if desc.contains(word.as_str()) {
                credit += 1.0;
            } else if desc_tokens
                .iter()
                .any(|t| string_similarity(t, word) >= 0.85)
            {
                credit += 0.8;
            }
        }

        let ratio = credit / words.len() as f64;
        let score = if ratio >= 0.8 {
            22.0
        } else if ratio >= 0.5 {
            15.0
        } else if ratio > 0.0 {
            8.0
        } else {
            0.0
        };

        if score > 0.0 {
            return IdentityScore {
                score,
                matched_words: credit,
                total_words: words.len(),
                reason: Some(format!(
                    "{:.1} of {} name words found in description",
                    credit,
                    words.len()
                )),
            };
        }
    }

    let overall = string_similarity(&desc, &name);
    if overall >= 0.6 {
        return IdentityScore {
            score: 10.0,
            matched_words: 0.0,
            total_words: 0,
            reason: Some(format!("description similar to name ({:.0}%)", overall * 100.0)),
        };
    }

    IdentityScore::default()
}

// ---------------------------------------------------------------------------
// Time-proximity scorer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeScore {
    pub score: f64,
    pub days_from_document: i64,
    pub days_from_due: Option<i64>,
    pub reason: String,
}

/// Day-delta proximity. Due-date proximity is preferred over document-date
/// proximity when a due date exists; payments more than 30 days before the
/// document date are rejected as too early.
pub fn score_time(
    tx_date: chrono::NaiveDate,
    document_date: chrono::NaiveDate,
    due_date: Option<chrono::NaiveDate>,
) -> TimeScore {
    let days_from_document = (tx_date - document_date).num_days();
    let days_from_due = due_date.map(|d| (tx_date - d).num_days());

    if days_from_document < 0 {
        let (score, reason) = if days_from_document >= -30 {
            (
                8.0,
                format!("advance payment {} days before document date", -days_from_document),
            )
        } else {
            (
                0.0,
                format!("{} days before document date: too early", -days_from_document),
            )
        };
        return TimeScore {
            score,
            days_from_document,
            days_from_due,
            reason,
        };
    }

    if let Some(delta) = days_from_due {
        let distance = delta.abs();
        let score = match distance {
            0..=3 => 20.0,
            4..=7 => 15.0,
            8..=30 => 10.0,
            31..=60 => 5.0,
            _ => -1.0,
        };
        if score >= 0.0 {
            return TimeScore {
                score,
                days_from_document,
                days_from_due,
                reason: format!("{} days from due date", distance),
            };
        }
        // Too far from the due date; fall through to document-date proximity.
    }

    let score = match days_from_document {
        0..=7 => 15.0,
        8..=30 => 10.0,
        31..=60 => 5.0,
        61..=90 => 2.0,
        _ => 0.0,
    };
    TimeScore {
        score,
        days_from_document,
        days_from_due,
        reason: format!("{} days after document date", days_from_document),
    }
}
