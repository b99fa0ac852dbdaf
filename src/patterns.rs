//! Learned per-vendor payment behaviour.
//!
//! Patterns are created on the first confirmed match for a counterparty and
//! refined on every one after that: payment-delay running averages, a
//! min/max delay range, and a keyword frequency table distilled from
//! transaction descriptions. Callers replaying a confirmed match must
//! de-duplicate by match id themselves; `learn` always counts its input.

use std::collections::HashMap;

use chrono::Utc;

use crate::schema::{MatchType, VendorPattern};
use crate::scoring::STOPWORDS;
use crate::similarity::string_similarity;

/// Minimum fuzzy similarity for a vendor-name lookup hit.
const LOOKUP_SIMILARITY: f64 = 0.7;
/// Keyword caps: per extraction, and stored per pattern.
const MAX_KEYWORDS_PER_TEXT: usize = 10;
const MAX_STORED_KEYWORDS: usize = 15;

/// A confirmed match distilled to what pattern learning needs.
#[derive(Debug, Clone)]
pub struct ConfirmedMatch {
    pub owner_id: String,
    pub vendor_name: String,
    pub transaction_description: String,
    pub delay_days: i64,
    pub confidence: u8,
    pub match_type: MatchType,
    pub manual: bool,
    pub processor: Option<String>,
}

/// Lowercase, strip punctuation, split, drop short tokens and stopwords.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t))
    {
        if !keywords.iter().any(|k| k == token) {
            keywords.push(token.to_string());
            if keywords.len() == MAX_KEYWORDS_PER_TEXT {
                break;
            }
        }
    }
    keywords
}

/// Find patterns for a vendor name: exact (case-insensitive) hits first,
/// then fuzzy hits at `LOOKUP_SIMILARITY` or better against the stored name
/// and aliases, sorted by similarity descending.
pub fn lookup<'a>(patterns: &'a [VendorPattern], vendor_name: &str) -> Vec<&'a VendorPattern> {
    let target = vendor_name.trim().to_lowercase();
    if target.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(&VendorPattern, f64)> = Vec::new();
    for pattern in patterns {
        let names = std::iter::once(&pattern.vendor_name).chain(pattern.aliases.iter());
        let best = names
            .map(|n| {
                let n = n.to_lowercase();
                if n == target {
                    1.0 + f64::EPSILON // exact beats a fuzzy 1.0 rename
                } else {
                    string_similarity(&n, &target)
                }
            })
            .fold(0.0f64, f64::max);
        if best >= LOOKUP_SIMILARITY {
            scored.push((pattern, best));
        }
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(p, _)| p).collect()
}

/// Fold one confirmed match into an existing pattern.
pub fn update_pattern(pattern: &mut VendorPattern, confirmed: &ConfirmedMatch) {
    let old_count = pattern.match_count as f64;
    let new_count = old_count + 1.0;

    pattern.avg_delay_days =
        (pattern.avg_delay_days * old_count + confirmed.delay_days as f64) / new_count;
    pattern.min_delay_days = pattern.min_delay_days.min(confirmed.delay_days);
    pattern.max_delay_days = pattern.max_delay_days.max(confirmed.delay_days);
    pattern.match_count += 1;

    merge_keywords(pattern, &extract_keywords(&confirmed.transaction_description));

    pattern.confidence = if confirmed.manual {
        (pattern.confidence + 5.0).min(100.0)
    } else {
        // Automatic confirmations nudge rather than jump: blend the match
        // confidence in at a fixed weight.
        (pattern.confidence * 0.8 + confirmed.confidence as f64 * 0.2).min(100.0)
    };

    if pattern.preferred_processor.is_none() {
        pattern.preferred_processor = confirmed.processor.clone();
    }
    if !pattern
        .aliases
        .iter()
        .any(|a| a.eq_ignore_ascii_case(&confirmed.vendor_name))
        && !pattern
            .vendor_name
            .eq_ignore_ascii_case(&confirmed.vendor_name)
    {
        pattern.aliases.push(confirmed.vendor_name.clone());
    }
    pattern.last_matched_at = Utc::now();
}

/// Seed a brand-new pattern from the first confirmed match for a vendor.
pub fn new_pattern(confirmed: &ConfirmedMatch) -> VendorPattern {
    let confidence = if confirmed.manual {
        70.0
    } else {
        (confirmed.confidence as f64).min(90.0)
    };

    VendorPattern {
        owner_id: confirmed.owner_id.clone(),
        vendor_name: confirmed.vendor_name.clone(),
        aliases: Vec::new(),
        keywords: extract_keywords(&confirmed.transaction_description),
        avg_delay_days: confirmed.delay_days as f64,
        min_delay_days: confirmed.delay_days,
        max_delay_days: confirmed.delay_days,
        match_count: 1,
        confidence,
        preferred_processor: confirmed.processor.clone(),
        last_matched_at: Utc::now(),
    }
}

/// Merge new keywords into the stored set by frequency, keeping the top 15.
/// Existing keywords carry their list position as an implicit frequency
/// rank; re-observed keywords get promoted.
fn merge_keywords(pattern: &mut VendorPattern, new_keywords: &[String]) {
    let mut frequency: HashMap<&str, usize> = HashMap::new();
    // Earlier stored position = seen more often historically.
    let stored = pattern.keywords.len();
    for (idx, k) in pattern.keywords.iter().enumerate() {
        frequency.insert(k.as_str(), stored - idx);
    }
    for k in new_keywords {
        *frequency.entry(k.as_str()).or_insert(0) += stored.max(1);
    }

    let mut ranked: Vec<(&str, usize)> = frequency.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    pattern.keywords = ranked
        .into_iter()
        .take(MAX_STORED_KEYWORDS)
        .map(|(k, _)| k.to_string())
        .collect();
}
