//! Static fallback FX rates and peg equivalence.
//!
//! Rates here are deliberately coarse: they exist so cross-currency amounts
//! can be compared at all when no live rate source is wired in, not to be
//! accurate to the day. Callers treat a missing rate as a degraded score,
//! never as an error.

/// Fallback rates quoted as (from, to, rate): 1 unit of `from` buys `rate`
/// units of `to`. Everything routes through USD.
const FALLBACK_RATES: &[(&str, &str, f64)] = &[
    ("EUR", "USD", 1.09),
    ("GBP", "USD", 1.27),
    ("CAD", "USD", 0.74),
    ("AUD", "USD", 0.66),
    ("NZD", "USD", 0.60),
    ("CHF", "USD", 1.13),
    ("JPY", "USD", 0.0067),
    ("CNY", "USD", 0.14),
    ("INR", "USD", 0.012),
    ("MXN", "USD", 0.058),
    ("BRL", "USD", 0.18),
    ("SGD", "USD", 0.75),
    ("HKD", "USD", 0.128),
    ("SEK", "USD", 0.095),
    ("NOK", "USD", 0.094),
    ("DKK", "USD", 0.146),
    ("PLN", "USD", 0.25),
    ("ZAR", "USD", 0.055),
    ("ANG", "USD", 0.56),
    ("AWG", "USD", 0.56),
    ("XCG", "USD", 0.56),
    ("BBD", "USD", 0.50),
    ("TTD", "USD", 0.147),
    ("DOP", "USD", 0.017),
    ("JMD", "USD", 0.0064),
];

/// Currency pairs treated as interchangeable for matching: no conversion is
/// applied at all between them. Symmetric.
const PEGGED_PAIRS: &[(&str, &str)] = &[
    // Caribbean guilder replaced the Antillean guilder 1:1; Aruba pegs
    // alongside both.
    ("ANG", "XCG"),
    ("ANG", "AWG"),
    ("AWG", "XCG"),
    // Hard USD pegs.
    ("USD", "BSD"),
    ("USD", "PAB"),
    ("USD", "BMD"),
];

const PIVOT: &str = "USD";

fn direct_rate(from: &str, to: &str) -> Option<f64> {
    for (f, t, r) in FALLBACK_RATES {
        if *f == from && *t == to {
            return Some(*r);
        }
        if *f == to && *t == from {
            return Some(1.0 / r);
        }
    }
    None
}

/// Resolve a conversion rate between two currency codes.
///
/// Identity, then direct/inverse table lookup, then a bridge through USD.
/// `None` means no path exists; callers degrade to a fixed low score.
pub fn rate(from: &str, to: &str) -> Option<f64> {
    let from = from.trim().to_uppercase();
    let to = to.trim().to_uppercase();
    if from == to {
        return Some(1.0);
    }
    if let Some(r) = direct_rate(&from, &to) {
        return Some(r);
    }
    if from != PIVOT && to != PIVOT {
        let to_usd = direct_rate(&from, PIVOT)?;
        let from_usd = direct_rate(PIVOT, &to)?;
        return Some(to_usd * from_usd);
    }
    None
}

pub fn convert(amount: f64, from: &str, to: &str) -> Option<f64> {
    rate(from, to).map(|r| amount * r)
}

/// True when the two codes are the same currency or pegged near 1:1, in
/// which case matching skips FX conversion entirely.
pub fn currencies_equivalent(a: &str, b: &str) -> bool {
    let a = a.trim().to_uppercase();
    let b = b.trim().to_uppercase();
    if a == b {
        return true;
    }
    PEGGED_PAIRS
        .iter()
        .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rate() {
        assert_eq!(rate("USD", "USD"), Some(1.0));
        assert_eq!(rate("eur", "EUR"), Some(1.0));
    }

    #[test]
    fn test_direct_and_inverse() {
        assert_eq!(rate("EUR", "USD"), Some(1.09));
        let inv = rate("USD", "EUR").unwrap();
        assert!((inv - 1.0 / 1.09).abs() < 1e-9);
    }

    #[test]
    fn test_pivot_through_usd() {
        // EUR -> GBP has no direct entry; must compose EUR->USD->GBP.
        let r = rate("EUR", "GBP").unwrap();
        assert!((r - 1.09 / 1.27).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_currency() {
        assert_eq!(rate("XYZ", "USD"), None);
        assert_eq!(convert(100.0, "USD", "XYZ"), None);
    }

    #[test]
    fn test_convert() {
        let c = convert(4451.44, "ANG", "USD").unwrap();
        assert!((c - 4451.44 * 0.56).abs() < 1e-6);
    }

    #[test]
    fn test_peg_equivalence() {
        assert!(currencies_equivalent("ANG", "XCG"));
        assert!(currencies_equivalent("xcg", "ang"));
        assert!(currencies_equivalent("USD", "BSD"));
        assert!(!currencies_equivalent("USD", "EUR"));
        assert!(currencies_equivalent("USD", "USD"));
    }
}
