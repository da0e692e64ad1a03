use chrono::{DateTime, Utc};
use costlink_contracts::SessionsDocument;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Parses a decimal amount into minor units (hundredths). Accepts `,` as the
/// decimal separator and ignores grouping whitespace. A third fractional
/// digit rounds half-up; further digits are ignored.
pub fn parse_decimal_minor(input: &str) -> Option<i64> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole_val: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_digit = |idx: usize| -> i64 {
        frac.chars()
            .nth(idx)
            .and_then(|c| c.to_digit(10))
            .map(i64::from)
            .unwrap_or(0)
    };
    let mut minor = whole_val
        .checked_mul(100)?
        .checked_add(frac_digit(0) * 10 + frac_digit(1))?;
    if frac_digit(2) >= 5 {
        minor = minor.checked_add(1)?;
    }
    Some(if negative { -minor } else { minor })
}

pub fn parse_amount_minor(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => parse_decimal_minor(&n.to_string()),
        Value::String(s) => parse_decimal_minor(s),
        _ => None,
    }
}

/// An already-stored minor-unit total. The ERP may serialize integral sums
/// as floats (`10000.0`); fractional or non-numeric values are rejected.
pub fn stored_minor(value: &Value) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

pub fn format_minor(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Inclusive `[Jan 1, Dec 31]` bounds of a business year in ERP filter format.
pub fn year_window(year: i32) -> (String, String) {
    (
        format!("{year}-01-01 00:00:00"),
        format!("{year}-12-31 23:59:59"),
    )
}

pub fn audit_line(
    at: DateTime<Utc>,
    delta_minor: i64,
    currency: Option<&str>,
    category: &str,
) -> String {
    let amount = match currency.map(str::trim).filter(|c| !c.is_empty()) {
        Some(cur) => format!("{} {cur}", format_minor(delta_minor)),
        None => format_minor(delta_minor),
    };
    format!("[{}] +{amount} ({category})", at.format("%Y-%m-%d %H:%M"))
}

pub fn append_audit_line(description: Option<&str>, line: &str) -> String {
    match description.map(str::trim_end).filter(|d| !d.is_empty()) {
        Some(existing) => format!("{existing}\n{line}"),
        None => line.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateMatch {
    Exact(usize),
    Unique(usize),
    NoMatch,
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Exact name wins; otherwise a single candidate containing `number`.
pub fn pick_candidate(number: &str, names: &[String]) -> CandidateMatch {
    let wanted = normalize_name(number);
    if wanted.is_empty() {
        return CandidateMatch::NoMatch;
    }
    if let Some(idx) = names.iter().position(|n| normalize_name(n) == wanted) {
        return CandidateMatch::Exact(idx);
    }
    let containing: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| normalize_name(n).contains(&wanted))
        .map(|(idx, _)| idx)
        .collect();
    match containing.as_slice() {
        [only] => CandidateMatch::Unique(*only),
        _ => CandidateMatch::NoMatch,
    }
}

/// Drops the oldest-created mappings until at most `limit` remain. Access
/// order is irrelevant; this is a FIFO cap. Returns the evicted keys.
pub fn trim_sessions(doc: &mut SessionsDocument, limit: usize) -> Vec<String> {
    if doc.len() <= limit {
        return Vec::new();
    }
    let mut by_age: Vec<(Option<DateTime<Utc>>, String, String)> = doc
        .iter()
        .map(|(key, m)| (parse_rfc3339(&m.created_at), m.created_at.clone(), key.clone()))
        .collect();
    by_age.sort();

    let excess = doc.len() - limit;
    by_age
        .into_iter()
        .take(excess)
        .map(|(_, _, key)| {
            doc.remove(&key);
            key
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use costlink_contracts::SessionMapping;
    use serde_json::json;

    #[test]
    fn parses_amounts_into_minor_units() {
        assert_eq!(parse_decimal_minor("250.50"), Some(25050));
        assert_eq!(parse_decimal_minor("250,5"), Some(25050));
        assert_eq!(parse_decimal_minor("1 000,00"), Some(100000));
        assert_eq!(parse_decimal_minor("0.005"), Some(1));
        assert_eq!(parse_decimal_minor("0.004"), Some(0));
        assert_eq!(parse_decimal_minor("-3"), Some(-300));
        assert_eq!(parse_decimal_minor(".75"), Some(75));
        assert_eq!(parse_decimal_minor("abc"), None);
        assert_eq!(parse_decimal_minor(""), None);
        assert_eq!(parse_decimal_minor("1e21"), None);
    }

    #[test]
    fn parses_json_amounts_without_float_drift() {
        assert_eq!(parse_amount_minor(&json!(250.5)), Some(25050));
        assert_eq!(parse_amount_minor(&json!(0.1)), Some(10));
        assert_eq!(parse_amount_minor(&json!(100)), Some(10000));
        assert_eq!(parse_amount_minor(&json!("19,99")), Some(1999));
        assert_eq!(parse_amount_minor(&json!(null)), None);
    }

    #[test]
    fn accumulation_is_exact_in_minor_units() {
        let total = [json!(100.00), json!(50.00)]
            .iter()
            .filter_map(parse_amount_minor)
            .sum::<i64>();
        assert_eq!(total, 15000);
        assert_eq!(format_minor(total), "150.00");
        assert_eq!(format_minor(-150), "-1.50");
        assert_eq!(format_minor(7), "0.07");
    }

    #[test]
    fn stored_totals_accept_integral_floats_only() {
        assert_eq!(stored_minor(&json!(10000)), Some(10000));
        assert_eq!(stored_minor(&json!(10000.0)), Some(10000));
        assert_eq!(stored_minor(&json!(100.5)), None);
        assert_eq!(stored_minor(&json!("10000")), None);
        assert_eq!(stored_minor(&json!(null)), None);
    }

    #[test]
    fn year_window_spans_whole_year() {
        let (from, to) = year_window(2025);
        assert_eq!(from, "2025-01-01 00:00:00");
        assert_eq!(to, "2025-12-31 23:59:59");
    }

    #[test]
    fn audit_line_shows_delta_and_category() {
        let at = Utc.with_ymd_and_hms(2026, 3, 5, 14, 7, 0).unwrap();
        assert_eq!(
            audit_line(at, 25050, Some("RUB"), "Логистика"),
            "[2026-03-05 14:07] +250.50 RUB (Логистика)"
        );
        assert_eq!(
            audit_line(at, 100, None, "Прочее"),
            "[2026-03-05 14:07] +1.00 (Прочее)"
        );
        assert_eq!(append_audit_line(Some("note\n"), "x"), "note\nx");
        assert_eq!(append_audit_line(None, "x"), "x");
    }

    #[test]
    fn candidate_matching_prefers_exact_then_unique_substring() {
        let names = vec!["ДГ-10".to_string(), "дг-1".to_string()];
        assert_eq!(pick_candidate("ДГ-1", &names), CandidateMatch::Exact(1));

        let names = vec!["00012-A".to_string(), "00099".to_string()];
        assert_eq!(pick_candidate("00012", &names), CandidateMatch::Unique(0));

        let names = vec!["ДГ-11".to_string(), "ДГ-12".to_string()];
        assert_eq!(pick_candidate("ДГ-1", &names), CandidateMatch::NoMatch);
        assert_eq!(pick_candidate("  ", &names), CandidateMatch::NoMatch);
    }

    #[test]
    fn trim_sessions_evicts_by_creation_time() {
        let mut doc = SessionsDocument::new();
        for (key, ts) in [
            ("k-new", "2026-01-03T00:00:00+00:00"),
            ("k-old", "2026-01-01T00:00:00+00:00"),
            ("k-mid", "2026-01-02T00:00:00+00:00"),
        ] {
            doc.insert(
                key.to_string(),
                SessionMapping {
                    account_id: "a".to_string(),
                    account_name: String::new(),
                    created_at: ts.to_string(),
                },
            );
        }
        let evicted = trim_sessions(&mut doc, 2);
        assert_eq!(evicted, vec!["k-old".to_string()]);
        assert!(doc.contains_key("k-new") && doc.contains_key("k-mid"));
        assert!(trim_sessions(&mut doc, 2).is_empty());
    }

    #[test]
    fn jcs_hash_is_key_order_independent() {
        let a = jcs_sha256_hex(&json!({"a": 1, "b": 2})).unwrap();
        let b = jcs_sha256_hex(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
