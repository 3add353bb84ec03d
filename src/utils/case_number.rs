// utils/case_number.rs
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// `CASE-YYYY-MM-NNNNNN`, the counter zero padded to at least six digits.
pub fn format_case_number(at: DateTime<Utc>, sequence: u64) -> String {
    format!("CASE-{:04}-{:02}-{:06}", at.year(), at.month(), sequence)
}

fn case_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^CASE-\d{4}-\d{2}-\d+$").expect("static regex"))
}

pub fn is_valid_case_number(value: &str) -> bool {
    case_number_regex().is_match(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_case_number() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(format_case_number(at, 42), "CASE-2024-03-000042");
        assert_eq!(format_case_number(at, 1_234_567), "CASE-2024-03-1234567");
    }

    #[test]
    fn test_is_valid_case_number() {
        assert!(is_valid_case_number("CASE-2024-03-000042"));
        assert!(is_valid_case_number("CASE-2024-12-1234567"));
        assert!(!is_valid_case_number("case-2024-03-000042"));
        assert!(!is_valid_case_number("CASE-24-03-1"));
        assert!(!is_valid_case_number("CASE-2024-03-"));
    }
}
