// utils/phone.rs
use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use validator::ValidationError;

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9][0-9 \-]*$").expect("static regex"))
}

/// Loose phone check: optional leading `+`, digits separated by spaces or
/// hyphens, at least ten digits overall.
pub fn is_valid_phone(phone: &str) -> bool {
    let phone = phone.trim();
    if !phone_regex().is_match(phone) {
        return false;
    }
    phone.chars().filter(|c| c.is_ascii_digit()).count() >= 10
}

pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    if is_valid_phone(phone) {
        return Ok(());
    }
    let mut error = ValidationError::new("invalid_phone");
    error.message = Some(Cow::from(
        "Phone number must contain at least 10 digits (e.g., +1 555-123-4567)",
    ));
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_loose_formats() {
        assert!(is_valid_phone("+1 555-123-4567"));
        assert!(is_valid_phone("08012345678"));
        assert!(is_valid_phone("+234 801 234 5678"));
    }

    #[test]
    fn rejects_short_or_garbage() {
        assert!(!is_valid_phone("12345"));
        assert!(!is_valid_phone("555-CALL-NOW"));
        assert!(!is_valid_phone("++15551234567"));
        assert!(!is_valid_phone(""));
    }
}
