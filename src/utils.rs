/// Normalize a phone number to its canonical form: formatting characters are
/// stripped and a leading `+` is preserved.  `+855 10-20 21 01` and
/// `+855 (10) 202101` normalize to the same msisdn.
pub fn normalize_msisdn(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if trimmed.starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting() {
        assert_eq!(normalize_msisdn("+855 10-20 21 01"), "+85510202101");
        assert_eq!(normalize_msisdn("+855 (10) 202101"), "+85510202101");
    }

    #[test]
    fn keeps_short_codes_without_plus() {
        assert_eq!(normalize_msisdn("345"), "345");
    }

    #[test]
    fn preserves_leading_zero_numbers() {
        assert_eq!(normalize_msisdn("012 345 678"), "012345678");
    }
}
