//! Radix-prefixed unsigned integer parsing.

/// Parses an unsigned integer whose radix is chosen by its prefix.
///
/// `0x`/`0X` selects hexadecimal, a leading `0` selects octal and anything
/// else is decimal. Leading ASCII whitespace and a single `+` are skipped.
/// Parsing stops at the first character that is not a digit of the chosen
/// radix; the rest of the input is ignored. Returns `None` when no digit was
/// consumed or the value overflows `u64`.
#[must_use]
pub fn parse_auto_radix(input: &str) -> Option<u64> {
    let trimmed = input.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let (radix, digits) = match unsigned.as_bytes() {
        [b'0', b'x' | b'X', next, ..] if next.is_ascii_hexdigit() => (16, &unsigned[2..]),
        [b'0', ..] => (8, unsigned),
        _ => (10, unsigned),
    };

    let mut value: u64 = 0;
    let mut consumed = 0_usize;
    for ch in digits.chars() {
        let Some(digit) = ch.to_digit(radix) else {
            break;
        };
        value = value
            .checked_mul(u64::from(radix))?
            .checked_add(u64::from(digit))?;
        consumed += 1;
    }
    (consumed > 0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::parse_auto_radix;

    #[test]
    fn detects_radix_from_prefix() {
        assert_eq!(parse_auto_radix("42"), Some(42));
        assert_eq!(parse_auto_radix("0x2a"), Some(42));
        assert_eq!(parse_auto_radix("0X2A"), Some(42));
        assert_eq!(parse_auto_radix("052"), Some(42));
        assert_eq!(parse_auto_radix("0"), Some(0));
    }

    #[test]
    fn stops_at_first_foreign_character() {
        assert_eq!(parse_auto_radix("  +17abc"), Some(17));
        assert_eq!(parse_auto_radix("09"), Some(0));
        assert_eq!(parse_auto_radix("0x"), Some(0));
    }

    #[test]
    fn rejects_empty_signed_and_overflowing_input() {
        assert_eq!(parse_auto_radix(""), None);
        assert_eq!(parse_auto_radix("blah"), None);
        assert_eq!(parse_auto_radix("-1"), None);
        assert_eq!(parse_auto_radix("36893488147419103232"), None);
        assert_eq!(parse_auto_radix("18446744073709551615"), Some(u64::MAX));
    }
}
