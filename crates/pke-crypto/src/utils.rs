//! Constant-time comparison helpers for key material and identifiers.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices without leaking where they first differ.
///
/// ```rust
/// use pke_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(&[0u8; 65], &[0u8; 65]));
/// assert!(!constant_time_compare(&[0u8; 65], &[1u8; 65]));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// Case-insensitive comparison of `0x`-prefixed or bare hex addresses.
pub fn addresses_match(a: &str, b: &str) -> bool {
    let a = a.trim().trim_start_matches("0x").trim_start_matches("0X");
    let b = b.trim().trim_start_matches("0x").trim_start_matches("0X");
    a.len() == b.len()
        && constant_time_compare(a.to_ascii_lowercase().as_bytes(), b.to_ascii_lowercase().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"hello world", b"hello world"));
        assert!(!constant_time_compare(b"hello world", b"hello worlD"));
        assert!(!constant_time_compare(b"hello", b"hello world"));
    }

    #[test]
    fn test_addresses_match_ignores_case_and_prefix() {
        assert!(addresses_match(
            "0xAbCdEf0000000000000000000000000000000001",
            "abcdef0000000000000000000000000000000001"
        ));
        assert!(!addresses_match(
            "0xabcdef0000000000000000000000000000000001",
            "0xabcdef0000000000000000000000000000000002"
        ));
        assert!(!addresses_match("0xabc", "0xabcd"));
    }
}
