//! World-Wide Identifier derivation.
//!
//! For this array family the WWID is always the fixed NAA prefix followed by
//! the volume's 24-character serial, lowercased. It is the only identifier
//! that survives both array-side session churn and kernel path rediscovery,
//! so every local device lookup in `devresolver` goes through it.

/// NAA prefix for this array family's volumes.
pub const WWID_PREFIX: &str = "3624a9370";

/// Total WWID length: 9-char prefix + 24-char serial (bit-exact per spec.md §8 boundary tests).
pub const WWID_LEN: usize = WWID_PREFIX.len() + 24;

/// Derives a WWID from a volume serial. The serial is expected to already be
/// 24 hex characters; it is lowercased defensively since the array has been
/// observed to return it mixed-case in older API versions.
pub fn serial_to_wwid(serial: &str) -> String {
    format!("{WWID_PREFIX}{}", serial.to_ascii_lowercase())
}

/// True if `s` is a syntactically valid WWID for this array family: 32
/// lowercase hex chars, `3624a9370` prefixed.
pub fn is_valid_wwid(s: &str) -> bool {
    s.len() == WWID_LEN
        && s.starts_with(WWID_PREFIX)
        && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_expected_wwid() {
        let serial = "abcdef0123456789abcdef01";
        let wwid = serial_to_wwid(serial);
        assert_eq!(wwid, "3624a9370abcdef0123456789abcdef01");
        assert_eq!(wwid.len(), WWID_LEN);
        assert!(is_valid_wwid(&wwid));
    }

    #[test]
    fn lowercases_mixed_case_serial() {
        let wwid = serial_to_wwid("ABCDEF0123456789ABCDEF01");
        assert!(is_valid_wwid(&wwid));
        assert_eq!(wwid, wwid.to_ascii_lowercase());
    }

    #[test]
    fn rejects_short_or_wrong_prefix() {
        assert!(!is_valid_wwid("3624a9370abc"));
        assert!(!is_valid_wwid(&"f".repeat(WWID_LEN)));
    }

    #[test]
    fn property_any_24_char_hex_serial_round_trips() {
        let hexdigits = "0123456789abcdef";
        for i in 0..hexdigits.len() {
            let c = hexdigits.as_bytes()[i] as char;
            let serial: String = std::iter::repeat(c).take(24).collect();
            let wwid = serial_to_wwid(&serial);
            assert!(is_valid_wwid(&wwid));
            assert_eq!(&wwid[WWID_PREFIX.len()..], serial);
        }
    }
}
