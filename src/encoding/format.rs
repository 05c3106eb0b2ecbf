//! Human-readable rendering of raw key and value bytes for logs and debug
//! output.

use itertools::Itertools as _;

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as an escaped ASCII string.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_bytes_pass_through() {
        assert_eq!(Raw::bytes(b"abc"), "\"abc\"");
    }

    #[test]
    fn test_non_printable_bytes_are_escaped() {
        assert_eq!(Raw::bytes(&[0x00, 0xff]), "\"\\x00\\xff\"");
        assert_eq!(Raw::bytes(b"a\nb"), "\"a\\nb\"");
    }
}
