use std::fmt::Write as _;

/// Renders a result blob as text for logging. Invalid UTF-8 is replaced and
/// trailing NUL padding is dropped.
pub fn blob_text(blob: &[u8]) -> String {
    String::from_utf8_lossy(blob)
        .trim_end_matches('\0')
        .to_string()
}

/// Lowercase hex without separators.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parses a hex word as printed by reference encoders: an optional `0x`
/// prefix followed by up to eight digits.
pub fn parse_hex_word(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

pub(crate) fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_text_is_lossy() {
        assert_eq!(blob_text(b"x1=0x13\0\0"), "x1=0x13");
        assert_eq!(blob_text(&[0x61, 0xff, 0x62]), "a\u{fffd}b");
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x13]), "00ab13");
        assert_eq!(parse_hex_word("0x00000013"), Some(0x13));
        assert_eq!(parse_hex_word("FFFFFFFF"), Some(u32::MAX));
        assert_eq!(parse_hex_word("0x123456789"), None);
        assert_eq!(parse_hex_word("0x"), None);
        assert_eq!(parse_hex_word("zz"), None);
    }
}
