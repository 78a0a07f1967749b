use std::borrow::Cow;

use cesu8_str::java as cesu8_java;

/// Decodes a class-file (modified UTF-8) string.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let java_str = cesu8_java::JavaStr::from_java_cesu8(bytes).ok()?;
    Some(match cesu8_java::from_java_cesu8(java_str) {
        Cow::Borrowed(s) => s.to_owned(),
        Cow::Owned(s) => s,
    })
}

pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    cesu8_java::from_utf8(s).as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nul_and_supplementary() {
        let text = "a\0b\u{1F600}";
        let encoded = encode_modified_utf8(text);
        // NUL is the two-byte form, the emoji is a surrogate pair of 3+3 bytes
        assert_eq!(&encoded[1..3], &[0xC0, 0x80]);
        assert_eq!(encoded.len(), 1 + 2 + 1 + 6);
        assert_eq!(decode_modified_utf8(&encoded).as_deref(), Some(text));
    }

    #[test]
    fn test_invalid() {
        assert!(decode_modified_utf8(&[0xFF, 0x00]).is_none());
    }
}
