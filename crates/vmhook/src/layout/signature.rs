//! Wildcard byte signatures (`"48 8D 0D ?? ?? ?? ??"`) and scanning.

use memchr::memchr_iter;

use crate::error::{Error, Result};

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16).map_err(|e| {
            Error::InvalidSignature(format!("Invalid signature token '{}': {}", token, e))
        })?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidSignature("Signature pattern is empty".to_string()));
    }
    if bytes.iter().all(Option::is_none) {
        return Err(Error::InvalidSignature(
            "Signature pattern has no fixed bytes".to_string(),
        ));
    }

    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{:02X}", value),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Offset of the first match of `pattern` in `haystack`.
///
/// Candidates are seeded with `memchr` on the first fixed byte, so leading
/// wildcards are allowed.
pub fn find_pattern(haystack: &[u8], pattern: &[Option<u8>]) -> Option<usize> {
    let (lead, lead_byte) = pattern
        .iter()
        .enumerate()
        .find_map(|(i, b)| b.map(|v| (i, v)))?;

    if haystack.len() < pattern.len() {
        return None;
    }

    memchr_iter(lead_byte, haystack)
        .filter_map(|hit| hit.checked_sub(lead))
        .filter(|start| start + pattern.len() <= haystack.len())
        .find(|&start| {
            pattern
                .iter()
                .zip(&haystack[start..start + pattern.len()])
                .all(|(want, have)| want.is_none_or(|w| w == *have))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let bytes = parse_pattern("48 8D 0D ?? ?? ?? ??").unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], Some(0x48));
        assert_eq!(bytes[1], Some(0x8D));
        assert_eq!(bytes[2], Some(0x0D));
        assert_eq!(bytes[3], None);
    }

    #[test]
    fn test_parse_pattern_rejects_garbage() {
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("?? ??").is_err());
        assert!(parse_pattern("48 ZZ").is_err());
    }

    #[test]
    fn test_format_pattern_roundtrip() {
        let pattern = vec![Some(0x48), Some(0x8D), Some(0x0D), None, Some(0xFF)];
        let formatted = format_pattern(&pattern);
        assert_eq!(formatted, "48 8D 0D ?? FF");
        let parsed = parse_pattern(&formatted).unwrap();
        assert_eq!(parsed, pattern);
    }

    #[test]
    fn test_find_pattern_skips_partial_matches() {
        let haystack = [0x55, 0x48, 0x89, 0x00, 0x55, 0x48, 0x89, 0xE5, 0x41];
        let pattern = parse_pattern("55 48 89 E5").unwrap();
        assert_eq!(find_pattern(&haystack, &pattern), Some(4));
    }

    #[test]
    fn test_find_pattern_leading_wildcard() {
        let haystack = [0x00, 0x11, 0x22, 0x33];
        let pattern = parse_pattern("?? 22 33").unwrap();
        assert_eq!(find_pattern(&haystack, &pattern), Some(1));
    }

    #[test]
    fn test_find_pattern_no_match() {
        let haystack = [0x00, 0x11, 0x22];
        let pattern = parse_pattern("22 33").unwrap();
        assert_eq!(find_pattern(&haystack, &pattern), None);
    }
}
