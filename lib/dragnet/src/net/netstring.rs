//! Netstring framing: `<ascii-decimal-length> ":" <body> ","`.
//!
//! The parser is incremental: feeding it a prefix of a valid frame yields
//! `Again`, so it can sit directly on top of a receive buffer that fills as
//! readiness events arrive. Frame bodies are opaque here; nothing in this
//! module interprets their interior.

use crate::net::support::{Cause, NetError, NetResult};

/// Location of a complete frame inside the input slice.
#[derive(Debug, PartialEq, Eq)]
pub struct Parsed {
    /// Offset of the first body byte.
    pub start: usize,
    /// Body length in bytes.
    pub len: usize,
    /// Total number of input bytes the frame occupies, trailing comma
    /// included.
    pub consumed: usize,
}

impl Parsed {
    #[inline]
    pub fn body<'a>(&self, src: &'a [u8]) -> &'a [u8] {
        &src[self.start..self.start + self.len]
    }
}

/// Parse one frame from the head of `src`. Frames whose declared length
/// exceeds `limit` are rejected before their bodies arrive, so a peer cannot
/// make the receiver buffer an oversized message.
pub fn parse(src: &[u8], limit: usize) -> NetResult<Parsed> {
    let mut len: usize = 0;

    for (i, &ch) in src.iter().enumerate() {
        match ch {
            b'0'..=b'9' => {
                len = len
                    .checked_mul(10)
                    .and_then(|v| v.checked_add((ch - b'0') as usize))
                    .ok_or(NetError::Fatal(Cause::TooLarge))?;
                if len > limit {
                    return Err(NetError::Fatal(Cause::TooLarge));
                }
            }
            b':' if i > 0 => {
                let start = i + 1;
                return match src.get(start + len) {
                    None => Err(NetError::Again),
                    Some(b',') => Ok(Parsed {
                        start,
                        len,
                        consumed: start + len + 1,
                    }),
                    Some(_) => Err(NetError::Fatal(Cause::Malformed)),
                };
            }
            _ => return Err(NetError::Fatal(Cause::Malformed)),
        }
    }

    Err(NetError::Again)
}

/// Append `body` to `out` as one netstring frame.
pub fn encode_into(out: &mut Vec<u8>, body: &[u8]) {
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(body);
    out.push(b',');
}

pub fn encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(body.len()));
    encode_into(&mut out, body);
    out
}

/// Size of the encoded frame for a body of `body_len` bytes.
pub fn encoded_len(body_len: usize) -> usize {
    let mut digits = 1;
    let mut v = body_len;
    while v >= 10 {
        digits += 1;
        v /= 10;
    }
    digits + 1 + body_len + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    #[test]
    fn test_parse_ok() {
        let parsed = parse(b"5:hello,", LIMIT).unwrap();
        assert_eq!(parsed.body(b"5:hello,"), b"hello");
        assert_eq!(parsed.consumed, 8);
    }

    #[test]
    fn test_parse_empty_body() {
        let parsed = parse(b"0:,", LIMIT).unwrap();
        assert_eq!(parsed.len, 0);
        assert_eq!(parsed.consumed, 3);
    }

    #[test]
    fn test_parse_trailing_bytes_ignored() {
        let src = b"3:abc,4:defg,";
        let parsed = parse(src, LIMIT).unwrap();
        assert_eq!(parsed.body(src), b"abc");
        let rest = &src[parsed.consumed..];
        let parsed = parse(rest, LIMIT).unwrap();
        assert_eq!(parsed.body(rest), b"defg");
    }

    #[test]
    fn test_parse_incomplete() {
        for prefix in ["", "5", "5:", "5:hel", "5:hello"] {
            assert_eq!(
                parse(prefix.as_bytes(), LIMIT),
                Err(NetError::Again),
                "prefix {:?}",
                prefix
            );
        }
    }

    #[test]
    fn test_parse_missing_length() {
        assert_eq!(
            parse(b":hello,", LIMIT),
            Err(NetError::Fatal(Cause::Malformed))
        );
    }

    #[test]
    fn test_parse_bad_terminator() {
        assert_eq!(
            parse(b"5:hello;", LIMIT),
            Err(NetError::Fatal(Cause::Malformed))
        );
    }

    #[test]
    fn test_parse_junk_in_length() {
        assert_eq!(
            parse(b"5x:hello,", LIMIT),
            Err(NetError::Fatal(Cause::Malformed))
        );
    }

    #[test]
    fn test_parse_over_limit_before_body() {
        // the length prefix alone must trigger the ceiling
        assert_eq!(
            parse(b"2000001:", 1 << 20),
            Err(NetError::Fatal(Cause::TooLarge))
        );
    }

    #[test]
    fn test_parse_length_overflow() {
        let huge = format!("{}9:x,", usize::MAX);
        assert_eq!(
            parse(huge.as_bytes(), usize::MAX),
            Err(NetError::Fatal(Cause::TooLarge))
        );
    }

    #[test]
    fn test_encode_roundtrip() {
        let frame = encode(b"key=value");
        assert_eq!(frame, b"9:key=value,");
        assert_eq!(frame.len(), encoded_len(9));
        let parsed = parse(&frame, LIMIT).unwrap();
        assert_eq!(parsed.body(&frame), b"key=value");
        assert_eq!(parsed.consumed, frame.len());
    }

    #[test]
    fn test_encoded_len_digits() {
        assert_eq!(encoded_len(0), 3);
        assert_eq!(encoded_len(9), 12);
        assert_eq!(encoded_len(10), 14);
    }
}
