//! Generic unwinding of nested decode-function calls.
//!
//! `base64_decode(gzinflate(str_rot13('...')))` is evaluated without running
//! PHP: the call syntax is parsed, the innermost string literal is decoded
//! with the native equivalents from [`codecs`](super::codecs), and the whole
//! call expression is replaced by the resulting string literal.

use super::calc::calc;
use super::codecs::{bytes_to_text, DecodeFn};
use crate::types::DecodeError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::trace;

/// Hard cap on substitutions per call to [`ChainDecoder::decode`].
pub const MAX_CHAIN_ITERATIONS: usize = 64;

/// Rounds of escape normalization before giving up on reaching a fixpoint.
const MAX_NORMALIZE_ROUNDS: usize = 16;

static DEC_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(0\d{2})").expect("valid escape regex"));

static OCT_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(1\d{2})").expect("valid escape regex"));

static HEX_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\x([A-Fa-f0-9]{2})").expect("valid escape regex"));

static CHR_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(mb_chr|chr)\s*\(((?:[\s()]*[\d.]+[\s()]*[*/+-]?[\s()]*)+)\)")
        .expect("valid chr regex")
});

static LITERAL_CONCAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]\s*\.\s*['"]"#).expect("valid concat regex"));

static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static CHAIN_HEAD: Lazy<Regex> = Lazy::new(|| {
    let names: Vec<String> = DecodeFn::ALL
        .iter()
        .map(|f| regex::escape(f.name()))
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})\s*\(", names.join("|"))).expect("valid chain regex")
});

static INNER_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\(\s*["']([^'"]*)["']\s*\)"#).expect("valid literal regex"));

/// Rewrite escapes and concatenations that only exist to hide literal text.
///
/// Handles `\0NN` (read as hex), `\1NN` (octal), `\xHH`, `chr(N)` with
/// simple arithmetic, `'ev'.'al'` joins and whitespace runs. The pass is
/// repeated until the text stops changing, so applying it twice is a no-op.
pub fn normalize_literals(code: &str) -> String {
    let mut current = code.to_string();
    for _ in 0..MAX_NORMALIZE_ROUNDS {
        let next = normalize_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn normalize_once(code: &str) -> String {
    let text = DEC_ESCAPE.replace_all(code, |caps: &Captures| {
        let value = u32::from_str_radix(&caps[1], 16).unwrap_or(0);
        byte_char(value).to_string()
    });

    let text = OCT_ESCAPE.replace_all(&text, |caps: &Captures| {
        let digits: String = caps[1].chars().filter(|c| ('0'..='7').contains(c)).collect();
        let value = u32::from_str_radix(&digits, 8).unwrap_or(0);
        byte_char(value).to_string()
    });

    let text = HEX_ESCAPE.replace_all(&text, |caps: &Captures| {
        let value = u32::from_str_radix(&caps[1], 16).unwrap_or(0);
        byte_char(value).to_string()
    });

    let text = CHR_CALL.replace_all(&text, |caps: &Captures| {
        let expr: String = caps[2]
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')')
            .collect();
        let code_point = calc(&expr).parse::<f64>().map(|v| v as i64).unwrap_or(0);
        let ch = if caps[1].eq_ignore_ascii_case("mb_chr") {
            u32::try_from(code_point).ok().and_then(char::from_u32)
        } else {
            Some(byte_char(code_point.rem_euclid(256) as u32))
        };
        match ch {
            Some(ch) => format!("'{}'", ch),
            None => caps[0].to_string(),
        }
    });

    let text = LITERAL_CONCAT.replace_all(&text, "");
    WHITESPACE_RUN.replace_all(&text, " ").into_owned()
}

fn byte_char(value: u32) -> char {
    (value & 0xff) as u8 as char
}

/// Find the `)` closing the `(` at byte offset `open`, skipping over quoted
/// strings. Scanning stops after `limit` bytes.
pub fn find_closing_paren(text: &str, open: usize, limit: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }

    let end = bytes.len().min(open.saturating_add(limit));
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;

    while i < end {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }

    None
}

/// Evaluates nested decode-function calls found in PHP source.
#[derive(Debug, Clone)]
pub struct ChainDecoder {
    max_iterations: usize,
}

impl ChainDecoder {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }

    /// Normalize literals and substitute decode chains until nothing changes,
    /// a decode fails, or the iteration cap is reached.
    pub fn decode(&self, code: &str) -> String {
        let mut current = normalize_literals(code);

        for _ in 0..self.max_iterations {
            match self.step(&current) {
                Ok(next) => current = normalize_literals(&next),
                Err(e) => {
                    trace!("Chain decode stopped: {}", e);
                    break;
                }
            }
        }

        current
    }

    /// Replace the first decode chain in `code` with its decoded literal.
    pub fn step(&self, code: &str) -> Result<String, DecodeError> {
        let head = CHAIN_HEAD
            .find(code)
            .ok_or(DecodeError::PatternMiss("decode call"))?;
        let open = head.end() - 1;
        let close = find_closing_paren(code, open, usize::MAX)
            .ok_or(DecodeError::PatternMiss("closing parenthesis"))?;
        let expression = &code[head.start()..=close];

        let literal = INNER_LITERAL
            .captures(expression)
            .ok_or(DecodeError::PatternMiss("string literal"))?;
        let literal_start = literal.get(0).map(|m| m.start()).unwrap_or(0);

        // Only calls wrapping the literal take part, innermost applied first
        let calls: Vec<DecodeFn> = expression[..literal_start]
            .split('(')
            .filter_map(DecodeFn::from_name)
            .collect();

        let mut value = literal[1].as_bytes().to_vec();
        for func in calls.iter().rev() {
            value = func.apply(&value)?;
        }

        let decoded = bytes_to_text(value).replace('"', "'");
        trace!("Decoded chain {:?} into {} bytes", calls, decoded.len());

        let mut result = String::with_capacity(code.len());
        result.push_str(&code[..head.start()]);
        result.push('"');
        result.push_str(&decoded);
        result.push('"');
        result.push_str(&code[close + 1..]);
        Ok(result)
    }
}

impl Default for ChainDecoder {
    fn default() -> Self {
        Self::new(MAX_CHAIN_ITERATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_single_layer() {
        let decoder = ChainDecoder::default();
        let out = decoder.decode("<?php eval(base64_decode('ZWNobyAxOw==')); ?>");
        assert_eq!(out, r#"<?php eval("echo 1;"); ?>"#);
    }

    #[test]
    fn test_nested_chain() {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"system('id');").unwrap();
        let payload = STANDARD.encode(enc.finish().unwrap());
        let code = format!("<?php eval(gzinflate(base64_decode(\"{}\"))); ?>", payload);

        let out = ChainDecoder::default().decode(&code);
        assert!(out.contains("system('id');"));
        assert!(!out.contains("gzinflate"));
    }

    #[test]
    fn test_rot13_strrev_chain() {
        let out = ChainDecoder::default().decode("$f = str_rot13(strrev('ynir'));");
        assert_eq!(out, r#"$f = "eval";"#);
    }

    #[test]
    fn test_failure_leaves_text_unchanged() {
        let code = "$x = gzinflate('not compressed');";
        assert_eq!(ChainDecoder::default().decode(code), code);
    }

    #[test]
    fn test_variable_argument_stops() {
        let code = "$x = base64_decode($payload);";
        assert_eq!(ChainDecoder::default().decode(code), code);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let decoder = ChainDecoder::default();
        let code = r#"<?php $a = "\x65\x76".'al'; eval(base64_decode('ZWNobyAxOw==')); echo chr(50+51); ?>"#;
        let once = decoder.decode(code);
        let twice = decoder.decode(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_iteration_cap() {
        let decoder = ChainDecoder::new(1);
        let code = "strrev('a'); strrev('b');";
        assert_eq!(decoder.decode(code), r#""a"; strrev('b');"#);
    }

    #[test]
    fn test_normalize_escapes() {
        assert_eq!(normalize_literals(r#""\x65\x76\x61\x6c""#), r#""eval""#);
        // \1NN is octal: \145 = 'e'
        assert_eq!(normalize_literals(r"'\145'"), "'e'");
        // \0NN is read as hex digits: \041 = 'A'
        assert_eq!(normalize_literals(r"'\041'"), "'A'");
    }

    #[test]
    fn test_normalize_chr_and_concat() {
        assert_eq!(normalize_literals("chr(101).chr(118)"), "'ev'");
        assert_eq!(normalize_literals("chr(50+51)"), "'e'");
        assert_eq!(
            normalize_literals(r#"$a='ev'.'al'.'("ls")';"#),
            r#"$a='eval("ls")';"#
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        let once = normalize_literals(r"'\x5cx41'   .  'b'");
        assert_eq!(normalize_literals(&once), once);
    }

    #[test]
    fn test_find_closing_paren() {
        let text = "f(a(b), ')', \"(\")x";
        assert_eq!(find_closing_paren(text, 1, usize::MAX), Some(text.len() - 2));
        assert_eq!(find_closing_paren("f(a", 1, usize::MAX), None);
        assert_eq!(find_closing_paren("f(aaaa)", 1, 3), None);
    }
}
