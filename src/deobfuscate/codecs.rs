//! Native equivalents of the PHP string-decode functions malware chains together.
//!
//! Every decoder works on raw bytes: a chain such as
//! `gzinflate(base64_decode(...))` passes binary data between steps, so text
//! conversion only happens once the whole chain has been applied.

use crate::types::DecodeError;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::io::Read;

/// Maximum size for decoded output (to prevent memory exhaustion)
pub const MAX_DECODED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// PHP's non-strict `base64_decode` accepts missing padding and stray bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// The decode functions a chain may be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeFn {
    Base64Decode,
    Gzinflate,
    Gzuncompress,
    StrRot13,
    Strrev,
    Rawurldecode,
    Urldecode,
    ConvertUudecode,
}

impl DecodeFn {
    /// Every supported function, in the order used to build chain regexes.
    pub const ALL: [DecodeFn; 8] = [
        DecodeFn::StrRot13,
        DecodeFn::Gzinflate,
        DecodeFn::Base64Decode,
        DecodeFn::Rawurldecode,
        DecodeFn::Gzuncompress,
        DecodeFn::Strrev,
        DecodeFn::ConvertUudecode,
        DecodeFn::Urldecode,
    ];

    /// PHP function name.
    pub fn name(self) -> &'static str {
        match self {
            DecodeFn::Base64Decode => "base64_decode",
            DecodeFn::Gzinflate => "gzinflate",
            DecodeFn::Gzuncompress => "gzuncompress",
            DecodeFn::StrRot13 => "str_rot13",
            DecodeFn::Strrev => "strrev",
            DecodeFn::Rawurldecode => "rawurldecode",
            DecodeFn::Urldecode => "urldecode",
            DecodeFn::ConvertUudecode => "convert_uudecode",
        }
    }

    /// Look up a function by name. PHP function names are case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    /// Apply the decode operation.
    pub fn apply(self, input: &[u8]) -> Result<Vec<u8>, DecodeError> {
        match self {
            DecodeFn::Base64Decode => base64_decode(input),
            DecodeFn::Gzinflate => gzinflate(input),
            DecodeFn::Gzuncompress => gzuncompress(input),
            DecodeFn::StrRot13 => Ok(str_rot13(input)),
            DecodeFn::Strrev => Ok(strrev(input)),
            DecodeFn::Rawurldecode => Ok(rawurldecode(input)),
            DecodeFn::Urldecode => Ok(urldecode(input)),
            DecodeFn::ConvertUudecode => convert_uudecode(input),
        }
    }
}

/// Decode base64 the way PHP does without `$strict`: characters outside the
/// alphabet are skipped and padding is optional.
pub fn base64_decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut filtered: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        .collect();

    // A single dangling sextet carries no complete byte
    if filtered.len() % 4 == 1 {
        filtered.pop();
    }

    let decoded = LENIENT_BASE64
        .decode(&filtered)
        .map_err(|_| DecodeError::InvalidBase64)?;
    non_empty(decoded)
}

/// Strict decode used to test whether a literal is really base64 text:
/// it must round-trip through encode unchanged.
pub fn base64_roundtrip(input: &str) -> Option<Vec<u8>> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(input).ok()?;
    if base64::engine::general_purpose::STANDARD.encode(&decoded) == input {
        Some(decoded)
    } else {
        None
    }
}

/// Raw DEFLATE stream (`gzinflate`).
pub fn gzinflate(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    read_capped(DeflateDecoder::new(input))
}

/// zlib-wrapped DEFLATE stream (`gzuncompress`).
pub fn gzuncompress(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    read_capped(ZlibDecoder::new(input))
}

fn read_capped<R: Read>(reader: R) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .take(MAX_DECODED_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| DecodeError::InvalidDeflate)?;
    if out.len() > MAX_DECODED_SIZE {
        return Err(DecodeError::OutputTooLarge(MAX_DECODED_SIZE));
    }
    non_empty(out)
}

pub fn str_rot13(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .map(|&b| match b {
            b'a'..=b'z' => (b - b'a' + 13) % 26 + b'a',
            b'A'..=b'Z' => (b - b'A' + 13) % 26 + b'A',
            _ => b,
        })
        .collect()
}

pub fn strrev(input: &[u8]) -> Vec<u8> {
    input.iter().rev().copied().collect()
}

pub fn rawurldecode(input: &[u8]) -> Vec<u8> {
    urlencoding::decode_binary(input).into_owned()
}

/// Like `rawurldecode`, but `+` also means space.
pub fn urldecode(input: &[u8]) -> Vec<u8> {
    let plus_as_space: Vec<u8> = input
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();
    urlencoding::decode_binary(&plus_as_space).into_owned()
}

/// Decode PHP's `convert_uuencode` framing: one length character per line,
/// then groups of four characters carrying three bytes.
pub fn convert_uudecode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();

    for line in input.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some((&len_char, body)) = line.split_first() else {
            continue;
        };
        let len = (len_char.wrapping_sub(b' ') & 0x3f) as usize;
        if len == 0 {
            break;
        }

        let mut decoded = Vec::with_capacity(len + 3);
        for group in body.chunks(4) {
            if group.len() < 4 {
                return Err(DecodeError::InvalidUuencode);
            }
            let v: Vec<u8> = group.iter().map(|c| c.wrapping_sub(b' ') & 0x3f).collect();
            decoded.push((v[0] << 2) | (v[1] >> 4));
            decoded.push((v[1] << 4) | (v[2] >> 2));
            decoded.push((v[2] << 6) | v[3]);
        }
        if decoded.len() < len {
            return Err(DecodeError::InvalidUuencode);
        }
        decoded.truncate(len);
        out.extend_from_slice(&decoded);

        if out.len() > MAX_DECODED_SIZE {
            return Err(DecodeError::OutputTooLarge(MAX_DECODED_SIZE));
        }
    }

    non_empty(out)
}

/// Replace every byte of `from` with the byte at the same position in `to`,
/// like PHP's three-argument `strtr`. Extra characters in the longer table
/// are ignored.
pub fn strtr(input: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut table: [u8; 256] = std::array::from_fn(|i| i as u8);
    for (&f, &t) in from.iter().zip(to.iter()) {
        table[f as usize] = t;
    }
    input.iter().map(|&b| table[b as usize]).collect()
}

/// Convert decoded bytes back into text: UTF-8 when valid, otherwise one
/// char per byte so that no byte is lost.
pub fn bytes_to_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => e.into_bytes().into_iter().map(|b| b as char).collect(),
    }
}

fn non_empty(bytes: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
    if bytes.is_empty() {
        Err(DecodeError::Empty)
    } else {
        Ok(bytes)
    }
}
