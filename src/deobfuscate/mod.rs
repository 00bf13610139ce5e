//! PHP deobfuscation.
//!
//! This module turns obfuscated PHP back into something pattern matching can
//! see through:
//! - Known obfuscation families (globals tables, eval chains, ALS, LockIt,
//!   FOPO, ByteRun, urldecoded `$GLOBALS` names)
//! - Arbitrary nested decode-function calls (`gzinflate(base64_decode(..))`)
//! - Escaped and concatenated string literals (`"\x65v"."al"`, `chr(101)`)

pub mod calc;
pub mod chain;
pub mod codecs;
pub mod families;

pub use chain::{normalize_literals, ChainDecoder};
pub use codecs::DecodeFn;
pub use families::{classify, FamilyTag, SourceContext};

use families::strip_empty_concat;
use tracing::{debug, trace};

/// Reverses obfuscation families and unwinds decode chains.
///
/// Holds no per-file state, so one instance can be shared across threads.
#[derive(Debug, Clone, Default)]
pub struct Deobfuscator {
    chain: ChainDecoder,
}

impl Deobfuscator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reverse every obfuscation family detected in `code`.
    ///
    /// Families are classified and reversed on the source with only empty
    /// concatenations removed, so offset-based loaders index the bytes they
    /// were built against. When no family is recognised there, the
    /// chain-decoded text is classified instead and, if a family fires,
    /// becomes the input to the handlers. Handler failures keep the previous
    /// text. Literal escapes and joins are folded in the returned text.
    pub fn deobfuscate(&self, code: &str) -> String {
        let full_code = strip_empty_concat(code);

        let mut families = classify(&full_code);
        let mut current = full_code.clone();

        if families.is_empty() {
            let decoded = self.decode(&full_code);
            families = classify(&decoded);
            if !families.is_empty() {
                trace!("Families found only after chain decoding");
                current = decoded;
            }
        }

        if families.is_empty() {
            return normalize_literals(&current);
        }

        let ctx = SourceContext {
            full_code: &full_code,
        };

        for family in families {
            match (family.handler())(&current, &ctx) {
                Ok(next) => {
                    debug!("Reversed {} obfuscation", family.name());
                    current = next;
                }
                Err(e) => trace!("{} handler skipped: {}", family.name(), e),
            }
        }

        normalize_literals(&current)
    }

    /// Chain-decode each PHP block of `code`, leaving text outside
    /// `<? ... ?>` untouched. Text without an open tag is decoded whole.
    pub fn decode(&self, code: &str) -> String {
        let blocks = php_blocks(code);
        if blocks.is_empty() {
            return self.chain.decode(code);
        }

        let mut out = String::with_capacity(code.len());
        let mut last = 0;
        for (start, end) in blocks {
            out.push_str(&code[last..start]);
            out.push_str(&self.chain.decode(&code[start..end]));
            last = end;
        }
        out.push_str(&code[last..]);
        out
    }
}

/// Byte ranges of `<? ... ?>` blocks; an unterminated block runs to the end.
pub fn php_blocks(code: &str) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(rel) = code[pos..].find("<?") {
        let start = pos + rel;
        let end = match code[start + 2..].find("?>") {
            Some(close) => start + 2 + close + 2,
            None => code.len(),
        };
        blocks.push((start, end));
        pos = end;
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_php_blocks() {
        let code = "<html><?php echo 1; ?><p>x</p><? echo 2;";
        let blocks = php_blocks(code);
        assert_eq!(blocks.len(), 2);
        assert_eq!(&code[blocks[0].0..blocks[0].1], "<?php echo 1; ?>");
        assert_eq!(&code[blocks[1].0..blocks[1].1], "<? echo 2;");
        assert!(php_blocks("plain text").is_empty());
    }

    #[test]
    fn test_decode_leaves_html_alone() {
        let deob = Deobfuscator::new();
        let code = "<p>a  b</p>\n<?php   eval(base64_decode('ZWNobyAxOw==')); ?>\n<p>c  d</p>";
        let out = deob.decode(code);
        assert!(out.starts_with("<p>a  b</p>\n"));
        assert!(out.ends_with("\n<p>c  d</p>"));
        assert!(out.contains(r#"eval("echo 1;")"#));
    }

    #[test]
    fn test_deobfuscate_eval_family() {
        let deob = Deobfuscator::new();
        let out = deob.deobfuscate("<?php eval(base64_decode('ZWNobyAxOw==')); ?>");
        assert_eq!(out, "<?php echo 1; ?>");
    }

    #[test]
    fn test_deobfuscate_concat_normalization() {
        let deob = Deobfuscator::new();
        let out = deob.deobfuscate(r#"<?php $a='ev'.'al'.'("ls")'; ?>"#);
        assert!(out.contains(r#"$a='eval("ls")'"#), "got: {}", out);
    }

    #[test]
    fn test_deobfuscate_benign_passthrough() {
        let deob = Deobfuscator::new();
        let code = "<?php echo 'hello'; ?>";
        assert_eq!(deob.deobfuscate(code), code);
    }

    #[test]
    fn test_deobfuscate_is_deterministic() {
        let deob = Deobfuscator::new();
        let code = "<?php $x = str_rot13('riny'); $y = base64_decode($z); ?>";
        assert_eq!(deob.deobfuscate(code), deob.deobfuscate(code));
        assert_eq!(deob.decode(code), deob.decode(code));
    }
}
