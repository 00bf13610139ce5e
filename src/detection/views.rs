//! The four views a file is matched on.

use crate::deobfuscate::Deobfuscator;
use crate::types::{ContentView, ViewKind};
use tracing::trace;

/// Raw, stripped, deobfuscated and decoded text of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileViews {
    raw: ContentView,
    stripped: ContentView,
    deobfuscated: ContentView,
    decoded: ContentView,
}

impl FileViews {
    /// Derive all views of `raw`.
    ///
    /// Inputs longer than `max_deobfuscate_bytes` are not deobfuscated:
    /// their deobfuscated and decoded views are copies of the raw text.
    pub fn build(raw: &str, deobfuscator: &Deobfuscator, max_deobfuscate_bytes: usize) -> Self {
        let stripped = strip_php(raw);

        let (deobfuscated, decoded) = if raw.len() > max_deobfuscate_bytes {
            trace!(
                "Skipping deobfuscation of {} bytes (limit {})",
                raw.len(),
                max_deobfuscate_bytes
            );
            (raw.to_string(), raw.to_string())
        } else {
            let deobfuscated = deobfuscator.deobfuscate(raw);
            let decoded = deobfuscator.decode(&deobfuscated);
            (deobfuscated, decoded)
        };

        Self {
            raw: ContentView::new(ViewKind::Raw, raw.to_string()),
            stripped: ContentView::new(ViewKind::Stripped, stripped),
            deobfuscated: ContentView::new(ViewKind::Deobfuscated, deobfuscated),
            decoded: ContentView::new(ViewKind::Decoded, decoded),
        }
    }

    pub fn get(&self, kind: ViewKind) -> &ContentView {
        match kind {
            ViewKind::Raw => &self.raw,
            ViewKind::Stripped => &self.stripped,
            ViewKind::Deobfuscated => &self.deobfuscated,
            ViewKind::Decoded => &self.decoded,
        }
    }

    /// All views in derivation order.
    pub fn iter(&self) -> impl Iterator<Item = &ContentView> {
        [&self.raw, &self.stripped, &self.deobfuscated, &self.decoded].into_iter()
    }
}

/// Remove comments and collapse whitespace inside PHP blocks.
///
/// Text outside `<? ... ?>` is copied as is. String literals, backtick
/// commands and heredoc/nowdoc bodies are kept verbatim.
pub fn strip_php(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_php = false;
    let mut pending_space = false;
    let mut i = 0;

    while i < bytes.len() {
        let rest = &bytes[i..];

        if !in_php {
            if rest.starts_with(b"<?") {
                let tag = if rest.len() >= 5 && rest[..5].eq_ignore_ascii_case(b"<?php") {
                    5
                } else if rest.starts_with(b"<?=") {
                    3
                } else {
                    2
                };
                out.extend_from_slice(&rest[..tag]);
                i += tag;
                in_php = true;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
            continue;
        }

        if rest.starts_with(b"?>") {
            flush_space(&mut out, &mut pending_space);
            out.extend_from_slice(b"?>");
            i += 2;
            in_php = false;
            continue;
        }

        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                flush_space(&mut out, &mut pending_space);
                let end = skip_quoted(bytes, i);
                out.extend_from_slice(&bytes[i..end]);
                i = end;
            }
            b'/' if rest.starts_with(b"//") => {
                i = skip_line_comment(bytes, i);
                pending_space = true;
            }
            b'#' if !rest.starts_with(b"#[") => {
                i = skip_line_comment(bytes, i);
                pending_space = true;
            }
            b'/' if rest.starts_with(b"/*") => {
                i = match find(bytes, i + 2, b"*/") {
                    Some(end) => end + 2,
                    None => bytes.len(),
                };
                pending_space = true;
            }
            b'<' if rest.starts_with(b"<<<") => {
                flush_space(&mut out, &mut pending_space);
                let end = heredoc_end(bytes, i).unwrap_or(i + 3);
                out.extend_from_slice(&bytes[i..end]);
                i = end;
            }
            b if b.is_ascii_whitespace() => {
                pending_space = true;
                i += 1;
            }
            b => {
                flush_space(&mut out, &mut pending_space);
                out.push(b);
                i += 1;
            }
        }
    }

    match String::from_utf8(out) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn flush_space(out: &mut Vec<u8>, pending: &mut bool) {
    if *pending && !out.is_empty() {
        out.push(b' ');
    }
    *pending = false;
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// End of a quoted literal starting at `start`, past the closing quote.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut j = start + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b if b == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

/// Single-line comments end at the newline or just before `?>`.
fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut j = start;
    while j < bytes.len() {
        if bytes[j] == b'\n' || bytes[j..].starts_with(b"?>") {
            return j;
        }
        j += 1;
    }
    bytes.len()
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// End of the heredoc/nowdoc opened at `start`, past its closing label.
fn heredoc_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut j = start + 3;
    while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
        j += 1;
    }
    if j < bytes.len() && (bytes[j] == b'\'' || bytes[j] == b'"') {
        j += 1;
    }
    let label_start = j;
    while j < bytes.len() && is_ident(bytes[j]) {
        j += 1;
    }
    let label = &bytes[label_start..j];
    if label.is_empty() {
        return None;
    }

    let mut line = find(bytes, j, b"\n")? + 1;
    loop {
        let mut k = line;
        while k < bytes.len() && (bytes[k] == b' ' || bytes[k] == b'\t') {
            k += 1;
        }
        if bytes[k..].starts_with(label) {
            let end = k + label.len();
            if end >= bytes.len() || !is_ident(bytes[end]) {
                return Some(end);
            }
        }
        line = find(bytes, line, b"\n")? + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments_and_whitespace() {
        let code = "<?php\n// comment\n$a   =  1; # another\n/* block\n comment */ echo $a;\n?>";
        assert_eq!(strip_php(code), "<?php $a = 1; echo $a; ?>");
    }

    #[test]
    fn test_strip_keeps_strings() {
        let code = "<?php $a = '// not a comment';  $b = \"a  /* b */\"; ?>";
        assert_eq!(
            strip_php(code),
            "<?php $a = '// not a comment'; $b = \"a  /* b */\"; ?>"
        );
    }

    #[test]
    fn test_strip_keeps_html() {
        let code = "<p>  keep   me </p>\n<?php   echo 1;   ?>\n<p>  too </p>";
        assert_eq!(
            strip_php(code),
            "<p>  keep   me </p>\n<?php echo 1; ?>\n<p>  too </p>"
        );
    }

    #[test]
    fn test_strip_heredoc_verbatim() {
        let code = "<?php $a = <<<EOT\n  # not   a comment\nEOT;\n  echo $a; ?>";
        assert_eq!(
            strip_php(code),
            "<?php $a = <<<EOT\n  # not   a comment\nEOT; echo $a; ?>"
        );
    }

    #[test]
    fn test_line_comment_ends_at_close_tag() {
        assert_eq!(strip_php("<?php echo 1; // x ?>tail"), "<?php echo 1; ?>tail");
    }

    #[test]
    fn test_attribute_is_not_comment() {
        assert_eq!(
            strip_php("<?php #[Pure] function f() {} ?>"),
            "<?php #[Pure] function f() {} ?>"
        );
    }

    #[test]
    fn test_views_skip_deobfuscation_when_large() {
        let deob = Deobfuscator::new();
        let code = "<?php eval(base64_decode('ZWNobyAxOw==')); ?>";
        let views = FileViews::build(code, &deob, 8);
        assert_eq!(views.get(ViewKind::Deobfuscated).text(), code);
        assert_eq!(views.get(ViewKind::Decoded).text(), code);

        let views = FileViews::build(code, &deob, 1024);
        assert!(views.get(ViewKind::Decoded).text().contains("echo 1;"));
    }

    #[test]
    fn test_views_iterate_in_derivation_order() {
        let views = FileViews::build("<?php echo 1; ?>", &Deobfuscator::new(), 1024);
        let kinds: Vec<ViewKind> = views.iter().map(|v| v.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ViewKind::Raw,
                ViewKind::Stripped,
                ViewKind::Deobfuscated,
                ViewKind::Decoded
            ]
        );
    }

    #[test]
    fn test_views_deterministic() {
        let deob = Deobfuscator::new();
        let code = "<?php /* x */ $f = str_rot13('flfgrz'); $f($_GET['c']); ?>";
        assert_eq!(
            FileViews::build(code, &deob, 1 << 20),
            FileViews::build(code, &deob, 1 << 20)
        );
    }
}
