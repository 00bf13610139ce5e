//! Per-file malware detection.
//!
//! [`DetectionEngine`] derives the views of a file, runs the active pattern
//! classes over them and maps every hit back to a line of the raw file.

pub mod catalog;
pub mod views;

pub use catalog::{PatternCatalog, DANGEROUS_FUNCTIONS, DEFAULT_FUNCTIONS, EXPLOITS, SIGNATURES};
pub use views::{strip_php, FileViews};

use crate::deobfuscate::codecs::bytes_to_text;
use crate::deobfuscate::Deobfuscator;
use crate::types::{Match, PatternKind, ScanConfig, ScanVerdict, ViewKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::trace;

/// Bytes inspected by [`looks_like_text`].
const TEXT_SNIFF_LEN: usize = 8 * 1024;

static HIDDEN_ICON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\.\w+\.ico").expect("valid favicon regex"));

/// Scans file content against the configured pattern catalog.
///
/// Immutable after construction; share it between workers behind an `Arc`.
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    config: ScanConfig,
    catalog: PatternCatalog,
    deobfuscator: Deobfuscator,
}

impl DetectionEngine {
    pub fn new(config: ScanConfig) -> Self {
        let catalog = PatternCatalog::new(&config);
        Self {
            config,
            catalog,
            deobfuscator: Deobfuscator::new(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    /// Scan one file given its name and raw bytes.
    ///
    /// A favicon-masquerade name is reported on its own, whatever the content.
    /// Content that does not look like text is not matched.
    pub fn scan(&self, file_name: &str, content: &[u8]) -> ScanVerdict {
        if is_infected_favicon(file_name) {
            return ScanVerdict {
                matches: vec![Match::infected_icon()],
                is_favicon_anomaly: true,
            };
        }

        if !looks_like_text(content) {
            trace!("{} is not text, skipping content patterns", file_name);
            return ScanVerdict::default();
        }

        let text = bytes_to_text(content.to_vec());
        ScanVerdict {
            matches: self.scan_text(&text),
            is_favicon_anomaly: false,
        }
    }

    /// Derive the views of `text` with this engine's size limit.
    pub fn views(&self, text: &str) -> FileViews {
        FileViews::build(text, &self.deobfuscator, self.config.max_deobfuscate_bytes)
    }

    /// Run every active pattern class over the views of `text`.
    pub fn scan_text(&self, text: &str) -> Vec<Match> {
        let views = self.views(text);
        let mut found = MatchSet::new(text);

        for pattern in &self.catalog.exploits {
            for view in views.iter() {
                for m in pattern.regex.find_iter(view.text()) {
                    found.push(pattern.kind, &pattern.id, m.as_str());
                }
            }
        }

        for function in &self.catalog.functions {
            let base64_id = function.base64_id();
            for kind in [ViewKind::Stripped, ViewKind::Decoded] {
                let view = views.get(kind).text();
                for call in function.call_sites(view) {
                    found.push(PatternKind::Function, &function.name, call);
                }
                for literal in function.base64_literals(view) {
                    found.push(PatternKind::Function, &base64_id, literal);
                }
            }
        }

        let deobfuscated = views.get(ViewKind::Deobfuscated).text();
        for signature in &self.catalog.signatures {
            for m in signature.regex.find_iter(deobfuscated) {
                found.push(signature.kind, &signature.id, m.as_str());
            }
        }

        found.into_matches()
    }
}

/// Ordered, deduplicated matches of one file, with line recovery.
struct MatchSet {
    raw_lower: String,
    seen: HashSet<Match>,
    matches: Vec<Match>,
}

impl MatchSet {
    fn new(raw: &str) -> Self {
        Self {
            raw_lower: raw.to_ascii_lowercase(),
            seen: HashSet::new(),
            matches: Vec::new(),
        }
    }

    fn push(&mut self, kind: PatternKind, pattern_id: &str, matched_text: &str) {
        let m = Match {
            pattern_id: pattern_id.to_string(),
            line: line_of(&self.raw_lower, matched_text),
            matched_text: matched_text.to_string(),
        };
        if self.seen.insert(m.clone()) {
            trace!("{:?} {} matched at {:?}", kind, m.pattern_id, m.line);
            self.matches.push(m);
        }
    }

    fn into_matches(self) -> Vec<Match> {
        self.matches
    }
}

/// 1-indexed line of the first case-insensitive occurrence of `needle`.
///
/// `haystack_lower` must already be ASCII-lowercased.
fn line_of(haystack_lower: &str, needle: &str) -> Option<u32> {
    if needle.is_empty() {
        return None;
    }
    let offset = haystack_lower.find(&needle.to_ascii_lowercase())?;
    let newlines = haystack_lower.as_bytes()[..offset]
        .iter()
        .filter(|&&b| b == b'\n')
        .count();
    u32::try_from(newlines + 1).ok()
}

/// 1-indexed line of `needle` inside `raw`, case-insensitive.
pub fn recover_line(raw: &str, needle: &str) -> Option<u32> {
    line_of(&raw.to_ascii_lowercase(), needle)
}

/// `favicon_<random>.ico` or a hidden `.<name>.ico` file.
pub fn is_infected_favicon(file_name: &str) -> bool {
    let has_ico_ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext == "ico")
        .unwrap_or(false);

    (file_name.starts_with("favicon_") && has_ico_ext && file_name.len() > 12)
        || HIDDEN_ICON.is_match(file_name.trim())
}

/// Cheap stand-in for MIME sniffing: no NUL bytes and mostly printable
/// within the first few kilobytes.
pub fn looks_like_text(content: &[u8]) -> bool {
    let head = &content[..content.len().min(TEXT_SNIFF_LEN)];
    if head.contains(&0) {
        return false;
    }

    let control = head
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
        .count();
    control * 10 <= head.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScanMode;

    fn engine() -> DetectionEngine {
        DetectionEngine::new(ScanConfig::default())
    }

    fn ids(matches: &[Match]) -> Vec<&str> {
        matches.iter().map(|m| m.pattern_id.as_str()).collect()
    }

    #[test]
    fn test_eval_base64_detected_on_line_one() {
        let code = "<?php eval(base64_decode('ZWNobyAxOw==')); ?>";
        let engine = engine();

        let views = engine.views(code);
        assert!(views.get(ViewKind::Decoded).text().contains("echo 1;"));

        let verdict = engine.scan("index.php", code.as_bytes());
        let hit = verdict
            .matches
            .iter()
            .find(|m| m.pattern_id == "eval_base64")
            .expect("eval_base64 match");
        assert_eq!(hit.line, Some(1));
        assert!(!verdict.is_favicon_anomaly);
    }

    #[test]
    fn test_concat_normalized_in_deobfuscated_view() {
        let code = r#"<?php $a='ev'.'al'.'("ls")'; ?>"#;
        let views = engine().views(code);
        assert!(views
            .get(ViewKind::Deobfuscated)
            .text()
            .contains(r#"$a='eval("ls")'"#));
    }

    #[test]
    fn test_favicon_reports_single_sentinel() {
        let verdict = engine().scan("favicon_x7f2.ico", b"<?php eval($_POST['x']); hacked ?>");
        assert!(verdict.is_favicon_anomaly);
        assert_eq!(verdict.matches, vec![Match::infected_icon()]);
    }

    #[test]
    fn test_benign_file_is_clean() {
        let code = "<?php\n// Render the greeting\n$name = 'World';\necho 'Hello ' . $name;\n?>\n";
        let verdict = engine().scan("hello.php", code.as_bytes());
        assert!(verdict.is_clean(), "unexpected: {:?}", verdict.matches);
    }

    #[test]
    fn test_line_recovery() {
        let code = "<?php\n$x = 1;\n\n// HACKED by someone\n?>";
        let verdict = engine().scan("a.php", code.as_bytes());
        let hit = verdict
            .matches
            .iter()
            .find(|m| m.pattern_id == "hacked_by")
            .expect("hacked_by match");
        assert_eq!(hit.line, Some(4));
        assert_eq!(recover_line(code, "hacked"), Some(4));
        assert_eq!(recover_line(code, "absent"), None);
    }

    #[test]
    fn test_function_call_site_match() {
        let code = "<?php\n$out = shell_exec($_GET['cmd']);\n?>";
        let verdict = engine().scan("a.php", code.as_bytes());
        let hit = verdict
            .matches
            .iter()
            .find(|m| m.pattern_id == "shell_exec")
            .expect("shell_exec match");
        assert_eq!(hit.matched_text, "shell_exec($_GET['cmd'])");
        assert_eq!(hit.line, Some(2));
        // `exec` must not fire inside `shell_exec`
        assert!(!ids(&verdict.matches).contains(&"exec"));
    }

    #[test]
    fn test_base64_function_name() {
        let code = "<?php $f = base64_decode('c3lzdGVt'); $f('id'); ?>";
        let verdict = engine().scan("a.php", code.as_bytes());
        assert!(ids(&verdict.matches).contains(&"system_base64"));
    }

    #[test]
    fn test_decoded_payload_detected() {
        // base64 of "system($_GET['c']);"
        let code = "<?php $x = base64_decode('c3lzdGVtKCRfR0VUWydjJ10pOw=='); ?>";
        let verdict = engine().scan("a.php", code.as_bytes());
        let hit = verdict
            .matches
            .iter()
            .find(|m| m.pattern_id == "system")
            .expect("system match");
        assert_eq!(hit.matched_text, "system($_GET['c'])");
        assert_eq!(hit.line, None);
    }

    #[test]
    fn test_signature_runs_on_deobfuscated_view() {
        let code = "<?php /* IndoXploit */ ?>";
        let config = ScanConfig {
            mode: ScanMode::OnlySignatures,
            ..Default::default()
        };
        let verdict = DetectionEngine::new(config).scan("a.php", code.as_bytes());
        assert_eq!(ids(&verdict.matches), vec!["indoxploit"]);
        assert_eq!(verdict.matches[0].line, Some(1));
    }

    #[test]
    fn test_mode_only_exploits() {
        let code = "<?php system('id'); // hacked ?>";
        let config = ScanConfig {
            mode: ScanMode::OnlyExploits,
            ..Default::default()
        };
        let verdict = DetectionEngine::new(config).scan("a.php", code.as_bytes());
        assert_eq!(ids(&verdict.matches), vec!["hacked_by"]);
    }

    #[test]
    fn test_matches_are_deduplicated() {
        let code = "<?php echo 'hacked'; ?>";
        let verdict = engine().scan("a.php", code.as_bytes());
        let hacked: Vec<&Match> = verdict
            .matches
            .iter()
            .filter(|m| m.pattern_id == "hacked_by")
            .collect();
        assert_eq!(hacked.len(), 1);
    }

    #[test]
    fn test_binary_content_skipped() {
        let verdict = engine().scan("a.php", b"\x00\x01eval(base64_decode('x'))");
        assert!(verdict.is_clean());
    }

    #[test]
    fn test_is_infected_favicon() {
        assert!(is_infected_favicon("favicon_x7f2.ico"));
        assert!(is_infected_favicon(".a1b2c3.ico"));
        assert!(!is_infected_favicon("favicon.ico"));
        assert!(!is_infected_favicon("favicon_.ico"));
        assert!(!is_infected_favicon("favicon_abcdef.png"));
    }

    #[test]
    fn test_looks_like_text() {
        assert!(looks_like_text(b"<?php echo 1; ?>\n"));
        assert!(looks_like_text(b""));
        assert!(!looks_like_text(b"GIF89a\x00\x00"));
        assert!(!looks_like_text(&[0x01; 64]));
    }
}
