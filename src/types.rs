//! Core types and errors for the malware scanner.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors that can occur while configuring or running a scan.
#[derive(Error, Debug)]
pub enum AmwscanError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Pattern compile error: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Whitelist error: {0}")]
    WhitelistError(String),
}

pub type Result<T> = std::result::Result<T, AmwscanError>;

/// Recoverable failures inside the deobfuscation core.
///
/// None of these ever abort a scan: callers fall back to the text they
/// already had.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 input")]
    InvalidBase64,

    #[error("invalid deflate/zlib stream")]
    InvalidDeflate,

    #[error("invalid uuencoded input")]
    InvalidUuencode,

    #[error("decoded output exceeds {0} bytes")]
    OutputTooLarge(usize),

    #[error("decode produced no output")]
    Empty,

    #[error("expected construct not found: {0}")]
    PatternMiss(&'static str),

    #[error("recursion limit reached")]
    RecursionLimit,
}

/// The textual surfaces a file is matched on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// File content as read from disk.
    Raw,
    /// Comments removed and whitespace collapsed.
    Stripped,
    /// Known obfuscation families reversed.
    Deobfuscated,
    /// Deobfuscated view with decode chains and literal escapes unwound.
    Decoded,
}

/// One immutable view of a file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentView {
    kind: ViewKind,
    text: String,
}

impl ContentView {
    pub fn new(kind: ViewKind, text: String) -> Self {
        Self { kind, text }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Pattern class a match was produced by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// Known exploit construct.
    Exploit,
    /// Call to a dangerous function (or its base64-encoded name).
    Function,
    /// Malware family fingerprint, matched after deobfuscation.
    Signature,
}

/// A single finding inside a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Match {
    /// Stable identifier of the pattern (exploit key, function name, signature key).
    pub pattern_id: String,
    /// 1-indexed line in the raw file content, when the text could be located there.
    pub line: Option<u32>,
    /// Text of the match as seen on the view that produced it.
    pub matched_text: String,
}

impl Match {
    /// Sentinel id reported for favicon-impersonation filenames.
    pub const INFECTED_ICON: &'static str = "infected_icon";

    /// The sentinel match for a favicon anomaly. Carries no line and no text.
    pub fn infected_icon() -> Self {
        Self {
            pattern_id: Self::INFECTED_ICON.to_string(),
            line: None,
            matched_text: String::new(),
        }
    }

    /// Human readable one-line description used by the console output.
    pub fn description(&self) -> String {
        match self.line {
            Some(line) => format!("{} [line {}]", self.pattern_id, line),
            None => self.pattern_id.clone(),
        }
    }
}

/// Detection result for one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanVerdict {
    /// Deduplicated matches in discovery order.
    pub matches: Vec<Match>,
    /// Whether the filename itself is a favicon masquerade.
    pub is_favicon_anomaly: bool,
}

impl ScanVerdict {
    pub fn is_clean(&self) -> bool {
        self.matches.is_empty()
    }
}

/// A previously accepted finding.
///
/// The JSON shape is `{"file", "exploit", "match", "line"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhitelistEntry {
    /// Stored path; matched as a substring of the scanned file path.
    pub file: String,
    #[serde(rename = "exploit")]
    pub pattern_id: String,
    #[serde(rename = "match", default)]
    pub matched_text: String,
    #[serde(default, deserialize_with = "deserialize_line")]
    pub line: Option<u32>,
}

impl WhitelistEntry {
    /// Build an entry accepting `m` for the file at `file`.
    pub fn from_match(file: &str, m: &Match) -> Self {
        Self {
            file: file.to_string(),
            pattern_id: m.pattern_id.clone(),
            matched_text: m.matched_text.clone(),
            line: m.line,
        }
    }
}

/// Accept `12`, `"12"`, `""` and `null` for a whitelist line number.
fn deserialize_line<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawLine {
        Number(u32),
        Text(String),
    }

    match Option::<RawLine>::deserialize(deserializer)? {
        Some(RawLine::Number(n)) => Ok(Some(n)),
        Some(RawLine::Text(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                trimmed.parse().map(Some).map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}

/// Which pattern classes run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanMode {
    /// Exploits, functions and signatures.
    #[default]
    All,
    OnlyExploits,
    OnlyFunctions,
    OnlySignatures,
}

impl ScanMode {
    pub fn runs_exploits(self) -> bool {
        matches!(self, ScanMode::All | ScanMode::OnlyExploits)
    }

    pub fn runs_functions(self) -> bool {
        matches!(self, ScanMode::All | ScanMode::OnlyFunctions)
    }

    pub fn runs_signatures(self) -> bool {
        matches!(self, ScanMode::All | ScanMode::OnlySignatures)
    }
}

/// Immutable engine configuration, built once and shared by every file scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub mode: ScanMode,
    /// Exploit ids to run; `None` runs the whole catalog.
    pub exploits: Option<Vec<String>>,
    /// Function names searched as call sites and base64 literals.
    pub functions: Vec<String>,
    /// Files larger than this are matched on raw and stripped views only.
    pub max_deobfuscate_bytes: usize,
    /// Ignore line numbers when comparing against the whitelist.
    pub whitelist_only_path: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::All,
            exploits: None,
            functions: crate::detection::catalog::DEFAULT_FUNCTIONS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            max_deobfuscate_bytes: 2 * 1024 * 1024,
            whitelist_only_path: false,
        }
    }
}

/// Scan outcome for one reported file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub path: String,
    /// SHA-256 of the file content.
    pub sha256: String,
    pub matches: Vec<Match>,
    pub is_favicon_anomaly: bool,
}

/// Aggregate result of a scan run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Root path that was scanned.
    pub target: String,
    /// Number of files whose content was examined.
    pub scanned: usize,
    /// Files reported as probable malware.
    pub files: Vec<FileReport>,
    /// Files whose findings were all covered by the whitelist.
    pub whitelisted: Vec<String>,
    /// Scan duration in seconds.
    pub duration_secs: f64,
    /// Files that could not be read.
    pub errors: Vec<String>,
}

impl ScanReport {
    pub fn detected(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_entry_json_shape() {
        let json = r#"[
            {"file": "/var/www/a.php", "exploit": "eval", "match": "eval($x)", "line": 3},
            {"file": "/var/www/b.php", "exploit": "hacked_by", "match": "hacked", "line": "7"},
            {"file": "/var/www/favicon_abc123.ico", "exploit": "infected_icon", "match": "", "line": ""},
            {"file": "/var/www/c.php", "exploit": "align", "match": ";$a=$b(", "line": null}
        ]"#;
        let entries: Vec<WhitelistEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].line, Some(3));
        assert_eq!(entries[0].pattern_id, "eval");
        assert_eq!(entries[1].line, Some(7));
        assert_eq!(entries[2].line, None);
        assert_eq!(entries[3].line, None);
    }

    #[test]
    fn test_whitelist_entry_serializes_original_keys() {
        let entry = WhitelistEntry {
            file: "a.php".to_string(),
            pattern_id: "eval".to_string(),
            matched_text: "eval(1)".to_string(),
            line: Some(2),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["exploit"], "eval");
        assert_eq!(json["match"], "eval(1)");
        assert_eq!(json["line"], 2);
    }

    #[test]
    fn test_scan_mode_classes() {
        assert!(ScanMode::All.runs_exploits());
        assert!(ScanMode::All.runs_functions());
        assert!(ScanMode::All.runs_signatures());
        assert!(!ScanMode::OnlyExploits.runs_functions());
        assert!(!ScanMode::OnlyFunctions.runs_signatures());
        assert!(!ScanMode::OnlySignatures.runs_exploits());
    }

    #[test]
    fn test_match_description() {
        let m = Match {
            pattern_id: "eval_base64".to_string(),
            line: Some(4),
            matched_text: "eval(base64_decode(".to_string(),
        };
        assert_eq!(m.description(), "eval_base64 [line 4]");
        assert_eq!(Match::infected_icon().description(), "infected_icon");
    }
}
