//! Pattern tables and their compiled form.
//!
//! Exploit patterns run on every view, function patterns on the stripped and
//! decoded views, signatures on the deobfuscated view only.

use crate::deobfuscate::chain::find_closing_paren;
use crate::types::{PatternKind, ScanConfig};
use base64::{engine::general_purpose::STANDARD, Engine};
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Longest argument list scanned when closing a function call-site match.
const MAX_CALL_ARGS: usize = 8 * 1024;

/// Known exploit constructs, keyed by stable id.
pub const EXPLOITS: &[(&str, &str)] = &[
    ("dollar_eval", r"(?i)\$eval"),
    (
        "eval_chr",
        r"(?i)chr\s*\(\s*101\s*\)\s*\.\s*chr\s*\(\s*118\s*\)\s*\.\s*chr\s*\(\s*97\s*\)\s*\.\s*chr\s*\(\s*108\s*\)",
    ),
    ("eval_base64", r"(?i)eval\s*\(\s*base64_decode\s*\("),
    ("align", r"(?i)(?:\$\w+=[^;]*)*;\$\w+=@?\$\w+\("),
    ("b374k", r#"(?i)'ev'\.'al'\.'\("\?>"#),
    ("weevely3", r"(?i)\$\w=\$[a-zA-Z]\('',\$\w\);\$\w\(\);"),
    ("c99_launcher", r"(?i);\$\w+\(\$\w+(?:,\s?\$\w+)+\);"),
    ("too_many_chr", r"(?i)(?:chr\(\d+\)\.){8}"),
    ("concat", r#"(?i)(?:\$[\w\[\]'"]+\.[\n\r]*){10}"#),
    ("concat_vars_array", r"(?i)(?:\$[a-zA-Z0-9]+\{[0-9]+\}\s*\.\s*){5}"),
    ("var_as_func", r"(?i)\$_(?:GET|POST|COOKIE|REQUEST|SERVER)\s*\[[^\]]+\]\s*\("),
    ("global_var_string", r#"(?i)\$\{\s*"_(?:GET|POST|COOKIE|REQUEST|SERVER)"\s*\}"#),
    ("extract_global", r"(?i)extract\(\s*\$_(?:GET|POST|COOKIE|REQUEST|SERVER)"),
    ("escaped_path", r"(?i)(?:\\x[0-9a-f]{2}[a-z0-9.\-/]{1,4}){4,}"),
    (
        "include_icon",
        r#"(?mi)include\(?\s*["'][^"'\n]*?(?:\.|\\056|\\046|\\2E)(?:i|\\151|\\x69|\\105)(?:c|\\143|\\099|\\x63)(?:o|\\157|\\111|\\x6f)["']\)?"#,
    ),
    ("backdoor_code", r"(?i)eva1fYlbakBcVSir"),
    ("infected_comment", r"(?i)/\*[a-z0-9]{5}\*/"),
    ("hex_char", r"(?i)\\x5f"),
    ("hacked_by", r"(?i)hacked"),
    ("killall", r"(?i)killall\s*-9"),
    (
        "download_remote_code",
        r"(?i)echo\s+file_get_contents\s*\(\s*base64_url_decode\s*\(\s*@*\$_(?:GET|POST|SERVER|COOKIE|REQUEST)",
    ),
    ("globals_concat", r"(?i)\$GLOBALS\[\s*\$GLOBALS\['[a-z0-9]{4,}'\]"),
    (
        "globals_assign",
        r"(?i)\$GLOBALS\['[a-z0-9]{5,}'\]\s*=\s*\$[a-z]+\d+\[\d+\]\.\$[a-z]+\d+\[\d+\]\.\$[a-z]+\d+\[\d+\]\.\$[a-z]+\d+\[\d+\]\.",
    ),
    ("clever_include", r"(?i)include\s*\(\s*[^.]+\.(?:png|jpe?g|gif|bmp)"),
    ("basedir_bypass", r#"(?i)curl_init\s*\(\s*["']file://"#),
    ("basedir_bypass2", r"(?i)file:file:///"),
    (
        "non_printable",
        r"(?i)(?:function|return|base64_decode).{0,256}?[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]{3}",
    ),
    ("double_var", r"(?i)\$\{\s*\$\{"),
    ("double_var2", r"\$\{\$[0-9a-zA-Z_]+\}"),
    ("global_save", r"(?i)=\s*\$GLOBALS\s*;\s*\$\s*\{"),
    ("hex_var", r#"(?i)\$\{\s*"\\x"#),
    (
        "register_function",
        r#"(?i)register_[a-z]+_function\s*\(\s*['"]\s*(?:eval|assert|passthru|exec|include|system|shell_exec|`)"#,
    ),
    ("safemode_bypass", r"(?i)\x00/\.\./|LD_PRELOAD"),
    ("ioncube_loader", r"(?i)IonCube_loader"),
];

/// Functions searched when no list is configured.
pub const DEFAULT_FUNCTIONS: &[&str] = &[
    "il_exec",
    "shell_exec",
    "eval",
    "system",
    "create_function",
    "exec",
    "assert",
    "syslog",
    "passthru",
    "define_syslog_variables",
    "posix_kill",
    "posix_uname",
    "proc_close",
    "proc_get_status",
    "proc_nice",
    "proc_open",
    "proc_terminate",
    "inject_code",
    "apache_child_terminate",
    "apache_note",
];

/// Extended list, including the decoders obfuscated code relies on.
pub const DANGEROUS_FUNCTIONS: &[&str] = &[
    "il_exec",
    "shell_exec",
    "eval",
    "system",
    "create_function",
    "exec",
    "assert",
    "syslog",
    "passthru",
    "define_syslog_variables",
    "debugger_off",
    "debugger_on",
    "parse_ini_file",
    "show_source",
    "symlink",
    "popen",
    "posix_kill",
    "posix_getpwuid",
    "posix_mkfifo",
    "posix_setpgid",
    "posix_setsid",
    "posix_setuid",
    "posix_uname",
    "proc_close",
    "proc_get_status",
    "proc_nice",
    "proc_open",
    "proc_terminate",
    "ini_alter",
    "ini_get_all",
    "ini_restore",
    "inject_code",
    "apache_child_terminate",
    "apache_setenv",
    "apache_note",
    "escapeshellarg",
    "escapeshellcmd",
    "base64_decode",
    "urldecode",
    "rawurldecode",
    "str_rot13",
    "preg_replace",
];

/// Malware family fingerprints. Compiled with `(?smi)`.
pub const SIGNATURES: &[(&str, &str)] = &[
    ("wso_shell", r#"Web Shell by oRb|WSO\s+\d+\.\d+|\$default_action\s*=\s*['"]FilesMan['"]"#),
    ("filesman", r#"['"]FilesMan['"].{0,200}?\$_POST\s*\[\s*['"]a['"]\s*\]"#),
    ("c99_shell", r"c99sh_(?:surl|getsource|sess_put|buff_prepare)|c99shell"),
    ("r57_shell", r"r57shell|r57\.gen\.tr"),
    ("b374k_shell", r"b374k\s+(?:shell|\d)|\$s_pass\s*=\s*['\x22][0-9a-f]{32}"),
    ("weevely", r#"\$kh\s*=\s*["'][0-9a-f]{8}["'];\s*\$kf\s*=\s*["'][0-9a-f]{8}["']"#),
    (
        "china_chopper",
        r#"@?eval\s*\(\s*\$_(?:POST|REQUEST|GET)\s*\[\s*['"][^'"]{1,32}['"]\s*\]\s*\)"#,
    ),
    ("indoxploit", r"IndoXploit"),
    ("alfa_shell", r"ALFA_DATA|~\s*ALFA\s+TEaM|AlfaShell|solevisible"),
    ("phpspy", r"phpspy|Code\s+By\s+Angel"),
    ("ani_shell", r"Ani-Shell"),
    ("mini_shell", r"Mini\s*Shell\s*\d|\bminishell\b"),
    ("anonymousfox", r"AnonymousFox"),
    ("marijuana_shell", r"<title>\s*MARIJUANA"),
    ("leaf_mailer", r"Leaf\s*PHPMailer|leafmailer"),
    (
        "request_exec",
        r"\b(?:system|passthru|shell_exec|exec|popen|proc_open)\s*\(\s*\$_(?:GET|POST|REQUEST|COOKIE)\s*\[",
    ),
    ("request_assert", r"\bassert\s*\(\s*\$_(?:GET|POST|REQUEST|COOKIE)"),
    (
        "request_create_function",
        r"\bcreate_function\s*\([^)]*\$_(?:GET|POST|REQUEST|COOKIE)",
    ),
    ("request_base64", r"\bbase64_decode\s*\(\s*\$_(?:GET|POST|REQUEST|COOKIE)"),
    (
        "preg_replace_eval",
        r#"preg_replace\s*\(\s*['"]/[^'"]*/[a-z]*e[a-z]*['"]\s*,"#,
    ),
    (
        "anonymous_uploader",
        r#"move_uploaded_file\s*\(\s*\$_FILES\s*\[[^\]]+\]\s*\[\s*['"]tmp_name['"]\s*\]\s*,\s*\$_FILES\s*\[[^\]]+\]\s*\[\s*['"]name['"]\s*\]"#,
    ),
    ("gif_header_php", r"\AGIF8[79]a.{0,64}?<\?php"),
    (
        "htaccess_php_handler",
        r"AddType\s+application/x-httpd-php\s+\.(?:jpe?g|png|gif|ico|txt)\b",
    ),
];

/// Named function lists accepted by `--functions`.
pub fn function_list(name: &str) -> Option<&'static [&'static str]> {
    match name.trim().to_ascii_lowercase().as_str() {
        "default" => Some(DEFAULT_FUNCTIONS),
        "dangerous" => Some(DANGEROUS_FUNCTIONS),
        _ => None,
    }
}

/// Ids of every exploit in the catalog.
pub fn exploit_ids() -> impl Iterator<Item = &'static str> {
    EXPLOITS.iter().map(|(id, _)| *id)
}

/// A compiled exploit or signature.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub id: String,
    pub kind: PatternKind,
    pub regex: Regex,
}

/// Call-site and base64-literal patterns derived from one function name.
#[derive(Debug, Clone)]
pub struct FunctionPattern {
    pub name: String,
    call_site: Regex,
    base64: Option<Regex>,
}

impl FunctionPattern {
    /// Build both patterns for `name`. Only the call-site pattern is required.
    pub fn new(name: &str) -> Result<Self, regex::Error> {
        let escaped = regex::escape(name);
        let call_site = Regex::new(&format!(r"(?si)(?:^|[^a-zA-Z0-9_>])({}\s*\()", escaped))?;

        let encoded = STANDARD.encode(name);
        let encoded = encoded.trim_end_matches('=');
        let base64 = if encoded.is_empty() {
            None
        } else {
            Regex::new(&regex::escape(encoded)).ok()
        };

        Ok(Self {
            name: name.to_string(),
            call_site,
            base64,
        })
    }

    /// Id reported for base64-literal hits.
    pub fn base64_id(&self) -> String {
        format!("{}_base64", self.name)
    }

    /// Every call of the function in `text`, from the name to the closing
    /// parenthesis of its argument list.
    pub fn call_sites<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.call_site
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|head| {
                let open = head.end() - 1;
                let close = find_closing_paren(text, open, MAX_CALL_ARGS)
                    .or_else(|| text[open..].find(')').map(|rel| open + rel));
                match close {
                    Some(close) => &text[head.start()..=close],
                    None => head.as_str(),
                }
            })
            .collect()
    }

    /// Every base64-encoded occurrence of the function name in `text`.
    pub fn base64_literals<'t>(&self, text: &'t str) -> Vec<&'t str> {
        match &self.base64 {
            Some(re) => re.find_iter(text).map(|m| m.as_str()).collect(),
            None => Vec::new(),
        }
    }
}

/// The patterns active for one scan configuration, compiled once.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    pub exploits: Vec<CompiledPattern>,
    pub functions: Vec<FunctionPattern>,
    pub signatures: Vec<CompiledPattern>,
}

impl PatternCatalog {
    /// Compile the pattern classes enabled by `config`.
    ///
    /// A pattern that fails to compile is logged and left out.
    pub fn new(config: &ScanConfig) -> Self {
        let mut catalog = Self::default();

        if config.mode.runs_exploits() {
            catalog.exploits = EXPLOITS
                .iter()
                .filter(|(id, _)| match &config.exploits {
                    Some(selected) => selected.iter().any(|s| s == id),
                    None => true,
                })
                .filter_map(|(id, pattern)| compile(id, PatternKind::Exploit, pattern))
                .collect();
        }

        if config.mode.runs_functions() {
            let mut seen = HashSet::new();
            catalog.functions = config
                .functions
                .iter()
                .map(|f| f.trim())
                .filter(|f| !f.is_empty() && seen.insert(f.to_string()))
                .filter_map(|name| match FunctionPattern::new(name) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!("Skipping function pattern {}: {}", name, e);
                        None
                    }
                })
                .collect();
        }

        if config.mode.runs_signatures() {
            catalog.signatures = SIGNATURES
                .iter()
                .filter_map(|(id, pattern)| {
                    compile(id, PatternKind::Signature, &format!("(?smi){}", pattern))
                })
                .collect();
        }

        debug!(
            "Pattern catalog: {} exploits, {} functions, {} signatures",
            catalog.exploits.len(),
            catalog.functions.len(),
            catalog.signatures.len()
        );

        catalog
    }

    pub fn is_empty(&self) -> bool {
        self.exploits.is_empty() && self.functions.is_empty() && self.signatures.is_empty()
    }
}

fn compile(id: &str, kind: PatternKind, pattern: &str) -> Option<CompiledPattern> {
    match Regex::new(pattern) {
        Ok(regex) => Some(CompiledPattern {
            id: id.to_string(),
            kind,
            regex,
        }),
        Err(e) => {
            warn!("Skipping {:?} pattern {}: {}", kind, id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScanMode;

    #[test]
    fn test_all_patterns_compile() {
        for (id, pattern) in EXPLOITS {
            assert!(Regex::new(pattern).is_ok(), "exploit {} failed", id);
        }
        for (id, pattern) in SIGNATURES {
            assert!(
                Regex::new(&format!("(?smi){}", pattern)).is_ok(),
                "signature {} failed",
                id
            );
        }
    }

    #[test]
    fn test_catalog_respects_mode() {
        let config = ScanConfig {
            mode: ScanMode::OnlyFunctions,
            ..Default::default()
        };
        let catalog = PatternCatalog::new(&config);
        assert!(catalog.exploits.is_empty());
        assert!(catalog.signatures.is_empty());
        assert_eq!(catalog.functions.len(), DEFAULT_FUNCTIONS.len());
    }

    #[test]
    fn test_catalog_exploit_subset() {
        let config = ScanConfig {
            exploits: Some(vec!["eval_base64".to_string(), "hacked_by".to_string()]),
            ..Default::default()
        };
        let catalog = PatternCatalog::new(&config);
        let ids: Vec<&str> = catalog.exploits.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["eval_base64", "hacked_by"]);
        assert!(catalog.exploits.iter().all(|p| p.kind == PatternKind::Exploit));
        assert!(catalog.signatures.iter().all(|p| p.kind == PatternKind::Signature));
        assert!(!catalog.is_empty());
    }

    #[test]
    fn test_empty_exploit_selection_leaves_catalog_empty() {
        let config = ScanConfig {
            mode: ScanMode::OnlyExploits,
            exploits: Some(Vec::new()),
            ..Default::default()
        };
        assert!(PatternCatalog::new(&config).is_empty());
    }

    #[test]
    fn test_duplicate_functions_collapse() {
        let config = ScanConfig {
            functions: vec!["eval".into(), " eval ".into(), "system".into()],
            ..Default::default()
        };
        assert_eq!(PatternCatalog::new(&config).functions.len(), 2);
    }

    #[test]
    fn test_call_site_boundary() {
        let eval = FunctionPattern::new("eval").unwrap();
        assert_eq!(eval.call_sites(" eval(1+1)"), vec!["eval(1+1)"]);
        assert_eq!(eval.call_sites(";eval('x')"), vec!["eval('x')"]);
        assert!(eval.call_sites("myeval(1)").is_empty());
        assert!(eval.call_sites("$obj->eval(1)").is_empty());
    }

    #[test]
    fn test_call_site_balanced_arguments() {
        let system = FunctionPattern::new("system").unwrap();
        let text = "<?php system(trim($_GET['c']), $r); ?>";
        assert_eq!(system.call_sites(text), vec!["system(trim($_GET['c']), $r)"]);
    }

    #[test]
    fn test_base64_literal() {
        let system = FunctionPattern::new("system").unwrap();
        assert_eq!(system.base64_id(), "system_base64");
        assert_eq!(
            system.base64_literals("$f = base64_decode('c3lzdGVt');"),
            vec!["c3lzdGVt"]
        );
        // Padding is not required to be present
        let eval = FunctionPattern::new("eval").unwrap();
        assert_eq!(eval.base64_literals("'ZXZhbA'"), vec!["ZXZhbA"]);
    }

    #[test]
    fn test_function_lists() {
        assert_eq!(function_list("Default"), Some(DEFAULT_FUNCTIONS));
        assert_eq!(function_list("dangerous"), Some(DANGEROUS_FUNCTIONS));
        assert!(function_list("eval,system").is_none());
        assert!(exploit_ids().any(|id| id == "eval_base64"));
    }
}
